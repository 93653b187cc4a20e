use crate::h2::consts::*;
use crate::types::{FrameH2, FrameTypeH2, H2ErrorCode, ProtocolError};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

// HTTP/2 Frame Format (RFC 7540 Section 4.1):
//  0                   1                   2                   3
//  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |                 Length (24)                   |
// +---------------+---------------+---------------+
// |   Type (8)    |   Flags (8)   |
// +-+-+-----------+---------------+-------------------------------+
// |R|                 Stream Identifier (31)                      |
// +=+=============================================================+
// |                   Frame Payload (0...)                      ...
// +---------------------------------------------------------------+

impl FrameTypeH2 {
    pub fn from_u8(value: u8) -> Self {
        match value {
            DATA_FRAME_TYPE => FrameTypeH2::Data,
            HEADERS_FRAME_TYPE => FrameTypeH2::Headers,
            PRIORITY_FRAME_TYPE => FrameTypeH2::Priority,
            RST_STREAM_FRAME_TYPE => FrameTypeH2::RstStream,
            SETTINGS_FRAME_TYPE => FrameTypeH2::Settings,
            PUSH_PROMISE_FRAME_TYPE => FrameTypeH2::PushPromise,
            PING_FRAME_TYPE => FrameTypeH2::Ping,
            GOAWAY_FRAME_TYPE => FrameTypeH2::GoAway,
            WINDOW_UPDATE_FRAME_TYPE => FrameTypeH2::WindowUpdate,
            CONTINUATION_FRAME_TYPE => FrameTypeH2::Continuation,
            other => FrameTypeH2::Unknown(other),
        }
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            FrameTypeH2::Data => DATA_FRAME_TYPE,
            FrameTypeH2::Headers => HEADERS_FRAME_TYPE,
            FrameTypeH2::Priority => PRIORITY_FRAME_TYPE,
            FrameTypeH2::RstStream => RST_STREAM_FRAME_TYPE,
            FrameTypeH2::Settings => SETTINGS_FRAME_TYPE,
            FrameTypeH2::PushPromise => PUSH_PROMISE_FRAME_TYPE,
            FrameTypeH2::Ping => PING_FRAME_TYPE,
            FrameTypeH2::GoAway => GOAWAY_FRAME_TYPE,
            FrameTypeH2::WindowUpdate => WINDOW_UPDATE_FRAME_TYPE,
            FrameTypeH2::Continuation => CONTINUATION_FRAME_TYPE,
            FrameTypeH2::Unknown(value) => *value,
        }
    }
}

impl FrameH2 {
    pub fn new(frame_type: FrameTypeH2, flags: u8, stream_id: u32, payload: Bytes) -> Self {
        Self {
            frame_type,
            flags,
            stream_id,
            payload,
        }
    }

    pub fn data(stream_id: u32, data: Bytes, end_stream: bool) -> Self {
        let flags = if end_stream { END_STREAM_FLAG } else { 0 };
        Self::new(FrameTypeH2::Data, flags, stream_id, data)
    }

    pub fn settings(settings: &[(u16, u32)]) -> Self {
        let mut payload = BytesMut::with_capacity(settings.len() * 6);
        for &(id, value) in settings {
            payload.put_u16(id);
            payload.put_u32(value);
        }
        Self::new(FrameTypeH2::Settings, 0, 0, payload.freeze())
    }

    pub fn settings_ack() -> Self {
        Self::new(FrameTypeH2::Settings, ACK_FLAG, 0, Bytes::new())
    }

    pub fn window_update(stream_id: u32, increment: u32) -> Result<Self, ProtocolError> {
        let increment = increment & 0x7FFF_FFFF;
        if increment == 0 {
            return Err(ProtocolError::H2ProtocolError(
                "WINDOW_UPDATE increment must be greater than zero".to_string(),
            ));
        }
        let mut payload = BytesMut::with_capacity(4);
        payload.put_u32(increment);
        Ok(Self::new(
            FrameTypeH2::WindowUpdate,
            0,
            stream_id,
            payload.freeze(),
        ))
    }

    pub fn rst(stream_id: u32, error_code: H2ErrorCode) -> Self {
        let mut payload = BytesMut::with_capacity(4);
        payload.put_u32(error_code.into());
        Self::new(FrameTypeH2::RstStream, 0, stream_id, payload.freeze())
    }

    pub fn ping(data: [u8; 8]) -> Self {
        Self::new(FrameTypeH2::Ping, 0, 0, Bytes::copy_from_slice(&data))
    }

    pub fn ping_ack(data: [u8; 8]) -> Self {
        Self::new(FrameTypeH2::Ping, ACK_FLAG, 0, Bytes::copy_from_slice(&data))
    }

    pub fn goaway(last_stream_id: u32, error_code: H2ErrorCode, debug_data: Option<&[u8]>) -> Self {
        let mut payload = BytesMut::with_capacity(8 + debug_data.map(|d| d.len()).unwrap_or(0));

        payload.put_u32(last_stream_id & 0x7FFF_FFFF);
        payload.put_u32(error_code.into());

        if let Some(debug) = debug_data {
            payload.put_slice(debug);
        }

        Self::new(FrameTypeH2::GoAway, 0, 0, payload.freeze())
    }

    pub fn is_end_stream(&self) -> bool {
        (self.flags & END_STREAM_FLAG) != 0
    }

    pub fn is_end_headers(&self) -> bool {
        (self.flags & END_HEADERS_FLAG) != 0
    }

    pub fn is_ack(&self) -> bool {
        (self.flags & ACK_FLAG) != 0
    }

    pub fn is_padded(&self) -> bool {
        (self.flags & PADDED_FLAG) != 0
    }

    pub fn has_priority(&self) -> bool {
        (self.flags & PRIORITY_FLAG) != 0
    }

    /// Number of bytes this frame charges against flow control. For DATA this
    /// is the whole payload, padding included (RFC 7540 Section 6.9.1).
    pub fn flow_controlled_len(&self) -> u32 {
        match self.frame_type {
            FrameTypeH2::Data => self.payload.len() as u32,
            _ => 0,
        }
    }

    /// DATA payload with padding removed.
    pub fn data_payload(&self) -> Result<Bytes, ProtocolError> {
        if !self.is_padded() {
            return Ok(self.payload.clone());
        }
        strip_padding(&self.payload, 0)
    }

    /// Header block fragment of a HEADERS frame, without padding and priority.
    pub fn header_fragment(&self) -> Result<Bytes, ProtocolError> {
        let priority_len = if self.has_priority() { 5 } else { 0 };
        if !self.is_padded() {
            if self.payload.len() < priority_len {
                return Err(ProtocolError::H2ProtocolError(
                    "PRIORITY flag set but insufficient payload".to_string(),
                ));
            }
            return Ok(self.payload.slice(priority_len..));
        }
        strip_padding(&self.payload, priority_len)
    }

    pub fn window_increment(&self) -> Result<u32, ProtocolError> {
        if self.payload.len() != 4 {
            return Err(ProtocolError::H2FrameSizeError(
                "Invalid WINDOW_UPDATE frame size".to_string(),
            ));
        }
        Ok(u32::from_be_bytes([
            self.payload[0],
            self.payload[1],
            self.payload[2],
            self.payload[3],
        ]) & 0x7FFF_FFFF)
    }

    pub fn error_code(&self) -> Result<H2ErrorCode, ProtocolError> {
        if self.payload.len() != 4 {
            return Err(ProtocolError::H2FrameSizeError(
                "RST_STREAM frame must have 4-byte payload".to_string(),
            ));
        }
        let code = u32::from_be_bytes([
            self.payload[0],
            self.payload[1],
            self.payload[2],
            self.payload[3],
        ]);
        Ok(H2ErrorCode::from(code))
    }

    /// Decodes a GOAWAY payload into (last stream id, error code, debug data).
    pub fn goaway_fields(&self) -> Result<(u32, H2ErrorCode, String), ProtocolError> {
        if self.payload.len() < 8 {
            return Err(ProtocolError::H2FrameSizeError(
                "Invalid GOAWAY frame size".to_string(),
            ));
        }
        let mut payload = self.payload.clone();
        let last_stream_id = payload.get_u32() & 0x7FFF_FFFF;
        let error_code = H2ErrorCode::from(payload.get_u32());
        let debug = String::from_utf8_lossy(&payload).to_string();
        Ok((last_stream_id, error_code, debug))
    }

    pub fn settings_entries(&self) -> Result<Vec<(u16, u32)>, ProtocolError> {
        if self.payload.len() % 6 != 0 {
            return Err(ProtocolError::H2FrameSizeError(
                "SETTINGS payload is not a multiple of 6".to_string(),
            ));
        }
        let mut payload = self.payload.clone();
        let mut entries = Vec::with_capacity(payload.len() / 6);
        while payload.has_remaining() {
            entries.push((payload.get_u16(), payload.get_u32()));
        }
        Ok(entries)
    }

    pub fn ping_data(&self) -> Result<[u8; 8], ProtocolError> {
        let data: [u8; 8] = self.payload.as_ref().try_into().map_err(|_| {
            ProtocolError::H2FrameSizeError("PING payload must be 8 bytes".to_string())
        })?;
        Ok(data)
    }

    pub fn serialize(&self) -> Result<Bytes, ProtocolError> {
        if self.payload.len() > MAX_FRAME_SIZE_UPPER_BOUND as usize {
            return Err(ProtocolError::H2FrameSizeError(format!(
                "Frame payload size {} exceeds maximum {}",
                self.payload.len(),
                MAX_FRAME_SIZE_UPPER_BOUND
            )));
        }

        let mut result = BytesMut::with_capacity(FRAME_HEADER_SIZE + self.payload.len());
        self.serialize_into(&mut result);
        Ok(result.freeze())
    }

    pub(crate) fn serialize_into(&self, out: &mut BytesMut) {
        let length = self.payload.len() as u32;
        // Length (24 bits)
        out.put_u8(((length >> 16) & 0xFF) as u8);
        out.put_u8(((length >> 8) & 0xFF) as u8);
        out.put_u8((length & 0xFF) as u8);
        out.put_u8(self.frame_type.as_u8());
        out.put_u8(self.flags);
        // Stream ID (31 bits, reserved bit clear)
        out.put_u32(self.stream_id & 0x7FFF_FFFF);
        out.put_slice(&self.payload);
    }

    pub fn parse(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() < FRAME_HEADER_SIZE {
            return Err(ProtocolError::InvalidResponse("Frame too short".to_string()));
        }
        let (length, frame_type, flags, stream_id) = parse_header(&data[..FRAME_HEADER_SIZE]);
        if data.len() < FRAME_HEADER_SIZE + length {
            return Err(ProtocolError::InvalidResponse(
                "Incomplete frame payload".to_string(),
            ));
        }

        let payload = Bytes::copy_from_slice(&data[FRAME_HEADER_SIZE..FRAME_HEADER_SIZE + length]);
        Ok(Self::new(frame_type, flags, stream_id, payload))
    }
}

fn parse_header(header: &[u8]) -> (usize, FrameTypeH2, u8, u32) {
    let length =
        ((header[0] as usize) << 16) | ((header[1] as usize) << 8) | (header[2] as usize);
    let frame_type = FrameTypeH2::from_u8(header[3]);
    let flags = header[4];
    let stream_id =
        u32::from_be_bytes([header[5], header[6], header[7], header[8]]) & 0x7FFF_FFFF;
    (length, frame_type, flags, stream_id)
}

fn strip_padding(payload: &Bytes, skip: usize) -> Result<Bytes, ProtocolError> {
    if payload.is_empty() {
        return Err(ProtocolError::H2ProtocolError(
            "PADDED flag set but no pad length available".to_string(),
        ));
    }
    let pad_length = payload[0] as usize;
    let start = 1 + skip;
    if start + pad_length > payload.len() {
        return Err(ProtocolError::H2ProtocolError(
            "Padding exceeds payload size".to_string(),
        ));
    }
    Ok(payload.slice(start..payload.len() - pad_length))
}

/// Reads whole frames off the read half of a connection.
pub struct FrameReader<R> {
    io: R,
    max_frame_size: u32,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(io: R, max_frame_size: u32) -> Self {
        Self { io, max_frame_size }
    }

    /// Consumes the client connection preface. Servers call this before the
    /// first `read_frame`.
    pub async fn read_preface(&mut self) -> Result<(), ProtocolError> {
        let mut preface = [0u8; CONNECTION_PREFACE.len()];
        self.io.read_exact(&mut preface).await?;
        if preface != CONNECTION_PREFACE {
            return Err(ProtocolError::H2ProtocolError(
                "Invalid HTTP/2 connection preface".to_string(),
            ));
        }
        Ok(())
    }

    /// Returns `Ok(None)` on a clean end of stream between frames.
    pub async fn read_frame(&mut self) -> Result<Option<FrameH2>, ProtocolError> {
        let mut header = [0u8; FRAME_HEADER_SIZE];
        match self.io.read_exact(&mut header).await {
            Ok(_) => {}
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(err) => return Err(err.into()),
        }

        let (length, frame_type, flags, stream_id) = parse_header(&header);
        if length > self.max_frame_size as usize {
            return Err(ProtocolError::H2FrameSizeError(format!(
                "Frame of {} bytes exceeds SETTINGS_MAX_FRAME_SIZE {}",
                length, self.max_frame_size
            )));
        }

        let mut payload = BytesMut::zeroed(length);
        if length > 0 {
            self.io.read_exact(&mut payload).await?;
        }

        Ok(Some(FrameH2::new(
            frame_type,
            flags,
            stream_id,
            payload.freeze(),
        )))
    }
}
