//! Machinery shared by both ends of an HTTP/2 connection.
//!
//! A connection is split into a frame reader (driven by [`drive`]) and a
//! single writer task that owns the write half and the HPACK encoder. Every
//! other task talks to the writer through [`ConnectionCore`], which also holds
//! the connection's receive [`WindowManager`] and send [`SendFlow`].

pub mod state;

use crate::h2::consts::*;
use crate::h2::flow_control::{DataDisposition, Released, WindowManager, WindowUpdate};
use crate::h2::framing::FrameReader;
use crate::h2::hpack::{HeaderDecoder, HeaderEncoder};
use crate::h2::send_flow::SendFlow;
use crate::types::{
    ConnectionConfig, FrameH2, FrameTypeH2, H2ConnectionErrorKind, H2ErrorCode,
    H2StreamErrorKind, Header, ProtocolError,
};
use crate::utils::timeout_result;
use bytes::{Bytes, BytesMut};
use state::StreamEvent;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

// Writes are coalesced up to this many bytes before hitting the socket.
const WRITE_BATCH_BYTES: usize = 256 * 1024;

pub(crate) enum Outbound {
    Preface,
    Frame(FrameH2),
    Headers {
        stream_id: u32,
        headers: Vec<Header>,
        end_stream: bool,
    },
    Shutdown,
}

pub struct ConnectionCore {
    recv_flow: WindowManager,
    send_flow: SendFlow,
    config: ConnectionConfig,
    outbound: mpsc::UnboundedSender<Outbound>,
    peer_max_frame_size: Arc<AtomicU32>,
    closed: AtomicBool,
    goaway: Mutex<Option<(u32, H2ErrorCode, String)>>,
}

impl ConnectionCore {
    /// Spawns the writer task for `io` and returns the shared core.
    pub(crate) fn start<W>(
        io: W,
        config: ConnectionConfig,
        write_timeout: Option<Duration>,
    ) -> Result<(Arc<Self>, JoinHandle<Result<(), ProtocolError>>), ProtocolError>
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        config.validate()?;
        let recv_flow = WindowManager::new(config.flow.clone())?;
        let (tx, rx) = mpsc::unbounded_channel();
        let peer_max_frame_size = Arc::new(AtomicU32::new(DEFAULT_MAX_FRAME_SIZE));

        let writer = tokio::spawn(write_loop(
            io,
            rx,
            peer_max_frame_size.clone(),
            write_timeout,
        ));

        let core = Arc::new(Self {
            recv_flow,
            send_flow: SendFlow::new(),
            config,
            outbound: tx,
            peer_max_frame_size,
            closed: AtomicBool::new(false),
            goaway: Mutex::new(None),
        });
        Ok((core, writer))
    }

    pub fn recv_flow(&self) -> &WindowManager {
        &self.recv_flow
    }

    pub fn send_flow(&self) -> &SendFlow {
        &self.send_flow
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn peer_max_frame_size(&self) -> u32 {
        self.peer_max_frame_size.load(Ordering::Relaxed)
    }

    /// Last stream id the peer promised to process, once it sent GOAWAY.
    pub fn goaway_last_stream_id(&self) -> Option<u32> {
        self.goaway
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|(last, _, _)| *last)
    }

    pub(crate) fn goaway_error(&self) -> ProtocolError {
        match &*self.goaway.lock().unwrap_or_else(PoisonError::into_inner) {
            Some((_, code, reason)) => {
                H2ConnectionErrorKind::GoAway(*code, reason.clone()).into()
            }
            None => H2ConnectionErrorKind::Closed.into(),
        }
    }

    pub(crate) fn queue(&self, item: Outbound) -> Result<(), ProtocolError> {
        self.outbound
            .send(item)
            .map_err(|_| H2ConnectionErrorKind::Closed.into())
    }

    pub(crate) fn queue_frame(&self, frame: FrameH2) -> Result<(), ProtocolError> {
        self.queue(Outbound::Frame(frame))
    }

    /// Preface (clients only), local SETTINGS and the initial connection
    /// WINDOW_UPDATE, in that order.
    pub(crate) fn queue_handshake(&self, with_preface: bool) -> Result<(), ProtocolError> {
        if with_preface {
            self.queue(Outbound::Preface)?;
        }
        self.queue_frame(self.local_settings_frame())?;
        if let Some(update) = self.recv_flow.initial_connection_update() {
            self.send_window_updates(&[update])?;
        }
        Ok(())
    }

    fn local_settings_frame(&self) -> FrameH2 {
        FrameH2::settings(&[
            (SETTINGS_HEADER_TABLE_SIZE, self.config.header_table_size),
            (SETTINGS_ENABLE_PUSH, 0),
            (
                SETTINGS_MAX_CONCURRENT_STREAMS,
                self.config.max_concurrent_streams,
            ),
            (
                SETTINGS_INITIAL_WINDOW_SIZE,
                self.config.flow.initial_stream_window,
            ),
            (SETTINGS_MAX_FRAME_SIZE, self.config.max_frame_size),
            (SETTINGS_MAX_HEADER_LIST_SIZE, DEFAULT_MAX_HEADER_LIST_SIZE),
        ])
    }

    pub(crate) fn send_window_updates(&self, updates: &[WindowUpdate]) -> Result<(), ProtocolError> {
        for update in updates {
            tracing::trace!(
                stream_id = update.stream_id,
                increment = update.increment,
                "sending WINDOW_UPDATE"
            );
            self.queue_frame(FrameH2::window_update(update.stream_id, update.increment)?)?;
        }
        Ok(())
    }

    pub(crate) fn send_headers(
        &self,
        stream_id: u32,
        headers: Vec<Header>,
        end_stream: bool,
    ) -> Result<(), ProtocolError> {
        self.queue(Outbound::Headers {
            stream_id,
            headers,
            end_stream,
        })?;
        if end_stream {
            self.on_local_end(stream_id);
        }
        Ok(())
    }

    /// Sends `data` as DATA frames, waiting for send credit as needed. Fails
    /// as soon as the stream is reset or the connection closes.
    pub(crate) async fn send_data(
        &self,
        stream_id: u32,
        mut data: Bytes,
        end_stream: bool,
    ) -> Result<(), ProtocolError> {
        if data.is_empty() {
            if end_stream {
                self.queue_frame(FrameH2::data(stream_id, Bytes::new(), true))?;
                self.on_local_end(stream_id);
            }
            return Ok(());
        }

        while !data.is_empty() {
            let max_frame = self.peer_max_frame_size() as usize;
            let granted = self
                .send_flow
                .reserve(stream_id, data.len().min(max_frame))
                .await?;
            let chunk = data.split_to(granted);
            let last = end_stream && data.is_empty();
            self.queue_frame(FrameH2::data(stream_id, chunk, last))?;
        }

        if end_stream {
            self.on_local_end(stream_id);
        }
        Ok(())
    }

    fn on_local_end(&self, stream_id: u32) {
        self.recv_flow.on_local_end(stream_id);
        self.send_flow.close_stream(stream_id);
    }

    /// Resets a stream from our side and reconciles its receive credit.
    pub(crate) fn reset_stream(
        &self,
        stream_id: u32,
        code: H2ErrorCode,
    ) -> Result<Released, ProtocolError> {
        tracing::debug!(stream_id, %code, "resetting stream");
        self.queue_frame(FrameH2::rst(stream_id, code))?;
        self.send_flow.close_stream(stream_id);
        let released = self.recv_flow.on_stream_reset(stream_id);
        self.send_window_updates(&released.updates)?;
        Ok(released)
    }

    /// Credits bytes the application consumed.
    pub(crate) fn release(&self, stream_id: u32, length: u32) -> Result<(), ProtocolError> {
        let updates = self.recv_flow.on_application_read(stream_id, length)?;
        self.send_window_updates(&updates)
    }

    /// The application is done with a stream's inbound data.
    pub(crate) fn close_stream_by_application(
        &self,
        stream_id: u32,
    ) -> Result<Released, ProtocolError> {
        let released = self.recv_flow.on_stream_closed_by_application(stream_id);
        self.send_window_updates(&released.updates)?;
        Ok(released)
    }

    /// Charges a DATA frame and returns the event to hand to the stream, if
    /// any.
    pub(crate) fn receive_data(&self, frame: &FrameH2) -> Result<Option<StreamEvent>, ProtocolError> {
        let payload = frame.data_payload()?;
        let flow_len = frame.flow_controlled_len();
        let received = self.recv_flow.on_data_received(frame.stream_id, flow_len)?;
        self.send_window_updates(&received.updates)?;

        match received.disposition {
            DataDisposition::Deliver => {
                let data_len = payload.len() as u32;
                let padding = flow_len - data_len;
                if padding > 0 {
                    self.release(frame.stream_id, padding)?;
                }
                let end_stream = frame.is_end_stream();
                if end_stream {
                    self.recv_flow.on_remote_end(frame.stream_id);
                }
                Ok(Some(StreamEvent::Data {
                    payload,
                    flow_len: data_len,
                    end_stream,
                }))
            }
            DataDisposition::Discarded => Ok(None),
            DataDisposition::StreamClosed => Err(H2StreamErrorKind::StreamClosed.into()),
        }
    }

    /// Handles connection-level frames. Returns `false` for frames the caller
    /// must dispatch itself.
    pub(crate) fn handle_control_frame(&self, frame: &FrameH2) -> Result<bool, ProtocolError> {
        match frame.frame_type {
            FrameTypeH2::Settings => {
                if frame.stream_id != 0 {
                    return Err(ProtocolError::H2ProtocolError(
                        "SETTINGS frame on a stream".to_string(),
                    ));
                }
                if frame.is_ack() {
                    if !frame.payload.is_empty() {
                        return Err(ProtocolError::H2FrameSizeError(
                            "SETTINGS ACK with payload".to_string(),
                        ));
                    }
                    return Ok(true);
                }
                for (id, value) in frame.settings_entries()? {
                    self.apply_setting(id, value)?;
                }
                self.queue_frame(FrameH2::settings_ack())?;
                Ok(true)
            }
            FrameTypeH2::Ping => {
                let data = frame.ping_data()?;
                if !frame.is_ack() {
                    self.queue_frame(FrameH2::ping_ack(data))?;
                }
                Ok(true)
            }
            FrameTypeH2::WindowUpdate => {
                let increment = frame.window_increment()?;
                if increment == 0 {
                    if frame.stream_id == 0 {
                        return Err(ProtocolError::H2ProtocolError(
                            "WINDOW_UPDATE increment must be greater than zero".to_string(),
                        ));
                    }
                    return Err(H2StreamErrorKind::ProtocolViolation(
                        "WINDOW_UPDATE increment must be greater than zero".to_string(),
                    )
                    .into());
                }
                self.send_flow.on_window_update(frame.stream_id, increment)?;
                Ok(true)
            }
            FrameTypeH2::GoAway => {
                let (last_stream_id, code, reason) = frame.goaway_fields()?;
                tracing::info!(last_stream_id, %code, debug_data = %reason, "received GOAWAY");
                *self.goaway.lock().unwrap_or_else(PoisonError::into_inner) =
                    Some((last_stream_id, code, reason));
                Ok(true)
            }
            FrameTypeH2::Priority | FrameTypeH2::Unknown(_) => Ok(true),
            _ => Ok(false),
        }
    }

    fn apply_setting(&self, id: u16, value: u32) -> Result<(), ProtocolError> {
        match id {
            SETTINGS_ENABLE_PUSH if value > 1 => Err(ProtocolError::H2ProtocolError(
                "Invalid ENABLE_PUSH value".to_string(),
            )),
            SETTINGS_INITIAL_WINDOW_SIZE => self.send_flow.on_initial_window_size(value),
            SETTINGS_MAX_FRAME_SIZE => {
                if !(DEFAULT_MAX_FRAME_SIZE..=MAX_FRAME_SIZE_UPPER_BOUND).contains(&value) {
                    return Err(ProtocolError::H2ProtocolError(
                        "Invalid MAX_FRAME_SIZE value".to_string(),
                    ));
                }
                self.peer_max_frame_size.store(value, Ordering::Relaxed);
                Ok(())
            }
            // Unknown settings are ignored per RFC 7540
            _ => Ok(()),
        }
    }

    /// Terminates the connection with GOAWAY carrying `error`'s code.
    pub(crate) fn fail(&self, last_stream_id: u32, error: &ProtocolError) {
        let code = error.h2_code();
        tracing::warn!(%code, error = %error, "closing connection");
        let reason = error.to_string();
        let _ = self.queue_frame(FrameH2::goaway(last_stream_id, code, Some(reason.as_bytes())));
        self.close();
    }

    /// Graceful GOAWAY(NO_ERROR) followed by shutdown of the write half.
    pub fn shutdown(&self, last_stream_id: u32) {
        if self.is_closed() {
            return;
        }
        let _ = self.queue_frame(FrameH2::goaway(last_stream_id, H2ErrorCode::NoError, None));
        self.close();
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.send_flow.close_connection();
            let _ = self.queue(Outbound::Shutdown);
        }
    }
}

impl std::fmt::Debug for ConnectionCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionCore")
            .field("recv_flow", &self.recv_flow)
            .field("closed", &self.is_closed())
            .finish()
    }
}

async fn write_loop<W>(
    mut io: W,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
    peer_max_frame_size: Arc<AtomicU32>,
    write_timeout: Option<Duration>,
) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    let mut encoder = HeaderEncoder::new();
    let mut buf = BytesMut::new();
    let mut shutdown = false;

    while let Some(item) = rx.recv().await {
        shutdown |= encode_outbound(item, &mut encoder, &mut buf, &peer_max_frame_size);
        while !shutdown && buf.len() < WRITE_BATCH_BYTES {
            match rx.try_recv() {
                Ok(item) => {
                    shutdown |= encode_outbound(item, &mut encoder, &mut buf, &peer_max_frame_size)
                }
                Err(_) => break,
            }
        }

        if !buf.is_empty() {
            timeout_result(write_timeout, async {
                io.write_all(&buf).await?;
                io.flush().await?;
                Ok::<(), ProtocolError>(())
            })
            .await?;
            buf.clear();
        }

        if shutdown {
            break;
        }
    }

    let _ = io.shutdown().await;
    Ok(())
}

/// Appends the wire form of `item` to `buf`; returns true on shutdown.
fn encode_outbound(
    item: Outbound,
    encoder: &mut HeaderEncoder,
    buf: &mut BytesMut,
    peer_max_frame_size: &AtomicU32,
) -> bool {
    match item {
        Outbound::Preface => buf.extend_from_slice(CONNECTION_PREFACE),
        Outbound::Frame(frame) => frame.serialize_into(buf),
        Outbound::Headers {
            stream_id,
            headers,
            end_stream,
        } => {
            let block = encoder.encode(&headers);
            let max_frame = peer_max_frame_size.load(Ordering::Relaxed) as usize;
            for frame in header_frames(stream_id, block, end_stream, max_frame) {
                frame.serialize_into(buf);
            }
        }
        Outbound::Shutdown => return true,
    }
    false
}

/// Splits an encoded header block into HEADERS + CONTINUATION frames.
fn header_frames(stream_id: u32, mut block: Bytes, end_stream: bool, max_frame: usize) -> Vec<FrameH2> {
    let mut first = true;
    let mut frames = Vec::new();

    loop {
        let chunk = block.split_to(block.len().min(max_frame));
        let is_last = block.is_empty();
        let mut flags = 0u8;

        if first && end_stream {
            flags |= END_STREAM_FLAG;
        }
        if is_last {
            flags |= END_HEADERS_FLAG;
        }

        let frame_type = if first {
            FrameTypeH2::Headers
        } else {
            FrameTypeH2::Continuation
        };
        frames.push(FrameH2::new(frame_type, flags, stream_id, chunk));

        if is_last {
            break;
        }
        first = false;
    }

    frames
}

#[derive(Debug)]
struct PendingHeaderBlock {
    stream_id: u32,
    block: BytesMut,
    end_stream: bool,
}

/// Reassembles HEADERS + CONTINUATION sequences (RFC 7540 Section 6.10).
#[derive(Debug, Default)]
pub(crate) struct HeaderAssembler {
    pending: Option<PendingHeaderBlock>,
}

impl HeaderAssembler {
    /// Returns `(stream_id, block, end_stream)` once a block is complete.
    pub(crate) fn push(
        &mut self,
        frame: &FrameH2,
    ) -> Result<Option<(u32, Bytes, bool)>, ProtocolError> {
        match frame.frame_type {
            FrameTypeH2::Headers => {
                if self.pending.is_some() {
                    return Err(ProtocolError::H2ProtocolError(
                        "HEADERS frame interrupted a header block".to_string(),
                    ));
                }
                if frame.stream_id == 0 {
                    return Err(ProtocolError::H2ProtocolError(
                        "HEADERS frame received on stream 0".to_string(),
                    ));
                }
                let fragment = frame.header_fragment()?;
                if frame.is_end_headers() {
                    return Ok(Some((frame.stream_id, fragment, frame.is_end_stream())));
                }
                let mut block = BytesMut::with_capacity(fragment.len() * 2);
                block.extend_from_slice(&fragment);
                self.pending = Some(PendingHeaderBlock {
                    stream_id: frame.stream_id,
                    block,
                    end_stream: frame.is_end_stream(),
                });
                Ok(None)
            }
            FrameTypeH2::Continuation => {
                let pending = self.pending.as_mut().ok_or_else(|| {
                    ProtocolError::H2ProtocolError(
                        "CONTINUATION frame without pending header block".to_string(),
                    )
                })?;
                if pending.stream_id != frame.stream_id {
                    return Err(ProtocolError::H2ProtocolError(
                        "CONTINUATION frame on a different stream".to_string(),
                    ));
                }
                pending.block.extend_from_slice(&frame.payload);
                if !frame.is_end_headers() {
                    return Ok(None);
                }
                match self.pending.take() {
                    Some(done) => Ok(Some((done.stream_id, done.block.freeze(), done.end_stream))),
                    None => Ok(None),
                }
            }
            _ => {
                if self.pending.is_some() {
                    return Err(ProtocolError::H2ProtocolError(
                        "frame interleaved with a header block".to_string(),
                    ));
                }
                Ok(None)
            }
        }
    }
}

/// Role-specific reactions to stream frames, called from [`drive`].
pub(crate) trait StreamDispatch {
    fn on_headers(
        &mut self,
        stream_id: u32,
        headers: Vec<Header>,
        end_stream: bool,
    ) -> Result<(), ProtocolError>;

    fn on_data(&mut self, stream_id: u32, event: StreamEvent);

    fn on_reset(&mut self, stream_id: u32, error_code: H2ErrorCode);

    /// Called on GOAWAY for every stream the peer will not process.
    fn on_goaway(&mut self, last_stream_id: u32);

    fn on_push_promise(&mut self) -> Result<(), ProtocolError> {
        Err(ProtocolError::H2ProtocolError(
            "PUSH_PROMISE received but push is disabled".to_string(),
        ))
    }

    fn last_stream_id(&self) -> u32;

    fn on_connection_closed(&mut self);
}

/// Reads frames until the peer goes away or a connection error occurs.
pub(crate) async fn drive<R, D>(
    core: Arc<ConnectionCore>,
    mut reader: FrameReader<R>,
    mut decoder: HeaderDecoder,
    mut dispatch: D,
) -> Result<(), ProtocolError>
where
    R: AsyncRead + Unpin,
    D: StreamDispatch,
{
    let mut assembler = HeaderAssembler::default();

    let result = loop {
        let frame = match reader.read_frame().await {
            Ok(Some(frame)) => frame,
            Ok(None) => break Ok(()),
            Err(err) => break Err(err),
        };
        if core.is_closed() && !matches!(frame.frame_type, FrameTypeH2::GoAway) {
            continue;
        }

        match process_frame(&core, &frame, &mut assembler, &mut decoder, &mut dispatch) {
            Ok(()) => {}
            Err(err) if err.is_stream_error() && frame.stream_id != 0 => {
                let code = err.h2_code();
                tracing::debug!(stream_id = frame.stream_id, error = %err, "stream error");
                if let Err(err) = core.reset_stream(frame.stream_id, code) {
                    break Err(err);
                }
                dispatch.on_reset(frame.stream_id, code);
            }
            Err(err) => {
                core.fail(dispatch.last_stream_id(), &err);
                break Err(err);
            }
        }
    };

    core.close();
    dispatch.on_connection_closed();
    result
}

fn process_frame<D: StreamDispatch>(
    core: &ConnectionCore,
    frame: &FrameH2,
    assembler: &mut HeaderAssembler,
    decoder: &mut HeaderDecoder,
    dispatch: &mut D,
) -> Result<(), ProtocolError> {
    if let Some((stream_id, block, end_stream)) = assembler.push(frame)? {
        // The decoder must see every block, even for streams we reject.
        let headers = decoder.decode(&block)?;
        if end_stream {
            core.recv_flow.on_remote_end(stream_id);
        }
        return dispatch.on_headers(stream_id, headers, end_stream);
    }

    match frame.frame_type {
        FrameTypeH2::Headers | FrameTypeH2::Continuation => Ok(()),
        FrameTypeH2::Data => {
            if let Some(event) = core.receive_data(frame)? {
                dispatch.on_data(frame.stream_id, event);
            }
            Ok(())
        }
        FrameTypeH2::RstStream => {
            if frame.stream_id == 0 {
                return Err(ProtocolError::H2ProtocolError(
                    "RST_STREAM frame received on stream 0".to_string(),
                ));
            }
            let code = frame.error_code()?;
            tracing::debug!(stream_id = frame.stream_id, %code, "peer reset stream");
            core.send_flow.close_stream(frame.stream_id);
            let released = core.recv_flow.on_stream_reset(frame.stream_id);
            core.send_window_updates(&released.updates)?;
            dispatch.on_reset(frame.stream_id, code);
            Ok(())
        }
        FrameTypeH2::PushPromise => dispatch.on_push_promise(),
        FrameTypeH2::GoAway => {
            core.handle_control_frame(frame)?;
            if let Some(last) = core.goaway_last_stream_id() {
                dispatch.on_goaway(last);
            }
            Ok(())
        }
        _ => {
            core.handle_control_frame(frame)?;
            Ok(())
        }
    }
}

/// Application side of a stream's inbound data.
///
/// Every byte handed out by [`Body::chunk`] is credited back to flow control.
/// [`Body::close`] releases whatever was received but never read; dropping an
/// unclosed body performs the same release.
pub struct Body {
    stream_id: u32,
    events: mpsc::UnboundedReceiver<StreamEvent>,
    core: Arc<ConnectionCore>,
    finished: bool,
    released: bool,
    trailers: Option<Vec<Header>>,
}

impl Body {
    pub(crate) fn new(
        stream_id: u32,
        events: mpsc::UnboundedReceiver<StreamEvent>,
        core: Arc<ConnectionCore>,
        finished: bool,
    ) -> Self {
        Self {
            stream_id,
            events,
            core,
            finished,
            released: false,
            trailers: None,
        }
    }

    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }

    /// True once the peer's END_STREAM has been read.
    pub fn is_end_stream(&self) -> bool {
        self.finished
    }

    pub fn trailers(&self) -> Option<&[Header]> {
        self.trailers.as_deref()
    }

    /// Next chunk of data, or `None` at end of stream.
    pub async fn chunk(&mut self) -> Result<Option<Bytes>, ProtocolError> {
        if self.released {
            return Err(H2StreamErrorKind::StreamClosed.into());
        }

        while !self.finished {
            let event = match self.events.recv().await {
                Some(event) => event,
                None => StreamEvent::ConnectionClosed,
            };
            match event {
                StreamEvent::Data {
                    payload,
                    flow_len,
                    end_stream,
                } => {
                    if flow_len > 0 {
                        self.core.release(self.stream_id, flow_len)?;
                    }
                    self.finished = end_stream;
                    if !payload.is_empty() {
                        return Ok(Some(payload));
                    }
                }
                StreamEvent::Headers {
                    headers,
                    end_stream,
                    ..
                } => {
                    self.trailers = Some(headers);
                    self.finished = end_stream;
                }
                StreamEvent::RstStream { error_code } => {
                    self.finished = true;
                    return Err(H2StreamErrorKind::Reset(error_code).into());
                }
                StreamEvent::ConnectionClosed => {
                    self.finished = true;
                    return Err(self.core.goaway_error());
                }
            }
        }
        Ok(None)
    }

    pub async fn read_to_end(&mut self) -> Result<Bytes, ProtocolError> {
        let mut body = BytesMut::new();
        while let Some(chunk) = self.chunk().await? {
            body.extend_from_slice(&chunk);
        }
        Ok(body.freeze())
    }

    /// Stops reading and returns every received-but-unread byte to the
    /// connection window.
    pub fn close(mut self) -> Result<Released, ProtocolError> {
        self.release()
    }

    fn release(&mut self) -> Result<Released, ProtocolError> {
        if self.released {
            return Ok(Released::default());
        }
        self.released = true;
        self.events.close();
        self.core.close_stream_by_application(self.stream_id)
    }
}

impl Drop for Body {
    fn drop(&mut self) {
        if !self.released {
            if let Err(err) = self.release() {
                tracing::debug!(stream_id = self.stream_id, error = %err, "body release failed");
            }
        }
    }
}

impl std::fmt::Debug for Body {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Body")
            .field("stream_id", &self.stream_id)
            .field("finished", &self.finished)
            .field("released", &self.released)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::h2::framing::FrameReader;
    use crate::types::FlowControlConfig;
    use tokio::io::duplex;

    #[test]
    fn header_frames_split_on_max_frame_size() {
        let block = Bytes::from(vec![7u8; 40_000]);
        let frames = header_frames(1, block, true, 16_384);
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].frame_type, FrameTypeH2::Headers);
        assert!(frames[0].is_end_stream());
        assert!(!frames[0].is_end_headers());
        assert_eq!(frames[2].frame_type, FrameTypeH2::Continuation);
        assert!(frames[2].is_end_headers());
        assert!(!frames[2].is_end_stream());
    }

    #[test]
    fn assembler_joins_continuations() {
        let mut assembler = HeaderAssembler::default();
        let head = FrameH2::new(FrameTypeH2::Headers, END_STREAM_FLAG, 1, Bytes::from_static(b"ab"));
        let tail = FrameH2::new(
            FrameTypeH2::Continuation,
            END_HEADERS_FLAG,
            1,
            Bytes::from_static(b"cd"),
        );
        assert!(assembler.push(&head).unwrap().is_none());
        let (stream_id, block, end_stream) = assembler.push(&tail).unwrap().unwrap();
        assert_eq!(stream_id, 1);
        assert_eq!(block, Bytes::from_static(b"abcd"));
        assert!(end_stream);
    }

    #[test]
    fn assembler_rejects_interleaving() {
        let mut assembler = HeaderAssembler::default();
        let head = FrameH2::new(FrameTypeH2::Headers, 0, 1, Bytes::from_static(b"ab"));
        assembler.push(&head).unwrap();
        let ping = FrameH2::ping([0; 8]);
        assert!(assembler.push(&ping).is_err());
    }

    async fn read_all_frames(reader: &mut FrameReader<tokio::io::DuplexStream>) -> Vec<FrameH2> {
        let mut frames = Vec::new();
        while let Ok(Some(frame)) = reader.read_frame().await {
            frames.push(frame);
        }
        frames
    }

    #[tokio::test]
    async fn body_close_emits_connection_window_update() {
        let (local, remote) = duplex(1 << 20);
        let (core, writer) = ConnectionCore::start(
            local,
            ConnectionConfig::default(),
            None,
        )
        .unwrap();

        core.recv_flow().open_stream(1, false).unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        let body = Body::new(1, rx, core.clone(), false);

        let frame = FrameH2::data(1, Bytes::from(vec![0u8; 40_000]), false);
        let event = core.receive_data(&frame).unwrap().unwrap();
        tx.send(event).unwrap();

        let released = body.close().unwrap();
        assert_eq!(released.returned, 40_000);
        assert_eq!(core.recv_flow().available_connection_credit(), 65_535);

        core.shutdown(1);
        writer.await.unwrap().unwrap();

        let mut reader = FrameReader::new(remote, MAX_FRAME_SIZE_UPPER_BOUND);
        let frames = read_all_frames(&mut reader).await;
        let update = frames
            .iter()
            .find(|f| f.frame_type == FrameTypeH2::WindowUpdate)
            .expect("connection WINDOW_UPDATE");
        assert_eq!(update.stream_id, 0);
        assert_eq!(update.window_increment().unwrap(), 40_000);
        assert_eq!(frames.last().unwrap().frame_type, FrameTypeH2::GoAway);
    }

    #[tokio::test]
    async fn dropping_body_releases_credit() {
        let (local, _remote) = duplex(1 << 20);
        let config = ConnectionConfig {
            flow: FlowControlConfig::default(),
            ..ConnectionConfig::default()
        };
        let (core, _writer) = ConnectionCore::start(local, config, None).unwrap();

        core.recv_flow().open_stream(1, false).unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        let body = Body::new(1, rx, core.clone(), false);
        let frame = FrameH2::data(1, Bytes::from(vec![1u8; 1_000]), false);
        tx.send(core.receive_data(&frame).unwrap().unwrap()).unwrap();

        drop(body);
        let ledger = core.recv_flow().ledger();
        assert_eq!(ledger.outstanding(), 0);
        assert!(ledger.is_balanced(65_535));
    }

    #[tokio::test]
    async fn body_reads_release_credit_and_stop_at_end_stream() {
        let (local, _remote) = duplex(1 << 20);
        let (core, _writer) =
            ConnectionCore::start(local, ConnectionConfig::default(), None).unwrap();

        core.recv_flow().open_stream(1, false).unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        let mut body = Body::new(1, rx, core.clone(), false);
        for (chunk, last) in [(&b"hello "[..], false), (&b"world"[..], true)] {
            let frame = FrameH2::data(1, Bytes::copy_from_slice(chunk), last);
            tx.send(core.receive_data(&frame).unwrap().unwrap()).unwrap();
        }

        assert_eq!(body.read_to_end().await.unwrap(), Bytes::from_static(b"hello world"));
        assert!(body.is_end_stream());
        assert_eq!(core.recv_flow().ledger().unread, 0);
        assert_eq!(body.close().unwrap().returned, 0);
    }

    #[tokio::test]
    async fn received_goaway_is_recorded() {
        let (local, _remote) = duplex(1 << 16);
        let (core, _writer) =
            ConnectionCore::start(local, ConnectionConfig::default(), None).unwrap();

        let frame = FrameH2::goaway(3, H2ErrorCode::EnhanceYourCalm, Some(&b"slow down"[..]));
        assert!(core.handle_control_frame(&frame).unwrap());
        assert_eq!(core.goaway_last_stream_id(), Some(3));
        assert!(matches!(
            core.goaway_error(),
            ProtocolError::H2ConnectionError(H2ConnectionErrorKind::GoAway(
                H2ErrorCode::EnhanceYourCalm,
                ref reason,
            )) if reason == "slow down"
        ));
    }

    #[tokio::test]
    async fn padding_is_released_on_arrival() {
        let (local, _remote) = duplex(1 << 16);
        let (core, _writer) =
            ConnectionCore::start(local, ConnectionConfig::default(), None).unwrap();
        core.recv_flow().open_stream(1, false).unwrap();

        let mut payload = vec![10u8];
        payload.extend_from_slice(&[b'x'; 100]);
        payload.extend_from_slice(&[0u8; 10]);
        let frame = FrameH2::new(FrameTypeH2::Data, PADDED_FLAG, 1, Bytes::from(payload));

        match core.receive_data(&frame).unwrap() {
            Some(StreamEvent::Data { payload, flow_len, .. }) => {
                assert_eq!(payload.len(), 100);
                assert_eq!(flow_len, 100);
            }
            other => panic!("unexpected event {:?}", other),
        }
        let ledger = core.recv_flow().ledger();
        assert_eq!(ledger.charged, 111);
        assert_eq!(ledger.unread, 100);
        assert!(ledger.is_balanced(65_535));
    }

    #[tokio::test]
    async fn reset_event_surfaces_as_stream_error() {
        let (local, _remote) = duplex(1 << 16);
        let (core, _writer) =
            ConnectionCore::start(local, ConnectionConfig::default(), None).unwrap();
        core.recv_flow().open_stream(1, false).unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        let mut body = Body::new(1, rx, core.clone(), false);
        tx.send(StreamEvent::RstStream {
            error_code: H2ErrorCode::Cancel,
        })
        .unwrap();
        assert!(matches!(
            body.chunk().await,
            Err(ProtocolError::H2StreamError(H2StreamErrorKind::Reset(
                H2ErrorCode::Cancel
            )))
        ));
    }
}
