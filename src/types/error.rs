use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
    #[error("Request timeout")]
    Timeout,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // HTTP/2 specific errors
    #[error("HTTP/2 frame size error: {0}")]
    H2FrameSizeError(String),
    #[error("HTTP/2 flow control error: {0}")]
    H2FlowControlError(String),
    #[error("HTTP/2 compression error: {0}")]
    H2CompressionError(String),
    #[error("HTTP/2 stream error: {0}")]
    H2StreamError(#[from] H2StreamErrorKind),
    #[error("HTTP/2 connection error: {0}")]
    H2ConnectionError(#[from] H2ConnectionErrorKind),
    #[error("HTTP/2 protocol error: {0}")]
    H2ProtocolError(String),

    // Header handling errors
    #[error("Header encoding error: {0}")]
    HeaderEncodingError(String),

    #[error("Invalid target: {0}")]
    InvalidTarget(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

#[derive(Debug, Error)]
pub enum H2StreamErrorKind {
    #[error("stream reset with error code {0:?}")]
    Reset(H2ErrorCode),
    #[error("flow control violation")]
    FlowControlViolation,
    #[error("stream closed")]
    StreamClosed,
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
}

#[derive(Debug, Error)]
pub enum H2ConnectionErrorKind {
    #[error("connection terminated with GOAWAY ({0:?}): {1}")]
    GoAway(H2ErrorCode, String),
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("connection closed")]
    Closed,
}

// HTTP/2 Error Codes (RFC 7540 Section 7)
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum H2ErrorCode {
    NoError = 0x0,
    ProtocolError = 0x1,
    InternalError = 0x2,
    FlowControlError = 0x3,
    SettingsTimeout = 0x4,
    StreamClosed = 0x5,
    FrameSizeError = 0x6,
    RefusedStream = 0x7,
    Cancel = 0x8,
    CompressionError = 0x9,
    ConnectError = 0xa,
    EnhanceYourCalm = 0xb,
    InadequateSecurity = 0xc,
    Http11Required = 0xd,
}

impl ProtocolError {
    /// Error code to put on the wire when this error terminates a stream or
    /// the connection.
    pub fn h2_code(&self) -> H2ErrorCode {
        match self {
            ProtocolError::H2FrameSizeError(_) => H2ErrorCode::FrameSizeError,
            ProtocolError::H2FlowControlError(_) => H2ErrorCode::FlowControlError,
            ProtocolError::H2CompressionError(_) => H2ErrorCode::CompressionError,
            ProtocolError::H2StreamError(kind) => match kind {
                H2StreamErrorKind::Reset(code) => *code,
                H2StreamErrorKind::FlowControlViolation => H2ErrorCode::FlowControlError,
                H2StreamErrorKind::StreamClosed => H2ErrorCode::StreamClosed,
                H2StreamErrorKind::ProtocolViolation(_) => H2ErrorCode::ProtocolError,
            },
            ProtocolError::H2ConnectionError(kind) => match kind {
                H2ConnectionErrorKind::GoAway(code, _) => *code,
                H2ConnectionErrorKind::ProtocolViolation(_) => H2ErrorCode::ProtocolError,
                H2ConnectionErrorKind::Closed => H2ErrorCode::NoError,
            },
            ProtocolError::H2ProtocolError(_)
            | ProtocolError::HeaderEncodingError(_) => H2ErrorCode::ProtocolError,
            _ => H2ErrorCode::InternalError,
        }
    }

    /// Whether the error only concerns a single stream and leaves the
    /// connection usable.
    pub fn is_stream_error(&self) -> bool {
        matches!(self, ProtocolError::H2StreamError(_))
    }
}

impl std::fmt::Display for H2ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (name, description) = match self {
            H2ErrorCode::NoError => ("NO_ERROR", "graceful shutdown"),
            H2ErrorCode::ProtocolError => ("PROTOCOL_ERROR", "protocol error detected"),
            H2ErrorCode::InternalError => ("INTERNAL_ERROR", "implementation fault"),
            H2ErrorCode::FlowControlError => {
                ("FLOW_CONTROL_ERROR", "flow control protocol violated")
            }
            H2ErrorCode::SettingsTimeout => ("SETTINGS_TIMEOUT", "settings not acknowledged"),
            H2ErrorCode::StreamClosed => ("STREAM_CLOSED", "frame received for closed stream"),
            H2ErrorCode::FrameSizeError => ("FRAME_SIZE_ERROR", "frame size incorrect"),
            H2ErrorCode::RefusedStream => ("REFUSED_STREAM", "stream not processed"),
            H2ErrorCode::Cancel => ("CANCEL", "stream cancelled"),
            H2ErrorCode::CompressionError => ("COMPRESSION_ERROR", "compression state not updated"),
            H2ErrorCode::ConnectError => {
                ("CONNECT_ERROR", "TCP connection error for CONNECT method")
            }
            H2ErrorCode::EnhanceYourCalm => ("ENHANCE_YOUR_CALM", "processing capacity exceeded"),
            H2ErrorCode::InadequateSecurity => (
                "INADEQUATE_SECURITY",
                "negotiated TLS parameters inadequate",
            ),
            H2ErrorCode::Http11Required => ("HTTP_1_1_REQUIRED", "use HTTP/1.1 for request"),
        };
        write!(f, "{} (0x{:x}): {}", name, *self as u32, description)
    }
}

impl From<u32> for H2ErrorCode {
    fn from(code: u32) -> Self {
        match code {
            0x0 => H2ErrorCode::NoError,
            0x1 => H2ErrorCode::ProtocolError,
            0x2 => H2ErrorCode::InternalError,
            0x3 => H2ErrorCode::FlowControlError,
            0x4 => H2ErrorCode::SettingsTimeout,
            0x5 => H2ErrorCode::StreamClosed,
            0x6 => H2ErrorCode::FrameSizeError,
            0x7 => H2ErrorCode::RefusedStream,
            0x8 => H2ErrorCode::Cancel,
            0x9 => H2ErrorCode::CompressionError,
            0xa => H2ErrorCode::ConnectError,
            0xb => H2ErrorCode::EnhanceYourCalm,
            0xc => H2ErrorCode::InadequateSecurity,
            0xd => H2ErrorCode::Http11Required,
            _ => H2ErrorCode::InternalError, // Unknown codes are treated as INTERNAL_ERROR
        }
    }
}

impl From<H2ErrorCode> for u32 {
    fn from(code: H2ErrorCode) -> Self {
        code as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_errors_map_to_their_wire_codes() {
        let closed: ProtocolError = H2StreamErrorKind::StreamClosed.into();
        assert!(closed.is_stream_error());
        assert_eq!(closed.h2_code(), H2ErrorCode::StreamClosed);

        let refused: ProtocolError = H2StreamErrorKind::Reset(H2ErrorCode::RefusedStream).into();
        assert_eq!(refused.h2_code(), H2ErrorCode::RefusedStream);
    }

    #[test]
    fn connection_errors_are_not_stream_errors() {
        let err = ProtocolError::H2FlowControlError("window exceeded".to_string());
        assert!(!err.is_stream_error());
        assert_eq!(err.h2_code(), H2ErrorCode::FlowControlError);
        assert_eq!(ProtocolError::Timeout.h2_code(), H2ErrorCode::InternalError);
    }

    #[test]
    fn unknown_codes_decode_as_internal_error() {
        assert_eq!(H2ErrorCode::from(0x8), H2ErrorCode::Cancel);
        assert_eq!(H2ErrorCode::from(0xff), H2ErrorCode::InternalError);
        assert_eq!(u32::from(H2ErrorCode::NoError), 0);
    }
}
