use crate::types::{H2ErrorCode, Header};
use bytes::Bytes;

// Stream States (RFC 7540 Section 5.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    Open,
    HalfClosedLocal,
    HalfClosedRemote,
    Closed,
}

impl std::fmt::Display for StreamState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamState::Idle => write!(f, "idle"),
            StreamState::Open => write!(f, "open"),
            StreamState::HalfClosedLocal => write!(f, "half-closed (local)"),
            StreamState::HalfClosedRemote => write!(f, "half-closed (remote)"),
            StreamState::Closed => write!(f, "closed"),
        }
    }
}

/// Inbound events routed from the frame reader to the task that owns a stream.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Headers {
        headers: Vec<Header>,
        end_stream: bool,
        is_trailer: bool,
    },
    Data {
        payload: Bytes,
        /// Bytes still charged to flow control; padding is released on arrival.
        flow_len: u32,
        end_stream: bool,
    },
    RstStream {
        error_code: H2ErrorCode,
    },
    /// The connection went away underneath the stream.
    ConnectionClosed,
}
