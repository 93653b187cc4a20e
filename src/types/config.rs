use super::error::ProtocolError;
use super::timeouts::ClientTimeouts;
use crate::h2::consts::{
    DEFAULT_HEADER_TABLE_SIZE, DEFAULT_INITIAL_WINDOW_SIZE, DEFAULT_MAX_CONCURRENT_STREAMS,
    DEFAULT_MAX_FRAME_SIZE, MAX_FRAME_SIZE_UPPER_BOUND, MAX_WINDOW_SIZE,
};
use std::time::Duration;

/// What happens to received-but-unread bytes when the application closes a
/// request body early.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClosePolicy {
    /// Return the unread bytes to the connection window.
    #[default]
    ReturnCredit,
    /// Drop the unread bytes without crediting the connection window. This
    /// reproduces the starvation defect and exists for the regression tests.
    LeakUnread,
}

/// Receive-side flow-control parameters for one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowControlConfig {
    /// Connection-level receive window. Anything above the protocol default
    /// is announced with a WINDOW_UPDATE right after the preface.
    pub initial_connection_window: u32,
    /// Per-stream receive window, advertised as SETTINGS_INITIAL_WINDOW_SIZE.
    pub initial_stream_window: u32,
    /// Released credit is announced once it reaches `window / update_divisor`.
    pub update_divisor: u32,
    pub close_policy: ClosePolicy,
}

impl Default for FlowControlConfig {
    fn default() -> Self {
        Self {
            initial_connection_window: DEFAULT_INITIAL_WINDOW_SIZE,
            initial_stream_window: DEFAULT_INITIAL_WINDOW_SIZE,
            update_divisor: 2,
            close_policy: ClosePolicy::ReturnCredit,
        }
    }
}

impl FlowControlConfig {
    pub fn with_connection_window(mut self, size: u32) -> Self {
        self.initial_connection_window = size;
        self
    }

    pub fn with_stream_window(mut self, size: u32) -> Self {
        self.initial_stream_window = size;
        self
    }

    pub fn with_update_divisor(mut self, divisor: u32) -> Self {
        self.update_divisor = divisor;
        self
    }

    pub fn with_close_policy(mut self, policy: ClosePolicy) -> Self {
        self.close_policy = policy;
        self
    }

    pub fn validate(&self) -> Result<(), ProtocolError> {
        // The connection window starts at 65,535 on the wire and can only grow.
        if self.initial_connection_window < DEFAULT_INITIAL_WINDOW_SIZE
            || self.initial_connection_window > MAX_WINDOW_SIZE
        {
            return Err(ProtocolError::InvalidConfig(format!(
                "connection window {} outside {}..={}",
                self.initial_connection_window, DEFAULT_INITIAL_WINDOW_SIZE, MAX_WINDOW_SIZE
            )));
        }
        if self.initial_stream_window == 0 || self.initial_stream_window > MAX_WINDOW_SIZE {
            return Err(ProtocolError::InvalidConfig(format!(
                "stream window {} outside 1..={}",
                self.initial_stream_window, MAX_WINDOW_SIZE
            )));
        }
        if self.update_divisor == 0 {
            return Err(ProtocolError::InvalidConfig(
                "update_divisor must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn connection_update_threshold(&self) -> u32 {
        (self.initial_connection_window / self.update_divisor.max(1)).max(1)
    }

    pub fn stream_update_threshold(&self) -> u32 {
        (self.initial_stream_window / self.update_divisor.max(1)).max(1)
    }
}

/// Local SETTINGS shared by both ends of the harness.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    pub flow: FlowControlConfig,
    pub header_table_size: u32,
    pub max_concurrent_streams: u32,
    pub max_frame_size: u32,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            flow: FlowControlConfig::default(),
            header_table_size: DEFAULT_HEADER_TABLE_SIZE,
            max_concurrent_streams: DEFAULT_MAX_CONCURRENT_STREAMS,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

impl ConnectionConfig {
    pub fn validate(&self) -> Result<(), ProtocolError> {
        self.flow.validate()?;
        if self.max_frame_size < DEFAULT_MAX_FRAME_SIZE
            || self.max_frame_size > MAX_FRAME_SIZE_UPPER_BOUND
        {
            return Err(ProtocolError::InvalidConfig(format!(
                "max_frame_size {} outside {}..={}",
                self.max_frame_size, DEFAULT_MAX_FRAME_SIZE, MAX_FRAME_SIZE_UPPER_BOUND
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub connection: ConnectionConfig,
    /// Upper bound on a single socket write; `None` waits forever.
    pub write_timeout: Option<Duration>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            write_timeout: Some(Duration::from_secs(30)),
        }
    }
}

impl ServerConfig {
    pub fn with_flow(mut self, flow: FlowControlConfig) -> Self {
        self.connection.flow = flow;
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    pub connection: ConnectionConfig,
    pub timeouts: ClientTimeouts,
}

impl ClientConfig {
    pub fn with_flow(mut self, flow: FlowControlConfig) -> Self {
        self.connection.flow = flow;
        self
    }

    pub fn with_timeouts(mut self, timeouts: ClientTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }
}
