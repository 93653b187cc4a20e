//! Send-side flow control: the credit the peer has granted us.
//!
//! Senders call [`SendFlow::reserve`] before every DATA frame. When either
//! window is exhausted the call parks until a WINDOW_UPDATE arrives, or fails
//! as soon as the stream or connection closes so a closing peer never leaves
//! a writer stuck.

use crate::h2::consts::{DEFAULT_INITIAL_WINDOW_SIZE, MAX_WINDOW_SIZE};
use crate::types::{H2ConnectionErrorKind, H2StreamErrorKind, ProtocolError};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;

#[derive(Debug)]
struct SendInner {
    // Windows can go negative after a SETTINGS_INITIAL_WINDOW_SIZE decrease.
    connection: i64,
    initial_stream: i64,
    streams: HashMap<u32, i64>,
    closed: bool,
}

#[derive(Debug)]
pub struct SendFlow {
    inner: Mutex<SendInner>,
    notify: Notify,
}

impl Default for SendFlow {
    fn default() -> Self {
        Self::new()
    }
}

impl SendFlow {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(SendInner {
                connection: DEFAULT_INITIAL_WINDOW_SIZE as i64,
                initial_stream: DEFAULT_INITIAL_WINDOW_SIZE as i64,
                streams: HashMap::new(),
                closed: false,
            }),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SendInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn open_stream(&self, stream_id: u32) {
        let mut inner = self.lock();
        let initial = inner.initial_stream;
        inner.streams.insert(stream_id, initial);
    }

    /// Stops sending on a stream and wakes any writer parked on it.
    pub fn close_stream(&self, stream_id: u32) {
        if self.lock().streams.remove(&stream_id).is_some() {
            self.notify.notify_waiters();
        }
    }

    pub fn close_connection(&self) {
        self.lock().closed = true;
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Waits until at least one byte may be sent on `stream_id`, then debits
    /// up to `wanted` bytes from both windows and returns the amount granted.
    pub async fn reserve(&self, stream_id: u32, wanted: usize) -> Result<usize, ProtocolError> {
        if wanted == 0 {
            return Ok(0);
        }

        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking so an update between the check and the
            // await is not lost.
            notified.as_mut().enable();

            if let Some(granted) = self.try_reserve(stream_id, wanted)? {
                return Ok(granted);
            }
            tracing::trace!(stream_id, wanted, "waiting for send credit");
            notified.await;
        }
    }

    fn try_reserve(&self, stream_id: u32, wanted: usize) -> Result<Option<usize>, ProtocolError> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(H2ConnectionErrorKind::Closed.into());
        }
        let connection = inner.connection;
        let Some(stream) = inner.streams.get_mut(&stream_id) else {
            return Err(H2StreamErrorKind::StreamClosed.into());
        };

        let available = connection.min(*stream);
        if available <= 0 {
            return Ok(None);
        }
        let granted = (wanted as i64).min(available);
        *stream -= granted;
        inner.connection -= granted;
        Ok(Some(granted as usize))
    }

    pub fn on_window_update(&self, stream_id: u32, increment: u32) -> Result<(), ProtocolError> {
        {
            let mut inner = self.lock();
            if stream_id == 0 {
                let window = inner.connection + increment as i64;
                if window > MAX_WINDOW_SIZE as i64 {
                    return Err(ProtocolError::H2FlowControlError(format!(
                        "connection send window overflow: {}",
                        window
                    )));
                }
                inner.connection = window;
            } else if let Some(stream) = inner.streams.get_mut(&stream_id) {
                let window = *stream + increment as i64;
                if window > MAX_WINDOW_SIZE as i64 {
                    return Err(H2StreamErrorKind::FlowControlViolation.into());
                }
                *stream = window;
            }
            // Updates for streams we already finished are legal and ignored.
        }
        self.notify.notify_waiters();
        Ok(())
    }

    /// Applies a new SETTINGS_INITIAL_WINDOW_SIZE from the peer to every open
    /// stream (RFC 7540 Section 6.9.2).
    pub fn on_initial_window_size(&self, value: u32) -> Result<(), ProtocolError> {
        if value > MAX_WINDOW_SIZE {
            return Err(ProtocolError::H2FlowControlError(format!(
                "INITIAL_WINDOW_SIZE {} exceeds maximum",
                value
            )));
        }
        {
            let mut inner = self.lock();
            let delta = value as i64 - inner.initial_stream;
            if inner
                .streams
                .values()
                .any(|window| window + delta > MAX_WINDOW_SIZE as i64)
            {
                return Err(ProtocolError::H2FlowControlError(
                    "INITIAL_WINDOW_SIZE change overflows a stream window".to_string(),
                ));
            }
            for window in inner.streams.values_mut() {
                *window += delta;
            }
            inner.initial_stream = value as i64;
        }
        self.notify.notify_waiters();
        Ok(())
    }

    pub fn connection_window(&self) -> i64 {
        self.lock().connection
    }

    pub fn stream_window(&self, stream_id: u32) -> Option<i64> {
        self.lock().streams.get(&stream_id).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_pending, assert_ready, task};

    #[tokio::test]
    async fn reserve_grants_up_to_the_smaller_window() {
        let flow = SendFlow::new();
        flow.open_stream(1);
        assert_eq!(flow.reserve(1, 100_000).await.unwrap(), 65_535);
        assert_eq!(flow.connection_window(), 0);
        assert_eq!(flow.stream_window(1), Some(0));
    }

    #[test]
    fn exhausted_window_parks_until_update() {
        let flow = SendFlow::new();
        flow.open_stream(1);
        flow.on_initial_window_size(10).unwrap();

        let mut first = task::spawn(flow.reserve(1, 10));
        assert_eq!(assert_ready!(first.poll()).unwrap(), 10);

        let mut blocked = task::spawn(flow.reserve(1, 5));
        assert_pending!(blocked.poll());

        flow.on_window_update(1, 3).unwrap();
        assert!(blocked.is_woken());
        assert_eq!(assert_ready!(blocked.poll()).unwrap(), 3);
    }

    #[test]
    fn closing_stream_cancels_pending_reserve() {
        let flow = SendFlow::new();
        flow.open_stream(1);
        flow.on_initial_window_size(0).unwrap();

        let mut blocked = task::spawn(flow.reserve(1, 5));
        assert_pending!(blocked.poll());

        flow.close_stream(1);
        assert!(blocked.is_woken());
        assert!(matches!(
            assert_ready!(blocked.poll()),
            Err(ProtocolError::H2StreamError(H2StreamErrorKind::StreamClosed))
        ));
    }

    #[test]
    fn closing_connection_cancels_pending_reserve() {
        let flow = SendFlow::new();
        flow.open_stream(1);
        flow.open_stream(3);
        assert_eq!(
            assert_ready!(task::spawn(flow.reserve(1, 65_535)).poll()).unwrap(),
            65_535
        );

        let mut blocked = task::spawn(flow.reserve(3, 1));
        assert_pending!(blocked.poll());

        flow.close_connection();
        assert!(matches!(
            assert_ready!(blocked.poll()),
            Err(ProtocolError::H2ConnectionError(H2ConnectionErrorKind::Closed))
        ));
    }

    #[test]
    fn connection_window_overflow_is_an_error() {
        let flow = SendFlow::new();
        assert!(flow.on_window_update(0, MAX_WINDOW_SIZE).is_err());
        assert_eq!(flow.connection_window(), 65_535);
    }

    #[test]
    fn settings_decrease_can_make_stream_window_negative() {
        let flow = SendFlow::new();
        flow.open_stream(1);
        assert_eq!(
            assert_ready!(task::spawn(flow.reserve(1, 60_000)).poll()).unwrap(),
            60_000
        );
        flow.on_initial_window_size(1_000).unwrap();
        assert_eq!(flow.stream_window(1), Some(-59_000));
    }

    #[test]
    fn unknown_stream_updates_are_ignored() {
        let flow = SendFlow::new();
        assert!(flow.on_window_update(7, 10).is_ok());
        assert_eq!(flow.stream_window(7), None);
    }
}
