//! Receive-side HTTP/2 flow control (RFC 7540 Section 6.9).
//!
//! One [`WindowManager`] exists per connection. It owns the connection-level
//! receive window and the per-stream receive windows behind a single lock,
//! debits them as DATA arrives and credits them back when the application
//! consumes data or gives up on a stream. Credit that has been released but
//! not yet announced accumulates until it crosses the configured threshold
//! and is then handed back as [`WindowUpdate`]s for the connection to send.
//!
//! For the connection window the following always holds:
//!
//! ```text
//! initial == available + pending + unread + leaked
//! ```
//!
//! where `unread` is the sum of bytes buffered on live streams. `leaked` only
//! grows under [`ClosePolicy::LeakUnread`].

use crate::h2::connection::state::StreamState;
use crate::types::{ClosePolicy, FlowControlConfig, ProtocolError};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Credit to announce to the peer in a WINDOW_UPDATE frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowUpdate {
    pub stream_id: u32,
    pub increment: u32,
}

/// What the connection should do with a DATA payload after it was charged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataDisposition {
    /// Hand the payload to the stream's reader.
    Deliver,
    /// The stream is gone; the payload was dropped and its credit handled.
    Discarded,
    /// The peer already ended this stream; reset it with STREAM_CLOSED.
    StreamClosed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Received {
    pub disposition: DataDisposition,
    pub updates: Vec<WindowUpdate>,
}

/// Outcome of removing a stream from the manager.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Released {
    /// Unread bytes credited back to the connection window.
    pub returned: u32,
    /// Unread bytes dropped without credit (leak policy only).
    pub leaked: u32,
    pub updates: Vec<WindowUpdate>,
}

/// Cumulative accounting for the connection window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlowLedger {
    /// Bytes debited from the connection window by DATA frames.
    pub charged: u64,
    /// Bytes credited back (read, discarded or returned on close).
    pub released: u64,
    /// Bytes announced to the peer through WINDOW_UPDATE.
    pub announced: u64,
    /// Released bytes still waiting for the announce threshold.
    pub pending: u64,
    /// Bytes buffered on live streams.
    pub unread: u64,
    /// Bytes dropped without credit.
    pub leaked: u64,
    /// Connection credit currently available to the peer.
    pub available: u64,
}

impl FlowLedger {
    /// Charged bytes that have not been credited back yet.
    pub fn outstanding(&self) -> u64 {
        self.charged - self.released
    }

    /// Whether `initial == available + pending + unread + leaked` holds.
    pub fn is_balanced(&self, initial_window: u32) -> bool {
        self.available + self.pending + self.unread + self.leaked == initial_window as u64
    }
}

#[derive(Debug, Clone)]
struct RecvWindow {
    available: u32,
    pending: u32,
    threshold: u32,
}

impl RecvWindow {
    fn new(initial: u32, threshold: u32) -> Self {
        Self {
            available: initial,
            pending: 0,
            threshold,
        }
    }

    fn can_consume(&self, amount: u32) -> bool {
        self.available >= amount
    }

    fn consume(&mut self, amount: u32) {
        self.available -= amount;
    }

    /// Queues `amount` bytes of credit; returns the increment to announce once
    /// the pending total reaches the threshold.
    fn release(&mut self, amount: u32) -> Option<u32> {
        self.pending += amount;
        if self.pending == 0 || self.pending < self.threshold {
            return None;
        }
        Some(self.flush())
    }

    fn flush(&mut self) -> u32 {
        let increment = self.pending;
        self.available += increment;
        self.pending = 0;
        increment
    }
}

#[derive(Debug)]
struct RecvStream {
    state: StreamState,
    window: RecvWindow,
    unread: u32,
}

impl RecvStream {
    fn remote_open(&self) -> bool {
        matches!(self.state, StreamState::Open | StreamState::HalfClosedLocal)
    }
}

#[derive(Debug)]
struct Inner {
    connection: RecvWindow,
    streams: HashMap<u32, RecvStream>,
    highest_stream_id: u32,
    charged: u64,
    released: u64,
    announced: u64,
    leaked: u64,
}

impl Inner {
    fn release_connection(&mut self, amount: u32, updates: &mut Vec<WindowUpdate>) {
        self.released += amount as u64;
        if let Some(increment) = self.connection.release(amount) {
            self.announced += increment as u64;
            updates.push(WindowUpdate {
                stream_id: 0,
                increment,
            });
        }
    }

    fn charge_connection(&mut self, stream_id: u32, amount: u32) -> Result<(), ProtocolError> {
        if !self.connection.can_consume(amount) {
            return Err(ProtocolError::H2FlowControlError(format!(
                "stream {} sent {} bytes with {} bytes of connection credit left",
                stream_id, amount, self.connection.available
            )));
        }
        self.connection.consume(amount);
        self.charged += amount as u64;
        Ok(())
    }
}

pub struct WindowManager {
    config: FlowControlConfig,
    inner: Mutex<Inner>,
}

impl WindowManager {
    pub fn new(config: FlowControlConfig) -> Result<Self, ProtocolError> {
        config.validate()?;
        let connection = RecvWindow::new(
            config.initial_connection_window,
            config.connection_update_threshold(),
        );
        Ok(Self {
            config,
            inner: Mutex::new(Inner {
                connection,
                streams: HashMap::new(),
                highest_stream_id: 0,
                charged: 0,
                released: 0,
                announced: 0,
                leaked: 0,
            }),
        })
    }

    pub fn config(&self) -> &FlowControlConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The WINDOW_UPDATE that raises the peer's view of the connection window
    /// from the protocol default to the configured size, if they differ.
    pub fn initial_connection_update(&self) -> Option<WindowUpdate> {
        let extra = self
            .config
            .initial_connection_window
            .saturating_sub(crate::h2::consts::DEFAULT_INITIAL_WINDOW_SIZE);
        (extra > 0).then_some(WindowUpdate {
            stream_id: 0,
            increment: extra,
        })
    }

    /// Registers a stream whose request (server) or response (client) data
    /// will be received on this connection.
    pub fn open_stream(&self, stream_id: u32, end_stream: bool) -> Result<(), ProtocolError> {
        let mut inner = self.lock();
        if stream_id == 0 || stream_id <= inner.highest_stream_id {
            return Err(ProtocolError::H2ProtocolError(format!(
                "stream {} cannot be opened after stream {}",
                stream_id, inner.highest_stream_id
            )));
        }
        inner.highest_stream_id = stream_id;
        let state = if end_stream {
            StreamState::HalfClosedRemote
        } else {
            StreamState::Open
        };
        inner.streams.insert(
            stream_id,
            RecvStream {
                state,
                window: RecvWindow::new(
                    self.config.initial_stream_window,
                    self.config.stream_update_threshold(),
                ),
                unread: 0,
            },
        );
        tracing::trace!(stream_id, ?state, "stream opened");
        Ok(())
    }

    /// Debits `length` bytes of DATA from the stream and connection windows.
    pub fn on_data_received(&self, stream_id: u32, length: u32) -> Result<Received, ProtocolError> {
        let mut inner = self.lock();
        let mut updates = Vec::new();

        if stream_id == 0 {
            return Err(ProtocolError::H2ProtocolError(
                "DATA frame received on stream 0".to_string(),
            ));
        }

        let remote_open = match inner.streams.get(&stream_id) {
            Some(stream) => stream.remote_open(),
            None if stream_id > inner.highest_stream_id => {
                return Err(ProtocolError::H2ProtocolError(format!(
                    "DATA frame received on idle stream {}",
                    stream_id
                )));
            }
            None => {
                // Closed stream: the bytes still count against the connection.
                inner.charge_connection(stream_id, length)?;
                match self.config.close_policy {
                    ClosePolicy::ReturnCredit => inner.release_connection(length, &mut updates),
                    ClosePolicy::LeakUnread => inner.leaked += length as u64,
                }
                tracing::trace!(stream_id, length, "discarded DATA for closed stream");
                return Ok(Received {
                    disposition: DataDisposition::Discarded,
                    updates,
                });
            }
        };

        if !remote_open {
            inner.charge_connection(stream_id, length)?;
            inner.release_connection(length, &mut updates);
            return Ok(Received {
                disposition: DataDisposition::StreamClosed,
                updates,
            });
        }

        let stream_available = inner.streams[&stream_id].window.available;
        if stream_available < length {
            return Err(ProtocolError::H2FlowControlError(format!(
                "stream {} sent {} bytes with {} bytes of stream credit left",
                stream_id, length, stream_available
            )));
        }
        inner.charge_connection(stream_id, length)?;
        if let Some(stream) = inner.streams.get_mut(&stream_id) {
            stream.window.consume(length);
            stream.unread += length;
        }

        Ok(Received {
            disposition: DataDisposition::Deliver,
            updates,
        })
    }

    /// Credits `length` consumed bytes back to the stream and connection.
    ///
    /// Reads on a stream that was already removed are ignored: its unread
    /// bytes were credited when it was removed.
    pub fn on_application_read(
        &self,
        stream_id: u32,
        length: u32,
    ) -> Result<Vec<WindowUpdate>, ProtocolError> {
        let mut inner = self.lock();
        let mut updates = Vec::new();

        let Some(stream) = inner.streams.get_mut(&stream_id) else {
            return Ok(updates);
        };
        if length > stream.unread {
            return Err(ProtocolError::H2FlowControlError(format!(
                "stream {} read {} bytes but only {} are buffered",
                stream_id, length, stream.unread
            )));
        }
        stream.unread -= length;
        if stream.remote_open() {
            if let Some(increment) = stream.window.release(length) {
                updates.push(WindowUpdate {
                    stream_id,
                    increment,
                });
            }
        } else {
            // Nothing more will arrive; keep the books without announcing.
            stream.window.available += length;
        }

        inner.release_connection(length, &mut updates);
        Ok(updates)
    }

    /// Removes a stream the application stopped reading, crediting every
    /// received-but-unread byte back to the connection window. Calling it
    /// again for the same stream is a no-op.
    pub fn on_stream_closed_by_application(&self, stream_id: u32) -> Released {
        let released = self.remove_stream(stream_id, self.config.close_policy);
        if released.returned > 0 || released.leaked > 0 {
            tracing::debug!(
                stream_id,
                returned = released.returned,
                leaked = released.leaked,
                "stream closed with unread data"
            );
        }
        released
    }

    /// Removes a stream the peer reset. Buffered bytes are always returned.
    pub fn on_stream_reset(&self, stream_id: u32) -> Released {
        self.remove_stream(stream_id, ClosePolicy::ReturnCredit)
    }

    fn remove_stream(&self, stream_id: u32, policy: ClosePolicy) -> Released {
        let mut inner = self.lock();
        let Some(stream) = inner.streams.remove(&stream_id) else {
            return Released::default();
        };

        let mut released = Released::default();
        match policy {
            ClosePolicy::ReturnCredit => {
                released.returned = stream.unread;
                inner.release_connection(stream.unread, &mut released.updates);
            }
            ClosePolicy::LeakUnread => {
                released.leaked = stream.unread;
                inner.leaked += stream.unread as u64;
            }
        }
        released
    }

    /// The peer sent END_STREAM.
    pub fn on_remote_end(&self, stream_id: u32) {
        if let Some(stream) = self.lock().streams.get_mut(&stream_id) {
            stream.state = match stream.state {
                StreamState::Idle | StreamState::Open => StreamState::HalfClosedRemote,
                StreamState::HalfClosedLocal => StreamState::Closed,
                other => other,
            };
        }
    }

    /// We sent END_STREAM.
    pub fn on_local_end(&self, stream_id: u32) {
        if let Some(stream) = self.lock().streams.get_mut(&stream_id) {
            stream.state = match stream.state {
                StreamState::Idle | StreamState::Open => StreamState::HalfClosedLocal,
                StreamState::HalfClosedRemote => StreamState::Closed,
                other => other,
            };
        }
    }

    pub fn available_connection_credit(&self) -> u32 {
        self.lock().connection.available
    }

    pub fn available_stream_credit(&self, stream_id: u32) -> Option<u32> {
        self.lock()
            .streams
            .get(&stream_id)
            .map(|stream| stream.window.available)
    }

    pub fn stream_state(&self, stream_id: u32) -> StreamState {
        let inner = self.lock();
        match inner.streams.get(&stream_id) {
            Some(stream) => stream.state,
            None if stream_id > inner.highest_stream_id => StreamState::Idle,
            None => StreamState::Closed,
        }
    }

    /// Highest stream id ever opened on this connection.
    pub fn last_stream_id(&self) -> u32 {
        self.lock().highest_stream_id
    }

    pub fn active_streams(&self) -> usize {
        self.lock().streams.len()
    }

    /// Announces any pending connection credit regardless of the threshold.
    pub fn flush_connection(&self) -> Option<WindowUpdate> {
        let mut inner = self.lock();
        if inner.connection.pending == 0 {
            return None;
        }
        let increment = inner.connection.flush();
        inner.announced += increment as u64;
        Some(WindowUpdate {
            stream_id: 0,
            increment,
        })
    }

    pub fn ledger(&self) -> FlowLedger {
        let inner = self.lock();
        FlowLedger {
            charged: inner.charged,
            released: inner.released,
            announced: inner.announced,
            pending: inner.connection.pending as u64,
            unread: inner.streams.values().map(|s| s.unread as u64).sum(),
            leaked: inner.leaked,
            available: inner.connection.available as u64,
        }
    }
}

impl std::fmt::Debug for WindowManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WindowManager")
            .field("config", &self.config)
            .field("ledger", &self.ledger())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(window: u32) -> WindowManager {
        WindowManager::new(
            FlowControlConfig::default()
                .with_connection_window(window.max(65_535))
                .with_stream_window(window),
        )
        .unwrap()
    }

    #[test]
    fn data_debits_both_windows() {
        let wm = manager(65_535);
        wm.open_stream(1, false).unwrap();
        let received = wm.on_data_received(1, 1000).unwrap();
        assert_eq!(received.disposition, DataDisposition::Deliver);
        assert!(received.updates.is_empty());
        assert_eq!(wm.available_connection_credit(), 64_535);
        assert_eq!(wm.available_stream_credit(1), Some(64_535));
    }

    #[test]
    fn overrunning_stream_window_is_rejected_without_side_effects() {
        let wm = WindowManager::new(FlowControlConfig::default().with_stream_window(100)).unwrap();
        wm.open_stream(1, false).unwrap();
        let err = wm.on_data_received(1, 101).unwrap_err();
        assert!(matches!(err, ProtocolError::H2FlowControlError(_)));
        assert_eq!(wm.available_connection_credit(), 65_535);
        assert_eq!(wm.available_stream_credit(1), Some(100));
    }

    #[test]
    fn overrunning_connection_window_is_rejected() {
        let wm = manager(65_535);
        wm.open_stream(1, false).unwrap();
        wm.open_stream(3, false).unwrap();
        wm.on_data_received(1, 60_000).unwrap();
        assert!(wm.on_data_received(3, 6_000).is_err());
        assert_eq!(wm.available_connection_credit(), 5_535);
    }

    #[test]
    fn reads_announce_credit_once_threshold_is_crossed() {
        let wm = manager(65_535);
        wm.open_stream(1, false).unwrap();
        wm.on_data_received(1, 40_000).unwrap();

        assert!(wm.on_application_read(1, 30_000).unwrap().is_empty());
        let updates = wm.on_application_read(1, 10_000).unwrap();
        assert_eq!(
            updates,
            vec![
                WindowUpdate {
                    stream_id: 1,
                    increment: 40_000
                },
                WindowUpdate {
                    stream_id: 0,
                    increment: 40_000
                },
            ]
        );
        assert_eq!(wm.available_connection_credit(), 65_535);
    }

    #[test]
    fn reading_more_than_buffered_fails() {
        let wm = manager(65_535);
        wm.open_stream(1, false).unwrap();
        wm.on_data_received(1, 10).unwrap();
        assert!(wm.on_application_read(1, 11).is_err());
    }

    #[test]
    fn closing_unread_stream_returns_connection_credit() {
        let wm = manager(65_535);
        let before = wm.available_connection_credit();
        wm.open_stream(1, false).unwrap();
        wm.on_data_received(1, 65_535).unwrap();
        assert_eq!(wm.available_connection_credit(), 0);

        let released = wm.on_stream_closed_by_application(1);
        assert_eq!(released.returned, 65_535);
        assert_eq!(
            released.updates,
            vec![WindowUpdate {
                stream_id: 0,
                increment: 65_535
            }]
        );
        assert_eq!(wm.available_connection_credit(), before);
        assert_eq!(wm.stream_state(1), StreamState::Closed);
    }

    #[test]
    fn closing_twice_returns_credit_once() {
        let wm = manager(65_535);
        wm.open_stream(1, false).unwrap();
        wm.on_data_received(1, 500).unwrap();
        assert_eq!(wm.on_stream_closed_by_application(1).returned, 500);
        assert_eq!(wm.on_stream_closed_by_application(1), Released::default());
        let ledger = wm.ledger();
        assert_eq!(ledger.released, 500);
        assert!(ledger.is_balanced(65_535));
    }

    #[test]
    fn leak_policy_keeps_charge_outstanding() {
        let wm = WindowManager::new(
            FlowControlConfig::default().with_close_policy(ClosePolicy::LeakUnread),
        )
        .unwrap();
        wm.open_stream(1, false).unwrap();
        wm.on_data_received(1, 65_535).unwrap();
        let released = wm.on_stream_closed_by_application(1);
        assert_eq!(released.leaked, 65_535);
        assert!(released.updates.is_empty());
        assert_eq!(wm.available_connection_credit(), 0);
        assert_eq!(wm.ledger().outstanding(), 65_535);

        // The next stream starves.
        wm.open_stream(3, false).unwrap();
        assert!(wm.on_data_received(3, 1).is_err());
    }

    #[test]
    fn late_data_for_closed_stream_is_credited() {
        let wm = manager(65_535);
        wm.open_stream(1, false).unwrap();
        wm.on_stream_closed_by_application(1);

        let received = wm.on_data_received(1, 40_000).unwrap();
        assert_eq!(received.disposition, DataDisposition::Discarded);
        assert_eq!(
            received.updates,
            vec![WindowUpdate {
                stream_id: 0,
                increment: 40_000
            }]
        );
        let ledger = wm.ledger();
        assert_eq!(ledger.charged, ledger.released);
    }

    #[test]
    fn data_after_end_stream_is_flagged() {
        let wm = manager(65_535);
        wm.open_stream(1, true).unwrap();
        let received = wm.on_data_received(1, 10).unwrap();
        assert_eq!(received.disposition, DataDisposition::StreamClosed);
        assert_eq!(wm.ledger().outstanding(), 0);
    }

    #[test]
    fn data_on_idle_stream_is_a_protocol_error() {
        let wm = manager(65_535);
        assert!(matches!(
            wm.on_data_received(5, 1),
            Err(ProtocolError::H2ProtocolError(_))
        ));
        assert!(wm.on_data_received(0, 1).is_err());
    }

    #[test]
    fn stream_ids_must_increase() {
        let wm = manager(65_535);
        wm.open_stream(3, false).unwrap();
        assert!(wm.open_stream(1, false).is_err());
        assert!(wm.open_stream(3, false).is_err());
    }

    #[test]
    fn state_follows_both_directions() {
        let wm = manager(65_535);
        assert_eq!(wm.stream_state(1), StreamState::Idle);
        wm.open_stream(1, false).unwrap();
        wm.on_local_end(1);
        assert_eq!(wm.stream_state(1), StreamState::HalfClosedLocal);
        wm.on_remote_end(1);
        assert_eq!(wm.stream_state(1), StreamState::Closed);
    }

    #[test]
    fn reads_after_remote_end_do_not_announce_stream_credit() {
        let wm = manager(65_535);
        wm.open_stream(1, false).unwrap();
        wm.on_data_received(1, 50_000).unwrap();
        wm.on_remote_end(1);
        let updates = wm.on_application_read(1, 50_000).unwrap();
        assert_eq!(
            updates,
            vec![WindowUpdate {
                stream_id: 0,
                increment: 50_000
            }]
        );
        assert_eq!(wm.available_stream_credit(1), Some(65_535));
    }

    #[test]
    fn reset_returns_credit_even_under_leak_policy() {
        let wm = WindowManager::new(
            FlowControlConfig::default().with_close_policy(ClosePolicy::LeakUnread),
        )
        .unwrap();
        wm.open_stream(1, false).unwrap();
        wm.on_data_received(1, 100).unwrap();
        assert_eq!(wm.on_stream_reset(1).returned, 100);
        assert_eq!(wm.ledger().outstanding(), 0);
    }

    #[test]
    fn larger_connection_window_is_announced_up_front() {
        let wm = WindowManager::new(FlowControlConfig::default().with_connection_window(1 << 20))
            .unwrap();
        assert_eq!(
            wm.initial_connection_update(),
            Some(WindowUpdate {
                stream_id: 0,
                increment: (1 << 20) - 65_535
            })
        );
        assert_eq!(manager(65_535).initial_connection_update(), None);
    }

    #[test]
    fn flush_announces_sub_threshold_credit() {
        let wm = manager(65_535);
        wm.open_stream(1, false).unwrap();
        wm.on_data_received(1, 10).unwrap();
        assert!(wm.on_application_read(1, 10).unwrap().is_empty());
        assert_eq!(
            wm.flush_connection(),
            Some(WindowUpdate {
                stream_id: 0,
                increment: 10
            })
        );
        assert_eq!(wm.flush_connection(), None);
    }
}
