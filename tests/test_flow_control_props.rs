use proptest::prelude::*;
use riph2flow::h2::flow_control::{DataDisposition, WindowManager, WindowUpdate};
use riph2flow::types::{ClosePolicy, FlowControlConfig, ProtocolError};

#[derive(Debug, Clone)]
enum Op {
    Open,
    Receive { stream: usize, len: u32 },
    Read { stream: usize, percent: u32 },
    Close { stream: usize },
    Reset { stream: usize },
    RemoteEnd { stream: usize },
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        1 => Just(Op::Open),
        4 => (any::<usize>(), 1u32..40_000).prop_map(|(stream, len)| Op::Receive { stream, len }),
        2 => (any::<usize>(), 0u32..=100).prop_map(|(stream, percent)| Op::Read { stream, percent }),
        1 => any::<usize>().prop_map(|stream| Op::Close { stream }),
        1 => any::<usize>().prop_map(|stream| Op::Reset { stream }),
        1 => any::<usize>().prop_map(|stream| Op::RemoteEnd { stream }),
    ]
}

fn config() -> impl Strategy<Value = FlowControlConfig> {
    (65_535u32..=1 << 20, 1_024u32..=1 << 18, 1u32..=8).prop_map(|(conn, stream, divisor)| {
        FlowControlConfig::default()
            .with_connection_window(conn)
            .with_stream_window(stream)
            .with_update_divisor(divisor)
    })
}

fn connection_increments(updates: &[WindowUpdate]) -> u64 {
    updates
        .iter()
        .filter(|u| u.stream_id == 0)
        .map(|u| u.increment as u64)
        .sum()
}

/// Drives `manager` through `ops` using only frames the peer may legally
/// send, and returns the connection credit announced along the way. The
/// connection ledger must balance after every step.
fn run(manager: &WindowManager, ops: &[Op]) -> (Vec<u32>, u64) {
    let initial = manager.config().initial_connection_window;
    let mut streams: Vec<u32> = Vec::new();
    let mut unread: Vec<u32> = Vec::new();
    let mut next_id = 1;
    let mut announced = 0u64;

    for op in ops {
        match *op {
            Op::Open => {
                manager.open_stream(next_id, false).unwrap();
                streams.push(next_id);
                unread.push(0);
                next_id += 2;
            }
            Op::Receive { stream, len } if !streams.is_empty() => {
                let idx = stream % streams.len();
                let id = streams[idx];
                let limit = manager
                    .available_stream_credit(id)
                    .unwrap_or(u32::MAX)
                    .min(manager.available_connection_credit());
                let len = len.min(limit);
                if len == 0 {
                    continue;
                }
                let received = manager.on_data_received(id, len).unwrap();
                announced += connection_increments(&received.updates);
                if received.disposition == DataDisposition::Deliver {
                    unread[idx] += len;
                }
            }
            Op::Read { stream, percent } if !streams.is_empty() => {
                let idx = stream % streams.len();
                let amount = (unread[idx] as u64 * percent as u64 / 100) as u32;
                let updates = manager.on_application_read(streams[idx], amount).unwrap();
                announced += connection_increments(&updates);
                unread[idx] -= amount;
            }
            Op::Close { stream } if !streams.is_empty() => {
                let idx = stream % streams.len();
                let released = manager.on_stream_closed_by_application(streams[idx]);
                announced += connection_increments(&released.updates);
                unread[idx] = 0;
            }
            Op::Reset { stream } if !streams.is_empty() => {
                let idx = stream % streams.len();
                let released = manager.on_stream_reset(streams[idx]);
                announced += connection_increments(&released.updates);
                unread[idx] = 0;
            }
            Op::RemoteEnd { stream } if !streams.is_empty() => {
                manager.on_remote_end(streams[stream % streams.len()]);
            }
            _ => {}
        }
        let ledger = manager.ledger();
        assert!(ledger.is_balanced(initial), "{:?} after {:?}", ledger, op);
    }
    (streams, announced)
}

proptest! {
    #[test]
    fn closing_every_stream_restores_the_connection_window(
        config in config(),
        ops in prop::collection::vec(op(), 1..200),
    ) {
        let initial = config.initial_connection_window;
        let manager = WindowManager::new(config).unwrap();
        let (streams, mut announced) = run(&manager, &ops);

        for stream_id in streams {
            let released = manager.on_stream_closed_by_application(stream_id);
            announced += connection_increments(&released.updates);
        }

        let ledger = manager.ledger();
        prop_assert_eq!(ledger.unread, 0);
        prop_assert_eq!(ledger.leaked, 0);
        prop_assert_eq!(ledger.charged, ledger.released);
        prop_assert_eq!(ledger.announced, announced);
        prop_assert!(ledger.is_balanced(initial));
        prop_assert_eq!(manager.active_streams(), 0);

        if let Some(update) = manager.flush_connection() {
            prop_assert_eq!(update.stream_id, 0);
        }
        prop_assert_eq!(manager.available_connection_credit(), initial);
    }

    #[test]
    fn data_beyond_the_window_is_rejected(
        config in config(),
        excess in 1u32..10_000,
    ) {
        let manager = WindowManager::new(config.clone()).unwrap();
        manager.open_stream(1, false).unwrap();
        let limit = config.initial_stream_window.min(config.initial_connection_window);

        let err = manager.on_data_received(1, limit + excess).unwrap_err();
        prop_assert!(matches!(err, ProtocolError::H2FlowControlError(_)));
        prop_assert_eq!(manager.ledger().charged, 0);
        prop_assert_eq!(manager.available_connection_credit(), config.initial_connection_window);
    }

    #[test]
    fn leak_policy_loses_exactly_the_unread_bytes(
        len in 1u32..65_535,
        read in 0u32..65_535,
    ) {
        let read = read.min(len);
        let config = FlowControlConfig::default().with_close_policy(ClosePolicy::LeakUnread);
        let manager = WindowManager::new(config).unwrap();
        manager.open_stream(1, false).unwrap();
        manager.on_data_received(1, len).unwrap();
        manager.on_application_read(1, read).unwrap();

        let released = manager.on_stream_closed_by_application(1);
        prop_assert_eq!(released.leaked, len - read);
        prop_assert_eq!(released.returned, 0);
        let ledger = manager.ledger();
        prop_assert_eq!(ledger.leaked, (len - read) as u64);
        prop_assert!(ledger.is_balanced(65_535));
    }
}
