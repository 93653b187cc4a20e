//! Flow-control benchmarks.
//!
//! Covers the per-frame window bookkeeping, the early-close release path and a
//! full drop+echo cycle over loopback.
//!
//! Run with: `cargo bench --bench flow_control_benchmarks`

use bytes::Bytes;
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use riph2flow::h2::flow_control::WindowManager;
use riph2flow::handlers::{ReproHandler, DROP_PATH, ECHO_PATH, ECHO_PAYLOAD};
use riph2flow::{ClientConfig, FlowControlConfig, H2Client, H2Server, ServerConfig};
use std::hint::black_box;
use std::sync::Arc;

/// Benchmark receive-then-read accounting for one DATA frame
fn bench_receive_and_read(c: &mut Criterion) {
    let mut group = c.benchmark_group("receive_and_read");

    for size in [1_024u32, 16_384, 65_535] {
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            let manager = WindowManager::new(FlowControlConfig::default()).unwrap();
            let mut stream_id = 1;
            b.iter(|| {
                manager.open_stream(stream_id, false).unwrap();
                black_box(manager.on_data_received(stream_id, size).unwrap());
                black_box(manager.on_application_read(stream_id, size).unwrap());
                manager.on_stream_closed_by_application(stream_id);
                stream_id += 2;
            });
        });
    }

    group.finish();
}

/// Benchmark closing a stream with its whole window unread
fn bench_close_unread(c: &mut Criterion) {
    c.bench_function("close_unread_stream", |b| {
        let manager = WindowManager::new(FlowControlConfig::default()).unwrap();
        let mut stream_id = 1;
        b.iter(|| {
            manager.open_stream(stream_id, false).unwrap();
            manager.on_data_received(stream_id, 65_535).unwrap();
            black_box(manager.on_stream_closed_by_application(stream_id));
            stream_id += 2;
        });
    });
}

/// Benchmark one drop+echo cycle on a persistent loopback connection
fn bench_drop_echo_cycle(c: &mut Criterion) {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap();

    let (server, client) = runtime.block_on(async {
        let server = Arc::new(
            H2Server::bind("127.0.0.1:0", ServerConfig::default())
                .await
                .unwrap(),
        );
        let serving = Arc::clone(&server);
        tokio::spawn(async move { serving.serve(Arc::new(ReproHandler::default())).await });
        let client = H2Client::connect(
            &format!("http://{}", server.local_addr()),
            ClientConfig::default(),
        )
        .await
        .unwrap();
        (server, client)
    });

    let payload = Bytes::from(vec![b'x'; 1 << 20]);
    c.bench_function("drop_echo_cycle", |b| {
        b.iter(|| {
            runtime.block_on(async {
                let dropped = client
                    .post(DROP_PATH, "application/raw", payload.clone())
                    .await
                    .unwrap();
                let echoed = client
                    .post(ECHO_PATH, "application/json", ECHO_PAYLOAD)
                    .await
                    .unwrap();
                black_box((dropped.status, echoed.body));
            })
        });
    });

    server.shutdown();
}

criterion_group!(
    benches,
    bench_receive_and_read,
    bench_close_unread,
    bench_drop_echo_cycle
);
criterion_main!(benches);
