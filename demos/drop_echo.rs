//! Runs the drop+echo loop against a local h2c server and reports the
//! server's connection-window ledger after every cycle.
//!
//! Usage: cargo run --example drop_echo -- [cycles] [leak]
//! Pass `leak` to make the server drop unread credit and watch it stall.

use bytes::Bytes;
use riph2flow::handlers::{ReproHandler, DROP_PATH, ECHO_PATH, ECHO_PAYLOAD};
use riph2flow::utils::init_tracing;
use riph2flow::{
    ClientConfig, ClientTimeouts, ClosePolicy, FlowControlConfig, H2Client, H2Server, ServerConfig,
};
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let mut args = std::env::args().skip(1);
    let cycles: usize = args.next().map(|s| s.parse()).transpose()?.unwrap_or(100);
    let policy = match args.next().as_deref() {
        Some("leak") => ClosePolicy::LeakUnread,
        _ => ClosePolicy::ReturnCredit,
    };

    let flow = FlowControlConfig::default().with_close_policy(policy);
    let server = Arc::new(H2Server::bind("127.0.0.1:0", ServerConfig::default().with_flow(flow)).await?);
    let serving = Arc::clone(&server);
    tokio::spawn(async move { serving.serve(Arc::new(ReproHandler::default())).await });

    let timeouts = ClientTimeouts::default().with_request(Duration::from_secs(1));
    let client = H2Client::connect(
        &format!("http://{}", server.local_addr()),
        ClientConfig::default().with_timeouts(timeouts),
    )
    .await?;

    let payload = Bytes::from(vec![b'x'; 8 * 1024 * 1024]);
    for cycle in 0..cycles {
        let dropped = match client
            .post(DROP_PATH, "application/raw", payload.clone())
            .await
        {
            Ok(response) => response,
            Err(err) => {
                println!("cycle {}: drop failed: {}", cycle, err);
                break;
            }
        };
        let echoed = match client
            .post(ECHO_PATH, "application/json", ECHO_PAYLOAD)
            .await
        {
            Ok(response) => response,
            Err(err) => {
                println!("cycle {}: echo failed: {}", cycle, err);
                break;
            }
        };

        for stats in server.connection_stats() {
            println!(
                "cycle {:>3}: drop {} echo {} {:?} | credit {} pending {} leaked {}",
                cycle,
                dropped.status,
                echoed.status,
                echoed.text(),
                stats.available_credit,
                stats.ledger.pending,
                stats.ledger.leaked,
            );
        }
    }

    client.close().await?;
    server.shutdown();
    Ok(())
}
