//! Echo client: sends a few lines and prints what comes back
//!
//! # Usage
//!
//! ```bash
//! cargo run --example echo_server &
//! cargo run --example echo_client -- tcp://127.0.0.1:3030
//! ```

use std::time::Duration;

use gonet::{Client, Configure};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if let Err(e) = run().await {
        error!(error = %e, "Client failed");
        std::process::exit(1);
    }
}

async fn run() -> gonet::Result<()> {
    let url = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "tcp://127.0.0.1:3030".to_string());

    let (tx, mut rx) = mpsc::unbounded_channel();
    let client = Client::new();
    client
        .set_send_timeout(Some(Duration::from_secs(3)))
        .set_receive_cb(move |_, data| {
            let _ = tx.send(String::from_utf8_lossy(data).into_owned());
            data.len()
        });

    client.connect(&url).await?;
    info!(local = %client.local_addr(), remote = %client.remote_addr(), "Connected");

    for i in 1..=3 {
        let line = format!("message {}\n", i);
        client.send_no_delay_slice(
            line.as_bytes(),
            Some(Box::new(move |result| {
                if let Err(e) = result {
                    warn!(seq = i, error = %e, "Send failed");
                }
            })),
        );

        match tokio::time::timeout(Duration::from_secs(3), rx.recv()).await {
            Ok(Some(reply)) => info!(reply = reply.trim_end(), "Echoed"),
            _ => warn!(seq = i, "No reply"),
        }
    }

    client.shutdown();
    Ok(())
}
