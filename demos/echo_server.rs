//! Echo server over any supported transport
//!
//! # Usage
//!
//! ```bash
//! # Plain TCP on the default port
//! cargo run --example echo_server
//!
//! # UDP, with debug logging
//! RUST_LOG=gonet=debug cargo run --example echo_server -- udp://0.0.0.0:3030
//!
//! # TLS
//! cargo run --example echo_server -- ssl://0.0.0.0:3031 cert.pem key.pem
//! ```

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use gonet::{Configure, Server, TlsOptions};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(true)
        .init();

    if let Err(e) = run().await {
        error!(error = %e, "Server failed");
        std::process::exit(1);
    }
}

async fn run() -> gonet::Result<()> {
    let mut args = std::env::args().skip(1);
    let url = args.next().unwrap_or_else(|| "tcp://0.0.0.0:3030".to_string());
    let cert = args.next().map(PathBuf::from);
    let key = args.next().map(PathBuf::from);

    let echoed = Arc::new(AtomicUsize::new(0));
    let counter = echoed.clone();

    let mut server = Server::new();
    server
        .set_tls_options(TlsOptions {
            certificate_chain_file: cert,
            private_key_file: key,
            ..Default::default()
        })
        .set_connected_cb(|session| info!(peer = %session.remote_addr(), "Connected"))
        .set_disconnected_cb(|session, reason| {
            info!(peer = %session.remote_addr(), reason = %reason, "Disconnected")
        })
        .set_receive_cb(move |session, data| {
            counter.fetch_add(data.len(), Ordering::Relaxed);
            session.send_slice(data, None);
            data.len()
        });

    server.start(&url).await?;
    info!(local_addr = %server.local_addr(), "Echo server ready, Ctrl-C to stop");

    let _ = tokio::signal::ctrl_c().await;
    server.shutdown();
    info!(bytes = echoed.load(Ordering::Relaxed), "Echo server stopped");
    Ok(())
}
