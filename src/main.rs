//! spvnet: SPV client runtime demo node.
//!
//! Connects a session pool to the given wallet servers, follows the chain
//! tip through the master session, and optionally advertises it back out
//! over the UDP status protocol.

use clap::Parser;
use serde_json::Value;
use spvnet::{Ledger, NetConfig, Network, ServerEndpoint, StatusServer};
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "spvnet", version, about = "Multi-server SPV client runtime")]
struct Args {
    /// Wallet servers as host:port (comma-separated)
    #[arg(short, long, value_delimiter = ',', required = true)]
    servers: Vec<ServerEndpoint>,

    /// Connect timeout in seconds
    #[arg(long, default_value = "6")]
    connect_timeout: u64,

    /// Advertise chain state over the UDP status protocol on this port
    #[arg(long)]
    status_port: Option<u16>,

    /// Interface for the status endpoint
    #[arg(long, default_value = "0.0.0.0")]
    status_interface: String,
}

/// Stand-in ledger that just logs address status updates.
struct LogLedger;

impl Ledger for LogLedger {
    fn process_status_update(&self, session: Arc<spvnet::ClientSession>, args: Value) {
        info!("address status from {}: {}", session.server, args);
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("spvnet=info".parse().expect("static directive")),
        )
        .init();

    let args = Args::parse();

    let mut config = NetConfig::new(args.servers);
    config.connect_timeout = std::time::Duration::from_secs(args.connect_timeout);

    let network = Network::new(config, Arc::new(LogLedger));
    network.start().await;

    let status = Arc::new(StatusServer::new());
    let advertising = args.status_port.is_some();
    if let Some(port) = args.status_port {
        match status.start(&args.status_interface, port).await {
            Ok(bound) => {
                status.set_available();
                info!("status endpoint listening on {}", bound);
            }
            Err(e) => error!("failed to start status endpoint: {}", e),
        }
    }

    let follower = {
        let network = network.clone();
        let status = status.clone();
        let mut headers = network.on_header.subscribe();
        tokio::spawn(async move {
            loop {
                match headers.recv().await {
                    Ok(event) => {
                        let height = network.remote_height();
                        info!("chain tip moved: height {} ({})", height, event);
                        if advertising {
                            status.set_height(height, [0u8; 32]);
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!("dropped {} header events", n);
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    };

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("signal wait failed: {}", e);
    }
    info!("shutting down");
    follower.abort();
    status.stop();
    network.stop().await;
}
