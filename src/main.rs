use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::time::{self, Duration};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use ulak::{Node, NodeConfig};

#[derive(Parser, Debug)]
#[command(name = "ulak")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// UDP address to listen on.
    #[arg(short, long, default_value = "0.0.0.0:8080")]
    bind: SocketAddr,

    /// Directory for the private key and proof-of-space plot.
    #[arg(short, long, default_value = "data")]
    data_dir: PathBuf,

    /// Start as a genesis node (no bootstrap, wait for joiners).
    #[arg(long)]
    genesis: bool,

    /// Bootstrap peer address, required unless --genesis.
    #[arg(short = 'B', long, value_name = "IP:PORT")]
    bootstrap: Option<SocketAddr>,

    /// Disable the proof-of-space admission gate.
    #[arg(long)]
    no_pos: bool,

    /// Seconds between status log lines.
    #[arg(long, default_value = "300")]
    status_interval: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let mut config = NodeConfig::new(args.bind, args.data_dir);
    if args.no_pos {
        config.pos = None;
    }

    let node = Node::start(config).await?;
    info!(peer = %node.peer_id(), addr = %node.addr(), "node up");

    if args.genesis {
        info!("running as genesis node, waiting for joiners");
    } else {
        let bootstrap = args
            .bootstrap
            .context("a bootstrap address is required unless --genesis is set")?;
        info!(%bootstrap, "joining overlay");
        let contact = node
            .join_network(bootstrap)
            .await
            .map_err(|e| anyhow::anyhow!("failed to join overlay: {e}"))?;
        info!(
            bootstrap = &contact.id.to_hex()[..16],
            "overlay join complete"
        );
    }

    let mut interval = time::interval(Duration::from_secs(args.status_interval.max(1)));
    interval.tick().await;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown signal received, exiting");
                break;
            }
            _ = interval.tick() => {
                let status = node.status().await;
                info!(
                    stored_keys = status.stored_keys,
                    known_peers = status.known_peers,
                    buckets = status.bucket_occupancy.len(),
                    "status"
                );
                if status.known_peers == 0 && !args.genesis {
                    warn!("no known peers, overlay may be unreachable");
                }
            }
        }
    }

    Ok(())
}
