use anyhow::Result;
use clap::Parser;
use tokio::time::{self, Duration};
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use floodmesh::{Node, NodeConfig, NodeId};

#[derive(Parser, Debug)]
#[command(name = "floodmesh")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// UDP port to listen on (0 picks an ephemeral port).
    #[arg(short, long, default_value = "0")]
    port: u16,

    /// Reachable host address; auto-detected when omitted.
    #[arg(long)]
    host: Option<String>,

    /// Membership capacity (0 means unbounded).
    #[arg(short, long, default_value = "10")]
    max_peers: usize,

    /// Seed peer, repeatable (format: HOST:PORT).
    #[arg(short = 'P', long = "peer", value_name = "PEER")]
    peers: Vec<NodeId>,

    /// Seconds between status log lines.
    #[arg(short, long, default_value = "60")]
    status_interval: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    let node = Node::bind(NodeConfig {
        max_peers: args.max_peers,
        port: args.port,
        host: args.host,
        ..NodeConfig::default()
    })
    .await?;
    info!("Node identity: {}", node.local_id());

    for peer in &args.peers {
        if node.add_peer(&peer.host, peer.port).await {
            info!("Seeded peer {}", peer);
        }
    }

    node.start().await?;

    let mut interval = time::interval(Duration::from_secs(args.status_interval));

    // Graceful shutdown on Ctrl+C
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal, exiting gracefully");
                break;
            }
            _ = interval.tick() => {
                let mut peers = node.peer_ids().await;
                peers.sort();
                info!(peer_count = peers.len(), peers = ?peers, "membership status");
            }
        }
    }

    node.shutdown().await;
    Ok(())
}
