use clap::Parser;
use std::net::SocketAddr;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use raftbus::config::{CidrBlock, NodeConfig, PeerConfig};
use raftbus::node::Node;
use raftbus::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "raftbus")]
#[command(about = "A Raft cluster consensus runtime with an HTTP message bus overlay")]
struct Args {
    /// Node identity (UUID). Generated when omitted.
    #[arg(long)]
    member_id: Option<Uuid>,

    /// Port to listen on for cluster messages
    #[arg(long, default_value = "8090")]
    port: u16,

    /// Peer list (comma-separated, format: "uuid@host:port")
    #[arg(long, default_value = "")]
    peers: String,

    /// Allowed ingress networks (comma-separated CIDR blocks). Empty admits
    /// everyone.
    #[arg(long, default_value = "")]
    allowed_networks: String,

    /// Announce broadcast period in milliseconds (0 disables)
    #[arg(long, default_value = "0")]
    announce_interval_ms: u64,
}

fn parse_peers(peers_str: &str) -> Vec<PeerConfig> {
    if peers_str.is_empty() {
        return Vec::new();
    }

    peers_str
        .split(',')
        .filter_map(|peer| {
            let (id, addr) = peer.trim().split_once('@')?;
            match id.parse::<Uuid>() {
                Ok(member_id) => Some(PeerConfig {
                    member_id,
                    addr: addr.to_string(),
                }),
                Err(_) => {
                    tracing::warn!(peer, "Invalid peer format, expected uuid@host:port");
                    None
                }
            }
        })
        .collect()
}

fn parse_networks(networks_str: &str) -> Vec<CidrBlock> {
    networks_str
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter_map(|s| match s.parse() {
            Ok(block) => Some(block),
            Err(e) => {
                tracing::warn!(network = s, error = %e, "Ignoring invalid CIDR block");
                None
            }
        })
        .collect()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let listen_addr: SocketAddr = format!("0.0.0.0:{}", args.port).parse()?;
    let config = NodeConfig {
        member_id: args.member_id.unwrap_or_else(Uuid::new_v4),
        listen_addr,
        peers: parse_peers(&args.peers),
        allowed_networks: parse_networks(&args.allowed_networks),
        announce_interval_ms: args.announce_interval_ms,
        ..Default::default()
    };

    tracing::info!(
        member_id = %config.member_id,
        listen_addr = %config.listen_addr,
        peers = config.peers.len(),
        "Starting raftbus node"
    );

    let lifecycle = install_shutdown_handler();
    let node = Node::new(config, lifecycle);
    node.run().await?;

    Ok(())
}
