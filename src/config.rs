use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

use uuid::Uuid;

/// Configuration for a single cluster node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Node identity. Generated at startup when absent.
    pub member_id: Uuid,
    pub listen_addr: SocketAddr,
    pub peers: Vec<PeerConfig>,
    pub election_timeout_min_ms: u64,
    pub election_timeout_max_ms: u64,
    pub heartbeat_interval_ms: u64,
    /// Per-Raft-RPC deadline for outbound calls.
    pub raft_rpc_timeout_ms: u64,
    /// CIDR ACL for RPC ingress. Empty means no filtering.
    pub allowed_networks: Vec<CidrBlock>,
    /// When set, inbound entry/snapshot payloads are staged in a scratch
    /// buffer before log handoff.
    pub buffering: Option<BufferingOptions>,
    /// Retention window of the duplicate request detector.
    pub duplicate_detector_capacity: usize,
    /// Period of the discovery announce broadcast. Zero disables it.
    pub announce_interval_ms: u64,
}

#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub member_id: Uuid,
    pub addr: String, // host:port format, supports both IP and hostnames
}

/// Buffering policy for inbound replication payloads.
///
/// Payloads shorter than `memory_threshold` stay in memory; longer ones are
/// staged in a temp file so network reception is decoupled from log fsync
/// latency.
#[derive(Debug, Clone)]
pub struct BufferingOptions {
    pub memory_threshold: usize,
}

impl Default for BufferingOptions {
    fn default() -> Self {
        Self {
            memory_threshold: 64 * 1024,
        }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            member_id: Uuid::new_v4(),
            listen_addr: "127.0.0.1:8090".parse().unwrap(),
            peers: Vec::new(),
            election_timeout_min_ms: 150,
            election_timeout_max_ms: 300,
            heartbeat_interval_ms: 50,
            raft_rpc_timeout_ms: 100,
            allowed_networks: Vec::new(),
            buffering: None,
            duplicate_detector_capacity: 1000,
            announce_interval_ms: 0,
        }
    }
}

impl NodeConfig {
    pub fn new(member_id: Uuid, listen_addr: SocketAddr) -> Self {
        Self {
            member_id,
            listen_addr,
            ..Default::default()
        }
    }

    pub fn with_peer(mut self, member_id: Uuid, addr: String) -> Self {
        self.peers.push(PeerConfig { member_id, addr });
        self
    }

    pub fn raft_rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.raft_rpc_timeout_ms)
    }

    /// True when `ip` may reach the RPC dispatcher. An empty ACL admits
    /// everyone.
    pub fn network_allowed(&self, ip: IpAddr) -> bool {
        self.allowed_networks.is_empty() || self.allowed_networks.iter().any(|n| n.contains(ip))
    }
}

/// A CIDR block such as `10.0.0.0/8` or `fd00::/8`. A bare address is the
/// /32 (or /128) block containing only itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CidrBlock {
    network: IpAddr,
    prefix_len: u8,
}

impl CidrBlock {
    pub fn new(network: IpAddr, prefix_len: u8) -> Option<Self> {
        let max = match network {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        (prefix_len <= max).then_some(Self {
            network,
            prefix_len,
        })
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.network, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let shift = 32 - self.prefix_len as u32;
                if shift >= 32 {
                    return true;
                }
                (u32::from(net) >> shift) == (u32::from(ip) >> shift)
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let shift = 128 - self.prefix_len as u32;
                if shift >= 128 {
                    return true;
                }
                (u128::from(net) >> shift) == (u128::from(ip) >> shift)
            }
            _ => false,
        }
    }
}

impl FromStr for CidrBlock {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, prefix) = match s.split_once('/') {
            Some((addr, prefix)) => {
                let prefix: u8 = prefix
                    .parse()
                    .map_err(|_| format!("invalid prefix length in {s:?}"))?;
                (addr, Some(prefix))
            }
            None => (s, None),
        };
        let network: IpAddr = addr
            .parse()
            .map_err(|_| format!("invalid network address in {s:?}"))?;
        let prefix_len = prefix.unwrap_or(match network {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        });
        CidrBlock::new(network, prefix_len).ok_or_else(|| format!("prefix too long in {s:?}"))
    }
}
