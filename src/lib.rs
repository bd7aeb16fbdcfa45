pub mod buffer;
pub mod bus;
pub mod cell;
pub mod config;
pub mod dedup;
pub mod error;
pub mod http;
pub mod node;
pub mod raft;
pub mod registry;
pub mod shutdown;

pub use bus::{AppMessage, DeliveryMode, LeaderRouter, MessageHandler, MessageReply};
pub use config::NodeConfig;
pub use error::{Error, Result};
pub use node::Node;
pub use raft::{RaftNode, RaftRole};
