pub mod node;
pub mod replication;
pub mod rpc;
pub mod state;
pub mod storage;
pub mod timer;

pub use node::RaftNode;
pub use state::{EntryKind, LogEntry, RaftRole, RaftState};
pub use storage::{LogStore, MemoryLogStore, MemorySnapshotStore, Snapshot, SnapshotStore};
