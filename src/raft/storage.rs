use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::error::Result;
use crate::raft::state::LogEntry;

/// Durable storage for the Raft log and the (term, voted_for) pair.
///
/// The runtime only depends on this contract; the node terminates on any
/// storage failure rather than trying to recover a corrupt log. Entries are
/// handed over as complete batches so a cancelled append never leaves a
/// partially persisted suffix.
#[async_trait]
pub trait LogStore: Send + Sync {
    /// Persists the vote pair. Ordered before any vote response leaves the
    /// node.
    async fn persist_vote(&self, term: u64, voted_for: Option<Uuid>) -> Result<()>;

    /// Last persisted vote pair, `(0, None)` for a fresh store.
    async fn load_vote(&self) -> Result<(u64, Option<Uuid>)>;

    /// Appends a batch of entries, replacing any previously stored suffix
    /// that starts at the batch's first index.
    async fn append(&self, entries: &[LogEntry]) -> Result<()>;

    /// Drops entries at and below `index`, typically after a snapshot.
    async fn compact_through(&self, index: u64) -> Result<()>;

    /// All stored entries, oldest first.
    async fn entries(&self) -> Result<Vec<LogEntry>>;
}

/// A point-in-time state machine image replacing the log prefix through
/// `last_included_index`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub last_included_index: u64,
    pub last_included_term: u64,
    pub data: Bytes,
}

#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn save(&self, snapshot: Snapshot) -> Result<()>;
    async fn load(&self) -> Result<Option<Snapshot>>;
}

/// In-memory log store. The default wiring and the test double; a durable
/// store slots in through the same contract.
#[derive(Debug, Default)]
pub struct MemoryLogStore {
    inner: Mutex<MemoryLogInner>,
}

#[derive(Debug, Default)]
struct MemoryLogInner {
    term: u64,
    voted_for: Option<Uuid>,
    entries: Vec<LogEntry>,
}

impl MemoryLogStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LogStore for MemoryLogStore {
    async fn persist_vote(&self, term: u64, voted_for: Option<Uuid>) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.term = term;
        inner.voted_for = voted_for;
        Ok(())
    }

    async fn load_vote(&self) -> Result<(u64, Option<Uuid>)> {
        let inner = self.inner.lock();
        Ok((inner.term, inner.voted_for))
    }

    async fn append(&self, entries: &[LogEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut inner = self.inner.lock();
        let first = entries[0].index;
        inner.entries.retain(|e| e.index < first);
        inner.entries.extend_from_slice(entries);
        Ok(())
    }

    async fn compact_through(&self, index: u64) -> Result<()> {
        self.inner.lock().entries.retain(|e| e.index > index);
        Ok(())
    }

    async fn entries(&self) -> Result<Vec<LogEntry>> {
        Ok(self.inner.lock().entries.clone())
    }
}

/// In-memory snapshot store.
#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    snapshot: Mutex<Option<Snapshot>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn save(&self, snapshot: Snapshot) -> Result<()> {
        *self.snapshot.lock() = Some(snapshot);
        Ok(())
    }

    async fn load(&self) -> Result<Option<Snapshot>> {
        Ok(self.snapshot.lock().clone())
    }
}
