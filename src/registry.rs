use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use dashmap::DashMap;
use uuid::Uuid;

/// A known cluster member.
///
/// Liveness and replication progress are plain atomic words so `touch` and
/// the leader's bookkeeping never block an RPC worker. `next_index` and
/// `match_index` are meaningful only while the local node is Leader.
#[derive(Debug)]
pub struct Member {
    pub id: Uuid,
    pub addr: String,
    pub is_remote: bool,
    last_contact_ms: AtomicU64,
    next_index: AtomicU64,
    match_index: AtomicU64,
    inflight: AtomicBool,
}

impl Member {
    pub fn new(id: Uuid, addr: String, is_remote: bool) -> Self {
        Self {
            id,
            addr,
            is_remote,
            last_contact_ms: AtomicU64::new(0),
            next_index: AtomicU64::new(1),
            match_index: AtomicU64::new(0),
            inflight: AtomicBool::new(false),
        }
    }

    /// Claims the single replication slot for this peer. A tick skips peers
    /// whose previous AppendEntries has not come back yet.
    pub fn try_begin_send(&self) -> bool {
        self.inflight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn end_send(&self) {
        self.inflight.store(false, Ordering::Release);
    }

    /// Records a successfully parsed RPC from this member.
    pub fn touch(&self) {
        self.last_contact_ms
            .store(Utc::now().timestamp_millis() as u64, Ordering::Release);
    }

    pub fn last_contact(&self) -> Option<DateTime<Utc>> {
        match self.last_contact_ms.load(Ordering::Acquire) {
            0 => None,
            ms => Utc.timestamp_millis_opt(ms as i64).single(),
        }
    }

    pub fn next_index(&self) -> u64 {
        self.next_index.load(Ordering::Acquire)
    }

    pub fn set_next_index(&self, index: u64) {
        self.next_index.store(index.max(1), Ordering::Release);
    }

    /// Log-mismatch backoff, bounded by 1.
    pub fn decrement_next_index(&self) {
        let current = self.next_index();
        if current > 1 {
            self.next_index.store(current - 1, Ordering::Release);
        }
    }

    pub fn match_index(&self) -> u64 {
        self.match_index.load(Ordering::Acquire)
    }

    pub fn set_match_index(&self, index: u64) {
        self.match_index.fetch_max(index, Ordering::AcqRel);
    }

    /// Reinitializes progress after an election win.
    pub fn reset_progress(&self, last_log_index: u64) {
        self.next_index.store(last_log_index + 1, Ordering::Release);
        self.match_index.store(0, Ordering::Release);
    }
}

/// The set of known peers, including the local node.
#[derive(Debug, Default)]
pub struct MemberRegistry {
    members: DashMap<Uuid, Arc<Member>>,
}

impl MemberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_get(&self, id: Uuid) -> Option<Arc<Member>> {
        self.members.get(&id).map(|m| m.value().clone())
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.members.contains_key(&id)
    }

    /// Updates the liveness timestamp of a known member. Unknown senders are
    /// ignored here; the dispatcher has already answered them with 404.
    pub fn touch(&self, id: Uuid) {
        if let Some(member) = self.members.get(&id) {
            member.touch();
        }
    }

    pub fn add_member(&self, member: Member) -> Arc<Member> {
        let member = Arc::new(member);
        self.members.insert(member.id, member.clone());
        member
    }

    pub fn remove_member(&self, id: Uuid) -> Option<Arc<Member>> {
        self.members.remove(&id).map(|(_, m)| m)
    }

    pub fn members(&self) -> Vec<Arc<Member>> {
        self.members.iter().map(|m| m.value().clone()).collect()
    }

    pub fn remote_members(&self) -> Vec<Arc<Member>> {
        self.members
            .iter()
            .filter(|m| m.value().is_remote)
            .map(|m| m.value().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Strict majority of the configured cluster.
    pub fn quorum(&self) -> usize {
        self.len() / 2 + 1
    }
}
