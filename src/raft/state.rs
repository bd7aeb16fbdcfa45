use std::collections::HashSet;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Raft node role.
///
/// `Standby` is the pre-start quiescent role: the node answers RPCs with its
/// current term but participates in no elections until it is activated by a
/// first legitimate RPC or a manual start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RaftRole {
    Standby,
    Follower,
    Candidate,
    Leader,
}

impl RaftRole {
    /// Stable numeric tag, mirrored into an atomic cell for lock-free reads.
    pub fn tag(self) -> u64 {
        match self {
            RaftRole::Standby => 0,
            RaftRole::Follower => 1,
            RaftRole::Candidate => 2,
            RaftRole::Leader => 3,
        }
    }

    pub fn from_tag(tag: u64) -> Self {
        match tag {
            1 => RaftRole::Follower,
            2 => RaftRole::Candidate,
            3 => RaftRole::Leader,
            _ => RaftRole::Standby,
        }
    }
}

impl std::fmt::Display for RaftRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RaftRole::Standby => write!(f, "standby"),
            RaftRole::Follower => write!(f, "follower"),
            RaftRole::Candidate => write!(f, "candidate"),
            RaftRole::Leader => write!(f, "leader"),
        }
    }
}

/// What a log entry carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    /// Application payload routed through the message bus.
    User,
    /// Cluster membership change.
    Configuration,
    /// Appended by a fresh leader so its term has a committable entry.
    Noop,
}

/// A single entry in the replicated log. Immutable once assigned an index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: u64,
    pub index: u64,
    pub kind: EntryKind,
    #[serde(with = "payload_bytes")]
    pub payload: Bytes,
}

impl LogEntry {
    pub fn noop(term: u64, index: u64) -> Self {
        Self {
            term,
            index,
            kind: EntryKind::Noop,
            payload: Bytes::new(),
        }
    }
}

/// Base64 body so entry payloads survive JSON framing untouched.
pub(crate) mod payload_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD
            .decode(s)
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}

/// Volatile and persistent Raft state for one node.
///
/// Role transitions are the only mutation path for `role`; the owning
/// `RaftNode` serializes them through its write lock so that "observe higher
/// term, step down, clear voted_for" is one atomic step.
#[derive(Debug)]
pub struct RaftState {
    // Persistent state
    pub current_term: u64,
    pub voted_for: Option<Uuid>,
    pub log: Vec<LogEntry>,
    /// Index covered by the latest snapshot; entries at or below it have
    /// been truncated from `log`.
    pub snapshot_last_index: u64,
    pub snapshot_last_term: u64,

    // Volatile state
    pub commit_index: u64,
    pub last_applied: u64,
    pub role: RaftRole,
    pub leader_hint: Option<Uuid>,
    pub votes_received: HashSet<Uuid>,
    pub pre_votes_received: HashSet<Uuid>,
}

impl RaftState {
    pub fn new() -> Self {
        Self {
            current_term: 0,
            voted_for: None,
            log: Vec::new(),
            snapshot_last_index: 0,
            snapshot_last_term: 0,
            commit_index: 0,
            last_applied: 0,
            role: RaftRole::Standby,
            leader_hint: None,
            votes_received: HashSet::new(),
            pre_votes_received: HashSet::new(),
        }
    }

    pub fn last_log_index(&self) -> u64 {
        self.log
            .last()
            .map(|e| e.index)
            .unwrap_or(self.snapshot_last_index)
    }

    pub fn last_log_term(&self) -> u64 {
        self.log
            .last()
            .map(|e| e.term)
            .unwrap_or(self.snapshot_last_term)
    }

    /// Entry at `index` (1-based). None for index 0, snapshotted entries,
    /// and indices past the end of the log.
    pub fn get_entry(&self, index: u64) -> Option<&LogEntry> {
        if index == 0 || index <= self.snapshot_last_index {
            return None;
        }
        self.log
            .get((index - self.snapshot_last_index - 1) as usize)
    }

    /// Term of the entry at `index`, consulting the snapshot boundary.
    pub fn term_at(&self, index: u64) -> Option<u64> {
        if index == 0 {
            return Some(0);
        }
        if index == self.snapshot_last_index {
            return Some(self.snapshot_last_term);
        }
        self.get_entry(index).map(|e| e.term)
    }

    /// Entries from `start_index` (inclusive) to the end of the log.
    pub fn entries_from(&self, start_index: u64) -> Vec<LogEntry> {
        self.log
            .iter()
            .filter(|e| e.index >= start_index)
            .cloned()
            .collect()
    }

    /// Appends a new entry in the current term. Leader only.
    pub fn append(&mut self, kind: EntryKind, payload: Bytes) -> &LogEntry {
        let index = self.last_log_index() + 1;
        self.log.push(LogEntry {
            term: self.current_term,
            index,
            kind,
            payload,
        });
        self.log.last().unwrap()
    }

    /// Removes any suffix conflicting at `from_index` and appends `entries`.
    pub fn truncate_and_append(&mut self, from_index: u64, entries: Vec<LogEntry>) {
        let keep = from_index.saturating_sub(self.snapshot_last_index + 1) as usize;
        self.log.truncate(keep);
        self.log.extend(entries);
    }

    /// Drops log entries covered by a snapshot through `last_index`.
    pub fn compact_through(&mut self, last_index: u64, last_term: u64) {
        self.log.retain(|e| e.index > last_index);
        self.snapshot_last_index = last_index;
        self.snapshot_last_term = last_term;
        if self.commit_index < last_index {
            self.commit_index = last_index;
        }
    }

    /// Election restriction: the candidate's log is at least as up-to-date
    /// as ours, comparing last terms then last indices.
    pub fn is_log_up_to_date(&self, last_log_index: u64, last_log_term: u64) -> bool {
        let our_last_term = self.last_log_term();
        let our_last_index = self.last_log_index();
        last_log_term > our_last_term
            || (last_log_term == our_last_term && last_log_index >= our_last_index)
    }

    /// First contact or manual start moves a standby node into the cluster.
    pub fn activate(&mut self) {
        if self.role == RaftRole::Standby {
            self.role = RaftRole::Follower;
        }
    }

    pub fn become_follower(&mut self, term: u64) {
        debug_assert!(term >= self.current_term);
        if term > self.current_term {
            self.voted_for = None;
        }
        self.role = RaftRole::Follower;
        self.current_term = term;
        self.votes_received.clear();
        self.pre_votes_received.clear();
    }

    pub fn become_candidate(&mut self, my_id: Uuid) {
        self.role = RaftRole::Candidate;
        self.current_term += 1;
        self.voted_for = Some(my_id);
        self.votes_received.clear();
        self.votes_received.insert(my_id);
        self.leader_hint = None;
    }

    pub fn become_leader(&mut self, my_id: Uuid) {
        self.role = RaftRole::Leader;
        self.leader_hint = Some(my_id);
        self.votes_received.clear();
        self.pre_votes_received.clear();
    }
}

impl Default for RaftState {
    fn default() -> Self {
        Self::new()
    }
}
