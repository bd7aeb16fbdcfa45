use std::collections::HashMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::raft::state::{payload_bytes, LogEntry, RaftRole, RaftState};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteRequest {
    pub candidate_id: Uuid,
    pub term: u64,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteResponse {
    pub term: u64,
    pub granted: bool,
}

/// Advisory variant of `VoteRequest`: same predicate, zero mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreVoteRequest {
    pub candidate_id: Uuid,
    /// The term the candidate would start an election with.
    pub next_term: u64,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreVoteResponse {
    pub term: u64,
    pub would_grant: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    pub leader_id: Uuid,
    pub term: u64,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    pub entries: Vec<LogEntry>,
    pub leader_commit: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub term: u64,
    pub success: bool,
    pub match_index: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSnapshotRequest {
    pub leader_id: Uuid,
    pub term: u64,
    pub last_included_index: u64,
    pub last_included_term: u64,
    #[serde(with = "payload_bytes")]
    pub data: Bytes,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSnapshotResponse {
    pub term: u64,
    pub success: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResignResponse {
    pub term: u64,
    pub resigned: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataResponse {
    pub member_id: Uuid,
    pub metadata: HashMap<String, String>,
}

/// Discovery broadcast: id + address so dynamic joiners find peers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnnounceRequest {
    pub member_id: Uuid,
    pub addr: String,
}

/// Handle RequestVote.
///
/// Grants iff the candidate's term is current, no conflicting vote exists
/// for this term, and the candidate's log passes the up-to-date check. A
/// higher term steps us down first, clearing `voted_for`; equal terms never
/// overwrite an existing vote.
pub fn handle_request_vote(state: &mut RaftState, req: &VoteRequest) -> VoteResponse {
    if req.term > state.current_term {
        state.become_follower(req.term);
    }

    let granted = if req.term < state.current_term {
        false
    } else if state.voted_for.is_some() && state.voted_for != Some(req.candidate_id) {
        false
    } else if !state.is_log_up_to_date(req.last_log_index, req.last_log_term) {
        false
    } else {
        state.activate();
        state.voted_for = Some(req.candidate_id);
        true
    };

    tracing::debug!(
        candidate = %req.candidate_id,
        term = req.term,
        granted,
        "RequestVote response"
    );

    VoteResponse {
        term: state.current_term,
        granted,
    }
}

/// Handle PreVote. Same predicate as RequestVote against the candidate's
/// prospective term, but neither the term nor `voted_for` moves, so a
/// partitioned node cannot inflate the cluster term by probing.
pub fn handle_pre_vote(state: &RaftState, req: &PreVoteRequest) -> PreVoteResponse {
    let would_grant = req.next_term >= state.current_term
        && (state.voted_for.is_none() || state.voted_for == Some(req.candidate_id))
        && state.is_log_up_to_date(req.last_log_index, req.last_log_term);

    PreVoteResponse {
        term: state.current_term,
        would_grant,
    }
}

/// Handle AppendEntries.
///
/// A current-term request is an assertion of leadership: adopt the term,
/// step down if not already a follower, record the leader hint. The caller
/// resets the election timer whenever leadership was accepted (even if the
/// log check then fails).
pub fn handle_append_entries(
    state: &mut RaftState,
    req: &AppendEntriesRequest,
) -> AppendEntriesResponse {
    if req.term < state.current_term {
        return AppendEntriesResponse {
            term: state.current_term,
            success: false,
            match_index: state.last_log_index(),
        };
    }

    if req.term > state.current_term || state.role != RaftRole::Follower {
        state.become_follower(req.term);
    }
    state.activate();
    state.leader_hint = Some(req.leader_id);

    // Consistency check at prev_log_index
    if req.prev_log_index > 0 {
        match state.term_at(req.prev_log_index) {
            None => {
                // Log too short
                return AppendEntriesResponse {
                    term: state.current_term,
                    success: false,
                    match_index: state.last_log_index(),
                };
            }
            Some(term) if term != req.prev_log_term => {
                // Conflicting entry: drop it and everything after it
                state.truncate_and_append(req.prev_log_index, Vec::new());
                return AppendEntriesResponse {
                    term: state.current_term,
                    success: false,
                    match_index: state.last_log_index(),
                };
            }
            Some(_) => {}
        }
    }

    if !req.entries.is_empty() {
        // Skip entries we already hold with matching terms; truncate at the
        // first conflict so committed prefixes are never rewritten.
        let mut first_new = req.prev_log_index + 1;
        for entry in &req.entries {
            match state.term_at(entry.index) {
                Some(term) if term == entry.term => {
                    first_new = entry.index + 1;
                }
                _ => break,
            }
        }
        let fresh: Vec<LogEntry> = req
            .entries
            .iter()
            .filter(|e| e.index >= first_new)
            .cloned()
            .collect();
        if !fresh.is_empty() {
            state.truncate_and_append(first_new, fresh);
            tracing::debug!(
                appended = req.entries.len(),
                new_last_index = state.last_log_index(),
                "Appended entries"
            );
        }
    }

    let last_new_index = if req.entries.is_empty() {
        req.prev_log_index
    } else {
        req.entries.last().unwrap().index
    };
    if req.leader_commit > state.commit_index {
        state.commit_index = std::cmp::min(req.leader_commit, last_new_index);
    }

    AppendEntriesResponse {
        term: state.current_term,
        success: true,
        match_index: state.last_log_index(),
    }
}

/// Handle InstallSnapshot state transitions: same term/leader handling as
/// AppendEntries, then the log is truncated through the snapshot boundary.
/// Persisting the snapshot bytes is the caller's job.
pub fn handle_install_snapshot(
    state: &mut RaftState,
    req: &InstallSnapshotRequest,
) -> InstallSnapshotResponse {
    if req.term < state.current_term {
        return InstallSnapshotResponse {
            term: state.current_term,
            success: false,
        };
    }

    if req.term > state.current_term || state.role != RaftRole::Follower {
        state.become_follower(req.term);
    }
    state.activate();
    state.leader_hint = Some(req.leader_id);
    state.compact_through(req.last_included_index, req.last_included_term);

    InstallSnapshotResponse {
        term: state.current_term,
        success: true,
    }
}

/// Handle Resign: a leader steps down to follower in place, keeping its
/// term. True iff a resignation occurred.
pub fn handle_resign(state: &mut RaftState) -> ResignResponse {
    let resigned = state.role == RaftRole::Leader;
    if resigned {
        let term = state.current_term;
        state.become_follower(term);
        tracing::info!(term, "Leader resigned");
    }
    ResignResponse {
        term: state.current_term,
        resigned,
    }
}
