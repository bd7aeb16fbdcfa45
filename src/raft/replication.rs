use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::RwLock;
use tokio::time::Instant;
use uuid::Uuid;

use crate::cell::AtomicCell;
use crate::http::RaftClient;
use crate::raft::rpc::{AppendEntriesRequest, InstallSnapshotRequest};
use crate::raft::state::{RaftRole, RaftState};
use crate::raft::storage::SnapshotStore;
use crate::registry::{Member, MemberRegistry};

/// What a heartbeat tick concluded about the leadership.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Not the leader; nothing was sent.
    NotLeader,
    /// Leadership retained; a quorum acknowledged this tick or recently.
    Retained,
    /// A peer answered with a higher term.
    StepDown(u64),
    /// No quorum of peers has acknowledged within the election timeout.
    QuorumLost,
}

/// Drives log replication while the local node is Leader.
///
/// Owns no state of its own beyond the quorum-lapse clock: per-peer
/// nextIndex/matchIndex live in the registry members, and the log lives in
/// the shared Raft state. The owning node calls `tick` on every heartbeat
/// and acts on the outcome.
pub struct ReplicationCoordinator {
    node_id: Uuid,
    registry: Arc<MemberRegistry>,
    client: RaftClient,
    snapshot_store: Arc<dyn SnapshotStore>,
    state: Arc<RwLock<RaftState>>,
    commit: Arc<AtomicCell>,
    /// When acknowledgments from a quorum first went missing.
    quorum_lapse: Mutex<Option<Instant>>,
    /// How long the leader tolerates a missing quorum before stepping down.
    lapse_budget: Duration,
}

struct PeerSendPlan {
    member: Arc<Member>,
    request: PeerRequest,
}

enum PeerRequest {
    Append {
        request: AppendEntriesRequest,
        highest_index: u64,
    },
    Snapshot(InstallSnapshotRequest),
}

enum PeerReply {
    Acked { member: Arc<Member> },
    Rejected,
    HigherTerm(u64),
    Unreachable,
}

impl ReplicationCoordinator {
    pub fn new(
        node_id: Uuid,
        registry: Arc<MemberRegistry>,
        client: RaftClient,
        snapshot_store: Arc<dyn SnapshotStore>,
        state: Arc<RwLock<RaftState>>,
        commit: Arc<AtomicCell>,
        lapse_budget: Duration,
    ) -> Self {
        Self {
            node_id,
            registry,
            client,
            snapshot_store,
            state,
            commit,
            quorum_lapse: Mutex::new(None),
            lapse_budget,
        }
    }

    /// One heartbeat round: emit AppendEntries (or InstallSnapshot for
    /// lagging peers), fold the replies into per-peer progress, and advance
    /// the commit index.
    pub async fn tick(&self) -> TickOutcome {
        let (term, plans) = {
            let state = self.state.read().await;
            if state.role != RaftRole::Leader {
                return TickOutcome::NotLeader;
            }
            (state.current_term, self.plan_sends(&state))
        };

        let replies = join_all(plans.into_iter().map(|plan| self.send(term, plan))).await;

        let mut acked = 0usize;
        for reply in replies {
            match reply {
                PeerReply::Acked { member } => {
                    acked += 1;
                    member.touch();
                }
                PeerReply::HigherTerm(term) => return TickOutcome::StepDown(term),
                PeerReply::Rejected => acked += 1, // reachable, log catching up
                PeerReply::Unreachable => {}
            }
        }

        self.advance_commit().await;

        // Leadership is only as good as a responsive quorum.
        if acked + 1 >= self.registry.quorum() {
            *self.quorum_lapse.lock() = None;
            TickOutcome::Retained
        } else {
            let mut lapse = self.quorum_lapse.lock();
            let since = lapse.get_or_insert_with(Instant::now);
            if since.elapsed() >= self.lapse_budget {
                TickOutcome::QuorumLost
            } else {
                TickOutcome::Retained
            }
        }
    }

    /// Leaves leader bookkeeping ready for the next term.
    pub fn reset(&self, last_log_index: u64) {
        for member in self.registry.remote_members() {
            member.reset_progress(last_log_index);
        }
        *self.quorum_lapse.lock() = None;
    }

    fn plan_sends(&self, state: &RaftState) -> Vec<PeerSendPlan> {
        let mut plans = Vec::new();
        for member in self.registry.remote_members() {
            if !member.try_begin_send() {
                continue; // previous round still in flight
            }
            let next_index = member.next_index();
            if next_index <= state.snapshot_last_index {
                plans.push(PeerSendPlan {
                    member,
                    request: PeerRequest::Snapshot(InstallSnapshotRequest {
                        leader_id: self.node_id,
                        term: state.current_term,
                        last_included_index: state.snapshot_last_index,
                        last_included_term: state.snapshot_last_term,
                        data: bytes::Bytes::new(), // filled from the store at send time
                    }),
                });
                continue;
            }

            let prev_log_index = next_index - 1;
            let prev_log_term = state.term_at(prev_log_index).unwrap_or(0);
            let entries = state.entries_from(next_index);
            let highest_index = entries.last().map(|e| e.index).unwrap_or(prev_log_index);
            plans.push(PeerSendPlan {
                member,
                request: PeerRequest::Append {
                    request: AppendEntriesRequest {
                        leader_id: self.node_id,
                        term: state.current_term,
                        prev_log_index,
                        prev_log_term,
                        entries,
                        leader_commit: state.commit_index,
                    },
                    highest_index,
                },
            });
        }
        plans
    }

    async fn send(&self, term: u64, plan: PeerSendPlan) -> PeerReply {
        let member = plan.member;
        let reply = match plan.request {
            PeerRequest::Append {
                request,
                highest_index,
            } => match self.client.append_entries(&member, &request).await {
                Ok(resp) if resp.term > term => PeerReply::HigherTerm(resp.term),
                Ok(resp) if resp.success => {
                    member.set_match_index(highest_index);
                    member.set_next_index(highest_index + 1);
                    PeerReply::Acked {
                        member: member.clone(),
                    }
                }
                Ok(_) => {
                    member.decrement_next_index();
                    tracing::debug!(peer = %member.id, next_index = member.next_index(),
                        "Log mismatch, backing off next_index");
                    PeerReply::Rejected
                }
                Err(e) => {
                    tracing::trace!(peer = %member.id, error = %e, "AppendEntries failed");
                    PeerReply::Unreachable
                }
            },
            PeerRequest::Snapshot(mut request) => {
                match self.snapshot_store.load().await {
                    Ok(Some(snapshot)) => {
                        request.last_included_index = snapshot.last_included_index;
                        request.last_included_term = snapshot.last_included_term;
                        request.data = snapshot.data;
                    }
                    Ok(None) => {
                        tracing::warn!(peer = %member.id,
                            "Peer lags behind the compaction point but no snapshot is stored");
                        member.end_send();
                        return PeerReply::Unreachable;
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Snapshot store read failed");
                        member.end_send();
                        return PeerReply::Unreachable;
                    }
                }
                let last_included = request.last_included_index;
                match self.client.install_snapshot(&member, &request).await {
                    Ok(resp) if resp.term > term => PeerReply::HigherTerm(resp.term),
                    Ok(resp) if resp.success => {
                        member.set_match_index(last_included);
                        member.set_next_index(last_included + 1);
                        tracing::info!(peer = %member.id, last_included, "Snapshot installed");
                        PeerReply::Acked {
                            member: member.clone(),
                        }
                    }
                    Ok(_) => PeerReply::Rejected,
                    Err(e) => {
                        tracing::trace!(peer = %member.id, error = %e, "InstallSnapshot failed");
                        PeerReply::Unreachable
                    }
                }
            }
        };
        member.end_send();
        reply
    }

    /// commitIndex := max N replicated on a quorum with log[N].term equal to
    /// the current term. Entries from older terms commit only alongside one
    /// from the leader's own term.
    async fn advance_commit(&self) {
        let mut state = self.state.write().await;
        if state.role != RaftRole::Leader {
            return;
        }

        let mut indices: Vec<u64> = self
            .registry
            .remote_members()
            .iter()
            .map(|m| m.match_index())
            .collect();
        indices.push(state.last_log_index());
        indices.sort_unstable();

        let quorum = self.registry.quorum();
        if quorum > indices.len() {
            return;
        }
        let candidate = indices[indices.len() - quorum];

        if candidate > state.commit_index && state.term_at(candidate) == Some(state.current_term) {
            state.commit_index = candidate;
            self.commit.fetch_max(candidate);
            tracing::debug!(commit_index = candidate, "Advanced commit index");
        }
    }
}

impl std::fmt::Debug for ReplicationCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationCoordinator")
            .field("node_id", &self.node_id)
            .finish_non_exhaustive()
    }
}
