use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future::join_all;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::cell::AtomicCell;
use crate::config::NodeConfig;
use crate::error::{Error, Result};
use crate::http::RaftClient;
use crate::raft::replication::{ReplicationCoordinator, TickOutcome};
use crate::raft::rpc::{
    self, AnnounceRequest, AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest,
    InstallSnapshotResponse, PreVoteRequest, PreVoteResponse, ResignResponse, VoteRequest,
    VoteResponse,
};
use crate::raft::state::{EntryKind, RaftRole, RaftState};
use crate::raft::storage::{LogStore, Snapshot, SnapshotStore};
use crate::raft::timer::{heartbeat_interval, random_election_timeout};
use crate::registry::MemberRegistry;

/// The Raft consensus node.
///
/// Owns role, term, voted_for and the election clock. Role transitions run
/// inside the state write lock, so "observe higher term, step down, clear
/// vote, record leader" is one atomic step; term, role tag and commit index
/// are mirrored into atomic cells for lock-free reads from the dispatcher
/// and the router.
pub struct RaftNode {
    pub id: Uuid,
    pub state: Arc<RwLock<RaftState>>,
    config: NodeConfig,
    registry: Arc<MemberRegistry>,
    client: RaftClient,
    log_store: Arc<dyn LogStore>,
    snapshot_store: Arc<dyn SnapshotStore>,
    replication: ReplicationCoordinator,
    term: AtomicCell,
    role: AtomicCell,
    commit: Arc<AtomicCell>,
    leader: parking_lot::RwLock<Option<Uuid>>,
    last_heartbeat: Arc<RwLock<Instant>>,
    lifecycle: CancellationToken,
}

impl RaftNode {
    pub fn new(
        config: NodeConfig,
        registry: Arc<MemberRegistry>,
        log_store: Arc<dyn LogStore>,
        snapshot_store: Arc<dyn SnapshotStore>,
        lifecycle: CancellationToken,
    ) -> Self {
        let client = RaftClient::new(config.member_id, config.raft_rpc_timeout());
        let state = Arc::new(RwLock::new(RaftState::new()));
        let commit = Arc::new(AtomicCell::new(0));
        let replication = ReplicationCoordinator::new(
            config.member_id,
            registry.clone(),
            client.clone(),
            snapshot_store.clone(),
            state.clone(),
            commit.clone(),
            Duration::from_millis(config.election_timeout_max_ms),
        );

        Self {
            id: config.member_id,
            state,
            registry,
            client,
            log_store,
            snapshot_store,
            replication,
            term: AtomicCell::new(0),
            role: AtomicCell::new(RaftRole::Standby.tag()),
            commit,
            leader: parking_lot::RwLock::new(None),
            last_heartbeat: Arc::new(RwLock::new(Instant::now())),
            lifecycle,
            config,
        }
    }

    /// Restores persisted term, vote, log and snapshot. Called once before
    /// `run`.
    pub async fn restore(&self) -> Result<()> {
        let (term, voted_for) = self.log_store.load_vote().await?;
        let entries = self.log_store.entries().await?;
        let snapshot = self.snapshot_store.load().await?;

        let mut state = self.state.write().await;
        state.current_term = term;
        state.voted_for = voted_for;
        if let Some(snapshot) = snapshot {
            state.compact_through(snapshot.last_included_index, snapshot.last_included_term);
        }
        state.log = entries;
        self.term.fetch_max(term);
        self.commit.fetch_max(state.commit_index);
        Ok(())
    }

    /// Runs the node until the lifecycle token is cancelled.
    pub async fn run(&self) {
        let mut election_timeout = random_election_timeout(
            self.config.election_timeout_min_ms,
            self.config.election_timeout_max_ms,
        );
        let mut heartbeat = heartbeat_interval(self.config.heartbeat_interval_ms);

        loop {
            let role = self.role();

            tokio::select! {
                _ = self.lifecycle.cancelled() => {
                    tracing::info!(node_id = %self.id, "Raft loop stopping");
                    break;
                }

                // Election timeout for everyone but the leader
                _ = tokio::time::sleep(election_timeout), if role != RaftRole::Leader => {
                    let elapsed = self.last_heartbeat.read().await.elapsed();
                    if elapsed >= election_timeout {
                        tracing::info!(
                            node_id = %self.id,
                            elapsed_ms = elapsed.as_millis(),
                            "Election timeout, starting election"
                        );
                        self.start_election().await;
                    }
                    election_timeout = random_election_timeout(
                        self.config.election_timeout_min_ms,
                        self.config.election_timeout_max_ms,
                    );
                }

                // Heartbeat tick for the leader
                _ = heartbeat.tick(), if role == RaftRole::Leader => {
                    match self.replication.tick().await {
                        TickOutcome::StepDown(term) => {
                            tracing::info!(term, "Higher term observed in replication, stepping down");
                            self.step_down(term).await;
                        }
                        TickOutcome::QuorumLost => {
                            let term = self.current_term();
                            tracing::warn!(term, "Lost heartbeat quorum, stepping down");
                            self.step_down(term).await;
                        }
                        TickOutcome::Retained | TickOutcome::NotLeader => {}
                    }
                }
            }
        }
    }

    /// Pre-vote round, then a real election if a majority would grant.
    ///
    /// The pre-vote keeps a partitioned node from inflating the cluster
    /// term: probing costs nothing until peers confirm they would vote.
    async fn start_election(&self) {
        let (next_term, last_log_index, last_log_term) = {
            let mut state = self.state.write().await;
            state.activate();
            self.role.write(state.role.tag());
            (
                state.current_term + 1,
                state.last_log_index(),
                state.last_log_term(),
            )
        };

        if !self.run_pre_vote(next_term, last_log_index, last_log_term).await {
            tracing::debug!(node_id = %self.id, next_term, "Pre-vote round failed, staying follower");
            return;
        }

        // Real election: become candidate, persist the self-vote
        let term = {
            let mut state = self.state.write().await;
            if state.role == RaftRole::Leader {
                return;
            }
            state.become_candidate(self.id);
            self.term.fetch_max(state.current_term);
            self.role.write(state.role.tag());
            *self.leader.write() = None;
            state.current_term
        };
        if let Err(e) = self.log_store.persist_vote(term, Some(self.id)).await {
            self.fail_storage(e);
            return;
        }

        tracing::info!(node_id = %self.id, term, "Starting election");

        let request = VoteRequest {
            candidate_id: self.id,
            term,
            last_log_index,
            last_log_term,
        };
        let peers = self.registry.remote_members();
        let responses = join_all(peers.iter().map(|member| {
            let request = request.clone();
            async move { (member.id, self.client.request_vote(member, &request).await) }
        }))
        .await;

        let mut highest_term = term;
        let mut granted: Vec<Uuid> = Vec::new();
        for (peer_id, response) in responses {
            match response {
                Ok(resp) if resp.term > term => highest_term = highest_term.max(resp.term),
                Ok(resp) if resp.granted => granted.push(peer_id),
                Ok(_) => {}
                Err(e) => tracing::debug!(peer = %peer_id, error = %e, "Vote request failed"),
            }
        }

        if highest_term > term {
            self.step_down(highest_term).await;
            return;
        }

        let quorum = self.registry.quorum();
        let mut state = self.state.write().await;
        if state.role != RaftRole::Candidate || state.current_term != term {
            return; // a leader appeared or a newer term started meanwhile
        }
        state.votes_received.extend(granted);
        let votes = state.votes_received.len();
        if votes < quorum {
            tracing::debug!(node_id = %self.id, term, votes, needed = quorum,
                "Election failed, not enough votes");
            return;
        }

        // Won: initialize progress from the pre-no-op index so the no-op
        // replicates on the first tick, then append it to anchor commits in
        // this term.
        let last_before = state.last_log_index();
        state.become_leader(self.id);
        let noop = state.append(EntryKind::Noop, Bytes::new()).clone();
        self.replication.reset(last_before);
        self.role.write(state.role.tag());
        *self.leader.write() = Some(self.id);
        drop(state);

        if let Err(e) = self.log_store.append(&[noop]).await {
            self.fail_storage(e);
            return;
        }
        tracing::info!(node_id = %self.id, term, votes, "Became leader");
    }

    async fn run_pre_vote(&self, next_term: u64, last_log_index: u64, last_log_term: u64) -> bool {
        let peers = self.registry.remote_members();
        let quorum = self.registry.quorum();
        if peers.is_empty() {
            return 1 >= quorum;
        }

        let request = PreVoteRequest {
            candidate_id: self.id,
            next_term,
            last_log_index,
            last_log_term,
        };
        let responses = join_all(peers.iter().map(|member| {
            let request = request.clone();
            async move { self.client.pre_vote(member, &request).await }
        }))
        .await;

        let mut would_grant = 1; // our own
        for response in responses.into_iter().flatten() {
            if response.would_grant {
                would_grant += 1;
            }
        }
        would_grant >= quorum
    }

    /// The step-down critical section: adopt the term, clear the vote, and
    /// drop any leader bookkeeping in one atomic transition.
    pub async fn step_down(&self, term: u64) {
        let (term, voted_for) = {
            let mut state = self.state.write().await;
            let term = term.max(state.current_term);
            state.become_follower(term);
            self.term.fetch_max(term);
            self.role.write(state.role.tag());
            *self.leader.write() = None;
            (term, state.voted_for)
        };
        if let Err(e) = self.log_store.persist_vote(term, voted_for).await {
            self.fail_storage(e);
        }
    }

    /// Inbound RequestVote. The vote pair is persisted before the response
    /// leaves the node.
    pub async fn handle_vote_request(&self, req: VoteRequest) -> Result<VoteResponse> {
        let (response, term, voted_for) = {
            let mut state = self.state.write().await;
            let response = rpc::handle_request_vote(&mut state, &req);
            self.term.fetch_max(state.current_term);
            self.role.write(state.role.tag());
            (response, state.current_term, state.voted_for)
        };

        self.log_store
            .persist_vote(term, voted_for)
            .await
            .map_err(|e| self.fail_storage(e))?;

        if response.granted {
            *self.last_heartbeat.write().await = Instant::now();
        }
        Ok(response)
    }

    /// Inbound PreVote: advisory, mutates nothing.
    pub async fn handle_pre_vote(&self, req: PreVoteRequest) -> PreVoteResponse {
        let state = self.state.read().await;
        rpc::handle_pre_vote(&state, &req)
    }

    /// Inbound AppendEntries. A success response is only written after the
    /// accepted entries are durable in the log store.
    pub async fn handle_append_entries(
        &self,
        req: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        let (response, accepted_leadership) = {
            let mut state = self.state.write().await;
            let term_before = state.current_term;
            let response = rpc::handle_append_entries(&mut state, &req);
            let accepted = req.term >= term_before;
            self.term.fetch_max(state.current_term);
            self.role.write(state.role.tag());
            self.commit.fetch_max(state.commit_index);
            if accepted {
                *self.leader.write() = Some(req.leader_id);
            }
            (response, accepted)
        };

        if accepted_leadership {
            *self.last_heartbeat.write().await = Instant::now();
        }

        if response.success && !req.entries.is_empty() {
            self.log_store
                .append(&req.entries)
                .await
                .map_err(|e| self.fail_storage(e))?;
        }
        Ok(response)
    }

    /// Inbound InstallSnapshot: hand the image to the snapshot store, then
    /// truncate the log through the boundary.
    pub async fn handle_install_snapshot(
        &self,
        req: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse> {
        let response = {
            let mut state = self.state.write().await;
            let term_before = state.current_term;
            let response = rpc::handle_install_snapshot(&mut state, &req);
            self.term.fetch_max(state.current_term);
            self.role.write(state.role.tag());
            self.commit.fetch_max(state.commit_index);
            if req.term >= term_before {
                *self.leader.write() = Some(req.leader_id);
            }
            response
        };

        if response.success {
            *self.last_heartbeat.write().await = Instant::now();
            self.snapshot_store
                .save(Snapshot {
                    last_included_index: req.last_included_index,
                    last_included_term: req.last_included_term,
                    data: req.data.clone(),
                })
                .await
                .map_err(|e| self.fail_storage(e))?;
            self.log_store
                .compact_through(req.last_included_index)
                .await
                .map_err(|e| self.fail_storage(e))?;
        }
        Ok(response)
    }

    /// Voluntary step-down. True iff this node was the leader.
    pub async fn resign(&self) -> ResignResponse {
        let mut state = self.state.write().await;
        let response = rpc::handle_resign(&mut state);
        if response.resigned {
            self.role.write(state.role.tag());
            *self.leader.write() = None;
        }
        response
    }

    /// Appends an entry in the current term. Leader only.
    pub async fn propose(&self, kind: EntryKind, payload: Bytes) -> Result<u64> {
        let entry = {
            let mut state = self.state.write().await;
            if state.role != RaftRole::Leader {
                return Err(Error::NotLeader);
            }
            state.append(kind, payload).clone()
        };
        let index = entry.index;
        self.log_store
            .append(&[entry])
            .await
            .map_err(|e| self.fail_storage(e))?;
        Ok(index)
    }

    /// One discovery broadcast to every known remote member.
    pub async fn announce(&self) {
        let request = AnnounceRequest {
            member_id: self.id,
            addr: self.config.listen_addr.to_string(),
        };
        let peers = self.registry.remote_members();
        let results = join_all(peers.iter().map(|member| {
            let request = request.clone();
            async move { self.client.announce(member, &request).await }
        }))
        .await;
        for (member, result) in peers.iter().zip(results) {
            if let Err(e) = result {
                tracing::trace!(peer = %member.id, error = %e, "Announce failed");
            }
        }
    }

    pub fn current_term(&self) -> u64 {
        self.term.read()
    }

    pub fn role(&self) -> RaftRole {
        RaftRole::from_tag(self.role.read())
    }

    pub fn is_leader(&self) -> bool {
        self.role() == RaftRole::Leader
    }

    /// The current leader if known: this node while Leader, otherwise the
    /// hint left by the last accepted AppendEntries.
    pub fn leader(&self) -> Option<Uuid> {
        *self.leader.read()
    }

    pub fn commit_index(&self) -> u64 {
        self.commit.read()
    }

    pub fn lifecycle(&self) -> &CancellationToken {
        &self.lifecycle
    }

    /// Storage corruption is not recovered: log it and bring the node down.
    fn fail_storage(&self, error: Error) -> Error {
        tracing::error!(error = %error, "Fatal storage failure, terminating node");
        self.lifecycle.cancel();
        error
    }
}

impl std::fmt::Debug for RaftNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RaftNode")
            .field("id", &self.id)
            .field("term", &self.current_term())
            .field("role", &self.role())
            .finish_non_exhaustive()
    }
}
