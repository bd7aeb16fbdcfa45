//! Protocol-level tests of the Raft RPC entry points: term handling, vote
//! persistence ordering, log acceptance, and snapshot installation.

use std::sync::Arc;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use raftbus::config::NodeConfig;
use raftbus::node::Node;
use raftbus::raft::rpc::{
    AppendEntriesRequest, InstallSnapshotRequest, PreVoteRequest, VoteRequest,
};
use raftbus::raft::storage::{LogStore, MemoryLogStore, MemorySnapshotStore, SnapshotStore};
use raftbus::raft::{LogEntry, RaftRole};

struct Fixture {
    node: Node,
    log_store: Arc<MemoryLogStore>,
    snapshot_store: Arc<MemorySnapshotStore>,
}

fn fixture() -> Fixture {
    let log_store = Arc::new(MemoryLogStore::new());
    let snapshot_store = Arc::new(MemorySnapshotStore::new());
    let node = Node::with_stores(
        NodeConfig::default(),
        log_store.clone(),
        snapshot_store.clone(),
        CancellationToken::new(),
    );
    Fixture {
        node,
        log_store,
        snapshot_store,
    }
}

fn vote_request(candidate_id: Uuid, term: u64) -> VoteRequest {
    VoteRequest {
        candidate_id,
        term,
        last_log_index: 0,
        last_log_term: 0,
    }
}

fn heartbeat(leader_id: Uuid, term: u64) -> AppendEntriesRequest {
    AppendEntriesRequest {
        leader_id,
        term,
        prev_log_index: 0,
        prev_log_term: 0,
        entries: vec![],
        leader_commit: 0,
    }
}

#[tokio::test]
async fn test_vote_granted_and_persisted_before_response() {
    let f = fixture();
    let candidate = Uuid::new_v4();

    let resp = f
        .node
        .raft
        .handle_vote_request(vote_request(candidate, 1))
        .await
        .unwrap();

    assert!(resp.granted);
    assert_eq!(resp.term, 1);
    // The vote pair hit the store before the response was produced
    assert_eq!(f.log_store.load_vote().await.unwrap(), (1, Some(candidate)));
}

#[tokio::test]
async fn test_vote_rejects_stale_term() {
    let f = fixture();
    let first = Uuid::new_v4();
    f.node
        .raft
        .handle_vote_request(vote_request(first, 5))
        .await
        .unwrap();

    let resp = f
        .node
        .raft
        .handle_vote_request(vote_request(Uuid::new_v4(), 3))
        .await
        .unwrap();

    assert!(!resp.granted);
    assert_eq!(resp.term, 5);
}

#[tokio::test]
async fn test_at_most_one_vote_per_term() {
    let f = fixture();
    let first = Uuid::new_v4();
    let second = Uuid::new_v4();

    let granted = f
        .node
        .raft
        .handle_vote_request(vote_request(first, 2))
        .await
        .unwrap();
    assert!(granted.granted);

    let denied = f
        .node
        .raft
        .handle_vote_request(vote_request(second, 2))
        .await
        .unwrap();
    assert!(!denied.granted);
    assert_eq!(f.log_store.load_vote().await.unwrap(), (2, Some(first)));

    // The same candidate retrying is granted again
    let repeat = f
        .node
        .raft
        .handle_vote_request(vote_request(first, 2))
        .await
        .unwrap();
    assert!(repeat.granted);
}

#[tokio::test]
async fn test_vote_rejects_outdated_log() {
    let f = fixture();
    let leader = Uuid::new_v4();

    // Give the node one entry at term 1
    let mut req = heartbeat(leader, 1);
    req.entries = vec![LogEntry::noop(1, 1)];
    assert!(f.node.raft.handle_append_entries(req).await.unwrap().success);

    // A candidate with an empty log is behind
    let resp = f
        .node
        .raft
        .handle_vote_request(vote_request(Uuid::new_v4(), 2))
        .await
        .unwrap();
    assert!(!resp.granted);
    assert_eq!(resp.term, 2);
}

#[tokio::test]
async fn test_pre_vote_leaves_term_and_vote_untouched() {
    let f = fixture();
    let resp = f
        .node
        .raft
        .handle_pre_vote(PreVoteRequest {
            candidate_id: Uuid::new_v4(),
            next_term: 7,
            last_log_index: 0,
            last_log_term: 0,
        })
        .await;

    assert!(resp.would_grant);
    assert_eq!(f.node.raft.current_term(), 0);
    assert_eq!(f.log_store.load_vote().await.unwrap(), (0, None));
}

#[tokio::test]
async fn test_append_entries_sets_leader_hint_and_activates() {
    let f = fixture();
    let leader = Uuid::new_v4();
    assert_eq!(f.node.raft.role(), RaftRole::Standby);

    let resp = f
        .node
        .raft
        .handle_append_entries(heartbeat(leader, 1))
        .await
        .unwrap();

    assert!(resp.success);
    assert_eq!(f.node.raft.role(), RaftRole::Follower);
    assert_eq!(f.node.raft.leader(), Some(leader));
    assert_eq!(f.node.raft.current_term(), 1);
}

#[tokio::test]
async fn test_append_entries_stale_term_answered_with_current() {
    let f = fixture();
    let leader = Uuid::new_v4();
    f.node
        .raft
        .handle_append_entries(heartbeat(leader, 4))
        .await
        .unwrap();

    let resp = f
        .node
        .raft
        .handle_append_entries(heartbeat(Uuid::new_v4(), 2))
        .await
        .unwrap();

    assert!(!resp.success);
    assert_eq!(resp.term, 4);
    // The stale sender did not displace the leader hint
    assert_eq!(f.node.raft.leader(), Some(leader));
}

#[tokio::test]
async fn test_append_entries_persists_before_success() {
    let f = fixture();
    let leader = Uuid::new_v4();

    let mut req = heartbeat(leader, 1);
    req.entries = vec![
        LogEntry::noop(1, 1),
        LogEntry {
            term: 1,
            index: 2,
            kind: raftbus::raft::EntryKind::User,
            payload: Bytes::from_static(b"payload"),
        },
    ];
    let resp = f.node.raft.handle_append_entries(req).await.unwrap();

    assert!(resp.success);
    assert_eq!(resp.match_index, 2);
    let stored = f.log_store.entries().await.unwrap();
    assert_eq!(stored.len(), 2);
    assert_eq!(stored[1].payload, Bytes::from_static(b"payload"));
}

#[tokio::test]
async fn test_append_entries_conflict_then_catch_up() {
    let f = fixture();
    let old_leader = Uuid::new_v4();
    let new_leader = Uuid::new_v4();

    // Two entries from term 1
    let mut req = heartbeat(old_leader, 1);
    req.entries = vec![LogEntry::noop(1, 1), LogEntry::noop(1, 2)];
    assert!(f.node.raft.handle_append_entries(req).await.unwrap().success);

    // New leader at term 2 disagrees about index 2
    let resp = f
        .node
        .raft
        .handle_append_entries(AppendEntriesRequest {
            leader_id: new_leader,
            term: 2,
            prev_log_index: 2,
            prev_log_term: 2,
            entries: vec![LogEntry::noop(2, 3)],
            leader_commit: 0,
        })
        .await
        .unwrap();
    assert!(!resp.success);
    assert_eq!(resp.match_index, 1); // conflicting suffix dropped

    // Backed-off retry from index 1 succeeds
    let resp = f
        .node
        .raft
        .handle_append_entries(AppendEntriesRequest {
            leader_id: new_leader,
            term: 2,
            prev_log_index: 1,
            prev_log_term: 1,
            entries: vec![LogEntry::noop(2, 2), LogEntry::noop(2, 3)],
            leader_commit: 2,
        })
        .await
        .unwrap();
    assert!(resp.success);
    assert_eq!(resp.match_index, 3);
    assert_eq!(f.node.raft.commit_index(), 2);
}

#[tokio::test]
async fn test_term_never_decreases() {
    let f = fixture();
    let mut observed = Vec::new();

    f.node
        .raft
        .handle_append_entries(heartbeat(Uuid::new_v4(), 3))
        .await
        .unwrap();
    observed.push(f.node.raft.current_term());

    f.node
        .raft
        .handle_vote_request(vote_request(Uuid::new_v4(), 2))
        .await
        .unwrap();
    observed.push(f.node.raft.current_term());

    f.node
        .raft
        .handle_vote_request(vote_request(Uuid::new_v4(), 8))
        .await
        .unwrap();
    observed.push(f.node.raft.current_term());

    f.node
        .raft
        .handle_append_entries(heartbeat(Uuid::new_v4(), 5))
        .await
        .unwrap();
    observed.push(f.node.raft.current_term());

    assert!(observed.windows(2).all(|w| w[0] <= w[1]), "{observed:?}");
}

#[tokio::test]
async fn test_install_snapshot_stores_image_and_compacts() {
    let f = fixture();
    let leader = Uuid::new_v4();

    let mut req = heartbeat(leader, 1);
    req.entries = (1..=4).map(|i| LogEntry::noop(1, i)).collect();
    assert!(f.node.raft.handle_append_entries(req).await.unwrap().success);

    let resp = f
        .node
        .raft
        .handle_install_snapshot(InstallSnapshotRequest {
            leader_id: leader,
            term: 1,
            last_included_index: 3,
            last_included_term: 1,
            data: Bytes::from_static(b"state-image"),
        })
        .await
        .unwrap();

    assert!(resp.success);
    let stored = f.snapshot_store.load().await.unwrap().unwrap();
    assert_eq!(stored.last_included_index, 3);
    assert_eq!(stored.data, Bytes::from_static(b"state-image"));
    // Log store dropped the covered prefix
    let entries = f.log_store.entries().await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].index, 4);
    assert_eq!(f.node.raft.commit_index(), 3);
}

#[tokio::test]
async fn test_resign_from_follower_is_a_noop() {
    let f = fixture();
    f.node
        .raft
        .handle_append_entries(heartbeat(Uuid::new_v4(), 1))
        .await
        .unwrap();

    let resp = f.node.raft.resign().await;
    assert!(!resp.resigned);
    assert_eq!(resp.term, 1);
    assert_eq!(f.node.raft.role(), RaftRole::Follower);
}
