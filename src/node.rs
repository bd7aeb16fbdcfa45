use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::bus::{HandlerList, LeaderRouter};
use crate::config::NodeConfig;
use crate::dedup::DuplicateDetector;
use crate::error::Result;
use crate::http::dispatch::AppState;
use crate::http::{server, RaftClient};
use crate::raft::storage::{LogStore, MemoryLogStore, MemorySnapshotStore, SnapshotStore};
use crate::raft::RaftNode;
use crate::registry::{Member, MemberRegistry};

/// Main node that wires the consensus runtime together: member registry,
/// Raft state machine, message bus overlay, and the HTTP endpoint.
pub struct Node {
    pub config: NodeConfig,
    pub raft: Arc<RaftNode>,
    pub registry: Arc<MemberRegistry>,
    pub handlers: Arc<HandlerList>,
    pub dedup: Arc<DuplicateDetector>,
    pub router: Arc<LeaderRouter>,
    app_state: Arc<AppState>,
    lifecycle: CancellationToken,
}

impl Node {
    /// A node backed by in-memory stores.
    pub fn new(config: NodeConfig, lifecycle: CancellationToken) -> Self {
        Self::with_stores(
            config,
            Arc::new(MemoryLogStore::new()),
            Arc::new(MemorySnapshotStore::new()),
            lifecycle,
        )
    }

    pub fn with_stores(
        config: NodeConfig,
        log_store: Arc<dyn LogStore>,
        snapshot_store: Arc<dyn SnapshotStore>,
        lifecycle: CancellationToken,
    ) -> Self {
        let registry = Arc::new(MemberRegistry::new());
        registry.add_member(Member::new(
            config.member_id,
            config.listen_addr.to_string(),
            false,
        ));
        for peer in &config.peers {
            registry.add_member(Member::new(peer.member_id, peer.addr.clone(), true));
        }

        let raft = Arc::new(RaftNode::new(
            config.clone(),
            registry.clone(),
            log_store,
            snapshot_store,
            lifecycle.clone(),
        ));
        let handlers = Arc::new(HandlerList::new());
        let dedup = Arc::new(DuplicateDetector::new(config.duplicate_detector_capacity));
        let router = Arc::new(LeaderRouter::new(
            raft.clone(),
            registry.clone(),
            RaftClient::new(config.member_id, config.raft_rpc_timeout()),
            handlers.clone(),
            dedup.clone(),
            lifecycle.clone(),
        ));

        let app_state = Arc::new(AppState {
            config: config.clone(),
            raft: raft.clone(),
            registry: registry.clone(),
            handlers: handlers.clone(),
            dedup: dedup.clone(),
            metadata: parking_lot::RwLock::new(Arc::new(HashMap::new())),
            lifecycle: lifecycle.clone(),
        });

        Self {
            config,
            raft,
            registry,
            handlers,
            dedup,
            router,
            app_state,
            lifecycle,
        }
    }

    /// The dispatcher state, also used to build in-process test routers.
    pub fn app_state(&self) -> Arc<AppState> {
        self.app_state.clone()
    }

    /// Runs the node: restores persisted state, spawns the Raft loop and
    /// the announce broadcast, then blocks on the HTTP endpoint until
    /// shutdown. The handler list is drained on the way out.
    pub async fn run(self) -> Result<()> {
        self.raft.restore().await?;

        let raft = self.raft.clone();
        tokio::spawn(async move {
            raft.run().await;
        });

        if self.config.announce_interval_ms > 0 {
            let raft = self.raft.clone();
            let token = self.lifecycle.clone();
            let period = Duration::from_millis(self.config.announce_interval_ms);
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(period);
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tick.tick() => raft.announce().await,
                    }
                }
            });
        }

        let result = server::serve(
            self.config.listen_addr,
            self.app_state.clone(),
            self.lifecycle.clone(),
        )
        .await;

        self.handlers.drain();
        result.map_err(Into::into)
    }
}
