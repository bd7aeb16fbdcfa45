use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::bus::{AppMessage, DeliveryMode, HandlerList, MessageReply};
use crate::dedup::DuplicateDetector;
use crate::error::{Error, Result};
use crate::http::RaftClient;
use crate::raft::RaftNode;
use crate::registry::MemberRegistry;

/// Pause between routing retries so a flapping leader does not turn the
/// loop into a busy spin.
const RETRY_PAUSE: Duration = Duration::from_millis(10);

/// Routes application messages to the current leader, retrying across
/// leader changes until success or cancellation.
///
/// The same message (and so the same (sender, message-id) pair) is resent
/// verbatim on every attempt; receivers collapse replays through the
/// duplicate detector.
pub struct LeaderRouter {
    raft: Arc<RaftNode>,
    registry: Arc<MemberRegistry>,
    client: RaftClient,
    handlers: Arc<HandlerList>,
    dedup: Arc<DuplicateDetector>,
    lifecycle: CancellationToken,
}

impl LeaderRouter {
    pub fn new(
        raft: Arc<RaftNode>,
        registry: Arc<MemberRegistry>,
        client: RaftClient,
        handlers: Arc<HandlerList>,
        dedup: Arc<DuplicateDetector>,
        lifecycle: CancellationToken,
    ) -> Self {
        Self {
            raft,
            registry,
            client,
            handlers,
            dedup,
            lifecycle,
        }
    }

    /// Sends a request-reply message to the leader and awaits its reply.
    pub async fn send_request(
        &self,
        message: AppMessage,
        respect_leadership: bool,
        token: &CancellationToken,
    ) -> Result<MessageReply> {
        self.route(message, DeliveryMode::RequestReply, respect_leadership, token)
            .await?
            .ok_or(Error::UnexpectedStatus(204))
    }

    /// Sends a one-way signal to the leader. With `OneWayNoAck` the receiver
    /// acknowledges before processing; failures there are logged, not
    /// surfaced.
    pub async fn send_signal(
        &self,
        message: AppMessage,
        mode: DeliveryMode,
        respect_leadership: bool,
        token: &CancellationToken,
    ) -> Result<()> {
        debug_assert!(mode.is_signal());
        self.route(message, mode, respect_leadership, token).await?;
        Ok(())
    }

    /// The routing loop: read the leader, dispatch locally or remotely,
    /// retry on failover-shaped errors, bail on cancellation.
    async fn route(
        &self,
        message: AppMessage,
        mode: DeliveryMode,
        respect_leadership: bool,
        token: &CancellationToken,
    ) -> Result<Option<MessageReply>> {
        let token = self.link_with_lifecycle(token);

        loop {
            if token.is_cancelled() {
                return Err(Error::OperationCanceled);
            }

            let Some(leader_id) = self.raft.leader() else {
                return Err(Error::LeaderUnavailable);
            };

            let attempt = async {
                if leader_id == self.raft.id {
                    if respect_leadership && !self.raft.is_leader() {
                        return Err(Error::NotLeader);
                    }
                    deliver_local(&self.handlers, &self.dedup, message.clone(), mode).await
                } else {
                    let member = self
                        .registry
                        .try_get(leader_id)
                        .ok_or(Error::MemberUnavailable(leader_id))?;
                    self.client
                        .send_custom(&member, &message, mode, respect_leadership)
                        .await
                }
            };

            let result = tokio::select! {
                _ = token.cancelled() => return Err(Error::OperationCanceled),
                result = attempt => result,
            };

            match result {
                Ok(reply) => return Ok(reply),
                Err(e) if e.is_retryable(mode) || matches!(e, Error::NotLeader) => {
                    tracing::debug!(
                        message_id = %message.message_id,
                        leader = %leader_id,
                        error = %e,
                        "Leader dispatch failed, refreshing leader and retrying"
                    );
                    tokio::select! {
                        _ = token.cancelled() => return Err(Error::OperationCanceled),
                        _ = tokio::time::sleep(RETRY_PAUSE) => {}
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Joins the caller's token with the node lifecycle so shutdown aborts
    /// outstanding retries without per-loop polling of two tokens.
    fn link_with_lifecycle(&self, caller: &CancellationToken) -> CancellationToken {
        let linked = caller.child_token();
        let lifecycle = self.lifecycle.clone();
        let watcher = linked.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = lifecycle.cancelled() => watcher.cancel(),
                _ = watcher.cancelled() => {}
            }
        });
        linked
    }
}

/// Local-leader delivery, shared by the router loopback and the RPC
/// dispatcher so both paths dedup and select handlers identically.
///
/// Returns `Some(reply)` for request-reply, `None` after one-way
/// acceptance. Signals check for a claiming handler before anything else;
/// a missing handler is `NotImplemented` (501), never a silent drop.
pub(crate) async fn deliver_local(
    handlers: &HandlerList,
    dedup: &DuplicateDetector,
    message: AppMessage,
    mode: DeliveryMode,
) -> Result<Option<MessageReply>> {
    match mode {
        DeliveryMode::RequestReply => {
            let handler = handlers.find(&message.name).ok_or(Error::NotImplemented)?;
            handler.handle_request(message).await.map(Some)
        }
        DeliveryMode::OneWay => {
            let handler = handlers.find(&message.name).ok_or(Error::NotImplemented)?;
            if dedup.is_duplicate(message.duplicate_key()) {
                tracing::debug!(message_id = %message.message_id, "Duplicate signal suppressed");
                return Ok(None);
            }
            handler.handle_signal(message).await?;
            Ok(None)
        }
        DeliveryMode::OneWayNoAck => {
            let handler = handlers.find(&message.name).ok_or(Error::NotImplemented)?;
            if dedup.is_duplicate(message.duplicate_key()) {
                tracing::debug!(message_id = %message.message_id, "Duplicate signal suppressed");
                return Ok(None);
            }
            // Processing happens after the acknowledgment; failures are
            // logged, not surfaced.
            let message_id = message.message_id;
            tokio::spawn(async move {
                if let Err(e) = handler.handle_signal(message).await {
                    tracing::warn!(message_id = %message_id, error = %e,
                        "Post-ack signal handler failed");
                }
            });
            Ok(None)
        }
    }
}
