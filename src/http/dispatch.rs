use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::buffer::ScratchBuffer;
use crate::bus::router::deliver_local;
use crate::bus::{AppMessage, DeliveryMode, HandlerList};
use crate::config::NodeConfig;
use crate::dedup::DuplicateDetector;
use crate::error::{Error, Result};
use crate::http::{
    MessageKind, HEADER_KIND, HEADER_MESSAGE_ID, HEADER_MESSAGE_NAME, HEADER_MODE,
    HEADER_RESPECT_LEADERSHIP, HEADER_SENDER,
};
use crate::raft::rpc::{AnnounceRequest, MetadataResponse};
use crate::raft::RaftNode;
use crate::registry::{Member, MemberRegistry};

/// Everything the dispatcher needs per request.
pub struct AppState {
    pub config: NodeConfig,
    pub raft: Arc<RaftNode>,
    pub registry: Arc<MemberRegistry>,
    pub handlers: Arc<HandlerList>,
    pub dedup: Arc<DuplicateDetector>,
    /// Operator-maintained key/value map served by the Metadata RPC.
    /// Published as an immutable snapshot; replaced wholesale.
    pub metadata: parking_lot::RwLock<Arc<HashMap<String, String>>>,
    pub lifecycle: CancellationToken,
}

impl AppState {
    pub fn set_metadata(&self, metadata: HashMap<String, String>) {
        *self.metadata.write() = Arc::new(metadata);
    }

    pub fn metadata_snapshot(&self) -> Arc<HashMap<String, String>> {
        self.metadata.read().clone()
    }
}

/// Inbound entry point: one POST route, kind header selects the handler.
///
/// Order is fixed: ACL first (a blocked network causes no side effect at
/// all), then header parsing, then member lookup and `touch`, then the
/// typed handler.
pub async fn dispatch_message(
    State(state): State<Arc<AppState>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    match route(&state, remote, &headers, body).await {
        Ok(response) => response,
        Err(error) => error.into_response(),
    }
}

async fn route(
    state: &Arc<AppState>,
    remote: SocketAddr,
    headers: &HeaderMap,
    body: Bytes,
) -> Result<Response> {
    if !state.config.network_allowed(remote.ip()) {
        tracing::warn!(remote = %remote, "Blocked by network ACL");
        return Err(Error::Forbidden);
    }

    let kind = header_str(headers, HEADER_KIND)
        .and_then(MessageKind::parse)
        .ok_or_else(|| Error::Malformed("missing or unknown message kind".into()))?;
    let sender: Uuid = header_str(headers, HEADER_SENDER)
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| Error::Malformed("missing or invalid sender id".into()))?;

    // Announce introduces new members; everything else requires a known one.
    if kind == MessageKind::Announce {
        return handle_announce(state, sender, &body);
    }
    let member = state
        .registry
        .try_get(sender)
        .ok_or(Error::UnknownMember(sender))?;
    member.touch();

    // Per-request token, linked to the node lifecycle.
    let token = state.lifecycle.child_token();

    let body = stage_replication_payload(state, kind, body, &token).await?;

    match kind {
        MessageKind::RequestVote => {
            let req = decode_json(&body)?;
            let resp = state.raft.handle_vote_request(req).await?;
            Ok(Json(resp).into_response())
        }
        MessageKind::PreVote => {
            let req = decode_json(&body)?;
            let resp = state.raft.handle_pre_vote(req).await;
            Ok(Json(resp).into_response())
        }
        MessageKind::AppendEntries => {
            let req = decode_json(&body)?;
            let fut = state.raft.handle_append_entries(req);
            let resp = tokio::select! {
                _ = token.cancelled() => return Err(Error::OperationCanceled),
                resp = fut => resp?,
            };
            Ok(Json(resp).into_response())
        }
        MessageKind::InstallSnapshot => {
            let req = decode_json(&body)?;
            let fut = state.raft.handle_install_snapshot(req);
            let resp = tokio::select! {
                _ = token.cancelled() => return Err(Error::OperationCanceled),
                resp = fut => resp?,
            };
            Ok(Json(resp).into_response())
        }
        MessageKind::Resign => {
            let resp = state.raft.resign().await;
            Ok(Json(resp).into_response())
        }
        MessageKind::Metadata => {
            let resp = MetadataResponse {
                member_id: state.config.member_id,
                metadata: state.metadata_snapshot().as_ref().clone(),
            };
            Ok(Json(resp).into_response())
        }
        MessageKind::Custom => handle_custom(state, sender, headers, body, &token).await,
        MessageKind::Announce => unreachable!("handled above"),
    }
}

fn handle_announce(state: &Arc<AppState>, sender: Uuid, body: &Bytes) -> Result<Response> {
    let req: AnnounceRequest = decode_json(body)?;
    if req.member_id != sender {
        return Err(Error::Malformed("announce sender mismatch".into()));
    }
    match state.registry.try_get(sender) {
        Some(member) => member.touch(),
        None => {
            tracing::info!(member = %sender, addr = %req.addr, "Discovered new member");
            let member = state
                .registry
                .add_member(Member::new(sender, req.addr, true));
            member.touch();
        }
    }
    Ok(StatusCode::NO_CONTENT.into_response())
}

/// Application message ingress.
///
/// The RespectLeadership check precedes delivery, so a flagged message
/// never executes on a non-leader. The one-way fast-ack path verifies a
/// handler exists before writing 204; processing then happens after the
/// response, with the payload buffer released when the handler finishes.
async fn handle_custom(
    state: &Arc<AppState>,
    sender: Uuid,
    headers: &HeaderMap,
    body: Bytes,
    token: &CancellationToken,
) -> Result<Response> {
    let message_id: Uuid = header_str(headers, HEADER_MESSAGE_ID)
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| Error::Malformed("missing or invalid message id".into()))?;
    let mode = header_str(headers, HEADER_MODE)
        .and_then(DeliveryMode::parse)
        .ok_or_else(|| Error::Malformed("missing or unknown delivery mode".into()))?;
    let name = header_str(headers, HEADER_MESSAGE_NAME)
        .ok_or_else(|| Error::Malformed("missing message name".into()))?
        .to_owned();
    let respect_leadership = header_str(headers, HEADER_RESPECT_LEADERSHIP) == Some("true");
    let content_type = header_str(headers, "content-type")
        .unwrap_or("application/octet-stream")
        .to_owned();

    if respect_leadership && !state.raft.is_leader() {
        return Err(Error::NotLeader);
    }

    let message = AppMessage {
        sender_id: sender,
        message_id,
        name,
        content_type,
        payload: body,
    };

    let fut = deliver_local(&state.handlers, &state.dedup, message, mode);
    let delivered = tokio::select! {
        _ = token.cancelled() => return Err(Error::OperationCanceled),
        delivered = fut => delivered?,
    };

    match delivered {
        Some(reply) => Ok((
            StatusCode::OK,
            [
                (HEADER_MESSAGE_NAME, reply.name),
                ("content-type", reply.content_type),
            ],
            reply.payload,
        )
            .into_response()),
        None => Ok(StatusCode::NO_CONTENT.into_response()),
    }
}

/// When a buffering policy is configured, replication payloads are copied
/// to the scratch store before the log sees them. Cancellation aborts the
/// copy; nothing has touched the log at that point.
async fn stage_replication_payload(
    state: &Arc<AppState>,
    kind: MessageKind,
    body: Bytes,
    token: &CancellationToken,
) -> Result<Bytes> {
    let Some(options) = &state.config.buffering else {
        return Ok(body);
    };
    if !matches!(kind, MessageKind::AppendEntries | MessageKind::InstallSnapshot) {
        return Ok(body);
    }

    let staged = tokio::select! {
        _ = token.cancelled() => return Err(Error::OperationCanceled),
        staged = ScratchBuffer::stage(body, options) => staged?,
    };
    let bytes = tokio::select! {
        _ = token.cancelled() => return Err(Error::OperationCanceled),
        bytes = staged.into_bytes() => bytes?,
    };
    Ok(bytes)
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn decode_json<T: serde::de::DeserializeOwned>(body: &Bytes) -> Result<T> {
    serde_json::from_slice(body).map_err(|e| Error::Malformed(e.to_string()))
}

#[derive(Debug, Serialize)]
pub struct MemberStatus {
    pub id: Uuid,
    pub addr: String,
    pub is_remote: bool,
    pub last_contact: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub node_id: Uuid,
    pub role: String,
    pub term: u64,
    pub leader: Option<Uuid>,
    pub commit_index: u64,
    pub log_length: usize,
    pub members: Vec<MemberStatus>,
}

/// Read-only introspection; no side effects, no touch.
pub async fn status_handler(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    let log_length = state.raft.state.read().await.log.len();
    let members = state
        .registry
        .members()
        .into_iter()
        .map(|m| MemberStatus {
            id: m.id,
            addr: m.addr.clone(),
            is_remote: m.is_remote,
            last_contact: m.last_contact(),
        })
        .collect();

    Json(StatusResponse {
        node_id: state.config.member_id,
        role: state.raft.role().to_string(),
        term: state.raft.current_term(),
        leader: state.raft.leader(),
        commit_index: state.raft.commit_index(),
        log_length,
        members,
    })
}
