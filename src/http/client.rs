use std::time::Duration;

use bytes::Bytes;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

use crate::bus::{AppMessage, DeliveryMode, MessageReply};
use crate::error::{Error, Result};
use crate::http::{
    MessageKind, HEADER_KIND, HEADER_MESSAGE_ID, HEADER_MESSAGE_NAME, HEADER_MODE,
    HEADER_RESPECT_LEADERSHIP, HEADER_SENDER, MESSAGE_PATH,
};
use crate::raft::rpc::{
    AnnounceRequest, AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest,
    InstallSnapshotResponse, MetadataResponse, PreVoteRequest, PreVoteResponse, ResignResponse,
    VoteRequest, VoteResponse,
};
use crate::registry::Member;

/// Outbound transport for Raft RPCs and routed application messages.
///
/// Raft RPCs carry the configured per-RPC deadline; application messages run
/// under the caller's token instead, with no client-side timeout.
#[derive(Debug, Clone)]
pub struct RaftClient {
    http: reqwest::Client,
    sender_id: Uuid,
    rpc_timeout: Duration,
}

impl RaftClient {
    pub fn new(sender_id: Uuid, rpc_timeout: Duration) -> Self {
        Self {
            http: reqwest::Client::new(),
            sender_id,
            rpc_timeout,
        }
    }

    fn url(addr: &str) -> String {
        format!("http://{addr}{MESSAGE_PATH}")
    }

    /// One Raft RPC round trip: JSON request out, JSON response in.
    async fn raft_rpc<Req: Serialize, Resp: DeserializeOwned>(
        &self,
        member: &Member,
        kind: MessageKind,
        request: &Req,
    ) -> Result<Resp> {
        let response = self
            .http
            .post(Self::url(&member.addr))
            .header(HEADER_KIND, kind.as_str())
            .header(HEADER_SENDER, self.sender_id.to_string())
            .timeout(self.rpc_timeout)
            .json(request)
            .send()
            .await
            .map_err(|_| Error::MemberUnavailable(member.id))?;

        match response.status() {
            StatusCode::OK => response
                .json()
                .await
                .map_err(|_| Error::MemberUnavailable(member.id)),
            status => Err(Error::UnexpectedStatus(status.as_u16())),
        }
    }

    pub async fn request_vote(&self, member: &Member, request: &VoteRequest) -> Result<VoteResponse> {
        self.raft_rpc(member, MessageKind::RequestVote, request).await
    }

    pub async fn pre_vote(&self, member: &Member, request: &PreVoteRequest) -> Result<PreVoteResponse> {
        self.raft_rpc(member, MessageKind::PreVote, request).await
    }

    pub async fn append_entries(
        &self,
        member: &Member,
        request: &AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        self.raft_rpc(member, MessageKind::AppendEntries, request).await
    }

    pub async fn install_snapshot(
        &self,
        member: &Member,
        request: &InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse> {
        self.raft_rpc(member, MessageKind::InstallSnapshot, request).await
    }

    pub async fn resign(&self, member: &Member) -> Result<ResignResponse> {
        self.raft_rpc(member, MessageKind::Resign, &()).await
    }

    pub async fn metadata(&self, member: &Member) -> Result<MetadataResponse> {
        self.raft_rpc(member, MessageKind::Metadata, &()).await
    }

    /// Discovery broadcast; receivers register unknown senders.
    pub async fn announce(&self, member: &Member, request: &AnnounceRequest) -> Result<()> {
        let response = self
            .http
            .post(Self::url(&member.addr))
            .header(HEADER_KIND, MessageKind::Announce.as_str())
            .header(HEADER_SENDER, self.sender_id.to_string())
            .timeout(self.rpc_timeout)
            .json(request)
            .send()
            .await
            .map_err(|_| Error::MemberUnavailable(member.id))?;
        match response.status() {
            StatusCode::NO_CONTENT => Ok(()),
            status => Err(Error::UnexpectedStatus(status.as_u16())),
        }
    }

    /// Routes an application message to `member`. Returns the reply payload
    /// for request-reply exchanges, `None` after a 204 acknowledgment.
    pub async fn send_custom(
        &self,
        member: &Member,
        message: &AppMessage,
        mode: DeliveryMode,
        respect_leadership: bool,
    ) -> Result<Option<MessageReply>> {
        let mut request = self
            .http
            .post(Self::url(&member.addr))
            .header(HEADER_KIND, MessageKind::Custom.as_str())
            .header(HEADER_SENDER, message.sender_id.to_string())
            .header(HEADER_MESSAGE_ID, message.message_id.to_string())
            .header(HEADER_MODE, mode.as_str())
            .header(HEADER_MESSAGE_NAME, message.name.clone())
            .header(reqwest::header::CONTENT_TYPE, message.content_type.clone())
            .body(message.payload.clone());
        if respect_leadership {
            request = request.header(HEADER_RESPECT_LEADERSHIP, "true");
        }

        let response = request
            .send()
            .await
            .map_err(|_| Error::MemberUnavailable(member.id))?;

        match response.status() {
            StatusCode::OK => {
                let name = header_string(&response, HEADER_MESSAGE_NAME)
                    .unwrap_or_else(|| message.name.clone());
                let content_type = header_string(&response, "content-type")
                    .unwrap_or_else(|| "application/octet-stream".into());
                let payload: Bytes = response
                    .bytes()
                    .await
                    .map_err(|_| Error::MemberUnavailable(member.id))?;
                Ok(Some(MessageReply {
                    name,
                    content_type,
                    payload,
                }))
            }
            StatusCode::NO_CONTENT => Ok(None),
            StatusCode::NOT_IMPLEMENTED => Err(Error::NotImplemented),
            StatusCode::FORBIDDEN => Err(Error::Forbidden),
            status => Err(Error::UnexpectedStatus(status.as_u16())),
        }
    }
}

fn header_string(response: &reqwest::Response, name: &str) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
}
