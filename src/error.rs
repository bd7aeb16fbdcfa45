use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use uuid::Uuid;

use crate::bus::DeliveryMode;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no leader is currently known")]
    LeaderUnavailable,

    #[error("member {0} is unreachable")]
    MemberUnavailable(Uuid),

    #[error("peer answered with unexpected status {0}")]
    UnexpectedStatus(u16),

    #[error("no handler is registered for this message")]
    NotImplemented,

    #[error("operation canceled")]
    OperationCanceled,

    #[error("sender network is not allowed")]
    Forbidden,

    #[error("this node is not the leader")]
    NotLeader,

    #[error("sender {0} is not a cluster member")]
    UnknownMember(Uuid),

    #[error("malformed request: {0}")]
    Malformed(String),

    #[error("configuration error: {0}")]
    Config(String),

    /// Log or snapshot store corruption. Not recovered; terminates the node.
    #[error("storage failure: {0}")]
    Storage(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether the leader-router loop should re-read the leader and retry.
    ///
    /// A 503 from the receiver means it stopped being the leader; a 400 on a
    /// request-reply exchange means the receiver rejected a stale leader
    /// route. Both are resolved by refreshing the leader, as is any
    /// transport-level failure.
    pub fn is_retryable(&self, mode: DeliveryMode) -> bool {
        match self {
            Error::MemberUnavailable(_) => true,
            Error::UnexpectedStatus(503) => true,
            Error::UnexpectedStatus(400) => mode == DeliveryMode::RequestReply,
            _ => false,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = match self {
            Error::Forbidden => StatusCode::FORBIDDEN,
            Error::UnknownMember(_) => StatusCode::NOT_FOUND,
            Error::Malformed(_) => StatusCode::BAD_REQUEST,
            Error::NotImplemented => StatusCode::NOT_IMPLEMENTED,
            Error::NotLeader | Error::LeaderUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            Error::OperationCanceled => StatusCode::SERVICE_UNAVAILABLE,
            Error::MemberUnavailable(_)
            | Error::UnexpectedStatus(_)
            | Error::Config(_)
            | Error::Storage(_)
            | Error::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = Json(json!({
            "error": self.to_string(),
            "status": status.as_u16(),
        }));

        (status, body).into_response()
    }
}
