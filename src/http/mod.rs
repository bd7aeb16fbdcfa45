pub mod client;
pub mod dispatch;
pub mod server;

pub use client::RaftClient;
pub use dispatch::AppState;
pub use server::build_router;

/// Path every cluster message is POSTed to; the kind header selects the
/// handler.
pub const MESSAGE_PATH: &str = "/raftbus/message";
/// Read-only node introspection.
pub const STATUS_PATH: &str = "/raftbus/status";

pub const HEADER_KIND: &str = "x-raftbus-type";
pub const HEADER_SENDER: &str = "x-raftbus-sender";
pub const HEADER_MESSAGE_ID: &str = "x-raftbus-message-id";
pub const HEADER_MODE: &str = "x-raftbus-delivery-mode";
pub const HEADER_RESPECT_LEADERSHIP: &str = "x-raftbus-respect-leadership";
pub const HEADER_MESSAGE_NAME: &str = "x-raftbus-message-name";

/// The inbound message kinds the dispatcher understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    RequestVote,
    PreVote,
    AppendEntries,
    InstallSnapshot,
    Resign,
    Metadata,
    Custom,
    Announce,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::RequestVote => "request-vote",
            MessageKind::PreVote => "pre-vote",
            MessageKind::AppendEntries => "append-entries",
            MessageKind::InstallSnapshot => "install-snapshot",
            MessageKind::Resign => "resign",
            MessageKind::Metadata => "metadata",
            MessageKind::Custom => "custom",
            MessageKind::Announce => "announce",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "request-vote" => Some(MessageKind::RequestVote),
            "pre-vote" => Some(MessageKind::PreVote),
            "append-entries" => Some(MessageKind::AppendEntries),
            "install-snapshot" => Some(MessageKind::InstallSnapshot),
            "resign" => Some(MessageKind::Resign),
            "metadata" => Some(MessageKind::Metadata),
            "custom" => Some(MessageKind::Custom),
            "announce" => Some(MessageKind::Announce),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_kind_roundtrip() {
        for kind in [
            MessageKind::RequestVote,
            MessageKind::PreVote,
            MessageKind::AppendEntries,
            MessageKind::InstallSnapshot,
            MessageKind::Resign,
            MessageKind::Metadata,
            MessageKind::Custom,
            MessageKind::Announce,
        ] {
            assert_eq!(MessageKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(MessageKind::parse("gossip"), None);
    }
}
