pub mod handlers;
pub mod router;

use bytes::Bytes;
use uuid::Uuid;

pub use handlers::{HandlerList, HandlerRegistration, MessageHandler};
pub use router::LeaderRouter;

use crate::dedup::DuplicateKey;

/// How an application message travels through the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    /// Send to the leader, await a response message.
    RequestReply,
    /// Send to the leader, acknowledge after local acceptance.
    OneWay,
    /// Fire-and-forget: acknowledged before processing starts.
    OneWayNoAck,
}

impl DeliveryMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryMode::RequestReply => "request-reply",
            DeliveryMode::OneWay => "one-way",
            DeliveryMode::OneWayNoAck => "one-way-no-ack",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "request-reply" => Some(DeliveryMode::RequestReply),
            "one-way" => Some(DeliveryMode::OneWay),
            "one-way-no-ack" => Some(DeliveryMode::OneWayNoAck),
            _ => None,
        }
    }

    /// Signals are deduplicated; request-reply exchanges need their reply
    /// even when retried.
    pub fn is_signal(&self) -> bool {
        matches!(self, DeliveryMode::OneWay | DeliveryMode::OneWayNoAck)
    }
}

/// An application message addressed to the cluster leader.
///
/// `message_id` stays stable across router retries, so receivers can
/// suppress replays through the duplicate detector.
#[derive(Debug, Clone)]
pub struct AppMessage {
    pub sender_id: Uuid,
    pub message_id: Uuid,
    pub name: String,
    pub content_type: String,
    pub payload: Bytes,
}

impl AppMessage {
    pub fn new(sender_id: Uuid, name: impl Into<String>, payload: Bytes) -> Self {
        Self {
            sender_id,
            message_id: Uuid::new_v4(),
            name: name.into(),
            content_type: "application/octet-stream".into(),
            payload,
        }
    }

    pub fn duplicate_key(&self) -> DuplicateKey {
        DuplicateKey::new(self.sender_id, self.message_id)
    }
}

/// What a request-reply handler returns.
#[derive(Debug, Clone)]
pub struct MessageReply {
    pub name: String,
    pub content_type: String,
    pub payload: Bytes,
}
