use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::bus::{AppMessage, MessageReply};
use crate::error::Result;

/// An input-channel listener for application messages.
///
/// `supports` claims a message by name; delivery tries handlers in
/// subscription order and the first claimant wins.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    fn supports(&self, name: &str) -> bool;

    async fn handle_request(&self, message: AppMessage) -> Result<MessageReply>;

    async fn handle_signal(&self, message: AppMessage) -> Result<()>;
}

/// Token returned by `add_listener`; passes back to `remove_listener`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerRegistration(u64);

/// An immutable, ordered handler list published by copy-on-write.
///
/// Readers capture one snapshot per operation and never observe a torn
/// list; a subscription is visible to all subsequent dispatches but not
/// necessarily to one already in flight.
#[derive(Default)]
pub struct HandlerList {
    entries: RwLock<Arc<Vec<(u64, Arc<dyn MessageHandler>)>>>,
    next_id: AtomicU64,
}

impl HandlerList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_listener(&self, handler: Arc<dyn MessageHandler>) -> HandlerRegistration {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut entries = self.entries.write();
        let mut next: Vec<_> = entries.as_ref().clone();
        next.push((id, handler));
        *entries = Arc::new(next);
        HandlerRegistration(id)
    }

    pub fn remove_listener(&self, registration: HandlerRegistration) {
        let mut entries = self.entries.write();
        let next: Vec<_> = entries
            .iter()
            .filter(|(id, _)| *id != registration.0)
            .cloned()
            .collect();
        *entries = Arc::new(next);
    }

    /// The current published snapshot.
    pub fn snapshot(&self) -> Arc<Vec<(u64, Arc<dyn MessageHandler>)>> {
        self.entries.read().clone()
    }

    /// First handler claiming `name`, in subscription order.
    pub fn find(&self, name: &str) -> Option<Arc<dyn MessageHandler>> {
        self.snapshot()
            .iter()
            .find(|(_, h)| h.supports(name))
            .map(|(_, h)| h.clone())
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes every listener. Part of node shutdown.
    pub fn drain(&self) {
        *self.entries.write() = Arc::new(Vec::new());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::sync::atomic::AtomicUsize;

    struct NamedHandler {
        name: &'static str,
        calls: AtomicUsize,
    }

    impl NamedHandler {
        fn new(name: &'static str) -> Arc<Self> {
            Arc::new(Self {
                name,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl MessageHandler for NamedHandler {
        fn supports(&self, name: &str) -> bool {
            name == self.name
        }

        async fn handle_request(&self, message: AppMessage) -> Result<MessageReply> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(MessageReply {
                name: message.name,
                content_type: message.content_type,
                payload: Bytes::from_static(b"ok"),
            })
        }

        async fn handle_signal(&self, _message: AppMessage) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_add_and_find() {
        let list = HandlerList::new();
        assert!(list.find("ping").is_none());

        list.add_listener(NamedHandler::new("ping"));
        assert!(list.find("ping").is_some());
        assert!(list.find("pong").is_none());
    }

    #[tokio::test]
    async fn test_first_claimant_wins() {
        let list = HandlerList::new();
        let first = NamedHandler::new("ping");
        let second = NamedHandler::new("ping");
        list.add_listener(first.clone());
        list.add_listener(second.clone());

        let found = list.find("ping").unwrap();
        let msg = AppMessage::new(uuid::Uuid::new_v4(), "ping", Bytes::new());
        found.handle_signal(msg).await.unwrap();

        assert_eq!(first.calls.load(Ordering::SeqCst), 1);
        assert_eq!(second.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_remove_listener() {
        let list = HandlerList::new();
        let registration = list.add_listener(NamedHandler::new("ping"));
        list.add_listener(NamedHandler::new("pong"));

        list.remove_listener(registration);
        assert!(list.find("ping").is_none());
        assert!(list.find("pong").is_some());
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn test_snapshot_is_stable_across_mutation() {
        let list = HandlerList::new();
        list.add_listener(NamedHandler::new("ping"));
        let snapshot = list.snapshot();

        list.add_listener(NamedHandler::new("pong"));
        // The captured snapshot still sees the old list
        assert_eq!(snapshot.len(), 1);
        assert_eq!(list.len(), 2);
    }

    #[test]
    fn test_drain() {
        let list = HandlerList::new();
        list.add_listener(NamedHandler::new("ping"));
        list.drain();
        assert!(list.is_empty());
    }
}
