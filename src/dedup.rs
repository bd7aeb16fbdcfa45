use std::collections::{HashSet, VecDeque};

use parking_lot::Mutex;
use uuid::Uuid;

use crate::cell::AtomicCell;

/// Identifies a logical message: the sender assigns a message id that is
/// unique per sender for the retention window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DuplicateKey {
    pub sender_id: Uuid,
    pub message_id: Uuid,
}

impl DuplicateKey {
    pub fn new(sender_id: Uuid, message_id: Uuid) -> Self {
        Self {
            sender_id,
            message_id,
        }
    }
}

/// Node-global detector for replayed application messages.
///
/// Bounded by entry count with FIFO eviction: a replay is missed only after
/// `capacity` newer messages have been recorded, and a unique message is
/// never reported as a duplicate while its key is retained.
#[derive(Debug)]
pub struct DuplicateDetector {
    inner: Mutex<DetectorInner>,
    capacity: usize,
    /// Bumped on every eviction sweep; lets callers observe retention churn.
    generation: AtomicCell,
}

#[derive(Debug)]
struct DetectorInner {
    seen: HashSet<DuplicateKey>,
    order: VecDeque<DuplicateKey>,
}

impl DuplicateDetector {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(DetectorInner {
                seen: HashSet::with_capacity(capacity),
                order: VecDeque::with_capacity(capacity),
            }),
            capacity,
            generation: AtomicCell::new(0),
        }
    }

    /// Records `key` and returns true iff it was already present.
    pub fn is_duplicate(&self, key: DuplicateKey) -> bool {
        let mut inner = self.inner.lock();
        if !inner.seen.insert(key) {
            return true;
        }
        inner.order.push_back(key);
        if inner.order.len() > self.capacity {
            if let Some(evicted) = inner.order.pop_front() {
                inner.seen.remove(&evicted);
            }
            self.generation.update(|g| g.wrapping_add(1));
        }
        false
    }

    /// Number of eviction sweeps since creation.
    pub fn generation(&self) -> u64 {
        self.generation.read()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> DuplicateKey {
        DuplicateKey::new(Uuid::new_v4(), Uuid::new_v4())
    }

    #[test]
    fn test_first_sighting_is_not_duplicate() {
        let detector = DuplicateDetector::new(16);
        let k = key();
        assert!(!detector.is_duplicate(k));
        assert!(detector.is_duplicate(k));
        assert!(detector.is_duplicate(k));
    }

    #[test]
    fn test_distinct_keys_never_collide() {
        let detector = DuplicateDetector::new(16);
        let sender = Uuid::new_v4();
        let a = DuplicateKey::new(sender, Uuid::new_v4());
        let b = DuplicateKey::new(sender, Uuid::new_v4());
        assert!(!detector.is_duplicate(a));
        assert!(!detector.is_duplicate(b));
    }

    #[test]
    fn test_same_message_id_different_sender() {
        let detector = DuplicateDetector::new(16);
        let message_id = Uuid::new_v4();
        assert!(!detector.is_duplicate(DuplicateKey::new(Uuid::new_v4(), message_id)));
        assert!(!detector.is_duplicate(DuplicateKey::new(Uuid::new_v4(), message_id)));
    }

    #[test]
    fn test_eviction_past_capacity() {
        let detector = DuplicateDetector::new(3);
        let first = key();
        assert!(!detector.is_duplicate(first));
        for _ in 0..3 {
            assert!(!detector.is_duplicate(key()));
        }
        // `first` aged out, so its replay goes undetected (tolerated false negative)
        assert!(!detector.is_duplicate(first));
        assert!(detector.generation() > 0);
        assert_eq!(detector.len(), 3);
    }

    #[test]
    fn test_capacity_floor() {
        let detector = DuplicateDetector::new(0);
        let k = key();
        assert!(!detector.is_duplicate(k));
        assert!(detector.is_duplicate(k));
    }
}
