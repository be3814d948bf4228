//! Bounded, drop-oldest retry queue for pending publishes.
//!
//! FIFO ordering is the whole point: dequeue order must equal enqueue order
//! for every element that survives. All operations take a single lock and
//! never hold it across I/O — callers peek the oldest entry, attempt the
//! wire write outside the lock, then pop only on success.

use std::collections::VecDeque;
use std::sync::Mutex;

/// Default bound (`K` in the design doc). Overridable per `RtmConnection`.
pub const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingPublish {
    pub id: u64,
    pub wire: String,
}

pub struct RetryQueue {
    inner: Mutex<VecDeque<PendingPublish>>,
    capacity: usize,
}

impl RetryQueue {
    pub fn new(capacity: usize) -> Self {
        RetryQueue {
            inner: Mutex::new(VecDeque::with_capacity(capacity.min(4096))),
            capacity,
        }
    }

    /// Push `item` as the newest element. If already at capacity, evict the
    /// oldest element first — freshness over completeness.
    pub fn enqueue(&self, item: PendingPublish) {
        let mut q = self.inner.lock().expect("retry queue mutex poisoned");
        if q.len() >= self.capacity {
            q.pop_front();
        }
        q.push_back(item);
    }

    /// Look at the oldest element without removing it. Two-step drain: the
    /// caller removes it only after confirming the wire write succeeded,
    /// which is what preserves ordering under partial failures.
    pub fn peek_oldest(&self) -> Option<PendingPublish> {
        let q = self.inner.lock().expect("retry queue mutex poisoned");
        q.front().cloned()
    }

    /// Remove the oldest element after a confirmed successful send.
    pub fn pop_oldest(&self) -> Option<PendingPublish> {
        let mut q = self.inner.lock().expect("retry queue mutex poisoned");
        q.pop_front()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("retry queue mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(id: u64) -> PendingPublish {
        PendingPublish {
            id,
            wire: format!("pdu-{id}"),
        }
    }

    #[test]
    fn bound_is_respected_and_oldest_is_evicted() {
        let q = RetryQueue::new(256);
        for i in 0..300u64 {
            q.enqueue(item(i));
        }
        assert_eq!(q.len(), 256);
        // The 256 retained are the newest 256: ids 44..=299.
        let oldest = q.peek_oldest().unwrap();
        assert_eq!(oldest.id, 44);
    }

    #[test]
    fn dequeue_order_matches_enqueue_order_for_survivors() {
        let q = RetryQueue::new(256);
        for i in 0..300u64 {
            q.enqueue(item(i));
        }
        let mut prev = None;
        while let Some(p) = q.pop_oldest() {
            if let Some(prev_id) = prev {
                assert!(p.id > prev_id);
            }
            prev = Some(p.id);
        }
        assert_eq!(prev, Some(299));
    }

    #[test]
    fn peek_does_not_remove() {
        let q = RetryQueue::new(4);
        q.enqueue(item(1));
        assert_eq!(q.peek_oldest().unwrap().id, 1);
        assert_eq!(q.len(), 1);
        assert_eq!(q.pop_oldest().unwrap().id, 1);
        assert!(q.is_empty());
    }
}
