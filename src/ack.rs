//! Ack correlation: pairs outbound ack requests with inbound ack responses.

use std::collections::HashMap;
use std::sync::{Mutex, RwLock};

use tokio::sync::oneshot;

/// Registry of pending acks, keyed by ack id.
///
/// Ids are drawn from a monotonic counter wrapping at `i32::MAX`; the counter
/// has its own lock so id allocation never contends with reply delivery.
#[derive(Debug, Default)]
pub(crate) struct AckWaiter {
    counter: Mutex<i64>,
    pending: RwLock<HashMap<i64, oneshot::Sender<String>>>,
}

impl AckWaiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next ack id.
    pub fn next(&self) -> i64 {
        let mut counter = self.counter.lock().unwrap();

        if *counter == i32::MAX as i64 {
            *counter = -1;
        }

        *counter += 1;
        *counter
    }

    /// Register a reply slot. An existing entry at `id` is overwritten; ids
    /// are unique within a wrap epoch.
    pub fn insert(&self, id: i64, slot: oneshot::Sender<String>) {
        self.pending.write().unwrap().insert(id, slot);
    }

    /// Consume the reply slot for `id`, if one is pending.
    pub fn take(&self, id: i64) -> Option<oneshot::Sender<String>> {
        self.pending.write().unwrap().remove(&id)
    }

    /// Drop the reply slot for `id` without delivering anything.
    pub fn remove(&self, id: i64) {
        self.pending.write().unwrap().remove(&id);
    }

    pub fn len(&self) -> usize {
        self.pending.read().unwrap().len()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn waiter_ids_and_slots() {
        let w = AckWaiter::new();
        assert_eq!(w.len(), 0);

        assert_eq!(w.next(), 1);

        let (tx, _rx) = oneshot::channel();
        w.insert(1, tx);

        assert_eq!(w.next(), 2);
        assert_eq!(w.len(), 1);

        assert!(w.take(1).is_some());
        assert!(w.take(1).is_none());
        assert_eq!(w.len(), 0);

        assert_eq!(w.next(), 3);
    }

    #[test]
    fn waiter_wraps_at_i32_max() {
        let w = AckWaiter::new();
        *w.counter.lock().unwrap() = i32::MAX as i64 - 2;

        w.next();
        w.next();
        w.next();
        w.remove(i32::MAX as i64);
        w.next();

        assert_eq!(w.next(), 2);
    }

    #[test]
    fn waiter_ids_stay_non_negative_across_wrap() {
        let w = AckWaiter::new();
        *w.counter.lock().unwrap() = i32::MAX as i64 - 1;

        assert_eq!(w.next(), i32::MAX as i64);
        assert_eq!(w.next(), 0);
        assert_eq!(w.next(), 1);
    }

    #[tokio::test]
    async fn waiter_delivers_through_slot() {
        let w = AckWaiter::new();
        let (tx, rx) = oneshot::channel();

        let id = w.next();
        w.insert(id, tx);

        w.take(id).unwrap().send("[\"hello\"]".to_owned()).unwrap();
        assert_eq!(rx.await.unwrap(), "[\"hello\"]");
    }
}
