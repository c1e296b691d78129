//! Typed publish/subscribe used for connection and call broadcasts.
//!
//! Listeners are invoked synchronously, in the order they subscribed. The
//! listener list is snapshotted before delivery, so a listener may subscribe
//! or unsubscribe from inside its callback without deadlocking.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Handle returned by [`Broadcaster::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

pub struct Broadcaster<T> {
    next_id: AtomicU64,
    listeners: Mutex<Vec<(SubscriptionId, Listener<T>)>>,
}

impl<T> Broadcaster<T> {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut guard = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
        guard.push((id, Arc::new(listener)));
        id
    }

    /// Remove a listener. Returns false if it was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut guard = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
        let before = guard.len();
        guard.retain(|(sid, _)| *sid != id);
        guard.len() != before
    }

    /// Deliver `event` to every listener in subscription order.
    pub fn emit(&self, event: &T) {
        let snapshot: Vec<Listener<T>> = {
            let guard = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
            guard.iter().map(|(_, l)| l.clone()).collect()
        };
        for listener in snapshot {
            listener(event);
        }
    }

    pub fn clear(&self) {
        self.listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    pub fn len(&self) -> usize {
        self.listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for Broadcaster<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delivery_in_subscription_order() {
        let bus: Broadcaster<u32> = Broadcaster::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for tag in ["a", "b", "c"] {
            let seen = seen.clone();
            bus.subscribe(move |v: &u32| seen.lock().unwrap().push(format!("{}{}", tag, v)));
        }

        bus.emit(&1);
        bus.emit(&2);
        assert_eq!(
            *seen.lock().unwrap(),
            vec!["a1", "b1", "c1", "a2", "b2", "c2"]
        );
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let bus: Broadcaster<u32> = Broadcaster::new();
        let count = Arc::new(AtomicU64::new(0));
        let c = count.clone();
        let id = bus.subscribe(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(&0);
        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        bus.emit(&0);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_listener_may_subscribe_during_emit() {
        let bus: Arc<Broadcaster<u32>> = Arc::new(Broadcaster::new());
        let inner = bus.clone();
        bus.subscribe(move |_| {
            inner.subscribe(|_| {});
        });
        bus.emit(&0);
        assert_eq!(bus.len(), 2);

        bus.clear();
        assert_eq!(bus.len(), 0);
    }
}
