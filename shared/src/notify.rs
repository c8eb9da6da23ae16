//! Subscription lists for presentation-layer observers
//!
//! Listeners are called in subscription order. A listener that panics is
//! logged and skipped; the remaining listeners are still notified.

use log::error;
use parking_lot::RwLock;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub type Listener<E> = Arc<dyn Fn(&E) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

pub struct Listeners<E> {
    entries: RwLock<Vec<(SubscriptionId, Listener<E>)>>,
    next_id: AtomicU64,
}

impl<E> Default for Listeners<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> Listeners<E> {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.entries.write().push((id, Arc::new(listener)));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|(entry_id, _)| *entry_id != id);
        entries.len() != before
    }

    /// Delivers `event` to every listener and returns how many completed.
    pub fn notify(&self, event: &E) -> usize {
        // Snapshot the list so listeners may (un)subscribe while being called.
        let listeners: Vec<Listener<E>> = self
            .entries
            .read()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();

        let mut delivered = 0;
        for listener in listeners {
            match catch_unwind(AssertUnwindSafe(|| listener(event))) {
                Ok(()) => delivered += 1,
                Err(_) => error!("Listener panicked while handling event; continuing"),
            }
        }
        delivered
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_subscribe_and_notify() {
        let listeners = Listeners::<u32>::new();
        let total = Arc::new(AtomicUsize::new(0));

        let sink = Arc::clone(&total);
        listeners.subscribe(move |value| {
            sink.fetch_add(*value as usize, Ordering::SeqCst);
        });

        assert_eq!(listeners.notify(&5), 1);
        assert_eq!(total.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let listeners = Listeners::<u32>::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let sink = Arc::clone(&calls);
        let id = listeners.subscribe(move |_| {
            sink.fetch_add(1, Ordering::SeqCst);
        });

        assert!(listeners.unsubscribe(id));
        assert!(!listeners.unsubscribe(id));
        listeners.notify(&1);

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(listeners.is_empty());
    }

    #[test]
    fn test_panicking_listener_does_not_block_others() {
        let listeners = Listeners::<&'static str>::new();
        let calls = Arc::new(AtomicUsize::new(0));

        listeners.subscribe(|_| panic!("presentation layer bug"));
        let sink = Arc::clone(&calls);
        listeners.subscribe(move |_| {
            sink.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(listeners.notify(&"progress"), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
