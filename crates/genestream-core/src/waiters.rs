//! Per-key registry of consumers blocked on an item that is not staged yet.
//!
//! Each waiter holds a oneshot sender. Resolving a key wakes every waiter on
//! it at once; aborting a run wakes every waiter with a failure marker. A
//! waiter that times out removes its own registration.

use crate::error::LoadError;
use crate::store::ExpressionVector;
use std::collections::HashMap;
use tokio::sync::oneshot;

/// Identifies one registration so it can be cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WaiterId(u64);

/// What a woken waiter learns about its key.
#[derive(Debug, Clone, PartialEq)]
pub enum WaitSignal {
    /// The vector is staged
    Ready(ExpressionVector),
    /// The key failed, or the run ended
    Failed(LoadError),
}

#[derive(Debug)]
struct Waiter {
    id: WaiterId,
    sender: oneshot::Sender<WaitSignal>,
}

/// Key → blocked consumers.
#[derive(Debug, Default)]
pub struct WaiterRegistry {
    waiters: HashMap<String, Vec<Waiter>>,
    next_id: u64,
}

impl WaiterRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a waiter on `key`.
    pub fn register(&mut self, key: &str) -> (WaiterId, oneshot::Receiver<WaitSignal>) {
        let (sender, receiver) = oneshot::channel();
        let id = WaiterId(self.next_id);
        self.next_id += 1;

        self.waiters
            .entry(key.to_string())
            .or_default()
            .push(Waiter { id, sender });

        (id, receiver)
    }

    /// Wake every waiter on `key`. Returns how many were woken.
    pub fn resolve(&mut self, key: &str, signal: WaitSignal) -> usize {
        let Some(waiters) = self.waiters.remove(key) else {
            return 0;
        };
        let count = waiters.len();
        for waiter in waiters {
            // Receiver may already be gone after a timeout race.
            let _ = waiter.sender.send(signal.clone());
        }
        count
    }

    /// Remove one registration. Returns whether it was still registered.
    pub fn cancel(&mut self, key: &str, id: WaiterId) -> bool {
        let Some(waiters) = self.waiters.get_mut(key) else {
            return false;
        };
        let before = waiters.len();
        waiters.retain(|w| w.id != id);
        let removed = waiters.len() < before;
        if waiters.is_empty() {
            self.waiters.remove(key);
        }
        removed
    }

    /// Check if anyone is waiting on `key`.
    pub fn has_waiters(&self, key: &str) -> bool {
        self.waiters.contains_key(key)
    }

    /// Wake every waiter on every key with the same signal.
    pub fn release_all(&mut self, signal: WaitSignal) -> usize {
        let mut count = 0;
        for (_, waiters) in self.waiters.drain() {
            for waiter in waiters {
                let _ = waiter.sender.send(signal.clone());
                count += 1;
            }
        }
        count
    }

    /// Total registered waiters.
    pub fn len(&self) -> usize {
        self.waiters.values().map(Vec::len).sum()
    }

    /// Check if nobody is waiting.
    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ready() -> WaitSignal {
        WaitSignal::Ready(vec![1.0f32, 2.0].into())
    }

    #[tokio::test]
    async fn test_resolve_wakes_all_waiters() {
        let mut registry = WaiterRegistry::new();
        let (_, rx1) = registry.register("g1");
        let (_, rx2) = registry.register("g1");
        let (_, mut rx3) = registry.register("g2");

        assert_eq!(registry.len(), 3);
        assert_eq!(registry.resolve("g1", ready()), 2);

        assert_eq!(rx1.await.unwrap(), ready());
        assert_eq!(rx2.await.unwrap(), ready());
        assert!(rx3.try_recv().is_err());
        assert!(!registry.has_waiters("g1"));
        assert!(registry.has_waiters("g2"));
    }

    #[tokio::test]
    async fn test_resolve_with_failure() {
        let mut registry = WaiterRegistry::new();
        let (_, rx) = registry.register("bad");

        registry.resolve("bad", WaitSignal::Failed(LoadError::NotRequested("bad".into())));

        assert!(matches!(rx.await.unwrap(), WaitSignal::Failed(_)));
    }

    #[test]
    fn test_resolve_unknown_key() {
        let mut registry = WaiterRegistry::new();
        assert_eq!(registry.resolve("nobody", ready()), 0);
    }

    #[test]
    fn test_cancel_cleans_up() {
        let mut registry = WaiterRegistry::new();
        let (a, _rx_a) = registry.register("g1");
        let (b, _rx_b) = registry.register("g1");

        assert!(registry.cancel("g1", a));
        assert!(!registry.cancel("g1", a));
        assert!(registry.has_waiters("g1"));

        assert!(registry.cancel("g1", b));
        assert!(!registry.has_waiters("g1"));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_release_all_on_abort() {
        let mut registry = WaiterRegistry::new();
        let receivers: Vec<_> = ["g1", "g2", "g2", "g3"]
            .iter()
            .map(|k| registry.register(k).1)
            .collect();

        assert_eq!(registry.len(), 4);
        assert_eq!(
            registry.release_all(WaitSignal::Failed(LoadError::Aborted)),
            4
        );
        assert!(registry.is_empty());

        for rx in receivers {
            assert_eq!(rx.await.unwrap(), WaitSignal::Failed(LoadError::Aborted));
        }
    }

    #[test]
    fn test_resolve_after_receiver_dropped() {
        let mut registry = WaiterRegistry::new();
        let (_, rx) = registry.register("g1");
        drop(rx);
        assert_eq!(registry.resolve("g1", ready()), 1);
    }
}
