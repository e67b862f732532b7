//! Admission control for prefetch loads.
//!
//! Keys wait in a FIFO [`Backlog`] in request order. The
//! [`AdmissionController`] pops keys while both caps allow: loads in flight
//! stay under the network concurrency, and buffered plus loading items stay
//! under the effective capacity. A key the consumer is blocked on can be
//! promoted to the front of the backlog, and is started past the capacity
//! cap as long as a network slot is free.

use std::collections::{HashSet, VecDeque};
use tracing::trace;

/// Ordered queue of keys not yet admitted for loading.
///
/// A key is present at most once.
#[derive(Debug, Default)]
pub struct Backlog {
    queue: VecDeque<String>,
    members: HashSet<String>,
}

impl Backlog {
    /// Create an empty backlog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a backlog from keys in request order. Duplicates are ignored.
    pub fn from_keys<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut backlog = Self::new();
        for key in keys {
            backlog.push_back(key.into());
        }
        backlog
    }

    /// Append a key. Returns false if it was already queued.
    pub fn push_back(&mut self, key: String) -> bool {
        if !self.members.insert(key.clone()) {
            return false;
        }
        self.queue.push_back(key);
        true
    }

    /// Take the next key.
    pub fn pop_front(&mut self) -> Option<String> {
        let key = self.queue.pop_front()?;
        self.members.remove(&key);
        Some(key)
    }

    /// Move a queued key to the front. Returns whether the key was queued.
    pub fn promote(&mut self, key: &str) -> bool {
        if !self.members.contains(key) {
            return false;
        }
        if let Some(pos) = self.queue.iter().position(|k| k == key) {
            if pos > 0 {
                if let Some(k) = self.queue.remove(pos) {
                    self.queue.push_front(k);
                }
            }
        }
        true
    }

    /// Put keys back at the front, preserving their given order.
    pub fn requeue_front(&mut self, keys: Vec<String>) {
        for key in keys.into_iter().rev() {
            if self.members.insert(key.clone()) {
                self.queue.push_front(key);
            }
        }
    }

    /// Drop a key. Returns whether it was queued.
    pub fn remove(&mut self, key: &str) -> bool {
        if !self.members.remove(key) {
            return false;
        }
        self.queue.retain(|k| k != key);
        true
    }

    /// Keep only keys matching the predicate. Returns the dropped keys.
    pub fn retain(&mut self, mut keep: impl FnMut(&str) -> bool) -> Vec<String> {
        let mut dropped = Vec::new();
        self.queue.retain(|k| {
            if keep(k) {
                true
            } else {
                dropped.push(k.clone());
                false
            }
        });
        for key in &dropped {
            self.members.remove(key);
        }
        dropped
    }

    /// Check if a key is queued.
    pub fn contains(&self, key: &str) -> bool {
        self.members.contains(key)
    }

    /// Number of queued keys.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Check if the backlog is empty.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Drop every key.
    pub fn clear(&mut self) {
        self.queue.clear();
        self.members.clear();
    }

    /// Queued keys, front first.
    pub fn snapshot(&self) -> Vec<String> {
        self.queue.iter().cloned().collect()
    }
}

/// Outcome of a single admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Another load may start
    Allowed,
    /// The run is aborted
    Aborted,
    /// Loads in flight reached the network concurrency
    ConcurrencyLimit,
    /// Buffered plus loading items reached the effective capacity
    CapacityLimit,
}

impl Admission {
    /// Check if a load may start.
    pub fn is_allowed(&self) -> bool {
        matches!(self, Admission::Allowed)
    }
}

/// Enforces the concurrency and capacity caps.
#[derive(Debug, Clone)]
pub struct AdmissionController {
    network_concurrency: usize,
}

impl AdmissionController {
    /// Create a controller with the given concurrency cap (at least 1).
    pub fn new(network_concurrency: usize) -> Self {
        Self {
            network_concurrency: network_concurrency.max(1),
        }
    }

    /// Concurrency cap.
    pub fn network_concurrency(&self) -> usize {
        self.network_concurrency
    }

    /// Evaluate the caps against the current counts.
    pub fn check(&self, loading: usize, buffered: usize, capacity: usize, aborted: bool) -> Admission {
        if aborted {
            return Admission::Aborted;
        }
        if loading >= self.network_concurrency {
            return Admission::ConcurrencyLimit;
        }
        if buffered + loading >= capacity {
            return Admission::CapacityLimit;
        }
        Admission::Allowed
    }

    /// Pop keys from the backlog while the caps allow.
    ///
    /// Admitted keys are added to `loading` and returned in admission order.
    /// Keys already loading or staged are dropped from the backlog without
    /// starting a second load.
    pub fn admit(
        &self,
        backlog: &mut Backlog,
        loading: &mut HashSet<String>,
        buffered: usize,
        capacity: usize,
        aborted: bool,
        is_staged: impl Fn(&str) -> bool,
    ) -> Vec<String> {
        let mut admitted = Vec::new();

        loop {
            let decision = self.check(loading.len(), buffered, capacity, aborted);
            if !decision.is_allowed() {
                trace!(
                    ?decision,
                    loading = loading.len(),
                    buffered,
                    capacity,
                    queued = backlog.len(),
                    "Admission paused"
                );
                break;
            }

            let Some(key) = backlog.pop_front() else {
                break;
            };

            if loading.contains(&key) || is_staged(&key) {
                continue;
            }

            loading.insert(key.clone());
            admitted.push(key);
        }

        admitted
    }

    /// Start the key the consumer is blocked on, ignoring the capacity cap.
    ///
    /// Only the concurrency cap applies, so staged items needed later can
    /// never starve the current one. Returns whether the key was admitted.
    pub fn admit_pinned(
        &self,
        backlog: &mut Backlog,
        loading: &mut HashSet<String>,
        key: &str,
        aborted: bool,
    ) -> bool {
        if aborted || loading.len() >= self.network_concurrency || !backlog.contains(key) {
            return false;
        }
        backlog.remove(key);
        loading.insert(key.to_string());
        trace!(key, loading = loading.len(), "Admitted pinned key past capacity");
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(n: usize) -> Vec<String> {
        (1..=n).map(|i| format!("g{}", i)).collect()
    }

    #[test]
    fn test_backlog_fifo_and_dedup() {
        let mut backlog = Backlog::from_keys(["a", "b", "a", "c"]);
        assert_eq!(backlog.len(), 3);
        assert!(!backlog.push_back("b".into()));

        assert_eq!(backlog.pop_front().as_deref(), Some("a"));
        assert_eq!(backlog.pop_front().as_deref(), Some("b"));
        assert_eq!(backlog.pop_front().as_deref(), Some("c"));
        assert!(backlog.pop_front().is_none());
        assert!(backlog.is_empty());
    }

    #[test]
    fn test_backlog_promote() {
        let mut backlog = Backlog::from_keys(keys(10));

        assert!(backlog.promote("g7"));
        assert_eq!(backlog.snapshot()[0], "g7");
        assert_eq!(backlog.snapshot()[1], "g1");
        assert_eq!(backlog.len(), 10);

        // Already at the front
        assert!(backlog.promote("g7"));
        assert_eq!(backlog.snapshot()[0], "g7");

        assert!(!backlog.promote("g99"));
    }

    #[test]
    fn test_backlog_requeue_front_preserves_order() {
        let mut backlog = Backlog::from_keys(["g5", "g6"]);
        backlog.requeue_front(vec!["g2".into(), "g3".into(), "g5".into()]);

        assert_eq!(backlog.snapshot(), vec!["g2", "g3", "g5", "g6"]);
    }

    #[test]
    fn test_backlog_remove_and_retain() {
        let mut backlog = Backlog::from_keys(keys(5));
        assert!(backlog.remove("g3"));
        assert!(!backlog.remove("g3"));
        assert!(!backlog.contains("g3"));

        let dropped = backlog.retain(|k| k != "g1" && k != "g4");
        assert_eq!(dropped, vec!["g1", "g4"]);
        assert_eq!(backlog.snapshot(), vec!["g2", "g5"]);
        assert!(!backlog.contains("g4"));
        assert!(backlog.push_back("g1".into()));
    }

    #[test]
    fn test_check_order() {
        let controller = AdmissionController::new(3);
        assert_eq!(controller.check(0, 0, 5, true), Admission::Aborted);
        assert_eq!(controller.check(3, 0, 5, false), Admission::ConcurrencyLimit);
        assert_eq!(controller.check(2, 3, 5, false), Admission::CapacityLimit);
        assert_eq!(controller.check(2, 2, 5, false), Admission::Allowed);
    }

    #[test]
    fn test_admit_respects_concurrency() {
        let controller = AdmissionController::new(3);
        let mut backlog = Backlog::from_keys(keys(10));
        let mut loading = HashSet::new();

        let admitted = controller.admit(&mut backlog, &mut loading, 0, 5, false, |_| false);

        assert_eq!(admitted, vec!["g1", "g2", "g3"]);
        assert_eq!(loading.len(), 3);
        assert_eq!(backlog.len(), 7);
    }

    #[test]
    fn test_admit_respects_capacity() {
        let controller = AdmissionController::new(8);
        let mut backlog = Backlog::from_keys(keys(10));
        let mut loading = HashSet::new();

        let admitted = controller.admit(&mut backlog, &mut loading, 3, 5, false, |_| false);

        assert_eq!(admitted, vec!["g1", "g2"]);
        assert_eq!(backlog.len(), 8);
    }

    #[test]
    fn test_admit_skips_loading_and_staged() {
        let controller = AdmissionController::new(4);
        let mut backlog = Backlog::from_keys(["g1", "g2", "g3", "g4"]);
        let mut loading: HashSet<String> = ["g1".to_string()].into_iter().collect();

        let admitted =
            controller.admit(&mut backlog, &mut loading, 0, 10, false, |k| k == "g2");

        assert_eq!(admitted, vec!["g3", "g4"]);
        assert!(backlog.is_empty());
    }

    #[test]
    fn test_admit_nothing_when_aborted() {
        let controller = AdmissionController::new(4);
        let mut backlog = Backlog::from_keys(keys(4));
        let mut loading = HashSet::new();

        let admitted = controller.admit(&mut backlog, &mut loading, 0, 10, true, |_| false);
        assert!(admitted.is_empty());
        assert_eq!(backlog.len(), 4);
    }

    #[test]
    fn test_pinned_key_bypasses_capacity() {
        let controller = AdmissionController::new(2);
        let mut backlog = Backlog::from_keys(["g1", "g5", "g6"]);
        let mut loading = HashSet::new();

        // Buffer already full of later items
        assert!(controller
            .admit(&mut backlog, &mut loading, 4, 4, false, |_| false)
            .is_empty());

        assert!(controller.admit_pinned(&mut backlog, &mut loading, "g1", false));
        assert!(loading.contains("g1"));
        assert_eq!(backlog.snapshot(), vec!["g5", "g6"]);

        // Not queued any more
        assert!(!controller.admit_pinned(&mut backlog, &mut loading, "g1", false));
    }

    #[test]
    fn test_pinned_key_respects_concurrency_and_abort() {
        let controller = AdmissionController::new(1);
        let mut backlog = Backlog::from_keys(["g1", "g2"]);
        let mut loading: HashSet<String> = ["g9".to_string()].into_iter().collect();

        assert!(!controller.admit_pinned(&mut backlog, &mut loading, "g1", false));

        loading.clear();
        assert!(!controller.admit_pinned(&mut backlog, &mut loading, "g1", true));
        assert_eq!(backlog.len(), 2);
        assert!(loading.is_empty());
    }

    #[test]
    fn test_zero_concurrency_is_clamped() {
        assert_eq!(AdmissionController::new(0).network_concurrency(), 1);
    }
}
