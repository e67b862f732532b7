//! Staging buffer for loaded-but-not-yet-consumed items.
//!
//! Entries are added only by load completions (a vector or a failure marker)
//! and leave the buffer when consumed, pruned under pressure, swept behind the
//! consumer, or cleared at teardown. Only vectors count toward capacity;
//! failure markers hold no memory and stay until the consumer reaches them.

use crate::error::LoadError;
use crate::store::LoadedVector;
use std::collections::HashMap;

/// A staged outcome for one key.
#[derive(Debug, Clone)]
pub enum StagedItem {
    /// Loaded vector waiting for the consumer
    Ready(LoadedVector),
    /// Failure marker; the key is skipped and never retried in the run
    Failed(LoadError),
}

impl StagedItem {
    /// Check if this is a loaded vector.
    pub fn is_ready(&self) -> bool {
        matches!(self, StagedItem::Ready(_))
    }
}

#[derive(Debug)]
struct Entry {
    /// Position of the key in the request list
    index: usize,
    item: StagedItem,
}

/// Key → staged outcome, with byte accounting for ready vectors.
#[derive(Debug, Default)]
pub struct StagingBuffer {
    entries: HashMap<String, Entry>,
    ready_bytes: usize,
}

impl StagingBuffer {
    /// Create an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage a loaded vector.
    pub fn insert_ready(&mut self, key: String, index: usize, vector: LoadedVector) {
        self.ready_bytes += vector.byte_size;
        self.insert(key, index, StagedItem::Ready(vector));
    }

    /// Stage a failure marker.
    pub fn insert_failed(&mut self, key: String, index: usize, error: LoadError) {
        self.insert(key, index, StagedItem::Failed(error));
    }

    fn insert(&mut self, key: String, index: usize, item: StagedItem) {
        if let Some(previous) = self.entries.insert(key, Entry { index, item }) {
            self.forget_bytes(&previous.item);
        }
    }

    fn forget_bytes(&mut self, item: &StagedItem) {
        if let StagedItem::Ready(vector) = item {
            self.ready_bytes = self.ready_bytes.saturating_sub(vector.byte_size);
        }
    }

    /// Check if the key has a staged outcome.
    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Peek at a staged outcome.
    pub fn get(&self, key: &str) -> Option<&StagedItem> {
        self.entries.get(key).map(|e| &e.item)
    }

    /// Remove and return a staged outcome.
    pub fn take(&mut self, key: &str) -> Option<StagedItem> {
        let entry = self.entries.remove(key)?;
        self.forget_bytes(&entry.item);
        Some(entry.item)
    }

    /// Number of staged vectors.
    pub fn ready_count(&self) -> usize {
        self.entries.values().filter(|e| e.item.is_ready()).count()
    }

    /// Bytes held by staged vectors.
    pub fn ready_bytes(&self) -> usize {
        self.ready_bytes
    }

    /// Choose vectors to evict so at most `target_len` vectors remain.
    ///
    /// Failure markers hold no vector and neither count toward the target nor
    /// get chosen. Unprotected vectors needed last (highest request index) go
    /// first. May return fewer keys than needed when too many are protected.
    pub fn eviction_candidates(
        &self,
        target_len: usize,
        protect: impl Fn(&str) -> bool,
    ) -> Vec<String> {
        let excess = self.ready_count().saturating_sub(target_len);
        if excess == 0 {
            return Vec::new();
        }

        let mut candidates: Vec<(&String, usize)> = self
            .entries
            .iter()
            .filter(|(key, entry)| entry.item.is_ready() && !protect(key))
            .map(|(key, entry)| (key, entry.index))
            .collect();
        candidates.sort_by(|a, b| b.1.cmp(&a.1));

        candidates
            .into_iter()
            .take(excess)
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Remove entries whose request index is below `index`.
    pub fn remove_before(&mut self, index: usize) -> Vec<(String, StagedItem)> {
        let keys: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| e.index < index)
            .map(|(k, _)| k.clone())
            .collect();

        keys.into_iter()
            .filter_map(|k| self.take(&k).map(|item| (k, item)))
            .collect()
    }

    /// Remove every entry.
    pub fn drain(&mut self) -> Vec<(String, StagedItem)> {
        self.ready_bytes = 0;
        self.entries.drain().map(|(k, e)| (k, e.item)).collect()
    }
}
