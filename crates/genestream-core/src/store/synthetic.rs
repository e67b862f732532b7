//! Synthetic item store for benchmarks and demos.

use super::{ItemStore, LoadedVector, ReleaseOptions};
use crate::error::StoreError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::trace;

/// Share of cells with zero expression, matching typical single-cell sparsity.
const ZERO_FRACTION: f64 = 0.7;

/// Item store generating deterministic sparse vectors from the key.
pub struct SyntheticStore {
    population_size: usize,
    latency: Duration,
    fail_keys: HashSet<String>,
    resident: Mutex<HashSet<String>>,
    loads_total: AtomicU64,
}

impl SyntheticStore {
    /// Create a store producing vectors of `population_size` cells.
    pub fn new(population_size: usize) -> Self {
        Self {
            population_size,
            latency: Duration::ZERO,
            fail_keys: HashSet::new(),
            resident: Mutex::new(HashSet::new()),
            loads_total: AtomicU64::new(0),
        }
    }

    /// Add artificial latency to every load.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Make loads of the given keys fail.
    pub fn with_fail_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fail_keys.extend(keys.into_iter().map(Into::into));
        self
    }

    /// Total loads served.
    pub fn loads_total(&self) -> u64 {
        self.loads_total.load(Ordering::Relaxed)
    }

    /// Number of loaded, unreleased keys.
    pub fn resident_count(&self) -> usize {
        self.resident.lock().len()
    }

    /// Generate the vector for `key`.
    pub fn generate(&self, key: &str) -> Vec<f32> {
        let mut state = seed_for(key);
        (0..self.population_size)
            .map(|_| {
                state = xorshift(state);
                let unit = (state >> 11) as f64 / (1u64 << 53) as f64;
                if unit < ZERO_FRACTION {
                    0.0
                } else {
                    ((unit - ZERO_FRACTION) / (1.0 - ZERO_FRACTION) * 10.0) as f32
                }
            })
            .collect()
    }
}

/// FNV-1a over the key bytes; never zero so xorshift does not stall.
fn seed_for(key: &str) -> u64 {
    let hash = key.bytes().fold(0xcbf2_9ce4_8422_2325u64, |acc, b| {
        (acc ^ b as u64).wrapping_mul(0x0000_0100_0000_01b3)
    });
    hash | 1
}

fn xorshift(mut x: u64) -> u64 {
    x ^= x << 13;
    x ^= x >> 7;
    x ^= x << 17;
    x
}

#[async_trait]
impl ItemStore for SyntheticStore {
    fn population_size(&self) -> usize {
        self.population_size
    }

    async fn load(&self, key: &str) -> Result<LoadedVector, StoreError> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        self.loads_total.fetch_add(1, Ordering::Relaxed);

        if self.fail_keys.contains(key) {
            return Err(StoreError::NotFound(key.to_string()));
        }

        let values = self.generate(key);
        self.resident.lock().insert(key.to_string());
        trace!(key = %key, cells = values.len(), "Generated synthetic vector");

        Ok(LoadedVector::new(values))
    }

    fn release(&self, key: &str, _options: ReleaseOptions) -> bool {
        self.resident.lock().remove(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generation_is_deterministic() {
        let store = SyntheticStore::new(1000);
        let a = store.generate("GAPDH");
        let b = store.generate("GAPDH");
        let c = store.generate("ACTB");

        assert_eq!(a.len(), 1000);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_generation_is_sparse() {
        let store = SyntheticStore::new(10_000);
        let values = store.generate("CD19");
        let zeros = values.iter().filter(|v| **v == 0.0).count();

        assert!(zeros > 6_000 && zeros < 8_000, "zeros = {}", zeros);
        assert!(values.iter().all(|v| (0.0..10.0).contains(v)));
    }

    #[tokio::test]
    async fn test_load_and_fail_keys() {
        let store = SyntheticStore::new(10).with_fail_keys(["BAD"]);

        let vector = store.load("GOOD").await.unwrap();
        assert_eq!(vector.len(), 10);
        assert_eq!(vector.byte_size, 40);

        let err = store.load("BAD").await.unwrap_err();
        assert_eq!(err, StoreError::NotFound("BAD".into()));

        assert_eq!(store.loads_total(), 2);
        assert_eq!(store.resident_count(), 1);
        assert!(store.release("GOOD", ReleaseOptions::force()));
        assert!(!store.release("GOOD", ReleaseOptions::force()));
    }
}
