//! Item stores that fetch and decode per-gene expression vectors.
//!
//! The loader only depends on the [`ItemStore`] trait. Two concrete stores
//! ship with the crate:
//!
//! - [`DirectoryStore`]: one little-endian `f32` file per gene on disk
//! - [`SyntheticStore`]: deterministic generated vectors for benchmarking

mod directory;
mod synthetic;

pub use directory::{encode_vector, DirectoryStore};
pub use synthetic::SyntheticStore;

use crate::error::StoreError;
use async_trait::async_trait;
use std::sync::Arc;

/// Expression values for one gene, one element per cell.
///
/// Shared by reference count: releasing the staged copy never invalidates a
/// vector a consumer already holds.
pub type ExpressionVector = Arc<[f32]>;

/// A vector returned by [`ItemStore::load`].
#[derive(Debug, Clone)]
pub struct LoadedVector {
    /// The decoded values
    pub values: ExpressionVector,
    /// Actual size of the loaded payload in bytes
    pub byte_size: usize,
}

impl LoadedVector {
    /// Wrap decoded values, sizing them by element count.
    pub fn new(values: Vec<f32>) -> Self {
        let byte_size = values.len() * std::mem::size_of::<f32>();
        Self {
            values: values.into(),
            byte_size,
        }
    }

    /// Override the reported payload size.
    pub fn with_byte_size(mut self, byte_size: usize) -> Self {
        self.byte_size = byte_size;
        self
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Check if the vector is empty.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Options for [`ItemStore::release`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReleaseOptions {
    /// Keep the item if the application marked it active
    pub preserve_active: bool,
}

impl ReleaseOptions {
    /// Release unconditionally.
    pub fn force() -> Self {
        Self {
            preserve_active: false,
        }
    }

    /// Release unless the item is in active use elsewhere.
    pub fn preserving_active() -> Self {
        Self {
            preserve_active: true,
        }
    }
}

/// Fetches and releases expression vectors by gene key.
///
/// `release` is called while the loader holds its internal lock: it must not
/// block and must not call back into the loader.
#[async_trait]
pub trait ItemStore: Send + Sync {
    /// Number of cells in every vector.
    fn population_size(&self) -> usize;

    /// Load the vector for `key`.
    async fn load(&self, key: &str) -> Result<LoadedVector, StoreError>;

    /// Release resources held for `key`. Idempotent; returns whether
    /// anything was actually released.
    fn release(&self, key: &str, options: ReleaseOptions) -> bool;
}
