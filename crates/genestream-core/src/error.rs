//! Error types for genestream core library.
//!
//! Uses hierarchical domain-specific errors following the thiserror pattern.
//! [`LoadError`] doubles as the per-item failure marker that is stored in the
//! staging buffer and broadcast to waiters, so it is `Clone`.

use std::time::Duration;
use thiserror::Error;

/// Result type alias for genestream operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type for genestream.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Call-time precondition violation (empty key list, bad group, ...)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Item store error
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Per-item load outcome surfaced to a direct caller
    #[error("Load error: {0}")]
    Load(#[from] LoadError),

    /// Metrics registry error
    #[error("Metrics error: {0}")]
    Metrics(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Errors returned by an [`ItemStore`](crate::store::ItemStore) load.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    /// No vector exists for the key
    #[error("Item not found: {0}")]
    NotFound(String),

    /// Key cannot be mapped onto the store (path traversal, empty, ...)
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// Stored bytes could not be decoded into a vector
    #[error("Decode failed for {key}: {message}")]
    Decode { key: String, message: String },

    /// Underlying IO failure
    #[error("IO failure: {0}")]
    Io(String),

    /// Any other store-specific failure
    #[error("{0}")]
    Other(String),
}

/// Failure marker for a single key within a run.
///
/// A failed key is never retried within the run. The sequence skips it
/// without surfacing the error to the consumer.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LoadError {
    /// The store failed to load the item
    #[error("Load failed: {0}")]
    Store(#[from] StoreError),

    /// Waiting for the item exceeded the bound; the load itself continues
    #[error("Timed out after {0:?} waiting for item")]
    Timeout(Duration),

    /// The run was aborted or superseded
    #[error("Run aborted")]
    Aborted,

    /// The key is not part of the current run or was already consumed
    #[error("Key not requested in current run: {0}")]
    NotRequested(String),
}

impl LoadError {
    /// Check if this marker ends the whole sequence rather than one item.
    pub fn is_terminal(&self) -> bool {
        matches!(self, LoadError::Aborted)
    }
}

// Conversion implementations for external error types

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::Config(err.to_string())
    }
}

impl From<prometheus::Error> for Error {
    fn from(err: prometheus::Error) -> Self {
        Error::Metrics(err.to_string())
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => StoreError::NotFound(err.to_string()),
            _ => StoreError::Io(err.to_string()),
        }
    }
}
