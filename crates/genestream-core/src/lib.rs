//! genestream Core - prefetching streaming loader for gene expression vectors
//!
//! This library streams per-gene expression vectors from an item store to a
//! consumer one gene at a time, prefetching upcoming genes in the background
//! under:
//!
//! - A cap on loads in flight (network concurrency)
//! - A memory-derived cap on buffered plus loading items
//! - Externally reported memory pressure that shrinks the buffer on demand
//!
//! Output order always equals input order; failed genes are skipped.

pub mod admission;
pub mod config;
pub mod error;
pub mod estimator;
pub mod groups;
pub mod loader;
pub mod metrics;
pub mod pressure;
pub mod run;
pub mod staging;
pub mod stats;
pub mod store;
pub mod waiters;

// Re-export commonly used types
pub use config::{Config, ConfigSource, LoaderConfig, SharedConfig};
pub use error::{Error, Result};
pub use error::{LoadError, StoreError};
pub use groups::GroupSpec;
pub use loader::{GeneValues, MultiGroupValues, RawGene, StreamOptions, StreamingLoader};
pub use pressure::{PressureLevel, PressureMonitor, PressureSource};
pub use stats::{ItemEvent, LoaderStats, Progress};
pub use store::{ExpressionVector, ItemStore, LoadedVector, ReleaseOptions};
