//! Metrics collection and export.

mod prometheus;

pub use self::prometheus::{FailureKind, LoaderMetrics};
