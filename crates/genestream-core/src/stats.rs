//! Per-run statistics and progress reporting.

use crate::error::LoadError;
use crate::pressure::PressureLevel;
use crate::run::{Generation, RunPhase};
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Counters for one run. Reset at run start, monotonic within the run.
#[derive(Debug, Clone, Default)]
pub struct RunStats {
    /// Successful loads
    pub genes_loaded: u64,
    /// Failed loads
    pub genes_failed: u64,
    /// Items handed to the consumer
    pub genes_yielded: u64,
    /// Bytes of successfully loaded vectors
    pub bytes_loaded: u64,
    /// Vectors evicted under pressure
    pub evictions: u64,
    /// Loads started again for keys evicted earlier in the run
    pub reloads: u64,
    /// Bounded waits that timed out
    pub wait_timeouts: u64,
    /// Run start
    pub started_at: Option<DateTime<Utc>>,
    /// Run teardown
    pub ended_at: Option<DateTime<Utc>>,
}

impl RunStats {
    /// Fresh counters stamped with the current time.
    pub fn started_now() -> Self {
        Self {
            started_at: Some(Utc::now()),
            ..Default::default()
        }
    }

    /// Run duration so far, or total once ended.
    pub fn duration_ms(&self) -> u64 {
        match self.started_at {
            Some(start) => {
                let end = self.ended_at.unwrap_or_else(Utc::now);
                (end - start).num_milliseconds().max(0) as u64
            }
            None => 0,
        }
    }
}

/// Snapshot returned by `StreamingLoader::stats`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LoaderStats {
    pub genes_loaded: u64,
    pub genes_failed: u64,
    pub genes_yielded: u64,
    pub bytes_loaded: u64,
    pub duration_ms: u64,
    /// Staged vectors; failure markers are not counted
    pub buffer_size: usize,
    pub buffered_bytes: usize,
    pub loading_count: usize,
    pub queued_count: usize,
    pub effective_capacity: usize,
    pub bytes_per_item: f64,
    pub evictions: u64,
    pub reloads: u64,
    pub wait_timeouts: u64,
    pub pressure: PressureLevel,
    pub generation: Generation,
    pub phase: RunPhase,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

/// Progress after each consumed item, yielded or skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Progress {
    /// Items consumed so far
    pub loaded: usize,
    /// Requested items
    pub total: usize,
    pub buffered: usize,
    pub loading: usize,
    pub queued: usize,
}

impl Progress {
    /// Fraction of the run consumed, in [0, 1].
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            1.0
        } else {
            self.loaded as f64 / self.total as f64
        }
    }
}

/// Outcome of one load completion in the current run.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemEvent {
    pub key: String,
    pub success: bool,
    pub error: Option<LoadError>,
}

impl ItemEvent {
    /// Event for a successful load.
    pub fn loaded(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            success: true,
            error: None,
        }
    }

    /// Event for a failed load.
    pub fn failed(key: impl Into<String>, error: LoadError) -> Self {
        Self {
            key: key.into(),
            success: false,
            error: Some(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_duration() {
        assert_eq!(RunStats::default().duration_ms(), 0);

        let start = Utc::now();
        let stats = RunStats {
            started_at: Some(start),
            ended_at: Some(start + Duration::milliseconds(1500)),
            ..Default::default()
        };
        assert_eq!(stats.duration_ms(), 1500);
    }

    #[test]
    fn test_started_now_resets_counters() {
        let stats = RunStats::started_now();
        assert!(stats.started_at.is_some());
        assert!(stats.ended_at.is_none());
        assert_eq!(stats.genes_loaded, 0);
    }

    #[test]
    fn test_progress_fraction() {
        let progress = Progress {
            loaded: 5,
            total: 10,
            buffered: 2,
            loading: 1,
            queued: 2,
        };
        assert!((progress.fraction() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_item_event() {
        let ok = ItemEvent::loaded("g1");
        assert!(ok.success);
        assert!(ok.error.is_none());

        let failed = ItemEvent::failed("g2", LoadError::Aborted);
        assert!(!failed.success);
        assert_eq!(failed.error, Some(LoadError::Aborted));
    }

    #[test]
    fn test_stats_serialize() {
        let stats = LoaderStats {
            genes_loaded: 3,
            reloads: 2,
            phase: RunPhase::Active,
            pressure: PressureLevel::Warning,
            ..Default::default()
        };
        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["genes_loaded"], 3);
        assert_eq!(json["reloads"], 2);
        assert_eq!(json["phase"], "active");
        assert_eq!(json["pressure"], "warning");
    }
}
