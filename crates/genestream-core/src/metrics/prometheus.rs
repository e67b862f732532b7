//! Prometheus metrics export.

use crate::error::{LoadError, StoreError};
use crate::Result;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::time::Duration;

/// Load duration bucket boundaries in seconds.
const LOAD_DURATION_BUCKETS: [f64; 9] = [0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5];

/// Failure kinds for labeled metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// The store has no such item
    NotFound,
    /// Key rejected by the store
    InvalidKey,
    /// Bytes could not be decoded
    Decode,
    /// Store IO failure
    Io,
    /// Waiting timed out
    Timeout,
    /// Anything else
    Other,
}

impl FailureKind {
    /// All kinds, in export order.
    pub const ALL: [FailureKind; 6] = [
        FailureKind::NotFound,
        FailureKind::InvalidKey,
        FailureKind::Decode,
        FailureKind::Io,
        FailureKind::Timeout,
        FailureKind::Other,
    ];

    /// Get the label value for Prometheus export.
    pub fn as_label(&self) -> &'static str {
        match self {
            FailureKind::NotFound => "not_found",
            FailureKind::InvalidKey => "invalid_key",
            FailureKind::Decode => "decode",
            FailureKind::Io => "io",
            FailureKind::Timeout => "timeout",
            FailureKind::Other => "other",
        }
    }
}

impl From<&LoadError> for FailureKind {
    fn from(error: &LoadError) -> Self {
        match error {
            LoadError::Store(StoreError::NotFound(_)) => FailureKind::NotFound,
            LoadError::Store(StoreError::InvalidKey(_)) => FailureKind::InvalidKey,
            LoadError::Store(StoreError::Decode { .. }) => FailureKind::Decode,
            LoadError::Store(StoreError::Io(_)) => FailureKind::Io,
            LoadError::Timeout(_) => FailureKind::Timeout,
            _ => FailureKind::Other,
        }
    }
}

/// Loader metrics, cumulative across runs.
pub struct LoaderMetrics {
    registry: Registry,

    // === COUNTERS ===
    runs_total: IntCounter,
    aborts_total: IntCounter,
    loads_total: IntCounter,
    load_failures: IntCounterVec,
    bytes_loaded_total: IntCounter,
    items_yielded_total: IntCounter,
    evictions_total: IntCounter,
    reloads_total: IntCounter,
    wait_timeouts_total: IntCounter,
    stale_completions_total: IntCounter,

    // === GAUGES ===
    buffered_items: IntGauge,
    loading_items: IntGauge,
    queued_items: IntGauge,
    effective_capacity: IntGauge,

    // === HISTOGRAM ===
    load_duration: Histogram,
}

fn counter(registry: &Registry, name: &str, help: &str) -> Result<IntCounter> {
    let counter = IntCounter::with_opts(Opts::new(name, help))?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}

fn gauge(registry: &Registry, name: &str, help: &str) -> Result<IntGauge> {
    let gauge = IntGauge::with_opts(Opts::new(name, help))?;
    registry.register(Box::new(gauge.clone()))?;
    Ok(gauge)
}

impl LoaderMetrics {
    /// Create metrics on a fresh registry.
    pub fn new() -> Result<Self> {
        Self::with_registry(Registry::new())
    }

    /// Create metrics registered on an existing registry.
    pub fn with_registry(registry: Registry) -> Result<Self> {
        let load_failures = IntCounterVec::new(
            Opts::new(
                "genestream_load_failures_total",
                "Failed loads and timed-out waits by kind",
            ),
            &["kind"],
        )?;
        registry.register(Box::new(load_failures.clone()))?;
        // Export every kind, even at zero
        for kind in FailureKind::ALL {
            load_failures.with_label_values(&[kind.as_label()]);
        }

        let load_duration = Histogram::with_opts(
            HistogramOpts::new(
                "genestream_load_duration_seconds",
                "Time spent in a single item load",
            )
            .buckets(LOAD_DURATION_BUCKETS.to_vec()),
        )?;
        registry.register(Box::new(load_duration.clone()))?;

        Ok(Self {
            runs_total: counter(&registry, "genestream_runs_total", "Streaming runs started")?,
            aborts_total: counter(
                &registry,
                "genestream_aborts_total",
                "Runs torn down before exhaustion",
            )?,
            loads_total: counter(&registry, "genestream_loads_total", "Successful item loads")?,
            load_failures,
            bytes_loaded_total: counter(
                &registry,
                "genestream_bytes_loaded_total",
                "Bytes of successfully loaded vectors",
            )?,
            items_yielded_total: counter(
                &registry,
                "genestream_items_yielded_total",
                "Items handed to consumers",
            )?,
            evictions_total: counter(
                &registry,
                "genestream_evictions_total",
                "Staged vectors evicted under memory pressure",
            )?,
            reloads_total: counter(
                &registry,
                "genestream_reloads_total",
                "Loads started again for previously evicted keys",
            )?,
            wait_timeouts_total: counter(
                &registry,
                "genestream_wait_timeouts_total",
                "Bounded waits that timed out",
            )?,
            stale_completions_total: counter(
                &registry,
                "genestream_stale_completions_total",
                "Load completions discarded after their run ended",
            )?,
            buffered_items: gauge(&registry, "genestream_buffered_items", "Staged vectors")?,
            loading_items: gauge(&registry, "genestream_loading_items", "Loads in flight")?,
            queued_items: gauge(&registry, "genestream_queued_items", "Keys in the backlog")?,
            effective_capacity: gauge(
                &registry,
                "genestream_effective_capacity",
                "Current staging capacity in items",
            )?,
            load_duration,
            registry,
        })
    }

    // === COUNTER RECORDING ===

    /// Record a run start.
    pub fn record_run(&self) {
        self.runs_total.inc();
    }

    /// Record a run torn down before exhaustion.
    pub fn record_abort(&self) {
        self.aborts_total.inc();
    }

    /// Record a successful load.
    pub fn record_load(&self, bytes: usize, duration: Duration) {
        self.loads_total.inc();
        self.bytes_loaded_total.inc_by(bytes as u64);
        self.load_duration.observe(duration.as_secs_f64());
    }

    /// Record a failed load.
    pub fn record_failure(&self, error: &LoadError, duration: Duration) {
        self.load_failures
            .with_label_values(&[FailureKind::from(error).as_label()])
            .inc();
        self.load_duration.observe(duration.as_secs_f64());
    }

    /// Record an item handed to a consumer.
    pub fn record_yield(&self) {
        self.items_yielded_total.inc();
    }

    /// Record evicted vectors.
    pub fn record_evictions(&self, count: usize) {
        self.evictions_total.inc_by(count as u64);
    }

    /// Record loads restarted for evicted keys.
    pub fn record_reloads(&self, count: usize) {
        self.reloads_total.inc_by(count as u64);
    }

    /// Record a timed-out wait.
    pub fn record_wait_timeout(&self) {
        self.wait_timeouts_total.inc();
        self.load_failures
            .with_label_values(&[FailureKind::Timeout.as_label()])
            .inc();
    }

    /// Record a discarded stale completion.
    pub fn record_stale_completion(&self) {
        self.stale_completions_total.inc();
    }

    // === GAUGE UPDATES ===

    /// Update the occupancy gauges.
    pub fn set_occupancy(&self, buffered: usize, loading: usize, queued: usize) {
        self.buffered_items.set(buffered as i64);
        self.loading_items.set(loading as i64);
        self.queued_items.set(queued as i64);
    }

    /// Update the effective capacity gauge.
    pub fn set_effective_capacity(&self, capacity: usize) {
        self.effective_capacity.set(capacity as i64);
    }

    // === GETTERS ===

    /// Get total runs started.
    pub fn runs_total(&self) -> u64 {
        self.runs_total.get()
    }

    /// Get total aborted runs.
    pub fn aborts_total(&self) -> u64 {
        self.aborts_total.get()
    }

    /// Get total successful loads.
    pub fn loads_total(&self) -> u64 {
        self.loads_total.get()
    }

    /// Get failures of one kind.
    pub fn failures_by_kind(&self, kind: FailureKind) -> u64 {
        self.load_failures.with_label_values(&[kind.as_label()]).get()
    }

    /// Get total bytes loaded.
    pub fn bytes_loaded_total(&self) -> u64 {
        self.bytes_loaded_total.get()
    }

    /// Get total items yielded.
    pub fn items_yielded_total(&self) -> u64 {
        self.items_yielded_total.get()
    }

    /// Get total evictions.
    pub fn evictions_total(&self) -> u64 {
        self.evictions_total.get()
    }

    /// Get total reloads of evicted keys.
    pub fn reloads_total(&self) -> u64 {
        self.reloads_total.get()
    }

    /// Get total wait timeouts.
    pub fn wait_timeouts_total(&self) -> u64 {
        self.wait_timeouts_total.get()
    }

    /// Get total stale completions.
    pub fn stale_completions_total(&self) -> u64 {
        self.stale_completions_total.get()
    }

    /// Get the current effective capacity gauge.
    pub fn effective_capacity(&self) -> u64 {
        self.effective_capacity.get().max(0) as u64
    }

    /// Number of load duration observations.
    pub fn load_duration_count(&self) -> u64 {
        self.load_duration.get_sample_count()
    }

    /// Registry backing these metrics.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Export all metrics in Prometheus text format.
    ///
    /// # Example
    /// ```
    /// use genestream_core::metrics::LoaderMetrics;
    ///
    /// let metrics = LoaderMetrics::new().unwrap();
    /// metrics.record_run();
    /// let text = metrics.export_prometheus_text().unwrap();
    /// assert!(text.contains("genestream_runs_total 1"));
    /// ```
    pub fn export_prometheus_text(&self) -> Result<String> {
        let mut buffer = Vec::with_capacity(4096);
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer)
            .map_err(|e| crate::Error::Metrics(format!("Exposition is not UTF-8: {}", e)))
    }
}

impl std::fmt::Debug for LoaderMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoaderMetrics")
            .field("runs_total", &self.runs_total())
            .field("loads_total", &self.loads_total())
            .field("items_yielded_total", &self.items_yielded_total())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let metrics = LoaderMetrics::new().unwrap();

        metrics.record_run();
        metrics.record_run();
        assert_eq!(metrics.runs_total(), 2);

        metrics.record_load(1024, Duration::from_millis(20));
        metrics.record_load(2048, Duration::from_millis(40));
        assert_eq!(metrics.loads_total(), 2);
        assert_eq!(metrics.bytes_loaded_total(), 3072);
        assert_eq!(metrics.load_duration_count(), 2);

        metrics.record_failure(
            &LoadError::Store(StoreError::NotFound("g1".into())),
            Duration::from_millis(5),
        );
        assert_eq!(metrics.failures_by_kind(FailureKind::NotFound), 1);
        assert_eq!(metrics.failures_by_kind(FailureKind::Decode), 0);
        assert_eq!(metrics.load_duration_count(), 3);

        metrics.record_wait_timeout();
        assert_eq!(metrics.wait_timeouts_total(), 1);
        assert_eq!(metrics.failures_by_kind(FailureKind::Timeout), 1);

        metrics.record_evictions(6);
        assert_eq!(metrics.evictions_total(), 6);
        metrics.record_reloads(2);
        assert_eq!(metrics.reloads_total(), 2);

        metrics.record_abort();
        metrics.record_yield();
        metrics.record_stale_completion();
        assert_eq!(metrics.aborts_total(), 1);
        assert_eq!(metrics.items_yielded_total(), 1);
        assert_eq!(metrics.stale_completions_total(), 1);
    }

    #[test]
    fn test_failure_kind_mapping() {
        let decode = LoadError::Store(StoreError::Decode {
            key: "g".into(),
            message: "short".into(),
        });
        assert_eq!(FailureKind::from(&decode), FailureKind::Decode);
        assert_eq!(
            FailureKind::from(&LoadError::Timeout(Duration::from_secs(1))),
            FailureKind::Timeout
        );
        assert_eq!(FailureKind::from(&LoadError::Aborted), FailureKind::Other);
    }

    #[test]
    fn test_gauges() {
        let metrics = LoaderMetrics::new().unwrap();

        metrics.set_effective_capacity(43);
        assert_eq!(metrics.effective_capacity(), 43);

        metrics.set_effective_capacity(2);
        assert_eq!(metrics.effective_capacity(), 2);
    }

    #[test]
    fn test_prometheus_text_export() {
        let metrics = LoaderMetrics::new().unwrap();

        metrics.record_run();
        metrics.record_load(4000, Duration::from_millis(30));
        metrics.record_failure(
            &LoadError::Store(StoreError::NotFound("g3".into())),
            Duration::from_millis(1),
        );
        metrics.set_occupancy(5, 3, 7);
        metrics.set_effective_capacity(8);

        let output = metrics.export_prometheus_text().unwrap();

        // Counters
        assert!(output.contains("# TYPE genestream_runs_total counter"));
        assert!(output.contains("genestream_runs_total 1"));
        assert!(output.contains("genestream_bytes_loaded_total 4000"));
        assert!(output.contains("genestream_load_failures_total{kind=\"not_found\"} 1"));
        assert!(output.contains("genestream_load_failures_total{kind=\"timeout\"} 0"));

        // Gauges
        assert!(output.contains("# TYPE genestream_buffered_items gauge"));
        assert!(output.contains("genestream_buffered_items 5"));
        assert!(output.contains("genestream_loading_items 3"));
        assert!(output.contains("genestream_queued_items 7"));
        assert!(output.contains("genestream_effective_capacity 8"));

        // Histogram
        assert!(output.contains("# TYPE genestream_load_duration_seconds histogram"));
        assert!(output.contains("genestream_load_duration_seconds_bucket{le=\"+Inf\"} 2"));
        assert!(output.contains("genestream_load_duration_seconds_count 2"));
    }

    #[test]
    fn test_prometheus_text_export_empty() {
        let metrics = LoaderMetrics::new().unwrap();
        let output = metrics.export_prometheus_text().unwrap();

        assert!(output.contains("genestream_runs_total 0"));
        assert!(output.contains("genestream_loads_total 0"));
        assert!(output.contains("genestream_load_duration_seconds_count 0"));
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let registry = Registry::new();
        let _first = LoaderMetrics::with_registry(registry.clone()).unwrap();
        assert!(LoaderMetrics::with_registry(registry).is_err());
    }

    #[test]
    fn test_prometheus_text_format_validity() {
        let metrics = LoaderMetrics::new().unwrap();
        metrics.record_load(100, Duration::from_millis(150));

        let output = metrics.export_prometheus_text().unwrap();

        for line in output.lines() {
            if line.starts_with("# HELP ") {
                assert!(line.contains("genestream_"));
            } else if line.starts_with("# TYPE ") {
                assert!(
                    line.contains("counter")
                        || line.contains("gauge")
                        || line.contains("histogram")
                );
            } else if !line.is_empty() {
                assert!(line.starts_with("genestream_"));
            }
        }
    }
}
