//! Configuration structures for genestream.
//!
//! Configuration is loaded from TOML files and can be overridden per loader
//! instance via the [`LoaderBuilder`](crate::loader::LoaderBuilder).

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Main configuration structure.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Streaming loader tuning
    #[serde(default)]
    pub loader: LoaderConfig,

    /// Item store configuration (used by the CLI stores)
    #[serde(default)]
    pub store: StoreConfig,

    /// Monitoring configuration
    #[serde(default)]
    pub monitoring: MonitoringConfig,
}

/// Streaming loader tuning defaults.
///
/// A snapshot of this struct is taken at the start of every run.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct LoaderConfig {
    /// Maximum number of loads in flight at once
    #[serde(default = "default_network_concurrency")]
    pub network_concurrency: usize,

    /// Memory budget in MB the staging buffer is sized against
    #[serde(default = "default_memory_budget_mb")]
    pub memory_budget_mb: f64,

    /// Upper bound on buffered plus loading items
    #[serde(default = "default_preload_count")]
    pub preload_count: usize,

    /// Lower bound on the effective capacity, also the critical-pressure size
    #[serde(default = "default_min_buffer_size")]
    pub min_buffer_size: usize,

    /// Capacity multiplier applied under warning/cleanup pressure
    #[serde(default = "default_pressure_buffer_reduction_factor")]
    pub pressure_buffer_reduction_factor: f64,

    /// Share of the memory budget available to the staging buffer
    #[serde(default = "default_buffer_fraction")]
    pub buffer_fraction: f64,

    /// Size of one vector element in bytes
    #[serde(default = "default_element_size_bytes")]
    pub element_size_bytes: usize,

    /// Copies of a vector alive at once (store, staging, derived values)
    #[serde(default = "default_overhead_multiplier")]
    pub overhead_multiplier: f64,

    /// Recompute capacity every N successful loads
    #[serde(default = "default_resize_every")]
    pub resize_every: usize,

    /// Yield to the scheduler every N yielded items
    #[serde(default = "default_yield_every")]
    pub yield_every: usize,

    /// Bounded wait for a single item in milliseconds
    #[serde(default = "default_wait_timeout_ms")]
    pub wait_timeout_ms: u64,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            network_concurrency: default_network_concurrency(),
            memory_budget_mb: default_memory_budget_mb(),
            preload_count: default_preload_count(),
            min_buffer_size: default_min_buffer_size(),
            pressure_buffer_reduction_factor: default_pressure_buffer_reduction_factor(),
            buffer_fraction: default_buffer_fraction(),
            element_size_bytes: default_element_size_bytes(),
            overhead_multiplier: default_overhead_multiplier(),
            resize_every: default_resize_every(),
            yield_every: default_yield_every(),
            wait_timeout_ms: default_wait_timeout_ms(),
        }
    }
}

impl LoaderConfig {
    /// Set network concurrency.
    pub fn with_network_concurrency(mut self, concurrency: usize) -> Self {
        self.network_concurrency = concurrency;
        self
    }

    /// Set memory budget in MB.
    pub fn with_memory_budget_mb(mut self, mb: f64) -> Self {
        self.memory_budget_mb = mb;
        self
    }

    /// Set preload count.
    pub fn with_preload_count(mut self, count: usize) -> Self {
        self.preload_count = count;
        self
    }

    /// Set minimum buffer size.
    pub fn with_min_buffer_size(mut self, size: usize) -> Self {
        self.min_buffer_size = size;
        self
    }

    /// Set wait timeout.
    pub fn with_wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Bounded wait as a [`Duration`].
    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }

    /// Memory budget in bytes.
    pub fn memory_budget_bytes(&self) -> f64 {
        self.memory_budget_mb * 1024.0 * 1024.0
    }

    /// Validate the loader configuration.
    pub fn validate(&self) -> crate::Result<()> {
        if self.network_concurrency == 0 {
            return Err(crate::Error::Config(
                "network_concurrency must be at least 1".into(),
            ));
        }

        if self.preload_count == 0 {
            return Err(crate::Error::Config(
                "preload_count must be at least 1".into(),
            ));
        }

        if self.min_buffer_size == 0 || self.min_buffer_size > self.preload_count {
            return Err(crate::Error::Config(format!(
                "min_buffer_size must be in 1..={} (got {})",
                self.preload_count, self.min_buffer_size
            )));
        }

        if !(self.memory_budget_mb > 0.0) {
            return Err(crate::Error::Config(
                "memory_budget_mb must be positive".into(),
            ));
        }

        if !(self.pressure_buffer_reduction_factor > 0.0
            && self.pressure_buffer_reduction_factor <= 1.0)
        {
            return Err(crate::Error::Config(
                "pressure_buffer_reduction_factor must be in (0, 1]".into(),
            ));
        }

        if !(self.buffer_fraction > 0.0 && self.buffer_fraction <= 1.0) {
            return Err(crate::Error::Config(
                "buffer_fraction must be in (0, 1]".into(),
            ));
        }

        if self.resize_every == 0 || self.yield_every == 0 {
            return Err(crate::Error::Config(
                "resize_every and yield_every must be at least 1".into(),
            ));
        }

        if self.wait_timeout_ms == 0 {
            return Err(crate::Error::Config(
                "wait_timeout_ms must be positive".into(),
            ));
        }

        if self.overhead_multiplier < 1.0 {
            tracing::warn!(
                overhead_multiplier = self.overhead_multiplier,
                "Overhead multiplier below 1.0 underestimates staged memory"
            );
        }

        Ok(())
    }
}

/// Item store configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct StoreConfig {
    /// Cells per vector; 0 infers it from the data
    #[serde(default)]
    pub population_size: usize,

    /// Artificial per-load latency in milliseconds (synthetic store)
    #[serde(default)]
    pub latency_ms: u64,

    /// Keys that always fail to load (synthetic store)
    #[serde(default)]
    pub fail_keys: Vec<String>,
}

/// Monitoring configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct MonitoringConfig {
    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,

    /// Log format
    #[serde(default)]
    pub log_format: LogFormat,
}

/// Log level.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Trace level
    Trace,
    /// Debug level
    Debug,
    /// Info level (default)
    #[default]
    Info,
    /// Warn level
    Warn,
    /// Error level
    Error,
}

impl LogLevel {
    /// Directive string for an `EnvFilter`.
    pub fn as_directive(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Log format.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// JSON format (default)
    #[default]
    Json,
    /// Plain text format
    Text,
}

/// Read-only source of loader tuning defaults.
///
/// The loader takes a fresh snapshot at the start of every run.
pub trait ConfigSource: Send + Sync {
    /// Current configuration snapshot.
    fn snapshot(&self) -> LoaderConfig;
}

impl ConfigSource for LoaderConfig {
    fn snapshot(&self) -> LoaderConfig {
        self.clone()
    }
}

/// Configuration that can be updated between runs.
#[derive(Debug, Clone, Default)]
pub struct SharedConfig {
    inner: Arc<RwLock<LoaderConfig>>,
}

impl SharedConfig {
    /// Create a shared configuration.
    pub fn new(config: LoaderConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(config)),
        }
    }

    /// Replace the configuration; takes effect at the next run start.
    pub fn update(&self, f: impl FnOnce(&mut LoaderConfig)) {
        f(&mut self.inner.write());
    }
}

impl ConfigSource for SharedConfig {
    fn snapshot(&self) -> LoaderConfig {
        self.inner.read().clone()
    }
}

// Default value functions

fn default_network_concurrency() -> usize {
    4
}
fn default_memory_budget_mb() -> f64 {
    512.0
}
fn default_preload_count() -> usize {
    50
}
fn default_min_buffer_size() -> usize {
    2
}
fn default_pressure_buffer_reduction_factor() -> f64 {
    0.5
}
fn default_buffer_fraction() -> f64 {
    0.5
}
fn default_element_size_bytes() -> usize {
    4
}
fn default_overhead_multiplier() -> f64 {
    3.0
}
fn default_resize_every() -> usize {
    10
}
fn default_yield_every() -> usize {
    25
}
fn default_wait_timeout_ms() -> u64 {
    60_000
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> crate::Result<()> {
        self.loader.validate()?;

        if self.store.latency_ms > self.loader.wait_timeout_ms {
            tracing::warn!(
                latency_ms = self.store.latency_ms,
                wait_timeout_ms = self.loader.wait_timeout_ms,
                "Store latency exceeds wait timeout; every item will time out"
            );
        }

        Ok(())
    }
}
