//! Staging buffer sizing.
//!
//! Tracks a running bytes-per-item estimate and turns the memory budget into
//! an item capacity:
//!
//! ```text
//! max_capacity       = clamp(floor(budget * fraction / bytes_per_item), min, preload)
//! effective_capacity = min(max_capacity, pressure_capacity)
//! ```
//!
//! Pressure can only shrink the capacity below `max_capacity`, never grow it.

use crate::config::LoaderConfig;
use crate::pressure::PressureLevel;
use tracing::debug;

/// Weight of a new sample in the moving average.
const SAMPLE_WEIGHT: f64 = 0.2;

/// Inputs the estimator needs from the loader configuration.
#[derive(Debug, Clone)]
pub struct EstimatorSettings {
    /// Memory budget in bytes
    pub memory_budget_bytes: f64,
    /// Share of the budget for the staging buffer
    pub buffer_fraction: f64,
    /// Lower bound on capacity
    pub min_buffer_size: usize,
    /// Upper bound on capacity
    pub preload_count: usize,
    /// Capacity multiplier under warning/cleanup pressure
    pub reduction_factor: f64,
    /// Bytes per vector element
    pub element_size_bytes: usize,
    /// Copies of a vector alive at once
    pub overhead_multiplier: f64,
    /// Recompute every N observed loads
    pub resize_every: usize,
}

impl From<&LoaderConfig> for EstimatorSettings {
    fn from(config: &LoaderConfig) -> Self {
        Self {
            memory_budget_bytes: config.memory_budget_bytes(),
            buffer_fraction: config.buffer_fraction,
            min_buffer_size: config.min_buffer_size,
            preload_count: config.preload_count,
            reduction_factor: config.pressure_buffer_reduction_factor,
            element_size_bytes: config.element_size_bytes,
            overhead_multiplier: config.overhead_multiplier,
            resize_every: config.resize_every,
        }
    }
}

/// Running estimate of staged memory and the capacity derived from it.
#[derive(Debug, Clone)]
pub struct BufferSizeEstimator {
    settings: EstimatorSettings,
    bytes_per_item: f64,
    samples: u64,
    max_capacity: usize,
    pressure: PressureLevel,
}

impl BufferSizeEstimator {
    /// Seed the estimate from the population size.
    pub fn new(settings: EstimatorSettings, population_size: usize) -> Self {
        let bytes_per_item = population_size as f64
            * settings.element_size_bytes as f64
            * settings.overhead_multiplier;

        let mut estimator = Self {
            settings,
            bytes_per_item,
            samples: 0,
            max_capacity: 0,
            pressure: PressureLevel::Normal,
        };
        estimator.recompute();
        estimator
    }

    /// Current bytes-per-item estimate (overhead included).
    pub fn bytes_per_item(&self) -> f64 {
        self.bytes_per_item
    }

    /// Capacity ignoring pressure.
    pub fn max_capacity(&self) -> usize {
        self.max_capacity
    }

    /// Pressure level currently applied.
    pub fn pressure(&self) -> PressureLevel {
        self.pressure
    }

    /// Capacity the admission controller must respect.
    pub fn effective_capacity(&self) -> usize {
        let min = self.settings.min_buffer_size;
        let pressure_capacity = match self.pressure {
            PressureLevel::Normal => self.max_capacity,
            PressureLevel::Warning | PressureLevel::Cleanup => min.max(
                (self.max_capacity as f64 * self.settings.reduction_factor).floor() as usize,
            ),
            PressureLevel::Critical => min,
        };
        self.max_capacity.min(pressure_capacity)
    }

    /// Fold in the size of a loaded item.
    ///
    /// Returns true when this sample triggered a capacity recomputation that
    /// changed the effective capacity.
    pub fn observe(&mut self, byte_size: usize) -> bool {
        let sample = byte_size as f64 * self.settings.overhead_multiplier;
        self.bytes_per_item = if self.bytes_per_item > 0.0 {
            self.bytes_per_item * (1.0 - SAMPLE_WEIGHT) + sample * SAMPLE_WEIGHT
        } else {
            sample
        };
        self.samples += 1;

        if self.samples % self.settings.resize_every.max(1) as u64 != 0 {
            return false;
        }

        let before = self.effective_capacity();
        self.recompute();
        before != self.effective_capacity()
    }

    /// Replace the memory budget and recompute. Returns the effective capacity.
    pub fn set_memory_budget(&mut self, memory_budget_bytes: f64) -> usize {
        self.settings.memory_budget_bytes = memory_budget_bytes;
        self.recompute();
        self.effective_capacity()
    }

    /// Apply a pressure level. Returns the effective capacity.
    pub fn apply_pressure(&mut self, level: PressureLevel) -> usize {
        self.pressure = level;
        self.effective_capacity()
    }

    /// Recompute `max_capacity` from the budget and the current estimate.
    pub fn recompute(&mut self) -> usize {
        let min = self.settings.min_buffer_size;
        let max = self.settings.preload_count.max(min);

        let raw = if self.bytes_per_item > 0.0 {
            (self.settings.memory_budget_bytes * self.settings.buffer_fraction
                / self.bytes_per_item)
                .floor()
        } else {
            f64::INFINITY
        };

        let capacity = if raw.is_finite() {
            (raw.max(0.0) as usize).clamp(min, max)
        } else {
            max
        };

        if capacity != self.max_capacity {
            debug!(
                previous = self.max_capacity,
                capacity,
                bytes_per_item = self.bytes_per_item as u64,
                "Buffer capacity recomputed"
            );
        }

        self.max_capacity = capacity;
        capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MB: f64 = 1024.0 * 1024.0;

    fn settings() -> EstimatorSettings {
        EstimatorSettings {
            memory_budget_bytes: 100.0 * MB,
            buffer_fraction: 0.5,
            min_buffer_size: 2,
            preload_count: 50,
            reduction_factor: 0.5,
            element_size_bytes: 4,
            overhead_multiplier: 3.0,
            resize_every: 10,
        }
    }

    #[test]
    fn test_seed_estimate() {
        // 100k cells * 4 bytes * 3 = 1.2 MB per item; 50 MB / 1.2 MB = 43
        let estimator = BufferSizeEstimator::new(settings(), 100_000);
        assert_eq!(estimator.bytes_per_item(), 1_200_000.0);
        assert_eq!(estimator.max_capacity(), 43);
        assert_eq!(estimator.effective_capacity(), 43);
    }

    #[test]
    fn test_capacity_clamped_to_bounds() {
        let small = BufferSizeEstimator::new(settings(), 1_000);
        assert_eq!(small.max_capacity(), 50);

        let huge = BufferSizeEstimator::new(settings(), 50_000_000);
        assert_eq!(huge.max_capacity(), 2);

        let empty = BufferSizeEstimator::new(settings(), 0);
        assert_eq!(empty.max_capacity(), 50);
    }

    #[test]
    fn test_observe_ewma() {
        let mut estimator = BufferSizeEstimator::new(settings(), 100_000);

        // Actual payload is half the seed: 200 KB raw * 3 = 600 KB per item
        estimator.observe(200_000);
        let expected = 1_200_000.0 * 0.8 + 600_000.0 * 0.2;
        assert!((estimator.bytes_per_item() - expected).abs() < 1e-6);
    }

    #[test]
    fn test_recompute_on_cadence() {
        let mut estimator = BufferSizeEstimator::new(settings(), 100_000);
        let seeded = estimator.max_capacity();

        for _ in 0..9 {
            assert!(!estimator.observe(100_000));
        }
        assert_eq!(estimator.max_capacity(), seeded);

        // Tenth sample recomputes with the smaller estimate
        assert!(estimator.observe(100_000));
        assert!(estimator.max_capacity() > seeded);
    }

    #[test]
    fn test_pressure_reaction() {
        let mut estimator = BufferSizeEstimator::new(settings(), 100_000);
        let max = estimator.max_capacity();

        assert_eq!(estimator.apply_pressure(PressureLevel::Warning), max / 2);
        assert_eq!(estimator.apply_pressure(PressureLevel::Cleanup), max / 2);
        assert_eq!(estimator.apply_pressure(PressureLevel::Critical), 2);
        assert_eq!(estimator.apply_pressure(PressureLevel::Normal), max);
    }

    #[test]
    fn test_warning_never_below_min() {
        let mut s = settings();
        s.preload_count = 3;
        let mut estimator = BufferSizeEstimator::new(s, 1_000);
        assert_eq!(estimator.max_capacity(), 3);

        // floor(3 * 0.5) = 1 < min 2
        assert_eq!(estimator.apply_pressure(PressureLevel::Warning), 2);
    }

    #[test]
    fn test_critical_survives_recompute() {
        let mut estimator = BufferSizeEstimator::new(settings(), 100_000);
        estimator.apply_pressure(PressureLevel::Critical);

        for _ in 0..20 {
            estimator.observe(10);
        }
        assert_eq!(estimator.max_capacity(), 50);
        assert_eq!(estimator.effective_capacity(), 2);
    }

    #[test]
    fn test_set_memory_budget() {
        let mut estimator = BufferSizeEstimator::new(settings(), 100_000);
        assert_eq!(estimator.set_memory_budget(12.0 * MB), 5);
        assert_eq!(estimator.set_memory_budget(1.0 * MB), 2);
    }

    #[test]
    fn test_settings_from_config() {
        let config = LoaderConfig::default();
        let settings = EstimatorSettings::from(&config);
        assert_eq!(settings.memory_budget_bytes, 512.0 * MB);
        assert_eq!(settings.min_buffer_size, 2);
        assert_eq!(settings.resize_every, 10);
    }
}
