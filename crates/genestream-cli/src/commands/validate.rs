//! Validate command implementation.

use genestream_core::Config;
use std::path::Path;

/// Print a summary of a configuration that passed validation.
pub fn run(path: &Path, config: &Config) {
    let loader = &config.loader;
    println!("Configuration is valid: {}", path.display());
    println!(
        "  loader: network_concurrency={} preload_count={} min_buffer_size={} memory_budget_mb={}",
        loader.network_concurrency,
        loader.preload_count,
        loader.min_buffer_size,
        loader.memory_budget_mb
    );
    println!(
        "  wait_timeout={:?} pressure_buffer_reduction_factor={}",
        loader.wait_timeout(),
        loader.pressure_buffer_reduction_factor
    );
    if config.store.population_size > 0 {
        println!("  store: population_size={}", config.store.population_size);
    }
}
