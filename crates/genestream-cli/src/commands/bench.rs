//! Bench command implementation.

use super::{forward_signals, mean, Outcome};
use anyhow::{anyhow, Result};
use clap::Args;
use futures::StreamExt;
use genestream_core::store::SyntheticStore;
use genestream_core::{
    Config, Error, GroupSpec, PressureLevel, PressureMonitor, StreamOptions, StreamingLoader,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

#[derive(Args, Debug)]
pub struct BenchArgs {
    /// Cells per synthetic vector
    #[arg(long, default_value_t = 20_000)]
    pub cells: usize,

    /// Number of genes to stream
    #[arg(long, default_value_t = 500)]
    pub genes: usize,

    /// Per-load latency in milliseconds (overrides `[store] latency_ms`)
    #[arg(long)]
    pub latency_ms: Option<u64>,

    /// Genes that fail to load, in addition to `[store] fail_keys`
    #[arg(long, value_delimiter = ',')]
    pub fail: Vec<String>,

    /// Report a pressure level after N items, e.g. `100:critical`
    #[arg(long, value_parser = parse_pressure_at)]
    pub pressure_at: Option<(usize, PressureLevel)>,
}

/// Stream synthetic genes and print stats plus Prometheus metrics.
pub async fn run(config: Config, args: BenchArgs) -> Result<Outcome> {
    let latency = Duration::from_millis(args.latency_ms.unwrap_or(config.store.latency_ms));
    let store = SyntheticStore::new(args.cells)
        .with_latency(latency)
        .with_fail_keys(config.store.fail_keys.iter().cloned())
        .with_fail_keys(args.fail.iter().cloned());
    let store = Arc::new(store);

    let monitor = Arc::new(PressureMonitor::new());
    let loader = StreamingLoader::builder(store.clone())
        .config_source(Arc::new(config.loader.clone()))
        .pressure_source(monitor.clone())
        .build()?;
    let interrupted = forward_signals(loader.shutdown_signal());

    info!(
        cells = args.cells,
        genes = args.genes,
        latency_ms = latency.as_millis() as u64,
        capacity = loader.effective_capacity(),
        "Starting benchmark"
    );

    let keys = (0..args.genes).map(gene_name);
    let started = Instant::now();
    let mut genes = Box::pin(loader.stream(keys, GroupSpec::all(), StreamOptions::new())?);

    let mut consumed = 0usize;
    let mut checksum = 0.0f64;
    while let Some(gene) = genes.next().await {
        consumed += 1;
        checksum += mean(&gene.values).unwrap_or(0.0);

        if let Some((after, level)) = args.pressure_at {
            if consumed == after {
                info!(after, level = %level, "Reporting memory pressure");
                monitor.report(level);
            }
        }
    }
    let elapsed = started.elapsed();

    let rate = consumed as f64 / elapsed.as_secs_f64().max(f64::EPSILON);
    println!(
        "streamed {} of {} genes in {:.3}s ({:.1} genes/s, checksum {:.4}, {} store loads)",
        consumed,
        args.genes,
        elapsed.as_secs_f64(),
        rate,
        checksum,
        store.loads_total()
    );
    println!(
        "{}",
        serde_json::to_string_pretty(&loader.stats()).map_err(Error::from)?
    );
    print!("{}", loader.metrics().export_prometheus_text()?);

    Ok(interrupted.outcome())
}

fn gene_name(i: usize) -> String {
    format!("GENE{:05}", i)
}

/// Parse `N:level` into an item count and pressure level.
fn parse_pressure_at(value: &str) -> Result<(usize, PressureLevel)> {
    let (count, level) = value
        .split_once(':')
        .ok_or_else(|| anyhow!("expected N:level, got '{}'", value))?;
    let count = count
        .trim()
        .parse::<usize>()
        .map_err(|e| anyhow!("invalid item count '{}': {}", count, e))?;
    let level = level.trim().parse::<PressureLevel>()?;
    Ok((count, level))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pressure_at() {
        assert_eq!(
            parse_pressure_at("100:critical").unwrap(),
            (100, PressureLevel::Critical)
        );
        assert_eq!(
            parse_pressure_at("5: Warning").unwrap(),
            (5, PressureLevel::Warning)
        );
        assert!(parse_pressure_at("100").is_err());
        assert!(parse_pressure_at("x:critical").is_err());
        assert!(parse_pressure_at("10:panic").is_err());
    }

    #[test]
    fn test_gene_name() {
        assert_eq!(gene_name(7), "GENE00007");
    }

    #[tokio::test]
    async fn test_bench_runs_to_completion() {
        let args = BenchArgs {
            cells: 64,
            genes: 20,
            latency_ms: None,
            fail: vec!["GENE00003".into()],
            pressure_at: Some((5, PressureLevel::Critical)),
        };
        let outcome = run(Config::default(), args).await.unwrap();
        assert_eq!(outcome, Outcome::Completed);
    }
}
