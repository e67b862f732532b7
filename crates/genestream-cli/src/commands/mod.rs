//! CLI command implementations.

pub mod bench;
pub mod stream;
pub mod validate;

use genestream_core::GroupSpec;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

/// How a streaming command ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    Interrupted,
}

/// Flag set once a shutdown signal has been forwarded to the loader.
#[derive(Debug, Clone, Default)]
pub struct Interrupted(Arc<AtomicBool>);

impl Interrupted {
    pub fn outcome(&self) -> Outcome {
        if self.0.load(Ordering::SeqCst) {
            Outcome::Interrupted
        } else {
            Outcome::Completed
        }
    }
}

/// Forward SIGINT (and SIGTERM on unix) to the loader's shutdown signal.
pub fn forward_signals(shutdown: broadcast::Sender<()>) -> Interrupted {
    let interrupted = Interrupted::default();
    let flag = Arc::clone(&interrupted.0);

    tokio::spawn(async move {
        wait_for_signal().await;
        flag.store(true, Ordering::SeqCst);
        // No receiver means no run is active; nothing to abort
        let _ = shutdown.send(());
    });

    interrupted
}

#[cfg(unix)]
async fn wait_for_signal() {
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            warn!(error = %e, "Failed to install SIGTERM handler; listening for Ctrl+C only");
            let _ = tokio::signal::ctrl_c().await;
            info!("Received SIGINT (Ctrl+C), aborting run");
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received SIGINT (Ctrl+C), aborting run");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, aborting run");
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("Received Ctrl+C, aborting run");
}

/// Build the group from `--cells` / `--exclude`.
pub fn group_from_args(cells: Option<Vec<u32>>, exclude: Option<Vec<u32>>) -> GroupSpec {
    match (cells, exclude) {
        (Some(cells), _) => GroupSpec::Cells(cells),
        (None, Some(mut excluded)) => {
            excluded.sort_unstable();
            excluded.dedup();
            GroupSpec::RestOf { excluded }
        }
        (None, None) => GroupSpec::all(),
    }
}

/// Mean of the non-missing values, `None` when every value is missing.
pub fn mean(values: &[f32]) -> Option<f64> {
    let (sum, count) = values
        .iter()
        .filter(|v| !v.is_nan())
        .fold((0.0f64, 0usize), |(sum, count), v| (sum + *v as f64, count + 1));
    (count > 0).then(|| sum / count as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_from_args() {
        assert_eq!(
            group_from_args(Some(vec![2, 1]), None),
            GroupSpec::Cells(vec![2, 1])
        );
        assert_eq!(
            group_from_args(None, Some(vec![4, 1, 4])),
            GroupSpec::RestOf {
                excluded: vec![1, 4]
            }
        );
        assert_eq!(group_from_args(None, None), GroupSpec::all());
    }

    #[test]
    fn test_mean_skips_missing() {
        assert_eq!(mean(&[1.0, f32::NAN, 3.0]), Some(2.0));
        assert_eq!(mean(&[f32::NAN]), None);
        assert_eq!(mean(&[]), None);
    }

    #[test]
    fn test_interrupted_defaults_to_completed() {
        assert_eq!(Interrupted::default().outcome(), Outcome::Completed);
    }
}
