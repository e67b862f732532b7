//! Memory pressure levels and their source.
//!
//! The loader subscribes to a [`PressureSource`] at the start of every run
//! and drops the subscription at teardown. Sources are injected, so tests can
//! drive transitions deterministically through a [`PressureMonitor`].

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tokio::sync::broadcast;
use tracing::debug;

/// Channel depth for pressure transitions; slow subscribers skip to the newest.
const PRESSURE_CHANNEL_CAPACITY: usize = 16;

/// Externally reported memory urgency.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PressureLevel {
    /// No pressure, full capacity
    #[default]
    Normal,
    /// Memory is getting tight
    Warning,
    /// Host asked for caches to be trimmed
    Cleanup,
    /// Shrink to the minimum immediately
    Critical,
}

impl PressureLevel {
    /// Get the label value for logs and metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            PressureLevel::Normal => "normal",
            PressureLevel::Warning => "warning",
            PressureLevel::Cleanup => "cleanup",
            PressureLevel::Critical => "critical",
        }
    }

    /// Check if this level shrinks the staging buffer.
    pub fn is_elevated(&self) -> bool {
        !matches!(self, PressureLevel::Normal)
    }
}

impl fmt::Display for PressureLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_label())
    }
}

impl FromStr for PressureLevel {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "normal" => Ok(PressureLevel::Normal),
            "warning" => Ok(PressureLevel::Warning),
            "cleanup" => Ok(PressureLevel::Cleanup),
            "critical" => Ok(PressureLevel::Critical),
            other => Err(crate::Error::InvalidRequest(format!(
                "Unknown pressure level: {}",
                other
            ))),
        }
    }
}

/// Source of pressure-level transitions.
pub trait PressureSource: Send + Sync {
    /// Subscribe to transitions. Dropping the receiver unsubscribes.
    fn subscribe(&self) -> broadcast::Receiver<PressureLevel>;

    /// Level in effect right now.
    fn current_level(&self) -> PressureLevel {
        PressureLevel::Normal
    }
}

/// Broadcast-backed pressure source.
///
/// Publishes only on transitions; repeated reports of the same level are
/// dropped.
pub struct PressureMonitor {
    sender: broadcast::Sender<PressureLevel>,
    level: RwLock<PressureLevel>,
}

impl PressureMonitor {
    /// Create a monitor starting at [`PressureLevel::Normal`].
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(PRESSURE_CHANNEL_CAPACITY);
        Self {
            sender,
            level: RwLock::new(PressureLevel::Normal),
        }
    }

    /// Report the current level. Returns whether this was a transition.
    pub fn report(&self, level: PressureLevel) -> bool {
        {
            let mut current = self.level.write();
            if *current == level {
                return false;
            }
            *current = level;
        }

        // No subscribers is fine: the level is still recorded.
        let receivers = self.sender.send(level).unwrap_or(0);
        debug!(level = %level, receivers, "Pressure level changed");
        true
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for PressureMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl PressureSource for PressureMonitor {
    fn subscribe(&self) -> broadcast::Receiver<PressureLevel> {
        self.sender.subscribe()
    }

    fn current_level(&self) -> PressureLevel {
        *self.level.read()
    }
}
