//! Run lifecycle and stale-completion guard.
//!
//! Every streaming call starts a new run with a fresh generation. Loads
//! capture the generation they were started under; a completion whose
//! generation is no longer current, or that arrives after the run left
//! [`RunPhase::Active`], must not touch the run's state.

use serde::Serialize;
use std::fmt;
use tracing::debug;

/// Generation id of a run.
pub type Generation = u64;

/// Lifecycle phase of the current run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunPhase {
    /// No run, or the last run was torn down
    #[default]
    Idle,
    /// Structures are being reset for a new run
    Starting,
    /// Serving the sequence
    Active,
    /// Tearing down
    Draining,
}

impl RunPhase {
    /// Get the label value for logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            RunPhase::Idle => "idle",
            RunPhase::Starting => "starting",
            RunPhase::Active => "active",
            RunPhase::Draining => "draining",
        }
    }
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_label())
    }
}

/// Why a run was torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TeardownReason {
    /// The input list was exhausted
    Completed,
    /// `abort()`, a shutdown signal, or the stream was dropped
    Aborted,
    /// A new run started while this one was active
    Superseded,
}

impl TeardownReason {
    /// Get the label value for logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            TeardownReason::Completed => "completed",
            TeardownReason::Aborted => "aborted",
            TeardownReason::Superseded => "superseded",
        }
    }
}

impl fmt::Display for TeardownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_label())
    }
}

/// Run state machine: `Idle → Starting → Active → Draining → Idle`.
#[derive(Debug, Default)]
pub struct RunController {
    generation: Generation,
    phase: RunPhase,
    aborted: bool,
}

impl RunController {
    /// Create an idle controller at generation 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enter `Starting` with a new generation.
    ///
    /// Always legal; the caller tears down any active run first.
    pub fn begin(&mut self) -> Generation {
        self.generation += 1;
        self.phase = RunPhase::Starting;
        self.aborted = false;
        debug!(generation = self.generation, "Run starting");
        self.generation
    }

    /// Enter `Active`.
    pub fn activate(&mut self) {
        if self.phase == RunPhase::Starting {
            self.phase = RunPhase::Active;
        }
    }

    /// Mark the run aborted and enter `Draining`.
    ///
    /// Returns false if `generation` is not the current run, or the run is
    /// already draining or idle.
    pub fn begin_drain(&mut self, generation: Generation) -> bool {
        if generation != self.generation
            || !matches!(self.phase, RunPhase::Starting | RunPhase::Active)
        {
            return false;
        }
        self.aborted = true;
        self.phase = RunPhase::Draining;
        true
    }

    /// Return to `Idle` after teardown.
    pub fn finish(&mut self) {
        self.phase = RunPhase::Idle;
    }

    /// Current generation.
    pub fn generation(&self) -> Generation {
        self.generation
    }

    /// Current phase.
    pub fn phase(&self) -> RunPhase {
        self.phase
    }

    /// Check if the current run was aborted.
    pub fn is_aborted(&self) -> bool {
        self.aborted
    }

    /// Check if `generation` is the current run.
    pub fn is_current(&self, generation: Generation) -> bool {
        generation == self.generation
    }

    /// Check if a run is in `Starting` or `Active`.
    pub fn is_running(&self) -> bool {
        matches!(self.phase, RunPhase::Starting | RunPhase::Active)
    }

    /// Check if a completion from `generation` may mutate run state.
    pub fn accepts_completions(&self, generation: Generation) -> bool {
        self.is_current(generation) && self.phase == RunPhase::Active && !self.aborted
    }
}
