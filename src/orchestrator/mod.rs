//! Phase execution and sequencing.
//!
//! - [`PhaseExecutor`] runs one phase; [`CommandPhaseExecutor`] runs the
//!   configured external command through the retry runner.
//! - [`Sequencer`] walks the phase table from a [`crate::resume::ResumePlan`],
//!   consulting the autonomy policy and checkpoint store after every phase.

pub mod executor;
pub mod sequencer;

pub use executor::{CommandPhaseExecutor, parse_context_usage};
pub use sequencer::{RunOutcome, Sequencer};

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;

use phasegate_exec::CancellationToken;

use crate::phase::Phase;

/// Everything a phase needs to run.
#[derive(Debug, Clone)]
pub struct PhaseContext {
    pub phase: Phase,
    pub ticket_id: Option<String>,
    pub project_root: PathBuf,
    pub artifacts_dir: PathBuf,
    /// Artifacts of this phase's required upstream phases
    pub inputs: BTreeMap<Phase, PathBuf>,
    pub auto_approve: bool,
}

/// What a successful phase produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PhaseReport {
    /// Primary artifact first
    pub artifacts: Vec<PathBuf>,
    pub context_usage: f64,
}

/// Why a phase did not succeed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseFailure {
    pub message: String,
    pub cancelled: bool,
}

impl PhaseFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            cancelled: false,
        }
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            cancelled: true,
        }
    }
}

impl std::fmt::Display for PhaseFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

/// Runs a single phase to completion or failure.
#[async_trait]
pub trait PhaseExecutor: Send + Sync {
    async fn execute(
        &self,
        cancel: &CancellationToken,
        ctx: &PhaseContext,
    ) -> Result<PhaseReport, PhaseFailure>;
}
