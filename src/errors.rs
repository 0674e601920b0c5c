//! Typed error hierarchy for phasegate.
//!
//! - `CheckpointError`: checkpoint store I/O and parsing
//! - `PipelineError`: sequencing, resume and run-lock failures
//! - `PhaseTableError`: invalid phase-group tables
//!
//! Process failures never show up here: they are data on
//! `phasegate_exec::CommandResult`, not errors.

use std::path::PathBuf;
use thiserror::Error;

use crate::phase::Phase;

/// Errors from the on-disk checkpoint store.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("Failed to create checkpoint directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write checkpoint {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read checkpoint {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Checkpoint {path} is not valid JSON: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to serialize checkpoint: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error("Failed to delete checkpoint {path}: {source}")]
    Delete {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid checkpoint id '{0}'")]
    InvalidId(String),

    #[error("Checkpoint {0} not found")]
    NotFound(String),
}

/// Errors from running or resuming the pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Phase {phase} failed: {message}. Resume from checkpoint {}", checkpoint.display())]
    PhaseFailed {
        phase: Phase,
        message: String,
        checkpoint: PathBuf,
    },

    #[error("Checkpoint for phase {phase} could not be written: {source}")]
    CheckpointWrite {
        phase: Phase,
        #[source]
        source: CheckpointError,
    },

    #[error("Resume cancelled")]
    ResumeCancelled,

    #[error("Checkpoint {0} records a finished pipeline; delete it or run with --fresh")]
    NothingToResume(String),

    #[error("Artifact for {phase} not found at {}", path.display())]
    ArtifactMissing { phase: Phase, path: PathBuf },

    #[error("Checkpoint phase marker '{0}' is not recognised")]
    UnknownMarker(String),

    #[error("Phase {0} is not part of this pipeline")]
    PhaseNotInPipeline(Phase),

    #[error("Another phasegate run holds the lock at {}", .0.display())]
    Locked(PathBuf),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from building a phase-group table.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PhaseTableError {
    #[error("Phase group '{0}' has no phases")]
    EmptyGroup(String),

    #[error("Phase {0} is registered in more than one group")]
    Duplicate(Phase),

    #[error("Phase {phase} in group '{group}' is out of execution order")]
    OutOfOrder { phase: Phase, group: String },
}
