//! Deciding where a run starts and with which upstream artifacts.
//!
//! Resolution order:
//! 1. An explicit start phase or explicit artifacts skip checkpoint detection.
//! 2. Otherwise the newest checkpoint decides: `<phase>-failed` retries that
//!    phase, `<phase>-complete` continues after it. Its recorded artifacts are
//!    matched to upstream phases by filename pattern.
//! 3. Any required artifact still missing is looked up interactively.

pub mod discovery;

pub use discovery::{ArtifactDiscovery, Candidate, artifacts_matching};

use anyhow::Context;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::checkpoint::{Checkpoint, CheckpointStore, PhaseMarker};
use crate::errors::PipelineError;
use crate::gates::Chooser;
use crate::phase::{Phase, PhaseGroupTable};

/// What the operator asked for on the command line.
#[derive(Debug, Clone, Default)]
pub struct ResumeRequest {
    pub start_phase: Option<Phase>,
    pub explicit_artifacts: BTreeMap<Phase, PathBuf>,
    /// Ignore checkpoints and start from the first phase.
    pub fresh: bool,
}

impl ResumeRequest {
    fn is_explicit(&self) -> bool {
        self.start_phase.is_some() || !self.explicit_artifacts.is_empty()
    }
}

/// Where the sequencer should start and what it starts with.
#[derive(Debug, Clone, PartialEq)]
pub struct ResumePlan {
    pub start_phase: Phase,
    pub artifacts: BTreeMap<Phase, PathBuf>,
    /// The live checkpoint this run replaces: the one it resumes from, or
    /// the newest one on disk when the run ignores it (`--fresh`, explicit
    /// artifacts). Removed once superseded.
    pub checkpoint: Option<Checkpoint>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumePoint {
    Start(Phase),
    /// Every phase already completed.
    Finished,
}

/// Where a marker says the pipeline should pick up.
pub fn resume_point(marker: PhaseMarker, table: &PhaseGroupTable) -> ResumePoint {
    match marker {
        PhaseMarker::Failed(phase) => ResumePoint::Start(phase),
        PhaseMarker::Completed(phase) => match table.next_phase(phase) {
            Some(next) => ResumePoint::Start(next),
            None => ResumePoint::Finished,
        },
    }
}

/// Match a checkpoint's recorded artifacts to `phases` by filename pattern.
/// Later entries win when several match.
pub fn extract_artifacts(checkpoint: &Checkpoint, phases: &[Phase]) -> BTreeMap<Phase, PathBuf> {
    let mut found = BTreeMap::new();
    for &phase in phases {
        let hit = checkpoint
            .state_snapshot
            .artifacts
            .iter()
            .rev()
            .find(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| phase.matches_artifact(n))
            });
        if let Some(path) = hit {
            found.insert(phase, path.clone());
        }
    }
    found
}

/// Upstream artifacts a run starting at `start` needs: inputs of `start` and
/// of every later phase that are produced before `start`.
pub fn required_before(start: Phase, table: &PhaseGroupTable) -> Vec<Phase> {
    let mut needed: Vec<Phase> = table
        .phases_from(start)
        .into_iter()
        .flat_map(|p| p.required_inputs().iter().copied())
        .filter(|input| *input < start && table.contains(*input))
        .collect();
    needed.sort();
    needed.dedup();
    needed
}

/// Parse a `<phase>=<path>` command-line argument. Relative paths are
/// resolved against `base`.
pub fn parse_artifact_arg(arg: &str, base: &Path) -> anyhow::Result<(Phase, PathBuf)> {
    let (phase, path) = arg
        .split_once('=')
        .with_context(|| format!("Expected <phase>=<path>, got '{}'", arg))?;
    let phase: Phase = phase.parse()?;
    let path = path.trim();
    if path.is_empty() {
        anyhow::bail!("Empty path for phase {} in '{}'", phase, arg);
    }
    let path = PathBuf::from(path);
    let path = if path.is_absolute() { path } else { base.join(path) };
    Ok((phase, path))
}

pub struct ResumeController<'a> {
    store: &'a CheckpointStore,
    table: &'a PhaseGroupTable,
    discovery: ArtifactDiscovery,
}

impl<'a> ResumeController<'a> {
    pub fn new(store: &'a CheckpointStore, table: &'a PhaseGroupTable, discovery: ArtifactDiscovery) -> Self {
        Self {
            store,
            table,
            discovery,
        }
    }

    pub fn plan(&self, request: ResumeRequest, chooser: &mut dyn Chooser) -> Result<ResumePlan, PipelineError> {
        for (phase, path) in &request.explicit_artifacts {
            if !path.is_file() {
                return Err(PipelineError::ArtifactMissing {
                    phase: *phase,
                    path: path.clone(),
                });
            }
        }

        let (start_phase, mut artifacts, checkpoint) = if request.is_explicit() {
            let start = match request.start_phase {
                Some(phase) => phase,
                None => self.after_latest_artifact(&request.explicit_artifacts)?,
            };
            info!(%start, "Starting from explicit request");
            (start, request.explicit_artifacts.clone(), self.superseded()?)
        } else if request.fresh {
            (self.first_phase()?, BTreeMap::new(), self.superseded()?)
        } else {
            match self.store.detect_resumable()? {
                Some(cp) => self.from_checkpoint(cp)?,
                None => (self.first_phase()?, BTreeMap::new(), None),
            }
        };

        if !self.table.contains(start_phase) {
            return Err(PipelineError::PhaseNotInPipeline(start_phase));
        }

        for phase in required_before(start_phase, self.table) {
            if let Some(path) = artifacts.get(&phase) {
                if path.is_file() {
                    continue;
                }
                warn!(%phase, path = %path.display(), "Recorded artifact no longer exists");
                artifacts.remove(&phase);
            }
            match self.discovery.discover(phase, chooser)? {
                Some(path) => {
                    artifacts.insert(phase, path);
                }
                None => return Err(PipelineError::ResumeCancelled),
            }
        }

        Ok(ResumePlan {
            start_phase,
            artifacts,
            checkpoint,
        })
    }

    /// The on-disk checkpoint a run that ignores it will replace.
    fn superseded(&self) -> Result<Option<Checkpoint>, PipelineError> {
        let existing = self.store.detect_resumable()?;
        if let Some(cp) = &existing {
            info!(id = %cp.id, marker = %cp.phase, "Existing checkpoint will be replaced");
        }
        Ok(existing)
    }

    fn first_phase(&self) -> Result<Phase, PipelineError> {
        self.table
            .first_phase()
            .ok_or_else(|| PipelineError::Other(anyhow::anyhow!("The pipeline has no phases")))
    }

    fn after_latest_artifact(&self, artifacts: &BTreeMap<Phase, PathBuf>) -> Result<Phase, PipelineError> {
        let Some(latest) = artifacts.keys().max().copied() else {
            return self.first_phase();
        };
        match self.table.next_phase(latest) {
            Some(next) => Ok(next),
            None => Err(PipelineError::Other(anyhow::anyhow!(
                "No phase runs after {}; pass --from to choose one",
                latest
            ))),
        }
    }

    fn from_checkpoint(
        &self,
        cp: Checkpoint,
    ) -> Result<(Phase, BTreeMap<Phase, PathBuf>, Option<Checkpoint>), PipelineError> {
        let marker = cp
            .marker()
            .ok_or_else(|| PipelineError::UnknownMarker(cp.phase.clone()))?;
        match resume_point(marker, self.table) {
            ResumePoint::Start(start) => {
                info!(id = %cp.id, marker = %cp.phase, %start, "Resuming from checkpoint");
                let upstream: Vec<Phase> = self
                    .table
                    .phases()
                    .into_iter()
                    .filter(|p| *p < start)
                    .collect();
                let artifacts = extract_artifacts(&cp, &upstream);
                Ok((start, artifacts, Some(cp)))
            }
            ResumePoint::Finished => Err(PipelineError::NothingToResume(cp.id)),
        }
    }
}
