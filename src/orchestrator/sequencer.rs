use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Instant;
use tracing::{debug, info, warn};

use phasegate_exec::CancellationToken;

use super::{PhaseContext, PhaseExecutor};
use crate::autonomy::AutonomyPolicy;
use crate::checkpoint::{CheckpointStore, PhaseMarker};
use crate::config::PipelineConfig;
use crate::errors::PipelineError;
use crate::gates::{Chooser, PauseDecision, pause_gate};
use crate::phase::Phase;
use crate::resume::ResumePlan;
use crate::ui::PipelineUI;

/// How a run ended without an error.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// Every phase ran; no checkpoint remains.
    Completed { artifacts: BTreeMap<Phase, PathBuf> },
    /// The operator stopped at a pause; `checkpoint` resumes after `after`.
    Paused { after: Phase, checkpoint: PathBuf },
}

/// Drives phases one at a time from a resume plan.
///
/// Every exit short of completion leaves exactly one checkpoint: each new
/// checkpoint replaces the one this run wrote before it and the one the run
/// resumed from.
pub struct Sequencer<'a> {
    config: &'a PipelineConfig,
    policy: &'a AutonomyPolicy,
    store: &'a CheckpointStore,
    executor: &'a dyn PhaseExecutor,
    chooser: &'a mut dyn Chooser,
    ui: &'a PipelineUI,
    artifacts_dir: PathBuf,
}

impl<'a> Sequencer<'a> {
    pub fn new(
        config: &'a PipelineConfig,
        policy: &'a AutonomyPolicy,
        store: &'a CheckpointStore,
        executor: &'a dyn PhaseExecutor,
        chooser: &'a mut dyn Chooser,
        ui: &'a PipelineUI,
        artifacts_dir: PathBuf,
    ) -> Self {
        Self {
            config,
            policy,
            store,
            executor,
            chooser,
            ui,
            artifacts_dir,
        }
    }

    pub async fn run(&mut self, cancel: &CancellationToken, plan: ResumePlan) -> Result<RunOutcome, PipelineError> {
        let phases = self.policy.groups().phases_from(plan.start_phase);
        let mut artifacts = plan.artifacts;
        let mut live: Option<String> = plan.checkpoint.map(|c| c.id);

        info!(
            start = %plan.start_phase,
            mode = %self.policy.mode(),
            phases = phases.len(),
            "Pipeline starting"
        );

        for (idx, &phase) in phases.iter().enumerate() {
            let decision = self.policy.decide(phase);
            let next = phases.get(idx + 1).copied();
            let ctx = PhaseContext {
                phase,
                ticket_id: self.config.ticket_id().map(str::to_string),
                project_root: self.config.project_root().to_path_buf(),
                artifacts_dir: self.artifacts_dir.clone(),
                inputs: phase
                    .required_inputs()
                    .iter()
                    .filter_map(|p| artifacts.get(p).map(|a| (*p, a.clone())))
                    .collect(),
                auto_approve: decision.auto_approve,
            };

            self.ui.phase_started(phase, decision);
            let started = Instant::now();

            let report = match self.executor.execute(cancel, &ctx).await {
                Ok(report) => report,
                Err(failure) => {
                    warn!(%phase, error = %failure.message, cancelled = failure.cancelled, "Phase failed");
                    let checkpoint = self.checkpoint(
                        &mut live,
                        phase,
                        PhaseMarker::Failed(phase),
                        &artifacts,
                        std::slice::from_ref(&failure.message),
                        0.0,
                    )?;
                    self.ui.phase_failed(phase, &failure.message, &checkpoint);
                    return Err(PipelineError::PhaseFailed {
                        phase,
                        message: failure.message,
                        checkpoint,
                    });
                }
            };

            if let Some(primary) = report.artifacts.first() {
                artifacts.insert(phase, primary.clone());
            }
            self.ui.phase_completed(phase, &report.artifacts, started.elapsed());

            let Some(next) = next else {
                break;
            };

            let mut written = None;
            if decision.write_checkpoint {
                let path = self.checkpoint(
                    &mut live,
                    phase,
                    PhaseMarker::Completed(phase),
                    &artifacts,
                    &[],
                    report.context_usage,
                )?;
                self.ui.checkpoint_written(&path);
                written = Some(path);
            }

            if decision.pause && pause_gate(&mut *self.chooser, phase, next)? == PauseDecision::Stop {
                let checkpoint = match written {
                    Some(path) => path,
                    None => self.checkpoint(
                        &mut live,
                        phase,
                        PhaseMarker::Completed(phase),
                        &artifacts,
                        &[],
                        report.context_usage,
                    )?,
                };
                info!(after = %phase, checkpoint = %checkpoint.display(), "Pipeline paused");
                self.ui.paused(phase, &checkpoint);
                return Ok(RunOutcome::Paused {
                    after: phase,
                    checkpoint,
                });
            }
        }

        if let Some(id) = live.take() {
            self.retire(&id);
        }
        info!("Pipeline completed");
        self.ui.finish();
        Ok(RunOutcome::Completed { artifacts })
    }

    /// Write a checkpoint, then retire the one it supersedes.
    fn checkpoint(
        &self,
        live: &mut Option<String>,
        phase: Phase,
        marker: PhaseMarker,
        artifacts: &BTreeMap<Phase, PathBuf>,
        errors: &[String],
        context_usage: f64,
    ) -> Result<PathBuf, PipelineError> {
        let paths: Vec<PathBuf> = artifacts.values().cloned().collect();
        let path = self
            .store
            .write_with_usage(&marker.to_string(), &paths, errors, context_usage)
            .map_err(|source| PipelineError::CheckpointWrite { phase, source })?;

        let new_id = CheckpointStore::id_of(&path);
        if let Some(old) = live.take()
            && Some(&old) != new_id.as_ref()
        {
            self.retire(&old);
        }
        *live = new_id;
        Ok(path)
    }

    fn retire(&self, id: &str) {
        match self.store.delete_checkpoint(id) {
            Ok(()) => debug!(id, "Superseded checkpoint removed"),
            Err(e) => warn!(id, error = %e, "Failed to remove superseded checkpoint"),
        }
    }
}
