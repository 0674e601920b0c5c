//! Pipeline execution command: `phasegate run`.

use anyhow::{Context, Result};
use console::style;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use phasegate::autonomy::{AutonomyMode, AutonomyPolicy};
use phasegate::checkpoint::CheckpointStore;
use phasegate::config::{CliOverrides, PhasegateConfig};
use phasegate::gates::TerminalChooser;
use phasegate::lock::RunLock;
use phasegate::orchestrator::{CommandPhaseExecutor, RunOutcome, Sequencer};
use phasegate::phase::Phase;
use phasegate::resume::{ArtifactDiscovery, ResumeController, ResumeRequest, parse_artifact_arg};
use phasegate::ui::PipelineUI;
use phasegate_exec::{ProcessRunner, RetryRunner};

/// Arguments of `phasegate run` after clap parsing.
#[derive(Debug, Default)]
pub struct RunArgs {
    pub ticket: Option<String>,
    pub autonomy: Option<AutonomyMode>,
    pub from: Option<Phase>,
    pub artifacts: Vec<String>,
    pub fresh: bool,
}

pub async fn cmd_run(project_dir: &Path, args: RunArgs) -> Result<()> {
    let config = PhasegateConfig::load(
        project_dir,
        CliOverrides {
            autonomy: args.autonomy,
            ticket: args.ticket,
        },
    )?;
    for warning in config.validate() {
        eprintln!("{} {}", style("warning:").yellow().bold(), warning);
    }

    let _lock = RunLock::acquire(&config.lock_file())?;
    let store = CheckpointStore::new(&config.project_dir);

    let warn_days = config.toml.checkpoints.warn_days;
    let (stale, aged) = store.check_cleanup_needed(warn_days)?;
    if stale {
        let count = aged.iter().filter(|c| c.age_days >= warn_days).count();
        eprintln!(
            "{} {} checkpoint(s) are at least {} days old. Run {} to remove them.",
            style("note:").cyan().bold(),
            count,
            warn_days,
            style("phasegate checkpoints clean").bold()
        );
    }

    let request = ResumeRequest {
        start_phase: args.from,
        explicit_artifacts: parse_artifacts(&args.artifacts, &config.project_dir)?,
        fresh: args.fresh,
    };

    let policy = AutonomyPolicy::standard(config.pipeline().autonomy_mode());
    let mut chooser = TerminalChooser::new();
    let discovery = ArtifactDiscovery::new(
        &config.project_dir,
        config.artifacts_dir(),
        config.toml.resume.lookback_days,
    );
    let plan = ResumeController::new(&store, policy.groups(), discovery).plan(request, &mut chooser)?;

    let total = policy.groups().phases().len();
    let remaining = policy.groups().phases_from(plan.start_phase).len();
    let ui = PipelineUI::new(total as u64);
    ui.resume_at((total - remaining) as u64);

    let retry = config.toml.retry.to_policy()?;
    let process = ProcessRunner::new(config.default_timeout()).with_sink(Arc::new(ui.sink()));
    let executor = CommandPhaseExecutor::new(RetryRunner::new(process, retry), config.toml.phases.clone());

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling the running phase");
            interrupt.cancel();
        }
    });

    let artifacts_dir = config.artifacts_dir();
    let mut sequencer = Sequencer::new(
        config.pipeline(),
        &policy,
        &store,
        &executor,
        &mut chooser,
        &ui,
        artifacts_dir,
    );

    match sequencer.run(&cancel, plan).await {
        Ok(RunOutcome::Completed { artifacts }) => {
            info!(artifacts = artifacts.len(), "Pipeline completed");
            println!();
            println!("{}", style("Pipeline complete").green().bold());
            for (phase, path) in &artifacts {
                println!("  {:<16} {}", phase.display_name(), path.display());
            }
            Ok(())
        }
        Ok(RunOutcome::Paused { after, checkpoint }) => {
            ui.abandon();
            info!(%after, checkpoint = %checkpoint.display(), "Pipeline paused");
            Ok(())
        }
        Err(e) => {
            ui.abandon();
            Err(e).context("Pipeline run failed")
        }
    }
}

fn parse_artifacts(args: &[String], base: &Path) -> Result<BTreeMap<Phase, PathBuf>> {
    let mut artifacts = BTreeMap::new();
    for arg in args {
        let (phase, path) = parse_artifact_arg(arg, base)?;
        if artifacts.insert(phase, path).is_some() {
            anyhow::bail!("--artifact given more than once for {}", phase);
        }
    }
    Ok(artifacts)
}
