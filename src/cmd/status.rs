//! Project overview: `phasegate status`.

use anyhow::Result;
use console::style;
use std::path::Path;

use phasegate::checkpoint::CheckpointStore;
use phasegate::config::{CliOverrides, PhasegateConfig};
use phasegate::phase::PhaseGroupTable;
use phasegate::resume::{ResumePoint, resume_point};
use phasegate::tracker::GitTracker;

pub fn cmd_status(project_dir: &Path) -> Result<()> {
    let config = PhasegateConfig::load(project_dir, CliOverrides::default())?;
    let pipeline = config.pipeline();

    println!("Project:    {}", config.project_dir.display());
    println!("Autonomy:   {}", pipeline.autonomy_mode());
    println!("Ticket:     {}", pipeline.ticket_id().unwrap_or("-"));
    println!("Artifacts:  {}", config.artifacts_dir().display());

    match GitTracker::new(&config.project_dir) {
        Ok(git) => println!(
            "Git:        {} @ {}",
            git.branch_name().unwrap_or_else(|| "(detached)".into()),
            git.head_sha()
                .map(|sha| sha.chars().take(12).collect::<String>())
                .unwrap_or_else(|| "(no commits)".into())
        ),
        Err(_) => println!("Git:        (not a repository)"),
    }

    let table = PhaseGroupTable::standard();
    println!();
    println!("Phases:");
    for group in table.groups() {
        println!("  {}", style(&group.name).bold());
        for &phase in &group.phases {
            let configured = match config.toml.phase_command(phase) {
                Some(cmd) => style(cmd.command.clone()).green().to_string(),
                None => style("not configured").yellow().to_string(),
            };
            println!("    {:<16} {}", phase.display_name(), configured);
        }
    }

    let store = CheckpointStore::new(&config.project_dir);
    let warn_days = config.toml.checkpoints.warn_days;
    let (stale, aged) = store.check_cleanup_needed(warn_days)?;
    println!();
    match aged.first() {
        None => println!("Checkpoint: none (next run starts fresh)"),
        Some(latest) => {
            let cp = &latest.checkpoint;
            let next = match cp.marker().map(|m| resume_point(m, &table)) {
                Some(ResumePoint::Start(phase)) => format!("resumes at {}", phase.display_name()),
                Some(ResumePoint::Finished) => "pipeline finished".to_string(),
                None => style("unknown marker").red().to_string(),
            };
            println!(
                "Checkpoint: {} ({}, {}d old, {})",
                cp.id, cp.phase, latest.age_days, next
            );
        }
    }
    if stale {
        let count = aged.iter().filter(|c| c.age_days >= warn_days).count();
        println!(
            "{} {} checkpoint(s) are at least {} days old",
            style("note:").cyan().bold(),
            count,
            warn_days
        );
    }
    Ok(())
}
