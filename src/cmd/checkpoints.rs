//! Checkpoint inspection and cleanup: `phasegate checkpoints`.

use anyhow::Result;
use chrono::Utc;
use console::style;
use std::path::Path;

use phasegate::checkpoint::CheckpointStore;
use phasegate::config::{CliOverrides, PhasegateConfig};
use phasegate::gates::{Chooser, TerminalChooser};

pub fn cmd_checkpoints_list(project_dir: &Path) -> Result<()> {
    let config = PhasegateConfig::load(project_dir, CliOverrides::default())?;
    let store = CheckpointStore::new(&config.project_dir);
    let checkpoints = store.list_checkpoints()?;

    if checkpoints.is_empty() {
        println!("No checkpoints in {}", store.dir().display());
        return Ok(());
    }

    let now = Utc::now();
    println!(
        "{:<36}  {:<26}  {:>4}  {:<8}  {}",
        "ID", "MARKER", "AGE", "COMMIT", "TIMESTAMP"
    );
    for (i, cp) in checkpoints.iter().enumerate() {
        let marker = if cp.marker().is_some() {
            style(cp.phase.as_str()).to_string()
        } else {
            style(cp.phase.as_str()).red().to_string()
        };
        let commit: String = cp.git_commit.chars().take(8).collect();
        println!(
            "{:<36}  {:<26}  {:>3}d  {:<8}  {}{}",
            cp.id,
            marker,
            cp.age_days(now),
            if commit.is_empty() { "-".to_string() } else { commit },
            cp.timestamp,
            if i == 0 {
                style(" (resumable)").green().to_string()
            } else {
                String::new()
            }
        );
    }
    Ok(())
}

/// Delete checkpoints at least `days` old (default: `[checkpoints] warn_days`).
pub fn cmd_checkpoints_clean(project_dir: &Path, days: Option<i64>, yes: bool) -> Result<()> {
    let config = PhasegateConfig::load(project_dir, CliOverrides::default())?;
    let threshold = days.unwrap_or(config.toml.checkpoints.warn_days);
    if threshold < 0 {
        anyhow::bail!("--days must not be negative (got {})", threshold);
    }

    let store = CheckpointStore::new(&config.project_dir);
    let (_, aged) = store.check_cleanup_needed(threshold)?;
    let doomed = aged.iter().filter(|c| c.age_days >= threshold).count();
    if doomed == 0 {
        println!("No checkpoints are {} or more days old.", threshold);
        return Ok(());
    }

    if !yes {
        let mut chooser = TerminalChooser::new();
        let options = vec![
            format!("Delete {} checkpoint(s)", doomed),
            "Keep them".to_string(),
        ];
        let prompt = format!("{} checkpoint(s) are {} or more days old", doomed, threshold);
        if chooser.select(&prompt, &options)? != Some(0) {
            println!("Nothing deleted.");
            return Ok(());
        }
    }

    let report = store.cleanup_by_age(&aged, threshold);
    println!("Deleted {} checkpoint(s).", report.deleted);
    if report.failed > 0 {
        anyhow::bail!(
            "{} checkpoint(s) could not be deleted from {}",
            report.failed,
            store.dir().display()
        );
    }
    Ok(())
}
