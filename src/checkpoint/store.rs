use chrono::{DateTime, SecondsFormat, Utc};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::{Checkpoint, CheckpointAge, CommitSource, PhaseMarker, StateSnapshot};
use crate::config::PHASEGATE_DIR;
use crate::errors::CheckpointError;
use crate::tracker::GitCommitSource;

/// Checkpoint directory name under `.phasegate/`.
pub const CHECKPOINT_SUBDIR: &str = "checkpoints";

/// Result of an age-based cleanup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub deleted: usize,
    pub failed: usize,
}

/// Reads and writes checkpoint files for one project.
///
/// The checkpoint directory is the only state shared between runs; every
/// write goes through a temp file and a rename so a crash never leaves a
/// half-written checkpoint behind.
pub struct CheckpointStore {
    project_root: PathBuf,
    dir: PathBuf,
    commits: Box<dyn CommitSource>,
}

impl std::fmt::Debug for CheckpointStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointStore")
            .field("project_root", &self.project_root)
            .field("dir", &self.dir)
            .finish_non_exhaustive()
    }
}

impl CheckpointStore {
    /// Store for `project_root`, recording the git HEAD of that project.
    pub fn new(project_root: &Path) -> Self {
        Self::with_commit_source(project_root, Box::new(GitCommitSource::new(project_root)))
    }

    pub fn with_commit_source(project_root: &Path, commits: Box<dyn CommitSource>) -> Self {
        let project_root =
            std::path::absolute(project_root).unwrap_or_else(|_| project_root.to_path_buf());
        let dir = project_root.join(PHASEGATE_DIR).join(CHECKPOINT_SUBDIR);
        Self {
            project_root,
            dir,
            commits,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the file backing checkpoint `id`.
    pub fn path_for(&self, id: &str) -> Result<PathBuf, CheckpointError> {
        validate_id(id)?;
        Ok(self.dir.join(format!("{}.json", id)))
    }

    /// Checkpoint id encoded in a checkpoint file path.
    pub fn id_of(path: &Path) -> Option<String> {
        path.file_stem()
            .and_then(|s| s.to_str())
            .map(str::to_string)
    }

    pub fn write_checkpoint(
        &self,
        phase: &str,
        artifacts: &[PathBuf],
        errors: &[String],
    ) -> Result<PathBuf, CheckpointError> {
        self.write_with_usage(phase, artifacts, errors, 0.0)
    }

    /// Persist a checkpoint and return its path.
    ///
    /// Relative artifact paths are resolved against the project root. A
    /// failed commit lookup records an empty commit instead of failing.
    pub fn write_with_usage(
        &self,
        phase: &str,
        artifacts: &[PathBuf],
        errors: &[String],
        context_usage: f64,
    ) -> Result<PathBuf, CheckpointError> {
        let git_commit = match self.commits.head_commit() {
            Ok(sha) => sha,
            Err(e) => {
                debug!(error = %e, "No commit recorded for checkpoint");
                String::new()
            }
        };

        let snapshot_phase = PhaseMarker::parse(phase)
            .map(|m| m.phase().token().to_string())
            .unwrap_or_else(|| phase.to_string());

        let checkpoint = Checkpoint {
            id: uuid::Uuid::new_v4().to_string(),
            phase: phase.to_string(),
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            git_commit,
            state_snapshot: StateSnapshot {
                phase: snapshot_phase,
                context_usage: if context_usage.is_finite() {
                    context_usage.clamp(0.0, 1.0)
                } else {
                    0.0
                },
                artifacts: artifacts.iter().map(|a| self.absolutize(a)).collect(),
                errors: errors.to_vec(),
            },
        };

        let path = self.save(&checkpoint)?;
        info!(id = %checkpoint.id, phase = %checkpoint.phase, path = %path.display(), "Checkpoint written");
        Ok(path)
    }

    /// Write `checkpoint` under its own id, replacing any existing file.
    pub fn save(&self, checkpoint: &Checkpoint) -> Result<PathBuf, CheckpointError> {
        let path = self.path_for(&checkpoint.id)?;
        fs::create_dir_all(&self.dir).map_err(|source| CheckpointError::CreateDir {
            path: self.dir.clone(),
            source,
        })?;

        let json = serde_json::to_string_pretty(checkpoint).map_err(CheckpointError::Serialize)?;
        let tmp = self.dir.join(format!(".{}.json.tmp", checkpoint.id));
        let write = |target: &Path| -> std::io::Result<()> {
            let mut file = fs::File::create(target)?;
            file.write_all(json.as_bytes())?;
            file.sync_all()
        };
        if let Err(source) = write(&tmp).and_then(|_| fs::rename(&tmp, &path)) {
            let _ = fs::remove_file(&tmp);
            return Err(CheckpointError::Write { path, source });
        }
        Ok(path)
    }

    pub fn load(&self, id: &str) -> Result<Checkpoint, CheckpointError> {
        let path = self.path_for(id)?;
        if !path.exists() {
            return Err(CheckpointError::NotFound(id.to_string()));
        }
        read_checkpoint(&path)
    }

    /// Every readable checkpoint, newest first. Unreadable or corrupt files
    /// are logged and skipped.
    pub fn list_checkpoints(&self) -> Result<Vec<Checkpoint>, CheckpointError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(CheckpointError::Read {
                    path: self.dir.clone(),
                    source,
                });
            }
        };

        let mut checkpoints = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            let is_json = path.extension().is_some_and(|e| e == "json");
            let hidden = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with('.'));
            if !is_json || hidden {
                continue;
            }
            match read_checkpoint(&path) {
                Ok(cp) => checkpoints.push(cp),
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable checkpoint"),
            }
        }

        checkpoints.sort_by(Checkpoint::newest_first);
        Ok(checkpoints)
    }

    /// The most recent checkpoint, if any.
    ///
    /// Ties on timestamp go to the lexicographically greatest id.
    pub fn detect_resumable(&self) -> Result<Option<Checkpoint>, CheckpointError> {
        Ok(self.list_checkpoints()?.into_iter().next())
    }

    pub fn delete_checkpoint(&self, id: &str) -> Result<(), CheckpointError> {
        let path = self.path_for(id)?;
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!(id, "Checkpoint deleted");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(CheckpointError::NotFound(id.to_string()))
            }
            Err(source) => Err(CheckpointError::Delete { path, source }),
        }
    }

    /// Whether any checkpoint is at least `warn_days` old, plus every
    /// checkpoint with its age.
    pub fn check_cleanup_needed(
        &self,
        warn_days: i64,
    ) -> Result<(bool, Vec<CheckpointAge>), CheckpointError> {
        self.check_cleanup_needed_at(warn_days, Utc::now())
    }

    pub fn check_cleanup_needed_at(
        &self,
        warn_days: i64,
        now: DateTime<Utc>,
    ) -> Result<(bool, Vec<CheckpointAge>), CheckpointError> {
        let aged: Vec<CheckpointAge> = self
            .list_checkpoints()?
            .into_iter()
            .map(|checkpoint| CheckpointAge {
                age_days: checkpoint.age_days(now),
                checkpoint,
            })
            .collect();
        let needed = aged.iter().any(|c| c.age_days >= warn_days);
        Ok((needed, aged))
    }

    /// Delete every checkpoint at least `threshold_days` old. A failed
    /// deletion is counted and logged; the rest still run.
    pub fn cleanup_by_age(&self, checkpoints: &[CheckpointAge], threshold_days: i64) -> CleanupReport {
        let mut report = CleanupReport::default();
        for aged in checkpoints.iter().filter(|c| c.age_days >= threshold_days) {
            match self.delete_checkpoint(&aged.checkpoint.id) {
                Ok(()) => report.deleted += 1,
                Err(e) => {
                    warn!(id = %aged.checkpoint.id, error = %e, "Failed to delete checkpoint");
                    report.failed += 1;
                }
            }
        }
        info!(deleted = report.deleted, failed = report.failed, "Checkpoint cleanup finished");
        report
    }

    fn absolutize(&self, path: &Path) -> PathBuf {
        let joined = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.project_root.join(path)
        };
        std::path::absolute(&joined).unwrap_or(joined)
    }
}

fn read_checkpoint(path: &Path) -> Result<Checkpoint, CheckpointError> {
    let content = fs::read_to_string(path).map_err(|source| CheckpointError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let mut cp: Checkpoint =
        serde_json::from_str(&content).map_err(|source| CheckpointError::Corrupt {
            path: path.to_path_buf(),
            source,
        })?;
    // The file name is the id every later lookup resolves through.
    if let Some(stem) = CheckpointStore::id_of(path)
        && stem != cp.id
    {
        warn!(path = %path.display(), recorded = %cp.id, "Checkpoint id does not match its file name");
        cp.id = stem;
    }
    Ok(cp)
}

/// Ids become file names, so only a conservative character set is allowed.
fn validate_id(id: &str) -> Result<(), CheckpointError> {
    let valid = !id.is_empty()
        && id.len() <= 128
        && !id.starts_with('.')
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.');
    if valid {
        Ok(())
    } else {
        Err(CheckpointError::InvalidId(id.to_string()))
    }
}
