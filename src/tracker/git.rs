use anyhow::{Context, Result};
use git2::Repository;
use std::path::{Path, PathBuf};

use crate::checkpoint::CommitSource;

pub struct GitTracker {
    repo: Repository,
}

impl GitTracker {
    /// Open the repository containing `project_dir`, searching parent directories.
    pub fn new(project_dir: &Path) -> Result<Self> {
        let repo = Repository::discover(project_dir).context("Failed to open git repository")?;
        Ok(Self { repo })
    }

    /// Get the HEAD commit if it exists (returns None for unborn branches)
    fn get_head_commit(&self) -> Option<git2::Commit<'_>> {
        self.repo
            .head()
            .ok()
            .and_then(|head| head.peel_to_commit().ok())
    }

    /// Get current HEAD SHA (returns None for unborn branches)
    pub fn head_sha(&self) -> Option<String> {
        self.get_head_commit().map(|c| c.id().to_string())
    }

    /// Short name of the checked-out branch, None when detached or unborn.
    pub fn branch_name(&self) -> Option<String> {
        let head = self.repo.head().ok()?;
        if !head.is_branch() {
            return None;
        }
        head.shorthand().map(str::to_string)
    }
}

/// Reads HEAD of the repository around a project directory.
#[derive(Debug, Clone)]
pub struct GitCommitSource {
    project_dir: PathBuf,
}

impl GitCommitSource {
    pub fn new(project_dir: impl Into<PathBuf>) -> Self {
        Self {
            project_dir: project_dir.into(),
        }
    }
}

impl CommitSource for GitCommitSource {
    fn head_commit(&self) -> Result<String> {
        GitTracker::new(&self.project_dir)?
            .head_sha()
            .context("Repository has no commits")
    }
}
