//! Finding phase artifacts on disk and asking the operator to pick one.

use chrono::{DateTime, Local};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::gates::Chooser;
use crate::phase::Phase;

/// Artifacts live at most this deep below the artifacts directory.
const MAX_SEARCH_DEPTH: usize = 4;

const SECS_PER_DAY: u64 = 86_400;

/// A file that looks like a phase's artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub path: PathBuf,
    pub modified: SystemTime,
}

impl Candidate {
    fn label(&self, root: &Path) -> String {
        let shown = self.path.strip_prefix(root).unwrap_or(&self.path);
        let when: DateTime<Local> = self.modified.into();
        format!("{} ({})", shown.display(), when.format("%Y-%m-%d %H:%M"))
    }
}

/// Files under `dir` matching `phase`'s artifact pattern and modified at or
/// after `since`, newest first.
pub fn artifacts_matching(dir: &Path, phase: Phase, since: Option<SystemTime>) -> Vec<Candidate> {
    if !phase.produces_artifact() {
        return Vec::new();
    }
    let mut found: Vec<Candidate> = WalkDir::new(dir)
        .max_depth(MAX_SEARCH_DEPTH)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| e.file_name().to_str().is_some_and(|n| phase.matches_artifact(n)))
        .filter_map(|e| {
            let modified = e.metadata().ok()?.modified().ok()?;
            Some(Candidate {
                path: e.into_path(),
                modified,
            })
        })
        .filter(|c| since.is_none_or(|s| c.modified >= s))
        .collect();
    found.sort_by(|a, b| b.modified.cmp(&a.modified).then_with(|| b.path.cmp(&a.path)));
    found
}

/// Interactive search for a missing upstream artifact.
#[derive(Debug, Clone)]
pub struct ArtifactDiscovery {
    project_root: PathBuf,
    search_dir: PathBuf,
    lookback_days: i64,
}

impl ArtifactDiscovery {
    pub fn new(project_root: impl Into<PathBuf>, search_dir: impl Into<PathBuf>, lookback_days: i64) -> Self {
        Self {
            project_root: project_root.into(),
            search_dir: search_dir.into(),
            lookback_days,
        }
    }

    pub fn search_dir(&self) -> &Path {
        &self.search_dir
    }

    /// Candidates modified within `lookback_days` of `now`.
    pub fn find_candidates_at(&self, phase: Phase, lookback_days: i64, now: SystemTime) -> Vec<Candidate> {
        let days = u64::try_from(lookback_days.max(0)).unwrap_or(0);
        let window = Duration::from_secs(days.saturating_mul(SECS_PER_DAY));
        let since = now.checked_sub(window).unwrap_or(SystemTime::UNIX_EPOCH);
        artifacts_matching(&self.search_dir, phase, Some(since))
    }

    /// Menu loop: numbered candidates, widen the window, type a path, or cancel.
    /// `Ok(None)` means the operator cancelled.
    pub fn discover(&self, phase: Phase, chooser: &mut dyn Chooser) -> anyhow::Result<Option<PathBuf>> {
        let mut lookback = self.lookback_days.max(1);
        loop {
            let candidates = self.find_candidates_at(phase, lookback, SystemTime::now());
            debug!(%phase, lookback, found = candidates.len(), "Artifact discovery");

            let mut options: Vec<String> = candidates
                .iter()
                .map(|c| c.label(&self.project_root))
                .collect();
            let widen = options.len();
            options.push(format!("Search further back ({} days)", lookback.saturating_mul(2)));
            let enter = options.len();
            options.push("Enter a path".to_string());
            options.push("Cancel".to_string());

            let prompt = if candidates.is_empty() {
                format!(
                    "No {} artifact in {} from the last {} days",
                    phase.display_name(),
                    self.search_dir.display(),
                    lookback
                )
            } else {
                format!("Select the {} artifact to use", phase.display_name())
            };

            match chooser.select(&prompt, &options)? {
                Some(i) if i < widen => return Ok(Some(candidates[i].path.clone())),
                Some(i) if i == widen => lookback = lookback.saturating_mul(2),
                Some(i) if i == enter => {
                    let entered = chooser
                        .free_text(&format!("Path to the {} artifact", phase.display_name()))?;
                    if let Some(text) = entered {
                        match self.resolve_entered(&text) {
                            Some(path) => return Ok(Some(path)),
                            None => warn!(path = %text, "Entered artifact path is not a file"),
                        }
                    }
                }
                _ => return Ok(None),
            }
        }
    }

    fn resolve_entered(&self, text: &str) -> Option<PathBuf> {
        let path = PathBuf::from(text);
        let path = if path.is_absolute() {
            path
        } else {
            self.project_root.join(path)
        };
        path.is_file().then_some(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gates::{ScriptedAnswer, ScriptedChooser};
    use std::fs;
    use tempfile::tempdir;

    const DAY: Duration = Duration::from_secs(86_400);

    fn touch(path: &Path, age: Duration) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, "artifact").unwrap();
        let file = fs::File::options().write(true).open(path).unwrap();
        file.set_modified(SystemTime::now() - age).unwrap();
    }

    fn discovery(root: &Path) -> ArtifactDiscovery {
        ArtifactDiscovery::new(root, root.join("docs/plans"), 7)
    }

    #[test]
    fn test_artifacts_matching_filters_and_orders() {
        let dir = tempdir().unwrap();
        let plans = dir.path().join("docs/plans");
        touch(&plans.join("a-research.md"), 3 * DAY);
        touch(&plans.join("nested/b-research.md"), DAY);
        touch(&plans.join("c-tdd-plan.md"), DAY);

        let found = artifacts_matching(&plans, Phase::Research, None);
        let names: Vec<String> = found
            .iter()
            .map(|c| c.path.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["b-research.md", "a-research.md"]);
    }

    #[test]
    fn test_huge_lookback_searches_everything() {
        let dir = tempdir().unwrap();
        let old = dir.path().join("docs/plans/ancient-research.md");
        touch(&old, 3000 * DAY);
        let found = discovery(dir.path()).find_candidates_at(Phase::Research, i64::MAX, SystemTime::now());
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].path, old);
    }

    #[test]
    fn test_artifacts_matching_respects_since() {
        let dir = tempdir().unwrap();
        touch(&dir.path().join("old-research.md"), 10 * DAY);
        let since = SystemTime::now() - DAY;
        assert!(artifacts_matching(dir.path(), Phase::Research, Some(since)).is_empty());
    }

    #[test]
    fn test_phase_without_pattern_finds_nothing() {
        let dir = tempdir().unwrap();
        touch(&dir.path().join("x-research.md"), Duration::ZERO);
        assert!(artifacts_matching(dir.path(), Phase::Implementation, None).is_empty());
    }

    #[test]
    fn test_missing_directory_finds_nothing() {
        let dir = tempdir().unwrap();
        assert!(artifacts_matching(&dir.path().join("absent"), Phase::Research, None).is_empty());
    }

    #[test]
    fn test_discover_selects_numbered_candidate() {
        let dir = tempdir().unwrap();
        let newest = dir.path().join("docs/plans/new-research.md");
        touch(&dir.path().join("docs/plans/old-research.md"), 2 * DAY);
        touch(&newest, Duration::ZERO);

        let mut chooser = ScriptedChooser::new([ScriptedAnswer::Select(0)]);
        let picked = discovery(dir.path())
            .discover(Phase::Research, &mut chooser)
            .unwrap();
        assert_eq!(picked, Some(newest));
    }

    #[test]
    fn test_discover_widen_finds_older_artifact() {
        let dir = tempdir().unwrap();
        let old = dir.path().join("docs/plans/old-research.md");
        touch(&old, 10 * DAY);

        // Nothing within 7 days: options are [widen, enter, cancel].
        let mut chooser = ScriptedChooser::new([ScriptedAnswer::Select(0), ScriptedAnswer::Select(0)]);
        let picked = discovery(dir.path())
            .discover(Phase::Research, &mut chooser)
            .unwrap();
        assert_eq!(picked, Some(old));
        assert!(chooser.prompts()[0].contains("last 7 days"));
    }

    #[test]
    fn test_discover_free_text_path() {
        let dir = tempdir().unwrap();
        let elsewhere = dir.path().join("notes/my-plan.md");
        touch(&elsewhere, Duration::ZERO);

        let mut chooser = ScriptedChooser::new([
            ScriptedAnswer::Select(1),
            ScriptedAnswer::Text("notes/my-plan.md".into()),
        ]);
        let picked = discovery(dir.path())
            .discover(Phase::TddPlanning, &mut chooser)
            .unwrap();
        assert_eq!(picked, Some(elsewhere));
    }

    #[test]
    fn test_discover_bad_path_returns_to_menu_then_cancel() {
        let dir = tempdir().unwrap();
        let mut chooser = ScriptedChooser::new([
            ScriptedAnswer::Select(1),
            ScriptedAnswer::Text("does/not/exist.md".into()),
            ScriptedAnswer::Select(2),
        ]);
        let picked = discovery(dir.path())
            .discover(Phase::Research, &mut chooser)
            .unwrap();
        assert_eq!(picked, None);
        assert_eq!(chooser.prompts().len(), 3);
    }

    #[test]
    fn test_discover_cancel() {
        let dir = tempdir().unwrap();
        let mut chooser = ScriptedChooser::new([ScriptedAnswer::Cancel]);
        assert_eq!(
            discovery(dir.path()).discover(Phase::Research, &mut chooser).unwrap(),
            None
        );
    }
}
