//! Flat-file checkpoints that let an interrupted pipeline resume.
//!
//! One JSON file per checkpoint, `<id>.json`, under `.phasegate/checkpoints/`:
//!
//! ```json
//! { "id": "…", "phase": "tdd_planning-failed", "timestamp": "2026-01-01T00:00:00.000Z",
//!   "git_commit": "…",
//!   "state_snapshot": { "phase": "tdd_planning", "context_usage": 0.0,
//!                       "artifacts": ["/abs/…"], "errors": ["…"] } }
//! ```
//!
//! The `phase` field is a marker: `<phase>-failed` means retry that phase,
//! `<phase>-complete` (or a bare phase token) means resume after it.

mod store;

pub use store::{CHECKPOINT_SUBDIR, CheckpointStore, CleanupReport};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::phase::Phase;

/// Supplies the VCS commit recorded in each checkpoint.
pub trait CommitSource: Send + Sync {
    fn head_commit(&self) -> anyhow::Result<String>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub phase: String,
    /// Fraction of the context window used, in [0, 1]
    #[serde(default)]
    pub context_usage: f64,
    /// Absolute paths
    #[serde(default)]
    pub artifacts: Vec<PathBuf>,
    #[serde(default)]
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: String,
    pub phase: String,
    /// ISO-8601 UTC, kept as written so malformed values survive a round trip
    pub timestamp: String,
    #[serde(default)]
    pub git_commit: String,
    pub state_snapshot: StateSnapshot,
}

impl Checkpoint {
    pub fn parsed_timestamp(&self) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(&self.timestamp)
            .ok()
            .map(|t| t.with_timezone(&Utc))
    }

    /// Whole days between the timestamp and `now`, clamped at zero.
    /// Unparseable timestamps count as age zero.
    pub fn age_days(&self, now: DateTime<Utc>) -> i64 {
        self.parsed_timestamp()
            .map(|t| (now - t).num_days().max(0))
            .unwrap_or(0)
    }

    pub fn marker(&self) -> Option<PhaseMarker> {
        PhaseMarker::parse(&self.phase)
    }

    /// Newest-first ordering: later timestamp first, then greater id.
    /// Unparseable timestamps sort after every valid one.
    pub(crate) fn newest_first(a: &Checkpoint, b: &Checkpoint) -> std::cmp::Ordering {
        (b.parsed_timestamp(), &b.id).cmp(&(a.parsed_timestamp(), &a.id))
    }
}

/// A checkpoint together with its age at scan time.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointAge {
    pub checkpoint: Checkpoint,
    pub age_days: i64,
}

/// Where a checkpoint says the pipeline stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseMarker {
    /// The phase failed and should run again.
    Failed(Phase),
    /// The phase finished; the pipeline continues after it.
    Completed(Phase),
}

impl PhaseMarker {
    pub fn parse(marker: &str) -> Option<Self> {
        let marker = marker.trim();
        if let Some(token) = marker.strip_suffix("-failed") {
            return token.parse().ok().map(PhaseMarker::Failed);
        }
        let token = marker.strip_suffix("-complete").unwrap_or(marker);
        token.parse().ok().map(PhaseMarker::Completed)
    }

    pub fn phase(self) -> Phase {
        match self {
            PhaseMarker::Failed(p) | PhaseMarker::Completed(p) => p,
        }
    }
}

impl std::fmt::Display for PhaseMarker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PhaseMarker::Failed(p) => write!(f, "{}-failed", p.token()),
            PhaseMarker::Completed(p) => write!(f, "{}-complete", p.token()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn checkpoint(id: &str, timestamp: &str) -> Checkpoint {
        Checkpoint {
            id: id.to_string(),
            phase: "research-failed".to_string(),
            timestamp: timestamp.to_string(),
            git_commit: String::new(),
            state_snapshot: StateSnapshot {
                phase: "research".to_string(),
                context_usage: 0.0,
                artifacts: vec![],
                errors: vec![],
            },
        }
    }

    #[test]
    fn test_marker_parse() {
        assert_eq!(
            PhaseMarker::parse("tdd_planning-failed"),
            Some(PhaseMarker::Failed(Phase::TddPlanning))
        );
        assert_eq!(
            PhaseMarker::parse("multi_doc-complete"),
            Some(PhaseMarker::Completed(Phase::MultiDoc))
        );
        assert_eq!(
            PhaseMarker::parse("decomposition"),
            Some(PhaseMarker::Completed(Phase::Decomposition))
        );
        assert_eq!(PhaseMarker::parse("deploy-failed"), None);
        assert_eq!(PhaseMarker::parse(""), None);
    }

    #[test]
    fn test_marker_display_parses_back() {
        for phase in Phase::ALL {
            for marker in [PhaseMarker::Failed(phase), PhaseMarker::Completed(phase)] {
                assert_eq!(PhaseMarker::parse(&marker.to_string()), Some(marker));
            }
        }
    }

    #[test]
    fn test_age_days_whole_days_clamped() {
        let now = Utc.with_ymd_and_hms(2026, 3, 10, 12, 0, 0).unwrap();
        assert_eq!(checkpoint("a", "2026-03-10T11:00:00.000Z").age_days(now), 0);
        assert_eq!(checkpoint("a", "2026-03-08T13:00:00.000Z").age_days(now), 1);
        assert_eq!(checkpoint("a", "2026-02-08T12:00:00.000Z").age_days(now), 30);
        assert_eq!(checkpoint("a", "2027-01-01T00:00:00.000Z").age_days(now), 0);
        assert_eq!(checkpoint("a", "yesterday").age_days(now), 0);
    }

    #[test]
    fn test_newest_first_orders_by_timestamp_then_id() {
        let mut list = vec![
            checkpoint("b", "2026-01-01T00:00:00.000Z"),
            checkpoint("a", "2026-01-02T00:00:00.000Z"),
            checkpoint("z", "not a time"),
            checkpoint("c", "2026-01-02T00:00:00.000Z"),
        ];
        list.sort_by(Checkpoint::newest_first);
        let ids: Vec<&str> = list.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "a", "b", "z"]);
    }

    #[test]
    fn test_checkpoint_json_field_names() {
        let cp = checkpoint("id-1", "2026-01-01T00:00:00.000Z");
        let value: serde_json::Value = serde_json::to_value(&cp).unwrap();
        assert_eq!(value["id"], "id-1");
        assert_eq!(value["phase"], "research-failed");
        assert_eq!(value["git_commit"], "");
        assert_eq!(value["state_snapshot"]["phase"], "research");
        assert_eq!(value["state_snapshot"]["context_usage"], 0.0);
        assert!(value["state_snapshot"]["artifacts"].is_array());
        assert!(value["state_snapshot"]["errors"].is_array());
    }
}
