//! Autonomy modes and the per-phase decision engine.
//!
//! | Mode               | Pause after phase   | Write checkpoint    | Auto-approve          |
//! |--------------------|---------------------|---------------------|-----------------------|
//! | `checkpoint`       | always              | always              | never                 |
//! | `batch`            | at group boundaries | at group boundaries | except at boundaries  |
//! | `fully_autonomous` | never               | always              | always                |
//!
//! In batch mode the three answers line up at group boundaries, but each is
//! computed on its own so a new mode can combine them differently without
//! touching the call sites. Everything here is pure: no I/O.

use serde::{Deserialize, Serialize};

use crate::phase::{Phase, PhaseGroup, PhaseGroupTable};

/// How often the pipeline stops for a human.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutonomyMode {
    /// Pause and checkpoint after every phase (default)
    #[default]
    Checkpoint,
    /// Pause and checkpoint only at phase-group boundaries
    Batch,
    /// Never pause; still checkpoint every phase for crash recovery
    FullyAutonomous,
}

impl AutonomyMode {
    pub const ALL: [AutonomyMode; 3] = [
        AutonomyMode::Checkpoint,
        AutonomyMode::Batch,
        AutonomyMode::FullyAutonomous,
    ];

    pub fn token(self) -> &'static str {
        match self {
            AutonomyMode::Checkpoint => "checkpoint",
            AutonomyMode::Batch => "batch",
            AutonomyMode::FullyAutonomous => "fully_autonomous",
        }
    }
}

impl std::fmt::Display for AutonomyMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.token())
    }
}

impl std::str::FromStr for AutonomyMode {
    type Err = anyhow::Error;

    /// Only the exact lowercase wire tokens are accepted.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AutonomyMode::ALL
            .into_iter()
            .find(|m| m.token() == s)
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "Invalid autonomy mode '{}'. Valid values: checkpoint, batch, fully_autonomous",
                    s
                )
            })
    }
}

/// The three answers for one phase, bundled for logging and display.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseDecision {
    pub pause: bool,
    pub write_checkpoint: bool,
    pub auto_approve: bool,
}

/// Answers pause/checkpoint/approval questions for a mode and a group table.
#[derive(Debug, Clone)]
pub struct AutonomyPolicy {
    mode: AutonomyMode,
    groups: PhaseGroupTable,
}

impl AutonomyPolicy {
    pub fn new(mode: AutonomyMode, groups: PhaseGroupTable) -> Self {
        Self { mode, groups }
    }

    /// Policy over the standard Planning/Document/Execution table.
    pub fn standard(mode: AutonomyMode) -> Self {
        Self::new(mode, PhaseGroupTable::standard())
    }

    pub fn mode(&self) -> AutonomyMode {
        self.mode
    }

    pub fn groups(&self) -> &PhaseGroupTable {
        &self.groups
    }

    /// # Panics
    /// If `phase` is not registered in the group table.
    pub fn phase_group(&self, phase: Phase) -> &PhaseGroup {
        self.groups.group_of(phase)
    }

    pub fn should_pause_after_phase(&self, phase: Phase) -> bool {
        match self.mode {
            AutonomyMode::Checkpoint => true,
            AutonomyMode::Batch => self.groups.is_group_boundary(phase),
            AutonomyMode::FullyAutonomous => false,
        }
    }

    pub fn should_write_checkpoint(&self, phase: Phase) -> bool {
        match self.mode {
            AutonomyMode::Checkpoint => true,
            AutonomyMode::Batch => self.groups.is_group_boundary(phase),
            AutonomyMode::FullyAutonomous => true,
        }
    }

    /// Whether the phase may skip its own interactive approvals.
    pub fn auto_approve(&self, phase: Phase) -> bool {
        match self.mode {
            AutonomyMode::Checkpoint => false,
            AutonomyMode::Batch => !self.groups.is_group_boundary(phase),
            AutonomyMode::FullyAutonomous => true,
        }
    }

    pub fn decide(&self, phase: Phase) -> PhaseDecision {
        PhaseDecision {
            pause: self.should_pause_after_phase(phase),
            write_checkpoint: self.should_write_checkpoint(phase),
            auto_approve: self.auto_approve(phase),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decision(pause: bool, write_checkpoint: bool, auto_approve: bool) -> PhaseDecision {
        PhaseDecision {
            pause,
            write_checkpoint,
            auto_approve,
        }
    }

    #[test]
    fn test_checkpoint_mode_research() {
        let policy = AutonomyPolicy::standard(AutonomyMode::Checkpoint);
        assert_eq!(policy.decide(Phase::Research), decision(true, true, false));
    }

    #[test]
    fn test_checkpoint_mode_every_phase() {
        let policy = AutonomyPolicy::standard(AutonomyMode::Checkpoint);
        for phase in Phase::ALL {
            assert_eq!(policy.decide(phase), decision(true, true, false), "{}", phase);
        }
    }

    #[test]
    fn test_batch_mode_non_boundary() {
        let policy = AutonomyPolicy::standard(AutonomyMode::Batch);
        assert_eq!(policy.decide(Phase::Research), decision(false, false, true));
        assert_eq!(policy.decide(Phase::Decomposition), decision(false, false, true));
        assert_eq!(policy.decide(Phase::MultiDoc), decision(false, false, true));
    }

    #[test]
    fn test_batch_mode_group_boundaries() {
        let policy = AutonomyPolicy::standard(AutonomyMode::Batch);
        assert_eq!(policy.decide(Phase::TddPlanning), decision(true, true, false));
        assert_eq!(policy.decide(Phase::BeadsSync), decision(true, true, false));
        assert_eq!(policy.decide(Phase::Implementation), decision(true, true, false));
    }

    #[test]
    fn test_fully_autonomous_every_phase() {
        let policy = AutonomyPolicy::standard(AutonomyMode::FullyAutonomous);
        for phase in Phase::ALL {
            assert_eq!(policy.decide(phase), decision(false, true, true), "{}", phase);
        }
    }

    #[test]
    fn test_batch_follows_custom_table() {
        let table = PhaseGroupTable::new(vec![
            PhaseGroup::new("Research", vec![Phase::Research]),
            PhaseGroup::new(
                "Rest",
                vec![Phase::Decomposition, Phase::TddPlanning, Phase::Implementation],
            ),
        ])
        .unwrap();
        let policy = AutonomyPolicy::new(AutonomyMode::Batch, table);
        assert!(policy.should_pause_after_phase(Phase::Research));
        assert!(!policy.should_pause_after_phase(Phase::TddPlanning));
        assert!(policy.should_write_checkpoint(Phase::Implementation));
        assert_eq!(policy.phase_group(Phase::TddPlanning).name, "Rest");
    }

    #[test]
    #[should_panic(expected = "not registered")]
    fn test_batch_decision_on_unregistered_phase_panics() {
        let table =
            PhaseGroupTable::new(vec![PhaseGroup::new("Only", vec![Phase::Research])]).unwrap();
        let policy = AutonomyPolicy::new(AutonomyMode::Batch, table);
        policy.should_pause_after_phase(Phase::MultiDoc);
    }

    #[test]
    fn test_mode_wire_tokens() {
        for mode in AutonomyMode::ALL {
            assert_eq!(mode.token().parse::<AutonomyMode>().unwrap(), mode);
            let json = serde_json::to_string(&mode).unwrap();
            assert_eq!(json, format!("\"{}\"", mode.token()));
        }
        assert_eq!(AutonomyMode::default(), AutonomyMode::Checkpoint);
    }

    #[test]
    fn test_unknown_mode_is_hard_error() {
        assert!("autonomous".parse::<AutonomyMode>().is_err());
        assert!("Batch".parse::<AutonomyMode>().is_err());
        assert!(serde_json::from_str::<AutonomyMode>("\"yolo\"").is_err());
    }
}
