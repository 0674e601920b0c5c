//! Pipeline phases and the phase-group table.
//!
//! This module provides:
//! - `Phase`, the fixed set of pipeline phases with their wire tokens
//! - per-phase artifact filename patterns and required upstream inputs
//! - `PhaseGroup` / `PhaseGroupTable`, the pause/checkpoint boundaries
//!
//! The standard table is:
//!
//! | Group     | Phases                                  |
//! |-----------|-----------------------------------------|
//! | Planning  | research, decomposition, tdd_planning   |
//! | Document  | multi_doc, beads_sync                   |
//! | Execution | implementation                          |

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::errors::PhaseTableError;

/// A single pipeline phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Research,
    Decomposition,
    TddPlanning,
    MultiDoc,
    BeadsSync,
    Implementation,
}

impl Phase {
    /// Every phase, in execution order.
    pub const ALL: [Phase; 6] = [
        Phase::Research,
        Phase::Decomposition,
        Phase::TddPlanning,
        Phase::MultiDoc,
        Phase::BeadsSync,
        Phase::Implementation,
    ];

    /// Wire token used in checkpoint files, config keys and the CLI.
    pub fn token(self) -> &'static str {
        match self {
            Phase::Research => "research",
            Phase::Decomposition => "decomposition",
            Phase::TddPlanning => "tdd_planning",
            Phase::MultiDoc => "multi_doc",
            Phase::BeadsSync => "beads_sync",
            Phase::Implementation => "implementation",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            Phase::Research => "Research",
            Phase::Decomposition => "Decomposition",
            Phase::TddPlanning => "TDD planning",
            Phase::MultiDoc => "Multi-doc generation",
            Phase::BeadsSync => "Beads sync",
            Phase::Implementation => "Implementation",
        }
    }

    /// Filename glob matched against artifacts this phase writes.
    /// `None` for phases whose output lives outside the artifacts directory.
    pub fn artifact_pattern(self) -> Option<&'static str> {
        match self {
            Phase::Research => Some("*-research.md"),
            Phase::Decomposition => Some("*-decomposition.json"),
            Phase::TddPlanning => Some("*-tdd-plan.md"),
            Phase::MultiDoc => Some("*-docs.md"),
            Phase::BeadsSync | Phase::Implementation => None,
        }
    }

    pub fn produces_artifact(self) -> bool {
        self.artifact_pattern().is_some()
    }

    /// Upstream phases whose artifacts must be available before this phase runs.
    pub fn required_inputs(self) -> &'static [Phase] {
        match self {
            Phase::Research => &[],
            Phase::Decomposition => &[Phase::Research],
            Phase::TddPlanning => &[Phase::Research, Phase::Decomposition],
            Phase::MultiDoc | Phase::BeadsSync | Phase::Implementation => &[Phase::TddPlanning],
        }
    }

    /// Whether `file_name` looks like this phase's artifact.
    pub fn matches_artifact(self, file_name: &str) -> bool {
        self.artifact_pattern()
            .and_then(|p| glob::Pattern::new(p).ok())
            .is_some_and(|p| p.matches(file_name))
    }

    /// Environment variable a phase command reads this phase's artifact from.
    pub fn input_env_var(self) -> String {
        format!("PHASEGATE_INPUT_{}", self.token().to_uppercase())
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.token())
    }
}

impl std::str::FromStr for Phase {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase().replace('-', "_");
        Phase::ALL
            .into_iter()
            .find(|p| p.token() == normalized)
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "Invalid phase '{}'. Valid values: {}",
                    s,
                    Phase::ALL.map(Phase::token).join(", ")
                )
            })
    }
}

/// Phases that share one pause/checkpoint boundary. The boundary is the last phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseGroup {
    pub name: String,
    pub phases: Vec<Phase>,
}

impl PhaseGroup {
    pub fn new(name: impl Into<String>, phases: Vec<Phase>) -> Self {
        Self {
            name: name.into(),
            phases,
        }
    }

    pub fn contains(&self, phase: Phase) -> bool {
        self.phases.contains(&phase)
    }

    /// The last phase of the group. Groups in a validated table are never empty.
    pub fn boundary(&self) -> Option<Phase> {
        self.phases.last().copied()
    }

    pub fn is_boundary(&self, phase: Phase) -> bool {
        self.boundary() == Some(phase)
    }
}

/// Ordered, validated list of phase groups. Group order is execution order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseGroupTable {
    groups: Vec<PhaseGroup>,
}

impl PhaseGroupTable {
    /// Validate and build a table.
    ///
    /// Groups must be non-empty, no phase may appear twice, and phases must be
    /// listed in execution order across the whole table. Phases left out of
    /// every group are simply not part of the pipeline.
    pub fn new(groups: Vec<PhaseGroup>) -> Result<Self, PhaseTableError> {
        let mut seen = HashSet::new();
        let mut last: Option<Phase> = None;
        for group in &groups {
            if group.phases.is_empty() {
                return Err(PhaseTableError::EmptyGroup(group.name.clone()));
            }
            for &phase in &group.phases {
                if !seen.insert(phase) {
                    return Err(PhaseTableError::Duplicate(phase));
                }
                if last.is_some_and(|prev| prev > phase) {
                    return Err(PhaseTableError::OutOfOrder {
                        phase,
                        group: group.name.clone(),
                    });
                }
                last = Some(phase);
            }
        }
        Ok(Self { groups })
    }

    /// Planning → Document → Execution.
    pub fn standard() -> Self {
        Self {
            groups: vec![
                PhaseGroup::new(
                    "Planning",
                    vec![Phase::Research, Phase::Decomposition, Phase::TddPlanning],
                ),
                PhaseGroup::new("Document", vec![Phase::MultiDoc, Phase::BeadsSync]),
                PhaseGroup::new("Execution", vec![Phase::Implementation]),
            ],
        }
    }

    pub fn groups(&self) -> &[PhaseGroup] {
        &self.groups
    }

    pub fn try_group_of(&self, phase: Phase) -> Option<&PhaseGroup> {
        self.groups.iter().find(|g| g.contains(phase))
    }

    /// The group `phase` belongs to.
    ///
    /// # Panics
    /// If `phase` is not registered in this table. Asking about a phase the
    /// pipeline does not run is a programming error.
    pub fn group_of(&self, phase: Phase) -> &PhaseGroup {
        match self.try_group_of(phase) {
            Some(group) => group,
            None => panic!("phase '{}' is not registered in any phase group", phase),
        }
    }

    pub fn is_group_boundary(&self, phase: Phase) -> bool {
        self.group_of(phase).is_boundary(phase)
    }

    pub fn contains(&self, phase: Phase) -> bool {
        self.try_group_of(phase).is_some()
    }

    /// All registered phases in execution order.
    pub fn phases(&self) -> Vec<Phase> {
        self.groups
            .iter()
            .flat_map(|g| g.phases.iter().copied())
            .collect()
    }

    /// The registered phase after `phase`, crossing group boundaries.
    pub fn next_phase(&self, phase: Phase) -> Option<Phase> {
        let phases = self.phases();
        let idx = phases.iter().position(|p| *p == phase)?;
        phases.get(idx + 1).copied()
    }

    pub fn first_phase(&self) -> Option<Phase> {
        self.groups.first().and_then(|g| g.phases.first().copied())
    }

    /// Registered phases from `start` (inclusive) to the end.
    pub fn phases_from(&self, start: Phase) -> Vec<Phase> {
        self.phases().into_iter().filter(|p| *p >= start).collect()
    }
}

impl Default for PhaseGroupTable {
    fn default() -> Self {
        Self::standard()
    }
}
