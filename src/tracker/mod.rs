//! Version-control lookups recorded alongside checkpoints.

pub mod git;

pub use git::{GitCommitSource, GitTracker};
