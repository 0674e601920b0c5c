//! Configuration for phasegate, read from `.phasegate/phasegate.toml`.
//!
//! Every section and field is optional and falls back to a default.
//! Settings are layered file → environment → CLI.
//!
//! # Configuration File Format
//!
//! ```toml
//! [pipeline]
//! autonomy_mode = "batch"
//! artifacts_dir = "docs/plans"
//! ticket = "ENG-142"
//!
//! [runner]
//! timeout_secs = 1800
//!
//! [retry]
//! max_retries = 2
//! initial_delay_ms = 1000
//! max_delay_ms = 30000
//! multiplier = 2.0
//! jitter = 0.1
//! policy = "transient"
//! transient_exit_codes = [124, 125, 126, 127, 137, 143]
//!
//! [checkpoints]
//! warn_days = 30
//!
//! [resume]
//! lookback_days = 7
//!
//! [phases.research]
//! command = "agent"
//! args = ["research", "--out", "docs/plans"]
//! timeout_secs = 3600
//!
//! [phases.research.env]
//! AGENT_MODEL = "large"
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use phasegate_exec::{RetryPolicy, RetryPredicate, TRANSIENT_EXIT_CODES};

use crate::autonomy::AutonomyMode;
use crate::phase::Phase;

/// Name of the per-project state directory.
pub const PHASEGATE_DIR: &str = ".phasegate";
pub const CONFIG_FILE: &str = "phasegate.toml";
pub const ENV_AUTONOMY: &str = "PHASEGATE_AUTONOMY";
pub const ENV_TICKET: &str = "PHASEGATE_TICKET";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSection {
    #[serde(default)]
    pub autonomy_mode: AutonomyMode,
    /// Where phases write their documents, relative to the project root
    #[serde(default = "default_artifacts_dir")]
    pub artifacts_dir: PathBuf,
    #[serde(default)]
    pub ticket: Option<String>,
}

fn default_artifacts_dir() -> PathBuf {
    PathBuf::from("docs/plans")
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            autonomy_mode: AutonomyMode::default(),
            artifacts_dir: default_artifacts_dir(),
            ticket: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerSection {
    /// Default per-command timeout
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    1800
}

impl Default for RunnerSection {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
        }
    }
}

/// Which failures a phase command is retried on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryOn {
    AnyFailure,
    Timeout,
    #[default]
    Transient,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySection {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_jitter")]
    pub jitter: f64,
    #[serde(default)]
    pub policy: RetryOn,
    #[serde(default = "default_transient_exit_codes")]
    pub transient_exit_codes: Vec<i32>,
}

fn default_max_retries() -> u32 {
    2
}

fn default_initial_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_jitter() -> f64 {
    0.1
}

fn default_transient_exit_codes() -> Vec<i32> {
    TRANSIENT_EXIT_CODES.to_vec()
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
            jitter: default_jitter(),
            policy: RetryOn::default(),
            transient_exit_codes: default_transient_exit_codes(),
        }
    }
}

impl RetrySection {
    /// Build and validate the retry policy used for phase commands.
    pub fn to_policy(&self) -> Result<RetryPolicy> {
        let predicate = match self.policy {
            RetryOn::AnyFailure => RetryPredicate::AnyFailure,
            RetryOn::Timeout => RetryPredicate::TimeoutOnly,
            RetryOn::Transient => {
                RetryPredicate::TransientExitCodes(self.transient_exit_codes.iter().copied().collect())
            }
        };
        let policy = RetryPolicy {
            max_retries: self.max_retries,
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            multiplier: self.multiplier,
            jitter_fraction: self.jitter,
            predicate,
        };
        policy.validate().context("Invalid [retry] section")?;
        Ok(policy)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointsSection {
    /// Checkpoints older than this are reported as stale
    #[serde(default = "default_warn_days")]
    pub warn_days: i64,
}

fn default_warn_days() -> i64 {
    30
}

impl Default for CheckpointsSection {
    fn default() -> Self {
        Self {
            warn_days: default_warn_days(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResumeSection {
    /// How far back artifact discovery looks before offering to widen
    #[serde(default = "default_lookback_days")]
    pub lookback_days: i64,
}

fn default_lookback_days() -> i64 {
    7
}

impl Default for ResumeSection {
    fn default() -> Self {
        Self {
            lookback_days: default_lookback_days(),
        }
    }
}

/// The external command behind one phase.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PhaseCommand {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Overrides `[runner] timeout_secs` for this phase
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Relative to the project root
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
}

/// Where run logs are written for the project at `project_dir`. Known before
/// the config file is read, so logging can start first.
pub fn log_dir(project_dir: &Path) -> PathBuf {
    project_dir.join(PHASEGATE_DIR).join("logs")
}

/// The complete phasegate.toml structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PhasegateToml {
    #[serde(default)]
    pub pipeline: PipelineSection,
    #[serde(default)]
    pub runner: RunnerSection,
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub checkpoints: CheckpointsSection,
    #[serde(default)]
    pub resume: ResumeSection,
    /// Keyed by phase token
    #[serde(default)]
    pub phases: BTreeMap<String, PhaseCommand>,
}

impl PhasegateToml {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    /// Parse the file and rewrite `[phases]` keys to canonical phase tokens,
    /// so `[phases.tdd-planning]` configures `tdd_planning`.
    pub fn parse(content: &str) -> Result<Self> {
        let mut toml: Self = toml::from_str(content).context("Failed to parse phasegate.toml")?;
        toml.phases = canonical_phase_keys(std::mem::take(&mut toml.phases))?;
        Ok(toml)
    }

    /// Load `.phasegate/phasegate.toml`, or defaults if it does not exist.
    pub fn load_or_default(phasegate_dir: &Path) -> Result<Self> {
        let config_path = phasegate_dir.join(CONFIG_FILE);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn phase_command(&self, phase: Phase) -> Option<&PhaseCommand> {
        self.phases.get(phase.token())
    }

    /// Non-fatal problems worth telling the user about.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        for (key, cmd) in &self.phases {
            if key.parse::<Phase>().is_err() {
                warnings.push(format!("Unknown phase '{}' in [phases]; it will never run", key));
            }
            if cmd.command.trim().is_empty() {
                warnings.push(format!("[phases.{}] has an empty command", key));
            }
            if cmd.timeout_secs == Some(0) {
                warnings.push(format!("[phases.{}] timeout_secs = 0 times out immediately", key));
            }
        }
        if self.runner.timeout_secs == 0 {
            warnings.push("[runner] timeout_secs = 0 times out every command immediately".into());
        }
        if self.checkpoints.warn_days < 0 {
            warnings.push(format!(
                "[checkpoints] warn_days = {} is negative; every checkpoint will be reported stale",
                self.checkpoints.warn_days
            ));
        }
        if self.resume.lookback_days <= 0 {
            warnings.push(format!(
                "[resume] lookback_days = {} finds no artifacts until widened",
                self.resume.lookback_days
            ));
        }

        warnings
    }
}

fn canonical_phase_keys(phases: BTreeMap<String, PhaseCommand>) -> Result<BTreeMap<String, PhaseCommand>> {
    let mut canonical = BTreeMap::new();
    for (key, cmd) in phases {
        // Unknown keys are kept as written; validate() reports them.
        let token = match key.parse::<Phase>() {
            Ok(phase) => phase.token().to_string(),
            Err(_) => key.clone(),
        };
        if canonical.contains_key(&token) {
            anyhow::bail!("Phase '{}' is configured more than once in [phases] (as '{}')", token, key);
        }
        canonical.insert(token, cmd);
    }
    Ok(canonical)
}

/// The immutable record a pipeline run is driven by.
///
/// Auto-approve is deliberately absent: it is derived per phase from the
/// autonomy mode by [`crate::autonomy::AutonomyPolicy`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    project_root: PathBuf,
    autonomy_mode: AutonomyMode,
    ticket_id: Option<String>,
}

impl PipelineConfig {
    pub fn new(project_root: PathBuf, autonomy_mode: AutonomyMode, ticket_id: Option<String>) -> Self {
        Self {
            project_root,
            autonomy_mode,
            ticket_id,
        }
    }

    pub fn project_root(&self) -> &Path {
        &self.project_root
    }

    pub fn autonomy_mode(&self) -> AutonomyMode {
        self.autonomy_mode
    }

    pub fn ticket_id(&self) -> Option<&str> {
        self.ticket_id.as_deref()
    }
}

/// CLI-level overrides, highest precedence.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub autonomy: Option<AutonomyMode>,
    pub ticket: Option<String>,
}

/// Values read from the environment, kept separate so layering is testable.
#[derive(Debug, Clone, Default)]
pub struct EnvOverrides {
    pub autonomy: Option<String>,
    pub ticket: Option<String>,
}

impl EnvOverrides {
    pub fn from_env() -> Self {
        Self {
            autonomy: std::env::var(ENV_AUTONOMY).ok().filter(|v| !v.is_empty()),
            ticket: std::env::var(ENV_TICKET).ok().filter(|v| !v.is_empty()),
        }
    }
}

/// Project configuration: parsed file plus the resolved pipeline record.
#[derive(Debug, Clone)]
pub struct PhasegateConfig {
    pub project_dir: PathBuf,
    pub phasegate_dir: PathBuf,
    pub toml: PhasegateToml,
    pipeline: PipelineConfig,
}

impl PhasegateConfig {
    /// Load configuration for `project_dir`, layering the process environment
    /// and `cli` over the file.
    pub fn load(project_dir: &Path, cli: CliOverrides) -> Result<Self> {
        Self::load_with_env(project_dir, EnvOverrides::from_env(), cli)
    }

    pub fn load_with_env(project_dir: &Path, env: EnvOverrides, cli: CliOverrides) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;
        let phasegate_dir = project_dir.join(PHASEGATE_DIR);
        let toml = PhasegateToml::load_or_default(&phasegate_dir)?;
        Self::from_parts(project_dir, toml, env, cli)
    }

    /// Resolve file → environment → CLI precedence.
    pub fn from_parts(
        project_dir: PathBuf,
        toml: PhasegateToml,
        env: EnvOverrides,
        cli: CliOverrides,
    ) -> Result<Self> {
        let env_autonomy = env
            .autonomy
            .as_deref()
            .map(str::parse::<AutonomyMode>)
            .transpose()
            .with_context(|| format!("Invalid {}", ENV_AUTONOMY))?;

        let autonomy_mode = cli
            .autonomy
            .or(env_autonomy)
            .unwrap_or(toml.pipeline.autonomy_mode);
        let ticket_id = cli
            .ticket
            .or(env.ticket)
            .or_else(|| toml.pipeline.ticket.clone());

        let phasegate_dir = project_dir.join(PHASEGATE_DIR);
        let pipeline = PipelineConfig::new(project_dir.clone(), autonomy_mode, ticket_id);
        Ok(Self {
            project_dir,
            phasegate_dir,
            toml,
            pipeline,
        })
    }

    pub fn pipeline(&self) -> &PipelineConfig {
        &self.pipeline
    }

    pub fn lock_file(&self) -> PathBuf {
        self.phasegate_dir.join("run.lock")
    }

    pub fn artifacts_dir(&self) -> PathBuf {
        self.project_dir.join(&self.toml.pipeline.artifacts_dir)
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.toml.runner.timeout_secs)
    }

    pub fn validate(&self) -> Vec<String> {
        self.toml.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_parse_empty_uses_defaults() {
        let toml = PhasegateToml::parse("").unwrap();
        assert_eq!(toml.pipeline.autonomy_mode, AutonomyMode::Checkpoint);
        assert_eq!(toml.pipeline.artifacts_dir, PathBuf::from("docs/plans"));
        assert!(toml.pipeline.ticket.is_none());
        assert_eq!(toml.runner.timeout_secs, 1800);
        assert_eq!(toml.retry.max_retries, 2);
        assert_eq!(toml.retry.policy, RetryOn::Transient);
        assert_eq!(toml.retry.transient_exit_codes, TRANSIENT_EXIT_CODES.to_vec());
        assert_eq!(toml.checkpoints.warn_days, 30);
        assert_eq!(toml.resume.lookback_days, 7);
        assert!(toml.phases.is_empty());
    }

    #[test]
    fn test_parse_full_file() {
        let toml = PhasegateToml::parse(
            r#"
[pipeline]
autonomy_mode = "fully_autonomous"
artifacts_dir = "plans"
ticket = "ENG-1"

[retry]
max_retries = 5
policy = "timeout"

[phases.tdd_planning]
command = "agent"
args = ["plan"]
timeout_secs = 60
working_dir = "sub"

[phases.tdd_planning.env]
MODEL = "big"
"#,
        )
        .unwrap();
        assert_eq!(toml.pipeline.autonomy_mode, AutonomyMode::FullyAutonomous);
        assert_eq!(toml.pipeline.ticket.as_deref(), Some("ENG-1"));
        assert_eq!(toml.retry.max_retries, 5);
        assert_eq!(toml.retry.policy, RetryOn::Timeout);

        let cmd = toml.phase_command(Phase::TddPlanning).unwrap();
        assert_eq!(cmd.command, "agent");
        assert_eq!(cmd.args, vec!["plan"]);
        assert_eq!(cmd.timeout_secs, Some(60));
        assert_eq!(cmd.working_dir, Some(PathBuf::from("sub")));
        assert_eq!(cmd.env.get("MODEL").map(String::as_str), Some("big"));
        assert!(toml.phase_command(Phase::Research).is_none());
    }

    #[test]
    fn test_unknown_autonomy_mode_in_file_is_error() {
        let result = PhasegateToml::parse("[pipeline]\nautonomy_mode = \"yolo\"\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_retry_section_builds_transient_policy() {
        let policy = RetrySection::default().to_policy().unwrap();
        assert_eq!(policy.max_retries, 2);
        assert_eq!(policy.initial_delay, Duration::from_secs(1));
        assert_eq!(policy.max_delay, Duration::from_secs(30));
        match policy.predicate {
            RetryPredicate::TransientExitCodes(codes) => {
                assert!(codes.contains(&124));
                assert!(!codes.contains(&1));
            }
            other => panic!("Expected transient predicate, got {:?}", other),
        }
    }

    #[test]
    fn test_retry_section_rejects_bad_multiplier() {
        let section = RetrySection {
            multiplier: 1.0,
            ..RetrySection::default()
        };
        let err = section.to_policy().unwrap_err();
        assert!(format!("{:#}", err).contains("multiplier"));
    }

    #[test]
    fn test_validate_warns_about_unknown_phase_and_empty_command() {
        let toml = PhasegateToml::parse(
            r#"
[phases.deploy]
command = "ship"

[phases.research]
command = " "
"#,
        )
        .unwrap();
        let warnings = toml.validate();
        assert!(warnings.iter().any(|w| w.contains("Unknown phase 'deploy'")));
        assert!(warnings.iter().any(|w| w.contains("[phases.research] has an empty command")));
    }

    #[test]
    fn test_phase_keys_are_canonicalised() {
        let toml = PhasegateToml::parse(
            r#"
[phases.tdd-planning]
command = "planner"

[phases.Multi_Doc]
command = "docs"
"#,
        )
        .unwrap();
        assert_eq!(toml.phase_command(Phase::TddPlanning).unwrap().command, "planner");
        assert_eq!(toml.phase_command(Phase::MultiDoc).unwrap().command, "docs");
        assert!(toml.phases.contains_key("tdd_planning"));
        assert!(!toml.phases.contains_key("tdd-planning"));
        assert!(toml.validate().is_empty());
    }

    #[test]
    fn test_phase_alias_and_token_together_is_error() {
        let err = PhasegateToml::parse(
            r#"
[phases.tdd_planning]
command = "a"

[phases.tdd-planning]
command = "b"
"#,
        )
        .unwrap_err();
        assert!(format!("{:#}", err).contains("more than once"));
    }

    #[test]
    fn test_validate_clean_default() {
        assert!(PhasegateToml::default().validate().is_empty());
    }

    #[test]
    fn test_layering_cli_over_env_over_file() {
        let mut toml = PhasegateToml::default();
        toml.pipeline.autonomy_mode = AutonomyMode::Batch;
        toml.pipeline.ticket = Some("FILE-1".into());

        let from_file = PhasegateConfig::from_parts(
            PathBuf::from("/p"),
            toml.clone(),
            EnvOverrides::default(),
            CliOverrides::default(),
        )
        .unwrap();
        assert_eq!(from_file.pipeline().autonomy_mode(), AutonomyMode::Batch);
        assert_eq!(from_file.pipeline().ticket_id(), Some("FILE-1"));

        let env = EnvOverrides {
            autonomy: Some("fully_autonomous".into()),
            ticket: Some("ENV-2".into()),
        };
        let from_env = PhasegateConfig::from_parts(
            PathBuf::from("/p"),
            toml.clone(),
            env.clone(),
            CliOverrides::default(),
        )
        .unwrap();
        assert_eq!(from_env.pipeline().autonomy_mode(), AutonomyMode::FullyAutonomous);
        assert_eq!(from_env.pipeline().ticket_id(), Some("ENV-2"));

        let cli = CliOverrides {
            autonomy: Some(AutonomyMode::Checkpoint),
            ticket: Some("CLI-3".into()),
        };
        let from_cli = PhasegateConfig::from_parts(PathBuf::from("/p"), toml, env, cli).unwrap();
        assert_eq!(from_cli.pipeline().autonomy_mode(), AutonomyMode::Checkpoint);
        assert_eq!(from_cli.pipeline().ticket_id(), Some("CLI-3"));
    }

    #[test]
    fn test_invalid_env_autonomy_is_error() {
        let env = EnvOverrides {
            autonomy: Some("sometimes".into()),
            ticket: None,
        };
        let result = PhasegateConfig::from_parts(
            PathBuf::from("/p"),
            PhasegateToml::default(),
            env,
            CliOverrides::default(),
        );
        let err = result.unwrap_err();
        assert!(format!("{:#}", err).contains(ENV_AUTONOMY));
    }

    #[test]
    fn test_load_reads_file_and_resolves_paths() {
        let dir = tempdir().unwrap();
        let pg_dir = dir.path().join(PHASEGATE_DIR);
        std::fs::create_dir_all(&pg_dir).unwrap();
        std::fs::write(
            pg_dir.join(CONFIG_FILE),
            "[pipeline]\nautonomy_mode = \"batch\"\n[runner]\ntimeout_secs = 5\n",
        )
        .unwrap();

        let config =
            PhasegateConfig::load_with_env(dir.path(), EnvOverrides::default(), CliOverrides::default())
                .unwrap();
        let root = dir.path().canonicalize().unwrap();
        assert_eq!(config.pipeline().project_root(), root.as_path());
        assert_eq!(config.pipeline().autonomy_mode(), AutonomyMode::Batch);
        assert_eq!(config.lock_file(), root.join(".phasegate/run.lock"));
        assert_eq!(config.artifacts_dir(), root.join("docs/plans"));
        assert_eq!(config.default_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_log_dir_is_under_state_dir() {
        assert_eq!(log_dir(Path::new("/p")), PathBuf::from("/p/.phasegate/logs"));
    }

    #[test]
    fn test_load_without_file_uses_defaults() {
        let dir = tempdir().unwrap();
        let config =
            PhasegateConfig::load_with_env(dir.path(), EnvOverrides::default(), CliOverrides::default())
                .unwrap();
        assert_eq!(config.pipeline().autonomy_mode(), AutonomyMode::Checkpoint);
        assert!(config.pipeline().ticket_id().is_none());
    }
}
