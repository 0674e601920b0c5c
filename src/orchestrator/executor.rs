use async_trait::async_trait;
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::LazyLock;
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

use phasegate_exec::{
    CancellationToken, CommandResult, CommandRunner, CommandSpec, FailureKind, RetryRunner,
};

use super::{PhaseContext, PhaseExecutor, PhaseFailure, PhaseReport};
use crate::config::PhaseCommand;
use crate::resume::artifacts_matching;

/// Tag a phase command may print to report context-window usage, e.g.
/// `<context-usage>0.42</context-usage>`. The last well-formed occurrence wins.
static CONTEXT_USAGE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<context-usage>\s*([0-9]*\.?[0-9]+(?:[eE][+-]?[0-9]+)?)\s*</context-usage>")
        .expect("context-usage pattern is a valid static regex")
});

/// Filesystems with coarse mtimes can stamp a fresh artifact slightly
/// before the phase start we recorded.
const MTIME_SLACK: Duration = Duration::from_secs(2);

/// Runs each phase's configured command and collects the artifact it wrote.
pub struct CommandPhaseExecutor<R = RetryRunner> {
    runner: R,
    commands: BTreeMap<String, PhaseCommand>,
}

impl<R: CommandRunner> CommandPhaseExecutor<R> {
    pub fn new(runner: R, commands: BTreeMap<String, PhaseCommand>) -> Self {
        Self { runner, commands }
    }

    /// The child's command line, environment and working directory for `ctx`.
    pub fn build_spec(&self, ctx: &PhaseContext) -> Option<CommandSpec> {
        let cmd = self.commands.get(ctx.phase.token())?;

        let working_dir = match &cmd.working_dir {
            Some(dir) if dir.is_absolute() => dir.clone(),
            Some(dir) => ctx.project_root.join(dir),
            None => ctx.project_root.clone(),
        };

        let mut spec = CommandSpec::new(&cmd.command)
            .args(&cmd.args)
            .current_dir(working_dir)
            .envs(&cmd.env)
            .env("PHASEGATE_PHASE", ctx.phase.token())
            .env("PHASEGATE_TICKET", ctx.ticket_id.as_deref().unwrap_or(""))
            .env("PHASEGATE_AUTO_APPROVE", if ctx.auto_approve { "true" } else { "false" })
            .env("PHASEGATE_PROJECT_ROOT", ctx.project_root.to_string_lossy())
            .env("PHASEGATE_ARTIFACTS_DIR", ctx.artifacts_dir.to_string_lossy());
        for (phase, path) in &ctx.inputs {
            spec = spec.env(phase.input_env_var(), path.to_string_lossy());
        }
        if let Some(secs) = cmd.timeout_secs {
            spec = spec.timeout(Duration::from_secs(secs));
        }
        Some(spec)
    }
}

#[async_trait]
impl<R: CommandRunner> PhaseExecutor for CommandPhaseExecutor<R> {
    async fn execute(
        &self,
        cancel: &CancellationToken,
        ctx: &PhaseContext,
    ) -> Result<PhaseReport, PhaseFailure> {
        let Some(spec) = self.build_spec(ctx) else {
            return Err(PhaseFailure::new(format!(
                "no command configured for phase {} (add [phases.{}] to phasegate.toml)",
                ctx.phase,
                ctx.phase.token()
            )));
        };

        let started = SystemTime::now()
            .checked_sub(MTIME_SLACK)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        info!(phase = %ctx.phase, command = %spec.display(), "Running phase command");

        let result = self.runner.run(cancel, &spec).await;
        debug!(
            phase = %ctx.phase,
            exit_code = result.exit_code(),
            elapsed = ?result.elapsed(),
            "Phase command finished"
        );
        if !result.success() {
            return Err(failure_from(&result));
        }

        let context_usage = parse_context_usage(result.output()).unwrap_or(0.0);

        let Some(pattern) = ctx.phase.artifact_pattern() else {
            return Ok(PhaseReport {
                artifacts: Vec::new(),
                context_usage,
            });
        };
        let written = artifacts_matching(&ctx.artifacts_dir, ctx.phase, Some(started));
        match written.into_iter().next() {
            Some(newest) => Ok(PhaseReport {
                artifacts: vec![newest.path],
                context_usage,
            }),
            None => {
                warn!(phase = %ctx.phase, pattern, "Phase succeeded without writing an artifact");
                Err(PhaseFailure::new(format!(
                    "command succeeded but wrote no '{}' artifact in {}",
                    pattern,
                    ctx.artifacts_dir.display()
                )))
            }
        }
    }
}

fn failure_from(result: &CommandResult) -> PhaseFailure {
    match result.failure_kind() {
        Some(FailureKind::Cancelled) => PhaseFailure::cancelled(result.error()),
        Some(FailureKind::NonZeroExit(code)) => {
            let error = result.error();
            if error.contains(&format!("code {}", code)) {
                PhaseFailure::new(error)
            } else {
                PhaseFailure::new(format!("exit code {}: {}", code, error))
            }
        }
        _ => PhaseFailure::new(result.error()),
    }
}

/// Last `<context-usage>…</context-usage>` value in `output`, clamped to [0, 1].
pub fn parse_context_usage(output: &str) -> Option<f64> {
    let caps = CONTEXT_USAGE_REGEX.captures_iter(output).last()?;
    let value: f64 = caps.get(1)?.as_str().parse().ok()?;
    value.is_finite().then(|| value.clamp(0.0, 1.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phase::Phase;
    use std::path::{Path, PathBuf};
    use std::sync::Mutex;
    use tempfile::tempdir;

    /// Records the spec it was given and optionally writes a file first.
    struct FakeRunner {
        result: CommandResult,
        writes: Option<PathBuf>,
        seen: Mutex<Vec<CommandSpec>>,
    }

    impl FakeRunner {
        fn new(result: CommandResult, writes: Option<PathBuf>) -> Self {
            Self {
                result,
                writes,
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl CommandRunner for FakeRunner {
        async fn run(&self, _cancel: &CancellationToken, spec: &CommandSpec) -> CommandResult {
            if let Some(path) = &self.writes {
                std::fs::create_dir_all(path.parent().unwrap()).unwrap();
                std::fs::write(path, "written").unwrap();
            }
            self.seen.lock().unwrap().push(spec.clone());
            self.result.clone()
        }
    }

    fn ok() -> CommandResult {
        CommandResult::completed(0, "<context-usage>0.25</context-usage>\n".into(), "", Duration::from_millis(5))
    }

    fn commands(phase: Phase) -> BTreeMap<String, PhaseCommand> {
        BTreeMap::from([(
            phase.token().to_string(),
            PhaseCommand {
                command: "agent".into(),
                args: vec!["go".into()],
                env: BTreeMap::from([("MODEL".to_string(), "big".to_string())]),
                timeout_secs: Some(9),
                working_dir: Some(PathBuf::from("sub")),
            },
        )])
    }

    fn ctx(root: &Path, phase: Phase) -> PhaseContext {
        PhaseContext {
            phase,
            ticket_id: Some("ENG-7".into()),
            project_root: root.to_path_buf(),
            artifacts_dir: root.join("docs/plans"),
            inputs: BTreeMap::from([(Phase::Research, root.join("docs/plans/a-research.md"))]),
            auto_approve: true,
        }
    }

    fn env_of<'a>(spec: &'a CommandSpec, key: &str) -> Option<&'a str> {
        spec.get_env()
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    #[test]
    fn test_build_spec_exports_phase_environment() {
        let dir = tempdir().unwrap();
        let exec = CommandPhaseExecutor::new(FakeRunner::new(ok(), None), commands(Phase::Decomposition));
        let spec = exec.build_spec(&ctx(dir.path(), Phase::Decomposition)).unwrap();

        assert_eq!(spec.program(), "agent");
        assert_eq!(spec.get_args(), &["go".to_string()]);
        assert_eq!(spec.get_current_dir(), Some(dir.path().join("sub").as_path()));
        assert_eq!(spec.get_timeout(), Some(Duration::from_secs(9)));
        assert_eq!(env_of(&spec, "MODEL"), Some("big"));
        assert_eq!(env_of(&spec, "PHASEGATE_PHASE"), Some("decomposition"));
        assert_eq!(env_of(&spec, "PHASEGATE_TICKET"), Some("ENG-7"));
        assert_eq!(env_of(&spec, "PHASEGATE_AUTO_APPROVE"), Some("true"));
        assert!(env_of(&spec, "PHASEGATE_INPUT_RESEARCH").unwrap().ends_with("a-research.md"));
    }

    #[test]
    fn test_build_spec_without_command_is_none() {
        let dir = tempdir().unwrap();
        let exec = CommandPhaseExecutor::new(FakeRunner::new(ok(), None), BTreeMap::new());
        assert!(exec.build_spec(&ctx(dir.path(), Phase::Research)).is_none());
    }

    #[tokio::test]
    async fn test_execute_collects_new_artifact_and_usage() {
        let dir = tempdir().unwrap();
        let artifact = dir.path().join("docs/plans/x-decomposition.json");
        let exec = CommandPhaseExecutor::new(
            FakeRunner::new(ok(), Some(artifact.clone())),
            commands(Phase::Decomposition),
        );
        let report = exec
            .execute(&CancellationToken::new(), &ctx(dir.path(), Phase::Decomposition))
            .await
            .unwrap();
        assert_eq!(report.artifacts, vec![artifact]);
        assert_eq!(report.context_usage, 0.25);
    }

    #[tokio::test]
    async fn test_execute_without_artifact_fails() {
        let dir = tempdir().unwrap();
        let exec = CommandPhaseExecutor::new(FakeRunner::new(ok(), None), commands(Phase::Research));
        let failure = exec
            .execute(&CancellationToken::new(), &ctx(dir.path(), Phase::Research))
            .await
            .unwrap_err();
        assert!(failure.message.contains("*-research.md"));
        assert!(!failure.cancelled);
    }

    #[tokio::test]
    async fn test_execute_phase_without_pattern_needs_no_artifact() {
        let dir = tempdir().unwrap();
        let exec = CommandPhaseExecutor::new(FakeRunner::new(ok(), None), commands(Phase::Implementation));
        let report = exec
            .execute(&CancellationToken::new(), &ctx(dir.path(), Phase::Implementation))
            .await
            .unwrap();
        assert!(report.artifacts.is_empty());
    }

    #[tokio::test]
    async fn test_execute_nonzero_exit_fails_with_code() {
        let dir = tempdir().unwrap();
        let failed = CommandResult::completed(3, String::new(), "agent crashed", Duration::ZERO);
        let exec = CommandPhaseExecutor::new(FakeRunner::new(failed, None), commands(Phase::Research));
        let failure = exec
            .execute(&CancellationToken::new(), &ctx(dir.path(), Phase::Research))
            .await
            .unwrap_err();
        assert_eq!(failure.message, "exit code 3: agent crashed");
    }

    #[tokio::test]
    async fn test_execute_cancelled_is_marked() {
        let dir = tempdir().unwrap();
        let cancelled = CommandResult::cancelled(String::new(), Duration::ZERO);
        let exec = CommandPhaseExecutor::new(FakeRunner::new(cancelled, None), commands(Phase::Research));
        let failure = exec
            .execute(&CancellationToken::new(), &ctx(dir.path(), Phase::Research))
            .await
            .unwrap_err();
        assert!(failure.cancelled);
    }

    #[tokio::test]
    async fn test_execute_missing_command_fails() {
        let dir = tempdir().unwrap();
        let exec = CommandPhaseExecutor::new(FakeRunner::new(ok(), None), BTreeMap::new());
        let failure = exec
            .execute(&CancellationToken::new(), &ctx(dir.path(), Phase::MultiDoc))
            .await
            .unwrap_err();
        assert!(failure.message.contains("[phases.multi_doc]"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_execute_real_shell_command() {
        use phasegate_exec::{ProcessRunner, RetryPolicy};

        let dir = tempdir().unwrap();
        let commands = BTreeMap::from([(
            "research".to_string(),
            PhaseCommand {
                command: "sh".into(),
                args: vec![
                    "-c".into(),
                    "mkdir -p \"$PHASEGATE_ARTIFACTS_DIR\" && echo \"$PHASEGATE_TICKET\" > \"$PHASEGATE_ARTIFACTS_DIR/t-research.md\"".into(),
                ],
                ..PhaseCommand::default()
            },
        )]);
        let runner = RetryRunner::new(ProcessRunner::default(), RetryPolicy::no_retry());
        let exec = CommandPhaseExecutor::new(runner, commands);
        let report = exec
            .execute(&CancellationToken::new(), &ctx(dir.path(), Phase::Research))
            .await
            .unwrap();
        let written = std::fs::read_to_string(&report.artifacts[0]).unwrap();
        assert_eq!(written.trim(), "ENG-7");
    }

    #[test]
    fn test_parse_context_usage() {
        assert_eq!(parse_context_usage("x <context-usage>0.5</context-usage> y"), Some(0.5));
        assert_eq!(
            parse_context_usage("<context-usage>0.1</context-usage>\n<context-usage> 0.7 </context-usage>"),
            Some(0.7)
        );
        assert_eq!(parse_context_usage("<context-usage>3</context-usage>"), Some(1.0));
        assert_eq!(parse_context_usage("<context-usage>lots</context-usage>"), None);
        assert_eq!(parse_context_usage("no tag"), None);
    }

    #[test]
    fn test_parse_context_usage_ignores_trailing_broken_tags() {
        assert_eq!(
            parse_context_usage("<context-usage>0.4</context-usage>\nthen <context-usage>0.9"),
            Some(0.4)
        );
        assert_eq!(
            parse_context_usage("<context-usage>0.2</context-usage> <context-usage>n/a</context-usage>"),
            Some(0.2)
        );
        assert_eq!(parse_context_usage("<context-usage>1e-1</context-usage>"), Some(0.1));
    }
}
