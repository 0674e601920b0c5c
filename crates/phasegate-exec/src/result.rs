//! Outcome record of a single process execution.
//!
//! A `CommandResult` is created exactly once per execution and never mutated.
//! Subprocess failures (non-zero exit, timeout, cancellation, missing binary)
//! are encoded here instead of being returned as `Err`.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Error text carried by a result whose run was cancelled by the caller.
pub const CANCELLED_ERROR: &str = "command cancelled";

const TIMEOUT_PREFIX: &str = "command timed out after";
const NOT_FOUND_PREFIX: &str = "command not found:";
const SPAWN_FAILED_PREFIX: &str = "failed to start command:";

/// Exit code used when the process had no normal exit.
pub const NO_EXIT_CODE: i32 = -1;

/// Coarse classification of a failed result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The executable could not be located.
    NotFound,
    /// The deadline expired and the process was killed.
    Timeout,
    /// The caller cancelled the run.
    Cancelled,
    /// The process ran and exited with a non-zero code.
    NonZeroExit(i32),
    /// The process could not be started (bad working directory, permissions).
    SpawnFailed,
    /// Killed by a signal or lost while waiting.
    Terminated,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResult {
    success: bool,
    output: String,
    error: String,
    exit_code: i32,
    #[serde(rename = "elapsed_seconds", with = "elapsed_seconds")]
    elapsed: Duration,
}

impl CommandResult {
    /// Result for a process that exited normally with `exit_code`.
    ///
    /// A zero exit yields an empty error. A non-zero exit uses the trimmed
    /// stderr as the error, or names the exit code when stderr is empty.
    pub fn completed(exit_code: i32, stdout: String, stderr: &str, elapsed: Duration) -> Self {
        let error = if exit_code == 0 {
            String::new()
        } else if stderr.trim().is_empty() {
            format!("process exited with code {}", exit_code)
        } else {
            stderr.trim().to_string()
        };
        Self {
            success: exit_code == 0,
            output: stdout,
            error,
            exit_code,
            elapsed,
        }
    }

    /// The deterministic result of a run that hit its deadline.
    pub fn timeout(timeout: Duration) -> Self {
        Self::timed_out(timeout, String::new())
    }

    /// Timeout result that keeps whatever output was captured before the kill.
    pub fn timed_out(timeout: Duration, partial_output: String) -> Self {
        Self {
            success: false,
            output: partial_output,
            error: format!("{} {:.3}s", TIMEOUT_PREFIX, timeout.as_secs_f64()),
            exit_code: NO_EXIT_CODE,
            elapsed: timeout,
        }
    }

    pub fn cancelled(partial_output: String, elapsed: Duration) -> Self {
        Self {
            success: false,
            output: partial_output,
            error: CANCELLED_ERROR.to_string(),
            exit_code: NO_EXIT_CODE,
            elapsed,
        }
    }

    pub fn not_found(program: &str) -> Self {
        Self {
            success: false,
            output: String::new(),
            error: format!("{} {}", NOT_FOUND_PREFIX, program),
            exit_code: NO_EXIT_CODE,
            elapsed: Duration::ZERO,
        }
    }

    /// The process was never started.
    pub fn spawn_failed(reason: &str, elapsed: Duration) -> Self {
        Self {
            success: false,
            output: String::new(),
            error: format!("{} {}", SPAWN_FAILED_PREFIX, reason),
            exit_code: NO_EXIT_CODE,
            elapsed,
        }
    }

    /// The process never produced a normal exit code (signal or wait failure).
    pub fn terminated(reason: impl Into<String>, partial_output: String, elapsed: Duration) -> Self {
        let reason = reason.into();
        Self {
            success: false,
            output: partial_output,
            error: if reason.is_empty() {
                "process terminated abnormally".to_string()
            } else {
                reason
            },
            exit_code: NO_EXIT_CODE,
            elapsed,
        }
    }

    pub fn success(&self) -> bool {
        self.success
    }

    /// Captured stdout, lossily decoded. Live sinks got the raw bytes.
    pub fn output(&self) -> &str {
        &self.output
    }

    pub fn error(&self) -> &str {
        &self.error
    }

    pub fn exit_code(&self) -> i32 {
        self.exit_code
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    /// True for any failed result without a normal exit that carries an error.
    ///
    /// This is the broad "did not finish on its own" check; use
    /// [`CommandResult::failure_kind`] to tell timeouts from cancellations.
    pub fn is_timeout(&self) -> bool {
        self.exit_code == NO_EXIT_CODE && !self.success && !self.error.is_empty()
    }

    pub fn is_cancelled(&self) -> bool {
        self.failure_kind() == Some(FailureKind::Cancelled)
    }

    pub fn is_not_found(&self) -> bool {
        self.failure_kind() == Some(FailureKind::NotFound)
    }

    /// Classify a failed result. Returns `None` for successful results.
    pub fn failure_kind(&self) -> Option<FailureKind> {
        if self.success {
            return None;
        }
        if self.exit_code != NO_EXIT_CODE {
            return Some(FailureKind::NonZeroExit(self.exit_code));
        }
        let kind = if self.error == CANCELLED_ERROR {
            FailureKind::Cancelled
        } else if self.error.starts_with(TIMEOUT_PREFIX) {
            FailureKind::Timeout
        } else if self.error.starts_with(NOT_FOUND_PREFIX) {
            FailureKind::NotFound
        } else if self.error.starts_with(SPAWN_FAILED_PREFIX) {
            FailureKind::SpawnFailed
        } else {
            FailureKind::Terminated
        };
        Some(kind)
    }
}

mod elapsed_seconds {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completed_zero_exit_is_success() {
        let r = CommandResult::completed(0, "hi\n".into(), "", Duration::from_millis(5));
        assert!(r.success());
        assert_eq!(r.error(), "");
        assert_eq!(r.exit_code(), 0);
        assert!(r.failure_kind().is_none());
        assert!(!r.is_timeout());
    }

    #[test]
    fn test_completed_zero_exit_ignores_stderr_noise() {
        let r = CommandResult::completed(0, String::new(), "warning: deprecated", Duration::ZERO);
        assert!(r.success());
        assert_eq!(r.error(), "");
    }

    #[test]
    fn test_completed_nonzero_uses_stderr() {
        let r = CommandResult::completed(3, String::new(), "  boom\n", Duration::ZERO);
        assert!(!r.success());
        assert_eq!(r.error(), "boom");
        assert_eq!(r.failure_kind(), Some(FailureKind::NonZeroExit(3)));
    }

    #[test]
    fn test_completed_nonzero_without_stderr_names_code() {
        let r = CommandResult::completed(1, String::new(), "", Duration::ZERO);
        assert!(r.error().contains("code 1"));
        assert!(!r.is_timeout());
    }

    #[test]
    fn test_timeout_result_is_timeout() {
        let r = CommandResult::timeout(Duration::from_secs(2));
        assert!(r.is_timeout());
        assert!(!r.success());
        assert_eq!(r.exit_code(), -1);
        assert_eq!(r.elapsed(), Duration::from_secs(2));
        assert!(r.error().contains("timed out"));
        assert_eq!(r.failure_kind(), Some(FailureKind::Timeout));
    }

    #[test]
    fn test_cancelled_keeps_partial_output() {
        let r = CommandResult::cancelled("half a line".into(), Duration::from_millis(10));
        assert_eq!(r.error(), "command cancelled");
        assert_eq!(r.output(), "half a line");
        assert!(r.is_cancelled());
        assert!(!r.is_not_found());
    }

    #[test]
    fn test_not_found_is_distinguishable() {
        let r = CommandResult::not_found("no-such-tool");
        assert!(r.is_not_found());
        assert!(r.error().contains("no-such-tool"));
        assert_eq!(r.exit_code(), -1);
    }

    #[test]
    fn test_terminated_with_empty_reason_still_has_error() {
        let r = CommandResult::terminated("", String::new(), Duration::ZERO);
        assert!(!r.error().is_empty());
        assert_eq!(r.failure_kind(), Some(FailureKind::Terminated));
    }

    #[test]
    fn test_spawn_failure_is_its_own_kind() {
        let r = CommandResult::spawn_failed("working directory does not exist: /nope", Duration::ZERO);
        assert_eq!(r.failure_kind(), Some(FailureKind::SpawnFailed));
        assert!(r.error().contains("/nope"));
        assert_eq!(r.exit_code(), -1);
    }

    #[test]
    fn test_success_invariant_holds_for_every_constructor() {
        let results = [
            CommandResult::completed(0, "a".into(), "", Duration::ZERO),
            CommandResult::completed(2, "a".into(), "e", Duration::ZERO),
            CommandResult::timeout(Duration::from_secs(1)),
            CommandResult::cancelled(String::new(), Duration::ZERO),
            CommandResult::not_found("x"),
            CommandResult::terminated("signal 9", String::new(), Duration::ZERO),
            CommandResult::spawn_failed("permission denied", Duration::ZERO),
        ];
        for r in &results {
            assert_eq!(r.success(), r.exit_code() == 0 && r.error().is_empty());
        }
    }

    #[test]
    fn test_wire_form_uses_elapsed_seconds() {
        let r = CommandResult::completed(0, "out".into(), "", Duration::from_millis(1500));
        let json: serde_json::Value = serde_json::to_value(&r).unwrap();
        assert_eq!(json["elapsed_seconds"], serde_json::json!(1.5));
        assert_eq!(json["exit_code"], serde_json::json!(0));
        assert_eq!(json["success"], serde_json::json!(true));
        assert!(json.get("elapsed").is_none());
    }

    #[test]
    fn test_json_roundtrip_recovers_fields() {
        let r = CommandResult::completed(7, "stdout text".into(), "bad input", Duration::from_micros(2_345_678));
        let json = serde_json::to_string(&r).unwrap();
        let back: CommandResult = serde_json::from_str(&json).unwrap();
        assert_eq!(back.success(), r.success());
        assert_eq!(back.output(), r.output());
        assert_eq!(back.error(), r.error());
        assert_eq!(back.exit_code(), r.exit_code());
        let drift = (back.elapsed().as_secs_f64() - r.elapsed().as_secs_f64()).abs();
        assert!(drift < 1e-6, "elapsed drifted by {}", drift);
    }

    #[test]
    fn test_negative_elapsed_is_rejected() {
        let json = r#"{"success":false,"output":"","error":"x","exit_code":1,"elapsed_seconds":-1.0}"#;
        assert!(serde_json::from_str::<CommandResult>(json).is_err());
    }
}
