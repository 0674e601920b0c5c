//! Retry policies, backoff with jitter, and the retrying runner.
//!
//! The runner never decides on its own which failures are transient. The
//! orchestration layer picks a [`RetryPredicate`]; missing executables and
//! caller cancellation are never retried whatever the predicate says.

use crate::process::{CommandRunner, ProcessRunner};
use crate::result::{CommandResult, FailureKind};
use crate::spec::CommandSpec;
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Exit codes conventionally produced by timeouts, missing/unrunnable
/// commands and signal kills (124 timeout(1), 125-127 shell, 137 SIGKILL, 143 SIGTERM).
pub const TRANSIENT_EXIT_CODES: [i32; 6] = [124, 125, 126, 127, 137, 143];

type CustomPredicate = Arc<dyn Fn(&CommandResult) -> bool + Send + Sync>;

/// Decides whether a failed attempt is worth another try.
#[derive(Clone)]
pub enum RetryPredicate {
    /// Retry any failure.
    AnyFailure,
    /// Retry only deadline expiry.
    TimeoutOnly,
    /// Retry timeouts, signal kills and the listed exit codes. Launch
    /// failures are deterministic and never retried.
    TransientExitCodes(BTreeSet<i32>),
    Custom(CustomPredicate),
}

impl RetryPredicate {
    /// The transient policy with [`TRANSIENT_EXIT_CODES`].
    pub fn transient() -> Self {
        Self::TransientExitCodes(TRANSIENT_EXIT_CODES.into_iter().collect())
    }

    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(&CommandResult) -> bool + Send + Sync + 'static,
    {
        Self::Custom(Arc::new(f))
    }

    pub fn should_retry(&self, result: &CommandResult) -> bool {
        if result.success() {
            return false;
        }
        match self {
            Self::AnyFailure => true,
            Self::TimeoutOnly => result.failure_kind() == Some(FailureKind::Timeout),
            Self::TransientExitCodes(codes) => match result.failure_kind() {
                Some(FailureKind::Timeout | FailureKind::Terminated) => true,
                Some(FailureKind::NonZeroExit(code)) => codes.contains(&code),
                _ => false,
            },
            Self::Custom(f) => f(result),
        }
    }
}

impl std::fmt::Debug for RetryPredicate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AnyFailure => write!(f, "AnyFailure"),
            Self::TimeoutOnly => write!(f, "TimeoutOnly"),
            Self::TransientExitCodes(codes) => f.debug_tuple("TransientExitCodes").field(codes).finish(),
            Self::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum RetryPolicyError {
    #[error("multiplier must be a finite number greater than 1, got {0}")]
    InvalidMultiplier(f64),

    #[error("jitter fraction must be in [0, 1), got {0}")]
    InvalidJitter(f64),

    #[error("max delay {max:?} is shorter than initial delay {initial:?}")]
    MaxBelowInitial { initial: Duration, max: Duration },
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt; 0 means run exactly once.
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Uniform perturbation of each delay, as a fraction of the delay.
    pub jitter_fraction: f64,
    pub predicate: RetryPredicate,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter_fraction: 0.1,
            predicate: RetryPredicate::AnyFailure,
        }
    }
}

impl RetryPolicy {
    /// A policy that runs once and never retries.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn with_predicate(mut self, predicate: RetryPredicate) -> Self {
        self.predicate = predicate;
        self
    }

    pub fn validate(&self) -> Result<(), RetryPolicyError> {
        if !self.multiplier.is_finite() || self.multiplier <= 1.0 {
            return Err(RetryPolicyError::InvalidMultiplier(self.multiplier));
        }
        if !(0.0..1.0).contains(&self.jitter_fraction) {
            return Err(RetryPolicyError::InvalidJitter(self.jitter_fraction));
        }
        if self.max_delay < self.initial_delay {
            return Err(RetryPolicyError::MaxBelowInitial {
                initial: self.initial_delay,
                max: self.max_delay,
            });
        }
        Ok(())
    }

    /// Unjittered delay before retry `attempt` (0-based):
    /// `min(initial * multiplier^attempt, max_delay)`.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return self.initial_delay.min(self.max_delay);
        }
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let raw = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        if !raw.is_finite() || raw >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(raw)
        }
    }
}

/// Computes jittered delays from a policy and an injected random source.
#[derive(Debug)]
pub struct Backoff {
    policy: RetryPolicy,
    rng: Mutex<StdRng>,
}

impl Backoff {
    pub fn new(policy: RetryPolicy) -> Self {
        Self::with_rng(policy, StdRng::from_os_rng())
    }

    /// Deterministic delays for tests and reproducible runs.
    pub fn seeded(policy: RetryPolicy, seed: u64) -> Self {
        Self::with_rng(policy, StdRng::seed_from_u64(seed))
    }

    pub fn with_rng(policy: RetryPolicy, rng: StdRng) -> Self {
        Self {
            policy,
            rng: Mutex::new(rng),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Delay before retry `attempt`, perturbed uniformly by ±jitter_fraction.
    pub fn delay(&self, attempt: u32) -> Duration {
        let raw = self.policy.base_delay(attempt);
        let jitter = self.policy.jitter_fraction;
        if jitter <= 0.0 || raw.is_zero() {
            return raw;
        }
        let offset: f64 = self
            .rng
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .random_range(-jitter..=jitter);
        // Saturates instead of panicking when a huge max_delay is jittered upwards.
        Duration::try_from_secs_f64(raw.as_secs_f64() * (1.0 + offset)).unwrap_or(Duration::MAX)
    }
}

/// Re-runs a command until it succeeds, fails non-retryably, or runs out of
/// retries. The returned result is always the last attempt's.
#[derive(Debug)]
pub struct RetryRunner<R = ProcessRunner> {
    inner: R,
    backoff: Backoff,
}

impl<R: CommandRunner> RetryRunner<R> {
    pub fn new(inner: R, policy: RetryPolicy) -> Self {
        Self::with_backoff(inner, Backoff::new(policy))
    }

    pub fn with_backoff(inner: R, backoff: Backoff) -> Self {
        Self { inner, backoff }
    }

    pub fn inner(&self) -> &R {
        &self.inner
    }

    pub fn policy(&self) -> &RetryPolicy {
        self.backoff.policy()
    }

    /// Run `spec`, retrying per the policy.
    ///
    /// A token cancelled before the first attempt yields a cancelled result
    /// without running anything. Cancellation during a backoff wait returns a
    /// cancelled result carrying the last attempt's output and elapsed time.
    pub async fn run(&self, cancel: &CancellationToken, spec: &CommandSpec) -> CommandResult {
        if cancel.is_cancelled() {
            return CommandResult::cancelled(String::new(), Duration::ZERO);
        }

        let policy = self.backoff.policy();
        let mut attempt: u32 = 0;
        loop {
            let result = self.inner.run(cancel, spec).await;
            if result.success() {
                if attempt > 0 {
                    debug!(command = %spec.display(), attempts = attempt + 1, "command succeeded after retry");
                }
                return result;
            }

            match result.failure_kind() {
                Some(FailureKind::Cancelled) | Some(FailureKind::NotFound) => return result,
                _ if cancel.is_cancelled() => return result,
                _ => {}
            }

            if attempt >= policy.max_retries || !policy.predicate.should_retry(&result) {
                return result;
            }

            let delay = self.backoff.delay(attempt);
            warn!(
                command = %spec.display(),
                attempt = attempt + 1,
                max_retries = policy.max_retries,
                exit_code = result.exit_code(),
                error = result.error(),
                delay_ms = delay.as_millis() as u64,
                "command failed, retrying after backoff"
            );

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => {
                    debug!(command = %spec.display(), "cancelled during backoff");
                    return CommandResult::cancelled(result.output().to_string(), result.elapsed());
                }
            }
            attempt += 1;
        }
    }
}

#[async_trait]
impl<R: CommandRunner> CommandRunner for RetryRunner<R> {
    async fn run(&self, cancel: &CancellationToken, spec: &CommandSpec) -> CommandResult {
        RetryRunner::run(self, cancel, spec).await
    }
}
