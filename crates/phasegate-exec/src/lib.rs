//! Process execution substrate for phasegate.
//!
//! - [`CommandResult`]: immutable outcome of one execution
//! - [`ProcessRunner`]: spawn with timeout and cancellation, capture, live sink, streaming
//! - [`RetryRunner`]: retry eligibility per attempt and cancellable backoff
//!
//! Cancellation is a [`tokio_util::sync::CancellationToken`] passed down from
//! the top-level invocation; it reaches through retries into the running child.

pub mod process;
pub mod result;
pub mod retry;
pub mod sink;
pub mod spec;
pub mod stream;

pub use process::{CommandRunner, DEFAULT_TIMEOUT, ProcessRunner};
pub use result::{CANCELLED_ERROR, CommandResult, FailureKind};
pub use retry::{
    Backoff, RetryPolicy, RetryPolicyError, RetryPredicate, RetryRunner, TRANSIENT_EXIT_CODES,
};
pub use sink::{BufferSink, OutputSink, StderrSink, StreamKind};
pub use spec::CommandSpec;
pub use stream::{OutputLine, ProcessStream};

pub use tokio_util::sync::CancellationToken;
