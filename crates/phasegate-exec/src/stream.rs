//! Streaming execution: output lines arrive while the process runs, and the
//! final [`CommandResult`] is delivered once through a single-slot channel.
//!
//! Two reader tasks (stdout, stderr) feed one bounded line channel; the
//! process wait runs alongside them. The line channel closes when both readers
//! finish, which happens on exit, timeout, and cancellation alike. Consumers
//! should drain lines concurrently with waiting for the result: a reader
//! blocked on a full channel is stopped after a short grace period once the
//! process is gone, so an undrained channel loses lines rather than deadlocking.

use crate::process::ProcessRunner;
use crate::result::CommandResult;
use crate::sink::StreamKind;
use crate::spec::CommandSpec;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

pub const STREAM_CHANNEL_CAPACITY: usize = 256;

/// One line of child output, without its trailing newline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub stream: StreamKind,
    pub text: String,
}

impl OutputLine {
    pub(crate) fn from_bytes(stream: StreamKind, bytes: &[u8]) -> Self {
        let text = String::from_utf8_lossy(bytes);
        let text = text.strip_suffix('\n').unwrap_or(&text);
        let text = text.strip_suffix('\r').unwrap_or(text);
        Self {
            stream,
            text: text.to_string(),
        }
    }
}

/// Handle to a running streamed process.
#[derive(Debug)]
pub struct ProcessStream {
    output: mpsc::Receiver<OutputLine>,
    result: oneshot::Receiver<CommandResult>,
}

impl ProcessStream {
    /// Next output line, or `None` once both readers have closed.
    pub async fn next_line(&mut self) -> Option<OutputLine> {
        self.output.recv().await
    }

    /// Stop receiving lines and wait for the result.
    ///
    /// Dropping the line receiver lets the readers keep capturing without
    /// forwarding, so this never blocks on an undrained channel.
    pub async fn finish(self) -> CommandResult {
        drop(self.output);
        receive_result(self.result).await
    }

    /// Drain every line, then wait for the result.
    pub async fn collect(mut self) -> (Vec<OutputLine>, CommandResult) {
        let mut lines = Vec::new();
        while let Some(line) = self.output.recv().await {
            lines.push(line);
        }
        let result = receive_result(self.result).await;
        (lines, result)
    }

    pub fn into_parts(self) -> (mpsc::Receiver<OutputLine>, oneshot::Receiver<CommandResult>) {
        (self.output, self.result)
    }
}

async fn receive_result(rx: oneshot::Receiver<CommandResult>) -> CommandResult {
    rx.await.unwrap_or_else(|_| {
        CommandResult::terminated(
            "process stream ended without a result",
            String::new(),
            Duration::ZERO,
        )
    })
}

impl ProcessRunner {
    /// Start `spec` and return its line and result channels immediately.
    ///
    /// Must be called from within a tokio runtime.
    pub fn stream(&self, cancel: &CancellationToken, spec: CommandSpec) -> ProcessStream {
        let (line_tx, line_rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let (result_tx, result_rx) = oneshot::channel();
        let runner = self.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let result = runner.execute(&cancel, &spec, Some(line_tx)).await;
            // The receiver may be gone; the result is still produced exactly once.
            let _ = result_tx.send(result);
        });
        ProcessStream {
            output: line_rx,
            result: result_rx,
        }
    }
}
