//! Spawning external programs under a timeout and a cancellation token.

use crate::result::CommandResult;
use crate::sink::{OutputSink, StreamKind};
use crate::spec::CommandSpec;
use crate::stream::OutputLine;
use async_trait::async_trait;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

/// Timeout applied when neither the runner nor the call sets one.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// How long output readers may keep draining after a normal exit.
/// Grandchildren that inherit the pipes can otherwise hold them open forever.
const EXIT_DRAIN_GRACE: Duration = Duration::from_secs(5);
const KILL_DRAIN_GRACE: Duration = Duration::from_millis(250);

/// Anything that can execute a [`CommandSpec`] and report a [`CommandResult`].
///
/// Implementations never return `Err` for the subprocess's own failure.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, cancel: &CancellationToken, spec: &CommandSpec) -> CommandResult;
}

/// Runs programs with `tokio::process`, capturing stdout and stderr.
#[derive(Clone)]
pub struct ProcessRunner {
    default_timeout: Duration,
    sink: Option<Arc<dyn OutputSink>>,
}

impl std::fmt::Debug for ProcessRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessRunner")
            .field("default_timeout", &self.default_timeout)
            .field("live_sink", &self.sink.is_some())
            .finish()
    }
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT)
    }
}

enum Waited {
    Exited(std::io::Result<ExitStatus>),
    TimedOut,
    Cancelled,
}

impl ProcessRunner {
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            default_timeout,
            sink: None,
        }
    }

    /// Duplicate all captured output to `sink` while the process runs.
    pub fn with_sink(mut self, sink: Arc<dyn OutputSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Shorthand for running `program args...` with the default timeout.
    pub async fn run_program<I, S>(
        &self,
        cancel: &CancellationToken,
        program: &str,
        args: I,
    ) -> CommandResult
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let spec = CommandSpec::new(program).args(args);
        self.execute(cancel, &spec, None).await
    }

    #[instrument(skip_all, fields(command = %spec.display()))]
    pub(crate) async fn execute(
        &self,
        cancel: &CancellationToken,
        spec: &CommandSpec,
        forward: Option<mpsc::Sender<OutputLine>>,
    ) -> CommandResult {
        let timeout = spec.get_timeout().unwrap_or(self.default_timeout);

        if cancel.is_cancelled() {
            debug!("cancelled before spawn");
            return CommandResult::cancelled(String::new(), Duration::ZERO);
        }

        if let Some(dir) = spec.get_current_dir()
            && !dir.is_dir()
        {
            return CommandResult::spawn_failed(
                &format!("working directory does not exist: {}", dir.display()),
                Duration::ZERO,
            );
        }

        let start = Instant::now();
        let mut cmd = Command::new(spec.program());
        cmd.args(spec.get_args())
            .stdin(if spec.get_stdin().is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = spec.get_current_dir() {
            cmd.current_dir(dir);
        }
        for (key, value) in spec.get_env() {
            cmd.env(key, value);
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(program = spec.program(), "executable not found");
                return CommandResult::not_found(spec.program());
            }
            Err(e) => {
                warn!(err = %e, "failed to spawn command");
                return CommandResult::spawn_failed(
                    &format!("{}: {}", spec.program(), e),
                    start.elapsed(),
                );
            }
        };
        debug!(
            pid = child.id().unwrap_or(0),
            timeout_ms = timeout.as_millis() as u64,
            "process spawned"
        );

        if let (Some(input), Some(mut pipe)) = (spec.get_stdin(), child.stdin.take()) {
            let input = input.to_vec();
            tokio::spawn(async move {
                if let Err(e) = pipe.write_all(&input).await {
                    debug!(err = %e, "child closed stdin early");
                }
                let _ = pipe.shutdown().await;
            });
        }

        let readers = cancel.child_token();
        let stdout = Capture::default();
        let stderr = Capture::default();
        let mut handles = Vec::with_capacity(2);
        if let Some(pipe) = child.stdout.take() {
            handles.push(tokio::spawn(pump(
                pipe,
                StreamKind::Stdout,
                stdout.clone(),
                self.sink.clone(),
                forward.clone(),
                readers.clone(),
            )));
        }
        if let Some(pipe) = child.stderr.take() {
            handles.push(tokio::spawn(pump(
                pipe,
                StreamKind::Stderr,
                stderr.clone(),
                self.sink.clone(),
                forward.clone(),
                readers.clone(),
            )));
        }
        // Only the readers hold senders now, so the channel closes when they finish.
        drop(forward);

        let waited = tokio::select! {
            status = child.wait() => Waited::Exited(status),
            _ = tokio::time::sleep(timeout) => Waited::TimedOut,
            _ = cancel.cancelled() => Waited::Cancelled,
        };

        match waited {
            Waited::Exited(status) => {
                drain(handles, &readers, EXIT_DRAIN_GRACE).await;
                let elapsed = start.elapsed();
                let out = stdout.text();
                match status {
                    Ok(status) => from_status(status, out, &stderr.text(), elapsed),
                    Err(e) => CommandResult::terminated(
                        format!("failed to wait for process: {}", e),
                        out,
                        elapsed,
                    ),
                }
            }
            Waited::TimedOut => {
                warn!(timeout_ms = timeout.as_millis() as u64, "command timed out, killing");
                kill(&mut child).await;
                drain(handles, &readers, KILL_DRAIN_GRACE).await;
                CommandResult::timed_out(timeout, stdout.text())
            }
            Waited::Cancelled => {
                debug!("command cancelled, killing");
                kill(&mut child).await;
                drain(handles, &readers, KILL_DRAIN_GRACE).await;
                CommandResult::cancelled(stdout.text(), start.elapsed())
            }
        }
    }
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, cancel: &CancellationToken, spec: &CommandSpec) -> CommandResult {
        self.execute(cancel, spec, None).await
    }
}

#[derive(Clone, Default)]
struct Capture(Arc<Mutex<Vec<u8>>>);

impl Capture {
    fn append(&self, bytes: &[u8]) {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(bytes);
    }

    /// Decoded after the process ends so multi-byte characters split across
    /// reads survive.
    fn text(&self) -> String {
        let bytes = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

fn keep(capture: &Capture, sink: Option<&dyn OutputSink>, kind: StreamKind, bytes: &[u8]) {
    if bytes.is_empty() {
        return;
    }
    capture.append(bytes);
    if let Some(sink) = sink {
        sink.write(kind, bytes);
    }
}

/// Copy one pipe into its capture buffer, the live sink, and the optional
/// line channel until EOF or until `stop` fires.
async fn pump<R>(
    pipe: R,
    kind: StreamKind,
    capture: Capture,
    sink: Option<Arc<dyn OutputSink>>,
    mut forward: Option<mpsc::Sender<OutputLine>>,
    stop: CancellationToken,
) where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(pipe);
    let mut line = Vec::new();
    loop {
        line.clear();
        let read = tokio::select! {
            read = reader.read_until(b'\n', &mut line) => Some(read),
            _ = stop.cancelled() => None,
        };
        let Some(read) = read else {
            // read_until leaves any partially read bytes in `line`.
            keep(&capture, sink.as_deref(), kind, &line);
            break;
        };
        match read {
            Ok(0) => break,
            Ok(_) => {
                keep(&capture, sink.as_deref(), kind, &line);
                let Some(tx) = forward.as_ref() else {
                    continue;
                };
                let sent = tokio::select! {
                    sent = tx.send(OutputLine::from_bytes(kind, &line)) => Some(sent.is_ok()),
                    _ = stop.cancelled() => None,
                };
                match sent {
                    Some(true) => {}
                    // Receiver dropped: keep capturing, stop forwarding.
                    Some(false) => forward = None,
                    None => break,
                }
            }
            Err(e) => {
                debug!(err = %e, ?kind, "output pipe read failed");
                keep(&capture, sink.as_deref(), kind, &line);
                break;
            }
        }
    }
}

async fn drain(mut handles: Vec<JoinHandle<()>>, readers: &CancellationToken, grace: Duration) {
    let deadline = tokio::time::Instant::now() + grace;
    while let Some(handle) = handles.last_mut() {
        if tokio::time::timeout_at(deadline, handle).await.is_err() {
            debug!("output readers still open after grace period, stopping them");
            readers.cancel();
            for handle in handles {
                let _ = handle.await;
            }
            return;
        }
        handles.pop();
    }
}

async fn kill(child: &mut Child) {
    if let Err(e) = child.kill().await {
        debug!(err = %e, "kill failed, process may have already exited");
    }
}

fn from_status(status: ExitStatus, stdout: String, stderr: &str, elapsed: Duration) -> CommandResult {
    match status.code() {
        Some(code) => {
            if code == 0 && !stderr.trim().is_empty() {
                debug!(stderr = stderr.trim(), "command succeeded with stderr output");
            }
            CommandResult::completed(code, stdout, stderr, elapsed)
        }
        None => CommandResult::terminated(describe_abnormal_exit(status), stdout, elapsed),
    }
}

#[cfg(unix)]
fn describe_abnormal_exit(status: ExitStatus) -> String {
    use std::os::unix::process::ExitStatusExt;
    match status.signal() {
        Some(signal) => format!("process terminated by signal {}", signal),
        None => "process terminated abnormally".to_string(),
    }
}

#[cfg(not(unix))]
fn describe_abnormal_exit(_status: ExitStatus) -> String {
    "process terminated abnormally".to_string()
}
