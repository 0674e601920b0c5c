//! Live output sinks.
//!
//! A sink receives every chunk the runner captures, in the same order and with
//! the same bytes, while the process is still running. Sinks see raw bytes;
//! the text in `CommandResult` is the whole capture decoded once as UTF-8,
//! with invalid sequences replaced by U+FFFD. For valid UTF-8 output the two
//! are byte-for-byte identical.

use std::io::Write;
use std::sync::{Arc, Mutex, PoisonError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

pub trait OutputSink: Send + Sync {
    fn write(&self, stream: StreamKind, bytes: &[u8]);
}

/// Mirrors child output onto this process's stderr.
#[derive(Debug, Default, Clone, Copy)]
pub struct StderrSink;

impl OutputSink for StderrSink {
    fn write(&self, _stream: StreamKind, bytes: &[u8]) {
        let mut err = std::io::stderr().lock();
        // A broken terminal must not fail the run.
        let _ = err.write_all(bytes);
        let _ = err.flush();
    }
}

/// Collects output in memory. Clones share the same buffers.
#[derive(Debug, Default, Clone)]
pub struct BufferSink {
    stdout: Arc<Mutex<Vec<u8>>>,
    stderr: Arc<Mutex<Vec<u8>>>,
}

impl BufferSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stdout_bytes(&self) -> Vec<u8> {
        self.stdout
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn stderr_bytes(&self) -> Vec<u8> {
        self.stderr
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl OutputSink for BufferSink {
    fn write(&self, stream: StreamKind, bytes: &[u8]) {
        let target = match stream {
            StreamKind::Stdout => &self.stdout,
            StreamKind::Stderr => &self.stderr,
        };
        target
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(bytes);
    }
}
