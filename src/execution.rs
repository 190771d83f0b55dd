use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::JobError;

/// Upper bound on buffered output per stream. Anything beyond it evicts the
/// oldest bytes, so a chatty job cannot grow the daemon without bound.
pub const MAX_STREAM_BYTES: usize = 10 * 1024 * 1024;

/// One run instance of a job.
///
/// The identifier, job name and fire instant are fixed at allocation; the
/// rest of the state transitions pending -> running -> terminal exactly once.
/// A second stop is ignored, which lets the middleware chain treat `stop` as
/// idempotent.
#[derive(Debug)]
pub struct Execution {
    pub id: Uuid,
    pub job_name: String,
    /// Scheduled fire instant, not the moment the task actually started.
    pub date: DateTime<Utc>,
    pub stdout: StreamBuffer,
    pub stderr: StreamBuffer,
    state: Mutex<State>,
}

#[derive(Debug, Default)]
struct State {
    is_running: bool,
    stopped: bool,
    failed: bool,
    skipped: bool,
    error: Option<String>,
    started_at: Option<DateTime<Utc>>,
    duration: Duration,
}

impl Execution {
    pub fn new(job_name: impl Into<String>, date: DateTime<Utc>) -> Arc<Execution> {
        Arc::new(Execution {
            id: Uuid::new_v4(),
            job_name: job_name.into(),
            date,
            stdout: StreamBuffer::new(MAX_STREAM_BYTES),
            stderr: StreamBuffer::new(MAX_STREAM_BYTES),
            state: Mutex::new(State::default()),
        })
    }

    /// Rebuild a terminal execution from a persisted summary. Restored runs
    /// are never resurrected as running.
    pub fn from_summary(summary: &ExecutionSummary) -> Arc<Execution> {
        Arc::new(Execution {
            id: summary.id,
            job_name: summary.job_name.clone(),
            date: summary.date,
            stdout: StreamBuffer::new(MAX_STREAM_BYTES),
            stderr: StreamBuffer::new(MAX_STREAM_BYTES),
            state: Mutex::new(State {
                is_running: false,
                stopped: true,
                failed: summary.failed,
                skipped: summary.skipped,
                error: summary.error.clone(),
                started_at: Some(summary.date),
                duration: Duration::from_millis(summary.duration_ms),
            }),
        })
    }

    pub fn start(&self, now: DateTime<Utc>) {
        let mut state = self.state.lock();
        if state.stopped || state.is_running {
            return;
        }
        state.is_running = true;
        state.started_at = Some(now);
    }

    /// Transition to a terminal state. `error` of `None` means success, a
    /// skip-class error marks the run skipped, anything else marks it failed.
    /// Returns false when the execution was already terminal.
    pub fn stop(&self, now: DateTime<Utc>, error: Option<&JobError>) -> bool {
        let mut state = self.state.lock();
        if state.stopped {
            return false;
        }
        state.stopped = true;
        state.is_running = false;
        if let Some(started) = state.started_at {
            state.duration = (now - started).to_std().unwrap_or_default();
        }
        match error {
            None => {}
            Some(e) if e.is_skip() => {
                state.skipped = true;
                state.error = Some(e.to_string());
            }
            Some(e) => {
                state.failed = true;
                state.error = Some(e.to_string());
            }
        }
        true
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().is_running
    }

    pub fn is_terminal(&self) -> bool {
        self.state.lock().stopped
    }

    pub fn failed(&self) -> bool {
        self.state.lock().failed
    }

    pub fn skipped(&self) -> bool {
        self.state.lock().skipped
    }

    pub fn error(&self) -> Option<String> {
        self.state.lock().error.clone()
    }

    pub fn duration(&self) -> Duration {
        self.state.lock().duration
    }

    /// Point-in-time view used by reports, notifiers and the read model.
    pub fn summary(&self) -> ExecutionSummary {
        let state = self.state.lock();
        ExecutionSummary {
            id: self.id,
            job_name: self.job_name.clone(),
            date: self.date,
            duration_ms: state.duration.as_millis() as u64,
            is_running: state.is_running,
            failed: state.failed,
            skipped: state.skipped,
            error: state.error.clone(),
        }
    }
}

/// Serializable snapshot of an execution's outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionSummary {
    pub id: Uuid,
    pub job_name: String,
    pub date: DateTime<Utc>,
    pub duration_ms: u64,
    pub is_running: bool,
    pub failed: bool,
    pub skipped: bool,
    pub error: Option<String>,
}

/// Byte buffer with a hard cap; the oldest bytes are evicted first.
#[derive(Debug)]
pub struct StreamBuffer {
    cap: usize,
    buf: Mutex<Vec<u8>>,
}

impl StreamBuffer {
    pub fn new(cap: usize) -> StreamBuffer {
        StreamBuffer {
            cap,
            buf: Mutex::new(Vec::new()),
        }
    }

    pub fn write(&self, data: &[u8]) {
        let mut buf = self.buf.lock();
        if data.len() >= self.cap {
            buf.clear();
            buf.extend_from_slice(&data[data.len() - self.cap..]);
            return;
        }
        buf.extend_from_slice(data);
        if buf.len() > self.cap {
            let excess = buf.len() - self.cap;
            buf.drain(..excess);
        }
    }

    pub fn contents(&self) -> Vec<u8> {
        self.buf.lock().clone()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.buf.lock().len()
    }
}
