use std::time::Duration;

use thiserror::Error;

/// Sentinel exit code for a Swarm service that failed without reporting a
/// container exit code.
pub const SERVICE_FAILED_EXIT: i64 = -999;

/// Sentinel exit code for a Swarm service that disappeared while we were
/// polling it.
pub const SERVICE_REMOVED_EXIT: i64 = -998;

/// Everything that can go wrong around a single job, from registration to a
/// finished run.
///
/// Variants fall into the classes the scheduler cares about: configuration
/// errors fail registration synchronously, skip variants mark an execution
/// terminal-skipped, and the rest mark it failed.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("invalid job configuration: {0}")]
    ConfigInvalid(String),

    #[error("skipped: previous execution still running")]
    SkippedOverlap,

    #[error("skipped: concurrency gate saturated")]
    GateSaturated,

    #[error("execution exceeded max runtime of {}", humantime::format_duration(*.0))]
    Timeout(Duration),

    #[error("execution canceled by shutdown")]
    Canceled,

    #[error("command exited with code {0}")]
    NonZeroExit(i64),

    #[error("docker api error: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("scheduler is {0}, refusing to start")]
    Fatal(String),

    #[error("{0}")]
    Runtime(String),
}

impl JobError {
    /// Whether this error marks an execution skipped rather than failed.
    pub fn is_skip(&self) -> bool {
        matches!(self, JobError::SkippedOverlap | JobError::GateSaturated)
    }

    /// Whether this error means the job definition itself is unusable.
    pub fn is_config(&self) -> bool {
        matches!(self, JobError::ConfigInvalid(_))
    }
}
