use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::JobError;

/// Global cap on simultaneous executions.
///
/// Acquisition is non-blocking: a fire that finds the gate saturated is
/// recorded as skipped, never deferred, so cron semantics are preserved.
#[derive(Debug, Clone)]
pub struct Gate {
    sem: Option<Arc<Semaphore>>,
    capacity: usize,
}

/// Permit held for the lifetime of one execution. Dropping it releases the
/// slot. Unbounded gates hand out empty permits.
#[derive(Debug)]
pub struct Permit {
    _inner: Option<OwnedSemaphorePermit>,
}

impl Gate {
    /// `max_concurrent` of 0 means unbounded.
    pub fn new(max_concurrent: usize) -> Gate {
        Gate {
            sem: (max_concurrent > 0).then(|| Arc::new(Semaphore::new(max_concurrent))),
            capacity: max_concurrent,
        }
    }

    pub fn try_acquire(&self) -> Result<Permit, JobError> {
        match &self.sem {
            None => Ok(Permit { _inner: None }),
            Some(sem) => sem
                .clone()
                .try_acquire_owned()
                .map(|permit| Permit {
                    _inner: Some(permit),
                })
                .map_err(|_| JobError::GateSaturated),
        }
    }

    /// Configured cap, `None` when unbounded.
    pub fn capacity(&self) -> Option<usize> {
        self.sem.as_ref().map(|_| self.capacity)
    }

    /// Permits currently free; unbounded gates report `usize::MAX`.
    pub fn available(&self) -> usize {
        self.sem.as_ref().map_or(usize::MAX, |s| s.available_permits())
    }
}
