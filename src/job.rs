use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;

use crate::backend::Backend;
use crate::config::{JobConfig, Origin, OverlapPolicy};
use crate::error::JobError;
use crate::execution::Execution;
use crate::middleware::Chain;
use crate::schedule::JobSchedule;

/// A registered job: parsed schedule, backend driver, middleware chain and
/// bounded execution history.
///
/// Jobs are immutable once constructed; the registry swaps whole `Arc<Job>`
/// values on change. The running counter and the history ring are shared
/// `Arc`s so a middleware-only replacement keeps counting in-flight runs of
/// the previous snapshot.
pub struct Job {
    name: String,
    origin: Origin,
    config: JobConfig,
    schedule: JobSchedule,
    backend: Arc<dyn Backend>,
    chain: Chain,
    running: Arc<AtomicU32>,
    history: Arc<Mutex<VecDeque<Arc<Execution>>>>,
}

impl Job {
    pub fn new(
        config: JobConfig,
        origin: Origin,
        backend: Arc<dyn Backend>,
        chain: Chain,
    ) -> Result<Arc<Job>, JobError> {
        let schedule = JobSchedule::parse(&config.schedule)?;
        Ok(Arc::new(Job {
            name: config.name.clone(),
            origin,
            config,
            schedule,
            backend,
            chain,
            running: Arc::new(AtomicU32::new(0)),
            history: Arc::new(Mutex::new(VecDeque::new())),
        }))
    }

    /// Build a replacement job that inherits the predecessor's history ring
    /// and running counter. Used for atomic swaps when only middleware
    /// wiring changed.
    pub fn adopting(
        config: JobConfig,
        origin: Origin,
        backend: Arc<dyn Backend>,
        chain: Chain,
        old: &Job,
    ) -> Result<Arc<Job>, JobError> {
        let schedule = JobSchedule::parse(&config.schedule)?;
        Ok(Arc::new(Job {
            name: config.name.clone(),
            origin,
            config,
            schedule,
            backend,
            chain,
            running: old.running.clone(),
            history: old.history.clone(),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn origin(&self) -> Origin {
        self.origin
    }

    pub fn config(&self) -> &JobConfig {
        &self.config
    }

    pub fn schedule(&self) -> &JobSchedule {
        &self.schedule
    }

    pub fn command(&self) -> &str {
        &self.config.command
    }

    pub fn overlap(&self) -> OverlapPolicy {
        self.config.overlap
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn chain(&self) -> &Chain {
        &self.chain
    }

    /// Number of executions of this job currently in the running state.
    pub fn running(&self) -> u32 {
        self.running.load(Ordering::SeqCst)
    }

    pub fn notify_start(&self) {
        self.running.fetch_add(1, Ordering::SeqCst);
    }

    pub fn notify_stop(&self) {
        self.running.fetch_sub(1, Ordering::SeqCst);
    }

    /// Insert an execution into the history ring, keeping the ring ordered
    /// by fire instant and trimmed to the configured limit (most recent
    /// entries win).
    pub fn set_last_run(&self, exec: Arc<Execution>) {
        let mut history = self.history.lock();
        let pos = history
            .iter()
            .rposition(|e| e.date <= exec.date)
            .map(|i| i + 1)
            .unwrap_or(0);
        history.insert(pos, exec);
        while history.len() > self.config.history_limit.max(1) {
            history.pop_front();
        }
    }

    /// Chronologically ordered copy of the history ring.
    pub fn history(&self) -> Vec<Arc<Execution>> {
        self.history.lock().iter().cloned().collect()
    }

    pub fn last_run(&self) -> Option<Arc<Execution>> {
        self.history.lock().back().cloned()
    }
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("name", &self.name)
            .field("origin", &self.origin)
            .field("schedule", &self.schedule.to_string())
            .field("running", &self.running())
            .finish()
    }
}
