use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use bollard::Docker;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::{Notify, broadcast};
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};

use crate::backend;
use crate::config::{GlobalConfig, JobConfig, Origin};
use crate::dedup::NotificationDedup;
use crate::error::JobError;
use crate::execution::Execution;
use crate::gate::Gate;
use crate::job::Job;
use crate::middleware::{self, Context};
use crate::registry::Registry;
use crate::report;
use crate::schedule::{Clock, JobSchedule};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// Run counters exposed to the read model.
#[derive(Debug, Clone, Copy)]
pub struct MetricsSnapshot {
    pub total: u64,
    pub failed: u64,
    pub skipped: u64,
    pub in_flight: usize,
}

/// Drives per-job dispatch: owns the registry, the concurrency gate and one
/// dispatcher task per scheduled job.
///
/// Cheap to clone; all clones share the same state.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

struct Inner {
    registry: Registry,
    gate: Gate,
    clock: Arc<dyn Clock>,
    docker: Option<Docker>,
    global: GlobalConfig,
    dedup: Arc<NotificationDedup>,
    state: Mutex<SchedulerState>,
    dispatchers: Mutex<HashMap<String, AbortHandle>>,
    shutdown: broadcast::Sender<()>,
    inflight: Inflight,
    metrics: Metrics,
    /// Serializes whole reconcile passes; individual registry ops take the
    /// registry write lock only for their own critical section.
    reconcile_lock: tokio::sync::Mutex<()>,
}

#[derive(Default)]
struct Metrics {
    total: AtomicU64,
    failed: AtomicU64,
    skipped: AtomicU64,
}

#[derive(Default)]
struct Inflight {
    count: AtomicUsize,
    idle: Notify,
}

impl Inflight {
    fn enter(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }

    fn exit(&self) {
        if self.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }

    async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            // Register interest before re-checking the counter, otherwise a
            // notify between the load and the await is lost.
            notified.as_mut().enable();
            if self.count.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

impl Scheduler {
    pub fn new(global: GlobalConfig, docker: Option<Docker>, clock: Arc<dyn Clock>) -> Scheduler {
        let (shutdown, _) = broadcast::channel(1);
        Scheduler {
            inner: Arc::new(Inner {
                registry: Registry::new(global.removed_ring_size),
                gate: Gate::new(global.max_concurrent),
                dedup: NotificationDedup::new(global.dedup_cooldown, clock.clone()),
                clock,
                docker,
                global,
                state: Mutex::new(SchedulerState::Stopped),
                dispatchers: Mutex::new(HashMap::new()),
                shutdown,
                inflight: Inflight::default(),
                metrics: Metrics::default(),
                reconcile_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Begin firing. Idempotent while running; starting during an
    /// in-progress stop is refused.
    pub fn start(&self) -> Result<(), JobError> {
        {
            let mut state = self.inner.state.lock();
            match *state {
                SchedulerState::Running | SchedulerState::Starting => {
                    warn!("scheduler already running");
                    return Ok(());
                }
                SchedulerState::Stopping => {
                    error!("scheduler start refused mid-stop");
                    return Err(JobError::Fatal("stopping".into()));
                }
                SchedulerState::Stopped => *state = SchedulerState::Starting,
            }
        }

        let jobs = self.inner.registry.list(None);
        for job in &jobs {
            self.spawn_dispatcher(job);
        }
        self.spawn_dedup_sweeper();
        *self.inner.state.lock() = SchedulerState::Running;
        info!(jobs = jobs.len(), "scheduler started");
        Ok(())
    }

    /// Stop firing, cancel in-flight executions and wait for each of them
    /// to reach a terminal state. When the shutdown timeout expires first,
    /// the remaining runs are left to finish in the background and stop
    /// returns anyway.
    pub async fn stop(&self) {
        {
            let mut state = self.inner.state.lock();
            if matches!(*state, SchedulerState::Stopped | SchedulerState::Stopping) {
                return;
            }
            *state = SchedulerState::Stopping;
        }
        info!("scheduler stopping");

        let handles: Vec<AbortHandle> =
            self.inner.dispatchers.lock().drain().map(|(_, h)| h).collect();
        for handle in handles {
            handle.abort();
        }
        self.inner.shutdown.send(()).ok();

        let timeout = self.inner.global.shutdown_timeout;
        if timeout.is_zero() {
            self.inner.inflight.wait_idle().await;
        } else if tokio::time::timeout(timeout, self.inner.inflight.wait_idle())
            .await
            .is_err()
        {
            warn!(
                remaining = self.inner.inflight.count.load(Ordering::SeqCst),
                "shutdown timeout reached, leaving in-flight executions to finish in background"
            );
        }

        *self.inner.state.lock() = SchedulerState::Stopped;
        info!("scheduler stopped");
    }

    pub fn state(&self) -> SchedulerState {
        *self.inner.state.lock()
    }

    pub fn is_running(&self) -> bool {
        matches!(
            self.state(),
            SchedulerState::Running | SchedulerState::Starting
        )
    }

    pub fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.inner.shutdown.subscribe()
    }

    /// Register a job. Validation and backend construction happen here, so
    /// an ill-formed definition is reported synchronously and never
    /// scheduled.
    pub fn add_job(&self, config: JobConfig, origin: Origin) -> Result<(), JobError> {
        let backend = backend::build(&config, self.inner.docker.as_ref())?;
        let chain = middleware::build_chain(&config, &self.inner.global);
        let enabled = config.enabled;
        let job = Job::new(config, origin, backend, chain)?;
        if enabled {
            self.inner.registry.add(job.clone())?;
            if self.is_running() {
                self.spawn_dispatcher(&job);
            }
        } else {
            self.inner.registry.add_disabled(job)?;
        }
        Ok(())
    }

    /// Unschedule and retain on the removed ring. A currently-running
    /// execution is not aborted; its result is still recorded against the
    /// removed entry's history.
    pub fn remove_job(&self, name: &str) -> Option<Arc<Job>> {
        self.remove_dispatcher(name);
        self.inner.registry.remove(name)
    }

    pub fn disable_job(&self, name: &str) -> Result<(), JobError> {
        self.remove_dispatcher(name);
        self.inner.registry.disable(name)?;
        Ok(())
    }

    pub fn enable_job(&self, name: &str) -> Result<(), JobError> {
        let job = self.inner.registry.enable(name)?;
        if self.is_running() {
            self.spawn_dispatcher(&job);
        }
        Ok(())
    }

    /// Diff a desired job set against the registry and apply adds, removes
    /// and changes, touching only entries of the given origin. Passes are
    /// serialized; a failed entry is logged and skipped without affecting
    /// the rest.
    pub async fn reconcile(&self, desired: HashMap<String, JobConfig>, origin: Origin) {
        let _guard = self.inner.reconcile_lock.lock().await;

        for name in self.inner.registry.names_with_origin(origin) {
            if !desired.contains_key(&name) {
                info!(job = %name, origin = %origin, "job removed");
                self.remove_job(&name);
            }
        }

        for (name, config) in desired {
            match self.inner.registry.get(&name) {
                None => match self.add_job(config, origin) {
                    Ok(()) => info!(job = %name, origin = %origin, "job added"),
                    Err(e) => error!(job = %name, origin = %origin, error = %e, "failed to register job"),
                },
                Some(existing) => {
                    if existing.origin() != origin {
                        warn!(
                            job = %name,
                            held_by = %existing.origin(),
                            wanted_by = %origin,
                            "job name collision across origins, ignoring"
                        );
                        continue;
                    }
                    if existing.config() == &config {
                        continue;
                    }
                    self.apply_change(&existing, config, origin);
                }
            }
        }
    }

    /// Apply a changed definition. Middleware-only changes swap the job
    /// snapshot atomically; schedule or backend changes restart the
    /// dispatcher as one critical section. Either way the history ring and
    /// running counter carry over, and any in-flight run completes against
    /// the old snapshot it captured at fire time.
    fn apply_change(&self, existing: &Arc<Job>, config: JobConfig, origin: Origin) {
        let name = existing.name().to_string();
        let reschedule = config.requires_reschedule(existing.config());

        let backend = match backend::build(&config, self.inner.docker.as_ref()) {
            Ok(backend) => backend,
            Err(e) => {
                // The old definition stays in force.
                error!(job = %name, error = %e, "rejecting changed job config");
                return;
            }
        };
        let chain = middleware::build_chain(&config, &self.inner.global);
        let job = match Job::adopting(config, origin, backend, chain, existing) {
            Ok(job) => job,
            Err(e) => {
                error!(job = %name, error = %e, "rejecting changed job config");
                return;
            }
        };

        let was_enabled = self.inner.registry.active(&name).is_some();
        if self.inner.registry.replace(&name, job.clone()).is_err() {
            return;
        }
        let now_enabled = job.config().enabled;

        match (was_enabled, now_enabled) {
            (true, false) => {
                info!(job = %name, "job disabled");
                self.remove_dispatcher(&name);
                self.inner.registry.disable(&name).ok();
            }
            (false, true) => {
                info!(job = %name, "job enabled");
                self.inner.registry.enable(&name).ok();
                if self.is_running() {
                    self.spawn_dispatcher(&job);
                }
            }
            (true, true) if reschedule => {
                info!(job = %name, schedule = %job.schedule(), "job changed, rescheduling");
                self.remove_dispatcher(&name);
                if self.is_running() {
                    self.spawn_dispatcher(&job);
                }
            }
            _ => debug!(job = %name, "job middleware updated in place"),
        }
    }

    /// Attach persisted reports to matching jobs on startup. Unknown jobs
    /// and malformed files are skipped.
    pub fn restore_history(&self) {
        let Some(dir) = &self.inner.global.save_folder else {
            return;
        };
        let reports = report::restore_reports(
            dir,
            self.inner.global.restore_max_age,
            self.inner.clock.now(),
        );
        let mut attached = 0usize;
        for restored in reports {
            let Some(job) = self.inner.registry.get(&restored.job.name) else {
                debug!(job = %restored.job.name, "skipping restored report for unknown job");
                continue;
            };
            job.set_last_run(Execution::from_summary(&restored.execution));
            attached += 1;
        }
        if attached > 0 {
            info!(count = attached, "restored execution history from disk");
        }
    }

    // ---- read model ----

    pub fn jobs(&self) -> Vec<Arc<Job>> {
        self.inner.registry.list(None)
    }

    pub fn disabled_jobs(&self) -> Vec<Arc<Job>> {
        self.inner.registry.disabled_jobs()
    }

    pub fn removed_jobs(&self) -> Vec<Arc<Job>> {
        self.inner.registry.removed_jobs()
    }

    pub fn job(&self, name: &str) -> Option<Arc<Job>> {
        self.inner.registry.get(name)
    }

    /// History for any known job, including recently removed ones.
    pub fn history(&self, name: &str) -> Option<Vec<Arc<Execution>>> {
        if let Some(job) = self.inner.registry.get(name) {
            return Some(job.history());
        }
        self.inner
            .registry
            .removed_jobs()
            .into_iter()
            .rev()
            .find(|job| job.name() == name)
            .map(|job| job.history())
    }

    pub fn last_run(&self, name: &str) -> Option<Arc<Execution>> {
        self.history(name)?.last().cloned()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total: self.inner.metrics.total.load(Ordering::SeqCst),
            failed: self.inner.metrics.failed.load(Ordering::SeqCst),
            skipped: self.inner.metrics.skipped.load(Ordering::SeqCst),
            in_flight: self.inner.inflight.count.load(Ordering::SeqCst),
        }
    }

    // ---- internals ----

    fn spawn_dispatcher(&self, job: &Arc<Job>) {
        let name = job.name().to_string();
        let schedule = job.schedule().clone();
        let handle = tokio::spawn(dispatch_loop(self.inner.clone(), name.clone(), schedule));
        if let Some(old) = self
            .inner
            .dispatchers
            .lock()
            .insert(name, handle.abort_handle())
        {
            old.abort();
        }
    }

    fn remove_dispatcher(&self, name: &str) {
        if let Some(handle) = self.inner.dispatchers.lock().remove(name) {
            handle.abort();
        }
    }

    fn spawn_dedup_sweeper(&self) {
        let inner = self.inner.clone();
        let mut shutdown = inner.shutdown.subscribe();
        tokio::spawn(async move {
            let period = inner.global.dedup_cooldown.max(Duration::from_secs(60));
            let mut tick = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = tick.tick() => inner.dedup.sweep(),
                    _ = shutdown.recv() => break,
                }
            }
        });
    }
}

/// One task per scheduled job: sleep to the next fire instant, re-resolve
/// the job by name (it may have been replaced, disabled or removed since
/// the last tick) and dispatch.
async fn dispatch_loop(inner: Arc<Inner>, name: String, schedule: JobSchedule) {
    let mut shutdown = inner.shutdown.subscribe();
    loop {
        let now = inner.clock.now();
        let Some(next) = schedule.next_after(now) else {
            warn!(job = %name, "schedule yields no future fire, dispatch loop ending");
            break;
        };
        let delay = (next - now).to_std().unwrap_or_default();
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.recv() => break,
        }

        let Some(job) = inner.registry.active(&name) else {
            debug!(job = %name, "job no longer active, dispatch loop ending");
            break;
        };
        dispatch(&inner, job, next);
    }
}

/// Per-tick flow: allocate the execution, try the gate, run the chain on
/// its own task. A saturated gate records the fire as skipped immediately;
/// it is never queued for later.
fn dispatch(inner: &Arc<Inner>, job: Arc<Job>, fire_time: DateTime<Utc>) {
    {
        let state = inner.state.lock();
        if !matches!(*state, SchedulerState::Running | SchedulerState::Starting) {
            return;
        }
    }

    let execution = Execution::new(job.name(), fire_time);
    let ctx = Context::new(
        inner.docker.clone(),
        job.clone(),
        execution.clone(),
        inner.clock.clone(),
        inner.shutdown.clone(),
        inner.dedup.clone(),
    );

    inner.metrics.total.fetch_add(1, Ordering::SeqCst);
    inner.inflight.enter();
    let permit = inner.gate.try_acquire();
    let inner = inner.clone();
    tokio::spawn(async move {
        match permit {
            Ok(permit) => {
                ctx.attach_permit(permit);
                job.chain().run(&ctx).await;
            }
            Err(reason) => job.chain().run_denied(&ctx, reason).await,
        }
        if execution.failed() {
            inner.metrics.failed.fetch_add(1, Ordering::SeqCst);
        } else if execution.skipped() {
            inner.metrics.skipped.fetch_add(1, Ordering::SeqCst);
        }
        inner.inflight.exit();
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{JobKind, OverlapPolicy};
    use crate::middleware::{Chain, OverlapGuard};
    use crate::schedule::SystemClock;
    use async_trait::async_trait;

    /// Backend that sleeps on the tokio clock, so paused-time tests stay
    /// deterministic.
    struct SleepBackend {
        latency: Duration,
        fail: bool,
    }

    #[async_trait]
    impl backend::Backend for SleepBackend {
        async fn run(&self, _ctx: &Context) -> Result<(), JobError> {
            tokio::time::sleep(self.latency).await;
            if self.fail {
                Err(JobError::NonZeroExit(1))
            } else {
                Ok(())
            }
        }
    }

    fn test_scheduler(max_concurrent: usize) -> Scheduler {
        let global = GlobalConfig {
            max_concurrent,
            shutdown_timeout: Duration::from_secs(60),
            ..GlobalConfig::default()
        };
        Scheduler::new(global, None, Arc::new(SystemClock))
    }

    fn sleeping_job(
        scheduler: &Scheduler,
        name: &str,
        schedule: &str,
        overlap: OverlapPolicy,
        latency: Duration,
    ) -> Arc<Job> {
        let config = JobConfig {
            name: name.into(),
            kind: JobKind::Local,
            schedule: schedule.into(),
            command: "unused".into(),
            overlap,
            history_limit: 100,
            ..JobConfig::default()
        };
        let job = Job::new(
            config,
            Origin::Api,
            Arc::new(SleepBackend {
                latency,
                fail: false,
            }),
            Chain::new(vec![Arc::new(OverlapGuard)]),
        )
        .unwrap();
        scheduler.inner.registry.add(job.clone()).unwrap();
        job
    }

    fn local_config(name: &str, schedule: &str) -> JobConfig {
        JobConfig {
            name: name.into(),
            kind: JobKind::Local,
            schedule: schedule.into(),
            command: "true".into(),
            ..JobConfig::default()
        }
    }

    async fn settle() {
        // Let spawned run tasks make progress under the paused clock.
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn overlap_skip_produces_one_run_and_skips_the_rest() {
        let scheduler = test_scheduler(0);
        let job = sleeping_job(
            &scheduler,
            "slow",
            "@every 1s",
            OverlapPolicy::Skip,
            Duration::from_millis(2500),
        );
        scheduler.start().unwrap();

        tokio::time::sleep(Duration::from_millis(2200)).await;
        settle().await;
        assert!(job.running() <= 1);

        // Let the first run (fired at 1s) finish at 3.5s before stopping.
        tokio::time::sleep(Duration::from_millis(1600)).await;
        settle().await;
        scheduler.stop().await;

        let history = job.history();
        let successes = history
            .iter()
            .filter(|e| e.is_terminal() && !e.skipped() && !e.failed())
            .count();
        let skipped = history.iter().filter(|e| e.skipped()).count();
        assert_eq!(successes, 1, "overlap must never run twice concurrently");
        assert!(skipped >= 1, "at least one tick must be skipped");
    }

    #[tokio::test(start_paused = true)]
    async fn gate_caps_simultaneous_runs_and_skips_the_overflow() {
        let scheduler = test_scheduler(2);
        let jobs: Vec<Arc<Job>> = (0..5)
            .map(|i| {
                sleeping_job(
                    &scheduler,
                    &format!("batch-{i}"),
                    "@every 1s",
                    OverlapPolicy::Allow,
                    Duration::from_secs(30),
                )
            })
            .collect();
        scheduler.start().unwrap();

        // One fire round for every job.
        tokio::time::sleep(Duration::from_millis(1100)).await;
        settle().await;

        let mut started = 0;
        let mut gated = 0;
        for job in &jobs {
            for exec in job.history() {
                if exec.skipped() {
                    assert!(exec.error().unwrap().contains("gate"));
                    gated += 1;
                } else {
                    started += 1;
                }
            }
        }
        assert_eq!(started, 2);
        assert_eq!(gated, 3);

        scheduler.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stop_waits_for_in_flight_executions() {
        let scheduler = test_scheduler(4);
        let jobs: Vec<Arc<Job>> = (0..10)
            .map(|i| {
                sleeping_job(
                    &scheduler,
                    &format!("load-{i}"),
                    "@every 1s",
                    OverlapPolicy::Allow,
                    Duration::from_millis(500),
                )
            })
            .collect();
        scheduler.start().unwrap();

        tokio::time::sleep(Duration::from_millis(1050)).await;
        settle().await;
        scheduler.stop().await;

        // Every recorded execution is terminal once stop returns.
        for job in &jobs {
            for exec in job.history() {
                assert!(exec.is_terminal());
            }
        }
        assert_eq!(scheduler.metrics().in_flight, 0);
        assert_eq!(scheduler.state(), SchedulerState::Stopped);

        // No new fires after stop.
        let total = scheduler.metrics().total;
        tokio::time::sleep(Duration::from_secs(5)).await;
        settle().await;
        assert_eq!(scheduler.metrics().total, total);
    }

    #[tokio::test]
    async fn start_is_idempotent() {
        let scheduler = test_scheduler(0);
        scheduler.start().unwrap();
        scheduler.start().unwrap();
        assert_eq!(scheduler.state(), SchedulerState::Running);
        scheduler.stop().await;
        assert_eq!(scheduler.state(), SchedulerState::Stopped);
    }

    #[tokio::test]
    async fn reconcile_is_idempotent() {
        let scheduler = test_scheduler(0);
        let desired: HashMap<String, JobConfig> = [
            ("a".to_string(), local_config("a", "@every 1h")),
            ("b".to_string(), local_config("b", "0 0 * * *")),
        ]
        .into();

        scheduler.reconcile(desired.clone(), Origin::File).await;
        let first: Vec<String> = {
            let mut names: Vec<String> =
                scheduler.jobs().iter().map(|j| j.name().to_string()).collect();
            names.sort();
            names
        };
        let first_handles: HashMap<String, Arc<Job>> = scheduler
            .jobs()
            .into_iter()
            .map(|j| (j.name().to_string(), j))
            .collect();

        scheduler.reconcile(desired, Origin::File).await;
        let mut second: Vec<String> =
            scheduler.jobs().iter().map(|j| j.name().to_string()).collect();
        second.sort();
        assert_eq!(first, second);
        // Unchanged configs keep the very same job snapshots.
        for job in scheduler.jobs() {
            assert!(Arc::ptr_eq(&first_handles[job.name()], &job));
        }
        assert!(scheduler.removed_jobs().is_empty());
    }

    #[tokio::test]
    async fn reconcile_scopes_to_its_origin() {
        let scheduler = test_scheduler(0);
        scheduler
            .add_job(local_config("from-file", "@every 1h"), Origin::File)
            .unwrap();
        scheduler
            .add_job(local_config("from-label", "@every 1h"), Origin::Label)
            .unwrap();

        // An empty label reconcile removes label jobs but not file jobs.
        scheduler.reconcile(HashMap::new(), Origin::Label).await;
        assert!(scheduler.job("from-file").is_some());
        assert!(scheduler.job("from-label").is_none());
        let removed = scheduler.removed_jobs();
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].name(), "from-label");

        // A label job must not steal a file job's name.
        let steal: HashMap<String, JobConfig> =
            [("from-file".to_string(), local_config("from-file", "@every 5m"))].into();
        scheduler.reconcile(steal, Origin::Label).await;
        let job = scheduler.job("from-file").unwrap();
        assert_eq!(job.origin(), Origin::File);
        assert_eq!(job.config().schedule, "@every 1h");
    }

    #[tokio::test]
    async fn removed_label_job_lands_on_removed_ring_and_stops_firing() {
        let scheduler = test_scheduler(0);
        scheduler.start().unwrap();
        let desired: HashMap<String, JobConfig> =
            [("j".to_string(), local_config("j", "@every 10s"))].into();
        scheduler.reconcile(desired, Origin::Label).await;
        assert!(scheduler.job("j").is_some());

        scheduler.reconcile(HashMap::new(), Origin::Label).await;
        assert!(scheduler.job("j").is_none());
        assert_eq!(scheduler.removed_jobs().len(), 1);
        // The read model still resolves its history through the ring.
        assert!(scheduler.history("j").is_some());
        scheduler.stop().await;
    }

    #[tokio::test]
    async fn schedule_change_is_applied_and_history_carries_over() {
        let scheduler = test_scheduler(0);
        scheduler
            .add_job(local_config("k", "0 * * * *"), Origin::File)
            .unwrap();
        let old = scheduler.job("k").unwrap();
        old.set_last_run(Execution::new("k", Utc::now()));

        let desired: HashMap<String, JobConfig> =
            [("k".to_string(), local_config("k", "*/5 * * * *"))].into();
        scheduler.reconcile(desired, Origin::File).await;

        let new = scheduler.job("k").unwrap();
        assert!(!Arc::ptr_eq(&old, &new));
        assert_eq!(new.config().schedule, "*/5 * * * *");
        assert_eq!(new.history().len(), 1);
    }

    #[tokio::test]
    async fn middleware_only_change_swaps_without_new_snapshot_identity() {
        let scheduler = test_scheduler(0);
        scheduler
            .add_job(local_config("m", "@every 1h"), Origin::File)
            .unwrap();
        let old = scheduler.job("m").unwrap();

        let mut changed = local_config("m", "@every 1h");
        changed.webhook = Some("https://hooks.example/m".into());
        let desired: HashMap<String, JobConfig> = [("m".to_string(), changed)].into();
        scheduler.reconcile(desired, Origin::File).await;

        let new = scheduler.job("m").unwrap();
        assert!(!Arc::ptr_eq(&old, &new));
        assert_eq!(
            new.config().webhook.as_deref(),
            Some("https://hooks.example/m")
        );
        // Shared running counter proves the swap adopted the old state.
        old.notify_start();
        assert_eq!(new.running(), 1);
        old.notify_stop();
    }

    #[tokio::test]
    async fn disabling_via_reconcile_moves_to_disabled_set() {
        let scheduler = test_scheduler(0);
        scheduler
            .add_job(local_config("d", "@every 1h"), Origin::File)
            .unwrap();

        let mut off = local_config("d", "@every 1h");
        off.enabled = false;
        scheduler
            .reconcile([("d".to_string(), off)].into(), Origin::File)
            .await;
        assert!(scheduler.job("d").is_some());
        assert_eq!(scheduler.jobs().len(), 0);
        assert_eq!(scheduler.disabled_jobs().len(), 1);

        scheduler
            .reconcile(
                [("d".to_string(), local_config("d", "@every 1h"))].into(),
                Origin::File,
            )
            .await;
        assert_eq!(scheduler.jobs().len(), 1);
        assert!(scheduler.disabled_jobs().is_empty());
    }

    #[tokio::test]
    async fn invalid_entry_blocks_only_itself() {
        let scheduler = test_scheduler(0);
        let mut bad = local_config("bad", "@every 1h");
        bad.command = String::new();
        let desired: HashMap<String, JobConfig> = [
            ("bad".to_string(), bad),
            ("good".to_string(), local_config("good", "@every 1h")),
        ]
        .into();
        scheduler.reconcile(desired, Origin::File).await;
        assert!(scheduler.job("bad").is_none());
        assert!(scheduler.job("good").is_some());
    }

    #[tokio::test]
    async fn restore_attaches_only_known_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let global = GlobalConfig {
            save_folder: Some(dir.path().to_path_buf()),
            ..GlobalConfig::default()
        };
        let scheduler = Scheduler::new(global, None, Arc::new(SystemClock));
        scheduler
            .add_job(local_config("known", "@every 1h"), Origin::File)
            .unwrap();

        for job_name in ["known", "forgotten"] {
            let exec = Execution::new(job_name, Utc::now());
            exec.start(Utc::now());
            exec.stop(Utc::now(), None);
            let report = report::Report {
                job: report::ReportJob {
                    name: job_name.into(),
                    kind: JobKind::Local,
                    schedule: "@every 1h".into(),
                    command: "true".into(),
                    origin: Origin::File,
                },
                execution: exec.summary(),
            };
            report::write_report(dir.path(), &report, b"", b"").unwrap();
        }

        scheduler.restore_history();
        let history = scheduler.history("known").unwrap();
        assert_eq!(history.len(), 1);
        assert!(!history[0].is_running());
    }
}
