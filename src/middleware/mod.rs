mod notify;
mod overlap;
mod save;

pub use notify::{SlackNotifier, WebhookNotifier};
pub use overlap::OverlapGuard;
pub use save::SaveReport;

use std::sync::Arc;

use async_trait::async_trait;
use bollard::Docker;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{error, info};

use crate::backend::CancelTarget;
use crate::config::{GlobalConfig, JobConfig};
use crate::dedup::NotificationDedup;
use crate::error::JobError;
use crate::execution::Execution;
use crate::gate::Permit;
use crate::job::Job;
use crate::schedule::Clock;

/// Decision returned by a middleware's before-phase.
pub enum Flow {
    Continue,
    Skip(JobError),
}

/// A wrapper around the backend invocation.
///
/// The chain is an explicit ordered list walked iteratively: every
/// middleware's `before` runs outer-to-inner ahead of the backend, and its
/// `after` runs once the execution is terminal. Middlewares that report
/// `continue_on_stop` see every terminal execution, including runs that
/// were skipped before reaching the backend.
#[async_trait]
pub trait Middleware: Send + Sync {
    async fn before(&self, _ctx: &Context) -> Result<Flow, JobError> {
        Ok(Flow::Continue)
    }

    async fn after(&self, _ctx: &Context) {}

    fn continue_on_stop(&self) -> bool {
        false
    }
}

/// Everything one run needs: the job snapshot captured at fire time, the
/// execution record, the Docker handle and the shared service handles.
pub struct Context {
    pub docker: Option<Docker>,
    pub job: Arc<Job>,
    pub execution: Arc<Execution>,
    pub clock: Arc<dyn Clock>,
    pub shutdown: broadcast::Sender<()>,
    pub dedup: Arc<NotificationDedup>,
    cancel_target: Mutex<Option<CancelTarget>>,
    notify_decision: Mutex<Option<bool>>,
    permit: Mutex<Option<Permit>>,
}

impl Context {
    pub fn new(
        docker: Option<Docker>,
        job: Arc<Job>,
        execution: Arc<Execution>,
        clock: Arc<dyn Clock>,
        shutdown: broadcast::Sender<()>,
        dedup: Arc<NotificationDedup>,
    ) -> Context {
        Context {
            docker,
            job,
            execution,
            clock,
            shutdown,
            dedup,
            cancel_target: Mutex::new(None),
            notify_decision: Mutex::new(None),
            permit: Mutex::new(None),
        }
    }

    /// Hold the gate permit for this run; it is released at the terminal
    /// transition, before the after-phase middlewares execute.
    pub fn attach_permit(&self, permit: Permit) {
        *self.permit.lock() = Some(permit);
    }

    fn release_permit(&self) {
        self.permit.lock().take();
    }

    /// Record the external resource a cancel request must tear down.
    pub fn set_cancel_target(&self, target: CancelTarget) {
        *self.cancel_target.lock() = Some(target);
    }

    pub fn cancel_target(&self) -> Option<CancelTarget> {
        self.cancel_target.lock().clone()
    }

    /// Dedup verdict for this execution, computed once and shared by every
    /// notifier on the chain so the first sender does not mute its peers.
    pub fn should_notify(&self) -> bool {
        let mut cached = self.notify_decision.lock();
        if let Some(decision) = *cached {
            return decision;
        }
        let failure = if self.execution.failed() {
            self.execution.error()
        } else {
            None
        };
        let decision =
            self.dedup
                .should_notify(self.job.name(), self.job.command(), failure.as_deref());
        *cached = Some(decision);
        decision
    }
}

/// Ordered middleware list applied around the backend, one pass per run.
pub struct Chain {
    middlewares: Vec<Arc<dyn Middleware>>,
}

impl Chain {
    pub fn new(middlewares: Vec<Arc<dyn Middleware>>) -> Chain {
        Chain { middlewares }
    }

    /// Run the full chain: before-phases, backend (bounded by max-runtime
    /// and shutdown), exactly-once stop, then after-phases.
    pub async fn run(&self, ctx: &Context) {
        self.begin(ctx);

        let mut ran = 0;
        let mut outcome: Result<(), JobError> = Ok(());
        for (i, middleware) in self.middlewares.iter().enumerate() {
            ran = i + 1;
            match middleware.before(ctx).await {
                Ok(Flow::Continue) => {}
                Ok(Flow::Skip(reason)) => {
                    outcome = Err(reason);
                    break;
                }
                Err(e) => {
                    outcome = Err(e);
                    break;
                }
            }
        }

        if outcome.is_ok() {
            outcome = self.invoke_backend(ctx).await;
        }
        self.finish(ctx, outcome, ran).await;
    }

    /// Record a fire that was denied before the chain could run (gate
    /// saturation). The execution still goes through start/stop so history
    /// and the after-phase middlewares observe a terminal skip.
    pub async fn run_denied(&self, ctx: &Context, reason: JobError) {
        self.begin(ctx);
        self.finish(ctx, Err(reason), 0).await;
    }

    fn begin(&self, ctx: &Context) {
        ctx.execution.start(ctx.clock.now());
        ctx.job.notify_start();
        ctx.job.set_last_run(ctx.execution.clone());
    }

    async fn invoke_backend(&self, ctx: &Context) -> Result<(), JobError> {
        let backend = ctx.job.backend().clone();
        let max_runtime = ctx.job.config().max_runtime;
        let mut shutdown = ctx.shutdown.subscribe();

        let bounded = async {
            match max_runtime {
                Some(limit) => match tokio::time::timeout(limit, backend.run(ctx)).await {
                    Ok(res) => res,
                    Err(_) => {
                        backend.cancel(ctx).await;
                        Err(JobError::Timeout(limit))
                    }
                },
                None => backend.run(ctx).await,
            }
        };

        tokio::select! {
            res = bounded => res,
            _ = shutdown.recv() => {
                backend.cancel(ctx).await;
                Err(JobError::Canceled)
            }
        }
    }

    async fn finish(&self, ctx: &Context, outcome: Result<(), JobError>, ran: usize) {
        match &outcome {
            Ok(()) => {
                info!(job = %ctx.job.name(), execution = %ctx.execution.id, "execution finished")
            }
            Err(e) if e.is_skip() => {
                info!(job = %ctx.job.name(), reason = %e, "execution skipped")
            }
            Err(e) => {
                error!(job = %ctx.job.name(), execution = %ctx.execution.id, error = %e, "execution failed")
            }
        }

        ctx.execution.stop(ctx.clock.now(), outcome.as_ref().err());
        ctx.job.notify_stop();
        ctx.release_permit();

        for (i, middleware) in self.middlewares.iter().enumerate() {
            if i < ran || middleware.continue_on_stop() {
                middleware.after(ctx).await;
            }
        }
    }
}

/// Assemble the chain for one job from its config and the global defaults:
/// overlap guard first, then persister and notifiers, which act after stop.
pub fn build_chain(
    config: &JobConfig,
    global: &GlobalConfig,
) -> Chain {
    let mut middlewares: Vec<Arc<dyn Middleware>> = vec![Arc::new(OverlapGuard)];

    let save_folder = config.save_folder.clone().or_else(|| global.save_folder.clone());
    if let Some(folder) = save_folder {
        let only_on_error = config
            .save_only_on_error
            .unwrap_or(global.save_only_on_error);
        middlewares.push(Arc::new(SaveReport::new(folder, only_on_error)));
    }
    if let Some(url) = config.webhook.clone().or_else(|| global.webhook.clone()) {
        middlewares.push(Arc::new(WebhookNotifier::new(url)));
    }
    if let Some(url) = config
        .slack_webhook
        .clone()
        .or_else(|| global.slack_webhook.clone())
    {
        middlewares.push(Arc::new(SlackNotifier::new(url)));
    }

    Chain::new(middlewares)
}
