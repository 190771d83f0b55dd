use async_trait::async_trait;
use tracing::debug;

use crate::config::OverlapPolicy;
use crate::error::JobError;
use crate::middleware::{Context, Flow, Middleware};

/// Enforces the job's overlap policy at the head of the chain.
///
/// The chain has already counted the current execution in the running
/// counter, so any value above one means an earlier run is still going.
pub struct OverlapGuard;

#[async_trait]
impl Middleware for OverlapGuard {
    async fn before(&self, ctx: &Context) -> Result<Flow, JobError> {
        if ctx.job.overlap() == OverlapPolicy::Skip && ctx.job.running() > 1 {
            debug!(job = %ctx.job.name(), "previous run still in progress, skipping tick");
            return Ok(Flow::Skip(JobError::SkippedOverlap));
        }
        Ok(Flow::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{JobConfig, JobKind, Origin};
    use crate::dedup::NotificationDedup;
    use crate::execution::Execution;
    use crate::job::Job;
    use crate::middleware::Chain;
    use crate::schedule::SystemClock;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::broadcast;

    fn guarded_job(overlap: OverlapPolicy) -> Arc<Job> {
        let config = JobConfig {
            name: "guarded".into(),
            kind: JobKind::Local,
            schedule: "@every 1s".into(),
            command: "true".into(),
            overlap,
            ..JobConfig::default()
        };
        let backend = crate::backend::build(&config, None).unwrap();
        Job::new(
            config,
            Origin::Api,
            backend,
            Chain::new(vec![Arc::new(OverlapGuard)]),
        )
        .unwrap()
    }

    fn ctx(job: &Arc<Job>) -> Context {
        let (shutdown, _) = broadcast::channel(1);
        Context::new(
            None,
            job.clone(),
            Execution::new(job.name(), chrono::Utc::now()),
            Arc::new(SystemClock),
            shutdown,
            NotificationDedup::new(Duration::from_secs(60), Arc::new(SystemClock)),
        )
    }

    #[tokio::test]
    async fn passes_when_nothing_is_running() {
        let job = guarded_job(OverlapPolicy::Skip);
        let ctx = ctx(&job);
        job.notify_start(); // the chain's own increment
        assert!(matches!(
            OverlapGuard.before(&ctx).await.unwrap(),
            Flow::Continue
        ));
        job.notify_stop();
    }

    #[tokio::test]
    async fn skips_when_a_previous_run_is_still_going() {
        let job = guarded_job(OverlapPolicy::Skip);
        let ctx = ctx(&job);
        job.notify_start(); // earlier, still-running execution
        job.notify_start(); // this execution
        match OverlapGuard.before(&ctx).await.unwrap() {
            Flow::Skip(JobError::SkippedOverlap) => {}
            _ => panic!("expected overlap skip"),
        }
    }

    #[tokio::test]
    async fn allow_policy_never_skips() {
        let job = guarded_job(OverlapPolicy::Allow);
        let ctx = ctx(&job);
        job.notify_start();
        job.notify_start();
        job.notify_start();
        assert!(matches!(
            OverlapGuard.before(&ctx).await.unwrap(),
            Flow::Continue
        ));
    }
}
