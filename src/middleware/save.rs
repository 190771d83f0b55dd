use std::path::PathBuf;

use async_trait::async_trait;
use tracing::warn;

use crate::middleware::{Context, Middleware};
use crate::report::{Report, ReportJob};

/// Persists a report sidecar set for every terminal execution.
///
/// Best-effort: a write failure is logged and never alters the run outcome.
pub struct SaveReport {
    folder: PathBuf,
    only_on_error: bool,
}

impl SaveReport {
    pub fn new(folder: PathBuf, only_on_error: bool) -> SaveReport {
        SaveReport {
            folder,
            only_on_error,
        }
    }
}

#[async_trait]
impl Middleware for SaveReport {
    async fn after(&self, ctx: &Context) {
        if self.only_on_error && !ctx.execution.failed() {
            return;
        }

        let config = ctx.job.config();
        let report = Report {
            job: ReportJob {
                name: ctx.job.name().to_string(),
                kind: config.kind,
                schedule: config.schedule.clone(),
                command: config.command.clone(),
                origin: ctx.job.origin(),
            },
            execution: ctx.execution.summary(),
        };
        let stdout = ctx.execution.stdout.contents();
        let stderr = ctx.execution.stderr.contents();

        let folder = self.folder.clone();
        let job_name = ctx.job.name().to_string();
        // File writes stay off the async workers; the owning task waits.
        let result = tokio::task::spawn_blocking(move || {
            crate::report::write_report(&folder, &report, &stdout, &stderr)
        })
        .await;

        match result {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!(job = %job_name, error = %e, "failed to persist execution report"),
            Err(e) => warn!(job = %job_name, error = %e, "report writer task failed"),
        }
    }

    fn continue_on_stop(&self) -> bool {
        true
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

    fn run_ctx(command: &str) -> Context {
        let config = JobConfig {
            name: "saver".into(),
            kind: JobKind::Local,
            schedule: "@every 1m".into(),
            command: command.into(),
            ..JobConfig::default()
        };
        let backend = crate::backend::build(&config, None).unwrap();
        let job = Job::new(config, Origin::File, backend, Chain::new(Vec::new())).unwrap();
        let (shutdown, _) = broadcast::channel(1);
        Context::new(
            None,
            job,
            Execution::new("saver", chrono::Utc::now()),
            Arc::new(SystemClock),
            shutdown,
            NotificationDedup::new(Duration::from_secs(60), Arc::new(SystemClock)),
        )
    }

    fn sidecar_names(dir: &std::path::Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        names.sort();
        names
    }

    #[tokio::test]
    async fn writes_all_sidecars_for_a_failed_run() {
        let dir = tempfile::tempdir().unwrap();
        let saver = SaveReport::new(dir.path().to_path_buf(), false);
        let ctx = run_ctx("true");

        ctx.execution.start(chrono::Utc::now());
        ctx.execution.stdout.write(b"some output");
        ctx.execution.stderr.write(b"some diagnostics");
        ctx.execution
            .stop(chrono::Utc::now(), Some(&crate::error::JobError::NonZeroExit(2)));
        saver.after(&ctx).await;

        let names = sidecar_names(dir.path());
        assert_eq!(names.len(), 3);
        assert!(names.iter().any(|n| n.ends_with(".json")));
        assert!(names.iter().any(|n| n.ends_with(".stdout.log")));
        assert!(names.iter().any(|n| n.ends_with(".stderr.log")));
    }

    #[tokio::test]
    async fn only_on_error_suppresses_successful_runs() {
        let dir = tempfile::tempdir().unwrap();
        let saver = SaveReport::new(dir.path().to_path_buf(), true);

        let ctx = run_ctx("true");
        ctx.execution.start(chrono::Utc::now());
        ctx.execution.stop(chrono::Utc::now(), None);
        saver.after(&ctx).await;
        assert!(sidecar_names(dir.path()).is_empty());

        let ctx = run_ctx("false");
        ctx.execution.start(chrono::Utc::now());
        ctx.execution
            .stop(chrono::Utc::now(), Some(&crate::error::JobError::NonZeroExit(1)));
        saver.after(&ctx).await;
        assert!(!sidecar_names(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn unwritable_folder_is_logged_not_fatal() {
        let saver = SaveReport::new(PathBuf::from("/proc/definitely/not/writable"), false);
        let ctx = run_ctx("true");
        ctx.execution.start(chrono::Utc::now());
        ctx.execution.stop(chrono::Utc::now(), None);
        // Must not panic or propagate.
        saver.after(&ctx).await;
    }
}
