use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::LogOutput;
use bollard::models::{
    NetworkAttachmentConfig, ServiceSpec, ServiceSpecMode, ServiceSpecModeReplicated, TaskSpec,
    TaskSpecContainerSpec, TaskSpecRestartPolicy, TaskSpecRestartPolicyConditionEnum, TaskState,
};
use bollard::query_parameters::{InspectServiceOptions, ListTasksOptions, LogsOptions};
use futures::StreamExt;
use tracing::debug;

use crate::backend::{Backend, CancelTarget, split_command};
use crate::config::JobConfig;
use crate::error::{JobError, SERVICE_FAILED_EXIT, SERVICE_REMOVED_EXIT};
use crate::middleware::Context;
use crate::report::sanitize_file_name;

const TASK_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Submits a one-shot Swarm service, polls its task until it reaches a
/// terminal state and tears the service down again.
///
/// Swarm does not always surface a container exit code, so two sentinel
/// codes distinguish a service that failed without one from a service that
/// vanished while we were polling.
pub struct ServiceRunBackend {
    image: String,
    argv: Option<Vec<String>>,
    user: Option<String>,
    network: Option<String>,
    dir: Option<String>,
    environment: Vec<String>,
    tty: bool,
    delete: bool,
    job_name: String,
}

impl ServiceRunBackend {
    pub fn from_config(config: &JobConfig) -> Result<ServiceRunBackend, JobError> {
        let image = config
            .image
            .clone()
            .filter(|i| !i.is_empty())
            .ok_or_else(|| {
                JobError::ConfigInvalid(format!("service-run job {:?} has no image", config.name))
            })?;
        let argv = if config.command.trim().is_empty() {
            None
        } else {
            Some(split_command(&config.command)?)
        };
        Ok(ServiceRunBackend {
            image,
            argv,
            user: config.user.clone(),
            network: config.network.clone(),
            dir: config.dir.clone(),
            environment: config.environment.clone(),
            tty: config.tty,
            delete: config.delete,
            job_name: config.name.clone(),
        })
    }

    fn spec(&self, service_name: &str) -> ServiceSpec {
        ServiceSpec {
            name: Some(service_name.to_string()),
            task_template: Some(TaskSpec {
                container_spec: Some(TaskSpecContainerSpec {
                    image: Some(self.image.clone()),
                    command: self.argv.clone(),
                    env: (!self.environment.is_empty()).then(|| self.environment.clone()),
                    user: self.user.clone(),
                    dir: self.dir.clone(),
                    tty: Some(self.tty),
                    ..Default::default()
                }),
                // One-shot semantics: a finished task must not be restarted.
                restart_policy: Some(TaskSpecRestartPolicy {
                    condition: Some(TaskSpecRestartPolicyConditionEnum::NONE),
                    ..Default::default()
                }),
                networks: self.network.as_ref().map(|network| {
                    vec![NetworkAttachmentConfig {
                        target: Some(network.clone()),
                        ..Default::default()
                    }]
                }),
                ..Default::default()
            }),
            mode: Some(ServiceSpecMode {
                replicated: Some(ServiceSpecModeReplicated { replicas: Some(1) }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Poll until the single task reaches a terminal state and map it to an
    /// exit code.
    async fn await_exit(&self, docker: &Docker, service_name: &str) -> Result<i64, JobError> {
        let filters = HashMap::from([("service".to_string(), vec![service_name.to_string()])]);
        loop {
            tokio::time::sleep(TASK_POLL_INTERVAL).await;

            let tasks = docker
                .list_tasks(Some(ListTasksOptions {
                    filters: Some(filters.clone()),
                }))
                .await?;

            if tasks.is_empty() {
                // Not scheduled yet, or removed underneath us.
                if docker
                    .inspect_service(service_name, None::<InspectServiceOptions>)
                    .await
                    .is_err()
                {
                    return Ok(SERVICE_REMOVED_EXIT);
                }
                continue;
            }

            for task in &tasks {
                let Some(status) = &task.status else { continue };
                let exit_code = status
                    .container_status
                    .as_ref()
                    .and_then(|container| container.exit_code);
                match status.state {
                    Some(TaskState::COMPLETE) => return Ok(exit_code.unwrap_or(0)),
                    Some(TaskState::FAILED) | Some(TaskState::REJECTED) => {
                        return Ok(exit_code.unwrap_or(SERVICE_FAILED_EXIT));
                    }
                    Some(TaskState::SHUTDOWN)
                    | Some(TaskState::REMOVE)
                    | Some(TaskState::ORPHANED) => {
                        return Ok(SERVICE_REMOVED_EXIT);
                    }
                    _ => {}
                }
            }
        }
    }

    async fn collect_logs(&self, docker: &Docker, service_name: &str, ctx: &Context) {
        let mut logs = docker.service_logs(
            service_name,
            Some(LogsOptions {
                stdout: true,
                stderr: true,
                ..Default::default()
            }),
        );
        while let Some(chunk) = logs.next().await {
            match chunk {
                Ok(LogOutput::StdOut { message }) | Ok(LogOutput::Console { message }) => {
                    ctx.execution.stdout.write(&message);
                }
                Ok(LogOutput::StdErr { message }) => {
                    ctx.execution.stderr.write(&message);
                }
                Ok(LogOutput::StdIn { .. }) => {}
                Err(e) => {
                    debug!(service = %service_name, error = %e, "service log stream ended");
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl Backend for ServiceRunBackend {
    async fn run(&self, ctx: &Context) -> Result<(), JobError> {
        let docker = ctx
            .docker
            .as_ref()
            .ok_or_else(|| JobError::Runtime("no docker connection".into()))?;

        let service_name = format!(
            "coxswain-{}-{:.8}",
            sanitize_file_name(&self.job_name).replace('.', "-"),
            ctx.execution.id.simple()
        );
        docker.create_service(self.spec(&service_name), None).await?;
        ctx.set_cancel_target(CancelTarget::Service(service_name.clone()));

        let exit = self.await_exit(docker, &service_name).await;
        if matches!(exit, Ok(code) if code != SERVICE_REMOVED_EXIT) {
            self.collect_logs(docker, &service_name, ctx).await;
        }

        if self.delete {
            if let Err(e) = docker.delete_service(&service_name).await {
                // Already gone when the removed sentinel fired; only log.
                debug!(service = %service_name, error = %e, "service removal failed");
            }
        }

        match exit? {
            0 => Ok(()),
            code => Err(JobError::NonZeroExit(code)),
        }
    }

    fn needs_docker(&self) -> bool {
        true
    }
}
