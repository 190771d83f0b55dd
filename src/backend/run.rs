use async_trait::async_trait;
use bollard::Docker;
use bollard::container::LogOutput;
use bollard::errors::Error as DockerError;
use bollard::models::{ContainerCreateBody, HostConfig};
use bollard::query_parameters::{
    CreateContainerOptions, CreateImageOptions, LogsOptions, RemoveContainerOptions,
    StartContainerOptions, WaitContainerOptions,
};
use futures::StreamExt;
use tracing::{debug, warn};

use crate::backend::{Backend, CancelTarget, split_command};
use crate::config::JobConfig;
use crate::error::JobError;
use crate::middleware::Context;
use crate::report::sanitize_file_name;

/// Creates an ephemeral container from an image, waits for it, captures its
/// logs and removes it.
pub struct RunBackend {
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

impl RunBackend {
    pub fn from_config(config: &JobConfig) -> Result<RunBackend, JobError> {
        let image = config
            .image
            .clone()
            .filter(|i| !i.is_empty())
            .ok_or_else(|| {
                JobError::ConfigInvalid(format!("run job {:?} has no image", config.name))
            })?;
        // No command means the image's own entrypoint/CMD runs.
        let argv = if config.command.trim().is_empty() {
            None
        } else {
            Some(split_command(&config.command)?)
        };
        Ok(RunBackend {
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

    async fn ensure_image(&self, docker: &Docker) -> Result<(), JobError> {
        if docker.inspect_image(&self.image).await.is_ok() {
            return Ok(());
        }
        debug!(image = %self.image, "pulling image");
        let mut pull = docker.create_image(
            Some(CreateImageOptions {
                from_image: Some(self.image.clone()),
                ..Default::default()
            }),
            None,
            None,
        );
        while let Some(progress) = pull.next().await {
            progress?;
        }
        Ok(())
    }

    async fn execute(&self, docker: &Docker, id: &str, ctx: &Context) -> Result<(), JobError> {
        docker
            .start_container(id, None::<StartContainerOptions>)
            .await?;

        let exit = match docker
            .wait_container(id, None::<WaitContainerOptions>)
            .next()
            .await
        {
            None => {
                return Err(JobError::Runtime(
                    "container wait returned no response".into(),
                ));
            }
            Some(Ok(response)) => response.status_code,
            Some(Err(DockerError::DockerContainerWaitError { code, .. })) => code,
            Some(Err(e)) => return Err(e.into()),
        };

        let mut logs = docker.logs(
            id,
            Some(LogsOptions {
                stdout: true,
                stderr: true,
                ..Default::default()
            }),
        );
        while let Some(Ok(chunk)) = logs.next().await {
            match chunk {
                LogOutput::StdOut { message } | LogOutput::Console { message } => {
                    ctx.execution.stdout.write(&message);
                }
                LogOutput::StdErr { message } => {
                    ctx.execution.stderr.write(&message);
                }
                LogOutput::StdIn { .. } => {}
            }
        }

        if exit == 0 {
            Ok(())
        } else {
            Err(JobError::NonZeroExit(exit))
        }
    }
}

#[async_trait]
impl Backend for RunBackend {
    async fn run(&self, ctx: &Context) -> Result<(), JobError> {
        let docker = ctx
            .docker
            .as_ref()
            .ok_or_else(|| JobError::Runtime("no docker connection".into()))?;

        self.ensure_image(docker).await?;

        let container_name = format!(
            "coxswain-{}-{:.8}",
            sanitize_file_name(&self.job_name),
            ctx.execution.id.simple()
        );
        let body = ContainerCreateBody {
            image: Some(self.image.clone()),
            cmd: self.argv.clone(),
            env: (!self.environment.is_empty()).then(|| self.environment.clone()),
            user: self.user.clone(),
            working_dir: self.dir.clone(),
            tty: Some(self.tty),
            host_config: self.network.as_ref().map(|network| HostConfig {
                network_mode: Some(network.clone()),
                ..Default::default()
            }),
            ..Default::default()
        };
        let created = docker
            .create_container(
                Some(CreateContainerOptions {
                    name: Some(container_name),
                    ..Default::default()
                }),
                body,
            )
            .await?;
        ctx.set_cancel_target(CancelTarget::Container(created.id.clone()));

        let result = self.execute(docker, &created.id, ctx).await;

        if self.delete {
            if let Err(e) = docker
                .remove_container(
                    &created.id,
                    Some(RemoveContainerOptions {
                        force: true,
                        ..Default::default()
                    }),
                )
                .await
            {
                warn!(container = %created.id, error = %e, "failed to remove finished container");
            }
        }

        result
    }

    fn needs_docker(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::JobKind;

    fn run_config() -> JobConfig {
        JobConfig {
            name: "nightly".into(),
            kind: JobKind::Run,
            schedule: "@daily".into(),
            command: "backup --all".into(),
            image: Some("backup:latest".into()),
            ..JobConfig::default()
        }
    }

    #[test]
    fn builds_with_image_and_command() {
        let backend = RunBackend::from_config(&run_config()).unwrap();
        assert_eq!(backend.argv.as_deref().unwrap(), ["backup", "--all"]);
        assert!(backend.delete);
    }

    #[test]
    fn empty_command_defers_to_image_cmd() {
        let mut config = run_config();
        config.command = String::new();
        let backend = RunBackend::from_config(&config).unwrap();
        assert!(backend.argv.is_none());
    }

    #[test]
    fn missing_image_is_config_invalid() {
        let mut config = run_config();
        config.image = None;
        assert!(matches!(
            RunBackend::from_config(&config),
            Err(JobError::ConfigInvalid(_))
        ));
    }
}
