use async_trait::async_trait;
use bollard::container::LogOutput;
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::query_parameters::InspectContainerOptions;
use futures::StreamExt;

use crate::backend::{Backend, split_command};
use crate::config::JobConfig;
use crate::error::JobError;
use crate::middleware::Context;

/// Runs a command inside an already-running container via the exec API.
pub struct ExecBackend {
    container: String,
    argv: Vec<String>,
    user: Option<String>,
    dir: Option<String>,
    environment: Vec<String>,
    tty: bool,
}

impl ExecBackend {
    pub fn from_config(config: &JobConfig) -> Result<ExecBackend, JobError> {
        let container = config
            .container
            .clone()
            .filter(|c| !c.is_empty())
            .ok_or_else(|| {
                JobError::ConfigInvalid(format!("exec job {:?} has no target container", config.name))
            })?;
        Ok(ExecBackend {
            container,
            argv: split_command(&config.command)?,
            user: config.user.clone(),
            dir: config.dir.clone(),
            environment: config.environment.clone(),
            tty: config.tty,
        })
    }

    /// Argv handed to the exec API, split quote-aware at build time.
    pub fn argv(&self) -> &[String] {
        &self.argv
    }
}

#[async_trait]
impl Backend for ExecBackend {
    async fn run(&self, ctx: &Context) -> Result<(), JobError> {
        let docker = ctx
            .docker
            .as_ref()
            .ok_or_else(|| JobError::Runtime("no docker connection".into()))?;

        let details = docker
            .inspect_container(&self.container, None::<InspectContainerOptions>)
            .await?;
        let running = details
            .state
            .as_ref()
            .and_then(|state| state.running)
            .unwrap_or(false);
        if !running {
            return Err(JobError::Runtime(format!(
                "container {} is not running",
                self.container
            )));
        }

        let exec = docker
            .create_exec(
                &self.container,
                CreateExecOptions {
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    tty: Some(self.tty),
                    cmd: Some(self.argv.clone()),
                    env: (!self.environment.is_empty()).then(|| self.environment.clone()),
                    user: self.user.clone(),
                    working_dir: self.dir.clone(),
                    ..Default::default()
                },
            )
            .await?
            .id;

        if let StartExecResults::Attached { mut output, .. } =
            docker.start_exec(&exec, None).await?
        {
            while let Some(Ok(msg)) = output.next().await {
                match msg {
                    LogOutput::StdOut { message } | LogOutput::Console { message } => {
                        ctx.execution.stdout.write(&message);
                    }
                    LogOutput::StdErr { message } => {
                        ctx.execution.stderr.write(&message);
                    }
                    LogOutput::StdIn { .. } => {}
                }
            }
        }

        let inspect = docker.inspect_exec(&exec).await?;
        match inspect.exit_code {
            Some(0) | None => Ok(()),
            Some(code) => Err(JobError::NonZeroExit(code)),
        }
    }

    fn needs_docker(&self) -> bool {
        true
    }
}
