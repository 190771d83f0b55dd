use async_trait::async_trait;

use crate::backend::{Backend, parse_env, split_command};
use crate::backend::local::run_process;
use crate::config::JobConfig;
use crate::error::JobError;
use crate::middleware::Context;

/// Shells out to `docker compose run` for a service defined in a compose
/// file. Reuses the local process machinery, so streams and exit codes
/// behave exactly like a local job.
pub struct ComposeBackend {
    argv: Vec<String>,
    dir: Option<String>,
    env: Vec<(String, String)>,
}

impl ComposeBackend {
    pub fn from_config(config: &JobConfig) -> Result<ComposeBackend, JobError> {
        let service = config
            .service
            .clone()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                JobError::ConfigInvalid(format!("compose job {:?} has no service", config.name))
            })?;

        let mut argv = vec!["docker".to_string(), "compose".to_string()];
        if let Some(file) = config.file.as_deref().filter(|f| !f.is_empty()) {
            argv.push("-f".to_string());
            argv.push(file.to_string());
        }
        argv.push("run".to_string());
        argv.push("--rm".to_string());
        argv.push(service);
        if !config.command.trim().is_empty() {
            argv.extend(split_command(&config.command)?);
        }

        Ok(ComposeBackend {
            argv,
            dir: config.dir.clone(),
            env: parse_env(&config.environment),
        })
    }

    pub fn argv(&self) -> &[String] {
        &self.argv
    }
}

#[async_trait]
impl Backend for ComposeBackend {
    async fn run(&self, ctx: &Context) -> Result<(), JobError> {
        run_process(&self.argv, self.dir.as_deref(), &self.env, ctx).await
    }

    async fn cancel(&self, _ctx: &Context) {
        // The dropped run future kills the compose client (kill_on_drop);
        // compose itself tears down the service container.
    }
}
