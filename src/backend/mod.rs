mod compose;
mod exec;
mod local;
mod run;
mod service;

pub use compose::ComposeBackend;
pub use exec::ExecBackend;
pub use local::LocalBackend;
pub use run::RunBackend;
pub use service::ServiceRunBackend;

use std::sync::Arc;

use async_trait::async_trait;
use bollard::Docker;
use tracing::warn;

use crate::config::{JobConfig, JobKind};
use crate::error::JobError;
use crate::middleware::Context;

/// External resource an in-flight run may need torn down on cancel.
#[derive(Debug, Clone)]
pub enum CancelTarget {
    Container(String),
    Service(String),
}

/// Strategy object executing one job kind.
///
/// `run` must open the execution's streams before any external I/O and
/// classify failures: configuration problems surface as `ConfigInvalid`,
/// everything else as runtime failures. `cancel` is the prompt teardown
/// hook invoked on timeout or shutdown; process-backed drivers rely on the
/// dropped future killing the child, Docker-backed drivers stop the
/// resource recorded on the context.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn run(&self, ctx: &Context) -> Result<(), JobError>;

    async fn cancel(&self, ctx: &Context) {
        let Some(docker) = ctx.docker.clone() else {
            return;
        };
        cancel_docker_target(&docker, ctx.cancel_target()).await;
    }

    fn needs_docker(&self) -> bool {
        false
    }
}

/// Build the driver for a job definition. Validation happens here so an
/// ill-formed job fails registration instead of its first fire.
pub fn build(config: &JobConfig, docker: Option<&Docker>) -> Result<Arc<dyn Backend>, JobError> {
    config.validate()?;
    if config.kind.needs_docker() && docker.is_none() {
        return Err(JobError::ConfigInvalid(format!(
            "{} job {:?} requires a docker connection",
            config.kind.as_str(),
            config.name
        )));
    }
    Ok(match config.kind {
        JobKind::Local => Arc::new(LocalBackend::from_config(config)?),
        JobKind::Exec => Arc::new(ExecBackend::from_config(config)?),
        JobKind::Run => Arc::new(RunBackend::from_config(config)?),
        JobKind::ServiceRun => Arc::new(ServiceRunBackend::from_config(config)?),
        JobKind::Compose => Arc::new(ComposeBackend::from_config(config)?),
    })
}

/// Quote-aware argv split shared by every backend that takes a command
/// string; `sh -c "echo hello world"` stays three tokens.
pub fn split_command(command: &str) -> Result<Vec<String>, JobError> {
    match shlex::split(command) {
        Some(argv) if !argv.is_empty() => Ok(argv),
        _ => Err(JobError::ConfigInvalid(format!(
            "command is empty or unparsable: {command:?}"
        ))),
    }
}

/// Split `KEY=VALUE` environment entries, warning on malformed ones.
pub(crate) fn parse_env(entries: &[String]) -> Vec<(String, String)> {
    entries
        .iter()
        .filter_map(|entry| match entry.split_once('=') {
            Some((key, value)) => Some((key.to_string(), value.to_string())),
            None => {
                warn!(entry = %entry, "ignoring malformed environment entry");
                None
            }
        })
        .collect()
}

async fn cancel_docker_target(docker: &Docker, target: Option<CancelTarget>) {
    use bollard::query_parameters::StopContainerOptions;

    match target {
        Some(CancelTarget::Container(id)) => {
            if let Err(e) = docker
                .stop_container(&id, Some(StopContainerOptions { t: Some(1), ..Default::default() }))
                .await
            {
                warn!(container = %id, error = %e, "failed to stop container on cancel");
            }
        }
        Some(CancelTarget::Service(name)) => {
            if let Err(e) = docker.delete_service(&name).await {
                warn!(service = %name, error = %e, "failed to remove service on cancel");
            }
        }
        None => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::JobConfig;

    #[test]
    fn quoted_commands_survive_the_split() {
        let argv = split_command("sh -c \"echo hello world\"").unwrap();
        assert_eq!(argv, vec!["sh", "-c", "echo hello world"]);
    }

    #[test]
    fn empty_command_is_a_config_error() {
        assert!(matches!(
            split_command(""),
            Err(JobError::ConfigInvalid(_))
        ));
        assert!(matches!(
            split_command("   "),
            Err(JobError::ConfigInvalid(_))
        ));
        // Unbalanced quoting is unparsable, not a silent one-token argv.
        assert!(matches!(
            split_command("echo \"unterminated"),
            Err(JobError::ConfigInvalid(_))
        ));
    }

    #[test]
    fn env_entries_are_split_on_first_equals() {
        let parsed = parse_env(&[
            "A=1".to_string(),
            "B=x=y".to_string(),
            "garbage".to_string(),
        ]);
        assert_eq!(
            parsed,
            vec![
                ("A".to_string(), "1".to_string()),
                ("B".to_string(), "x=y".to_string())
            ]
        );
    }

    #[test]
    fn docker_kinds_require_a_client() {
        let config = JobConfig {
            name: "x".into(),
            kind: JobKind::Exec,
            schedule: "@hourly".into(),
            command: "true".into(),
            container: Some("app".into()),
            ..JobConfig::default()
        };
        assert!(matches!(
            build(&config, None),
            Err(JobError::ConfigInvalid(_))
        ));
    }

    #[test]
    fn local_build_fails_on_empty_command() {
        let config = JobConfig {
            name: "x".into(),
            kind: JobKind::Local,
            schedule: "@hourly".into(),
            command: "".into(),
            ..JobConfig::default()
        };
        assert!(matches!(
            build(&config, None),
            Err(JobError::ConfigInvalid(_))
        ));
    }
}
