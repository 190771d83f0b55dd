use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context as _;
use serde::{Deserialize, Serialize};

use crate::error::JobError;
use crate::schedule::JobSchedule;

/// Where a job definition came from. Reconciliation is scoped per origin so
/// a label sweep never disturbs file- or API-managed jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Origin {
    File,
    Label,
    Api,
}

impl std::fmt::Display for Origin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Origin::File => f.write_str("file"),
            Origin::Label => f.write_str("label"),
            Origin::Api => f.write_str("api"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobKind {
    #[default]
    Local,
    Exec,
    Run,
    ServiceRun,
    Compose,
}

impl JobKind {
    pub fn needs_docker(&self) -> bool {
        matches!(self, JobKind::Exec | JobKind::Run | JobKind::ServiceRun)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Local => "local",
            JobKind::Exec => "exec",
            JobKind::Run => "run",
            JobKind::ServiceRun => "service-run",
            JobKind::Compose => "compose",
        }
    }
}

/// What to do when a job fires while a previous execution is still running.
/// `queue-none` is accepted as a config spelling but the engine never queues
/// a denied fire, so it behaves as `skip`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OverlapPolicy {
    #[default]
    Allow,
    #[serde(alias = "queue-none")]
    Skip,
}

fn default_true() -> bool {
    true
}

fn default_history_limit() -> usize {
    10
}

/// Origin-agnostic job definition, produced by the config-file and label
/// parsers and consumed by the registry. Field-by-field equality is the
/// change detector during reconciliation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct JobConfig {
    /// Filled from the table key / label path, not from the body.
    #[serde(skip)]
    pub name: String,
    #[serde(skip)]
    pub kind: JobKind,

    pub schedule: String,
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub container: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub network: Option<String>,
    #[serde(default)]
    pub dir: Option<String>,
    #[serde(default)]
    pub environment: Vec<String>,
    #[serde(default)]
    pub tty: bool,
    /// Remove the ephemeral container after a `run` job finishes.
    #[serde(default = "default_true")]
    pub delete: bool,
    /// Compose file for `compose` jobs.
    #[serde(default)]
    pub file: Option<String>,
    /// Compose service for `compose` jobs.
    #[serde(default)]
    pub service: Option<String>,

    #[serde(default)]
    pub overlap: OverlapPolicy,
    #[serde(default, with = "opt_duration")]
    pub max_runtime: Option<Duration>,
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    #[serde(default = "default_true")]
    pub enabled: bool,

    // Per-job middleware overrides; `None` falls back to [global].
    #[serde(default)]
    pub save_folder: Option<PathBuf>,
    #[serde(default)]
    pub save_only_on_error: Option<bool>,
    #[serde(default)]
    pub webhook: Option<String>,
    #[serde(default)]
    pub slack_webhook: Option<String>,
}

impl Default for JobConfig {
    fn default() -> JobConfig {
        JobConfig {
            name: String::new(),
            kind: JobKind::default(),
            schedule: String::new(),
            command: String::new(),
            image: None,
            container: None,
            user: None,
            network: None,
            dir: None,
            environment: Vec::new(),
            tty: false,
            delete: true,
            file: None,
            service: None,
            overlap: OverlapPolicy::default(),
            max_runtime: None,
            history_limit: default_history_limit(),
            enabled: true,
            save_folder: None,
            save_only_on_error: None,
            webhook: None,
            slack_webhook: None,
        }
    }
}

impl JobConfig {
    /// Static validation performed at registration time. A failure here
    /// blocks this entry only; other jobs in the same reconcile pass are
    /// unaffected.
    pub fn validate(&self) -> Result<(), JobError> {
        if self.name.is_empty() {
            return Err(JobError::ConfigInvalid("job has no name".into()));
        }
        JobSchedule::parse(&self.schedule)?;
        match self.kind {
            JobKind::Local | JobKind::Exec => {
                if self.command.trim().is_empty() {
                    return Err(JobError::ConfigInvalid(format!(
                        "{} job {:?} has an empty command",
                        self.kind.as_str(),
                        self.name
                    )));
                }
            }
            JobKind::Run | JobKind::ServiceRun => {
                if self.image.as_deref().unwrap_or("").is_empty() {
                    return Err(JobError::ConfigInvalid(format!(
                        "{} job {:?} has no image",
                        self.kind.as_str(),
                        self.name
                    )));
                }
            }
            JobKind::Compose => {
                if self.service.as_deref().unwrap_or("").is_empty() {
                    return Err(JobError::ConfigInvalid(format!(
                        "compose job {:?} has no service",
                        self.name
                    )));
                }
            }
        }
        if self.kind == JobKind::Exec && self.container.as_deref().unwrap_or("").is_empty() {
            return Err(JobError::ConfigInvalid(format!(
                "exec job {:?} has no target container",
                self.name
            )));
        }
        Ok(())
    }

    /// Whether switching from `old` to `self` touches the schedule or the
    /// backend identity. If not, the registry may swap the job atomically
    /// without unscheduling it (the change affects only middleware wiring).
    pub fn requires_reschedule(&self, old: &JobConfig) -> bool {
        self.schedule != old.schedule
            || self.kind != old.kind
            || self.command != old.command
            || self.image != old.image
            || self.container != old.container
            || self.user != old.user
            || self.network != old.network
            || self.dir != old.dir
            || self.environment != old.environment
            || self.tty != old.tty
            || self.delete != old.delete
            || self.file != old.file
            || self.service != old.service
            || self.max_runtime != old.max_runtime
    }
}

/// Daemon-wide settings from the `[global]` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct GlobalConfig {
    /// Cap on simultaneous executions across all jobs; 0 means unbounded.
    pub max_concurrent: usize,
    #[serde(with = "duration_str")]
    pub shutdown_timeout: Duration,
    pub save_folder: Option<PathBuf>,
    pub save_only_on_error: bool,
    pub webhook: Option<String>,
    pub slack_webhook: Option<String>,
    #[serde(with = "duration_str")]
    pub dedup_cooldown: Duration,
    /// 0 disables container polling.
    #[serde(with = "duration_str")]
    pub docker_poll_interval: Duration,
    /// 0 disables config-file polling.
    #[serde(with = "duration_str")]
    pub config_poll_interval: Duration,
    #[serde(with = "duration_str")]
    pub event_fallback_interval: Duration,
    #[serde(with = "duration_str")]
    pub restore_max_age: Duration,
    pub removed_ring_size: usize,
    pub docker_events: bool,
}

impl Default for GlobalConfig {
    fn default() -> GlobalConfig {
        GlobalConfig {
            max_concurrent: 0,
            shutdown_timeout: Duration::from_secs(30),
            save_folder: None,
            save_only_on_error: false,
            webhook: None,
            slack_webhook: None,
            dedup_cooldown: Duration::from_secs(15 * 60),
            docker_poll_interval: Duration::from_secs(10),
            config_poll_interval: Duration::from_secs(10),
            event_fallback_interval: Duration::from_secs(30),
            restore_max_age: Duration::from_secs(24 * 3600),
            removed_ring_size: 10,
            docker_events: true,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct ConfigFile {
    #[serde(default)]
    global: GlobalConfig,
    #[serde(default)]
    job_local: HashMap<String, JobConfig>,
    #[serde(default)]
    job_exec: HashMap<String, JobConfig>,
    #[serde(default)]
    job_run: HashMap<String, JobConfig>,
    #[serde(default)]
    job_service_run: HashMap<String, JobConfig>,
    #[serde(default)]
    job_compose: HashMap<String, JobConfig>,
}

#[derive(Debug, Default)]
pub struct LoadedConfig {
    pub global: GlobalConfig,
    pub jobs: HashMap<String, JobConfig>,
}

/// Parse the daemon's TOML config file. Jobs are returned unvalidated; the
/// registry validates each entry when it is added so one bad job cannot take
/// the rest of the file down.
pub fn load_file(path: &Path) -> anyhow::Result<LoadedConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("read config file {}", path.display()))?;
    let file: ConfigFile = toml::from_str(&raw)
        .with_context(|| format!("parse config file {}", path.display()))?;

    let mut jobs = HashMap::new();
    let tables = [
        (JobKind::Local, file.job_local),
        (JobKind::Exec, file.job_exec),
        (JobKind::Run, file.job_run),
        (JobKind::ServiceRun, file.job_service_run),
        (JobKind::Compose, file.job_compose),
    ];
    for (kind, table) in tables {
        for (name, mut cfg) in table {
            cfg.name = name.clone();
            cfg.kind = kind;
            if jobs.insert(name.clone(), cfg).is_some() {
                anyhow::bail!("duplicate job name {name:?} across job tables");
            }
        }
    }

    Ok(LoadedConfig {
        global: file.global,
        jobs,
    })
}

/// Serde adapter for humantime-formatted duration strings ("10s", "1h 30m").
mod duration_str {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&humantime::format_duration(*d).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(de)?;
        if raw.trim() == "0" {
            return Ok(Duration::ZERO);
        }
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

mod opt_duration {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Option<Duration>, ser: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => ser.serialize_some(&humantime::format_duration(*d).to_string()),
            None => ser.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Option<Duration>, D::Error> {
        let raw = Option::<String>::deserialize(de)?;
        match raw {
            None => Ok(None),
            Some(raw) => humantime::parse_duration(&raw)
                .map(Some)
                .map_err(serde::de::Error::custom),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_full_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("coxswain.toml");
        std::fs::write(
            &path,
            r#"
[global]
max-concurrent = 4
dedup-cooldown = "5m"
save-folder = "/var/log/coxswain"
docker-poll-interval = "30s"

[job-local.cleanup]
schedule = "@every 1h"
command = "find /tmp -mtime +1 -delete"
max-runtime = "10m"

[job-exec.migrate]
schedule = "0 3 * * *"
command = "bin/migrate --all"
container = "app"
overlap = "skip"

[job-run.report]
schedule = "@daily"
image = "reports:latest"
command = "generate --format pdf"
enabled = false
"#,
        )
        .unwrap();

        let loaded = load_file(&path).unwrap();
        assert_eq!(loaded.global.max_concurrent, 4);
        assert_eq!(loaded.global.dedup_cooldown, Duration::from_secs(300));
        assert_eq!(loaded.global.docker_poll_interval, Duration::from_secs(30));
        assert_eq!(loaded.jobs.len(), 3);

        let cleanup = &loaded.jobs["cleanup"];
        assert_eq!(cleanup.kind, JobKind::Local);
        assert_eq!(cleanup.max_runtime, Some(Duration::from_secs(600)));
        assert!(cleanup.enabled);
        assert!(cleanup.validate().is_ok());

        let migrate = &loaded.jobs["migrate"];
        assert_eq!(migrate.kind, JobKind::Exec);
        assert_eq!(migrate.overlap, OverlapPolicy::Skip);
        assert_eq!(migrate.container.as_deref(), Some("app"));

        let report = &loaded.jobs["report"];
        assert_eq!(report.kind, JobKind::Run);
        assert!(!report.enabled);
    }

    #[test]
    fn duplicate_names_across_tables_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("coxswain.toml");
        std::fs::write(
            &path,
            r#"
[job-local.x]
schedule = "@hourly"
command = "true"

[job-run.x]
schedule = "@hourly"
image = "busybox"
"#,
        )
        .unwrap();
        assert!(load_file(&path).is_err());
    }

    #[test]
    fn queue_none_maps_to_skip() {
        let cfg: JobConfig =
            toml::from_str("schedule = \"@hourly\"\ncommand = \"true\"\noverlap = \"queue-none\"")
                .unwrap();
        assert_eq!(cfg.overlap, OverlapPolicy::Skip);
    }

    #[test]
    fn validate_rejects_empty_command_for_local() {
        let cfg = JobConfig {
            name: "x".into(),
            kind: JobKind::Local,
            schedule: "@hourly".into(),
            command: "  ".into(),
            ..JobConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(JobError::ConfigInvalid(_))));
    }

    #[test]
    fn validate_rejects_bad_schedule() {
        let cfg = JobConfig {
            name: "x".into(),
            kind: JobKind::Local,
            schedule: "every now and then".into(),
            command: "true".into(),
            ..JobConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(JobError::ConfigInvalid(_))));
    }

    #[test]
    fn validate_requires_container_for_exec() {
        let cfg = JobConfig {
            name: "x".into(),
            kind: JobKind::Exec,
            schedule: "@hourly".into(),
            command: "true".into(),
            ..JobConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(JobError::ConfigInvalid(_))));
    }

    #[test]
    fn middleware_only_changes_do_not_reschedule() {
        let a = JobConfig {
            name: "x".into(),
            kind: JobKind::Local,
            schedule: "@hourly".into(),
            command: "true".into(),
            ..JobConfig::default()
        };
        let mut b = a.clone();
        b.webhook = Some("https://hooks.example/x".into());
        b.save_only_on_error = Some(true);
        b.history_limit = 50;
        assert!(!b.requires_reschedule(&a));
        assert_ne!(a, b);

        let mut c = a.clone();
        c.schedule = "@every 5m".into();
        assert!(c.requires_reschedule(&a));

        let mut d = a.clone();
        d.command = "false".into();
        assert!(d.requires_reschedule(&a));
    }
}
