use std::collections::HashMap;
use std::str::FromStr;

use bollard::models::ContainerSummary;
use regex::Regex;
use tracing::warn;

use crate::config::{JobConfig, JobKind, OverlapPolicy};
use crate::error::JobError;

/// `key=value` container label filter applied before any job labels are
/// read.
#[derive(Debug, Clone)]
pub struct LabelSelector {
    pub key: String,
    pub value: String,
}

impl FromStr for LabelSelector {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut split = s.splitn(2, '=');
        let key = split
            .next()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| JobError::ConfigInvalid(format!("invalid label selector: {s}")))?;
        let value = split
            .next()
            .ok_or_else(|| JobError::ConfigInvalid(format!("invalid label selector: {s}")))?;
        Ok(LabelSelector {
            key: key.to_string(),
            value: value.to_string(),
        })
    }
}

/// Extract the desired job set from a container listing.
///
/// Label grammar: `<prefix>.job-<kind>.<name>.<field>` on containers that
/// also carry `<prefix>.enabled=true`. Several prefixes are accepted so
/// existing `ofelia`/`chadburn` deployments keep working unchanged.
///
/// Exec jobs target the container that declares them, and their effective
/// name is `<container>.<declared>` so the same label set on two containers
/// cannot collide in the registry.
pub fn jobs_from_containers(
    containers: &[ContainerSummary],
    selector: Option<&LabelSelector>,
    prefixes: &[String],
) -> HashMap<String, JobConfig> {
    let mut jobs = HashMap::new();

    for container in containers {
        let labels = container.labels.clone().unwrap_or_default();

        if let Some(selector) = selector {
            let passes = labels
                .iter()
                .any(|(k, v)| *k == selector.key && *v == selector.value);
            if !passes {
                continue;
            }
        }

        let Some(prefix) = prefixes.iter().find(|prefix| {
            labels
                .get(&format!("{prefix}.enabled"))
                .map(|v| v == "true")
                .unwrap_or(false)
        }) else {
            continue;
        };

        let container_id = container.id.clone().unwrap_or_default();
        let container_name = container
            .names
            .as_ref()
            .and_then(|names| names.first())
            .map(|name| name.trim_start_matches('/').to_string())
            .unwrap_or_else(|| container_id.chars().take(12).collect());

        for (name, config) in jobs_from_labels(&labels, prefix, &container_name) {
            jobs.insert(name, config);
        }
    }

    jobs
}

/// Parse one container's label map. Split out from the listing walk so it
/// is testable without a Docker client.
pub fn jobs_from_labels(
    labels: &HashMap<String, String>,
    prefix: &str,
    container_name: &str,
) -> HashMap<String, JobConfig> {
    let re = Regex::new(&format!(
        r"^{}\.job-(exec|run|local|service-run|compose)\.([^.]+)\.([a-z-]+)$",
        regex::escape(prefix)
    ))
    .expect("valid label regex");

    let mut by_job: HashMap<(JobKind, String), HashMap<String, String>> = HashMap::new();
    for (key, value) in labels {
        let Some(caps) = re.captures(key) else {
            continue;
        };
        let kind = match &caps[1] {
            "exec" => JobKind::Exec,
            "run" => JobKind::Run,
            "local" => JobKind::Local,
            "service-run" => JobKind::ServiceRun,
            "compose" => JobKind::Compose,
            _ => continue,
        };
        by_job
            .entry((kind, caps[2].to_string()))
            .or_default()
            .insert(caps[3].to_string(), value.clone());
    }

    let mut jobs = HashMap::new();
    for ((kind, declared_name), fields) in by_job {
        let mut config = JobConfig {
            kind,
            ..JobConfig::default()
        };
        config.name = match kind {
            JobKind::Exec => format!("{container_name}.{declared_name}"),
            _ => declared_name.clone(),
        };
        if kind == JobKind::Exec {
            config.container = Some(container_name.to_string());
        }

        if let Err(e) = apply_fields(&mut config, &fields) {
            warn!(container = %container_name, job = %declared_name, error = %e, "ignoring job with bad label");
            continue;
        }
        if config.schedule.is_empty() {
            warn!(container = %container_name, job = %declared_name, "missing schedule label");
            continue;
        }
        jobs.insert(config.name.clone(), config);
    }
    jobs
}

fn apply_fields(
    config: &mut JobConfig,
    fields: &HashMap<String, String>,
) -> Result<(), JobError> {
    for (field, value) in fields {
        match field.as_str() {
            "schedule" => config.schedule = value.clone(),
            "command" => config.command = value.clone(),
            "image" => config.image = Some(value.clone()),
            "container" => {
                if config.kind != JobKind::Exec {
                    config.container = Some(value.clone());
                }
            }
            "user" => config.user = Some(value.clone()),
            "network" => config.network = Some(value.clone()),
            "dir" => config.dir = Some(value.clone()),
            "environment" => {
                config.environment = value
                    .split(',')
                    .map(|entry| entry.trim().to_string())
                    .filter(|entry| !entry.is_empty())
                    .collect();
            }
            "tty" => config.tty = parse_bool(field, value)?,
            "delete" => config.delete = parse_bool(field, value)?,
            "file" => config.file = Some(value.clone()),
            "service" => config.service = Some(value.clone()),
            "no-overlap" => {
                if parse_bool(field, value)? {
                    config.overlap = OverlapPolicy::Skip;
                }
            }
            "overlap" => {
                config.overlap = match value.trim() {
                    "allow" => OverlapPolicy::Allow,
                    "skip" | "queue-none" => OverlapPolicy::Skip,
                    other => {
                        return Err(JobError::ConfigInvalid(format!(
                            "unknown overlap policy {other:?}"
                        )));
                    }
                };
            }
            "max-runtime" => {
                config.max_runtime = Some(humantime::parse_duration(value).map_err(|e| {
                    JobError::ConfigInvalid(format!("bad max-runtime {value:?}: {e}"))
                })?);
            }
            "history-limit" => {
                config.history_limit = value.trim().parse().map_err(|_| {
                    JobError::ConfigInvalid(format!("bad history-limit {value:?}"))
                })?;
            }
            "enabled" => config.enabled = parse_bool(field, value)?,
            "save-only-on-error" => config.save_only_on_error = Some(parse_bool(field, value)?),
            "webhook" => config.webhook = Some(value.clone()),
            "slack-webhook" => config.slack_webhook = Some(value.clone()),
            _ => {}
        }
    }
    Ok(())
}

fn parse_bool(field: &str, value: &str) -> Result<bool, JobError> {
    match value.trim() {
        "true" => Ok(true),
        "false" => Ok(false),
        other => Err(JobError::ConfigInvalid(format!(
            "bad boolean for {field}: {other:?}"
        ))),
    }
}
