use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

use bollard::Docker;
use bollard::query_parameters::{EventsOptions, ListContainersOptions};
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{self, GlobalConfig, Origin};
use crate::labels::{self, LabelSelector};
use crate::scheduler::Scheduler;

/// What the discovery loop watches.
#[derive(Debug, Default, Clone)]
pub struct DiscoveryOptions {
    pub label_prefixes: Vec<String>,
    pub selector: Option<LabelSelector>,
    pub config_path: Option<PathBuf>,
}

/// Keeps the registry in sync with the outside world: polls the container
/// list and the config file, and reacts to Docker lifecycle events.
///
/// Reconciliation runs on discovery's own tasks and never blocks
/// scheduling; event-driven passes are debounced to at most one in flight.
pub struct Discovery {
    docker: Option<Docker>,
    scheduler: Scheduler,
    global: GlobalConfig,
    opts: DiscoveryOptions,
    /// Last seen config file mtime; changes gate a reload.
    config_watermark: Mutex<Option<SystemTime>>,
    pass_gate: tokio::sync::Mutex<()>,
}

impl Discovery {
    pub fn new(
        docker: Option<Docker>,
        scheduler: Scheduler,
        global: GlobalConfig,
        opts: DiscoveryOptions,
    ) -> Arc<Discovery> {
        // The file was already loaded at startup; only later edits count.
        let watermark = opts
            .config_path
            .as_ref()
            .and_then(|path| std::fs::metadata(path).and_then(|m| m.modified()).ok());
        Arc::new(Discovery {
            docker,
            scheduler,
            global,
            opts,
            config_watermark: Mutex::new(watermark),
            pass_gate: tokio::sync::Mutex::new(()),
        })
    }

    /// Spawn the polling and event tasks. They end when the scheduler's
    /// shutdown signal fires.
    pub fn spawn(self: Arc<Discovery>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        if self.docker.is_some() && !self.global.docker_poll_interval.is_zero() {
            let this = self.clone();
            handles.push(tokio::spawn(async move {
                let mut shutdown = this.scheduler.subscribe_shutdown();
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep(this.global.docker_poll_interval) => {}
                        _ = shutdown.recv() => break,
                    }
                    this.container_pass().await;
                }
            }));
        }

        if self.opts.config_path.is_some() && !self.global.config_poll_interval.is_zero() {
            let this = self.clone();
            handles.push(tokio::spawn(async move {
                let mut shutdown = this.scheduler.subscribe_shutdown();
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep(this.global.config_poll_interval) => {}
                        _ = shutdown.recv() => break,
                    }
                    this.config_pass().await;
                }
            }));
        }

        if self.docker.is_some() && self.global.docker_events {
            let this = self.clone();
            handles.push(tokio::spawn(async move {
                this.events_loop().await;
            }));
        }

        handles
    }

    /// List containers, derive the desired label-job set and reconcile it.
    pub async fn container_pass(&self) {
        let Some(docker) = &self.docker else {
            return;
        };
        // At most one reconciliation pass in flight.
        let Ok(_guard) = self.pass_gate.try_lock() else {
            debug!("reconciliation already in flight, skipping pass");
            return;
        };

        let containers = match docker
            .list_containers(Some(ListContainersOptions {
                all: true,
                ..Default::default()
            }))
            .await
        {
            Ok(containers) => containers,
            Err(e) => {
                warn!(error = %e, "failed to list containers");
                return;
            }
        };

        let desired = labels::jobs_from_containers(
            &containers,
            self.opts.selector.as_ref(),
            &self.opts.label_prefixes,
        );
        self.scheduler.reconcile(desired, Origin::Label).await;
    }

    /// Re-stat the config file; on mtime change, re-parse and reconcile the
    /// file-origin jobs.
    pub async fn config_pass(&self) {
        let Some(path) = &self.opts.config_path else {
            return;
        };
        let mtime = match std::fs::metadata(path).and_then(|m| m.modified()) {
            Ok(mtime) => mtime,
            Err(e) => {
                debug!(file = %path.display(), error = %e, "config file not statable");
                return;
            }
        };
        if *self.config_watermark.lock() == Some(mtime) {
            return;
        }
        // Advance the watermark even when the new content is broken, so a
        // bad edit warns once instead of every poll tick.
        *self.config_watermark.lock() = Some(mtime);

        match config::load_file(path) {
            Ok(loaded) => {
                info!(file = %path.display(), jobs = loaded.jobs.len(), "config file changed, reconciling");
                self.scheduler.reconcile(loaded.jobs, Origin::File).await;
            }
            Err(e) => warn!(file = %path.display(), error = %e, "failed to reload config file"),
        }
    }

    /// Subscribe to container lifecycle events and reconcile on each. On
    /// stream failure, fall back to sleeping the fallback interval before
    /// resubscribing; the poll loop keeps running either way.
    async fn events_loop(&self) {
        let Some(docker) = self.docker.clone() else {
            return;
        };
        let mut shutdown = self.scheduler.subscribe_shutdown();

        loop {
            let filters = HashMap::from([
                ("type".to_string(), vec!["container".to_string()]),
                (
                    "event".to_string(),
                    vec![
                        "start".to_string(),
                        "die".to_string(),
                        "destroy".to_string(),
                        "update".to_string(),
                    ],
                ),
            ]);
            let mut events = docker.events(Some(EventsOptions {
                filters: Some(filters),
                ..Default::default()
            }));

            loop {
                tokio::select! {
                    _ = shutdown.recv() => return,
                    event = events.next() => match event {
                        Some(Ok(event)) => {
                            debug!(action = ?event.action, "container event, reconciling");
                            self.container_pass().await;
                        }
                        Some(Err(e)) => {
                            warn!(error = %e, "docker event stream error, falling back to polling");
                            break;
                        }
                        None => {
                            warn!("docker event stream closed, falling back to polling");
                            break;
                        }
                    }
                }
            }

            tokio::select! {
                _ = shutdown.recv() => return,
                _ = tokio::time::sleep(self.global.event_fallback_interval) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::SystemClock;
    use std::time::Duration;

    fn scheduler() -> Scheduler {
        Scheduler::new(GlobalConfig::default(), None, Arc::new(SystemClock))
    }

    fn write_config(path: &std::path::Path, schedule: &str) {
        std::fs::write(
            path,
            format!("[job-local.k]\nschedule = \"{schedule}\"\ncommand = \"true\"\n"),
        )
        .unwrap();
    }

    #[tokio::test]
    async fn config_pass_reconciles_only_on_mtime_change() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("coxswain.toml");
        write_config(&path, "0 * * * *");

        let scheduler = scheduler();
        let discovery = Discovery::new(
            None,
            scheduler.clone(),
            GlobalConfig::default(),
            DiscoveryOptions {
                config_path: Some(path.clone()),
                ..DiscoveryOptions::default()
            },
        );

        // Startup watermark covers the current content: no reconcile yet.
        discovery.config_pass().await;
        assert!(scheduler.job("k").is_none());

        // A later edit moves the mtime and triggers a reload.
        write_config(&path, "*/5 * * * *");
        let file = std::fs::File::options().write(true).open(&path).unwrap();
        file.set_modified(SystemTime::now() + Duration::from_secs(2))
            .unwrap();

        discovery.config_pass().await;
        let job = scheduler.job("k").unwrap();
        assert_eq!(job.config().schedule, "*/5 * * * *");
    }

    #[tokio::test]
    async fn broken_edit_warns_once_and_keeps_old_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("coxswain.toml");
        write_config(&path, "@every 1h");

        let scheduler = scheduler();
        scheduler
            .reconcile(
                config::load_file(&path).unwrap().jobs,
                Origin::File,
            )
            .await;
        assert!(scheduler.job("k").is_some());

        let discovery = Discovery::new(
            None,
            scheduler.clone(),
            GlobalConfig::default(),
            DiscoveryOptions {
                config_path: Some(path.clone()),
                ..DiscoveryOptions::default()
            },
        );

        std::fs::write(&path, "[job-local.k\nnot toml").unwrap();
        let file = std::fs::File::options().write(true).open(&path).unwrap();
        file.set_modified(SystemTime::now() + Duration::from_secs(2))
            .unwrap();

        discovery.config_pass().await;
        // Old definition stays in force.
        assert!(scheduler.job("k").is_some());
    }

    #[tokio::test]
    async fn passes_without_docker_are_no_ops() {
        let discovery = Discovery::new(
            None,
            scheduler(),
            GlobalConfig::default(),
            DiscoveryOptions::default(),
        );
        discovery.container_pass().await;
        assert!(discovery.spawn().is_empty());
    }
}
