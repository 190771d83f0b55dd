mod cli;

use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use bollard::Docker;
use coxswain::config::{self, LoadedConfig, Origin};
use coxswain::discovery::{Discovery, DiscoveryOptions};
use coxswain::schedule::SystemClock;
use coxswain::scheduler::Scheduler;
use tracing::{error, info, warn};

use crate::cli::{Command, DaemonArgs, ValidateArgs};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = cli::Cli::parse();
    match cli.command {
        Command::Daemon(args) => {
            let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel(1);
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
            let mut sigint =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())?;

            tokio::spawn(async move {
                tokio::select! {
                    _ = sigterm.recv() => info!("received SIGTERM"),
                    _ = sigint.recv() => info!("received SIGINT"),
                }
                shutdown_tx.send(()).ok();
            });

            daemon(args, shutdown_rx).await
        }
        Command::Validate(args) => validate(args),
    }
}

async fn daemon(
    args: DaemonArgs,
    mut shutdown: tokio::sync::broadcast::Receiver<()>,
) -> Result<()> {
    let loaded = match &args.config {
        Some(path) => config::load_file(path)?,
        None => LoadedConfig::default(),
    };

    let docker = if args.no_docker {
        None
    } else {
        match connect_docker(&args.docker_host).await {
            Ok(docker) => Some(docker),
            Err(e) => {
                let required = loaded.jobs.values().any(|job| job.kind.needs_docker());
                if required {
                    return Err(e.context("configured jobs require a docker connection"));
                }
                warn!(error = %e, "docker unreachable, container jobs and label discovery disabled");
                None
            }
        }
    };

    let selector = args
        .container_label_selector
        .as_deref()
        .map(|raw| raw.parse())
        .transpose()
        .context("invalid container label selector")?;

    let scheduler = Scheduler::new(loaded.global.clone(), docker.clone(), Arc::new(SystemClock));
    scheduler.reconcile(loaded.jobs, Origin::File).await;
    scheduler.start()?;

    let discovery = Discovery::new(
        docker,
        scheduler.clone(),
        loaded.global,
        DiscoveryOptions {
            label_prefixes: args.label_prefixes,
            selector,
            config_path: args.config,
        },
    );
    // Pick up label jobs immediately instead of waiting out the first poll,
    // then attach any persisted history to the now-complete job set.
    discovery.container_pass().await;
    scheduler.restore_history();
    discovery.spawn();

    if scheduler.jobs().is_empty() && scheduler.disabled_jobs().is_empty() {
        warn!("no jobs registered; waiting for config or label changes");
    }

    shutdown.recv().await.ok();
    info!("graceful shutdown initiated");
    scheduler.stop().await;
    Ok(())
}

fn validate(args: ValidateArgs) -> Result<()> {
    let loaded = config::load_file(&args.config)?;
    let mut invalid = 0usize;
    for (name, job) in &loaded.jobs {
        match job.validate() {
            Ok(()) => info!(job = %name, kind = job.kind.as_str(), schedule = %job.schedule, "ok"),
            Err(e) => {
                invalid += 1;
                error!(job = %name, error = %e, "invalid");
            }
        }
    }
    if invalid > 0 {
        return Err(anyhow!("{invalid} invalid job definition(s)"));
    }
    info!(jobs = loaded.jobs.len(), "config file is valid");
    Ok(())
}

async fn connect_docker(docker_host: &str) -> Result<Docker> {
    let docker = if let Some(path) = docker_host.strip_prefix("unix://") {
        Docker::connect_with_unix(path, 60, bollard::API_DEFAULT_VERSION)?
    } else if docker_host.starts_with("tcp://") {
        // Let bollard read TLS env vars (DOCKER_TLS_VERIFY, DOCKER_CERT_PATH):
        Docker::connect_with_local_defaults()?
    } else {
        return Err(anyhow!("Unsupported DOCKER_HOST: {}", docker_host));
    };
    docker.ping().await.context("docker ping")?;
    Ok(docker)
}

fn init_tracing() {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into());
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}
