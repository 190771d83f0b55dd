use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;

use crate::backend::{Backend, parse_env, split_command};
use crate::config::JobConfig;
use crate::error::JobError;
use crate::execution::StreamBuffer;
use crate::middleware::Context;

/// Runs a command as a child process of the daemon.
pub struct LocalBackend {
    argv: Vec<String>,
    dir: Option<String>,
    env: Vec<(String, String)>,
}

impl LocalBackend {
    pub fn from_config(config: &JobConfig) -> Result<LocalBackend, JobError> {
        Ok(LocalBackend {
            argv: split_command(&config.command)?,
            dir: config.dir.clone(),
            env: parse_env(&config.environment),
        })
    }
}

#[async_trait]
impl Backend for LocalBackend {
    async fn run(&self, ctx: &Context) -> Result<(), JobError> {
        run_process(&self.argv, self.dir.as_deref(), &self.env, ctx).await
    }

    async fn cancel(&self, _ctx: &Context) {
        // The dropped run future kills the child (kill_on_drop).
    }
}

/// Spawn an argv, stream its output into the execution buffers and map the
/// exit status. Shared with the compose driver.
pub(crate) async fn run_process(
    argv: &[String],
    dir: Option<&str>,
    env: &[(String, String)],
    ctx: &Context,
) -> Result<(), JobError> {
    let mut cmd = tokio::process::Command::new(&argv[0]);
    cmd.args(&argv[1..])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = dir {
        cmd.current_dir(dir);
    }
    for (key, value) in env {
        cmd.env(key, value);
    }

    let mut child = cmd.spawn()?;
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    tokio::join!(
        pump(stdout, &ctx.execution.stdout),
        pump(stderr, &ctx.execution.stderr),
    );

    let status = child.wait().await?;
    if status.success() {
        return Ok(());
    }
    match status.code() {
        Some(code) => Err(JobError::NonZeroExit(code as i64)),
        None => Err(JobError::Runtime("process terminated by signal".into())),
    }
}

async fn pump<R: tokio::io::AsyncRead + Unpin>(reader: Option<R>, buffer: &StreamBuffer) {
    let Some(mut reader) = reader else {
        return;
    };
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => buffer.write(&chunk[..n]),
        }
    }
}
