use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing::warn;

use crate::middleware::{Context, Middleware};

const NOTIFY_TIMEOUT: Duration = Duration::from_secs(10);

/// POSTs a JSON summary of every terminal execution to a configured
/// endpoint. Failed-run notifications go through the shared dedup, so a
/// flapping job does not spam the receiver.
pub struct WebhookNotifier {
    url: String,
    client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(url: String) -> WebhookNotifier {
        WebhookNotifier {
            url,
            client: client(),
        }
    }
}

#[async_trait]
impl Middleware for WebhookNotifier {
    async fn after(&self, ctx: &Context) {
        if !ctx.should_notify() {
            return;
        }
        let summary = ctx.execution.summary();
        let payload = json!({
            "job": ctx.job.name(),
            "kind": ctx.job.config().kind.as_str(),
            "command": ctx.job.command(),
            "execution": summary,
        });
        if let Err(e) = self.client.post(&self.url).json(&payload).send().await {
            // Transport failures never change the run outcome.
            warn!(job = %ctx.job.name(), error = %e, "webhook notification failed");
        }
    }

    fn continue_on_stop(&self) -> bool {
        true
    }
}

/// Sends a Slack-compatible incoming-webhook message per terminal
/// execution, same dedup rules as the generic webhook.
pub struct SlackNotifier {
    url: String,
    client: reqwest::Client,
}

impl SlackNotifier {
    pub fn new(url: String) -> SlackNotifier {
        SlackNotifier {
            url,
            client: client(),
        }
    }

    fn message(ctx: &Context) -> String {
        let exec = &ctx.execution;
        if exec.failed() {
            format!(
                ":rotating_light: job *{}* failed after {}: {}",
                ctx.job.name(),
                humantime::format_duration(exec.duration()),
                exec.error().unwrap_or_else(|| "unknown error".into())
            )
        } else if exec.skipped() {
            format!(
                ":fast_forward: job *{}* skipped: {}",
                ctx.job.name(),
                exec.error().unwrap_or_else(|| "skipped".into())
            )
        } else {
            format!(
                ":white_check_mark: job *{}* finished in {}",
                ctx.job.name(),
                humantime::format_duration(exec.duration())
            )
        }
    }
}

#[async_trait]
impl Middleware for SlackNotifier {
    async fn after(&self, ctx: &Context) {
        if !ctx.should_notify() {
            return;
        }
        let payload = json!({ "text": Self::message(ctx) });
        if let Err(e) = self.client.post(&self.url).json(&payload).send().await {
            warn!(job = %ctx.job.name(), error = %e, "slack notification failed");
        }
    }

    fn continue_on_stop(&self) -> bool {
        true
    }
}

fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(NOTIFY_TIMEOUT)
        .build()
        .unwrap_or_default()
}
