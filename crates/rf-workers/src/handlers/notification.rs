use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rf_core::jobs::{Job, JobKind, JobPayload};
use rf_core::traits::WebhookClient;
use serde_json::json;

use super::wrong_kind;
use crate::runtime::JobHandler;

/// Delivers notification jobs to the configured webhook. Without a URL the
/// in-app rows are the only delivery and jobs complete immediately.
pub struct NotificationHandler {
    client: Arc<dyn WebhookClient>,
    url: Option<String>,
    timeout: Duration,
}

impl NotificationHandler {
    pub fn new(client: Arc<dyn WebhookClient>, url: Option<String>, timeout: Duration) -> Self {
        Self { client, url, timeout }
    }
}

#[async_trait]
impl JobHandler for NotificationHandler {
    #[tracing::instrument(skip_all, fields(job_id = %job.id))]
    async fn handle(&self, job: &Job) -> anyhow::Result<()> {
        let JobPayload::Notification(task) = &job.payload else {
            return Err(wrong_kind(job, JobKind::Notification));
        };
        let Some(url) = self.url.as_deref() else {
            tracing::debug!(event = %task.event, "no webhook configured, skipping delivery");
            return Ok(());
        };

        let envelope = json!({
            "event": task.event,
            "userIds": task.user_ids,
            "payload": task.payload,
            "attempt": job.attempt(),
            "enqueuedAt": job.enqueued_at,
            "processedAt": Utc::now(),
        });
        self.client.post_json(url, &envelope, self.timeout).await?;
        tracing::debug!(event = %task.event, recipients = task.user_ids.len(), "webhook delivered");
        Ok(())
    }
}
