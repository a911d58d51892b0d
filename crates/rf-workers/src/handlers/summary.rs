use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rf_core::jobs::{Job, JobKind, JobPayload};
use rf_core::traits::{ForumRepo, Summarizer};
use rf_engine::MutationEngine;

use super::wrong_kind;
use crate::extract::summary_text;
use crate::runtime::JobHandler;

pub struct SummaryHandler {
    engine: MutationEngine,
    repo: Arc<dyn ForumRepo>,
    summarizer: Arc<dyn Summarizer>,
    timeout: Duration,
}

pub fn prompt(title: &str, body: &str) -> String {
    format!(
        "Summarize the following forum thread in two or three sentences.\n\nTitle: {title}\n\n{body}"
    )
}

impl SummaryHandler {
    pub fn new(
        engine: MutationEngine,
        repo: Arc<dyn ForumRepo>,
        summarizer: Arc<dyn Summarizer>,
        timeout: Duration,
    ) -> Self {
        Self {
            engine,
            repo,
            summarizer,
            timeout,
        }
    }
}

#[async_trait]
impl JobHandler for SummaryHandler {
    #[tracing::instrument(skip_all, fields(job_id = %job.id))]
    async fn handle(&self, job: &Job) -> anyhow::Result<()> {
        let JobPayload::Summary(task) = &job.payload else {
            return Err(wrong_kind(job, JobKind::Summary));
        };

        let Some(thread) = self.repo.get_thread(task.thread_id).await? else {
            tracing::info!(thread_id = %task.thread_id, "thread gone before summary, skipping");
            return Ok(());
        };
        let body = self
            .repo
            .first_post(thread.id)
            .await?
            .map(|p| p.body)
            .unwrap_or_default();

        let response = self
            .summarizer
            .summarize(&prompt(&thread.title, &body), self.timeout)
            .await?;

        // No text is not a failure: retrying would not produce one.
        let Some(summary) = summary_text(&response) else {
            tracing::warn!(thread_id = %thread.id, "summarizer returned no usable text");
            return Ok(());
        };

        self.engine.record_summary(thread.id, &summary).await?;
        tracing::info!(thread_id = %thread.id, chars = summary.len(), "thread summarized");
        Ok(())
    }
}
