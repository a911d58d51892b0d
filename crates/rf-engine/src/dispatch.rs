//! Job dispatch: which queue each job kind goes to and with which retry
//! options. Callers on the mutation path only use the best-effort helpers.

use std::sync::Arc;

use rf_core::jobs::{
    Backoff, JobKind, JobOptions, JobPayload, ModerationJob, NotificationJob, SummaryJob,
};
use rf_core::traits::JobQueue;
use uuid::Uuid;

use crate::best_effort::best_effort;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub queue: String,
    pub options: JobOptions,
}

/// Queue name and options per job kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchPolicy {
    pub moderation: Route,
    pub summary: Route,
    pub notification: Route,
}

impl Default for DispatchPolicy {
    fn default() -> Self {
        let route = |kind: JobKind, options: JobOptions| Route {
            queue: kind.default_queue().to_string(),
            options,
        };
        Self {
            moderation: route(JobKind::Moderation, JobOptions::default()),
            summary: route(JobKind::Summary, JobOptions::default()),
            notification: route(
                JobKind::Notification,
                JobOptions {
                    attempts: 5,
                    backoff: Backoff::Exponential { delay_ms: 5_000 },
                    remove_on_complete: true,
                },
            ),
        }
    }
}

impl DispatchPolicy {
    pub fn route(&self, kind: JobKind) -> &Route {
        match kind {
            JobKind::Moderation => &self.moderation,
            JobKind::Summary => &self.summary,
            JobKind::Notification => &self.notification,
        }
    }

    pub fn with_route(mut self, kind: JobKind, queue: &str, options: JobOptions) -> Self {
        let route = Route {
            queue: queue.to_string(),
            options,
        };
        match kind {
            JobKind::Moderation => self.moderation = route,
            JobKind::Summary => self.summary = route,
            JobKind::Notification => self.notification = route,
        }
        self
    }
}

#[derive(Clone)]
pub struct JobDispatcher {
    queue: Arc<dyn JobQueue>,
    policy: Arc<DispatchPolicy>,
}

impl JobDispatcher {
    pub fn new(queue: Arc<dyn JobQueue>, policy: DispatchPolicy) -> Self {
        Self {
            queue,
            policy: Arc::new(policy),
        }
    }

    pub fn policy(&self) -> &DispatchPolicy {
        &self.policy
    }

    /// Enqueues on the kind's queue. Errors are returned to the caller.
    pub async fn dispatch(&self, payload: JobPayload) -> anyhow::Result<Uuid> {
        let route = self.policy.route(payload.kind());
        self.queue.enqueue(&route.queue, payload, route.options).await
    }

    pub async fn moderate_post(&self, post_id: Uuid, thread_id: Uuid) -> Option<Uuid> {
        let payload = JobPayload::Moderation(ModerationJob { post_id, thread_id });
        best_effort("enqueue moderation", self.dispatch(payload)).await
    }

    pub async fn summarize_thread(&self, thread_id: Uuid) -> Option<Uuid> {
        let payload = JobPayload::Summary(SummaryJob { thread_id });
        best_effort("enqueue summary", self.dispatch(payload)).await
    }

    pub async fn deliver_notification(
        &self,
        event: &str,
        user_ids: Vec<Uuid>,
        payload: serde_json::Value,
    ) -> Option<Uuid> {
        let payload = JobPayload::Notification(NotificationJob {
            event: event.to_string(),
            user_ids,
            payload,
        });
        best_effort("enqueue notification", self.dispatch(payload)).await
    }
}
