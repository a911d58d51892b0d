use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rf_core::jobs::{Job, JobKind, JobPayload};
use rf_core::models::ModerationState;
use rf_core::traits::{Classifier, ForumRepo};
use rf_engine::MutationEngine;
use serde_json::json;

use super::wrong_kind;
use crate::runtime::JobHandler;

/// Classifies a post body. Flagged posts are marked and their thread
/// locked; clean posts are approved.
pub struct ModerationHandler {
    engine: MutationEngine,
    repo: Arc<dyn ForumRepo>,
    classifier: Arc<dyn Classifier>,
    timeout: Duration,
}

impl ModerationHandler {
    pub fn new(
        engine: MutationEngine,
        repo: Arc<dyn ForumRepo>,
        classifier: Arc<dyn Classifier>,
        timeout: Duration,
    ) -> Self {
        Self {
            engine,
            repo,
            classifier,
            timeout,
        }
    }
}

#[async_trait]
impl JobHandler for ModerationHandler {
    #[tracing::instrument(skip_all, fields(job_id = %job.id))]
    async fn handle(&self, job: &Job) -> anyhow::Result<()> {
        let JobPayload::Moderation(task) = &job.payload else {
            return Err(wrong_kind(job, JobKind::Moderation));
        };

        let Some(post) = self.repo.get_post(task.post_id).await? else {
            tracing::info!(post_id = %task.post_id, "post gone before moderation, skipping");
            return Ok(());
        };

        let verdict = self.classifier.classify(&post.body, self.timeout).await?;
        if verdict.flagged {
            let feedback = json!({
                "flagged": true,
                "categories": verdict.categories,
                "source": "classifier",
            });
            self.engine
                .record_moderation(post.id, ModerationState::Flagged, Some(feedback), true)
                .await?;
            tracing::info!(post_id = %post.id, thread_id = %post.thread_id, "post flagged");
        } else {
            self.engine
                .record_moderation(post.id, ModerationState::Approved, None, false)
                .await?;
            tracing::debug!(post_id = %post.id, "post approved");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rf_core::jobs::{JobOptions, ModerationJob, SummaryJob};
    use rf_core::models::{Post, Thread, ThreadStatus};
    use rf_core::traits::{
        ClassifierVerdict, MockCache, MockClassifier, MockFanout, MockForumRepo, MockJobQueue,
        ModerationOutcome,
    };
    use rf_engine::DispatchPolicy;
    use uuid::Uuid;

    fn post(thread_id: Uuid) -> Post {
        let now = Utc::now();
        Post {
            id: Uuid::now_v7(),
            thread_id,
            author_id: Uuid::now_v7(),
            body: "buy cheap watches".into(),
            mentions: vec![],
            parent_post_id: None,
            moderation_state: ModerationState::Approved,
            moderation_feedback: None,
            upvotes_count: 0,
            downvotes_count: 0,
            replies_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn locked(thread_id: Uuid, author_id: Uuid) -> Thread {
        let now = Utc::now();
        Thread {
            id: thread_id,
            title: "t".into(),
            slug: "t".into(),
            author_id,
            tags: vec![],
            status: ThreadStatus::Locked,
            last_activity_at: now,
            posts_count: 1,
            participants_count: 1,
            participant_ids: vec![author_id],
            summary: None,
            summary_generated_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn engine(repo: Arc<MockForumRepo>) -> MutationEngine {
        let mut cache = MockCache::new();
        cache.expect_delete_pattern().returning(|_| Ok(0));
        let mut fanout = MockFanout::new();
        fanout.expect_publish().return_const(());
        MutationEngine::new(
            repo,
            Arc::new(cache),
            Arc::new(MockJobQueue::new()),
            Arc::new(fanout),
            DispatchPolicy::default(),
        )
    }

    fn job(post: &Post) -> Job {
        Job::new(
            "moderation",
            JobPayload::Moderation(ModerationJob {
                post_id: post.id,
                thread_id: post.thread_id,
            }),
            JobOptions::default(),
        )
    }

    #[tokio::test]
    async fn test_flagged_post_locks_thread() {
        let post = post(Uuid::now_v7());
        let job = job(&post);
        let mut repo = MockForumRepo::new();
        let stored = post.clone();
        repo.expect_get_post().returning(move |_| Ok(Some(stored.clone())));
        repo.expect_get_users().returning(|_| Ok(vec![]));
        let flagged = post.clone();
        repo.expect_set_moderation()
            .withf(|_, state, feedback, lock| {
                *state == ModerationState::Flagged && *lock && feedback.as_ref().is_some_and(|f| f["flagged"] == true)
            })
            .times(1)
            .returning(move |_, state, feedback, _| {
                let mut post = flagged.clone();
                post.moderation_state = state;
                post.moderation_feedback = feedback;
                Ok(ModerationOutcome {
                    locked_thread: Some(locked(post.thread_id, post.author_id)),
                    post,
                })
            });
        let repo = Arc::new(repo);

        let mut classifier = MockClassifier::new();
        classifier.expect_classify().returning(|_, _| {
            Ok(ClassifierVerdict {
                flagged: true,
                categories: json!({ "spam": true }),
            })
        });

        let handler = ModerationHandler::new(engine(repo.clone()), repo, Arc::new(classifier), Duration::from_secs(1));
        handler.handle(&job).await.unwrap();
    }

    #[tokio::test]
    async fn test_clean_post_is_approved_without_lock() {
        let post = post(Uuid::now_v7());
        let job = job(&post);
        let mut repo = MockForumRepo::new();
        let stored = post.clone();
        repo.expect_get_post().returning(move |_| Ok(Some(stored.clone())));
        repo.expect_get_users().returning(|_| Ok(vec![]));
        let approved = post.clone();
        repo.expect_set_moderation()
            .withf(|_, state, feedback, lock| *state == ModerationState::Approved && feedback.is_none() && !*lock)
            .times(1)
            .returning(move |_, _, _, _| {
                Ok(ModerationOutcome {
                    post: approved.clone(),
                    locked_thread: None,
                })
            });
        let repo = Arc::new(repo);

        let mut classifier = MockClassifier::new();
        classifier.expect_classify().returning(|_, _| {
            Ok(ClassifierVerdict {
                flagged: false,
                categories: json!({}),
            })
        });

        let handler = ModerationHandler::new(engine(repo.clone()), repo, Arc::new(classifier), Duration::from_secs(1));
        handler.handle(&job).await.unwrap();
    }

    #[tokio::test]
    async fn test_classifier_error_propagates_for_retry() {
        let post = post(Uuid::now_v7());
        let job = job(&post);
        let mut repo = MockForumRepo::new();
        let stored = post.clone();
        repo.expect_get_post().returning(move |_| Ok(Some(stored.clone())));
        repo.expect_set_moderation().times(0);
        let repo = Arc::new(repo);

        let mut classifier = MockClassifier::new();
        classifier
            .expect_classify()
            .returning(|_, _| Err(anyhow::anyhow!("operation timed out")));

        let handler = ModerationHandler::new(engine(repo.clone()), repo, Arc::new(classifier), Duration::from_secs(1));
        assert!(handler.handle(&job).await.is_err());
    }

    #[tokio::test]
    async fn test_deleted_post_is_skipped() {
        let post = post(Uuid::now_v7());
        let job = job(&post);
        let mut repo = MockForumRepo::new();
        repo.expect_get_post().returning(|_| Ok(None));
        let repo = Arc::new(repo);
        let mut classifier = MockClassifier::new();
        classifier.expect_classify().times(0);

        let handler = ModerationHandler::new(engine(repo.clone()), repo, Arc::new(classifier), Duration::from_secs(1));
        handler.handle(&job).await.unwrap();
    }

    #[tokio::test]
    async fn test_misrouted_payload_fails() {
        let repo = Arc::new(MockForumRepo::new());
        let handler = ModerationHandler::new(
            engine(repo.clone()),
            repo,
            Arc::new(MockClassifier::new()),
            Duration::from_secs(1),
        );
        let job = Job::new(
            "moderation",
            JobPayload::Summary(SummaryJob { thread_id: Uuid::now_v7() }),
            JobOptions::default(),
        );
        assert!(handler.handle(&job).await.is_err());
    }
}
