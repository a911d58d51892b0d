//! # Core Traits (Ports)
//!
//! Any plugin must implement these traits to be used by the binary.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;
use crate::events::{RealtimeEvent, Room};
use crate::jobs::{Job, JobFate, JobOptions, JobPayload};
use crate::mentions::ResolvedMentions;
use crate::models::{
    DeletedPost, DeletedThread, Mention, ModerationState, Notification, Page, Post, Reaction,
    Thread, ThreadQuery, ThreadStatus, User,
};
use crate::reactions::{ReactionOutcome, ReactionRequest};

/// Result of writing a moderation verdict.
#[derive(Debug, Clone, PartialEq)]
pub struct ModerationOutcome {
    pub post: Post,
    /// Present when this write moved the owning thread to `locked`
    pub locked_thread: Option<Thread>,
}

/// Data persistence contract for users, threads, posts, reactions, mentions
/// and notifications.
///
/// Every mutating method is one atomic transaction: it either commits all of
/// its row and counter changes or none of them.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait ForumRepo: Send + Sync {
    // User Operations
    async fn upsert_user(&self, user: &User) -> Result<()>;
    async fn get_users(&self, ids: &[Uuid]) -> Result<Vec<User>>;
    /// Case-insensitive handle lookup; unknown handles are skipped.
    async fn find_users_by_handles(&self, handles: &[String]) -> Result<Vec<User>>;

    // Thread Operations
    async fn slug_exists(&self, slug: &str) -> Result<bool>;
    /// Highest `n` among existing `{base}-{n}` slugs, `None` when no
    /// numbered slug of that base exists.
    async fn highest_slug_suffix(&self, base: &str) -> Result<Option<u64>>;
    /// Inserts the thread and its first post and bumps the author's
    /// thread and post counters. `Conflict` when the slug is taken.
    async fn create_thread(&self, thread: Thread, first_post: Post) -> Result<()>;
    async fn get_thread(&self, id: Uuid) -> Result<Option<Thread>>;
    async fn list_threads(&self, query: &ThreadQuery) -> Result<Page<Thread>>;
    async fn list_threads_by_author(&self, author_id: Uuid, page: u32, limit: u32) -> Result<Page<Thread>>;
    /// Removes every reaction, mention and post of the thread, then the
    /// thread, and settles the affected users' counters.
    async fn delete_thread(&self, thread_id: Uuid) -> Result<DeletedThread>;
    async fn set_thread_status(&self, thread_id: Uuid, status: ThreadStatus) -> Result<Thread>;
    async fn set_thread_summary(&self, thread_id: Uuid, summary: &str, at: DateTime<Utc>) -> Result<()>;

    // Post Operations
    async fn get_post(&self, id: Uuid) -> Result<Option<Post>>;
    async fn first_post(&self, thread_id: Uuid) -> Result<Option<Post>>;
    /// Posts in creation order.
    async fn list_posts(&self, thread_id: Uuid, page: u32, limit: u32) -> Result<Page<Post>>;
    /// Inserts a reply into an open thread and returns the updated thread.
    /// `Forbidden` unless the thread is open; `NotFound` for a missing thread
    /// or a parent outside it.
    async fn create_post(&self, post: Post) -> Result<Thread>;
    /// Rewrites the body and mention rows and bumps thread activity.
    async fn update_post(
        &self,
        post_id: Uuid,
        body: &str,
        mentions: &ResolvedMentions,
        at: DateTime<Utc>,
    ) -> Result<Post>;
    async fn delete_post(&self, post_id: Uuid) -> Result<DeletedPost>;
    async fn set_moderation(
        &self,
        post_id: Uuid,
        state: ModerationState,
        feedback: Option<serde_json::Value>,
        lock_thread: bool,
    ) -> Result<ModerationOutcome>;

    // Reaction Operations
    /// Applies the toggle state machine for one (post, user) pair.
    /// `Conflict` when a concurrent insert won the uniqueness race.
    async fn react(&self, post_id: Uuid, user_id: Uuid, request: ReactionRequest) -> Result<ReactionOutcome>;
    async fn get_reaction(&self, post_id: Uuid, user_id: Uuid) -> Result<Option<Reaction>>;

    // Mention Operations
    /// Delete-all then insert-new, and store the handles on the post.
    async fn replace_mentions(&self, post_id: Uuid, mentions: &ResolvedMentions) -> Result<()>;
    async fn get_mentions(&self, post_id: Uuid) -> Result<Vec<Mention>>;
    async fn mark_mentions_notified(&self, post_id: Uuid, user_ids: &[Uuid], at: DateTime<Utc>) -> Result<()>;

    // Notification Operations
    async fn insert_notifications(&self, notifications: &[Notification]) -> Result<()>;
    async fn notifications_for(&self, user_id: Uuid) -> Result<Vec<Notification>>;
}

/// Key/value store with TTL and wildcard invalidation.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait Cache: Send + Sync {
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>>;
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> anyhow::Result<()>;
    async fn delete(&self, key: &str) -> anyhow::Result<()>;
    /// Deletes every key matching a `*` glob; returns how many went.
    async fn delete_pattern(&self, pattern: &str) -> anyhow::Result<u64>;
}

/// Durable named queues with at-least-once delivery.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, queue: &str, payload: JobPayload, options: JobOptions) -> anyhow::Result<Uuid>;
    /// Claims the oldest job of `queue` whose `run_at` has passed.
    async fn reserve(&self, queue: &str) -> anyhow::Result<Option<Job>>;
    /// Success: the job is removed.
    async fn complete(&self, job: &Job) -> anyhow::Result<()>;
    /// Failure: requeue with backoff or abandon once attempts are spent.
    async fn fail(&self, job: &Job, error: &str) -> anyhow::Result<JobFate>;
    /// Puts jobs left claimed by a dead process back in line.
    async fn recover_stalled(&self, queue: &str) -> anyhow::Result<u64>;
    async fn dead_jobs(&self, queue: &str) -> anyhow::Result<Vec<Job>>;
}

/// Realtime broadcast. Fire-and-forget: no acknowledgment, no replay.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
pub trait Fanout: Send + Sync {
    fn publish(&self, room: Room, event: RealtimeEvent);
}

/// Verdict from the external text classifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifierVerdict {
    pub flagged: bool,
    /// Category detail as returned by the service
    pub categories: serde_json::Value,
}

#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, text: &str, timeout: Duration) -> anyhow::Result<ClassifierVerdict>;
}

/// The raw response is handed back untouched; its shape varies.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, prompt: &str, timeout: Duration) -> anyhow::Result<serde_json::Value>;
}

/// Outbound JSON POST. Non-2xx and timeouts are errors.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait WebhookClient: Send + Sync {
    async fn post_json(&self, url: &str, body: &serde_json::Value, timeout: Duration) -> anyhow::Result<()>;
}
