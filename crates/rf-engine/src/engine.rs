//! # Thread/Post Mutation Engine
//!
//! Every write to threads, posts, reactions and mentions goes through here.
//! Each operation validates, runs exactly one repo transaction, and only
//! then fires its side effects: cache invalidation, job dispatch, in-app
//! notifications and realtime events. Side effects are best-effort and can
//! never undo or fail a committed write.

use std::sync::Arc;

use chrono::Utc;
use rf_core::error::{AppError, Result};
use rf_core::events::{RealtimeEvent, Room};
use rf_core::mentions::{extract_handles, ResolvedMentions};
use rf_core::models::{
    Actor, CreatedThread, EnrichedPost, ModerationState, Post, ReactionSummary, ReactionType,
    Thread, ThreadStatus,
};
use rf_core::reactions::{ReactionOutcome, ReactionRequest, ReactionTransition};
use rf_core::slug;
use rf_core::traits::{Cache, Fanout, ForumRepo, JobQueue};
use serde_json::json;
use uuid::Uuid;

use crate::best_effort::best_effort;
use crate::dispatch::{DispatchPolicy, JobDispatcher};
use crate::invalidate::CacheInvalidator;
use crate::notify::{self, Notifier};
use crate::reads::enrich_post;

pub const MAX_TAGS: usize = 5;
pub const MAX_TAG_LEN: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewThread {
    pub title: String,
    pub body: String,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPost {
    pub thread_id: Uuid,
    pub body: String,
    pub parent_post_id: Option<Uuid>,
}

#[derive(Clone)]
pub struct MutationEngine {
    repo: Arc<dyn ForumRepo>,
    fanout: Arc<dyn Fanout>,
    dispatcher: JobDispatcher,
    invalidator: CacheInvalidator,
    notifier: Notifier,
}

fn non_empty(field: &str, raw: &str) -> Result<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(AppError::ValidationError(format!("{field} cannot be empty")));
    }
    Ok(trimmed.to_string())
}

/// Trimmed, lower-cased, de-duplicated in order.
fn normalize_tags(raw: &[String]) -> Result<Vec<String>> {
    let mut tags: Vec<String> = Vec::new();
    for tag in raw {
        let tag = tag.trim().to_lowercase();
        if tag.is_empty() || tags.contains(&tag) {
            continue;
        }
        if tag.chars().count() > MAX_TAG_LEN {
            return Err(AppError::ValidationError(format!(
                "tag '{tag}' is longer than {MAX_TAG_LEN} characters"
            )));
        }
        tags.push(tag);
    }
    if tags.len() > MAX_TAGS {
        return Err(AppError::ValidationError(format!("at most {MAX_TAGS} tags are allowed")));
    }
    Ok(tags)
}

impl MutationEngine {
    pub fn new(
        repo: Arc<dyn ForumRepo>,
        cache: Arc<dyn Cache>,
        queue: Arc<dyn JobQueue>,
        fanout: Arc<dyn Fanout>,
        policy: DispatchPolicy,
    ) -> Self {
        let dispatcher = JobDispatcher::new(queue, policy);
        Self {
            notifier: Notifier::new(repo.clone(), fanout.clone(), dispatcher.clone()),
            invalidator: CacheInvalidator::new(cache),
            dispatcher,
            repo,
            fanout,
        }
    }

    pub fn dispatcher(&self) -> &JobDispatcher {
        &self.dispatcher
    }

    /// Creates a thread with its opening post under a fresh unique slug.
    #[tracing::instrument(skip(self, input), fields(actor = %actor.user_id))]
    pub async fn create_thread(&self, actor: &Actor, input: NewThread) -> Result<CreatedThread> {
        let title = non_empty("title", &input.title)?;
        let body = non_empty("body", &input.body)?;
        let tags = normalize_tags(&input.tags)?;

        let now = Utc::now();
        let mut thread = Thread {
            id: Uuid::now_v7(),
            title,
            slug: String::new(),
            author_id: actor.user_id,
            tags,
            status: ThreadStatus::Open,
            last_activity_at: now,
            posts_count: 1,
            participants_count: 1,
            participant_ids: vec![actor.user_id],
            summary: None,
            summary_generated_at: None,
            created_at: now,
            updated_at: now,
        };
        let mut post = Post {
            id: Uuid::now_v7(),
            thread_id: thread.id,
            author_id: actor.user_id,
            body,
            mentions: Vec::new(),
            parent_post_id: None,
            // Optimistic; the moderation job corrects it.
            moderation_state: ModerationState::Approved,
            moderation_feedback: None,
            upvotes_count: 0,
            downvotes_count: 0,
            replies_count: 0,
            created_at: now,
            updated_at: now,
        };

        thread.slug = self.insert_with_unique_slug(&thread, &post).await?;
        tracing::info!(thread_id = %thread.id, slug = %thread.slug, "thread created");

        // Side effects: nothing below may fail the call.
        let mentions = self.resolve_mentions_best_effort(actor, &post.body).await;
        if !mentions.handles.is_empty() {
            best_effort("store mentions", self.repo.replace_mentions(post.id, &mentions)).await;
            post.mentions = mentions.handles.clone();
        }

        self.dispatcher.moderate_post(post.id, thread.id).await;
        self.dispatcher.summarize_thread(thread.id).await;

        let enriched = enrich_post(self.repo.as_ref(), post).await;
        self.invalidator.thread_lists(actor.user_id).await;
        self.notify_mentions(&enriched.post, &mentions).await;

        self.fanout.publish(
            Room::Global,
            RealtimeEvent::ThreadCreated {
                thread: thread.clone(),
                post: enriched.clone(),
            },
        );

        Ok(CreatedThread { thread, post: enriched })
    }

    /// Inserts under `base` when it is free, otherwise under the suffix one
    /// past the highest numbered `base-n` in use. A slug taken between the
    /// lookup and the insert moves on to the next free suffix.
    async fn insert_with_unique_slug(&self, thread: &Thread, post: &Post) -> Result<String> {
        let base = slug::slugify(&thread.title);
        let mut attempt = if self.repo.slug_exists(&base).await? {
            self.next_slug_suffix(&base).await?
        } else {
            0
        };
        loop {
            let candidate = slug::candidate(&base, attempt);
            let mut thread = thread.clone();
            thread.slug = candidate.clone();
            match self.repo.create_thread(thread, post.clone()).await {
                Ok(()) => return Ok(candidate),
                Err(err) if err.is_conflict() => {
                    tracing::debug!(slug = %candidate, "slug taken concurrently, trying the next one");
                    attempt = self.next_slug_suffix(&base).await?.max(attempt.saturating_add(1));
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn next_slug_suffix(&self, base: &str) -> Result<u64> {
        let highest = self.repo.highest_slug_suffix(base).await?;
        Ok(highest.map_or(1, |n| n.saturating_add(1)))
    }

    /// Replies to an open thread.
    #[tracing::instrument(skip(self, input), fields(actor = %actor.user_id, thread_id = %input.thread_id))]
    pub async fn create_post(&self, actor: &Actor, input: NewPost) -> Result<EnrichedPost> {
        let body = non_empty("body", &input.body)?;
        let now = Utc::now();
        let mut post = Post {
            id: Uuid::now_v7(),
            thread_id: input.thread_id,
            author_id: actor.user_id,
            body,
            mentions: Vec::new(),
            parent_post_id: input.parent_post_id,
            moderation_state: ModerationState::Approved,
            moderation_feedback: None,
            upvotes_count: 0,
            downvotes_count: 0,
            replies_count: 0,
            created_at: now,
            updated_at: now,
        };

        let thread = self.repo.create_post(post.clone()).await?;
        tracing::info!(post_id = %post.id, posts_count = thread.posts_count, "post created");

        let mentions = self.resolve_mentions_best_effort(actor, &post.body).await;
        if !mentions.handles.is_empty() {
            best_effort("store mentions", self.repo.replace_mentions(post.id, &mentions)).await;
            post.mentions = mentions.handles.clone();
        }

        self.dispatcher.moderate_post(post.id, thread.id).await;

        // Mentioned users get the more specific notification only.
        let participants: Vec<Uuid> = thread
            .participant_ids
            .iter()
            .copied()
            .filter(|id| *id != actor.user_id && !mentions.contains(id))
            .collect();
        self.notifier
            .notify(
                &participants,
                notify::THREAD_REPLY,
                json!({
                    "threadId": thread.id,
                    "postId": post.id,
                    "authorId": actor.user_id,
                    "title": thread.title,
                }),
            )
            .await;

        let enriched = enrich_post(self.repo.as_ref(), post).await;
        self.notify_mentions(&enriched.post, &mentions).await;

        self.fanout
            .publish(Room::Thread(thread.id), RealtimeEvent::PostCreated { post: enriched.clone() });
        self.fanout.publish(
            Room::Global,
            RealtimeEvent::ThreadActivity {
                thread_id: thread.id,
                post_id: enriched.post.id,
                posts_count: thread.posts_count,
                last_activity_at: thread.last_activity_at,
            },
        );
        self.invalidator.thread(thread.id, thread.author_id).await;

        Ok(enriched)
    }

    /// Author-only body edit. An identical body is a no-op.
    #[tracing::instrument(skip(self, body), fields(actor = %actor.user_id))]
    pub async fn update_post(&self, actor: &Actor, thread_id: Uuid, post_id: Uuid, body: &str) -> Result<EnrichedPost> {
        let body = non_empty("body", body)?;
        let post = self.post_in_thread(thread_id, post_id).await?;
        if post.author_id != actor.user_id {
            return Err(AppError::Forbidden("only the author can edit this post".into()));
        }
        // Stored bodies are always trimmed, so comparing trimmed input is
        // the same as comparing the stored bytes.
        if post.body == body {
            return Ok(enrich_post(self.repo.as_ref(), post).await);
        }

        // Pre-commit reads propagate: nothing has been written yet.
        let handles = extract_handles(&body);
        let mentions = if handles.is_empty() {
            ResolvedMentions::default()
        } else {
            let users = self.repo.find_users_by_handles(&handles).await?;
            ResolvedMentions::resolve(&handles, &users, actor.user_id)
        };
        let already_notified: Vec<Uuid> = self
            .repo
            .get_mentions(post_id)
            .await?
            .into_iter()
            .filter(|m| m.notified)
            .map(|m| m.mentioned_user_id)
            .collect();

        let updated = self.repo.update_post(post_id, &body, &mentions, Utc::now()).await?;
        tracing::info!(%post_id, "post updated");

        // Only newly mentioned users are pinged; earlier recipients keep
        // their notified flag across the row replacement.
        let fresh = ResolvedMentions {
            handles: Vec::new(),
            user_ids: mentions
                .user_ids
                .iter()
                .copied()
                .filter(|id| !already_notified.contains(id))
                .collect(),
        };
        let kept: Vec<Uuid> = mentions
            .user_ids
            .iter()
            .copied()
            .filter(|id| already_notified.contains(id))
            .collect();
        if !kept.is_empty() {
            best_effort(
                "restore mention flags",
                self.repo.mark_mentions_notified(post_id, &kept, Utc::now()),
            )
            .await;
        }

        let enriched = enrich_post(self.repo.as_ref(), updated).await;
        self.notify_mentions(&enriched.post, &fresh).await;

        self.fanout
            .publish(Room::Thread(thread_id), RealtimeEvent::PostUpdated { post: enriched.clone() });
        self.invalidate_thread(thread_id).await;

        Ok(enriched)
    }

    #[tracing::instrument(skip(self), fields(actor = %actor.user_id))]
    pub async fn react_to_post(
        &self,
        actor: &Actor,
        thread_id: Uuid,
        post_id: Uuid,
        kind: ReactionType,
    ) -> Result<ReactionSummary> {
        self.apply_reaction(actor, thread_id, post_id, ReactionRequest::Toggle(kind))
            .await
    }

    #[tracing::instrument(skip(self), fields(actor = %actor.user_id))]
    pub async fn remove_post_reaction(&self, actor: &Actor, thread_id: Uuid, post_id: Uuid) -> Result<ReactionSummary> {
        self.apply_reaction(actor, thread_id, post_id, ReactionRequest::Remove)
            .await
    }

    async fn apply_reaction(
        &self,
        actor: &Actor,
        thread_id: Uuid,
        post_id: Uuid,
        request: ReactionRequest,
    ) -> Result<ReactionSummary> {
        self.post_in_thread(thread_id, post_id).await?;

        let outcome = match self.repo.react(post_id, actor.user_id, request).await {
            Ok(outcome) => outcome,
            Err(err) if err.is_conflict() => self.settle_reaction_conflict(actor, post_id, request).await?,
            Err(err) => return Err(err),
        };
        let summary = outcome.summary.clone();

        let event = RealtimeEvent::PostReaction {
            thread_id,
            post_id,
            user_id: actor.user_id,
            upvotes_count: summary.upvotes_count,
            downvotes_count: summary.downvotes_count,
            reaction: summary.reaction,
        };
        self.fanout.publish(Room::Thread(thread_id), event.clone());
        self.fanout.publish(Room::User(actor.user_id), event);

        if outcome.transition.is_newly_set() && summary.post_author_id != actor.user_id {
            self.notifier
                .notify(
                    &[summary.post_author_id],
                    notify::POST_REACTED,
                    json!({
                        "threadId": thread_id,
                        "postId": post_id,
                        "userId": actor.user_id,
                        "reaction": summary.reaction,
                    }),
                )
                .await;
        }
        self.invalidator.thread_detail(thread_id).await;

        Ok(summary)
    }

    /// A concurrent insert for the same (post, user) won the uniqueness race.
    /// If the row already says what was asked for, report it unchanged;
    /// otherwise apply the request once more on top of the winner.
    async fn settle_reaction_conflict(
        &self,
        actor: &Actor,
        post_id: Uuid,
        request: ReactionRequest,
    ) -> Result<ReactionOutcome> {
        let current = self
            .repo
            .get_reaction(post_id, actor.user_id)
            .await?
            .map(|r| r.kind);
        let wanted = match request {
            ReactionRequest::Toggle(kind) => Some(kind),
            ReactionRequest::Remove => None,
        };
        tracing::debug!(%post_id, ?current, ?wanted, "reaction conflict");

        if current != wanted {
            return self.repo.react(post_id, actor.user_id, request).await;
        }

        let post = self
            .repo
            .get_post(post_id)
            .await?
            .ok_or_else(|| AppError::not_found("Post", post_id))?;
        Ok(ReactionOutcome {
            summary: ReactionSummary {
                thread_id: post.thread_id,
                post_id,
                post_author_id: post.author_id,
                upvotes_count: post.upvotes_count,
                downvotes_count: post.downvotes_count,
                reaction: current,
            },
            transition: ReactionTransition {
                previous: current,
                next: current,
            },
        })
    }

    /// Author-only post deletion. Returns the thread as committed.
    #[tracing::instrument(skip(self), fields(actor = %actor.user_id))]
    pub async fn delete_post(&self, actor: &Actor, thread_id: Uuid, post_id: Uuid) -> Result<Thread> {
        let post = self.post_in_thread(thread_id, post_id).await?;
        if post.author_id != actor.user_id {
            return Err(AppError::Forbidden("only the author can delete this post".into()));
        }

        let deleted = self.repo.delete_post(post_id).await?;
        tracing::info!(%post_id, posts_count = deleted.thread.posts_count, "post deleted");

        self.fanout
            .publish(Room::Thread(thread_id), RealtimeEvent::PostDeleted { thread_id, post_id });
        self.invalidator
            .thread(thread_id, deleted.thread.author_id)
            .await;

        Ok(deleted.thread)
    }

    #[tracing::instrument(skip(self), fields(actor = %actor.user_id))]
    pub async fn delete_thread(&self, actor: &Actor, thread_id: Uuid) -> Result<()> {
        let thread = self.require_thread(thread_id).await?;
        if thread.author_id != actor.user_id {
            return Err(AppError::Forbidden("only the author can delete this thread".into()));
        }

        let deleted = self.repo.delete_thread(thread_id).await?;
        tracing::info!(%thread_id, posts = deleted.post_ids.len(), "thread deleted");

        let event = RealtimeEvent::ThreadDeleted { thread_id };
        self.fanout.publish(Room::Thread(thread_id), event.clone());
        self.fanout.publish(Room::Global, event);
        self.invalidator.thread(thread_id, thread.author_id).await;

        Ok(())
    }

    /// Privileged: authorization happens upstream. Acting on one's own
    /// post is rejected as self-contradictory.
    #[tracing::instrument(skip(self, feedback), fields(actor = %actor.user_id))]
    pub async fn moderate_post(
        &self,
        actor: &Actor,
        post_id: Uuid,
        state: ModerationState,
        feedback: Option<serde_json::Value>,
        lock_thread: bool,
    ) -> Result<EnrichedPost> {
        if state == ModerationState::Pending {
            return Err(AppError::ValidationError("a verdict cannot be pending".into()));
        }
        let post = self
            .repo
            .get_post(post_id)
            .await?
            .ok_or_else(|| AppError::not_found("Post", post_id))?;
        if post.author_id == actor.user_id {
            return Err(AppError::Forbidden("cannot moderate your own post".into()));
        }

        self.record_moderation(post_id, state, feedback, lock_thread).await
    }

    /// Writes a moderation verdict. Shared by the privileged path and the
    /// moderation worker. The thread is locked only for a non-approved
    /// verdict and only when `lock_thread` asks for it.
    pub async fn record_moderation(
        &self,
        post_id: Uuid,
        state: ModerationState,
        feedback: Option<serde_json::Value>,
        lock_thread: bool,
    ) -> Result<EnrichedPost> {
        let lock = lock_thread && state != ModerationState::Approved;
        let outcome = self.repo.set_moderation(post_id, state, feedback, lock).await?;
        let thread_id = outcome.post.thread_id;
        tracing::info!(%post_id, %state, locked = outcome.locked_thread.is_some(), "moderation recorded");

        let enriched = enrich_post(self.repo.as_ref(), outcome.post).await;
        self.fanout
            .publish(Room::Thread(thread_id), RealtimeEvent::PostModerated { post: enriched.clone() });

        match outcome.locked_thread {
            Some(thread) => {
                let author_id = thread.author_id;
                self.publish_thread_updated(thread);
                self.invalidator.thread(thread_id, author_id).await;
            }
            None => self.invalidator.thread_detail(thread_id).await,
        }

        Ok(enriched)
    }

    /// Privileged status change. Setting the current status is a no-op.
    #[tracing::instrument(skip(self), fields(actor = %actor.user_id))]
    pub async fn update_thread_status(&self, actor: &Actor, thread_id: Uuid, status: ThreadStatus) -> Result<Thread> {
        let current = self.require_thread(thread_id).await?;
        if current.status == status {
            return Ok(current);
        }

        let thread = self.repo.set_thread_status(thread_id, status).await?;
        tracing::info!(%thread_id, from = %current.status, to = %status, "thread status changed");

        self.publish_thread_updated(thread.clone());
        self.invalidator.thread(thread_id, thread.author_id).await;
        Ok(thread)
    }

    /// Stores a generated summary. Called by the summary worker.
    pub async fn record_summary(&self, thread_id: Uuid, summary: &str) -> Result<()> {
        self.repo.set_thread_summary(thread_id, summary, Utc::now()).await?;

        if let Some(thread) = best_effort("reload thread", self.repo.get_thread(thread_id)).await.flatten() {
            let author_id = thread.author_id;
            self.publish_thread_updated(thread);
            self.invalidator.thread(thread_id, author_id).await;
        }
        Ok(())
    }

    fn publish_thread_updated(&self, thread: Thread) {
        let thread_id = thread.id;
        let event = RealtimeEvent::ThreadUpdated { thread };
        self.fanout.publish(Room::Thread(thread_id), event.clone());
        self.fanout.publish(Room::Global, event);
    }

    async fn invalidate_thread(&self, thread_id: Uuid) {
        match best_effort("reload thread", self.repo.get_thread(thread_id)).await.flatten() {
            Some(thread) => self.invalidator.thread(thread_id, thread.author_id).await,
            None => self.invalidator.thread_detail(thread_id).await,
        }
    }

    async fn require_thread(&self, thread_id: Uuid) -> Result<Thread> {
        self.repo
            .get_thread(thread_id)
            .await?
            .ok_or_else(|| AppError::not_found("Thread", thread_id))
    }

    /// A post addressed through the wrong thread does not exist.
    async fn post_in_thread(&self, thread_id: Uuid, post_id: Uuid) -> Result<Post> {
        match self.repo.get_post(post_id).await? {
            Some(post) if post.thread_id == thread_id => Ok(post),
            _ => Err(AppError::not_found("Post", post_id)),
        }
    }

    async fn resolve_mentions_best_effort(&self, actor: &Actor, body: &str) -> ResolvedMentions {
        let handles = extract_handles(body);
        if handles.is_empty() {
            return ResolvedMentions::default();
        }
        let users = best_effort("resolve mentions", self.repo.find_users_by_handles(&handles))
            .await
            .unwrap_or_default();
        ResolvedMentions::resolve(&handles, &users, actor.user_id)
    }

    /// Mention notification, broadcast to each recipient and the mention
    /// rows flagged as notified.
    async fn notify_mentions(&self, post: &Post, mentions: &ResolvedMentions) {
        if mentions.is_empty() {
            return;
        }
        let payload = json!({
            "threadId": post.thread_id,
            "postId": post.id,
            "authorId": post.author_id,
        });
        self.notifier
            .notify(&mentions.user_ids, notify::POST_MENTIONED, payload)
            .await;

        let event = RealtimeEvent::PostMentioned {
            thread_id: post.thread_id,
            post_id: post.id,
            author_id: post.author_id,
            mentioned_user_ids: mentions.user_ids.clone(),
        };
        for user_id in &mentions.user_ids {
            self.fanout.publish(Room::User(*user_id), event.clone());
        }

        best_effort(
            "flag mentions notified",
            self.repo.mark_mentions_notified(post.id, &mentions.user_ids, Utc::now()),
        )
        .await;
    }
}
