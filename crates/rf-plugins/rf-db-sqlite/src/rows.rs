//! Row types and the mapping between the SQLite relational model and the
//! `rf-core` domain models.
//!
//! Sets (tags, participants, mention handles) and free-form JSON are stored
//! as TEXT columns holding JSON; enums are stored by their wire name.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use rf_core::error::{AppError, Result};
use rf_core::models::{Mention, Notification, Post, Reaction, Thread, User};
use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

pub(crate) const USER_COLUMNS: &str =
    "id, handle, display_name, avatar_url, threads_count, posts_count";

pub(crate) const THREAD_COLUMNS: &str = "id, title, slug, author_id, tags, status, last_activity_at, \
     posts_count, participants_count, participant_ids, summary, summary_generated_at, created_at, updated_at";

pub(crate) const POST_COLUMNS: &str = "id, thread_id, author_id, body, mentions, parent_post_id, \
     moderation_state, moderation_feedback, upvotes_count, downvotes_count, replies_count, created_at, updated_at";

/// Maps storage failures onto the domain taxonomy. Unique violations become
/// `Conflict` so the engine can tell a lost race from a broken database.
pub(crate) fn db_err(err: sqlx::Error) -> AppError {
    if let sqlx::Error::Database(db) = &err {
        if db.is_unique_violation() {
            return AppError::Conflict(db.message().to_string());
        }
    }
    AppError::Internal(err.to_string())
}

pub(crate) fn to_json<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| AppError::Internal(format!("encode column: {e}")))
}

pub(crate) fn from_json<T: DeserializeOwned>(raw: &str) -> Result<T> {
    serde_json::from_str(raw).map_err(|e| AppError::Internal(format!("decode column: {e}")))
}

fn parse_text<T: FromStr<Err = AppError>>(raw: &str) -> Result<T> {
    raw.parse().map_err(|e: AppError| AppError::Internal(e.to_string()))
}

#[derive(sqlx::FromRow)]
pub(crate) struct UserRow {
    id: Uuid,
    handle: String,
    display_name: String,
    avatar_url: Option<String>,
    threads_count: i64,
    posts_count: i64,
}

impl From<UserRow> for User {
    fn from(row: UserRow) -> Self {
        User {
            id: row.id,
            handle: row.handle,
            display_name: row.display_name,
            avatar_url: row.avatar_url,
            threads_count: row.threads_count,
            posts_count: row.posts_count,
        }
    }
}

#[derive(sqlx::FromRow)]
pub(crate) struct ThreadRow {
    id: Uuid,
    title: String,
    slug: String,
    author_id: Uuid,
    tags: String,
    status: String,
    last_activity_at: DateTime<Utc>,
    posts_count: i64,
    participants_count: i64,
    participant_ids: String,
    summary: Option<String>,
    summary_generated_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<ThreadRow> for Thread {
    type Error = AppError;

    fn try_from(row: ThreadRow) -> Result<Self> {
        Ok(Thread {
            id: row.id,
            title: row.title,
            slug: row.slug,
            author_id: row.author_id,
            tags: from_json(&row.tags)?,
            status: parse_text(&row.status)?,
            last_activity_at: row.last_activity_at,
            posts_count: row.posts_count,
            participants_count: row.participants_count,
            participant_ids: from_json(&row.participant_ids)?,
            summary: row.summary,
            summary_generated_at: row.summary_generated_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
pub(crate) struct PostRow {
    id: Uuid,
    thread_id: Uuid,
    author_id: Uuid,
    body: String,
    mentions: String,
    parent_post_id: Option<Uuid>,
    moderation_state: String,
    moderation_feedback: Option<String>,
    upvotes_count: i64,
    downvotes_count: i64,
    replies_count: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<PostRow> for Post {
    type Error = AppError;

    fn try_from(row: PostRow) -> Result<Self> {
        Ok(Post {
            id: row.id,
            thread_id: row.thread_id,
            author_id: row.author_id,
            body: row.body,
            mentions: from_json(&row.mentions)?,
            parent_post_id: row.parent_post_id,
            moderation_state: parse_text(&row.moderation_state)?,
            moderation_feedback: row.moderation_feedback.as_deref().map(from_json::<serde_json::Value>).transpose()?,
            upvotes_count: row.upvotes_count,
            downvotes_count: row.downvotes_count,
            replies_count: row.replies_count,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
pub(crate) struct ReactionRow {
    post_id: Uuid,
    user_id: Uuid,
    kind: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<ReactionRow> for Reaction {
    type Error = AppError;

    fn try_from(row: ReactionRow) -> Result<Self> {
        Ok(Reaction {
            post_id: row.post_id,
            user_id: row.user_id,
            kind: parse_text(&row.kind)?,
            created_at: row.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
pub(crate) struct MentionRow {
    post_id: Uuid,
    mentioned_user_id: Uuid,
    notified: bool,
    notified_at: Option<DateTime<Utc>>,
}

impl From<MentionRow> for Mention {
    fn from(row: MentionRow) -> Self {
        Mention {
            post_id: row.post_id,
            mentioned_user_id: row.mentioned_user_id,
            notified: row.notified,
            notified_at: row.notified_at,
        }
    }
}

#[derive(sqlx::FromRow)]
pub(crate) struct NotificationRow {
    id: Uuid,
    user_id: Uuid,
    event: String,
    payload: String,
    read: bool,
    read_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl TryFrom<NotificationRow> for Notification {
    type Error = AppError;

    fn try_from(row: NotificationRow) -> Result<Self> {
        Ok(Notification {
            id: row.id,
            user_id: row.user_id,
            event: row.event,
            payload: from_json(&row.payload)?,
            read: row.read,
            read_at: row.read_at,
            created_at: row.created_at,
        })
    }
}

pub(crate) fn threads(rows: Vec<ThreadRow>) -> Result<Vec<Thread>> {
    rows.into_iter().map(Thread::try_from).collect()
}

pub(crate) fn posts(rows: Vec<PostRow>) -> Result<Vec<Post>> {
    rows.into_iter().map(Post::try_from).collect()
}
