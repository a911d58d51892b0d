//! # Domain Models
//!
//! These structs represent the core entities of Rusty-Forum.
//! We use UUID v7 for time-ordered, globally unique identification.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;

/// Lifecycle of a thread. Only `Open` threads accept new posts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThreadStatus {
    Open,
    Locked,
    Archived,
}

/// Moderation lifecycle tag applied to a post.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModerationState {
    Pending,
    Approved,
    Flagged,
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReactionType {
    Upvote,
    Downvote,
}

macro_rules! text_enum {
    ($ty:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = AppError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(AppError::ValidationError(format!(
                        "unknown {} '{}'",
                        $kind, other
                    ))),
                }
            }
        }
    };
}

text_enum!(ThreadStatus, "thread status", {
    Open => "open",
    Locked => "locked",
    Archived => "archived",
});

text_enum!(ModerationState, "moderation state", {
    Pending => "pending",
    Approved => "approved",
    Flagged => "flagged",
    Rejected => "rejected",
});

text_enum!(ReactionType, "reaction type", {
    Upvote => "upvote",
    Downvote => "downvote",
});

/// A registered member. Identity itself is owned by an external service;
/// we keep the handle for mention resolution and the activity counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    /// Unique, compared case-insensitively
    pub handle: String,
    pub display_name: String,
    pub avatar_url: Option<String>,
    pub threads_count: i64,
    pub posts_count: i64,
}

impl User {
    pub fn new(handle: &str, display_name: &str) -> Self {
        Self {
            id: Uuid::now_v7(),
            handle: handle.to_string(),
            display_name: display_name.to_string(),
            avatar_url: None,
            threads_count: 0,
            posts_count: 0,
        }
    }

    pub fn summary(&self) -> AuthorSummary {
        AuthorSummary {
            id: self.id,
            handle: self.handle.clone(),
            display_name: self.display_name.clone(),
            avatar_url: self.avatar_url.clone(),
        }
    }
}

/// The authenticated identity handed to every mutation by the session layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub user_id: Uuid,
    pub roles: Vec<String>,
}

impl Actor {
    pub fn new(user_id: Uuid) -> Self {
        Self { user_id, roles: Vec::new() }
    }

    pub fn with_role(mut self, role: &str) -> Self {
        self.roles.push(role.to_string());
        self
    }
}

/// Top-level discussion unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Thread {
    pub id: Uuid,
    pub title: String,
    /// Immutable once assigned, unique across all threads
    pub slug: String,
    pub author_id: Uuid,
    pub tags: Vec<String>,
    pub status: ThreadStatus,
    /// Only ever moves forward
    pub last_activity_at: DateTime<Utc>,
    pub posts_count: i64,
    pub participants_count: i64,
    /// Authors with at least one surviving post, plus the thread author
    pub participant_ids: Vec<Uuid>,
    pub summary: Option<String>,
    pub summary_generated_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Thread {
    pub fn is_open(&self) -> bool {
        self.status == ThreadStatus::Open
    }

    pub fn has_participant(&self, user_id: Uuid) -> bool {
        self.participant_ids.contains(&user_id)
    }
}

/// A message within a thread, optionally replying to another post.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Post {
    pub id: Uuid,
    pub thread_id: Uuid,
    pub author_id: Uuid,
    pub body: String,
    /// Handles resolved at write time, in order of first appearance
    pub mentions: Vec<String>,
    pub parent_post_id: Option<Uuid>,
    pub moderation_state: ModerationState,
    pub moderation_feedback: Option<serde_json::Value>,
    pub upvotes_count: i64,
    pub downvotes_count: i64,
    pub replies_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reaction {
    pub post_id: Uuid,
    pub user_id: Uuid,
    #[serde(rename = "type")]
    pub kind: ReactionType,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mention {
    pub post_id: Uuid,
    pub mentioned_user_id: Uuid,
    pub notified: bool,
    pub notified_at: Option<DateTime<Utc>>,
}

/// In-app notification. Read state is managed outside this crate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: Uuid,
    pub user_id: Uuid,
    pub event: String,
    pub payload: serde_json::Value,
    pub read: bool,
    pub read_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    pub fn new(user_id: Uuid, event: &str, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::now_v7(),
            user_id,
            event: event.to_string(),
            payload,
            read: false,
            read_at: None,
            created_at: Utc::now(),
        }
    }
}

/// Author display data attached to posts on the way out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorSummary {
    pub id: Uuid,
    pub handle: String,
    pub display_name: String,
    pub avatar_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrichedPost {
    #[serde(flatten)]
    pub post: Post,
    pub author: Option<AuthorSummary>,
}

/// Counter snapshot returned by reaction mutations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReactionSummary {
    pub thread_id: Uuid,
    pub post_id: Uuid,
    pub post_author_id: Uuid,
    pub upvotes_count: i64,
    pub downvotes_count: i64,
    /// The acting user's reaction after the mutation
    pub reaction: Option<ReactionType>,
}

/// Result of `createThread`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedThread {
    pub thread: Thread,
    pub post: EnrichedPost,
}

/// What a post deletion committed, for side-effect bookkeeping.
#[derive(Debug, Clone, PartialEq)]
pub struct DeletedPost {
    pub post: Post,
    pub thread: Thread,
}

/// What a thread deletion committed.
#[derive(Debug, Clone, PartialEq)]
pub struct DeletedThread {
    pub thread: Thread,
    pub post_ids: Vec<Uuid>,
}

/// List-with-pagination envelope. Also the cached representation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub page: u32,
    pub limit: u32,
    pub total: i64,
}

impl<T> Page<T> {
    pub fn offset(page: u32, limit: u32) -> i64 {
        i64::from(page.saturating_sub(1)) * i64::from(limit)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadWithPosts {
    pub thread: Thread,
    pub posts: Page<EnrichedPost>,
}

/// Filters for the thread list. Every field takes part in the cache key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadQuery {
    pub status: Option<ThreadStatus>,
    pub tag: Option<String>,
    pub search: Option<String>,
    pub page: u32,
    pub limit: u32,
}

impl Default for ThreadQuery {
    fn default() -> Self {
        Self {
            status: None,
            tag: None,
            search: None,
            page: 1,
            limit: 20,
        }
    }
}
