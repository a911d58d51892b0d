//! Realtime events and the rooms they are broadcast to.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{EnrichedPost, Notification, ReactionType, Thread};

/// Broadcast partition. Clients join thread rooms explicitly and their own
/// user room on authenticated connect; everyone hears `Global`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Room {
    Global,
    Thread(Uuid),
    User(Uuid),
}

impl fmt::Display for Room {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Room::Global => f.write_str("global"),
            Room::Thread(id) => write!(f, "thread:{id}"),
            Room::User(id) => write!(f, "user:{id}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum RealtimeEvent {
    #[serde(rename = "thread.created")]
    ThreadCreated { thread: Thread, post: EnrichedPost },

    #[serde(rename = "thread.updated")]
    ThreadUpdated { thread: Thread },

    #[serde(rename = "thread.deleted", rename_all = "camelCase")]
    ThreadDeleted { thread_id: Uuid },

    /// Global companion of `post.created`, for thread lists
    #[serde(rename = "thread.activity", rename_all = "camelCase")]
    ThreadActivity {
        thread_id: Uuid,
        post_id: Uuid,
        posts_count: i64,
        last_activity_at: DateTime<Utc>,
    },

    #[serde(rename = "post.created")]
    PostCreated { post: EnrichedPost },

    #[serde(rename = "post.updated")]
    PostUpdated { post: EnrichedPost },

    #[serde(rename = "post.deleted", rename_all = "camelCase")]
    PostDeleted { thread_id: Uuid, post_id: Uuid },

    #[serde(rename = "post.reaction", rename_all = "camelCase")]
    PostReaction {
        thread_id: Uuid,
        post_id: Uuid,
        user_id: Uuid,
        upvotes_count: i64,
        downvotes_count: i64,
        reaction: Option<ReactionType>,
    },

    #[serde(rename = "post.moderated")]
    PostModerated { post: EnrichedPost },

    #[serde(rename = "post.mentioned", rename_all = "camelCase")]
    PostMentioned {
        thread_id: Uuid,
        post_id: Uuid,
        author_id: Uuid,
        mentioned_user_ids: Vec<Uuid>,
    },

    #[serde(rename = "notification.created")]
    NotificationCreated { notification: Notification },
}

impl RealtimeEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ThreadCreated { .. } => "thread.created",
            Self::ThreadUpdated { .. } => "thread.updated",
            Self::ThreadDeleted { .. } => "thread.deleted",
            Self::ThreadActivity { .. } => "thread.activity",
            Self::PostCreated { .. } => "post.created",
            Self::PostUpdated { .. } => "post.updated",
            Self::PostDeleted { .. } => "post.deleted",
            Self::PostReaction { .. } => "post.reaction",
            Self::PostModerated { .. } => "post.moderated",
            Self::PostMentioned { .. } => "post.mentioned",
            Self::NotificationCreated { .. } => "notification.created",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_name_matches_tag() {
        let event = RealtimeEvent::PostDeleted {
            thread_id: Uuid::now_v7(),
            post_id: Uuid::now_v7(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], event.name());
        assert!(json["data"]["postId"].is_string());
    }

    #[test]
    fn test_room_display() {
        let id = Uuid::nil();
        assert_eq!(Room::Thread(id).to_string(), format!("thread:{id}"));
        assert_eq!(Room::Global.to_string(), "global");
    }
}
