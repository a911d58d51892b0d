//! In-app notification fan-in.
//!
//! A notification is recorded as rows for immediate in-app delivery, pushed
//! to each recipient's user room, and handed to the webhook queue.

use std::collections::HashSet;
use std::sync::Arc;

use rf_core::events::{RealtimeEvent, Room};
use rf_core::models::Notification;
use rf_core::traits::{Fanout, ForumRepo};
use uuid::Uuid;

use crate::best_effort::best_effort;
use crate::dispatch::JobDispatcher;

pub const THREAD_REPLY: &str = "thread.reply";
pub const POST_MENTIONED: &str = "post.mentioned";
pub const POST_REACTED: &str = "post.reacted";

#[derive(Clone)]
pub struct Notifier {
    repo: Arc<dyn ForumRepo>,
    fanout: Arc<dyn Fanout>,
    dispatcher: JobDispatcher,
}

impl Notifier {
    pub fn new(repo: Arc<dyn ForumRepo>, fanout: Arc<dyn Fanout>, dispatcher: JobDispatcher) -> Self {
        Self {
            repo,
            fanout,
            dispatcher,
        }
    }

    /// Notifies each distinct recipient once. Returns how many were targeted.
    pub async fn notify(&self, user_ids: &[Uuid], event: &str, payload: serde_json::Value) -> usize {
        let mut seen = HashSet::new();
        let recipients: Vec<Uuid> = user_ids.iter().copied().filter(|id| seen.insert(*id)).collect();
        if recipients.is_empty() {
            return 0;
        }

        let rows: Vec<Notification> = recipients
            .iter()
            .map(|user_id| Notification::new(*user_id, event, payload.clone()))
            .collect();

        if best_effort("store notifications", self.repo.insert_notifications(&rows))
            .await
            .is_some()
        {
            for notification in rows {
                let room = Room::User(notification.user_id);
                self.fanout.publish(room, RealtimeEvent::NotificationCreated { notification });
            }
        }

        self.dispatcher
            .deliver_notification(event, recipients.clone(), payload)
            .await;

        tracing::debug!(event, recipients = recipients.len(), "notification dispatched");
        recipients.len()
    }
}
