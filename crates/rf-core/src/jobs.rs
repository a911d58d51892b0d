//! Background job types.
//!
//! A job is a [`JobPayload`] variant plus retry bookkeeping. Each variant has
//! its own named queue so the three kinds can be tuned independently.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Classify a post body and write the verdict back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModerationJob {
    pub post_id: Uuid,
    pub thread_id: Uuid,
}

/// Summarize a thread from its title and opening post.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryJob {
    pub thread_id: Uuid,
}

/// Deliver a notification event to the outbound webhook.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationJob {
    pub event: String,
    pub user_ids: Vec<Uuid>,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum JobPayload {
    Moderation(ModerationJob),
    Summary(SummaryJob),
    Notification(NotificationJob),
}

impl JobPayload {
    pub fn kind(&self) -> JobKind {
        match self {
            Self::Moderation(_) => JobKind::Moderation,
            Self::Summary(_) => JobKind::Summary,
            Self::Notification(_) => JobKind::Notification,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Moderation,
    Summary,
    Notification,
}

impl JobKind {
    pub const ALL: [JobKind; 3] = [JobKind::Moderation, JobKind::Summary, JobKind::Notification];

    /// Queue used when configuration does not override it.
    pub fn default_queue(&self) -> &'static str {
        match self {
            Self::Moderation => "moderation",
            Self::Summary => "summary",
            Self::Notification => "notification",
        }
    }
}

/// Retry delay policy, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Backoff {
    Fixed { delay_ms: u64 },
    /// `delay_ms * 2^(n-1)` before the n-th retry
    Exponential { delay_ms: u64 },
}

impl Backoff {
    /// Delay after `attempts_made` failed attempts (1-indexed).
    pub fn delay_after(&self, attempts_made: u32) -> Duration {
        match *self {
            Self::Fixed { delay_ms } => Duration::from_millis(delay_ms),
            Self::Exponential { delay_ms } => {
                let exp = attempts_made.saturating_sub(1).min(20);
                Duration::from_millis(delay_ms.saturating_mul(1u64 << exp))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobOptions {
    /// Total attempts including the first one
    pub attempts: u32,
    pub backoff: Backoff,
    pub remove_on_complete: bool,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Backoff::Exponential { delay_ms: 2_000 },
            remove_on_complete: true,
        }
    }
}

/// A job as held by a queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: Uuid,
    pub queue: String,
    pub payload: JobPayload,
    /// Failed attempts so far
    pub attempts_made: u32,
    pub options: JobOptions,
    pub enqueued_at: DateTime<Utc>,
    /// Not reserved before this instant
    pub run_at: DateTime<Utc>,
}

impl Job {
    pub fn new(queue: &str, payload: JobPayload, options: JobOptions) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            queue: queue.to_string(),
            payload,
            attempts_made: 0,
            options,
            enqueued_at: now,
            run_at: now,
        }
    }

    /// 1-indexed number of the attempt currently running.
    pub fn attempt(&self) -> u32 {
        self.attempts_made + 1
    }

    /// Where this job goes after one more failure at `now`.
    pub fn fate_after_failure(&self, now: DateTime<Utc>) -> JobFate {
        let attempts_made = self.attempts_made + 1;
        if attempts_made >= self.options.attempts {
            return JobFate::Dead { attempts_made };
        }
        let delay = self.options.backoff.delay_after(attempts_made);
        let delay = chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        JobFate::Retry {
            attempts_made,
            run_at: now + delay,
        }
    }
}

/// Outcome of reporting a failed attempt back to the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobFate {
    Retry { attempts_made: u32, run_at: DateTime<Utc> },
    /// Attempts exhausted, the job is abandoned
    Dead { attempts_made: u32 },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn moderation() -> JobPayload {
        JobPayload::Moderation(ModerationJob {
            post_id: Uuid::now_v7(),
            thread_id: Uuid::now_v7(),
        })
    }

    #[test]
    fn test_exponential_backoff_doubles() {
        let b = Backoff::Exponential { delay_ms: 5_000 };
        assert_eq!(b.delay_after(1), Duration::from_secs(5));
        assert_eq!(b.delay_after(2), Duration::from_secs(10));
        assert_eq!(b.delay_after(3), Duration::from_secs(20));
    }

    #[test]
    fn test_fate_retries_until_attempts_exhausted() {
        let now = Utc::now();
        let mut job = Job::new("moderation", moderation(), JobOptions::default());

        match job.fate_after_failure(now) {
            JobFate::Retry { attempts_made, run_at } => {
                assert_eq!(attempts_made, 1);
                assert_eq!(run_at, now + chrono::Duration::milliseconds(2_000));
            }
            other => panic!("expected retry, got {other:?}"),
        }

        job.attempts_made = 2;
        assert_eq!(job.fate_after_failure(now), JobFate::Dead { attempts_made: 3 });
    }

    #[test]
    fn test_payload_is_tagged() {
        let json = serde_json::to_value(moderation()).unwrap();
        assert_eq!(json["kind"], "moderation");
        assert!(json["data"]["postId"].is_string());
    }
}
