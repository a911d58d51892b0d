//! One handler per queue. Each rejects payloads of another kind so a
//! misrouted job dies loudly instead of being silently dropped.

mod moderation;
mod notification;
mod summary;

pub use moderation::ModerationHandler;
pub use notification::NotificationHandler;
pub use summary::SummaryHandler;

use rf_core::jobs::{Job, JobKind};

fn wrong_kind(job: &Job, expected: JobKind) -> anyhow::Error {
    anyhow::anyhow!(
        "job {} on queue '{}' carries a {:?} payload, expected {:?}",
        job.id,
        job.queue,
        job.payload.kind(),
        expected
    )
}
