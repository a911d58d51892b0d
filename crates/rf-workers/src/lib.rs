//! # rf-workers
//!
//! Queue consumers. A [`Worker`] pulls one named queue with bounded
//! concurrency and hands each job to a [`JobHandler`]; failures go back to
//! the queue for retry with backoff.

pub mod extract;
pub mod handlers;
pub mod http;
pub mod runtime;

pub use handlers::{ModerationHandler, NotificationHandler, SummaryHandler};
pub use runtime::{JobHandler, Worker};
