//! Post-commit side effects.
//!
//! Once a transaction has committed, nothing that follows may fail the
//! mutation. Every cache, queue and notification call made after commit goes
//! through [`best_effort`], which logs the failure and swallows it.

use std::fmt::Display;
use std::future::Future;

/// Awaits `fut`; on error logs a warning naming `what` and returns `None`.
pub async fn best_effort<T, E, F>(what: &str, fut: F) -> Option<T>
where
    F: Future<Output = Result<T, E>>,
    E: Display,
{
    match fut.await {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::warn!(side_effect = what, error = %err, "side effect failed, continuing");
            None
        }
    }
}
