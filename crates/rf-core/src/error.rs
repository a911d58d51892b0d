//! # AppError
//!
//! Centralized error handling for the Rusty-Forum ecosystem.
//! Every mutation surfaces one of these synchronously; the transaction that
//! produced it has already been rolled back.

use thiserror::Error;

/// The primary error type for all rf-core operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AppError {
    /// Resource not found (e.g., Thread, Post, parent Post, User),
    /// or found but not under the stated parent.
    #[error("{0} not found with ID {1}")]
    NotFound(String, String),

    /// The actor may not perform this action (ownership, locked thread).
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Validation failure (e.g., empty body after trimming)
    #[error("validation error: {0}")]
    ValidationError(String),

    /// Unique constraint hit (slug, reaction pair). Consumed inside the
    /// engine and never handed to callers for those cases.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Infrastructure failure (e.g., DB down)
    #[error("internal service error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn not_found(kind: &str, id: impl ToString) -> Self {
        Self::NotFound(kind.to_string(), id.to_string())
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

/// A specialized Result type for Rusty-Forum logic.
pub type Result<T> = std::result::Result<T, AppError>;
