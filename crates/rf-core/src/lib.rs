//! rusty-forum/crates/rf-core/src/lib.rs
//!
//! The central domain types and interface definitions for Rusty-Forum.

pub mod cache_keys;
pub mod error;
pub mod events;
pub mod jobs;
pub mod mentions;
pub mod models;
pub mod reactions;
pub mod slug;
pub mod traits;

// Re-exporting for easier access in other crates
pub use error::*;
pub use events::*;
pub use jobs::*;
pub use models::*;
pub use reactions::*;
pub use traits::*;
