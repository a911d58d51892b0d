//! # rf-engine
//!
//! Thread/post mutation engine and the cached read path. Storage, cache,
//! queue and realtime transport are injected as `rf-core` ports.

pub mod best_effort;
pub mod dispatch;
pub mod engine;
pub mod invalidate;
pub mod notify;
pub mod reads;

pub use dispatch::{DispatchPolicy, JobDispatcher, Route};
pub use engine::{MutationEngine, NewPost, NewThread};
pub use invalidate::CacheInvalidator;
pub use notify::Notifier;
pub use reads::{ReadSettings, ThreadReader};
