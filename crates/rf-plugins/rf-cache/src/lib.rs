//! # rf-cache
//!
//! `Cache` implementations: an in-process map for single-node runs and tests,
//! and Redis (feature `redis`) when several processes share one cache.

#[cfg(feature = "redis")]
mod redis;

#[cfg(feature = "redis")]
pub use self::redis::RedisCache;

use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use rf_core::cache_keys::matches_pattern;
use rf_core::traits::Cache;

struct Entry {
    value: String,
    expires_at: Instant,
}

/// In-process cache. Expired entries are dropped lazily on read and during
/// pattern deletes.
#[derive(Default)]
pub struct MemoryCache {
    entries: DashMap<String, Entry>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Live (unexpired) keys, mostly for test assertions.
    pub fn keys(&self) -> Vec<String> {
        let now = Instant::now();
        self.entries
            .iter()
            .filter(|e| e.expires_at > now)
            .map(|e| e.key().clone())
            .collect()
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        let now = Instant::now();
        if let Some(entry) = self.entries.get(key) {
            if entry.expires_at > now {
                return Ok(Some(entry.value.clone()));
            }
        }
        self.entries.remove_if(key, |_, e| e.expires_at <= now);
        Ok(None)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> anyhow::Result<()> {
        self.entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> anyhow::Result<()> {
        self.entries.remove(key);
        Ok(())
    }

    async fn delete_pattern(&self, pattern: &str) -> anyhow::Result<u64> {
        let now = Instant::now();
        let mut removed = 0;
        self.entries.retain(|key, entry| {
            if entry.expires_at <= now {
                return false;
            }
            if matches_pattern(pattern, key) {
                removed += 1;
                return false;
            }
            true
        });
        tracing::trace!(pattern, removed, "cache pattern invalidated");
        Ok(removed)
    }
}
