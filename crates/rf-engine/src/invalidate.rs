//! Write-driven cache invalidation. Every helper is best-effort: a cache
//! outage only means readers see data until the TTL runs out.

use std::sync::Arc;

use rf_core::cache_keys;
use rf_core::traits::Cache;
use uuid::Uuid;

use crate::best_effort::best_effort;

#[derive(Clone)]
pub struct CacheInvalidator {
    cache: Arc<dyn Cache>,
}

impl CacheInvalidator {
    pub fn new(cache: Arc<dyn Cache>) -> Self {
        Self { cache }
    }

    pub async fn thread_detail(&self, thread_id: Uuid) {
        self.pattern(&cache_keys::thread_detail_pattern(thread_id)).await;
    }

    /// Global lists plus the lists of one author.
    pub async fn thread_lists(&self, author_id: Uuid) {
        let lists = cache_keys::thread_list_pattern();
        let authored = cache_keys::author_threads_pattern(author_id);
        tokio::join!(self.pattern(&lists), self.pattern(&authored));
    }

    /// Everything a thread appears in.
    pub async fn thread(&self, thread_id: Uuid, author_id: Uuid) {
        tokio::join!(self.thread_detail(thread_id), self.thread_lists(author_id));
    }

    async fn pattern(&self, pattern: &str) {
        best_effort("cache invalidation", self.cache.delete_pattern(pattern)).await;
    }
}
