//! Cached read path.
//!
//! Results are JSON envelopes stored under deterministic keys. Any cache
//! failure, or an entry that no longer decodes, degrades to a storage read.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rf_core::cache_keys;
use rf_core::error::{AppError, Result};
use rf_core::models::{EnrichedPost, Page, Post, Thread, ThreadQuery, ThreadWithPosts};
use rf_core::traits::{Cache, ForumRepo};
use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

use crate::best_effort::best_effort;

pub const MAX_PAGE_SIZE: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadSettings {
    pub list_ttl: Duration,
    pub detail_ttl: Duration,
}

impl Default for ReadSettings {
    fn default() -> Self {
        Self {
            list_ttl: Duration::from_secs(60),
            detail_ttl: Duration::from_secs(45),
        }
    }
}

/// Attaches author display data. A failed user lookup leaves `author` empty
/// rather than failing the caller.
pub async fn enrich_posts(repo: &dyn ForumRepo, posts: Vec<Post>) -> Vec<EnrichedPost> {
    let mut ids: Vec<Uuid> = posts.iter().map(|p| p.author_id).collect();
    ids.sort_unstable();
    ids.dedup();

    let authors: HashMap<Uuid, _> = best_effort("load post authors", repo.get_users(&ids))
        .await
        .unwrap_or_default()
        .into_iter()
        .map(|u| (u.id, u.summary()))
        .collect();

    posts
        .into_iter()
        .map(|post| EnrichedPost {
            author: authors.get(&post.author_id).cloned(),
            post,
        })
        .collect()
}

pub async fn enrich_post(repo: &dyn ForumRepo, post: Post) -> EnrichedPost {
    let mut enriched = enrich_posts(repo, vec![post.clone()]).await;
    enriched.pop().unwrap_or(EnrichedPost { post, author: None })
}

fn page_bounds(page: u32, limit: u32) -> (u32, u32) {
    (page.max(1), limit.clamp(1, MAX_PAGE_SIZE))
}

#[derive(Clone)]
pub struct ThreadReader {
    repo: Arc<dyn ForumRepo>,
    cache: Arc<dyn Cache>,
    settings: ReadSettings,
}

impl ThreadReader {
    pub fn new(repo: Arc<dyn ForumRepo>, cache: Arc<dyn Cache>, settings: ReadSettings) -> Self {
        Self { repo, cache, settings }
    }

    #[tracing::instrument(skip(self))]
    pub async fn get_thread_with_posts(&self, thread_id: Uuid, page: u32, limit: u32) -> Result<ThreadWithPosts> {
        let (page, limit) = page_bounds(page, limit);
        let key = cache_keys::thread_detail(thread_id, page, limit);

        self.cached(&key, self.settings.detail_ttl, move || async move {
            let thread = self
                .repo
                .get_thread(thread_id)
                .await?
                .ok_or_else(|| AppError::not_found("Thread", thread_id))?;
            let posts = self.repo.list_posts(thread_id, page, limit).await?;
            let items = enrich_posts(self.repo.as_ref(), posts.items).await;
            Ok(ThreadWithPosts {
                thread,
                posts: Page {
                    items,
                    page: posts.page,
                    limit: posts.limit,
                    total: posts.total,
                },
            })
        })
        .await
    }

    #[tracing::instrument(skip(self))]
    pub async fn list_threads(&self, query: &ThreadQuery) -> Result<Page<Thread>> {
        let (page, limit) = page_bounds(query.page, query.limit);
        let query = ThreadQuery { page, limit, ..query.clone() };
        let key = cache_keys::thread_list(&query);
        let query = &query;

        self.cached(&key, self.settings.list_ttl, move || self.repo.list_threads(query))
            .await
    }

    pub async fn search_threads(&self, keyword: &str, page: u32, limit: u32) -> Result<Page<Thread>> {
        let query = ThreadQuery {
            search: Some(keyword.to_string()),
            page,
            limit,
            ..ThreadQuery::default()
        };
        self.list_threads(&query).await
    }

    #[tracing::instrument(skip(self))]
    pub async fn list_threads_by_author(&self, author_id: Uuid, page: u32, limit: u32) -> Result<Page<Thread>> {
        let (page, limit) = page_bounds(page, limit);
        let key = cache_keys::author_threads(author_id, page, limit);

        self.cached(&key, self.settings.list_ttl, move || {
            self.repo.list_threads_by_author(author_id, page, limit)
        })
        .await
    }

    async fn cached<T, F, Fut>(&self, key: &str, ttl: Duration, load: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if let Some(Some(raw)) = best_effort("cache read", self.cache.get(key)).await {
            match serde_json::from_str::<T>(&raw) {
                Ok(hit) => {
                    tracing::trace!(key, "cache hit");
                    return Ok(hit);
                }
                Err(err) => tracing::warn!(key, error = %err, "discarding undecodable cache entry"),
            }
        }

        let value = load().await?;
        match serde_json::to_string(&value) {
            Ok(raw) => {
                best_effort("cache write", self.cache.set(key, &raw, ttl)).await;
            }
            Err(err) => tracing::warn!(key, error = %err, "result not cacheable"),
        }
        Ok(value)
    }
}
