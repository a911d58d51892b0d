//! # rf-db-sqlite Implementation
//!
//! This crate implements `ForumRepo` and a durable `JobQueue` on SQLite.
//! Each mutating repo method runs inside a single transaction: row writes
//! and every denormalized counter they touch commit together or not at all.

mod queue;
mod rows;

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rf_core::error::{AppError, Result};
use rf_core::mentions::ResolvedMentions;
use rf_core::models::{
    DeletedPost, DeletedThread, Mention, ModerationState, Notification, Page, Post, Reaction,
    ReactionSummary, ReactionType, Thread, ThreadQuery, ThreadStatus, User,
};
use rf_core::reactions::{ReactionOutcome, ReactionRequest, RowChange};
use rf_core::traits::{ForumRepo, ModerationOutcome};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePool, SqlitePoolOptions,
};
use sqlx::{QueryBuilder, Sqlite, Transaction};
use uuid::Uuid;

pub use queue::SqliteJobQueue;
use rows::{
    db_err, to_json, MentionRow, NotificationRow, PostRow, ReactionRow, ThreadRow, UserRow,
    POST_COLUMNS, THREAD_COLUMNS, USER_COLUMNS,
};

/// Opens (creating if needed) the database and applies pending migrations.
pub async fn connect(url: &str, max_connections: u32) -> anyhow::Result<SqlitePool> {
    let in_memory = url.contains(":memory:");
    let mut options = SqliteConnectOptions::from_str(url)?
        .create_if_missing(true)
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(5));
    if !in_memory {
        // Readers keep going while one writer holds the lock.
        options = options.journal_mode(SqliteJournalMode::Wal);
    }

    let mut pool_options = SqlitePoolOptions::new().max_connections(max_connections.max(1));
    if in_memory {
        // An in-memory database lives exactly as long as its one connection.
        pool_options = pool_options
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None);
    }

    let pool = pool_options.connect_with(options).await?;
    sqlx::migrate!("./migrations").run(&pool).await?;
    Ok(pool)
}

/// Opens a transaction that holds the write lock from its first statement.
/// A deferred `BEGIN` that reads and then writes cannot wait for the lock
/// and fails with `SQLITE_BUSY` when another writer got there first.
pub(crate) async fn begin_write(pool: &SqlitePool) -> sqlx::Result<Transaction<'static, Sqlite>> {
    pool.begin_with("BEGIN IMMEDIATE").await
}

#[derive(Clone)]
pub struct SqliteForumRepo {
    pool: SqlitePool,
}

impl SqliteForumRepo {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Fresh private database, mostly for tests and local runs.
    pub async fn in_memory() -> anyhow::Result<Self> {
        Ok(Self::new(connect("sqlite::memory:", 1).await?))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

async fn fetch_thread(conn: &mut SqliteConnection, id: Uuid) -> Result<Option<Thread>> {
    let sql = format!("SELECT {THREAD_COLUMNS} FROM threads WHERE id = ?");
    sqlx::query_as::<_, ThreadRow>(&sql)
        .bind(id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(db_err)?
        .map(Thread::try_from)
        .transpose()
}

async fn fetch_post(conn: &mut SqliteConnection, id: Uuid) -> Result<Option<Post>> {
    let sql = format!("SELECT {POST_COLUMNS} FROM posts WHERE id = ?");
    sqlx::query_as::<_, PostRow>(&sql)
        .bind(id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(db_err)?
        .map(Post::try_from)
        .transpose()
}

async fn require_thread(conn: &mut SqliteConnection, id: Uuid) -> Result<Thread> {
    fetch_thread(conn, id)
        .await?
        .ok_or_else(|| AppError::not_found("Thread", id))
}

async fn require_post(conn: &mut SqliteConnection, id: Uuid) -> Result<Post> {
    fetch_post(conn, id)
        .await?
        .ok_or_else(|| AppError::not_found("Post", id))
}

async fn insert_post(conn: &mut SqliteConnection, post: &Post) -> Result<()> {
    let feedback = post.moderation_feedback.as_ref().map(to_json).transpose()?;
    sqlx::query(
        "INSERT INTO posts (id, thread_id, author_id, body, mentions, parent_post_id, moderation_state, \
         moderation_feedback, upvotes_count, downvotes_count, replies_count, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(post.id)
    .bind(post.thread_id)
    .bind(post.author_id)
    .bind(&post.body)
    .bind(to_json(&post.mentions)?)
    .bind(post.parent_post_id)
    .bind(post.moderation_state.as_str())
    .bind(feedback)
    .bind(post.upvotes_count)
    .bind(post.downvotes_count)
    .bind(post.replies_count)
    .bind(post.created_at)
    .bind(post.updated_at)
    .execute(&mut *conn)
    .await
    .map_err(db_err)?;
    Ok(())
}

/// Delete-all then insert-new for one post, keeping `posts.mentions` in step.
async fn write_mentions(conn: &mut SqliteConnection, post_id: Uuid, mentions: &ResolvedMentions) -> Result<()> {
    sqlx::query("DELETE FROM mentions WHERE post_id = ?")
        .bind(post_id)
        .execute(&mut *conn)
        .await
        .map_err(db_err)?;

    for user_id in &mentions.user_ids {
        sqlx::query("INSERT INTO mentions (post_id, mentioned_user_id, notified) VALUES (?, ?, 0)")
            .bind(post_id)
            .bind(user_id)
            .execute(&mut *conn)
            .await
            .map_err(db_err)?;
    }

    let updated = sqlx::query("UPDATE posts SET mentions = ? WHERE id = ?")
        .bind(to_json(&mentions.handles)?)
        .bind(post_id)
        .execute(&mut *conn)
        .await
        .map_err(db_err)?;
    if updated.rows_affected() == 0 {
        return Err(AppError::not_found("Post", post_id));
    }
    Ok(())
}

/// Moves `last_activity_at` forward, never back.
async fn touch_thread(conn: &mut SqliteConnection, thread: &Thread, at: DateTime<Utc>) -> Result<()> {
    let last_activity = thread.last_activity_at.max(at);
    sqlx::query("UPDATE threads SET last_activity_at = ?, updated_at = ? WHERE id = ?")
        .bind(last_activity)
        .bind(at)
        .bind(thread.id)
        .execute(&mut *conn)
        .await
        .map_err(db_err)?;
    Ok(())
}

fn push_thread_filters(qb: &mut QueryBuilder<'_, Sqlite>, query: &ThreadQuery) {
    qb.push(" WHERE 1 = 1");
    if let Some(status) = query.status {
        qb.push(" AND status = ").push_bind(status.as_str());
    }
    if let Some(tag) = query.tag.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
        qb.push(" AND EXISTS (SELECT 1 FROM json_each(threads.tags) WHERE json_each.value = ")
            .push_bind(tag.to_lowercase())
            .push(")");
    }
    if let Some(search) = query.search.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        let pattern = format!("%{}%", escape_like(search));
        qb.push(" AND (title LIKE ")
            .push_bind(pattern.clone())
            .push(" ESCAPE '\\' OR summary LIKE ")
            .push_bind(pattern)
            .push(" ESCAPE '\\')");
    }
}

fn escape_like(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

#[async_trait]
impl ForumRepo for SqliteForumRepo {
    async fn upsert_user(&self, user: &User) -> Result<()> {
        sqlx::query(
            "INSERT INTO users (id, handle, display_name, avatar_url, threads_count, posts_count) \
             VALUES (?, ?, ?, ?, ?, ?) \
             ON CONFLICT (id) DO UPDATE SET handle = excluded.handle, \
             display_name = excluded.display_name, avatar_url = excluded.avatar_url",
        )
        .bind(user.id)
        .bind(&user.handle)
        .bind(&user.display_name)
        .bind(&user.avatar_url)
        .bind(user.threads_count)
        .bind(user.posts_count)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_users(&self, ids: &[Uuid]) -> Result<Vec<User>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut qb = QueryBuilder::<Sqlite>::new(format!("SELECT {USER_COLUMNS} FROM users WHERE id IN ("));
        let mut list = qb.separated(", ");
        for id in ids {
            list.push_bind(*id);
        }
        list.push_unseparated(")");

        let rows = qb
            .build_query_as::<UserRow>()
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(rows.into_iter().map(User::from).collect())
    }

    async fn find_users_by_handles(&self, handles: &[String]) -> Result<Vec<User>> {
        if handles.is_empty() {
            return Ok(Vec::new());
        }
        let mut qb = QueryBuilder::<Sqlite>::new(format!("SELECT {USER_COLUMNS} FROM users WHERE handle IN ("));
        let mut list = qb.separated(", ");
        for handle in handles {
            list.push_bind(handle.clone());
        }
        list.push_unseparated(")");

        let rows = qb
            .build_query_as::<UserRow>()
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(rows.into_iter().map(User::from).collect())
    }

    async fn slug_exists(&self, slug: &str) -> Result<bool> {
        let found: Option<i64> = sqlx::query_scalar("SELECT 1 FROM threads WHERE slug = ?")
            .bind(slug)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(found.is_some())
    }

    async fn highest_slug_suffix(&self, base: &str) -> Result<Option<u64>> {
        // ?1 is where the suffix starts (1-based): just past "{base}-".
        let highest: Option<i64> = sqlx::query_scalar(
            "SELECT MAX(CAST(substr(slug, ?1) AS INTEGER)) FROM threads \
             WHERE slug LIKE ?2 ESCAPE '\\' AND length(slug) >= ?1 \
             AND substr(slug, ?1) NOT GLOB '*[^0-9]*'",
        )
        .bind(base.len() as i64 + 2)
        .bind(format!("{}-%", escape_like(base)))
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(highest.and_then(|n| u64::try_from(n).ok()))
    }

    /// Atomic operation to create a thread and its first post.
    ///
    /// # Developer Note
    /// Using a Transaction (tx) ensures we don't end up with "ghost threads"
    /// that have no initial post if the second insert fails.
    async fn create_thread(&self, thread: Thread, first_post: Post) -> Result<()> {
        let mut tx = begin_write(&self.pool).await.map_err(db_err)?;

        // 1. Insert Thread (slug uniqueness surfaces as Conflict)
        sqlx::query(
            "INSERT INTO threads (id, title, slug, author_id, tags, status, last_activity_at, posts_count, \
             participants_count, participant_ids, summary, summary_generated_at, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(thread.id)
        .bind(&thread.title)
        .bind(&thread.slug)
        .bind(thread.author_id)
        .bind(to_json(&thread.tags)?)
        .bind(thread.status.as_str())
        .bind(thread.last_activity_at)
        .bind(thread.posts_count)
        .bind(thread.participants_count)
        .bind(to_json(&thread.participant_ids)?)
        .bind(&thread.summary)
        .bind(thread.summary_generated_at)
        .bind(thread.created_at)
        .bind(thread.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        // 2. Insert the opening post
        insert_post(&mut tx, &first_post).await?;

        // 3. Author counters
        sqlx::query("UPDATE users SET threads_count = threads_count + 1, posts_count = posts_count + 1 WHERE id = ?")
            .bind(thread.author_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn get_thread(&self, id: Uuid) -> Result<Option<Thread>> {
        let mut conn = self.pool.acquire().await.map_err(db_err)?;
        fetch_thread(&mut conn, id).await
    }

    async fn list_threads(&self, query: &ThreadQuery) -> Result<Page<Thread>> {
        let limit = query.limit.max(1);

        let mut count = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM threads");
        push_thread_filters(&mut count, query);
        let total: i64 = count
            .build_query_scalar()
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;

        let mut qb = QueryBuilder::<Sqlite>::new(format!("SELECT {THREAD_COLUMNS} FROM threads"));
        push_thread_filters(&mut qb, query);
        qb.push(" ORDER BY last_activity_at DESC, id DESC LIMIT ")
            .push_bind(i64::from(limit))
            .push(" OFFSET ")
            .push_bind(Page::<Thread>::offset(query.page, limit));

        let rows = qb
            .build_query_as::<ThreadRow>()
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;

        Ok(Page {
            items: rows::threads(rows)?,
            page: query.page.max(1),
            limit,
            total,
        })
    }

    async fn list_threads_by_author(&self, author_id: Uuid, page: u32, limit: u32) -> Result<Page<Thread>> {
        let limit = limit.max(1);
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM threads WHERE author_id = ?")
            .bind(author_id)
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;

        let sql = format!(
            "SELECT {THREAD_COLUMNS} FROM threads WHERE author_id = ? ORDER BY created_at DESC, id DESC LIMIT ? OFFSET ?"
        );
        let rows = sqlx::query_as::<_, ThreadRow>(&sql)
            .bind(author_id)
            .bind(i64::from(limit))
            .bind(Page::<Thread>::offset(page, limit))
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;

        Ok(Page {
            items: rows::threads(rows)?,
            page: page.max(1),
            limit,
            total,
        })
    }

    async fn delete_thread(&self, thread_id: Uuid) -> Result<DeletedThread> {
        let mut tx = begin_write(&self.pool).await.map_err(db_err)?;
        let thread = require_thread(&mut tx, thread_id).await?;

        let per_author: Vec<(Uuid, i64)> =
            sqlx::query_as("SELECT author_id, COUNT(*) FROM posts WHERE thread_id = ? GROUP BY author_id")
                .bind(thread_id)
                .fetch_all(&mut *tx)
                .await
                .map_err(db_err)?;

        let post_ids: Vec<Uuid> =
            sqlx::query_scalar("SELECT id FROM posts WHERE thread_id = ? ORDER BY created_at, id")
                .bind(thread_id)
                .fetch_all(&mut *tx)
                .await
                .map_err(db_err)?;

        for sql in [
            "DELETE FROM reactions WHERE post_id IN (SELECT id FROM posts WHERE thread_id = ?)",
            "DELETE FROM mentions WHERE post_id IN (SELECT id FROM posts WHERE thread_id = ?)",
            "DELETE FROM posts WHERE thread_id = ?",
            "DELETE FROM threads WHERE id = ?",
        ] {
            sqlx::query(sql)
                .bind(thread_id)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
        }

        for (author_id, count) in per_author {
            sqlx::query("UPDATE users SET posts_count = MAX(posts_count - ?, 0) WHERE id = ?")
                .bind(count)
                .bind(author_id)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
        }
        sqlx::query("UPDATE users SET threads_count = MAX(threads_count - 1, 0) WHERE id = ?")
            .bind(thread.author_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        Ok(DeletedThread { thread, post_ids })
    }

    async fn set_thread_status(&self, thread_id: Uuid, status: ThreadStatus) -> Result<Thread> {
        let mut tx = begin_write(&self.pool).await.map_err(db_err)?;
        let updated = sqlx::query("UPDATE threads SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(Utc::now())
            .bind(thread_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        if updated.rows_affected() == 0 {
            return Err(AppError::not_found("Thread", thread_id));
        }
        let thread = require_thread(&mut tx, thread_id).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(thread)
    }

    async fn set_thread_summary(&self, thread_id: Uuid, summary: &str, at: DateTime<Utc>) -> Result<()> {
        let updated = sqlx::query("UPDATE threads SET summary = ?, summary_generated_at = ? WHERE id = ?")
            .bind(summary)
            .bind(at)
            .bind(thread_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        if updated.rows_affected() == 0 {
            return Err(AppError::not_found("Thread", thread_id));
        }
        Ok(())
    }

    async fn get_post(&self, id: Uuid) -> Result<Option<Post>> {
        let mut conn = self.pool.acquire().await.map_err(db_err)?;
        fetch_post(&mut conn, id).await
    }

    async fn first_post(&self, thread_id: Uuid) -> Result<Option<Post>> {
        let sql = format!("SELECT {POST_COLUMNS} FROM posts WHERE thread_id = ? ORDER BY created_at, id LIMIT 1");
        sqlx::query_as::<_, PostRow>(&sql)
            .bind(thread_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .map(Post::try_from)
            .transpose()
    }

    async fn list_posts(&self, thread_id: Uuid, page: u32, limit: u32) -> Result<Page<Post>> {
        let limit = limit.max(1);
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM posts WHERE thread_id = ?")
            .bind(thread_id)
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;

        let sql = format!(
            "SELECT {POST_COLUMNS} FROM posts WHERE thread_id = ? ORDER BY created_at, id LIMIT ? OFFSET ?"
        );
        let rows = sqlx::query_as::<_, PostRow>(&sql)
            .bind(thread_id)
            .bind(i64::from(limit))
            .bind(Page::<Post>::offset(page, limit))
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;

        Ok(Page {
            items: rows::posts(rows)?,
            page: page.max(1),
            limit,
            total,
        })
    }

    async fn create_post(&self, post: Post) -> Result<Thread> {
        let mut tx = begin_write(&self.pool).await.map_err(db_err)?;

        // 1. The thread must exist and accept posts
        let thread = require_thread(&mut tx, post.thread_id).await?;
        if !thread.is_open() {
            return Err(AppError::Forbidden(format!("thread is {}", thread.status)));
        }

        // 2. A parent must live in the same thread
        if let Some(parent_id) = post.parent_post_id {
            match fetch_post(&mut tx, parent_id).await? {
                Some(parent) if parent.thread_id == thread.id => {}
                _ => return Err(AppError::not_found("Parent post", parent_id)),
            }
        }

        // 3. Insert and bump the parent's reply count
        insert_post(&mut tx, &post).await?;
        if let Some(parent_id) = post.parent_post_id {
            sqlx::query("UPDATE posts SET replies_count = replies_count + 1 WHERE id = ?")
                .bind(parent_id)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
        }

        // 4. Thread aggregates
        let mut participants = thread.participant_ids.clone();
        if !participants.contains(&post.author_id) {
            participants.push(post.author_id);
        }
        sqlx::query(
            "UPDATE threads SET posts_count = posts_count + 1, participant_ids = ?, participants_count = ?, \
             last_activity_at = ?, updated_at = ? WHERE id = ?",
        )
        .bind(to_json(&participants)?)
        .bind(participants.len() as i64)
        .bind(thread.last_activity_at.max(post.created_at))
        .bind(post.created_at)
        .bind(thread.id)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        // 5. Author counter
        sqlx::query("UPDATE users SET posts_count = posts_count + 1 WHERE id = ?")
            .bind(post.author_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        let thread = require_thread(&mut tx, thread.id).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(thread)
    }

    async fn update_post(
        &self,
        post_id: Uuid,
        body: &str,
        mentions: &ResolvedMentions,
        at: DateTime<Utc>,
    ) -> Result<Post> {
        let mut tx = begin_write(&self.pool).await.map_err(db_err)?;
        let post = require_post(&mut tx, post_id).await?;

        sqlx::query("UPDATE posts SET body = ?, updated_at = ? WHERE id = ?")
            .bind(body)
            .bind(at)
            .bind(post_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        write_mentions(&mut tx, post_id, mentions).await?;

        let thread = require_thread(&mut tx, post.thread_id).await?;
        touch_thread(&mut tx, &thread, at).await?;

        let post = require_post(&mut tx, post_id).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(post)
    }

    async fn delete_post(&self, post_id: Uuid) -> Result<DeletedPost> {
        let mut tx = begin_write(&self.pool).await.map_err(db_err)?;
        let post = require_post(&mut tx, post_id).await?;

        // 1. Dependent rows
        for sql in [
            "DELETE FROM reactions WHERE post_id = ?",
            "DELETE FROM mentions WHERE post_id = ?",
        ] {
            sqlx::query(sql)
                .bind(post_id)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
        }

        // 2. Parent reply count, then the post itself
        if let Some(parent_id) = post.parent_post_id {
            sqlx::query("UPDATE posts SET replies_count = MAX(replies_count - 1, 0) WHERE id = ?")
                .bind(parent_id)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
        }
        sqlx::query("DELETE FROM posts WHERE id = ?")
            .bind(post_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        // 3. Participation: the thread author always stays
        let thread = require_thread(&mut tx, post.thread_id).await?;
        let remaining: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM posts WHERE thread_id = ? AND author_id = ?")
            .bind(thread.id)
            .bind(post.author_id)
            .fetch_one(&mut *tx)
            .await
            .map_err(db_err)?;

        let mut participants = thread.participant_ids.clone();
        if remaining == 0 && post.author_id != thread.author_id {
            participants.retain(|id| *id != post.author_id);
        }

        sqlx::query(
            "UPDATE threads SET posts_count = MAX(posts_count - 1, 0), participant_ids = ?, \
             participants_count = ?, updated_at = ? WHERE id = ?",
        )
        .bind(to_json(&participants)?)
        .bind(participants.len() as i64)
        .bind(Utc::now())
        .bind(thread.id)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        sqlx::query("UPDATE users SET posts_count = MAX(posts_count - 1, 0) WHERE id = ?")
            .bind(post.author_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        let thread = require_thread(&mut tx, thread.id).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(DeletedPost { post, thread })
    }

    async fn set_moderation(
        &self,
        post_id: Uuid,
        state: ModerationState,
        feedback: Option<serde_json::Value>,
        lock_thread: bool,
    ) -> Result<ModerationOutcome> {
        let mut tx = begin_write(&self.pool).await.map_err(db_err)?;
        let post = require_post(&mut tx, post_id).await?;

        sqlx::query("UPDATE posts SET moderation_state = ?, moderation_feedback = ?, updated_at = ? WHERE id = ?")
            .bind(state.as_str())
            .bind(feedback.as_ref().map(to_json).transpose()?)
            .bind(Utc::now())
            .bind(post_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        let mut locked_thread = None;
        if lock_thread {
            let locked = sqlx::query("UPDATE threads SET status = 'locked', updated_at = ? WHERE id = ? AND status = 'open'")
                .bind(Utc::now())
                .bind(post.thread_id)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
            if locked.rows_affected() > 0 {
                locked_thread = Some(require_thread(&mut tx, post.thread_id).await?);
            }
        }

        let post = require_post(&mut tx, post_id).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(ModerationOutcome { post, locked_thread })
    }

    async fn react(&self, post_id: Uuid, user_id: Uuid, request: ReactionRequest) -> Result<ReactionOutcome> {
        let mut tx = begin_write(&self.pool).await.map_err(db_err)?;
        let post = require_post(&mut tx, post_id).await?;

        let existing: Option<String> =
            sqlx::query_scalar("SELECT kind FROM reactions WHERE post_id = ? AND user_id = ?")
                .bind(post_id)
                .bind(user_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(db_err)?;
        let existing = existing
            .as_deref()
            .map(ReactionType::from_str)
            .transpose()
            .map_err(|e| AppError::Internal(e.to_string()))?;

        let transition = request.transition(existing);
        match transition.row_change() {
            RowChange::None => {}
            RowChange::Insert(kind) => {
                // No upsert: a concurrent insert must surface as Conflict.
                sqlx::query("INSERT INTO reactions (post_id, user_id, kind, created_at) VALUES (?, ?, ?, ?)")
                    .bind(post_id)
                    .bind(user_id)
                    .bind(kind.as_str())
                    .bind(Utc::now())
                    .execute(&mut *tx)
                    .await
                    .map_err(db_err)?;
            }
            RowChange::Update(kind) => {
                sqlx::query("UPDATE reactions SET kind = ? WHERE post_id = ? AND user_id = ?")
                    .bind(kind.as_str())
                    .bind(post_id)
                    .bind(user_id)
                    .execute(&mut *tx)
                    .await
                    .map_err(db_err)?;
            }
            RowChange::Delete => {
                sqlx::query("DELETE FROM reactions WHERE post_id = ? AND user_id = ?")
                    .bind(post_id)
                    .bind(user_id)
                    .execute(&mut *tx)
                    .await
                    .map_err(db_err)?;
            }
        }

        let (up, down) = (transition.upvote_delta(), transition.downvote_delta());
        if up != 0 || down != 0 {
            sqlx::query(
                "UPDATE posts SET upvotes_count = MAX(upvotes_count + ?, 0), \
                 downvotes_count = MAX(downvotes_count + ?, 0) WHERE id = ?",
            )
            .bind(up)
            .bind(down)
            .bind(post_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }

        let (upvotes_count, downvotes_count): (i64, i64) =
            sqlx::query_as("SELECT upvotes_count, downvotes_count FROM posts WHERE id = ?")
                .bind(post_id)
                .fetch_one(&mut *tx)
                .await
                .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        Ok(ReactionOutcome {
            summary: ReactionSummary {
                thread_id: post.thread_id,
                post_id,
                post_author_id: post.author_id,
                upvotes_count,
                downvotes_count,
                reaction: transition.next,
            },
            transition,
        })
    }

    async fn get_reaction(&self, post_id: Uuid, user_id: Uuid) -> Result<Option<Reaction>> {
        sqlx::query_as::<_, ReactionRow>(
            "SELECT post_id, user_id, kind, created_at FROM reactions WHERE post_id = ? AND user_id = ?",
        )
        .bind(post_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .map(Reaction::try_from)
        .transpose()
    }

    async fn replace_mentions(&self, post_id: Uuid, mentions: &ResolvedMentions) -> Result<()> {
        let mut tx = begin_write(&self.pool).await.map_err(db_err)?;
        write_mentions(&mut tx, post_id, mentions).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn get_mentions(&self, post_id: Uuid) -> Result<Vec<Mention>> {
        let rows = sqlx::query_as::<_, MentionRow>(
            "SELECT post_id, mentioned_user_id, notified, notified_at FROM mentions WHERE post_id = ?",
        )
        .bind(post_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(rows.into_iter().map(Mention::from).collect())
    }

    async fn mark_mentions_notified(&self, post_id: Uuid, user_ids: &[Uuid], at: DateTime<Utc>) -> Result<()> {
        if user_ids.is_empty() {
            return Ok(());
        }
        let mut qb = QueryBuilder::<Sqlite>::new("UPDATE mentions SET notified = 1, notified_at = ");
        qb.push_bind(at)
            .push(" WHERE post_id = ")
            .push_bind(post_id)
            .push(" AND mentioned_user_id IN (");
        let mut list = qb.separated(", ");
        for id in user_ids {
            list.push_bind(*id);
        }
        list.push_unseparated(")");

        qb.build().execute(&self.pool).await.map_err(db_err)?;
        Ok(())
    }

    async fn insert_notifications(&self, notifications: &[Notification]) -> Result<()> {
        if notifications.is_empty() {
            return Ok(());
        }
        let mut tx = begin_write(&self.pool).await.map_err(db_err)?;
        for n in notifications {
            sqlx::query(
                "INSERT INTO notifications (id, user_id, event, payload, read, read_at, created_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(n.id)
            .bind(n.user_id)
            .bind(&n.event)
            .bind(to_json(&n.payload)?)
            .bind(n.read)
            .bind(n.read_at)
            .bind(n.created_at)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn notifications_for(&self, user_id: Uuid) -> Result<Vec<Notification>> {
        let rows = sqlx::query_as::<_, NotificationRow>(
            "SELECT id, user_id, event, payload, read, read_at, created_at FROM notifications \
             WHERE user_id = ? ORDER BY created_at DESC, id DESC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.into_iter().map(Notification::try_from).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rf_core::models::ReactionType::{Downvote, Upvote};

    async fn repo() -> SqliteForumRepo {
        SqliteForumRepo::in_memory().await.unwrap()
    }

    async fn user(repo: &SqliteForumRepo, handle: &str) -> User {
        let user = User::new(handle, handle);
        repo.upsert_user(&user).await.unwrap();
        user
    }

    fn thread_with_post(author: Uuid, slug: &str) -> (Thread, Post) {
        let now = Utc::now();
        let thread = Thread {
            id: Uuid::now_v7(),
            title: "Hello World".into(),
            slug: slug.into(),
            author_id: author,
            tags: vec!["rust".into()],
            status: ThreadStatus::Open,
            last_activity_at: now,
            posts_count: 1,
            participants_count: 1,
            participant_ids: vec![author],
            summary: None,
            summary_generated_at: None,
            created_at: now,
            updated_at: now,
        };
        let post = reply(&thread, author, "OP", None);
        (thread, post)
    }

    fn reply(thread: &Thread, author: Uuid, body: &str, parent: Option<Uuid>) -> Post {
        let now = Utc::now();
        Post {
            id: Uuid::now_v7(),
            thread_id: thread.id,
            author_id: author,
            body: body.into(),
            mentions: vec![],
            parent_post_id: parent,
            moderation_state: ModerationState::Pending,
            moderation_feedback: None,
            upvotes_count: 0,
            downvotes_count: 0,
            replies_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn test_create_and_get_thread() {
        let repo = repo().await;
        let alice = user(&repo, "alice").await;
        let (thread, post) = thread_with_post(alice.id, "hello-world");

        repo.create_thread(thread.clone(), post.clone()).await.expect("Failed to create thread");

        let stored = repo.get_thread(thread.id).await.unwrap().unwrap();
        assert_eq!(stored.slug, "hello-world");
        assert_eq!(stored.participant_ids, vec![alice.id]);
        assert_eq!(repo.first_post(thread.id).await.unwrap().unwrap().id, post.id);
        assert!(repo.slug_exists("hello-world").await.unwrap());

        let alice = repo.get_users(&[alice.id]).await.unwrap().remove(0);
        assert_eq!((alice.threads_count, alice.posts_count), (1, 1));
    }

    #[tokio::test]
    async fn test_highest_slug_suffix_ignores_other_shapes() {
        let repo = repo().await;
        let alice = user(&repo, "alice").await;
        assert_eq!(repo.highest_slug_suffix("hello-world").await.unwrap(), None);

        for slug in ["hello-world", "hello-world-2", "hello-world-17", "hello-world-2-1", "hello-world-faq", "hello_world-99"] {
            let (thread, post) = thread_with_post(alice.id, slug);
            repo.create_thread(thread, post).await.unwrap();
        }

        assert_eq!(repo.highest_slug_suffix("hello-world").await.unwrap(), Some(17));
        assert_eq!(repo.highest_slug_suffix("hello-world-2").await.unwrap(), Some(1));
        assert_eq!(repo.highest_slug_suffix("hello").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_duplicate_slug_is_conflict() {
        let repo = repo().await;
        let alice = user(&repo, "alice").await;
        let (a, a_post) = thread_with_post(alice.id, "same");
        let (b, b_post) = thread_with_post(alice.id, "same");

        repo.create_thread(a, a_post).await.unwrap();
        let err = repo.create_thread(b, b_post).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_reply_updates_aggregates() {
        let repo = repo().await;
        let alice = user(&repo, "alice").await;
        let bob = user(&repo, "bob").await;
        let (thread, op) = thread_with_post(alice.id, "t");
        repo.create_thread(thread.clone(), op.clone()).await.unwrap();

        let updated = repo.create_post(reply(&thread, bob.id, "hi", Some(op.id))).await.unwrap();
        assert_eq!(updated.posts_count, 2);
        assert_eq!(updated.participants_count, 2);
        assert!(updated.has_participant(bob.id));
        assert_eq!(repo.get_post(op.id).await.unwrap().unwrap().replies_count, 1);
    }

    #[tokio::test]
    async fn test_reply_to_locked_thread_changes_nothing() {
        let repo = repo().await;
        let alice = user(&repo, "alice").await;
        let (thread, op) = thread_with_post(alice.id, "t");
        repo.create_thread(thread.clone(), op).await.unwrap();
        repo.set_thread_status(thread.id, ThreadStatus::Locked).await.unwrap();

        let err = repo.create_post(reply(&thread, alice.id, "late", None)).await.unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));
        assert_eq!(repo.get_thread(thread.id).await.unwrap().unwrap().posts_count, 1);
        assert_eq!(repo.list_posts(thread.id, 1, 20).await.unwrap().total, 1);
    }

    #[tokio::test]
    async fn test_parent_from_other_thread_is_not_found() {
        let repo = repo().await;
        let alice = user(&repo, "alice").await;
        let (a, a_op) = thread_with_post(alice.id, "a");
        let (b, b_op) = thread_with_post(alice.id, "b");
        repo.create_thread(a.clone(), a_op).await.unwrap();
        repo.create_thread(b, b_op.clone()).await.unwrap();

        let err = repo.create_post(reply(&a, alice.id, "x", Some(b_op.id))).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(..)));
    }

    #[tokio::test]
    async fn test_deleting_last_post_drops_participant() {
        let repo = repo().await;
        let alice = user(&repo, "alice").await;
        let bob = user(&repo, "bob").await;
        let (thread, op) = thread_with_post(alice.id, "t");
        repo.create_thread(thread.clone(), op).await.unwrap();
        let bobs = reply(&thread, bob.id, "hi", None);
        repo.create_post(bobs.clone()).await.unwrap();

        let deleted = repo.delete_post(bobs.id).await.unwrap();
        assert_eq!(deleted.thread.posts_count, 1);
        assert_eq!(deleted.thread.participant_ids, vec![alice.id]);
        assert_eq!(deleted.thread.participants_count, 1);
    }

    #[tokio::test]
    async fn test_deleting_reply_decrements_parent_replies() {
        let repo = repo().await;
        let alice = user(&repo, "alice").await;
        let bob = user(&repo, "bob").await;
        let (thread, op) = thread_with_post(alice.id, "t");
        repo.create_thread(thread.clone(), op.clone()).await.unwrap();
        let first = reply(&thread, bob.id, "one", Some(op.id));
        let second = reply(&thread, bob.id, "two", Some(op.id));
        repo.create_post(first.clone()).await.unwrap();
        repo.create_post(second.clone()).await.unwrap();
        assert_eq!(repo.get_post(op.id).await.unwrap().unwrap().replies_count, 2);

        repo.delete_post(first.id).await.unwrap();
        assert_eq!(repo.get_post(op.id).await.unwrap().unwrap().replies_count, 1);
        let deleted = repo.delete_post(second.id).await.unwrap();
        assert_eq!(repo.get_post(op.id).await.unwrap().unwrap().replies_count, 0);
        assert_eq!(deleted.thread.posts_count, 1);
    }

    #[tokio::test]
    async fn test_reaction_toggle_cycle() {
        let repo = repo().await;
        let alice = user(&repo, "alice").await;
        let bob = user(&repo, "bob").await;
        let (thread, op) = thread_with_post(alice.id, "t");
        repo.create_thread(thread, op.clone()).await.unwrap();

        let up = repo.react(op.id, bob.id, ReactionRequest::Toggle(Upvote)).await.unwrap();
        assert_eq!((up.summary.upvotes_count, up.summary.downvotes_count), (1, 0));

        let down = repo.react(op.id, bob.id, ReactionRequest::Toggle(Downvote)).await.unwrap();
        assert_eq!((down.summary.upvotes_count, down.summary.downvotes_count), (0, 1));
        assert_eq!(repo.get_reaction(op.id, bob.id).await.unwrap().unwrap().kind, Downvote);

        let off = repo.react(op.id, bob.id, ReactionRequest::Toggle(Downvote)).await.unwrap();
        assert_eq!((off.summary.upvotes_count, off.summary.downvotes_count), (0, 0));
        assert_eq!(off.summary.reaction, None);
        assert!(repo.get_reaction(op.id, bob.id).await.unwrap().is_none());

        let noop = repo.react(op.id, bob.id, ReactionRequest::Remove).await.unwrap();
        assert_eq!(noop.transition.row_change(), RowChange::None);
    }

    #[tokio::test]
    async fn test_mentions_replace_and_mark_notified() {
        let repo = repo().await;
        let alice = user(&repo, "alice").await;
        let bob = user(&repo, "Bob").await;
        let (thread, op) = thread_with_post(alice.id, "t");
        repo.create_thread(thread, op.clone()).await.unwrap();

        let found = repo.find_users_by_handles(&["bob".to_string()]).await.unwrap();
        assert_eq!(found.len(), 1);

        let mentions = ResolvedMentions::resolve(&["bob".to_string()], &found, alice.id);
        repo.replace_mentions(op.id, &mentions).await.unwrap();
        repo.mark_mentions_notified(op.id, &[bob.id], Utc::now()).await.unwrap();

        let rows = repo.get_mentions(op.id).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert!(rows[0].notified);
        assert_eq!(repo.get_post(op.id).await.unwrap().unwrap().mentions, vec!["bob".to_string()]);
    }

    #[tokio::test]
    async fn test_moderation_locks_open_thread_once() {
        let repo = repo().await;
        let alice = user(&repo, "alice").await;
        let (thread, op) = thread_with_post(alice.id, "t");
        repo.create_thread(thread.clone(), op.clone()).await.unwrap();

        let first = repo
            .set_moderation(op.id, ModerationState::Flagged, Some(serde_json::json!({"spam": true})), true)
            .await
            .unwrap();
        assert_eq!(first.post.moderation_state, ModerationState::Flagged);
        assert_eq!(first.locked_thread.unwrap().status, ThreadStatus::Locked);

        let second = repo.set_moderation(op.id, ModerationState::Rejected, None, true).await.unwrap();
        assert!(second.locked_thread.is_none());
    }

    #[tokio::test]
    async fn test_list_threads_filters_by_tag_and_search() {
        let repo = repo().await;
        let alice = user(&repo, "alice").await;
        let (a, a_op) = thread_with_post(alice.id, "a");
        let (mut b, b_op) = thread_with_post(alice.id, "b");
        b.title = "100% async".into();
        b.tags = vec!["tokio".into()];
        repo.create_thread(a, a_op).await.unwrap();
        repo.create_thread(b.clone(), b_op).await.unwrap();

        let by_tag = repo
            .list_threads(&ThreadQuery { tag: Some("tokio".into()), ..Default::default() })
            .await
            .unwrap();
        assert_eq!(by_tag.total, 1);
        assert_eq!(by_tag.items[0].id, b.id);

        let by_search = repo
            .list_threads(&ThreadQuery { search: Some("100%".into()), ..Default::default() })
            .await
            .unwrap();
        assert_eq!(by_search.total, 1);

        let all = repo.list_threads(&ThreadQuery::default()).await.unwrap();
        assert_eq!(all.total, 2);
        assert_eq!(repo.list_threads_by_author(alice.id, 1, 1).await.unwrap().items.len(), 1);
    }

    #[tokio::test]
    async fn test_delete_thread_settles_counters() {
        let repo = repo().await;
        let alice = user(&repo, "alice").await;
        let bob = user(&repo, "bob").await;
        let (thread, op) = thread_with_post(alice.id, "t");
        repo.create_thread(thread.clone(), op.clone()).await.unwrap();
        repo.create_post(reply(&thread, bob.id, "hi", Some(op.id))).await.unwrap();
        repo.react(op.id, bob.id, ReactionRequest::Toggle(Upvote)).await.unwrap();

        let deleted = repo.delete_thread(thread.id).await.unwrap();
        assert_eq!(deleted.post_ids.len(), 2);
        assert!(repo.get_thread(thread.id).await.unwrap().is_none());

        let users = repo.get_users(&[alice.id, bob.id]).await.unwrap();
        for u in users {
            assert_eq!(u.posts_count, 0);
            assert_eq!(u.threads_count, 0);
        }
    }

    #[tokio::test]
    async fn test_notifications_round_trip() {
        let repo = repo().await;
        let alice = user(&repo, "alice").await;
        let n = Notification::new(alice.id, "post.mentioned", serde_json::json!({"postId": "x"}));
        repo.insert_notifications(&[n.clone()]).await.unwrap();

        let stored = repo.notifications_for(alice.id).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].event, "post.mentioned");
        assert!(!stored[0].read);
    }
}
