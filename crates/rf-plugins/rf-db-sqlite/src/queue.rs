//! Durable job queue backed by the `jobs` table.
//!
//! Jobs move `waiting -> active -> (deleted | waiting | dead)`. A job is only
//! reserved once its `run_at_ms` has passed, which is how retry backoff works.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rf_core::jobs::{Job, JobFate, JobOptions, JobPayload};
use rf_core::traits::JobQueue;
use sqlx::sqlite::SqlitePool;
use uuid::Uuid;

#[derive(Clone)]
pub struct SqliteJobQueue {
    pool: SqlitePool,
}

impl SqliteJobQueue {
    /// Shares the pool (and the migrated schema) of the forum repo.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    queue: String,
    payload: String,
    options: String,
    attempts_made: i64,
    enqueued_at: DateTime<Utc>,
    run_at_ms: i64,
}

impl TryFrom<JobRow> for Job {
    type Error = anyhow::Error;

    fn try_from(row: JobRow) -> anyhow::Result<Self> {
        let run_at = Utc
            .timestamp_millis_opt(row.run_at_ms)
            .single()
            .ok_or_else(|| anyhow::anyhow!("invalid run_at for job {}", row.id))?;
        Ok(Job {
            id: row.id,
            queue: row.queue,
            payload: serde_json::from_str(&row.payload)?,
            options: serde_json::from_str(&row.options)?,
            attempts_made: u32::try_from(row.attempts_made)?,
            enqueued_at: row.enqueued_at,
            run_at,
        })
    }
}

const JOB_COLUMNS: &str = "id, queue, payload, options, attempts_made, enqueued_at, run_at_ms";

#[async_trait]
impl JobQueue for SqliteJobQueue {
    async fn enqueue(&self, queue: &str, payload: JobPayload, options: JobOptions) -> anyhow::Result<Uuid> {
        let job = Job::new(queue, payload, options);
        sqlx::query(
            "INSERT INTO jobs (id, queue, payload, options, attempts_made, state, enqueued_at, run_at_ms) \
             VALUES (?, ?, ?, ?, 0, 'waiting', ?, ?)",
        )
        .bind(job.id)
        .bind(&job.queue)
        .bind(serde_json::to_string(&job.payload)?)
        .bind(serde_json::to_string(&job.options)?)
        .bind(job.enqueued_at)
        .bind(job.run_at.timestamp_millis())
        .execute(&self.pool)
        .await?;

        tracing::debug!(job_id = %job.id, queue, kind = ?job.payload.kind(), "job enqueued");
        Ok(job.id)
    }

    async fn reserve(&self, queue: &str) -> anyhow::Result<Option<Job>> {
        let mut tx = crate::begin_write(&self.pool).await?;

        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE queue = ? AND state = 'waiting' AND run_at_ms <= ? \
             ORDER BY run_at_ms, enqueued_at, id LIMIT 1"
        );
        let row = sqlx::query_as::<_, JobRow>(&sql)
            .bind(queue)
            .bind(Utc::now().timestamp_millis())
            .fetch_optional(&mut *tx)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        sqlx::query("UPDATE jobs SET state = 'active' WHERE id = ?")
            .bind(row.id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(Some(Job::try_from(row)?))
    }

    async fn complete(&self, job: &Job) -> anyhow::Result<()> {
        if job.options.remove_on_complete {
            sqlx::query("DELETE FROM jobs WHERE id = ?")
                .bind(job.id)
                .execute(&self.pool)
                .await?;
        } else {
            sqlx::query("UPDATE jobs SET state = 'completed' WHERE id = ?")
                .bind(job.id)
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    async fn fail(&self, job: &Job, error: &str) -> anyhow::Result<JobFate> {
        let fate = job.fate_after_failure(Utc::now());
        match fate {
            JobFate::Retry { attempts_made, run_at } => {
                sqlx::query(
                    "UPDATE jobs SET state = 'waiting', attempts_made = ?, last_error = ?, run_at_ms = ? WHERE id = ?",
                )
                .bind(i64::from(attempts_made))
                .bind(error)
                .bind(run_at.timestamp_millis())
                .bind(job.id)
                .execute(&self.pool)
                .await?;
            }
            JobFate::Dead { attempts_made } => {
                sqlx::query("UPDATE jobs SET state = 'dead', attempts_made = ?, last_error = ? WHERE id = ?")
                    .bind(i64::from(attempts_made))
                    .bind(error)
                    .bind(job.id)
                    .execute(&self.pool)
                    .await?;
            }
        }
        Ok(fate)
    }

    async fn recover_stalled(&self, queue: &str) -> anyhow::Result<u64> {
        let result = sqlx::query("UPDATE jobs SET state = 'waiting' WHERE queue = ? AND state = 'active'")
            .bind(queue)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn dead_jobs(&self, queue: &str) -> anyhow::Result<Vec<Job>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE queue = ? AND state = 'dead' ORDER BY enqueued_at, id");
        let rows = sqlx::query_as::<_, JobRow>(&sql)
            .bind(queue)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(Job::try_from).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rf_core::jobs::{Backoff, SummaryJob};

    async fn queue() -> SqliteJobQueue {
        let pool = crate::connect("sqlite::memory:", 1).await.unwrap();
        SqliteJobQueue::new(pool)
    }

    fn summary() -> JobPayload {
        JobPayload::Summary(SummaryJob { thread_id: Uuid::now_v7() })
    }

    #[tokio::test]
    async fn test_reserve_claims_once() {
        let q = queue().await;
        let id = q.enqueue("summary", summary(), JobOptions::default()).await.unwrap();

        let job = q.reserve("summary").await.unwrap().expect("job should be ready");
        assert_eq!(job.id, id);
        assert!(q.reserve("summary").await.unwrap().is_none());
        assert!(q.reserve("moderation").await.unwrap().is_none());

        q.complete(&job).await.unwrap();
        assert_eq!(q.recover_stalled("summary").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_failed_job_waits_for_backoff_then_dies() {
        let q = queue().await;
        let options = JobOptions {
            attempts: 2,
            backoff: Backoff::Fixed { delay_ms: 60_000 },
            remove_on_complete: true,
        };
        q.enqueue("summary", summary(), options).await.unwrap();

        let job = q.reserve("summary").await.unwrap().unwrap();
        let fate = q.fail(&job, "boom").await.unwrap();
        assert!(matches!(fate, JobFate::Retry { attempts_made: 1, .. }));
        // Backoff keeps it out of reach for now.
        assert!(q.reserve("summary").await.unwrap().is_none());

        let mut retried = job.clone();
        retried.attempts_made = 1;
        let fate = q.fail(&retried, "boom again").await.unwrap();
        assert_eq!(fate, JobFate::Dead { attempts_made: 2 });

        let dead = q.dead_jobs("summary").await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].attempts_made, 2);
    }

    #[tokio::test]
    async fn test_stalled_jobs_return_to_waiting() {
        let q = queue().await;
        q.enqueue("summary", summary(), JobOptions::default()).await.unwrap();
        let _claimed = q.reserve("summary").await.unwrap().unwrap();

        assert_eq!(q.recover_stalled("summary").await.unwrap(), 1);
        assert!(q.reserve("summary").await.unwrap().is_some());
    }
}
