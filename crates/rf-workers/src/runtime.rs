//! Worker runtime.
//!
//! One `Worker` per queue. It holds at most `concurrency` jobs in flight,
//! polls when the queue is empty, and on shutdown stops reserving and waits
//! for every in-flight job before returning.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rf_core::jobs::{Job, JobFate};
use rf_core::traits::JobQueue;
use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tracing::Instrument;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Queue-specific job processing. An `Err` is reported back to the queue,
/// which retries per the job's backoff or abandons it.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> anyhow::Result<()>;
}

pub struct Worker {
    queue_name: String,
    queue: Arc<dyn JobQueue>,
    handler: Arc<dyn JobHandler>,
    concurrency: usize,
    poll_interval: Duration,
}

fn stopping(shutdown: &watch::Receiver<bool>) -> bool {
    *shutdown.borrow() || shutdown.has_changed().is_err()
}

impl Worker {
    pub fn new(queue_name: &str, queue: Arc<dyn JobQueue>, handler: Arc<dyn JobHandler>, concurrency: usize) -> Self {
        Self {
            queue_name: queue_name.to_string(),
            queue,
            handler,
            concurrency: concurrency.max(1),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    /// Runs until `shutdown` turns `true` (or its sender goes away), then
    /// drains in-flight jobs.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut in_flight = JoinSet::new();
        tracing::info!(queue = %self.queue_name, concurrency = self.concurrency, "worker started");

        while !stopping(&shutdown) {
            let permit = tokio::select! {
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = shutdown.changed() => continue,
            };

            while let Some(done) = in_flight.try_join_next() {
                if let Err(err) = done {
                    tracing::error!(queue = %self.queue_name, error = %err, "job task panicked");
                }
            }

            match self.queue.reserve(&self.queue_name).await {
                Ok(Some(job)) => {
                    let queue = self.queue.clone();
                    let handler = self.handler.clone();
                    in_flight.spawn(async move {
                        process(queue.as_ref(), handler, job).await;
                        drop(permit);
                    });
                }
                Ok(None) => {
                    drop(permit);
                    self.idle(&mut shutdown).await;
                }
                Err(err) => {
                    drop(permit);
                    tracing::warn!(queue = %self.queue_name, error = %err, "reserve failed");
                    self.idle(&mut shutdown).await;
                }
            }
        }

        tracing::info!(queue = %self.queue_name, in_flight = in_flight.len(), "worker draining");
        while let Some(done) = in_flight.join_next().await {
            if let Err(err) = done {
                tracing::error!(queue = %self.queue_name, error = %err, "job task panicked");
            }
        }
        tracing::info!(queue = %self.queue_name, "worker stopped");
    }

    async fn idle(&self, shutdown: &mut watch::Receiver<bool>) {
        tokio::select! {
            _ = tokio::time::sleep(self.poll_interval) => {}
            _ = shutdown.changed() => {}
        }
    }

    /// Reserves and processes at most one job inline. Returns whether one ran.
    pub async fn run_once(&self) -> anyhow::Result<bool> {
        match self.queue.reserve(&self.queue_name).await? {
            Some(job) => {
                process(self.queue.as_ref(), self.handler.clone(), job).await;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[tracing::instrument(
    skip_all,
    fields(queue = %job.queue, job_id = %job.id, kind = ?job.payload.kind(), attempt = job.attempt())
)]
async fn process(queue: &dyn JobQueue, handler: Arc<dyn JobHandler>, job: Job) {
    // A panicking handler must still hand its job back to the queue.
    let claimed = job.clone();
    let handled = tokio::spawn(async move { handler.handle(&claimed).await }.in_current_span()).await;
    let result = handled.unwrap_or_else(|err| Err(anyhow::anyhow!(join_failure(err))));

    match result {
        Ok(()) => match queue.complete(&job).await {
            Ok(()) => tracing::debug!("job completed"),
            Err(err) => tracing::warn!(error = %err, "job done but not acknowledged"),
        },
        Err(err) => {
            let reason = format!("{err:#}");
            match queue.fail(&job, &reason).await {
                Ok(JobFate::Retry { attempts_made, run_at }) => {
                    tracing::warn!(error = %reason, attempts_made, %run_at, "job failed, retry scheduled");
                }
                Ok(JobFate::Dead { attempts_made }) => {
                    tracing::error!(error = %reason, attempts_made, "job abandoned");
                }
                Err(fail_err) => {
                    tracing::error!(error = %reason, queue_error = %fail_err, "could not record job failure");
                }
            }
        }
    }
}

fn join_failure(err: JoinError) -> String {
    if !err.is_panic() {
        return format!("handler task failed: {err}");
    }
    let payload = err.into_panic();
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string payload".to_string());
    format!("handler panicked: {message}")
}
