//! # rf-queue-memory
//!
//! Process-local `JobQueue`. Same state machine as the durable queue
//! (waiting, active, dead) but nothing survives a restart. Used by tests and
//! by single-node runs that accept losing in-flight jobs.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use rf_core::jobs::{Job, JobFate, JobOptions, JobPayload};
use rf_core::traits::JobQueue;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Default)]
struct Lanes {
    waiting: Vec<Job>,
    active: HashMap<Uuid, Job>,
    dead: Vec<Job>,
}

#[derive(Default)]
pub struct MemoryJobQueue {
    lanes: Mutex<HashMap<String, Lanes>>,
}

impl MemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waiting jobs of `queue` regardless of `run_at`, oldest first.
    pub async fn waiting(&self, queue: &str) -> Vec<Job> {
        let lanes = self.lanes.lock().await;
        lanes.get(queue).map(|l| l.waiting.clone()).unwrap_or_default()
    }

    /// Payloads waiting across all queues.
    pub async fn waiting_payloads(&self) -> Vec<JobPayload> {
        let lanes = self.lanes.lock().await;
        lanes
            .values()
            .flat_map(|l| l.waiting.iter().map(|j| j.payload.clone()))
            .collect()
    }

    /// Makes every waiting job of `queue` immediately reservable.
    pub async fn release_delayed(&self, queue: &str) {
        let now = Utc::now();
        if let Some(lane) = self.lanes.lock().await.get_mut(queue) {
            for job in &mut lane.waiting {
                job.run_at = now;
            }
        }
    }
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    async fn enqueue(&self, queue: &str, payload: JobPayload, options: JobOptions) -> anyhow::Result<Uuid> {
        let job = Job::new(queue, payload, options);
        let id = job.id;
        tracing::debug!(job_id = %id, queue, kind = ?job.payload.kind(), "job enqueued");

        self.lanes
            .lock()
            .await
            .entry(queue.to_string())
            .or_default()
            .waiting
            .push(job);
        Ok(id)
    }

    async fn reserve(&self, queue: &str) -> anyhow::Result<Option<Job>> {
        let now = Utc::now();
        let mut lanes = self.lanes.lock().await;
        let Some(lane) = lanes.get_mut(queue) else {
            return Ok(None);
        };

        let ready = lane
            .waiting
            .iter()
            .enumerate()
            .filter(|(_, job)| job.run_at <= now)
            .min_by_key(|(_, job)| (job.run_at, job.enqueued_at))
            .map(|(idx, _)| idx);

        Ok(ready.map(|idx| {
            let job = lane.waiting.remove(idx);
            lane.active.insert(job.id, job.clone());
            job
        }))
    }

    async fn complete(&self, job: &Job) -> anyhow::Result<()> {
        if let Some(lane) = self.lanes.lock().await.get_mut(&job.queue) {
            lane.active.remove(&job.id);
        }
        Ok(())
    }

    async fn fail(&self, job: &Job, error: &str) -> anyhow::Result<JobFate> {
        let fate = job.fate_after_failure(Utc::now());
        let mut lanes = self.lanes.lock().await;
        let lane = lanes.entry(job.queue.clone()).or_default();
        lane.active.remove(&job.id);

        let mut next = job.clone();
        match fate {
            JobFate::Retry { attempts_made, run_at } => {
                next.attempts_made = attempts_made;
                next.run_at = run_at;
                lane.waiting.push(next);
            }
            JobFate::Dead { attempts_made } => {
                tracing::debug!(job_id = %job.id, error, "job moved to dead lane");
                next.attempts_made = attempts_made;
                lane.dead.push(next);
            }
        }
        Ok(fate)
    }

    async fn recover_stalled(&self, queue: &str) -> anyhow::Result<u64> {
        let mut lanes = self.lanes.lock().await;
        let Some(lane) = lanes.get_mut(queue) else {
            return Ok(0);
        };
        let stalled: Vec<Job> = lane.active.drain().map(|(_, job)| job).collect();
        let count = stalled.len() as u64;
        lane.waiting.extend(stalled);
        Ok(count)
    }

    async fn dead_jobs(&self, queue: &str) -> anyhow::Result<Vec<Job>> {
        let lanes = self.lanes.lock().await;
        Ok(lanes.get(queue).map(|l| l.dead.clone()).unwrap_or_default())
    }
}
