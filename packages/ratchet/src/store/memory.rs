//! In-memory job store.
//!
//! Maps guarded by a mutex; the mutex itself is what makes `next()` atomic.
//! Nothing survives the process, which is exactly what tests and
//! single-shot tools want.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::error::StoreError;
use crate::fingerprint::fingerprint;
use crate::job::{Job, JobOutcome, JobStatus};
use crate::store::{claim_order, JobStore, RateLedger};

#[derive(Debug, Default)]
struct State {
    jobs: HashMap<Uuid, Job>,
    rate_starts: HashMap<String, Vec<DateTime<Utc>>>,
}

/// Mutex-guarded in-memory backend, also usable as a [`RateLedger`].
#[derive(Debug)]
pub struct InMemoryJobStore {
    queue: String,
    state: Mutex<State>,
}

impl InMemoryJobStore {
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            state: Mutex::new(State::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // Job maps stay coherent even after a panicking holder; keep serving.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn by_status(&self, status: JobStatus) -> Vec<Job> {
        let state = self.lock();
        let mut jobs: Vec<Job> = state
            .jobs
            .values()
            .filter(|j| j.status == status)
            .cloned()
            .collect();
        jobs.sort_by(claim_order);
        jobs
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    fn queue_name(&self) -> &str {
        &self.queue
    }

    async fn add(&self, job: Job) -> Result<Uuid, StoreError> {
        let mut state = self.lock();
        if state.jobs.contains_key(&job.id) {
            return Err(StoreError::Duplicate(job.id));
        }
        let id = job.id;
        state.jobs.insert(id, job);
        Ok(id)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Job>, StoreError> {
        Ok(self.lock().jobs.get(&id).cloned())
    }

    async fn peek(&self, limit: usize) -> Result<Vec<Job>, StoreError> {
        let mut jobs = self.by_status(JobStatus::Pending);
        jobs.truncate(limit);
        Ok(jobs)
    }

    async fn next(&self) -> Result<Option<Job>, StoreError> {
        let now = Utc::now();
        let mut state = self.lock();
        let candidate = state
            .jobs
            .values()
            .filter(|j| j.is_ready(now))
            .min_by(|a, b| claim_order(a, b))
            .map(|job| job.id);

        match candidate {
            Some(id) => {
                // Claim under the same lock that found the candidate.
                let job = state
                    .jobs
                    .get_mut(&id)
                    .ok_or(StoreError::NotFound(id))?;
                job.status = JobStatus::Processing;
                job.updated_at = now;
                Ok(Some(job.clone()))
            }
            None => Ok(None),
        }
    }

    async fn processing(&self) -> Result<Vec<Job>, StoreError> {
        Ok(self.by_status(JobStatus::Processing))
    }

    async fn aborting(&self) -> Result<Vec<Job>, StoreError> {
        Ok(self.by_status(JobStatus::Aborting))
    }

    async fn complete(&self, id: Uuid, outcome: JobOutcome) -> Result<Job, StoreError> {
        let now = Utc::now();
        let mut state = self.lock();
        let job = state.jobs.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        job.apply_outcome(outcome, now);
        Ok(job.clone())
    }

    async fn abort(&self, id: Uuid) -> Result<Job, StoreError> {
        let now = Utc::now();
        let mut state = self.lock();
        let job = state.jobs.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        job.apply_abort(now);
        Ok(job.clone())
    }

    async fn jobs_by_run_id(&self, run_id: Uuid) -> Result<Vec<Job>, StoreError> {
        let state = self.lock();
        let mut jobs: Vec<Job> = state
            .jobs
            .values()
            .filter(|j| j.job_run_id == Some(run_id))
            .cloned()
            .collect();
        jobs.sort_by(claim_order);
        Ok(jobs)
    }

    async fn output_for_input(
        &self,
        task_type: &str,
        input: &Value,
    ) -> Result<Option<Value>, StoreError> {
        let digest = fingerprint(input);
        let state = self.lock();
        let hit = state
            .jobs
            .values()
            .filter(|j| {
                j.status == JobStatus::Completed
                    && j.task_type == task_type
                    && j.fingerprint == digest
            })
            .min_by_key(|j| (j.created_at, j.id));
        Ok(hit.and_then(|j| j.output.clone()))
    }

    async fn size(&self) -> Result<u64, StoreError> {
        Ok(self.lock().jobs.len() as u64)
    }

    async fn delete_all(&self) -> Result<(), StoreError> {
        self.lock().jobs.clear();
        Ok(())
    }

    async fn delete_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut state = self.lock();
        let before = state.jobs.len();
        state
            .jobs
            .retain(|_, j| !(j.status.is_terminal() && j.updated_at < cutoff));
        Ok((before - state.jobs.len()) as u64)
    }
}

#[async_trait]
impl RateLedger for InMemoryJobStore {
    async fn record_start(&self, queue: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut state = self.lock();
        state.rate_starts.entry(queue.to_string()).or_default().push(at);
        Ok(())
    }

    async fn starts_since(
        &self,
        queue: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<DateTime<Utc>>, StoreError> {
        let state = self.lock();
        let mut starts: Vec<DateTime<Utc>> = state
            .rate_starts
            .get(queue)
            .map(|v| v.iter().copied().filter(|t| *t > since).collect())
            .unwrap_or_default();
        starts.sort();
        Ok(starts)
    }

    async fn prune_starts(&self, queue: &str, before: DateTime<Utc>) -> Result<(), StoreError> {
        let mut state = self.lock();
        if let Some(starts) = state.rate_starts.get_mut(queue) {
            starts.retain(|t| *t > before);
        }
        Ok(())
    }

    async fn clear_starts(&self, queue: &str) -> Result<(), StoreError> {
        self.lock().rate_starts.remove(queue);
        Ok(())
    }
}
