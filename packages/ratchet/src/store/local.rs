//! Embedded object-store backend.
//!
//! A single-file indexed object store built on `sled`: the `jobs` tree holds
//! the records keyed by id, and secondary trees act as the indexes —
//! `by_status`, `by_ready` (`run_after ‖ created_at ‖ id`, pending jobs
//! only), `by_run`, and `by_memo` (`task_type ‖ fingerprint ‖ id`).
//!
//! The claim in `next()` is a cursor over `by_ready` followed by a
//! compare-and-swap on the record in the `jobs` tree: the swap succeeds only
//! if the record is byte-identical to what the cursor read, so two
//! concurrent claimants never receive the same job; the loser just advances
//! its cursor.
//!
//! Index trees are maintained alongside writes but treated as hints: every
//! read verifies the record in the `jobs` tree before using it, and stale
//! cursor entries are removed lazily.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sled::{IVec, Tree};
use uuid::Uuid;

use crate::error::StoreError;
use crate::fingerprint::fingerprint;
use crate::job::{Job, JobOutcome, JobStatus};
use crate::store::{claim_order, JobStore, RateLedger};

/// Sled-backed job store scoped to one queue.
///
/// Trees are namespaced by queue name, so several stores can share one
/// database file. The rate-limit tree is shared; its keys carry the queue.
pub struct LocalJobStore {
    queue: String,
    jobs: Tree,
    by_status: Tree,
    by_ready: Tree,
    by_run: Tree,
    by_memo: Tree,
    rate: Tree,
    rate_seq: AtomicU64,
}

impl LocalJobStore {
    pub fn open(db: &sled::Db, queue: impl Into<String>) -> Result<Self, StoreError> {
        let queue = queue.into();
        Ok(Self {
            jobs: db.open_tree(format!("{queue}:jobs"))?,
            by_status: db.open_tree(format!("{queue}:by_status"))?,
            by_ready: db.open_tree(format!("{queue}:by_ready"))?,
            by_run: db.open_tree(format!("{queue}:by_run"))?,
            by_memo: db.open_tree(format!("{queue}:by_memo"))?,
            rate: db.open_tree("job_queue_rate_limit")?,
            rate_seq: AtomicU64::new(0),
            queue,
        })
    }

    fn decode(raw: &[u8]) -> Result<Job, StoreError> {
        Ok(serde_json::from_slice(raw)?)
    }

    fn fetch(&self, id: Uuid) -> Result<Job, StoreError> {
        match self.jobs.get(id.as_bytes())? {
            Some(raw) => Self::decode(&raw),
            None => Err(StoreError::NotFound(id)),
        }
    }

    /// Write `new` in place of `old` and keep the index trees in step.
    fn persist_swap(&self, old: &Job, new: &Job) -> Result<(), StoreError> {
        self.jobs
            .insert(new.id.as_bytes(), serde_json::to_vec(new)?)?;
        self.reindex(old, new)?;
        Ok(())
    }

    fn reindex(&self, old: &Job, new: &Job) -> Result<(), StoreError> {
        if old.status != new.status {
            self.by_status.remove(status_key(old.status, old.id))?;
            self.by_status
                .insert(status_key(new.status, new.id), new.id.as_bytes().to_vec())?;
        }
        if old.status == JobStatus::Pending {
            self.by_ready.remove(ready_key(old))?;
        }
        if new.status == JobStatus::Pending {
            self.by_ready
                .insert(ready_key(new), new.id.as_bytes().to_vec())?;
        }
        Ok(())
    }

    fn by_status_scan(&self, status: JobStatus) -> Result<Vec<Job>, StoreError> {
        let mut jobs = Vec::new();
        for entry in self.by_status.scan_prefix([status_byte(status)]) {
            let (_, id_bytes) = entry?;
            let id = id_from_bytes(id_bytes.as_ref())?;
            if let Some(raw) = self.jobs.get(id.as_bytes())? {
                let job = Self::decode(&raw)?;
                if job.status == status {
                    jobs.push(job);
                }
            }
        }
        jobs.sort_by(claim_order);
        Ok(jobs)
    }

    fn remove_record(&self, job: &Job) -> Result<(), StoreError> {
        self.jobs.remove(job.id.as_bytes())?;
        self.by_status.remove(status_key(job.status, job.id))?;
        if job.status == JobStatus::Pending {
            self.by_ready.remove(ready_key(job))?;
        }
        if let Some(run) = job.job_run_id {
            self.by_run.remove(run_key(run, job.id))?;
        }
        self.by_memo
            .remove(memo_key(&job.task_type, &job.fingerprint, job.id))?;
        Ok(())
    }
}

#[async_trait]
impl JobStore for LocalJobStore {
    fn queue_name(&self) -> &str {
        &self.queue
    }

    async fn add(&self, job: Job) -> Result<Uuid, StoreError> {
        let id = job.id;
        let bytes = serde_json::to_vec(&job)?;

        // Insert-if-absent; a concurrent add with the same id loses here.
        if self
            .jobs
            .compare_and_swap(id.as_bytes(), None as Option<IVec>, Some(bytes))?
            .is_err()
        {
            return Err(StoreError::Duplicate(id));
        }

        self.by_status
            .insert(status_key(job.status, id), id.as_bytes().to_vec())?;
        if job.status == JobStatus::Pending {
            self.by_ready
                .insert(ready_key(&job), id.as_bytes().to_vec())?;
        }
        if let Some(run) = job.job_run_id {
            self.by_run.insert(run_key(run, id), id.as_bytes().to_vec())?;
        }
        self.by_memo.insert(
            memo_key(&job.task_type, &job.fingerprint, id),
            id.as_bytes().to_vec(),
        )?;
        Ok(id)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Job>, StoreError> {
        match self.jobs.get(id.as_bytes())? {
            Some(raw) => Ok(Some(Self::decode(&raw)?)),
            None => Ok(None),
        }
    }

    async fn peek(&self, limit: usize) -> Result<Vec<Job>, StoreError> {
        let mut jobs = Vec::new();
        for entry in self.by_ready.iter() {
            if jobs.len() >= limit {
                break;
            }
            let (_, id_bytes) = entry?;
            let id = id_from_bytes(id_bytes.as_ref())?;
            if let Some(raw) = self.jobs.get(id.as_bytes())? {
                let job = Self::decode(&raw)?;
                if job.status == JobStatus::Pending {
                    jobs.push(job);
                }
            }
        }
        Ok(jobs)
    }

    async fn next(&self) -> Result<Option<Job>, StoreError> {
        let now = Utc::now();
        let horizon = order_millis(now);

        for entry in self.by_ready.iter() {
            let (cursor_key, id_bytes) = entry?;
            if cursor_key.as_ref()[..8] > horizon[..] {
                // The index is ordered by run_after; nothing further is due.
                break;
            }
            let id = id_from_bytes(id_bytes.as_ref())?;

            let raw = match self.jobs.get(id.as_bytes())? {
                Some(raw) => raw,
                None => {
                    // Stale cursor entry for a deleted job.
                    self.by_ready.remove(&cursor_key)?;
                    continue;
                }
            };
            let job = Self::decode(&raw)?;
            if job.status != JobStatus::Pending {
                self.by_ready.remove(&cursor_key)?;
                continue;
            }
            if job.run_after > now {
                continue;
            }

            let mut claimed = job.clone();
            claimed.status = JobStatus::Processing;
            claimed.updated_at = now;
            let swapped = self.jobs.compare_and_swap(
                id.as_bytes(),
                Some(raw),
                Some(serde_json::to_vec(&claimed)?),
            )?;
            if swapped.is_err() {
                // Another claimant won; try the next candidate.
                continue;
            }
            self.reindex(&job, &claimed)?;
            return Ok(Some(claimed));
        }
        Ok(None)
    }

    async fn processing(&self) -> Result<Vec<Job>, StoreError> {
        self.by_status_scan(JobStatus::Processing)
    }

    async fn aborting(&self) -> Result<Vec<Job>, StoreError> {
        self.by_status_scan(JobStatus::Aborting)
    }

    async fn complete(&self, id: Uuid, outcome: JobOutcome) -> Result<Job, StoreError> {
        let old = self.fetch(id)?;
        let mut job = old.clone();
        job.apply_outcome(outcome, Utc::now());
        self.persist_swap(&old, &job)?;
        Ok(job)
    }

    async fn abort(&self, id: Uuid) -> Result<Job, StoreError> {
        let old = self.fetch(id)?;
        let mut job = old.clone();
        if job.apply_abort(Utc::now()) {
            self.persist_swap(&old, &job)?;
        }
        Ok(job)
    }

    async fn jobs_by_run_id(&self, run_id: Uuid) -> Result<Vec<Job>, StoreError> {
        let mut jobs = Vec::new();
        for entry in self.by_run.scan_prefix(run_id.as_bytes()) {
            let (_, id_bytes) = entry?;
            let id = id_from_bytes(id_bytes.as_ref())?;
            if let Some(raw) = self.jobs.get(id.as_bytes())? {
                let job = Self::decode(&raw)?;
                if job.job_run_id == Some(run_id) {
                    jobs.push(job);
                }
            }
        }
        jobs.sort_by(claim_order);
        Ok(jobs)
    }

    async fn output_for_input(
        &self,
        task_type: &str,
        input: &Value,
    ) -> Result<Option<Value>, StoreError> {
        let digest = fingerprint(input);
        let mut prefix = Vec::with_capacity(task_type.len() + digest.len() + 2);
        prefix.extend_from_slice(task_type.as_bytes());
        prefix.push(0);
        prefix.extend_from_slice(digest.as_bytes());
        prefix.push(0);

        let mut best: Option<Job> = None;
        for entry in self.by_memo.scan_prefix(&prefix) {
            let (_, id_bytes) = entry?;
            let id = id_from_bytes(id_bytes.as_ref())?;
            if let Some(raw) = self.jobs.get(id.as_bytes())? {
                let job = Self::decode(&raw)?;
                if job.status != JobStatus::Completed
                    || job.task_type != task_type
                    || job.fingerprint != digest
                {
                    continue;
                }
                let better = match &best {
                    Some(current) => (job.created_at, job.id) < (current.created_at, current.id),
                    None => true,
                };
                if better {
                    best = Some(job);
                }
            }
        }
        Ok(best.and_then(|j| j.output))
    }

    async fn size(&self) -> Result<u64, StoreError> {
        Ok(self.jobs.len() as u64)
    }

    async fn delete_all(&self) -> Result<(), StoreError> {
        self.jobs.clear()?;
        self.by_status.clear()?;
        self.by_ready.clear()?;
        self.by_run.clear()?;
        self.by_memo.clear()?;
        Ok(())
    }

    async fn delete_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut victims = Vec::new();
        for entry in self.jobs.iter() {
            let (_, raw) = entry?;
            let job = Self::decode(&raw)?;
            if job.status.is_terminal() && job.updated_at < cutoff {
                victims.push(job);
            }
        }
        for job in &victims {
            self.remove_record(job)?;
        }
        Ok(victims.len() as u64)
    }
}

#[async_trait]
impl RateLedger for LocalJobStore {
    async fn record_start(&self, queue: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        let seq = self.rate_seq.fetch_add(1, Ordering::Relaxed);
        let mut key = Vec::with_capacity(queue.len() + 17);
        key.extend_from_slice(queue.as_bytes());
        key.push(0);
        key.extend_from_slice(&order_millis(at));
        key.extend_from_slice(&seq.to_be_bytes());
        self.rate.insert(key, vec![])?;
        Ok(())
    }

    async fn starts_since(
        &self,
        queue: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<DateTime<Utc>>, StoreError> {
        let mut starts = Vec::new();
        for entry in self.rate.scan_prefix(rate_prefix(queue)) {
            let (key, _) = entry?;
            let at = rate_key_instant(queue, key.as_ref())?;
            if at > since {
                starts.push(at);
            }
        }
        Ok(starts)
    }

    async fn prune_starts(&self, queue: &str, before: DateTime<Utc>) -> Result<(), StoreError> {
        let mut victims = Vec::new();
        for entry in self.rate.scan_prefix(rate_prefix(queue)) {
            let (key, _) = entry?;
            if rate_key_instant(queue, key.as_ref())? <= before {
                victims.push(key);
            }
        }
        for key in victims {
            self.rate.remove(key)?;
        }
        Ok(())
    }

    async fn clear_starts(&self, queue: &str) -> Result<(), StoreError> {
        let keys: Vec<_> = self
            .rate
            .scan_prefix(rate_prefix(queue))
            .filter_map(|entry| entry.ok().map(|(k, _)| k))
            .collect();
        for key in keys {
            self.rate.remove(key)?;
        }
        Ok(())
    }
}

// Key encoding. Instants are epoch milliseconds with the sign bit flipped so
// byte-wise ordering matches chronological ordering.

fn order_millis(at: DateTime<Utc>) -> [u8; 8] {
    ((at.timestamp_millis() as u64) ^ (1 << 63)).to_be_bytes()
}

fn instant_from_order(bytes: &[u8]) -> Result<DateTime<Utc>, StoreError> {
    let raw: [u8; 8] = bytes
        .try_into()
        .map_err(|_| StoreError::Corrupt("truncated instant key".to_string()))?;
    let millis = (u64::from_be_bytes(raw) ^ (1 << 63)) as i64;
    DateTime::<Utc>::from_timestamp_millis(millis)
        .ok_or_else(|| StoreError::Corrupt(format!("timestamp out of range: {millis}")))
}

fn status_byte(status: JobStatus) -> u8 {
    match status {
        JobStatus::Pending => 0,
        JobStatus::Processing => 1,
        JobStatus::Aborting => 2,
        JobStatus::Completed => 3,
        JobStatus::Failed => 4,
        JobStatus::Skipped => 5,
    }
}

fn status_key(status: JobStatus, id: Uuid) -> Vec<u8> {
    let mut key = Vec::with_capacity(17);
    key.push(status_byte(status));
    key.extend_from_slice(id.as_bytes());
    key
}

fn ready_key(job: &Job) -> Vec<u8> {
    let mut key = Vec::with_capacity(32);
    key.extend_from_slice(&order_millis(job.run_after));
    key.extend_from_slice(&order_millis(job.created_at));
    key.extend_from_slice(job.id.as_bytes());
    key
}

fn run_key(run_id: Uuid, id: Uuid) -> Vec<u8> {
    let mut key = Vec::with_capacity(32);
    key.extend_from_slice(run_id.as_bytes());
    key.extend_from_slice(id.as_bytes());
    key
}

fn memo_key(task_type: &str, digest: &str, id: Uuid) -> Vec<u8> {
    let mut key = Vec::with_capacity(task_type.len() + digest.len() + 18);
    key.extend_from_slice(task_type.as_bytes());
    key.push(0);
    key.extend_from_slice(digest.as_bytes());
    key.push(0);
    key.extend_from_slice(id.as_bytes());
    key
}

fn rate_prefix(queue: &str) -> Vec<u8> {
    let mut prefix = Vec::with_capacity(queue.len() + 1);
    prefix.extend_from_slice(queue.as_bytes());
    prefix.push(0);
    prefix
}

fn rate_key_instant(queue: &str, key: &[u8]) -> Result<DateTime<Utc>, StoreError> {
    let start = queue.len() + 1;
    key.get(start..start + 8)
        .ok_or_else(|| StoreError::Corrupt("truncated rate key".to_string()))
        .and_then(instant_from_order)
}

fn id_from_bytes(bytes: &[u8]) -> Result<Uuid, StoreError> {
    Uuid::from_slice(bytes).map_err(|e| StoreError::Corrupt(format!("bad index id: {e}")))
}
