//! Job persistence backends.
//!
//! The store is the single point of truth for job state: every transition
//! goes through it, and the scheduling loop stays dumb. Four backends ship:
//!
//! - [`memory::InMemoryJobStore`] — maps guarded by a mutex
//! - [`sqlite::SqliteJobStore`] — single-file relational store,
//!   claim via `UPDATE … RETURNING`
//! - [`postgres::PostgresJobStore`] — server SQL,
//!   claim via `FOR UPDATE SKIP LOCKED`
//! - [`local::LocalJobStore`] — embedded indexed object store (sled)
//!
//! Every backend maintains the same logical indexes: `status`,
//! `(status, run_after)`, `job_run_id`, `(task_type, fingerprint, status)`.
//!
//! # Implementer Notes
//!
//! - `next()` must be atomic: two concurrent calls never return the same
//!   job. Use row locking, `UPDATE … RETURNING`, or a mutex.
//! - `complete()` funnels through [`Job::apply_outcome`] so the retry policy
//!   has exactly one implementation.
//! - A [`StoreError`] must never leave a job in a half-applied status.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::error::StoreError;
use crate::job::{Job, JobOutcome};

pub mod local;
pub mod memory;
pub mod postgres;
pub mod sqlite;

/// Persistence of jobs for one named queue.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Name of the queue this store serves.
    fn queue_name(&self) -> &str;

    /// Insert a job. Fails with [`StoreError::Duplicate`] if the id exists.
    async fn add(&self, job: Job) -> Result<Uuid, StoreError>;

    /// Fetch a job by id.
    async fn get(&self, id: Uuid) -> Result<Option<Job>, StoreError>;

    /// Up to `limit` `PENDING` jobs ordered by `(run_after, created_at, id)`.
    async fn peek(&self, limit: usize) -> Result<Vec<Job>, StoreError>;

    /// Atomically claim the earliest eligible `PENDING` job, transitioning
    /// it to `PROCESSING`. Returns `None` when nothing is eligible.
    async fn next(&self) -> Result<Option<Job>, StoreError>;

    /// All jobs currently `PROCESSING`.
    async fn processing(&self) -> Result<Vec<Job>, StoreError>;

    /// All jobs currently `ABORTING`.
    async fn aborting(&self) -> Result<Vec<Job>, StoreError>;

    /// Apply an execution outcome (success, terminal failure, or retry) and
    /// return the updated job.
    async fn complete(&self, id: Uuid, outcome: JobOutcome) -> Result<Job, StoreError>;

    /// Request cancellation of a job and return the updated row:
    /// `PROCESSING` becomes `ABORTING` (a hint to the executor), `PENDING`
    /// fails immediately (there is no execution to signal), anything else is
    /// left untouched.
    async fn abort(&self, id: Uuid) -> Result<Job, StoreError>;

    /// All jobs sharing a `job_run_id`.
    async fn jobs_by_run_id(&self, run_id: Uuid) -> Result<Vec<Job>, StoreError>;

    /// Memoized result lookup: the output of a `COMPLETED` job whose
    /// `(task_type, fingerprint)` matches the given input. When several
    /// match, the oldest wins (stable within a process).
    async fn output_for_input(
        &self,
        task_type: &str,
        input: &Value,
    ) -> Result<Option<Value>, StoreError>;

    /// Number of jobs held for this queue, any status.
    async fn size(&self) -> Result<u64, StoreError>;

    /// Remove every job for this queue.
    async fn delete_all(&self) -> Result<(), StoreError>;

    /// Retention hook: remove terminal jobs last updated before `cutoff`.
    /// Returns how many were removed. Nothing calls this implicitly.
    async fn delete_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;
}

/// Persisted accounting of job start times, keyed by queue.
///
/// Backends implement this next to [`JobStore`] so a
/// [`crate::limiter::StoredRateLimiter`] can keep its sliding window in the
/// same durable medium as the jobs themselves.
#[async_trait]
pub trait RateLedger: Send + Sync {
    /// Record one start at `at`.
    async fn record_start(&self, queue: &str, at: DateTime<Utc>) -> Result<(), StoreError>;

    /// Start times strictly after `since`, ascending.
    async fn starts_since(
        &self,
        queue: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<DateTime<Utc>>, StoreError>;

    /// Drop start times at or before `before`.
    async fn prune_starts(&self, queue: &str, before: DateTime<Utc>) -> Result<(), StoreError>;

    /// Drop all start times for `queue`.
    async fn clear_starts(&self, queue: &str) -> Result<(), StoreError>;
}

/// Claim-order comparison shared by backends that sort in process:
/// `(run_after, created_at, id)` ascending.
pub(crate) fn claim_order(a: &Job, b: &Job) -> std::cmp::Ordering {
    a.run_after
        .cmp(&b.run_after)
        .then(a.created_at.cmp(&b.created_at))
        .then(a.id.cmp(&b.id))
}
