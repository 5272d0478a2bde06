//! SQLite-backed job store.
//!
//! A single-file relational backend for tools that need durability without a
//! server. The claim in `next()` rides on `UPDATE … RETURNING` over the
//! `(status, run_after)` index, which SQLite executes atomically.
//!
//! Instants are stored as epoch milliseconds, ids as canonical UUID text,
//! and JSON payloads as text.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::error::{JobErrorKind, StoreError};
use crate::fingerprint::fingerprint;
use crate::job::{Job, JobOutcome, JobStatus};
use crate::store::{JobStore, RateLedger};

/// SQLite job store scoped to one queue.
pub struct SqliteJobStore {
    pool: SqlitePool,
    queue: String,
}

impl SqliteJobStore {
    pub fn new(pool: SqlitePool, queue: impl Into<String>) -> Self {
        Self {
            pool,
            queue: queue.into(),
        }
    }

    /// Create the `jobs` and `job_queue_rate_limit` tables and their indexes.
    pub async fn migrate(pool: &SqlitePool) -> Result<(), StoreError> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                queue_name TEXT NOT NULL,
                job_run_id TEXT,
                task_type TEXT NOT NULL,
                input TEXT NOT NULL,
                fingerprint TEXT NOT NULL,
                status TEXT NOT NULL,
                output TEXT,
                error TEXT,
                error_kind TEXT,
                retries INTEGER NOT NULL DEFAULT 0,
                max_retries INTEGER NOT NULL DEFAULT 3,
                run_after INTEGER NOT NULL,
                deadline_at INTEGER,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs (queue_name, status)",
            "CREATE INDEX IF NOT EXISTS idx_jobs_status_run_after ON jobs (queue_name, status, run_after)",
            "CREATE INDEX IF NOT EXISTS idx_jobs_run_id ON jobs (job_run_id)",
            "CREATE INDEX IF NOT EXISTS idx_jobs_memo ON jobs (task_type, fingerprint, status)",
            r#"
            CREATE TABLE IF NOT EXISTS job_queue_rate_limit (
                queue TEXT NOT NULL,
                started_at INTEGER NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_rate_limit_queue ON job_queue_rate_limit (queue, started_at)",
        ];

        for statement in statements {
            sqlx::query(statement).execute(pool).await?;
        }
        Ok(())
    }

    async fn fetch(&self, id: Uuid) -> Result<Job, StoreError> {
        let row = sqlx::query_as::<_, SqliteJobRow>(
            "SELECT * FROM jobs WHERE id = ? AND queue_name = ?",
        )
        .bind(id.to_string())
        .bind(&self.queue)
        .fetch_optional(&self.pool)
        .await?;

        row.ok_or(StoreError::NotFound(id))?.into_job()
    }

    async fn persist(&self, job: &Job) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET status = ?, output = ?, error = ?, error_kind = ?,
                retries = ?, run_after = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(job.status.as_str())
        .bind(
            job.output
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
        )
        .bind(&job.error)
        .bind(job.error_kind.map(|k| k.as_str()))
        .bind(job.retries as i64)
        .bind(job.run_after.timestamp_millis())
        .bind(job.updated_at.timestamp_millis())
        .bind(job.id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn by_status(&self, status: JobStatus) -> Result<Vec<Job>, StoreError> {
        let rows = sqlx::query_as::<_, SqliteJobRow>(
            r#"
            SELECT * FROM jobs
            WHERE queue_name = ? AND status = ?
            ORDER BY run_after ASC, created_at ASC, id ASC
            "#,
        )
        .bind(&self.queue)
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|r| r.into_job()).collect()
    }
}

#[async_trait]
impl JobStore for SqliteJobStore {
    fn queue_name(&self) -> &str {
        &self.queue
    }

    async fn add(&self, job: Job) -> Result<Uuid, StoreError> {
        let id = job.id;
        let result = sqlx::query(
            r#"
            INSERT INTO jobs (
                id, queue_name, job_run_id, task_type, input, fingerprint,
                status, output, error, error_kind, retries, max_retries,
                run_after, deadline_at, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(id.to_string())
        .bind(&job.queue_name)
        .bind(job.job_run_id.map(|r| r.to_string()))
        .bind(&job.task_type)
        .bind(serde_json::to_string(&job.input)?)
        .bind(&job.fingerprint)
        .bind(job.status.as_str())
        .bind(
            job.output
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
        )
        .bind(&job.error)
        .bind(job.error_kind.map(|k| k.as_str()))
        .bind(job.retries as i64)
        .bind(job.max_retries as i64)
        .bind(job.run_after.timestamp_millis())
        .bind(job.deadline_at.map(|d| d.timestamp_millis()))
        .bind(job.created_at.timestamp_millis())
        .bind(job.updated_at.timestamp_millis())
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(id),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(StoreError::Duplicate(id))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get(&self, id: Uuid) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query_as::<_, SqliteJobRow>(
            "SELECT * FROM jobs WHERE id = ? AND queue_name = ?",
        )
        .bind(id.to_string())
        .bind(&self.queue)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| r.into_job()).transpose()
    }

    async fn peek(&self, limit: usize) -> Result<Vec<Job>, StoreError> {
        let rows = sqlx::query_as::<_, SqliteJobRow>(
            r#"
            SELECT * FROM jobs
            WHERE queue_name = ? AND status = 'pending'
            ORDER BY run_after ASC, created_at ASC, id ASC
            LIMIT ?
            "#,
        )
        .bind(&self.queue)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|r| r.into_job()).collect()
    }

    async fn next(&self) -> Result<Option<Job>, StoreError> {
        let now = Utc::now();
        let row = sqlx::query_as::<_, SqliteJobRow>(
            r#"
            UPDATE jobs
            SET status = 'processing', updated_at = ?
            WHERE id = (
                SELECT id FROM jobs
                WHERE queue_name = ? AND status = 'pending' AND run_after <= ?
                ORDER BY run_after ASC, created_at ASC, id ASC
                LIMIT 1
            )
            RETURNING *
            "#,
        )
        .bind(now.timestamp_millis())
        .bind(&self.queue)
        .bind(now.timestamp_millis())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| r.into_job()).transpose()
    }

    async fn processing(&self) -> Result<Vec<Job>, StoreError> {
        self.by_status(JobStatus::Processing).await
    }

    async fn aborting(&self) -> Result<Vec<Job>, StoreError> {
        self.by_status(JobStatus::Aborting).await
    }

    async fn complete(&self, id: Uuid, outcome: JobOutcome) -> Result<Job, StoreError> {
        let mut job = self.fetch(id).await?;
        job.apply_outcome(outcome, Utc::now());
        self.persist(&job).await?;
        Ok(job)
    }

    async fn abort(&self, id: Uuid) -> Result<Job, StoreError> {
        let mut job = self.fetch(id).await?;
        if job.apply_abort(Utc::now()) {
            self.persist(&job).await?;
        }
        Ok(job)
    }

    async fn jobs_by_run_id(&self, run_id: Uuid) -> Result<Vec<Job>, StoreError> {
        let rows = sqlx::query_as::<_, SqliteJobRow>(
            r#"
            SELECT * FROM jobs
            WHERE queue_name = ? AND job_run_id = ?
            ORDER BY run_after ASC, created_at ASC, id ASC
            "#,
        )
        .bind(&self.queue)
        .bind(run_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|r| r.into_job()).collect()
    }

    async fn output_for_input(
        &self,
        task_type: &str,
        input: &Value,
    ) -> Result<Option<Value>, StoreError> {
        let digest = fingerprint(input);
        let output: Option<Option<String>> = sqlx::query_scalar(
            r#"
            SELECT output FROM jobs
            WHERE queue_name = ? AND task_type = ? AND fingerprint = ? AND status = 'completed'
            ORDER BY created_at ASC, id ASC
            LIMIT 1
            "#,
        )
        .bind(&self.queue)
        .bind(task_type)
        .bind(&digest)
        .fetch_optional(&self.pool)
        .await?;

        match output.flatten() {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn size(&self) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM jobs WHERE queue_name = ?")
            .bind(&self.queue)
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }

    async fn delete_all(&self) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM jobs WHERE queue_name = ?")
            .bind(&self.queue)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM jobs
            WHERE queue_name = ?
              AND status IN ('completed', 'failed', 'skipped')
              AND updated_at < ?
            "#,
        )
        .bind(&self.queue)
        .bind(cutoff.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl RateLedger for SqliteJobStore {
    async fn record_start(&self, queue: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO job_queue_rate_limit (queue, started_at) VALUES (?, ?)")
            .bind(queue)
            .bind(at.timestamp_millis())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn starts_since(
        &self,
        queue: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<DateTime<Utc>>, StoreError> {
        let rows: Vec<i64> = sqlx::query_scalar(
            r#"
            SELECT started_at FROM job_queue_rate_limit
            WHERE queue = ? AND started_at > ?
            ORDER BY started_at ASC
            "#,
        )
        .bind(queue)
        .bind(since.timestamp_millis())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(millis_to_datetime).collect()
    }

    async fn prune_starts(&self, queue: &str, before: DateTime<Utc>) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM job_queue_rate_limit WHERE queue = ? AND started_at <= ?")
            .bind(queue)
            .bind(before.timestamp_millis())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn clear_starts(&self, queue: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM job_queue_rate_limit WHERE queue = ?")
            .bind(queue)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn millis_to_datetime(millis: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::<Utc>::from_timestamp_millis(millis)
        .ok_or_else(|| StoreError::Corrupt(format!("timestamp out of range: {millis}")))
}

/// Raw row shape; instants as millis, ids and JSON as text.
#[derive(Debug, sqlx::FromRow)]
struct SqliteJobRow {
    id: String,
    queue_name: String,
    job_run_id: Option<String>,
    task_type: String,
    input: String,
    fingerprint: String,
    status: String,
    output: Option<String>,
    error: Option<String>,
    error_kind: Option<String>,
    retries: i64,
    max_retries: i64,
    run_after: i64,
    deadline_at: Option<i64>,
    created_at: i64,
    updated_at: i64,
}

impl SqliteJobRow {
    fn into_job(self) -> Result<Job, StoreError> {
        let id = Uuid::parse_str(&self.id)
            .map_err(|e| StoreError::Corrupt(format!("bad job id {}: {e}", self.id)))?;
        let job_run_id = self
            .job_run_id
            .map(|r| {
                Uuid::parse_str(&r)
                    .map_err(|e| StoreError::Corrupt(format!("bad job_run_id {r}: {e}")))
            })
            .transpose()?;
        let status = JobStatus::parse(&self.status)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown status: {}", self.status)))?;
        let error_kind = self
            .error_kind
            .map(|k| {
                JobErrorKind::parse(&k)
                    .ok_or_else(|| StoreError::Corrupt(format!("unknown error kind: {k}")))
            })
            .transpose()?;

        Ok(Job {
            id,
            queue_name: self.queue_name,
            job_run_id,
            task_type: self.task_type,
            input: serde_json::from_str(&self.input)?,
            fingerprint: self.fingerprint,
            status,
            output: self.output.map(|o| serde_json::from_str(&o)).transpose()?,
            error: self.error,
            error_kind,
            retries: self.retries as i32,
            max_retries: self.max_retries as i32,
            run_after: millis_to_datetime(self.run_after)?,
            deadline_at: self.deadline_at.map(millis_to_datetime).transpose()?,
            created_at: millis_to_datetime(self.created_at)?,
            updated_at: millis_to_datetime(self.updated_at)?,
        })
    }
}
