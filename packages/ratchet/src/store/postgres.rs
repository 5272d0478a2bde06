//! PostgreSQL-backed job store.
//!
//! The server-SQL backend for processes that share a database with the rest
//! of an application. The claim in `next()` uses a CTE with
//! `FOR UPDATE SKIP LOCKED`, so concurrent claimants on separate connections
//! never receive the same row.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{JobErrorKind, StoreError};
use crate::fingerprint::fingerprint;
use crate::job::{Job, JobOutcome, JobStatus};
use crate::store::{JobStore, RateLedger};

/// PostgreSQL job store scoped to one queue.
pub struct PostgresJobStore {
    pool: PgPool,
    queue: String,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool, queue: impl Into<String>) -> Self {
        Self {
            pool,
            queue: queue.into(),
        }
    }

    /// Create the `jobs` and `job_queue_rate_limit` tables and their indexes.
    pub async fn migrate(pool: &PgPool) -> Result<(), StoreError> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id UUID PRIMARY KEY,
                queue_name TEXT NOT NULL,
                job_run_id UUID,
                task_type TEXT NOT NULL,
                input JSONB NOT NULL,
                fingerprint TEXT NOT NULL,
                status TEXT NOT NULL,
                output JSONB,
                error TEXT,
                error_kind TEXT,
                retries INT NOT NULL DEFAULT 0,
                max_retries INT NOT NULL DEFAULT 3,
                run_after TIMESTAMPTZ NOT NULL,
                deadline_at TIMESTAMPTZ,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs (queue_name, status)",
            "CREATE INDEX IF NOT EXISTS idx_jobs_status_run_after ON jobs (queue_name, status, run_after)",
            "CREATE INDEX IF NOT EXISTS idx_jobs_run_id ON jobs (job_run_id)",
            "CREATE INDEX IF NOT EXISTS idx_jobs_memo ON jobs (task_type, fingerprint, status)",
            r#"
            CREATE TABLE IF NOT EXISTS job_queue_rate_limit (
                queue TEXT NOT NULL,
                started_at TIMESTAMPTZ NOT NULL
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
        let row =
            sqlx::query_as::<_, PgJobRow>("SELECT * FROM jobs WHERE id = $1 AND queue_name = $2")
                .bind(id)
                .bind(&self.queue)
                .fetch_optional(&self.pool)
                .await?;

        row.ok_or(StoreError::NotFound(id))?.into_job()
    }

    async fn persist(&self, job: &Job) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET status = $1, output = $2, error = $3, error_kind = $4,
                retries = $5, run_after = $6, updated_at = $7
            WHERE id = $8
            "#,
        )
        .bind(job.status.as_str())
        .bind(&job.output)
        .bind(&job.error)
        .bind(job.error_kind.map(|k| k.as_str()))
        .bind(job.retries)
        .bind(job.run_after)
        .bind(job.updated_at)
        .bind(job.id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn by_status(&self, status: JobStatus) -> Result<Vec<Job>, StoreError> {
        let rows = sqlx::query_as::<_, PgJobRow>(
            r#"
            SELECT * FROM jobs
            WHERE queue_name = $1 AND status = $2
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
impl JobStore for PostgresJobStore {
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
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            "#,
        )
        .bind(id)
        .bind(&job.queue_name)
        .bind(job.job_run_id)
        .bind(&job.task_type)
        .bind(&job.input)
        .bind(&job.fingerprint)
        .bind(job.status.as_str())
        .bind(&job.output)
        .bind(&job.error)
        .bind(job.error_kind.map(|k| k.as_str()))
        .bind(job.retries)
        .bind(job.max_retries)
        .bind(job.run_after)
        .bind(job.deadline_at)
        .bind(job.created_at)
        .bind(job.updated_at)
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
        let row =
            sqlx::query_as::<_, PgJobRow>("SELECT * FROM jobs WHERE id = $1 AND queue_name = $2")
                .bind(id)
                .bind(&self.queue)
                .fetch_optional(&self.pool)
                .await?;

        row.map(|r| r.into_job()).transpose()
    }

    async fn peek(&self, limit: usize) -> Result<Vec<Job>, StoreError> {
        let rows = sqlx::query_as::<_, PgJobRow>(
            r#"
            SELECT * FROM jobs
            WHERE queue_name = $1 AND status = 'pending'
            ORDER BY run_after ASC, created_at ASC, id ASC
            LIMIT $2
            "#,
        )
        .bind(&self.queue)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|r| r.into_job()).collect()
    }

    async fn next(&self) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query_as::<_, PgJobRow>(
            r#"
            WITH candidate AS (
                SELECT id FROM jobs
                WHERE queue_name = $1 AND status = 'pending' AND run_after <= NOW()
                ORDER BY run_after ASC, created_at ASC, id ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE jobs
            SET status = 'processing', updated_at = NOW()
            WHERE id IN (SELECT id FROM candidate)
            RETURNING *
            "#,
        )
        .bind(&self.queue)
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
        let rows = sqlx::query_as::<_, PgJobRow>(
            r#"
            SELECT * FROM jobs
            WHERE queue_name = $1 AND job_run_id = $2
            ORDER BY run_after ASC, created_at ASC, id ASC
            "#,
        )
        .bind(&self.queue)
        .bind(run_id)
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
        let output: Option<Option<Value>> = sqlx::query_scalar(
            r#"
            SELECT output FROM jobs
            WHERE queue_name = $1 AND task_type = $2 AND fingerprint = $3 AND status = 'completed'
            ORDER BY created_at ASC, id ASC
            LIMIT 1
            "#,
        )
        .bind(&self.queue)
        .bind(task_type)
        .bind(&digest)
        .fetch_optional(&self.pool)
        .await?;

        Ok(output.flatten())
    }

    async fn size(&self) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM jobs WHERE queue_name = $1")
            .bind(&self.queue)
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }

    async fn delete_all(&self) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM jobs WHERE queue_name = $1")
            .bind(&self.queue)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM jobs
            WHERE queue_name = $1
              AND status IN ('completed', 'failed', 'skipped')
              AND updated_at < $2
            "#,
        )
        .bind(&self.queue)
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl RateLedger for PostgresJobStore {
    async fn record_start(&self, queue: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO job_queue_rate_limit (queue, started_at) VALUES ($1, $2)")
            .bind(queue)
            .bind(at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn starts_since(
        &self,
        queue: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<DateTime<Utc>>, StoreError> {
        let rows: Vec<DateTime<Utc>> = sqlx::query_scalar(
            r#"
            SELECT started_at FROM job_queue_rate_limit
            WHERE queue = $1 AND started_at > $2
            ORDER BY started_at ASC
            "#,
        )
        .bind(queue)
        .bind(since)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn prune_starts(&self, queue: &str, before: DateTime<Utc>) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM job_queue_rate_limit WHERE queue = $1 AND started_at <= $2")
            .bind(queue)
            .bind(before)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn clear_starts(&self, queue: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM job_queue_rate_limit WHERE queue = $1")
            .bind(queue)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// Raw row shape; status and error kind as text, everything else native.
#[derive(Debug, sqlx::FromRow)]
struct PgJobRow {
    id: Uuid,
    queue_name: String,
    job_run_id: Option<Uuid>,
    task_type: String,
    input: Value,
    fingerprint: String,
    status: String,
    output: Option<Value>,
    error: Option<String>,
    error_kind: Option<String>,
    retries: i32,
    max_retries: i32,
    run_after: DateTime<Utc>,
    deadline_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl PgJobRow {
    fn into_job(self) -> Result<Job, StoreError> {
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
            id: self.id,
            queue_name: self.queue_name,
            job_run_id: self.job_run_id,
            task_type: self.task_type,
            input: self.input,
            fingerprint: self.fingerprint,
            status,
            output: self.output,
            error: self.error,
            error_kind,
            retries: self.retries,
            max_retries: self.max_retries,
            run_after: self.run_after,
            deadline_at: self.deadline_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}
