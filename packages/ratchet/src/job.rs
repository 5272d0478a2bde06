//! Job model and execution contract.
//!
//! A [`Job`] is a durable unit of work: a typed input, a fingerprint of that
//! input for memoized lookup, and a lifecycle that may include retries,
//! backoff, failure, or external abort. Jobs are mutated only through their
//! owning queue; every transition goes through the store.
//!
//! Status transitions form a DAG:
//!
//! ```text
//! PENDING ─► PROCESSING ─► COMPLETED
//!                │    │
//!                │    └──► PENDING (retry, runAfter pushed out)
//!                ├──► FAILED
//!                └──► ABORTING ─► FAILED
//! ```
//!
//! `SKIPPED` is reached only at admission time, when a queue with memoization
//! enabled finds an existing completed output for the same input.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use typed_builder::TypedBuilder;
use uuid::Uuid;

use crate::error::{JobError, JobErrorKind};

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Pending,
    Processing,
    Aborting,
    Completed,
    Failed,
    Skipped,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Aborting => "aborting",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Skipped => "skipped",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobStatus::Pending),
            "processing" => Some(JobStatus::Processing),
            "aborting" => Some(JobStatus::Aborting),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            "skipped" => Some(JobStatus::Skipped),
            _ => None,
        }
    }

    /// Whether the job can never run again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Skipped
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A durable unit of work.
#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct Job {
    #[builder(default = Uuid::new_v4())]
    pub id: Uuid,

    /// Name of the owning queue; assigned by `JobQueue::add`.
    #[builder(default)]
    pub queue_name: String,

    /// Grouping identifier shared by jobs submitted as one logical run.
    #[builder(default, setter(strip_option))]
    pub job_run_id: Option<Uuid>,

    /// Tag identifying the kind of work.
    pub task_type: String,

    /// Opaque payload passed to `execute`.
    pub input: Value,

    /// Stable hash of `input`; computed by `JobQueue::add`.
    #[builder(default)]
    pub fingerprint: String,

    #[builder(default)]
    pub status: JobStatus,

    #[builder(default, setter(strip_option))]
    pub output: Option<Value>,

    #[builder(default, setter(strip_option))]
    pub error: Option<String>,

    #[builder(default, setter(strip_option))]
    pub error_kind: Option<JobErrorKind>,

    #[builder(default = 0)]
    pub retries: i32,
    #[builder(default = 3)]
    pub max_retries: i32,

    /// Earliest time the job is eligible to run.
    #[builder(default = Utc::now())]
    pub run_after: DateTime<Utc>,

    /// Optional absolute timeout; reaching it triggers the abort path.
    #[builder(default, setter(strip_option))]
    pub deadline_at: Option<DateTime<Utc>>,

    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,
    #[builder(default = Utc::now())]
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Convenience constructor for an immediately-eligible job.
    pub fn new(task_type: impl Into<String>, input: Value) -> Self {
        Self::builder().task_type(task_type.into()).input(input).build()
    }

    /// Whether `next()` may claim this job right now.
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending && self.run_after <= now
    }

    /// Apply a terminal-or-retry outcome to this job.
    ///
    /// This is the single place the retry policy lives; every backend funnels
    /// `complete` through it and persists the result. A successful outcome
    /// always lands in `COMPLETED`, even from `ABORTING` (persistence won the
    /// race). A retry past the budget forces `FAILED`.
    pub fn apply_outcome(&mut self, outcome: JobOutcome, now: DateTime<Utc>) {
        match outcome {
            JobOutcome::Completed { output } => {
                self.status = JobStatus::Completed;
                self.output = Some(output);
                self.error = None;
                self.error_kind = None;
            }
            JobOutcome::Failed { error, kind } => {
                self.status = JobStatus::Failed;
                self.error = Some(error);
                self.error_kind = Some(kind);
            }
            JobOutcome::Retry { error, run_after } => {
                self.retries += 1;
                if self.retries >= self.max_retries {
                    self.status = JobStatus::Failed;
                    self.error = Some(error);
                    self.error_kind = Some(JobErrorKind::Retryable);
                } else {
                    self.status = JobStatus::Pending;
                    self.error = Some(error);
                    self.error_kind = Some(JobErrorKind::Retryable);
                    self.run_after = run_after;
                }
            }
        }
        self.updated_at = now;
    }

    /// Apply an abort request to this job. Returns whether anything changed.
    ///
    /// `PROCESSING` becomes `ABORTING` and waits for the executor to observe
    /// the signal. `PENDING` has no execution to signal, so it fails
    /// immediately. Terminal and already-aborting jobs are left untouched.
    pub fn apply_abort(&mut self, now: DateTime<Utc>) -> bool {
        match self.status {
            JobStatus::Processing => {
                self.status = JobStatus::Aborting;
                self.updated_at = now;
                true
            }
            JobStatus::Pending => {
                self.status = JobStatus::Failed;
                self.error = Some("job aborted before start".to_string());
                self.error_kind = Some(JobErrorKind::Abort);
                self.updated_at = now;
                true
            }
            _ => false,
        }
    }
}

/// Classified result of one execution attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    /// Normal return.
    Completed { output: Value },
    /// Terminal failure; no retry.
    Failed { error: String, kind: JobErrorKind },
    /// Transient failure; re-queue with `run_after` if budget remains.
    Retry {
        error: String,
        run_after: DateTime<Utc>,
    },
}

impl From<JobError> for JobOutcome {
    fn from(err: JobError) -> Self {
        match err {
            JobError::Aborted { message } => JobOutcome::Failed {
                error: message,
                kind: JobErrorKind::Abort,
            },
            JobError::Retryable { message, retry_at } => JobOutcome::Retry {
                error: message,
                run_after: retry_at,
            },
            JobError::Permanent { message } => JobOutcome::Failed {
                error: message,
                kind: JobErrorKind::Permanent,
            },
        }
    }
}

/// Execution contract for jobs on a queue.
///
/// `execute` receives a cancellation `signal` and must propagate it to any
/// nested cancellable work, surfacing [`JobError::Aborted`] promptly when it
/// fires. The runtime cannot preempt arbitrary code: a handler that ignores
/// the signal runs to completion and its return value decides the terminal
/// state.
#[async_trait::async_trait]
pub trait JobHandler: Send + Sync {
    async fn execute(&self, job: &Job, signal: CancellationToken) -> Result<Value, JobError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_job() -> Job {
        Job::new("test_task", json!({"data": "input1"}))
    }

    #[test]
    fn new_job_starts_pending_with_defaults() {
        let job = sample_job();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.retries, 0);
        assert_eq!(job.max_retries, 3);
        assert!(job.output.is_none());
        assert!(job.error.is_none());
        assert!(job.job_run_id.is_none());
    }

    #[test]
    fn ready_requires_pending_and_elapsed_run_after() {
        let now = Utc::now();
        let mut job = sample_job();
        assert!(job.is_ready(now));

        job.run_after = now + chrono::Duration::seconds(60);
        assert!(!job.is_ready(now));

        job.run_after = now;
        job.status = JobStatus::Processing;
        assert!(!job.is_ready(now));
    }

    #[test]
    fn completed_outcome_clears_error_state() {
        let now = Utc::now();
        let mut job = sample_job();
        job.status = JobStatus::Processing;
        job.error = Some("previous attempt".to_string());
        job.error_kind = Some(JobErrorKind::Retryable);

        job.apply_outcome(
            JobOutcome::Completed {
                output: json!({"result": "ok"}),
            },
            now,
        );

        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.output, Some(json!({"result": "ok"})));
        assert!(job.error.is_none());
        assert!(job.error_kind.is_none());
    }

    #[test]
    fn success_wins_the_abort_race() {
        let now = Utc::now();
        let mut job = sample_job();
        job.status = JobStatus::Aborting;

        job.apply_outcome(
            JobOutcome::Completed {
                output: json!({"result": "late but real"}),
            },
            now,
        );

        assert_eq!(job.status, JobStatus::Completed);
    }

    #[test]
    fn retry_under_budget_requeues_with_backoff() {
        let now = Utc::now();
        let retry_at = now + chrono::Duration::seconds(30);
        let mut job = sample_job();
        job.status = JobStatus::Processing;

        job.apply_outcome(
            JobOutcome::Retry {
                error: "transient".to_string(),
                run_after: retry_at,
            },
            now,
        );

        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.retries, 1);
        assert_eq!(job.run_after, retry_at);
        assert_eq!(job.error_kind, Some(JobErrorKind::Retryable));
    }

    #[test]
    fn retry_crossing_budget_forces_failed() {
        let now = Utc::now();
        let mut job = sample_job();
        job.status = JobStatus::Processing;
        job.retries = 2;
        job.max_retries = 3;

        job.apply_outcome(
            JobOutcome::Retry {
                error: "still broken".to_string(),
                run_after: now,
            },
            now,
        );

        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.retries, 3);
        assert!(job.retries <= job.max_retries);
    }

    #[test]
    fn abort_error_maps_to_terminal_failure() {
        let outcome = JobOutcome::from(JobError::aborted("signal observed"));
        assert_eq!(
            outcome,
            JobOutcome::Failed {
                error: "signal observed".to_string(),
                kind: JobErrorKind::Abort,
            }
        );
    }

    #[test]
    fn abort_of_processing_job_moves_to_aborting() {
        let now = Utc::now();
        let mut job = sample_job();
        job.status = JobStatus::Processing;

        assert!(job.apply_abort(now));
        assert_eq!(job.status, JobStatus::Aborting);
    }

    #[test]
    fn abort_of_pending_job_fails_immediately() {
        let now = Utc::now();
        let mut job = sample_job();

        assert!(job.apply_abort(now));
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error_kind, Some(JobErrorKind::Abort));
    }

    #[test]
    fn abort_of_terminal_job_is_a_noop() {
        let now = Utc::now();
        let mut job = sample_job();
        job.status = JobStatus::Completed;

        assert!(!job.apply_abort(now));
        assert_eq!(job.status, JobStatus::Completed);
    }

    #[test]
    fn status_round_trips_through_str() {
        for status in [
            JobStatus::Pending,
            JobStatus::Processing,
            JobStatus::Aborting,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Skipped,
        ] {
            assert_eq!(JobStatus::parse(status.as_str()), Some(status));
        }
    }

    #[test]
    fn terminal_statuses() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Skipped.is_terminal());
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Processing.is_terminal());
        assert!(!JobStatus::Aborting.is_terminal());
    }

    #[test]
    fn job_serializes_round_trip() {
        let job = sample_job();
        let json = serde_json::to_string(&job).unwrap();
        let back: Job = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, job.id);
        assert_eq!(back.task_type, job.task_type);
        assert_eq!(back.input, job.input);
    }
}
