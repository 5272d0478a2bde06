//! Structured error types for the job queue.
//!
//! # The Error Boundary Rule
//!
//! > **No opaque error ever crosses the public API boundary.**
//!
//! - [`JobError`] is what `execute` raises; its variant drives the retry
//!   policy and nothing else does.
//! - [`StoreError`] is what backends raise; it surfaces to the caller of the
//!   triggering operation and never mutates job status on its own.
//! - [`RateLimitExceeded`] is opt-in: only `try_acquire` callers see it. The
//!   scheduling loop sleeps instead.
//! - [`QueueError`] is the queue-level union handed to `wait_for` callers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

// =============================================================================
// Job execution errors
// =============================================================================

/// Classification of a job failure, persisted with the job row.
///
/// The kind decides what the queue does with the outcome; the message is for
/// humans. Unclassified errors are treated as [`JobErrorKind::Permanent`]
/// because they indicate a programming fault, not a transient condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobErrorKind {
    /// Execution observed the cancellation signal.
    Abort,
    /// Transient fault; the job may run again after a delay.
    Retryable,
    /// Non-transient domain failure; the job will not run again.
    Permanent,
}

impl JobErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobErrorKind::Abort => "abort",
            JobErrorKind::Retryable => "retryable",
            JobErrorKind::Permanent => "permanent",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "abort" => Some(JobErrorKind::Abort),
            "retryable" => Some(JobErrorKind::Retryable),
            "permanent" => Some(JobErrorKind::Permanent),
            _ => None,
        }
    }

    /// Whether this kind re-queues the job (budget permitting).
    pub fn should_retry(&self) -> bool {
        matches!(self, JobErrorKind::Retryable)
    }
}

impl std::fmt::Display for JobErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed failures raised by `JobHandler::execute`.
///
/// Handlers are expected to surface [`JobError::Aborted`] promptly when the
/// cancellation signal fires, and may raise [`JobError::Retryable`] with an
/// explicit retry time for transient faults.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
pub enum JobError {
    /// The cancellation signal fired and the handler gave up.
    #[error("job aborted: {message}")]
    Aborted { message: String },

    /// Transient fault; run again no earlier than `retry_at`.
    #[error("{message} (retry at {retry_at})")]
    Retryable {
        message: String,
        retry_at: DateTime<Utc>,
    },

    /// Non-transient failure; do not retry.
    #[error("{message}")]
    Permanent { message: String },
}

impl JobError {
    /// Abort failure with the canonical message.
    pub fn aborted(message: impl Into<String>) -> Self {
        JobError::Aborted {
            message: message.into(),
        }
    }

    /// Transient failure retried no earlier than `retry_at`.
    pub fn retryable(message: impl Into<String>, retry_at: DateTime<Utc>) -> Self {
        JobError::Retryable {
            message: message.into(),
            retry_at,
        }
    }

    /// Permanent failure.
    pub fn permanent(message: impl Into<String>) -> Self {
        JobError::Permanent {
            message: message.into(),
        }
    }

    pub fn kind(&self) -> JobErrorKind {
        match self {
            JobError::Aborted { .. } => JobErrorKind::Abort,
            JobError::Retryable { .. } => JobErrorKind::Retryable,
            JobError::Permanent { .. } => JobErrorKind::Permanent,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            JobError::Aborted { message }
            | JobError::Retryable { message, .. }
            | JobError::Permanent { message } => message,
        }
    }
}

// =============================================================================
// Store errors
// =============================================================================

/// Errors from job persistence backends.
///
/// A `StoreError` surfaces to the caller of the triggering operation. It never
/// causes a silent status transition: the scheduling loop logs it and backs
/// off, and `add`/`abort`/`get` hand it straight back.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The job id is absent from the store.
    #[error("job {0} not found")]
    NotFound(Uuid),

    /// `add` was called with an id that already exists.
    #[error("duplicate job id {0}")]
    Duplicate(Uuid),

    /// A persisted row could not be interpreted.
    #[error("corrupt job record: {0}")]
    Corrupt(String),

    /// JSON (de)serialization of a payload failed.
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// SQL backend failure.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Embedded object-store failure.
    #[error("object store error: {0}")]
    ObjectStore(#[from] sled::Error),
}

// =============================================================================
// Rate limiting
// =============================================================================

/// The limiter rejected a start.
///
/// Only callers that opt in via `try_acquire` observe this; the scheduling
/// loop sleeps until `next_available` instead.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("rate limit exceeded; next start permitted at {next_available}")]
pub struct RateLimitExceeded {
    pub next_available: DateTime<Utc>,
}

// =============================================================================
// Queue errors
// =============================================================================

/// Queue-level failures handed to public-API callers.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The backing store failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The awaited job reached a terminal failure.
    #[error("job {id} failed ({kind}): {message}")]
    JobFailed {
        id: Uuid,
        kind: JobErrorKind,
        message: String,
    },

    /// Opt-in limiter rejection.
    #[error(transparent)]
    RateLimited(#[from] RateLimitExceeded),
}
