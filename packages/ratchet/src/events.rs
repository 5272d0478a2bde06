//! Typed lifecycle events and the per-queue broadcast bus.
//!
//! # Guarantees
//!
//! - **At-most-once delivery**: slow receivers may miss events
//! - **In-memory only**: events are not persisted
//! - **No replay**: lagged receivers get `RecvError::Lagged`
//!
//! Durable state lives in the job store; events exist so higher-level
//! machinery (waiters, dashboards, task graphs) can react without polling.
//! Emission is synchronous with the state transition that caused it, and
//! events for a single job id arrive in causal order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::JobErrorKind;
use crate::job::JobStatus;

/// Default channel capacity for the event bus.
const DEFAULT_CAPACITY: usize = 1024;

/// Job and queue lifecycle events.
///
/// These are facts about transitions that already happened, not commands.
/// Every variant carries the owning queue name; job-scoped variants carry
/// the job id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum JobEvent {
    /// The scheduling loop started.
    QueueStart { queue: String },

    /// The scheduling loop exited and in-flight work drained.
    QueueStop { queue: String },

    /// A job was accepted and persisted as `PENDING`.
    JobAdded {
        queue: String,
        job_id: Uuid,
        task_type: String,
    },

    /// A job was claimed and execution began.
    JobStart {
        queue: String,
        job_id: Uuid,
        task_type: String,
    },

    /// A job reached `COMPLETED`.
    JobComplete {
        queue: String,
        job_id: Uuid,
        status: JobStatus,
        output: Value,
    },

    /// A job reached `FAILED`.
    JobError {
        queue: String,
        job_id: Uuid,
        kind: JobErrorKind,
        message: String,
    },

    /// A job was asked to abort; a terminal event follows.
    JobAborting { queue: String, job_id: Uuid },

    /// A job failed transiently and was re-queued.
    JobRetry {
        queue: String,
        job_id: Uuid,
        retries: i32,
        run_after: DateTime<Utc>,
    },

    /// A job was admitted as `SKIPPED` with a memoized output.
    JobSkipped {
        queue: String,
        job_id: Uuid,
        output: Value,
    },
}

impl JobEvent {
    /// The job this event is about, if any.
    pub fn job_id(&self) -> Option<Uuid> {
        match self {
            JobEvent::QueueStart { .. } | JobEvent::QueueStop { .. } => None,
            JobEvent::JobAdded { job_id, .. }
            | JobEvent::JobStart { job_id, .. }
            | JobEvent::JobComplete { job_id, .. }
            | JobEvent::JobError { job_id, .. }
            | JobEvent::JobAborting { job_id, .. }
            | JobEvent::JobRetry { job_id, .. }
            | JobEvent::JobSkipped { job_id, .. } => Some(*job_id),
        }
    }

    pub fn queue(&self) -> &str {
        match self {
            JobEvent::QueueStart { queue }
            | JobEvent::QueueStop { queue }
            | JobEvent::JobAdded { queue, .. }
            | JobEvent::JobStart { queue, .. }
            | JobEvent::JobComplete { queue, .. }
            | JobEvent::JobError { queue, .. }
            | JobEvent::JobAborting { queue, .. }
            | JobEvent::JobRetry { queue, .. }
            | JobEvent::JobSkipped { queue, .. } => queue,
        }
    }
}

/// Typed event bus for broadcasting lifecycle events.
///
/// A thin wrapper over a tokio broadcast channel: subscription is per-queue,
/// fan-out to multiple subscribers is allowed, and emitting never blocks the
/// scheduling loop.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<JobEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// The capacity bounds how far a slow receiver may lag before it starts
    /// missing events.
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Emit an event to all subscribers (fire-and-forget).
    ///
    /// Returns the number of receivers that got the event.
    pub fn emit(&self, event: JobEvent) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    /// Subscribe to events emitted after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}
