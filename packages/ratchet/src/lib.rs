//! # Ratchet
//!
//! A durable, rate-limited, cancellable job queue over pluggable storage
//! backends.
//!
//! ## Core Concepts
//!
//! A [`Job`] is a durable unit of work: a typed input, a fingerprint of that
//! input for memoized lookup, and a lifecycle with retries, backoff, failure,
//! and external abort. A [`JobQueue`] pairs a [`JobStore`] backend with a
//! [`RateLimiter`] and runs one cooperative scheduling loop. A
//! [`QueueRegistry`] holds the process's named queues and tears them down in
//! reverse order.
//!
//! ## Architecture
//!
//! ```text
//! producer ──► JobQueue.add() ──► JobStore (PENDING)
//!
//! scheduling loop (one per queue)
//!     │
//!     ├─► RateLimiter.can_proceed()        sleep until next_available_time
//!     ├─► JobStore.next()                  atomic claim → PROCESSING
//!     ├─► AbortRegistry.register()         cancellation handle per job
//!     ├─► spawn JobHandler.execute(signal)
//!     └─► classify outcome ─► JobStore.complete() ─► EventBus
//!
//! abort(id) ──► JobStore (ABORTING) + fire in-process handle
//! ```
//!
//! ## Key Invariants
//!
//! 1. **The store is the truth** — every state transition goes through it
//! 2. **Claims are atomic** — concurrent `next()` never double-claims
//! 3. **Errors are typed** — the [`JobError`] variant alone drives retries
//! 4. **Cancellation is cooperative** — jobs must observe their signal; the
//!    runtime cannot preempt them
//! 5. **Fingerprints are canonical** — equal inputs hash equally across
//!    processes
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use ratchet::{
//!     ConcurrencyLimiter, InMemoryJobStore, Job, JobError, JobHandler, JobQueue,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! struct Summarize;
//!
//! #[async_trait::async_trait]
//! impl JobHandler for Summarize {
//!     async fn execute(
//!         &self,
//!         job: &Job,
//!         signal: CancellationToken,
//!     ) -> Result<serde_json::Value, JobError> {
//!         let text = job.input["text"].as_str().unwrap_or_default();
//!         tokio::select! {
//!             _ = signal.cancelled() => Err(JobError::aborted("cancelled")),
//!             summary = run_model(text) => Ok(serde_json::json!({ "summary": summary? })),
//!         }
//!     }
//! }
//!
//! let queue = Arc::new(JobQueue::new(
//!     "local_hf",
//!     Arc::new(InMemoryJobStore::new("local_hf")),
//!     Arc::new(ConcurrencyLimiter::new(4)),
//!     Arc::new(Summarize),
//! ));
//!
//! queue.start().await;
//! let id = queue.add(Job::new("summarize", serde_json::json!({"text": "..."}))).await?;
//! let output = queue.wait_for(id).await?;
//! queue.stop().await;
//! ```
//!
//! ## What This Is Not
//!
//! Ratchet does **not** coordinate across hosts (a queue's jobs are owned by
//! one process), does not promise exactly-once execution across restarts
//! beyond what the backing store provides, and does not prioritize beyond
//! FIFO by `run_after`.

mod abort;
mod error;
mod events;
mod fingerprint;
mod job;
mod limiter;
mod queue;
mod registry;
pub mod store;

// Scenario tests (test-only)
#[cfg(test)]
mod scenario_tests;

// Re-export the job model and execution contract
pub use crate::job::{Job, JobHandler, JobOutcome, JobStatus};

// Re-export error types
pub use crate::error::{JobError, JobErrorKind, QueueError, RateLimitExceeded, StoreError};

// Re-export fingerprinting
pub use crate::fingerprint::{canonical, fingerprint};

// Re-export rate limiting
pub use crate::limiter::{ConcurrencyLimiter, RateLimiter, StoredRateLimiter};

// Re-export the abort registry
pub use crate::abort::AbortRegistry;

// Re-export event types
pub use crate::events::{EventBus, JobEvent};

// Re-export the orchestrator
pub use crate::queue::{JobQueue, QueueOptions};

// Re-export the registry
pub use crate::registry::QueueRegistry;

// Re-export store traits and backends
pub use crate::store::local::LocalJobStore;
pub use crate::store::memory::InMemoryJobStore;
pub use crate::store::postgres::PostgresJobStore;
pub use crate::store::sqlite::SqliteJobStore;
pub use crate::store::{JobStore, RateLedger};

// Re-export commonly used external types
pub use async_trait::async_trait;
pub use tokio_util::sync::CancellationToken;
