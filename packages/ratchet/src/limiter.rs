//! Rate limiting for job starts.
//!
//! A limiter answers one question for the scheduling loop: may the next job
//! start now, and if not, when should we look again. Two variants ship:
//!
//! - [`ConcurrencyLimiter`] — in-memory token bucket of `max_concurrent`
//!   slots, optionally combined with a sliding window of N starts per W.
//! - [`StoredRateLimiter`] — sliding window whose start times live in the
//!   store's backing medium (a [`RateLedger`]), so the rate envelope
//!   survives a process restart.
//!
//! The loop never observes [`RateLimitExceeded`]; it sleeps until
//! `next_available_time()`. Callers that want a hard rejection opt in via
//! [`RateLimiter::try_acquire`].

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use crate::error::{QueueError, RateLimitExceeded, StoreError};
use crate::store::RateLedger;

/// Capability set consulted by the scheduling loop before each claim.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Whether a job may start right now.
    async fn can_proceed(&self) -> Result<bool, StoreError>;

    /// Earliest instant at which a start may be permitted.
    ///
    /// This is a lower bound, not a promise; callers re-check `can_proceed`
    /// after sleeping.
    async fn next_available_time(&self) -> Result<DateTime<Utc>, StoreError>;

    /// Record that a job started.
    async fn record_job_start(&self) -> Result<(), StoreError>;

    /// Record that a job finished (successfully or not).
    async fn record_job_completion(&self) -> Result<(), StoreError>;

    /// Forget all accounting.
    async fn clear(&self) -> Result<(), StoreError>;

    /// Opt-in hard acquisition: records a start or fails with
    /// [`RateLimitExceeded`].
    async fn try_acquire(&self) -> Result<(), QueueError> {
        if self.can_proceed().await? {
            self.record_job_start().await?;
            Ok(())
        } else {
            Err(QueueError::RateLimited(RateLimitExceeded {
                next_available: self.next_available_time().await?,
            }))
        }
    }
}

// =============================================================================
// ConcurrencyLimiter
// =============================================================================

#[derive(Debug, Clone, Copy)]
struct SlidingWindow {
    max_starts: usize,
    per: Duration,
}

#[derive(Debug, Default)]
struct ConcurrencyState {
    in_flight: usize,
    starts: VecDeque<DateTime<Utc>>,
}

/// Token bucket of `max_concurrent` execution slots, decremented on start and
/// restored on completion, with an optional sliding-window cap on starts.
#[derive(Debug)]
pub struct ConcurrencyLimiter {
    max_concurrent: usize,
    window: Option<SlidingWindow>,
    state: Mutex<ConcurrencyState>,
}

impl ConcurrencyLimiter {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            max_concurrent,
            window: None,
            state: Mutex::new(ConcurrencyState::default()),
        }
    }

    /// Additionally cap starts to `max_starts` per `per`.
    pub fn with_window(mut self, max_starts: usize, per: std::time::Duration) -> Self {
        self.window = Some(SlidingWindow {
            max_starts,
            per: Duration::milliseconds(per.as_millis() as i64),
        });
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ConcurrencyState> {
        // A poisoned lock means a panic mid-bookkeeping; the counters are
        // still usable, so keep going rather than wedging the loop.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn prune(window: &SlidingWindow, starts: &mut VecDeque<DateTime<Utc>>, now: DateTime<Utc>) {
        let horizon = now - window.per;
        while starts.front().is_some_and(|t| *t <= horizon) {
            starts.pop_front();
        }
    }
}

#[async_trait]
impl RateLimiter for ConcurrencyLimiter {
    async fn can_proceed(&self) -> Result<bool, StoreError> {
        let now = Utc::now();
        let mut state = self.lock();
        if state.in_flight >= self.max_concurrent {
            return Ok(false);
        }
        if let Some(window) = self.window {
            Self::prune(&window, &mut state.starts, now);
            if state.starts.len() >= window.max_starts {
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn next_available_time(&self) -> Result<DateTime<Utc>, StoreError> {
        let now = Utc::now();
        let mut state = self.lock();
        if let Some(window) = self.window {
            Self::prune(&window, &mut state.starts, now);
            if state.starts.len() >= window.max_starts {
                // The slot frees when the (len - max + 1)-th oldest start
                // leaves the window.
                let idx = state.starts.len() - window.max_starts;
                if let Some(start) = state.starts.get(idx) {
                    return Ok(*start + window.per);
                }
            }
        }
        // Concurrency slots free on completion at an unknowable time; the
        // loop re-polls at its wait granularity.
        Ok(now)
    }

    async fn record_job_start(&self) -> Result<(), StoreError> {
        let now = Utc::now();
        let mut state = self.lock();
        state.in_flight += 1;
        if self.window.is_some() {
            state.starts.push_back(now);
        }
        Ok(())
    }

    async fn record_job_completion(&self) -> Result<(), StoreError> {
        let mut state = self.lock();
        state.in_flight = state.in_flight.saturating_sub(1);
        Ok(())
    }

    async fn clear(&self) -> Result<(), StoreError> {
        let mut state = self.lock();
        state.in_flight = 0;
        state.starts.clear();
        Ok(())
    }
}

// =============================================================================
// StoredRateLimiter
// =============================================================================

/// Sliding-window limiter whose start times are persisted through a
/// [`RateLedger`], so a restarted process still honors the envelope.
pub struct StoredRateLimiter {
    ledger: Arc<dyn RateLedger>,
    queue: String,
    max_starts: usize,
    window: Duration,
}

impl StoredRateLimiter {
    pub fn new(
        ledger: Arc<dyn RateLedger>,
        queue: impl Into<String>,
        max_starts: usize,
        window: std::time::Duration,
    ) -> Self {
        Self {
            ledger,
            queue: queue.into(),
            max_starts,
            window: Duration::milliseconds(window.as_millis() as i64),
        }
    }
}

#[async_trait]
impl RateLimiter for StoredRateLimiter {
    async fn can_proceed(&self) -> Result<bool, StoreError> {
        let since = Utc::now() - self.window;
        let starts = self.ledger.starts_since(&self.queue, since).await?;
        Ok(starts.len() < self.max_starts)
    }

    async fn next_available_time(&self) -> Result<DateTime<Utc>, StoreError> {
        let now = Utc::now();
        let starts = self.ledger.starts_since(&self.queue, now - self.window).await?;
        if starts.len() >= self.max_starts {
            let idx = starts.len() - self.max_starts;
            return Ok(starts[idx] + self.window);
        }
        Ok(now)
    }

    async fn record_job_start(&self) -> Result<(), StoreError> {
        let now = Utc::now();
        self.ledger.record_start(&self.queue, now).await?;
        self.ledger.prune_starts(&self.queue, now - self.window).await
    }

    async fn record_job_completion(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn clear(&self) -> Result<(), StoreError> {
        self.ledger.clear_starts(&self.queue).await
    }
}
