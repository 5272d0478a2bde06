//! Process-wide registry of named queues.
//!
//! Explicit state constructed at program start with documented teardown, not
//! an implicit global: build one, register queues as they are wired up, and
//! call [`QueueRegistry::stop_queues`] on shutdown. Teardown runs in
//! reverse-registration order and returns only after every queue's `stop()`
//! completes.

use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::warn;

use crate::queue::JobQueue;

/// Mapping from logical queue name (e.g. `"local_hf"`) to its queue.
#[derive(Debug, Default)]
pub struct QueueRegistry {
    // Insertion order drives start order and (reversed) stop order.
    queues: RwLock<Vec<Arc<JobQueue>>>,
}

impl QueueRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<Arc<JobQueue>>> {
        self.queues.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<Arc<JobQueue>>> {
        self.queues.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a queue under its own name. Re-registering a name replaces
    /// the previous queue (which keeps running until stopped).
    pub fn register_queue(&self, queue: Arc<JobQueue>) {
        let mut queues = self.write();
        if let Some(existing) = queues.iter_mut().find(|q| q.name() == queue.name()) {
            warn!(queue = %queue.name(), "replacing registered queue");
            *existing = queue;
        } else {
            queues.push(queue);
        }
    }

    pub fn get_queue(&self, name: &str) -> Option<Arc<JobQueue>> {
        self.read().iter().find(|q| q.name() == name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.read().iter().map(|q| q.name().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Start every registered queue, in registration order.
    pub async fn start_queues(&self) {
        let queues: Vec<_> = self.read().clone();
        for queue in queues {
            queue.start().await;
        }
    }

    /// Stop every registered queue, in reverse-registration order. Returns
    /// only after each queue's `stop()` completes.
    pub async fn stop_queues(&self) {
        let queues: Vec<_> = self.read().clone();
        for queue in queues.into_iter().rev() {
            queue.stop().await;
        }
    }
}
