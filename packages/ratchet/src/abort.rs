//! Process-local registry of cancellation handles for in-flight jobs.
//!
//! The registry is strictly in-memory: aborting a job owned by another
//! process requires re-issuing `abort` against that process. A job in
//! `PROCESSING` holds exactly one live handle here for the duration of its
//! execution.

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Map from job id to its cooperative cancellation handle.
#[derive(Debug, Default)]
pub struct AbortRegistry {
    handles: DashMap<Uuid, CancellationToken>,
}

impl AbortRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a handle for `id`, derived from `parent` so that cancelling
    /// the parent (queue shutdown) reaches every registered job.
    ///
    /// Returns the signal to hand to the executing job.
    pub fn register(&self, id: Uuid, parent: &CancellationToken) -> CancellationToken {
        let token = parent.child_token();
        self.handles.insert(id, token.clone());
        token
    }

    /// Fire the handle for `id` if present. Returns whether a handle fired.
    pub fn cancel(&self, id: Uuid) -> bool {
        match self.handles.get(&id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Drop the handle for `id` without firing it.
    pub fn remove(&self, id: Uuid) {
        self.handles.remove(&id);
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.handles.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_cancel_fires_token() {
        let registry = AbortRegistry::new();
        let parent = CancellationToken::new();
        let id = Uuid::new_v4();

        let signal = registry.register(id, &parent);
        assert!(registry.contains(id));
        assert!(!signal.is_cancelled());

        assert!(registry.cancel(id));
        assert!(signal.is_cancelled());
    }

    #[test]
    fn cancel_unknown_id_is_a_noop() {
        let registry = AbortRegistry::new();
        assert!(!registry.cancel(Uuid::new_v4()));
    }

    #[test]
    fn remove_drops_without_firing() {
        let registry = AbortRegistry::new();
        let parent = CancellationToken::new();
        let id = Uuid::new_v4();

        let signal = registry.register(id, &parent);
        registry.remove(id);

        assert!(!registry.contains(id));
        assert!(!signal.is_cancelled());
        assert!(!registry.cancel(id));
    }

    #[test]
    fn parent_cancellation_reaches_children() {
        let registry = AbortRegistry::new();
        let parent = CancellationToken::new();
        let a = registry.register(Uuid::new_v4(), &parent);
        let b = registry.register(Uuid::new_v4(), &parent);

        parent.cancel();
        assert!(a.is_cancelled());
        assert!(b.is_cancelled());
    }

    #[test]
    fn len_tracks_registrations() {
        let registry = AbortRegistry::new();
        let parent = CancellationToken::new();
        assert!(registry.is_empty());

        let id = Uuid::new_v4();
        registry.register(id, &parent);
        assert_eq!(registry.len(), 1);

        registry.remove(id);
        assert!(registry.is_empty());
    }
}
