//! Transfer registry - the set of transfers currently on the wire
//!
//! Every mutation happens under one short-lived lock that never spans I/O
//! or an await point, so operations on different transfers do not wait on
//! each other.

use bgdl_types::TransferId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Handle to one active transfer, owned by the registry
#[derive(Debug)]
struct TransferHandle {
    /// Distinguishes this handle from earlier ones for the same id
    generation: u64,
    /// Cancels the transport task
    cancel: CancellationToken,
    /// 0.0 to 1.0
    progress: f64,
    /// Body fully received, finishing up
    terminal: bool,
    started_at: Instant,
}

impl TransferHandle {
    fn snapshot(&self, id: TransferId) -> TransferSnapshot {
        TransferSnapshot {
            id,
            progress: self.progress,
            terminal: self.terminal,
            elapsed: self.started_at.elapsed(),
        }
    }
}

/// Read-only view of an active transfer
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransferSnapshot {
    pub id: TransferId,
    pub progress: f64,
    pub terminal: bool,
    pub elapsed: Duration,
}

/// What the transfer task needs to know about its own registration
#[derive(Debug, Clone)]
pub struct Registration {
    pub generation: u64,
    pub cancel: CancellationToken,
}

#[derive(Debug, Default)]
struct RegistryState {
    handles: HashMap<TransferId, TransferHandle>,
    next_generation: u64,
}

/// Concurrency-safe map of transfer id to active transfer
#[derive(Debug, Default)]
pub struct TransferRegistry {
    state: Mutex<RegistryState>,
}

impl TransferRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new active transfer for `id`.
    ///
    /// A handle already registered for `id` is cancelled and replaced.
    pub fn register(&self, id: TransferId) -> Registration {
        let cancel = CancellationToken::new();
        let (generation, replaced) = {
            let mut state = self.state.lock();
            state.next_generation += 1;
            let generation = state.next_generation;
            let replaced = state.handles.insert(
                id,
                TransferHandle {
                    generation,
                    cancel: cancel.clone(),
                    progress: 0.0,
                    terminal: false,
                    started_at: Instant::now(),
                },
            );
            (generation, replaced)
        };

        if let Some(old) = replaced {
            warn!("Transfer {} was already active, replacing it", id);
            old.cancel.cancel();
        }

        Registration { generation, cancel }
    }

    /// Whether a transfer is active for `id`
    pub fn contains(&self, id: TransferId) -> bool {
        self.state.lock().handles.contains_key(&id)
    }

    pub fn snapshot(&self, id: TransferId) -> Option<TransferSnapshot> {
        self.state.lock().handles.get(&id).map(|h| h.snapshot(id))
    }

    /// Record progress reported by the transfer registered as `generation`
    pub fn set_progress(&self, id: TransferId, generation: u64, fraction: f64) {
        let mut state = self.state.lock();
        if let Some(handle) = state.handles.get_mut(&id) {
            if handle.generation == generation {
                handle.progress = fraction.clamp(0.0, 1.0);
                handle.terminal = handle.progress >= 1.0;
            }
        }
    }

    /// Remove the transfer for `id` and cancel it.
    ///
    /// Returns the last state of the removed transfer, `None` if nothing
    /// was active.
    pub fn cancel_and_remove(&self, id: TransferId) -> Option<TransferSnapshot> {
        let removed = self.state.lock().handles.remove(&id)?;
        removed.cancel.cancel();
        Some(removed.snapshot(id))
    }

    /// Drop the registration of a transfer that reached its end.
    ///
    /// Only the handle with the matching generation is removed, so a
    /// late-finishing task cannot evict the transfer that replaced it.
    pub fn finish(&self, id: TransferId, generation: u64) -> Option<TransferSnapshot> {
        let mut state = self.state.lock();
        match state.handles.get(&id) {
            Some(handle) if handle.generation == generation => {
                state.handles.remove(&id).map(|h| h.snapshot(id))
            }
            _ => None,
        }
    }

    /// Ids of all active transfers
    pub fn ids(&self) -> Vec<TransferId> {
        self.state.lock().handles.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.state.lock().handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_cancel_and_remove() {
        let registry = TransferRegistry::new();
        let reg = registry.register(1);

        assert!(registry.contains(1));
        registry.set_progress(1, reg.generation, 0.4);
        let removed = registry.cancel_and_remove(1).unwrap();
        assert_eq!(removed.progress, 0.4);
        assert!(!removed.terminal);
        assert!(reg.cancel.is_cancelled());
        assert!(!registry.contains(1));
        assert!(registry.cancel_and_remove(1).is_none());
    }

    #[test]
    fn test_replacement_cancels_previous() {
        let registry = TransferRegistry::new();
        let first = registry.register(5);
        let second = registry.register(5);

        assert!(first.cancel.is_cancelled());
        assert!(!second.cancel.is_cancelled());
        assert_eq!(registry.len(), 1);

        // the stale task finishing must not remove the new handle
        assert!(registry.finish(5, first.generation).is_none());
        assert!(registry.contains(5));
        assert_eq!(registry.finish(5, second.generation).map(|s| s.id), Some(5));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_progress_tracks_generation() {
        let registry = TransferRegistry::new();
        let first = registry.register(2);
        let second = registry.register(2);

        registry.set_progress(2, first.generation, 0.9);
        assert_eq!(registry.snapshot(2).unwrap().progress, 0.0);

        registry.set_progress(2, second.generation, 0.25);
        let snap = registry.snapshot(2).unwrap();
        assert_eq!(snap.progress, 0.25);
        assert!(!snap.terminal);

        registry.set_progress(2, second.generation, 1.0);
        assert!(registry.snapshot(2).unwrap().terminal);
    }

    #[test]
    fn test_concurrent_registrations() {
        let registry = Arc::new(TransferRegistry::new());
        let threads: Vec<_> = (0..8u64)
            .map(|t| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    for i in 0..100 {
                        let id = t * 1000 + i;
                        let reg = registry.register(id);
                        if i % 2 == 0 {
                            registry.finish(id, reg.generation);
                        }
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(registry.len(), 8 * 50);
    }
}
