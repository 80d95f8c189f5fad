//! Per-peer mutual exclusion.
//!
//! Every encrypt or decrypt for one [`PeerAddress`] holds that peer's lock
//! from session lookup until the new ratchet state is persisted. Different
//! peers never contend.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};

use tokio::sync::OwnedMutexGuard;

use crate::address::PeerAddress;

type PeerMutex = Arc<tokio::sync::Mutex<()>>;

/// Registry of async mutexes, one per peer, created on demand.
///
/// Clone shares the registry.
#[derive(Clone, Default)]
pub struct PeerLocks {
    locks: Arc<Mutex<HashMap<PeerAddress, PeerMutex>>>,
}

/// Held for the duration of one ratchet mutation.
#[must_use = "the peer is only locked while the guard is alive"]
pub struct PeerGuard {
    _guard: OwnedMutexGuard<()>,
}

impl PeerLocks {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `peer`.
    ///
    /// Waiters are served in FIFO order (tokio mutex fairness).
    pub async fn acquire(&self, peer: &PeerAddress) -> PeerGuard {
        let mutex = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            // Entries held only by the registry are idle
            locks.retain(|_, mutex| Arc::strong_count(mutex) > 1);
            Arc::clone(locks.entry(peer.clone()).or_default())
        };

        PeerGuard { _guard: mutex.lock_owned().await }
    }

    #[cfg(test)]
    fn active(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|mutex| Arc::strong_count(mutex) > 1)
            .count()
    }
}
