//! Chaotic storage wrapper for fault injection testing
//!
//! Randomly fails reads and commits to exercise the error mapping and the
//! crash-consistency rules: a failed commit must leave no trace, and a failed
//! read must not advance anything.

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicUsize, Ordering},
};

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use super::{Storage, StorageError, Table, WriteBatch};

/// Default seed for reproducible chaos.
const DEFAULT_SEED: u64 = 0x1234_5678_9ABC_DEF0;

/// Storage wrapper that randomly injects failures
///
/// Delegates to an underlying storage implementation but fails each operation
/// with probability `failure_rate`. A failed commit is rejected before it
/// reaches the inner storage, which is how a torn write looks to an atomic
/// backend.
#[derive(Clone)]
pub struct ChaoticStorage<S: Storage> {
    inner: S,
    failure_rate: f64,
    rng: Arc<Mutex<ChaCha8Rng>>,
    operations: Arc<AtomicUsize>,
    injected: Arc<AtomicUsize>,
}

impl<S: Storage> ChaoticStorage<S> {
    /// Wrap `inner`. Rates outside `[0.0, 1.0]` are clamped.
    pub fn new(inner: S, failure_rate: f64) -> Self {
        Self::with_seed(inner, failure_rate, DEFAULT_SEED)
    }

    /// Create with explicit seed for reproducible chaos
    pub fn with_seed(inner: S, failure_rate: f64, seed: u64) -> Self {
        Self {
            inner,
            failure_rate: failure_rate.clamp(0.0, 1.0),
            rng: Arc::new(Mutex::new(ChaCha8Rng::seed_from_u64(seed))),
            operations: Arc::new(AtomicUsize::new(0)),
            injected: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Underlying storage (for checking invariants after chaos).
    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Total number of storage operations attempted.
    pub fn operation_count(&self) -> usize {
        self.operations.load(Ordering::Relaxed)
    }

    /// Number of operations that were failed on purpose.
    pub fn injected_failures(&self) -> usize {
        self.injected.load(Ordering::Relaxed)
    }

    fn maybe_fail(&self, operation: &str) -> Result<(), StorageError> {
        self.operations.fetch_add(1, Ordering::Relaxed);

        let fail = match self.rng.lock() {
            Ok(mut rng) => rng.gen_bool(self.failure_rate),
            Err(_) => true,
        };
        if fail {
            self.injected.fetch_add(1, Ordering::Relaxed);
            return Err(StorageError::Io(format!("chaotic failure injection: {operation}")));
        }
        Ok(())
    }
}

impl<S: Storage> Storage for ChaoticStorage<S> {
    fn get(&self, table: Table, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        self.maybe_fail("get")?;
        self.inner.get(table, key)
    }

    fn scan(&self, table: Table) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError> {
        self.maybe_fail("scan")?;
        self.inner.scan(table)
    }

    fn commit(&self, batch: WriteBatch) -> Result<(), StorageError> {
        self.maybe_fail("commit")?;
        self.inner.commit(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    fn one_put() -> WriteBatch {
        let mut batch = WriteBatch::new();
        batch.put(Table::Meta, b"k".to_vec(), b"v".to_vec());
        batch
    }

    #[test]
    fn zero_rate_never_fails() {
        let storage = ChaoticStorage::new(MemoryStorage::new(), 0.0);

        for _ in 0..100 {
            storage.commit(one_put()).unwrap();
            storage.get(Table::Meta, b"k").unwrap();
        }
        assert_eq!(storage.injected_failures(), 0);
        assert_eq!(storage.operation_count(), 200);
    }

    #[test]
    fn full_rate_always_fails_and_writes_nothing() {
        let storage = ChaoticStorage::new(MemoryStorage::new(), 1.0);

        assert!(storage.commit(one_put()).is_err());
        assert_eq!(storage.inner().get(Table::Meta, b"k").unwrap(), None);
    }

    #[test]
    fn same_seed_same_failures() {
        let pattern = |seed| {
            let storage = ChaoticStorage::with_seed(MemoryStorage::new(), 0.5, seed);
            (0..50).map(|_| storage.get(Table::Meta, b"k").is_err()).collect::<Vec<_>>()
        };

        assert_eq!(pattern(9), pattern(9));
        assert!(pattern(9).iter().any(|failed| *failed));
        assert!(pattern(9).iter().any(|failed| !*failed));
    }
}
