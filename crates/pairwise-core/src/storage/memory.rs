use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex},
};

use super::{Storage, StorageError, Table, WriteBatch, WriteOp};

type Rows = BTreeMap<Vec<u8>, Vec<u8>>;

/// In-memory storage implementation for testing and simulation
///
/// One ordered map per table behind a single `Arc<Mutex<>>`, so clones share
/// state and a batch is applied under one lock acquisition. A poisoned lock
/// surfaces as `StorageError::Io`.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    inner: Arc<Mutex<HashMap<Table, Rows>>>,
}

impl MemoryStorage {
    /// Create a new empty `MemoryStorage`
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of rows in a table.
    ///
    /// Useful for debugging and testing.
    pub fn row_count(&self, table: Table) -> Result<usize, StorageError> {
        let inner = self.lock()?;
        Ok(inner.get(&table).map_or(0, BTreeMap::len))
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<Table, Rows>>, StorageError> {
        self.inner.lock().map_err(|_| StorageError::Io("memory storage lock poisoned".to_string()))
    }
}

impl Storage for MemoryStorage {
    fn get(&self, table: Table, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        let inner = self.lock()?;
        Ok(inner.get(&table).and_then(|rows| rows.get(key)).cloned())
    }

    fn scan(&self, table: Table) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError> {
        let inner = self.lock()?;
        Ok(inner
            .get(&table)
            .map(|rows| rows.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    fn commit(&self, batch: WriteBatch) -> Result<(), StorageError> {
        let mut inner = self.lock()?;

        for op in batch.into_ops() {
            match op {
                WriteOp::Put { table, key, value } => {
                    inner.entry(table).or_default().insert(key, value);
                },
                WriteOp::Delete { table, key } => {
                    if let Some(rows) = inner.get_mut(&table) {
                        rows.remove(&key);
                    }
                },
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::tests::{exercise_backend, exercise_scan_order};

    #[test]
    fn memory_backend_contract() {
        exercise_backend(&MemoryStorage::new());
    }

    #[test]
    fn memory_scan_is_key_ordered() {
        exercise_scan_order(&MemoryStorage::new());
    }

    #[test]
    fn clones_share_state() {
        let storage = MemoryStorage::new();
        let clone = storage.clone();

        let mut batch = WriteBatch::new();
        batch.put(Table::Meta, b"k".to_vec(), b"v".to_vec());
        storage.commit(batch).unwrap();

        assert_eq!(clone.get(Table::Meta, b"k").unwrap(), Some(b"v".to_vec()));
        assert_eq!(clone.row_count(Table::Meta).unwrap(), 1);
    }
}
