//! Redb-backed durable storage implementation.
//!
//! Uses Redb's ACID transactions with Copy-on-Write for crash safety. A
//! [`WriteBatch`] maps to exactly one write transaction, so a crash mid-commit
//! leaves the previous state intact. All state survives restarts.

use std::{fmt::Display, path::Path, sync::Arc};

use redb::{Database, ReadableTable, TableDefinition};

use super::{Storage, StorageError, Table, WriteBatch, WriteOp};

/// Table: identity
/// Key: fixed row name
/// Value: versioned CBOR `IdentityRecord`
const IDENTITY: TableDefinition<&[u8], &[u8]> = TableDefinition::new("identity");

/// Table: signed_prekeys
/// Key: prekey id as big-endian bytes [4 bytes]
/// Value: versioned CBOR `SignedPreKeyRecord`
const SIGNED_PREKEYS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("signed_prekeys");

/// Table: one_time_prekeys
/// Key: prekey id as big-endian bytes [4 bytes]
/// Value: versioned CBOR `OneTimePreKeyRecord`
const ONE_TIME_PREKEYS: TableDefinition<&[u8], &[u8]> =
    TableDefinition::new("one_time_prekeys");

/// Table: sessions
/// Key: `PeerAddress::storage_key`
/// Value: versioned CBOR `SessionRecord`
const SESSIONS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("sessions");

/// Table: trust
/// Key: `PeerAddress::storage_key`
/// Value: versioned CBOR `TrustEntry`
const TRUST: TableDefinition<&[u8], &[u8]> = TableDefinition::new("trust");

/// Table: meta
/// Key: fixed row name
/// Value: versioned CBOR `KeyStoreMeta`
const META: TableDefinition<&[u8], &[u8]> = TableDefinition::new("meta");

/// Table: accepted_handshakes
/// Key: `PeerAddress::storage_key`
/// Value: versioned CBOR `AcceptedHandshakes`
const ACCEPTED_HANDSHAKES: TableDefinition<&[u8], &[u8]> =
    TableDefinition::new("accepted_handshakes");

fn definition(table: Table) -> TableDefinition<'static, &'static [u8], &'static [u8]> {
    match table {
        Table::Identity => IDENTITY,
        Table::SignedPreKeys => SIGNED_PREKEYS,
        Table::OneTimePreKeys => ONE_TIME_PREKEYS,
        Table::Sessions => SESSIONS,
        Table::Trust => TRUST,
        Table::Meta => META,
        Table::AcceptedHandshakes => ACCEPTED_HANDSHAKES,
    }
}

fn io(err: impl Display) -> StorageError {
    StorageError::Io(err.to_string())
}

/// Durable storage backed by Redb.
///
/// Thread-safe through Redb's internal locking. Clone is cheap (Arc). The
/// database file stays locked until every clone is dropped.
#[derive(Clone)]
pub struct RedbStorage {
    db: Arc<Database>,
}

impl RedbStorage {
    /// Open or create a Redb database at the given path.
    ///
    /// Creates all tables if they don't exist.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Io` if the database cannot be opened or created.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let db = Database::create(path.as_ref()).map_err(io)?;

        let txn = db.begin_write().map_err(io)?;
        for table in Table::ALL {
            let _ = txn.open_table(definition(table)).map_err(io)?;
        }
        txn.commit().map_err(io)?;

        Ok(Self { db: Arc::new(db) })
    }
}

impl Storage for RedbStorage {
    fn get(&self, table: Table, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        let txn = self.db.begin_read().map_err(io)?;
        let table = txn.open_table(definition(table)).map_err(io)?;

        let value = table.get(key).map_err(io)?;
        Ok(value.map(|guard| guard.value().to_vec()))
    }

    fn scan(&self, table: Table) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError> {
        let txn = self.db.begin_read().map_err(io)?;
        let table = txn.open_table(definition(table)).map_err(io)?;

        let mut rows = Vec::new();
        for entry in table.iter().map_err(io)? {
            let (key, value) = entry.map_err(io)?;
            rows.push((key.value().to_vec(), value.value().to_vec()));
        }
        Ok(rows)
    }

    fn commit(&self, batch: WriteBatch) -> Result<(), StorageError> {
        let txn = self.db.begin_write().map_err(io)?;

        for op in batch.into_ops() {
            match op {
                WriteOp::Put { table, key, value } => {
                    let mut table = txn.open_table(definition(table)).map_err(io)?;
                    table.insert(key.as_slice(), value.as_slice()).map_err(io)?;
                },
                WriteOp::Delete { table, key } => {
                    let mut table = txn.open_table(definition(table)).map_err(io)?;
                    table.remove(key.as_slice()).map_err(io)?;
                },
            }
        }

        // Dropping an uncommitted transaction aborts it.
        txn.commit().map_err(io)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::tests::{exercise_backend, exercise_scan_order};

    #[test]
    fn redb_backend_contract() {
        let dir = tempfile::tempdir().unwrap();
        exercise_backend(&RedbStorage::open(dir.path().join("pairwise.redb")).unwrap());
    }

    #[test]
    fn redb_scan_is_key_ordered() {
        let dir = tempfile::tempdir().unwrap();
        exercise_scan_order(&RedbStorage::open(dir.path().join("pairwise.redb")).unwrap());
    }

    #[test]
    fn data_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pairwise.redb");

        {
            let storage = RedbStorage::open(&path).unwrap();
            let mut batch = WriteBatch::new();
            batch.put(Table::Sessions, b"bob.1".to_vec(), b"ratchet".to_vec());
            storage.commit(batch).unwrap();
        }

        let storage = RedbStorage::open(&path).unwrap();
        assert_eq!(storage.get(Table::Sessions, b"bob.1").unwrap(), Some(b"ratchet".to_vec()));
    }
}
