//! Storage abstraction for key and session records
//!
//! The trait is synchronous (no async) so the ratchet critical section never
//! yields. Records are opaque bytes here; [`crate::records`] owns their
//! encoding.
//!
//! Writes go through [`WriteBatch`]: every operation in a batch is applied
//! atomically or not at all.

mod chaotic;
mod memory;
mod redb;

pub use chaotic::ChaoticStorage;
pub use memory::MemoryStorage;

pub use self::redb::RedbStorage;
pub use crate::error::StorageError;

/// Logical tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Table {
    /// Local identity key pair (single row)
    Identity,
    /// Local signed prekeys by id
    SignedPreKeys,
    /// Local unconsumed one-time prekeys by id
    OneTimePreKeys,
    /// Ratchet sessions by peer address
    Sessions,
    /// Trust entries by peer address
    Trust,
    /// Key store bookkeeping (next prekey id)
    Meta,
    /// Handshake base keys already accepted, by peer address
    AcceptedHandshakes,
}

impl Table {
    /// Every table, for backends that create them up front.
    pub const ALL: [Self; 7] = [
        Self::Identity,
        Self::SignedPreKeys,
        Self::OneTimePreKeys,
        Self::Sessions,
        Self::Trust,
        Self::Meta,
        Self::AcceptedHandshakes,
    ];
}

/// One write inside a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    /// Insert or replace a value
    Put {
        /// Target table
        table: Table,
        /// Row key
        key: Vec<u8>,
        /// Encoded record
        value: Vec<u8>,
    },
    /// Remove a value (no-op if absent)
    Delete {
        /// Target table
        table: Table,
        /// Row key
        key: Vec<u8>,
    },
}

/// Ordered set of writes committed atomically.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    /// Empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an insert or replace.
    pub fn put(&mut self, table: Table, key: Vec<u8>, value: Vec<u8>) -> &mut Self {
        self.ops.push(WriteOp::Put { table, key, value });
        self
    }

    /// Queue a removal.
    pub fn delete(&mut self, table: Table, key: Vec<u8>) -> &mut Self {
        self.ops.push(WriteOp::Delete { table, key });
        self
    }

    /// Queued operations in order.
    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }

    /// True if at least one operation targets `table`.
    pub fn touches(&self, table: Table) -> bool {
        self.ops.iter().any(|op| match op {
            WriteOp::Put { table: t, .. } | WriteOp::Delete { table: t, .. } => *t == table,
        })
    }

    /// Number of queued operations.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// True if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    fn into_ops(self) -> Vec<WriteOp> {
        self.ops
    }
}

/// Storage backend for key and session records.
///
/// Must be Clone (shared by the key store and session store), Send + Sync
/// (thread-safe), and synchronous. Implementations share internal state via
/// Arc, so clones access the same underlying storage.
pub trait Storage: Clone + Send + Sync + 'static {
    /// Point read. `None` if the row does not exist.
    fn get(&self, table: Table, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError>;

    /// All rows of a table in key order.
    fn scan(&self, table: Table) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError>;

    /// Apply every operation in `batch` atomically.
    ///
    /// # Invariants
    ///
    /// - Post (Ok): all operations are visible to subsequent reads
    /// - Post (Err): none of them are
    fn commit(&self, batch: WriteBatch) -> Result<(), StorageError>;
}
