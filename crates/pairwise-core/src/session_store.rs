//! Persistent sessions and trust entries, keyed by [`PeerAddress`].
//!
//! # State Machine
//!
//! ```text
//! NoSession ──(SessionProtocol commit)──► Established
//!     ▲                                        │
//!     └──────────────(remove)──────────────────┘
//! ```
//!
//! `Establishing` only exists inside a `SessionProtocol` call; this store
//! never observes it. Every write is a single [`WriteBatch`], so a saved
//! session is either fully visible or not at all.
//!
//! Every read fails with `StorageUnavailable` when storage cannot be read;
//! the `# Errors` sections below list the other outcomes.

use pairwise_crypto::IdentityKey;
use tracing::{debug, error, info, warn};

use crate::{
    address::PeerAddress,
    error::SessionError,
    records::{self, AcceptedHandshakes, SessionRecord, TrustDecision, TrustEntry},
    storage::{Storage, Table, WriteBatch},
};

/// Sessions and trust decisions for every peer.
#[derive(Clone)]
pub struct SessionStore<S: Storage> {
    storage: S,
}

impl<S: Storage> SessionStore<S> {
    /// Store over a storage backend.
    pub fn new(storage: S) -> Self {
        Self { storage }
    }

    /// Underlying storage.
    pub fn storage(&self) -> &S {
        &self.storage
    }

    /// True if an established session exists. No side effects.
    pub fn has(&self, peer: &PeerAddress) -> Result<bool, SessionError> {
        Ok(self
            .storage
            .get(Table::Sessions, &peer.storage_key())
            .map_err(SessionError::storage)?
            .is_some())
    }

    /// Session for a peer, if any. A corrupt record is `StorageUnavailable`.
    pub fn get(&self, peer: &PeerAddress) -> Result<Option<SessionRecord>, SessionError> {
        self.storage
            .get(Table::Sessions, &peer.storage_key())
            .map_err(SessionError::storage)?
            .map(|bytes| records::decode(&bytes).map_err(SessionError::storage))
            .transpose()
    }

    /// Session for a peer.
    ///
    /// # Errors
    ///
    /// - `NoSession` if none is established
    pub fn load(&self, peer: &PeerAddress) -> Result<SessionRecord, SessionError> {
        self.get(peer)?.ok_or_else(|| SessionError::NoSession { peer: peer.clone() })
    }

    /// Persist a session, replacing any previous one atomically.
    ///
    /// # Errors
    ///
    /// - `PersistFailed` if the write did not complete; the previous state is
    ///   intact and the caller must discard whatever it derived
    pub fn save(&self, peer: &PeerAddress, record: &SessionRecord) -> Result<(), SessionError> {
        let mut batch = WriteBatch::new();
        queue_session(&mut batch, peer, record)?;
        self.commit(peer, batch)
    }

    /// Delete a peer's session. Returns whether one existed.
    ///
    /// The trust entry and the accepted handshakes are kept: identity
    /// changes are still detected and old handshakes still refused.
    ///
    /// # Errors
    ///
    /// - `PersistFailed` if the removal cannot be written
    pub fn remove(&self, peer: &PeerAddress) -> Result<bool, SessionError> {
        if !self.has(peer)? {
            return Ok(false);
        }

        let mut batch = WriteBatch::new();
        batch.delete(Table::Sessions, peer.storage_key());
        self.commit(peer, batch)?;

        info!(peer = %peer, "Removed session");
        Ok(true)
    }

    /// Trust entry for a peer, if any.
    pub fn load_trust(&self, peer: &PeerAddress) -> Result<Option<TrustEntry>, SessionError> {
        self.storage
            .get(Table::Trust, &peer.storage_key())
            .map_err(SessionError::storage)?
            .map(|bytes| records::decode(&bytes).map_err(SessionError::storage))
            .transpose()
    }

    /// Record a trust decision, replacing any previous entry.
    ///
    /// This is the explicit re-verification action. Session establishment
    /// never calls it.
    ///
    /// # Errors
    ///
    /// - `PersistFailed` if the write did not complete
    pub fn record_trust(
        &self,
        peer: &PeerAddress,
        identity_key: IdentityKey,
        decision: TrustDecision,
    ) -> Result<(), SessionError> {
        let mut batch = WriteBatch::new();
        queue_trust(&mut batch, peer, &TrustEntry { identity_key, decision })?;
        self.commit(peer, batch)?;

        info!(peer = %peer, ?decision, fingerprint = %identity_key.fingerprint(), "Recorded trust");
        Ok(())
    }

    /// Handshake base keys already accepted from `peer`.
    pub fn accepted_handshakes(
        &self,
        peer: &PeerAddress,
    ) -> Result<AcceptedHandshakes, SessionError> {
        Ok(self
            .storage
            .get(Table::AcceptedHandshakes, &peer.storage_key())
            .map_err(SessionError::storage)?
            .map(|bytes| records::decode(&bytes).map_err(SessionError::storage))
            .transpose()?
            .unwrap_or_default())
    }

    /// Fail if `identity_key` contradicts the recorded trust entry.
    ///
    /// Returns true if no entry exists yet (first contact).
    ///
    /// # Errors
    ///
    /// - `IdentityKeyChanged` if an entry exists for a different key
    pub(crate) fn check_identity(
        &self,
        peer: &PeerAddress,
        identity_key: &IdentityKey,
    ) -> Result<bool, SessionError> {
        match self.load_trust(peer)? {
            None => Ok(true),
            Some(entry) if entry.identity_key == *identity_key => Ok(false),
            Some(entry) => {
                warn!(
                    peer = %peer,
                    known = %entry.identity_key.fingerprint(),
                    presented = %identity_key.fingerprint(),
                    "Identity key changed"
                );
                Err(SessionError::IdentityKeyChanged { peer: peer.clone() })
            },
        }
    }

    /// Commit a batch built with the queue helpers.
    pub(crate) fn commit(&self, peer: &PeerAddress, batch: WriteBatch) -> Result<(), SessionError> {
        let ops = batch.len();
        self.storage.commit(batch).map_err(|e| {
            error!(peer = %peer, ops, error = %e, "Failed to persist session state");
            SessionError::persist(e)
        })?;
        debug!(peer = %peer, ops, "Committed session state");
        Ok(())
    }
}

/// Queue a session write.
pub(crate) fn queue_session(
    batch: &mut WriteBatch,
    peer: &PeerAddress,
    record: &SessionRecord,
) -> Result<(), SessionError> {
    let bytes = records::encode(record).map_err(SessionError::persist)?;
    batch.put(Table::Sessions, peer.storage_key(), bytes);
    Ok(())
}

/// Queue a trust entry write.
pub(crate) fn queue_trust(
    batch: &mut WriteBatch,
    peer: &PeerAddress,
    entry: &TrustEntry,
) -> Result<(), SessionError> {
    let bytes = records::encode(entry).map_err(SessionError::persist)?;
    batch.put(Table::Trust, peer.storage_key(), bytes);
    Ok(())
}

/// Queue the accepted-handshake list write.
pub(crate) fn queue_accepted_handshakes(
    batch: &mut WriteBatch,
    peer: &PeerAddress,
    accepted: &AcceptedHandshakes,
) -> Result<(), SessionError> {
    let bytes = records::encode(accepted).map_err(SessionError::persist)?;
    batch.put(Table::AcceptedHandshakes, peer.storage_key(), bytes);
    Ok(())
}
