//! Session establishment.
//!
//! # Initiator
//!
//! ```text
//! has(peer)? ──yes──► Existing
//!     │ no
//!     ▼
//! fetch bundle ──► verify signature ──► check trust ──► claim one-time prekey
//!     │                                                        │
//!     ▼                                                        ▼
//! NoKeyBundle      InvalidSignature   IdentityKeyChanged   lost race: proceed
//!                                                          without it (or
//!                                                          NoKeyBundle if
//!                                                          Required)
//!     ──► derive ratchet ──► commit session + first-contact trust ──► Created
//! ```
//!
//! The one-time prekey is claimed on the directory before anything is derived,
//! so two initiators racing on the same bundle never both use the same id.
//! The claim is the only directory write; everything after it is local.
//!
//! # Responder
//!
//! Driven by the first `HandshakeMessage` envelope from a peer. Derivation,
//! decryption of the embedded message, the trust entry, the accepted base
//! key and removal of the consumed local one-time prekey land in one atomic
//! batch. A base key accepted before is refused, so a handshake can never
//! be replayed over a newer session. The one-time prekey pool stays locked
//! from lookup to commit.

use std::sync::Arc;

use pairwise_crypto::{KeyPair, RatchetState, agreement};
use tracing::{debug, info, warn};

use crate::{
    address::PeerAddress,
    bundle::{KeyBundle, OneTimePreKeyPublic},
    config::{OneTimePreKeyPolicy, SessionConfig},
    directory::{self, KeyDirectory},
    envelope::HandshakeMessage,
    env::Environment,
    error::SessionError,
    key_store::KeyStore,
    records::{PendingHandshake, SessionRecord, SessionRole, TrustDecision, TrustEntry},
    retry,
    session_store::{self, SessionStore},
    storage::{Storage, WriteBatch},
};

/// Outcome of [`SessionProtocol::ensure_session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Establishment {
    /// A session already existed; nothing was fetched or written.
    Existing,
    /// A new initiator session was committed.
    Created {
        /// The claimed one-time prekey, `None` for a signed-prekey-only
        /// handshake
        one_time_prekey_id: Option<u32>,
    },
}

/// Handshake algorithm over the key store, session store and directory.
pub struct SessionProtocol<S: Storage, E: Environment, D: KeyDirectory + ?Sized> {
    key_store: Arc<KeyStore<S, E>>,
    sessions: SessionStore<S>,
    directory: Arc<D>,
    env: E,
}

impl<S: Storage, E: Environment, D: KeyDirectory + ?Sized> SessionProtocol<S, E, D> {
    /// Protocol sharing `storage` with the key store.
    pub fn new(key_store: Arc<KeyStore<S, E>>, storage: S, directory: Arc<D>, env: E) -> Self {
        Self { key_store, sessions: SessionStore::new(storage), directory, env }
    }

    /// Local key material.
    pub fn key_store(&self) -> &KeyStore<S, E> {
        &self.key_store
    }

    /// Session and trust records.
    pub fn sessions(&self) -> &SessionStore<S> {
        &self.sessions
    }

    /// Key-bundle directory.
    pub fn directory(&self) -> &D {
        &self.directory
    }

    pub(crate) fn env(&self) -> &E {
        &self.env
    }

    fn config(&self) -> &SessionConfig {
        self.key_store.config()
    }

    /// Replenish the local one-time prekey pool if it runs low, then publish
    /// the local bundle under `local`.
    ///
    /// # Errors
    ///
    /// - `StorageUnavailable` / `PersistFailed` from replenishment
    /// - `DirectoryUnavailable` if publication keeps failing
    pub async fn publish(&self, local: &PeerAddress) -> Result<(), SessionError> {
        let added = self.key_store.replenish_if_needed()?;
        if !added.is_empty() {
            debug!(count = added.len(), "Replenished one-time prekeys before publishing");
        }

        directory::publish_bundle(
            &self.key_store,
            self.directory.as_ref(),
            &self.env,
            &self.config().retry,
            local,
        )
        .await
    }

    /// Make sure an established session with `peer` exists, running the
    /// initiator handshake if not.
    ///
    /// Calling this twice performs one fetch and one commit; the second call
    /// returns [`Establishment::Existing`].
    ///
    /// # Errors
    ///
    /// - `NoKeyBundle` if the peer never published, or no one-time prekey
    ///   could be claimed under [`OneTimePreKeyPolicy::Required`]
    /// - `InvalidSignature` if the signed prekey does not verify
    /// - `IdentityKeyChanged` if the bundle's identity contradicts trust
    /// - `DirectoryUnavailable` if the directory keeps failing
    /// - `StorageUnavailable` / `PersistFailed` from storage
    pub async fn ensure_session(&self, peer: &PeerAddress) -> Result<Establishment, SessionError> {
        if self.sessions.has(peer)? {
            return Ok(Establishment::Existing);
        }

        let retry_policy = &self.config().retry;
        let bundle = retry::with_backoff(&self.env, retry_policy, "fetch", || {
            self.directory.fetch(peer)
        })
        .await?
        .ok_or_else(|| {
            debug!(peer = %peer, "Peer has not published a key bundle");
            SessionError::NoKeyBundle { peer: peer.clone() }
        })?;

        if bundle.verify().is_err() {
            warn!(
                peer = %peer,
                signed_prekey_id = bundle.signed_prekey.id,
                "Rejected bundle with invalid signed prekey signature"
            );
            return Err(SessionError::InvalidSignature { peer: peer.clone() });
        }
        let first_contact = self.sessions.check_identity(peer, &bundle.identity_key)?;

        let one_time_prekey = self.claim_one_time_prekey(peer, &bundle).await?;
        let one_time_prekey_id = one_time_prekey.map(|prekey| prekey.id);

        let record = self.derive_initiator(&bundle, one_time_prekey.as_ref())?;

        let mut batch = WriteBatch::new();
        session_store::queue_session(&mut batch, peer, &record)?;
        if first_contact {
            queue_first_contact(&mut batch, peer, &record)?;
        }
        self.sessions.commit(peer, batch)?;

        info!(
            peer = %peer,
            first_contact,
            one_time_prekey_id,
            "Established session as initiator"
        );
        Ok(Establishment::Created { one_time_prekey_id })
    }

    async fn claim_one_time_prekey(
        &self,
        peer: &PeerAddress,
        bundle: &KeyBundle,
    ) -> Result<Option<OneTimePreKeyPublic>, SessionError> {
        let Some(offered) = bundle.one_time_prekey else {
            return self.without_one_time_prekey(peer, "bundle offers no one-time prekey");
        };

        let claimed = retry::with_backoff(&self.env, &self.config().retry, "mark_consumed", || {
            self.directory.mark_consumed(peer, offered.id)
        })
        .await?;

        if claimed {
            debug!(peer = %peer, prekey_id = offered.id, "Claimed one-time prekey");
            Ok(Some(offered))
        } else {
            self.without_one_time_prekey(peer, "one-time prekey was claimed by another initiator")
        }
    }

    fn without_one_time_prekey(
        &self,
        peer: &PeerAddress,
        reason: &'static str,
    ) -> Result<Option<OneTimePreKeyPublic>, SessionError> {
        match self.config().one_time_prekey_policy {
            OneTimePreKeyPolicy::Required => {
                debug!(peer = %peer, reason, "One-time prekey required");
                Err(SessionError::NoKeyBundle { peer: peer.clone() })
            },
            OneTimePreKeyPolicy::AllowFallback => {
                warn!(peer = %peer, reason, "Handshake proceeds with signed prekey only");
                Ok(None)
            },
        }
    }

    fn derive_initiator(
        &self,
        bundle: &KeyBundle,
        one_time_prekey: Option<&OneTimePreKeyPublic>,
    ) -> Result<SessionRecord, SessionError> {
        let base_key = KeyPair::from_secret_bytes(self.env.random_key_seed());
        let agreed = agreement::initiate(
            self.key_store.identity(),
            &base_key,
            &bundle.identity_key,
            &bundle.signed_prekey.public_key,
            one_time_prekey.map(|prekey| &prekey.public_key),
        )
        .map_err(SessionError::Crypto)?;

        let state = RatchetState::init_initiator(
            &agreed,
            self.env.random_key_seed(),
            bundle.signed_prekey.public_key,
        )
        .map_err(SessionError::Crypto)?;

        Ok(SessionRecord {
            state,
            role: SessionRole::Initiator,
            base_key: base_key.public_key(),
            remote_identity: bundle.identity_key,
            remote_registration_id: bundle.registration_id,
            pending_handshake: Some(PendingHandshake {
                registration_id: self.key_store.registration_id(),
                signed_prekey_id: bundle.signed_prekey.id,
                one_time_prekey_id: one_time_prekey.map(|prekey| prekey.id),
                base_key: base_key.public_key(),
                identity_key: self.key_store.identity_key(),
            }),
            established_at_secs: self.env.wall_clock_secs(),
        })
    }

    /// Derive a responder session from a handshake, decrypt the embedded
    /// message and commit, replacing any previous session with `peer`.
    ///
    /// Synchronous: the whole derivation runs inside the caller's critical
    /// section.
    ///
    /// # Errors
    ///
    /// - `DecryptionFailed` if this handshake was accepted before or its
    ///   embedded message does not decrypt
    /// - `IdentityKeyChanged` if the handshake's identity contradicts trust
    /// - `UnknownPreKeyId` if the signed or one-time prekey is not ours (any
    ///   more)
    /// - `PersistFailed` if the commit does not complete; nothing is consumed
    pub fn respond(
        &self,
        peer: &PeerAddress,
        handshake: &HandshakeMessage,
    ) -> Result<Vec<u8>, SessionError> {
        let mut accepted = self.sessions.accepted_handshakes(peer)?;
        if accepted.contains(&handshake.base_key) {
            return Err(rejected(peer, &"handshake was already accepted"));
        }

        let first_contact = self.sessions.check_identity(peer, &handshake.identity_key)?;

        if handshake.signed_prekey_id != self.key_store.signed_prekey_id() {
            warn!(
                peer = %peer,
                prekey_id = handshake.signed_prekey_id,
                "Handshake names unknown signed prekey"
            );
            return Err(SessionError::UnknownPreKeyId { prekey_id: handshake.signed_prekey_id });
        }

        let _pool = handshake.one_time_prekey_id.map(|_| self.key_store.lock_pool()).transpose()?;
        let one_time_prekey = match handshake.one_time_prekey_id {
            Some(id) => Some(self.key_store.one_time_prekey(id)?.ok_or_else(|| {
                warn!(peer = %peer, prekey_id = id, "Handshake names unknown one-time prekey");
                SessionError::UnknownPreKeyId { prekey_id: id }
            })?),
            None => None,
        };

        let signed_prekey = self.key_store.signed_prekey();
        let agreed = agreement::respond(
            self.key_store.identity(),
            signed_prekey,
            one_time_prekey.as_ref(),
            &handshake.identity_key,
            &handshake.base_key,
        )
        .map_err(SessionError::Crypto)?;

        let mut state = RatchetState::init_responder(&agreed, signed_prekey.clone());
        let plaintext = state
            .decrypt(&handshake.message, self.env.random_key_seed())
            .map_err(|e| rejected(peer, &e))?;

        let record = SessionRecord {
            state,
            role: SessionRole::Responder,
            base_key: handshake.base_key,
            remote_identity: handshake.identity_key,
            remote_registration_id: handshake.registration_id,
            pending_handshake: None,
            established_at_secs: self.env.wall_clock_secs(),
        };

        accepted.insert(handshake.base_key);

        let mut batch = WriteBatch::new();
        session_store::queue_session(&mut batch, peer, &record)?;
        session_store::queue_accepted_handshakes(&mut batch, peer, &accepted)?;
        if first_contact {
            queue_first_contact(&mut batch, peer, &record)?;
        }
        if let Some(id) = handshake.one_time_prekey_id {
            self.key_store.queue_removal(&mut batch, id);
        }
        self.sessions.commit(peer, batch)?;

        info!(
            peer = %peer,
            first_contact,
            one_time_prekey_id = handshake.one_time_prekey_id,
            "Established session as responder"
        );
        Ok(plaintext)
    }
}

fn queue_first_contact(
    batch: &mut WriteBatch,
    peer: &PeerAddress,
    record: &SessionRecord,
) -> Result<(), SessionError> {
    let entry =
        TrustEntry { identity_key: record.remote_identity, decision: TrustDecision::Unverified };
    session_store::queue_trust(batch, peer, &entry)
}

/// Map a ratchet failure on a received message to `DecryptionFailed`.
pub(crate) fn rejected(peer: &PeerAddress, err: &impl std::fmt::Display) -> SessionError {
    warn!(peer = %peer, error = %err, "Rejected message");
    SessionError::DecryptionFailed { peer: peer.clone(), reason: err.to_string() }
}
