//! Message encryption and decryption over established sessions.
//!
//! Every call runs under the peer's lock from [`PeerLocks`]:
//!
//! ```text
//! acquire(peer) ─► [ensure_session (encrypt only, async)]
//!               ─► load ─► ratchet ─► save     (synchronous, no await)
//!               ─► release
//! ```
//!
//! The load-ratchet-save section never yields, so dropping the future can
//! only take effect before it starts or after the save returned. A failed
//! save discards the derived ciphertext or plaintext; the stored state is
//! still the one before the call.

use std::sync::Arc;

use pairwise_crypto::{NONCE_RANDOM_SIZE, RatchetMessage};
use tracing::{debug, trace};

use crate::{
    address::PeerAddress,
    directory::KeyDirectory,
    envelope::{EncryptedEnvelope, HandshakeMessage, MessageType},
    env::Environment,
    error::SessionError,
    locks::PeerLocks,
    protocol::{self, Establishment, SessionProtocol},
    records::SessionRecord,
    storage::Storage,
};

/// Encrypts to and decrypts from peers, one ratchet step per call.
pub struct MessageCipher<S: Storage, E: Environment, D: KeyDirectory + ?Sized> {
    protocol: Arc<SessionProtocol<S, E, D>>,
    locks: PeerLocks,
}

impl<S: Storage, E: Environment, D: KeyDirectory + ?Sized> MessageCipher<S, E, D> {
    /// Cipher over a session protocol.
    pub fn new(protocol: Arc<SessionProtocol<S, E, D>>) -> Self {
        Self { protocol, locks: PeerLocks::new() }
    }

    /// The underlying session protocol.
    pub fn protocol(&self) -> &SessionProtocol<S, E, D> {
        &self.protocol
    }

    /// Establish a session with `peer` without sending anything.
    ///
    /// # Errors
    ///
    /// Same as [`SessionProtocol::ensure_session`].
    pub async fn establish(&self, peer: &PeerAddress) -> Result<Establishment, SessionError> {
        let _guard = self.locks.acquire(peer).await;
        self.protocol.ensure_session(peer).await
    }

    /// Encrypt `plaintext` for `peer`, establishing a session first if
    /// needed.
    ///
    /// The first message of an initiator session is a `HandshakeMessage`;
    /// every later one is an `OrdinaryMessage`.
    ///
    /// # Errors
    ///
    /// - anything from [`SessionProtocol::ensure_session`]
    /// - `Crypto(NoSendingChain)` if this device is the responder and has
    ///   not decrypted anything yet
    /// - `PersistFailed` if the advanced state cannot be saved; the message
    ///   is unsent
    pub async fn encrypt(
        &self,
        peer: &PeerAddress,
        plaintext: &[u8],
    ) -> Result<EncryptedEnvelope, SessionError> {
        let _guard = self.locks.acquire(peer).await;
        self.protocol.ensure_session(peer).await?;
        self.encrypt_locked(peer, plaintext)
    }

    fn encrypt_locked(
        &self,
        peer: &PeerAddress,
        plaintext: &[u8],
    ) -> Result<EncryptedEnvelope, SessionError> {
        let sessions = self.protocol.sessions();
        let mut record = sessions.load(peer)?;

        let mut nonce_suffix = [0u8; NONCE_RANDOM_SIZE];
        self.protocol.env().random_bytes(&mut nonce_suffix);
        let message =
            record.state.encrypt(plaintext, nonce_suffix).map_err(SessionError::Crypto)?;
        let counter = message.header.counter;

        let envelope = match record.pending_handshake.take() {
            Some(pending) => {
                EncryptedEnvelope::handshake(&HandshakeMessage::new(&pending, message))
            },
            None => EncryptedEnvelope::ordinary(&message),
        };

        sessions.save(peer, &record)?;

        trace!(peer = %peer, counter, message_type = ?envelope.message_type, "Encrypted message");
        Ok(envelope)
    }

    /// Decrypt an envelope from `peer`.
    ///
    /// A `HandshakeMessage` with a base key this device has not seen creates
    /// (or replaces) the responder session. One with the base key of the
    /// current session is decrypted on that session, so a replayed handshake
    /// fails like any other duplicate. One with the base key of an earlier
    /// session is refused without touching the current one.
    ///
    /// # Errors
    ///
    /// - `NoSession` for an `OrdinaryMessage` from a peer without a session
    /// - `DecryptionFailed` for malformed, tampered, duplicate or too-distant
    ///   messages; the stored state is unchanged
    /// - `UnknownPreKeyId` / `IdentityKeyChanged` from the responder
    ///   handshake
    /// - `PersistFailed` if the advanced state cannot be saved; discard the
    ///   plaintext
    pub async fn decrypt(
        &self,
        peer: &PeerAddress,
        envelope: &EncryptedEnvelope,
    ) -> Result<Vec<u8>, SessionError> {
        let _guard = self.locks.acquire(peer).await;
        self.decrypt_locked(peer, envelope)
    }

    fn decrypt_locked(
        &self,
        peer: &PeerAddress,
        envelope: &EncryptedEnvelope,
    ) -> Result<Vec<u8>, SessionError> {
        let sessions = self.protocol.sessions();

        match envelope.message_type {
            MessageType::OrdinaryMessage => {
                let message = RatchetMessage::decode(&envelope.body)
                    .map_err(|e| protocol::rejected(peer, &e))?;
                let record = sessions.load(peer)?;
                self.decrypt_on(peer, record, &message)
            },
            MessageType::HandshakeMessage => {
                let handshake = HandshakeMessage::decode(&envelope.body)
                    .map_err(|e| protocol::rejected(peer, &e))?;

                match sessions.get(peer)? {
                    Some(record) if record.base_key == handshake.base_key => {
                        self.decrypt_on(peer, record, &handshake.message)
                    },
                    existing => {
                        if existing.is_some() {
                            debug!(peer = %peer, "Peer started a new session");
                        }
                        self.protocol.respond(peer, &handshake)
                    },
                }
            },
        }
    }

    fn decrypt_on(
        &self,
        peer: &PeerAddress,
        mut record: SessionRecord,
        message: &RatchetMessage,
    ) -> Result<Vec<u8>, SessionError> {
        let plaintext = record
            .state
            .decrypt(message, self.protocol.env().random_key_seed())
            .map_err(|e| protocol::rejected(peer, &e))?;

        // A reply proves the peer holds the session
        record.pending_handshake = None;
        self.protocol.sessions().save(peer, &record)?;

        trace!(peer = %peer, counter = message.header.counter, "Decrypted message");
        Ok(plaintext)
    }
}
