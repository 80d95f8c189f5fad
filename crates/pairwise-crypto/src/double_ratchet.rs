//! Double ratchet over an agreed secret.
//!
//! Each side keeps a root key, a sending chain and a receiving chain. When
//! the peer's ratchet key changes, a Diffie-Hellman step mixes fresh output
//! into the root key and restarts both chains; within a chain the symmetric
//! ratchet derives one key per message.
//!
//! Keys for messages that were skipped (delivered out of order) are cached
//! in a bounded FIFO so late arrivals can still be read. A key is removed
//! from the cache the moment it is used, so every message decrypts at most
//! once.
//!
//! Decryption is transactional: it runs against a copy of the state and the
//! copy replaces `self` only when the authentication tag verifies.

use std::{collections::VecDeque, fmt};

use serde::{Deserialize, Serialize};

use crate::{
    agreement::AgreedSecret,
    encryption::{self, NONCE_RANDOM_SIZE},
    error::CryptoError,
    keys::{KEY_SIZE, KeyPair, PublicKey, SecretBytes},
    message::{RatchetHeader, RatchetMessage},
    ratchet::{MessageKey, SymmetricRatchet, kdf_root},
};

/// Maximum number of message keys skipped within one receiving chain.
pub const MAX_SKIP: u32 = 1000;

/// Maximum number of skipped message keys retained per session.
pub const MAX_SKIPPED_KEYS: usize = 2000;

#[derive(Clone, Serialize, Deserialize)]
struct SkippedMessageKey {
    ratchet_key: PublicKey,
    counter: u32,
    key: SecretBytes,
}

/// Per-peer ratchet state.
#[derive(Clone, Serialize, Deserialize)]
pub struct RatchetState {
    associated_data: Vec<u8>,
    root_key: SecretBytes,
    our_ratchet_key: KeyPair,
    their_ratchet_key: Option<PublicKey>,
    sending: Option<SymmetricRatchet>,
    receiving: Option<SymmetricRatchet>,
    previous_chain_length: u32,
    skipped: VecDeque<SkippedMessageKey>,
}

impl RatchetState {
    /// Initiator state after key agreement.
    ///
    /// The responder's signed prekey doubles as its first ratchet key, so the
    /// initiator can send immediately.
    ///
    /// # Errors
    ///
    /// - `InvalidKey` if the signed prekey yields a degenerate DH output
    pub fn init_initiator(
        agreed: &AgreedSecret,
        ratchet_seed: [u8; KEY_SIZE],
        their_signed_prekey: PublicKey,
    ) -> Result<Self, CryptoError> {
        let our_ratchet_key = KeyPair::from_secret_bytes(ratchet_seed);
        let dh_output = our_ratchet_key.diffie_hellman(&their_signed_prekey)?;
        let (root_key, sending_chain) = kdf_root(agreed.shared_secret(), &dh_output);

        Ok(Self {
            associated_data: agreed.associated_data().to_vec(),
            root_key,
            our_ratchet_key,
            their_ratchet_key: Some(their_signed_prekey),
            sending: Some(SymmetricRatchet::new(sending_chain)),
            receiving: None,
            previous_chain_length: 0,
            skipped: VecDeque::new(),
        })
    }

    /// Responder state after key agreement.
    ///
    /// The responder cannot send until the initiator's first message has
    /// been decrypted.
    pub fn init_responder(agreed: &AgreedSecret, signed_prekey: KeyPair) -> Self {
        Self {
            associated_data: agreed.associated_data().to_vec(),
            root_key: agreed.shared_secret().clone(),
            our_ratchet_key: signed_prekey,
            their_ratchet_key: None,
            sending: None,
            receiving: None,
            previous_chain_length: 0,
            skipped: VecDeque::new(),
        }
    }

    /// Encrypt the next outgoing message.
    ///
    /// # Errors
    ///
    /// - `NoSendingChain` if no message has been received yet on the
    ///   responder side
    /// - `CounterOverflow` if the sending chain is exhausted
    pub fn encrypt(
        &mut self,
        plaintext: &[u8],
        nonce_suffix: [u8; NONCE_RANDOM_SIZE],
    ) -> Result<RatchetMessage, CryptoError> {
        let sending = self.sending.as_mut().ok_or(CryptoError::NoSendingChain)?;
        let message_key = sending.next_key()?;

        let header = RatchetHeader {
            ratchet_key: self.our_ratchet_key.public_key(),
            previous_chain_length: self.previous_chain_length,
            counter: message_key.counter(),
        };
        let nonce = encryption::build_nonce(header.counter, nonce_suffix);
        let ciphertext = encryption::seal(&message_key, &nonce, &self.aad(&header), plaintext);

        Ok(RatchetMessage { header, nonce, ciphertext })
    }

    /// Decrypt an incoming message.
    ///
    /// `ratchet_seed` is fresh randomness for the next sending ratchet key;
    /// it is only used when the message starts a new receiving chain.
    ///
    /// On error the state is unchanged.
    ///
    /// # Errors
    ///
    /// - `DecryptionFailed` if the tag does not verify
    /// - `RatchetTooFarBehind` for a duplicate or an expired skipped message
    /// - `RatchetTooFarAhead` if the gap exceeds [`MAX_SKIP`]
    pub fn decrypt(
        &mut self,
        message: &RatchetMessage,
        ratchet_seed: [u8; KEY_SIZE],
    ) -> Result<Vec<u8>, CryptoError> {
        let mut next = self.clone();
        let plaintext = next.decrypt_in_place(message, ratchet_seed)?;
        *self = next;
        Ok(plaintext)
    }

    /// Our current ratchet public key.
    pub fn our_ratchet_key(&self) -> PublicKey {
        self.our_ratchet_key.public_key()
    }

    /// The peer's latest ratchet public key, if any message was exchanged.
    pub fn their_ratchet_key(&self) -> Option<PublicKey> {
        self.their_ratchet_key
    }

    /// True once a sending chain exists.
    pub fn can_send(&self) -> bool {
        self.sending.is_some()
    }

    /// Messages sent on the current sending chain.
    pub fn sending_counter(&self) -> u32 {
        self.sending.as_ref().map_or(0, SymmetricRatchet::counter)
    }

    /// Messages consumed on the current receiving chain.
    pub fn receiving_counter(&self) -> u32 {
        self.receiving.as_ref().map_or(0, SymmetricRatchet::counter)
    }

    /// Number of cached keys for skipped messages.
    pub fn skipped_key_count(&self) -> usize {
        self.skipped.len()
    }

    /// Both identities, bound into every message.
    pub fn associated_data(&self) -> &[u8] {
        &self.associated_data
    }

    fn decrypt_in_place(
        &mut self,
        message: &RatchetMessage,
        ratchet_seed: [u8; KEY_SIZE],
    ) -> Result<Vec<u8>, CryptoError> {
        let header = &message.header;

        if let Some(message_key) = self.take_skipped(header) {
            return self.open(&message_key, message);
        }

        if self.their_ratchet_key != Some(header.ratchet_key) {
            if self.receiving.is_some() {
                self.skip_receiving_until(header.previous_chain_length)?;
            }
            self.dh_step(header.ratchet_key, ratchet_seed)?;
        }

        let receiving = self.receiving.as_mut().ok_or_else(|| CryptoError::DecryptionFailed {
            reason: "no receiving chain".to_string(),
        })?;
        let (message_key, skipped) = receiving.key_for(header.counter, MAX_SKIP)?;
        for key in &skipped {
            self.cache_skipped(header.ratchet_key, key);
        }

        self.open(&message_key, message)
    }

    fn dh_step(
        &mut self,
        their_ratchet_key: PublicKey,
        ratchet_seed: [u8; KEY_SIZE],
    ) -> Result<(), CryptoError> {
        self.previous_chain_length = self.sending_counter();
        self.their_ratchet_key = Some(their_ratchet_key);

        let receive_dh = self.our_ratchet_key.diffie_hellman(&their_ratchet_key)?;
        let (root_key, receiving_chain) = kdf_root(&self.root_key, &receive_dh);
        self.receiving = Some(SymmetricRatchet::new(receiving_chain));

        self.our_ratchet_key = KeyPair::from_secret_bytes(ratchet_seed);
        let send_dh = self.our_ratchet_key.diffie_hellman(&their_ratchet_key)?;
        let (root_key, sending_chain) = kdf_root(&root_key, &send_dh);
        self.sending = Some(SymmetricRatchet::new(sending_chain));
        self.root_key = root_key;

        Ok(())
    }

    fn skip_receiving_until(&mut self, until: u32) -> Result<(), CryptoError> {
        let (Some(their_ratchet_key), Some(receiving)) =
            (self.their_ratchet_key, self.receiving.as_mut())
        else {
            return Ok(());
        };

        let current = receiving.counter();
        if until <= current {
            return Ok(());
        }
        if until - current > MAX_SKIP {
            return Err(CryptoError::RatchetTooFarAhead { current, requested: until });
        }

        let mut skipped = Vec::with_capacity((until - current) as usize);
        while receiving.counter() < until {
            skipped.push(receiving.next_key()?);
        }
        for key in &skipped {
            self.cache_skipped(their_ratchet_key, key);
        }
        Ok(())
    }

    fn take_skipped(&mut self, header: &RatchetHeader) -> Option<MessageKey> {
        let position = self
            .skipped
            .iter()
            .position(|s| s.ratchet_key == header.ratchet_key && s.counter == header.counter)?;
        let entry = self.skipped.remove(position)?;
        Some(MessageKey::from_parts(&entry.key, entry.counter))
    }

    fn cache_skipped(&mut self, ratchet_key: PublicKey, key: &MessageKey) {
        self.skipped.push_back(SkippedMessageKey {
            ratchet_key,
            counter: key.counter(),
            key: SecretBytes::new(*key.key()),
        });
        while self.skipped.len() > MAX_SKIPPED_KEYS {
            self.skipped.pop_front();
        }
    }

    fn open(&self, message_key: &MessageKey, message: &RatchetMessage) -> Result<Vec<u8>, CryptoError> {
        encryption::open(message_key, &message.nonce, &self.aad(&message.header), &message.ciphertext)
    }

    fn aad(&self, header: &RatchetHeader) -> Vec<u8> {
        let encoded = header.encode();
        let mut aad = Vec::with_capacity(self.associated_data.len() + encoded.len());
        aad.extend_from_slice(&self.associated_data);
        aad.extend_from_slice(&encoded);
        aad
    }
}

impl fmt::Debug for RatchetState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RatchetState")
            .field("our_ratchet_key", &self.our_ratchet_key.public_key())
            .field("their_ratchet_key", &self.their_ratchet_key)
            .field("sending_counter", &self.sending_counter())
            .field("receiving_counter", &self.receiving_counter())
            .field("skipped", &self.skipped.len())
            .finish_non_exhaustive()
    }
}
