//! Public key bundles.
//!
//! [`PublishedBundle`] is what a device uploads: its whole current pool of
//! one-time prekeys. [`KeyBundle`] is what an initiator receives: the same
//! identity and signed prekey plus at most one one-time prekey.

use pairwise_crypto::{CryptoError, IdentityKey, PublicKey};
use serde::{Deserialize, Serialize};

/// Public half of a signed prekey.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedPreKeyPublic {
    /// Prekey id
    pub id: u32,
    /// X25519 public key
    pub public_key: PublicKey,
    /// Ed25519 signature by the identity key over `public_key`
    pub signature: Vec<u8>,
}

impl SignedPreKeyPublic {
    /// Verify the signature against an identity key.
    ///
    /// # Errors
    ///
    /// - `InvalidSignature` if it does not verify
    pub fn verify(&self, identity_key: &IdentityKey) -> Result<(), CryptoError> {
        identity_key.verify(self.public_key.as_bytes(), &self.signature)
    }
}

/// Public half of a one-time prekey.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OneTimePreKeyPublic {
    /// Prekey id
    pub id: u32,
    /// X25519 public key
    pub public_key: PublicKey,
}

/// Bundle fetched for one peer device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyBundle {
    /// Peer identity key
    pub identity_key: IdentityKey,
    /// Peer registration id
    pub registration_id: u32,
    /// Peer signed prekey
    pub signed_prekey: SignedPreKeyPublic,
    /// Zero or one available one-time prekeys
    pub one_time_prekey: Option<OneTimePreKeyPublic>,
}

impl KeyBundle {
    /// Verify the signed prekey signature against the bundle's identity key.
    ///
    /// # Errors
    ///
    /// - `InvalidSignature` if it does not verify
    pub fn verify(&self) -> Result<(), CryptoError> {
        self.signed_prekey.verify(&self.identity_key)
    }
}

/// Everything a device publishes to the directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishedBundle {
    /// Identity key
    pub identity_key: IdentityKey,
    /// Registration id
    pub registration_id: u32,
    /// Active signed prekey
    pub signed_prekey: SignedPreKeyPublic,
    /// Every unconsumed one-time prekey, ascending by id
    pub one_time_prekeys: Vec<OneTimePreKeyPublic>,
}

impl PublishedBundle {
    /// The bundle an initiator would receive now: the lowest-id one-time
    /// prekey, if any remain.
    pub fn offer(&self) -> KeyBundle {
        KeyBundle {
            identity_key: self.identity_key,
            registration_id: self.registration_id,
            signed_prekey: self.signed_prekey.clone(),
            one_time_prekey: self.one_time_prekeys.first().copied(),
        }
    }

    /// Remove one prekey. Returns whether it was present.
    pub fn remove_one_time_prekey(&mut self, id: u32) -> bool {
        let before = self.one_time_prekeys.len();
        self.one_time_prekeys.retain(|prekey| prekey.id != id);
        self.one_time_prekeys.len() != before
    }
}
