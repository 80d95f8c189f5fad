//! Long-term device identity.
//!
//! An identity is an Ed25519 signing key (signs prekeys) paired with an
//! X25519 agreement key (participates in key agreement). The public halves
//! travel together as a 64-byte [`IdentityKey`]: `signing || agreement`.

use std::fmt;

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{
    error::CryptoError,
    keys::{KEY_SIZE, KeyPair, PublicKey},
};

/// Size of a serialized public identity key.
pub const IDENTITY_KEY_SIZE: usize = 2 * KEY_SIZE;

/// Size of an Ed25519 signature.
pub const SIGNATURE_SIZE: usize = 64;

/// Private identity: never leaves the device.
#[derive(Clone)]
pub struct IdentityKeyPair {
    signing: SigningKey,
    agreement: KeyPair,
}

impl IdentityKeyPair {
    /// Build an identity from two 32-byte seeds of caller-provided randomness.
    pub fn from_seeds(signing_seed: [u8; KEY_SIZE], agreement_seed: [u8; KEY_SIZE]) -> Self {
        Self {
            signing: SigningKey::from_bytes(&signing_seed),
            agreement: KeyPair::from_secret_bytes(agreement_seed),
        }
    }

    /// Public half of this identity.
    pub fn public_key(&self) -> IdentityKey {
        IdentityKey {
            signing: self.signing.verifying_key().to_bytes(),
            agreement: self.agreement.public_key(),
        }
    }

    /// Sign a message with the identity signing key.
    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_SIZE] {
        self.signing.sign(message).to_bytes()
    }

    /// X25519 agreement key pair.
    pub fn agreement(&self) -> &KeyPair {
        &self.agreement
    }

    /// Ed25519 seed, for persistence.
    pub fn signing_seed(&self) -> [u8; KEY_SIZE] {
        self.signing.to_bytes()
    }
}

impl fmt::Debug for IdentityKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityKeyPair").field("public", &self.public_key()).finish_non_exhaustive()
    }
}

/// Public identity key: shared with peers and recorded in trust entries.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdentityKey {
    signing: [u8; KEY_SIZE],
    agreement: PublicKey,
}

impl IdentityKey {
    /// Parse a 64-byte identity key.
    ///
    /// # Errors
    ///
    /// - `InvalidKey` if the length is wrong or the signing half is not a
    ///   valid Ed25519 point.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != IDENTITY_KEY_SIZE {
            return Err(CryptoError::InvalidKey {
                reason: format!("identity key must be {IDENTITY_KEY_SIZE} bytes, got {}", bytes.len()),
            });
        }

        let mut signing = [0u8; KEY_SIZE];
        signing.copy_from_slice(&bytes[..KEY_SIZE]);
        VerifyingKey::from_bytes(&signing).map_err(|e| CryptoError::InvalidKey {
            reason: format!("identity signing key: {e}"),
        })?;

        let agreement = PublicKey::from_slice(&bytes[KEY_SIZE..])?;

        Ok(Self { signing, agreement })
    }

    /// Serialize as `signing || agreement`.
    pub fn to_bytes(&self) -> [u8; IDENTITY_KEY_SIZE] {
        let mut bytes = [0u8; IDENTITY_KEY_SIZE];
        bytes[..KEY_SIZE].copy_from_slice(&self.signing);
        bytes[KEY_SIZE..].copy_from_slice(self.agreement.as_bytes());
        bytes
    }

    /// X25519 public key used in key agreement.
    pub fn agreement_key(&self) -> &PublicKey {
        &self.agreement
    }

    /// Verify an Ed25519 signature made by this identity.
    ///
    /// # Errors
    ///
    /// - `InvalidSignature` if the signature has the wrong length or does not
    ///   verify.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> Result<(), CryptoError> {
        let signature: [u8; SIGNATURE_SIZE] =
            signature.try_into().map_err(|_| CryptoError::InvalidSignature)?;
        let verifying_key =
            VerifyingKey::from_bytes(&self.signing).map_err(|_| CryptoError::InvalidSignature)?;

        verifying_key
            .verify_strict(message, &Signature::from_bytes(&signature))
            .map_err(|_| CryptoError::InvalidSignature)
    }

    /// Human-comparable fingerprint (SHA-256 of the key, hex, grouped).
    ///
    /// Shown to users during out-of-band re-verification after an identity
    /// change.
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.to_bytes());
        digest
            .chunks(4)
            .map(|chunk| chunk.iter().map(|b| format!("{b:02x}")).collect::<String>())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl fmt::Debug for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IdentityKey(")?;
        for byte in &self.signing[..4] {
            write!(f, "{byte:02x}")?;
        }
        write!(f, "..)")
    }
}
