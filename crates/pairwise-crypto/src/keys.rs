//! X25519 key material for prekeys, ephemeral keys and ratchet keys.

use std::fmt;

use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey as DalekPublicKey, StaticSecret};
use zeroize::Zeroize;

use crate::error::CryptoError;

/// Size of an X25519 key (public or secret) in bytes.
pub const KEY_SIZE: usize = 32;

/// 32 bytes of secret material, zeroized on drop.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretBytes([u8; KEY_SIZE]);

impl SecretBytes {
    /// Wrap raw secret bytes.
    pub fn new(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Borrow the secret bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl fmt::Debug for SecretBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretBytes(..)")
    }
}

impl Drop for SecretBytes {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

/// X25519 public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PublicKey([u8; KEY_SIZE]);

impl PublicKey {
    /// Wrap raw public key bytes.
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Parse a public key from a slice, checking the length.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let array: [u8; KEY_SIZE] = bytes.try_into().map_err(|_| CryptoError::InvalidKey {
            reason: format!("expected {KEY_SIZE} bytes, got {}", bytes.len()),
        })?;
        Ok(Self(array))
    }

    /// Borrow the key bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    /// Copy out the key bytes.
    pub fn to_bytes(self) -> [u8; KEY_SIZE] {
        self.0
    }

    fn to_dalek(self) -> DalekPublicKey {
        DalekPublicKey::from(self.0)
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey(")?;
        for byte in &self.0[..4] {
            write!(f, "{byte:02x}")?;
        }
        write!(f, "..)")
    }
}

/// X25519 key pair.
///
/// Serializes as its secret half only; the public half is recomputed on
/// load so a stored pair can never be internally inconsistent.
#[derive(Clone, Serialize, Deserialize)]
#[serde(from = "SecretBytes", into = "SecretBytes")]
pub struct KeyPair {
    secret: SecretBytes,
    public: PublicKey,
}

impl KeyPair {
    /// Build a key pair from 32 bytes of caller-provided randomness.
    pub fn from_secret_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        let secret = StaticSecret::from(bytes);
        let public = DalekPublicKey::from(&secret);
        Self { secret: SecretBytes::new(secret.to_bytes()), public: PublicKey(public.to_bytes()) }
    }

    /// Public half of this key pair.
    pub fn public_key(&self) -> PublicKey {
        self.public
    }

    /// Secret half, for persistence.
    pub fn secret(&self) -> &SecretBytes {
        &self.secret
    }

    /// X25519 Diffie-Hellman with a peer public key.
    ///
    /// Rejects non-contributory results (low-order peer points), which would
    /// otherwise yield an all-zero shared secret.
    pub fn diffie_hellman(&self, their_public: &PublicKey) -> Result<SecretBytes, CryptoError> {
        let secret = StaticSecret::from(*self.secret.as_bytes());
        let shared = secret.diffie_hellman(&their_public.to_dalek());
        if !shared.was_contributory() {
            return Err(CryptoError::InvalidKey {
                reason: "non-contributory Diffie-Hellman output".to_string(),
            });
        }
        Ok(SecretBytes::new(shared.to_bytes()))
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair").field("public", &self.public).finish_non_exhaustive()
    }
}

impl From<SecretBytes> for KeyPair {
    fn from(secret: SecretBytes) -> Self {
        Self::from_secret_bytes(*secret.as_bytes())
    }
}

impl From<KeyPair> for SecretBytes {
    fn from(pair: KeyPair) -> Self {
        pair.secret
    }
}
