//! Pairwise Cryptographic Primitives
//!
//! Cryptographic building blocks for two-party sessions. Pure functions with
//! deterministic outputs. Callers provide random bytes for deterministic
//! testing.
//!
//! # Key Lifecycle
//!
//! A session starts with an asynchronous key agreement against the peer's
//! published prekeys, then hands the agreed secret to a double ratchet. Every
//! message key is derived from a symmetric chain and used exactly once.
//!
//! ```text
//! Identity Keys + Signed Prekey + One-Time Prekey + Ephemeral
//!        │
//!        ▼
//! X3DH → Shared Secret (root key)
//!        │
//!        ▼
//! DH Ratchet → Root Key → Chain Keys (one per direction per turn)
//!        │
//!        ▼
//! Symmetric Ratchet → Message Keys
//!        │
//!        ▼
//! AEAD Encryption → Ciphertext
//! ```
//!
//! # Security
//!
//! Forward Secrecy:
//! - Chain advancement: old chain keys are zeroized after deriving the next
//! - Message key disposal: keys are zeroized immediately after single use
//! - DH ratchet: every change of speaker mixes a fresh Diffie-Hellman output
//!   into the root key
//!
//! Authenticity:
//! - Signed prekeys are verified against the Ed25519 identity key
//! - XChaCha20-Poly1305 binds ciphertext to both identities and the header
//! - Failed authentication tag -> reject message, state untouched

pub mod agreement;
pub mod double_ratchet;
pub mod encryption;
mod error;
pub mod identity;
pub mod keys;
pub mod message;
pub mod ratchet;

pub use agreement::{AgreedSecret, initiate, respond};
pub use double_ratchet::{MAX_SKIP, MAX_SKIPPED_KEYS, RatchetState};
pub use encryption::{NONCE_RANDOM_SIZE, NONCE_SIZE, TAG_SIZE};
pub use error::CryptoError;
pub use identity::{IDENTITY_KEY_SIZE, IdentityKey, IdentityKeyPair, SIGNATURE_SIZE};
pub use keys::{KEY_SIZE, KeyPair, PublicKey, SecretBytes};
pub use message::{RatchetHeader, RatchetMessage};
pub use ratchet::{MessageKey, SymmetricRatchet};
