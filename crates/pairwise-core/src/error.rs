//! Error types for the session subsystem.
//!
//! Three layers, each with its own enum:
//! - [`StorageError`]: the storage backend failed or returned corrupt bytes
//! - [`DirectoryError`]: the key-bundle directory call failed
//! - [`EnvelopeError`]: received envelope bytes could not be parsed
//! - [`SessionError`]: what callers branch on
//!
//! Storage errors are mapped at the component boundary. A failed read
//! surfaces as `StorageUnavailable`; a failed write of session state surfaces
//! as `PersistFailed`, meaning the operation's output must be discarded.

use pairwise_crypto::CryptoError;
use thiserror::Error;

use crate::address::PeerAddress;

/// Errors that can occur during storage operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// I/O error (file system, database, lock poisoning).
    #[error("I/O error: {0}")]
    Io(String),

    /// Serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Stored bytes decoded but failed validation.
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

/// Errors returned by a key-bundle directory.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DirectoryError {
    /// Directory could not be reached; the call may succeed later.
    #[error("directory unavailable: {0}")]
    Unavailable(String),

    /// Directory refused the request.
    #[error("directory rejected request: {0}")]
    Rejected(String),
}

impl DirectoryError {
    /// Returns true if this error is transient and may succeed on retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Errors from parsing envelopes and transport records.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EnvelopeError {
    /// Message type discriminator is not one we know.
    #[error("unknown message type: {0}")]
    UnknownMessageType(u8),

    /// Handshake body version is not supported.
    #[error("unsupported handshake version: {0}")]
    UnsupportedVersion(u8),

    /// Body is shorter than its fixed fields.
    #[error("truncated body: need {expected} bytes, got {actual}")]
    Truncated {
        /// Bytes required
        expected: usize,
        /// Bytes present
        actual: usize,
    },

    /// Embedded key or ratchet message is invalid.
    #[error("invalid body: {0}")]
    Invalid(#[from] CryptoError),

    /// Transport body is not valid base64.
    #[error("invalid base64 body: {0}")]
    Base64(String),
}

/// Errors surfaced by the key store, session protocol and message cipher.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// Secure storage could not be read. Fatal to the calling operation.
    #[error("secure storage unavailable: {0}")]
    StorageUnavailable(String),

    /// Peer never published a bundle, or the one-time prekey policy could not
    /// be satisfied.
    #[error("no key bundle available for {peer}")]
    NoKeyBundle {
        /// Peer whose bundle was requested
        peer: PeerAddress,
    },

    /// Signed prekey signature did not verify under the bundle's identity key.
    #[error("invalid signed prekey signature for {peer}")]
    InvalidSignature {
        /// Peer whose bundle was rejected
        peer: PeerAddress,
    },

    /// Peer's identity key differs from the one recorded in its trust entry.
    #[error("identity key changed for {peer}")]
    IdentityKeyChanged {
        /// Peer whose identity changed
        peer: PeerAddress,
    },

    /// Handshake referenced a local prekey that no longer exists.
    #[error("unknown prekey id {prekey_id}")]
    UnknownPreKeyId {
        /// The referenced prekey id
        prekey_id: u32,
    },

    /// Ciphertext did not verify or decrypt under the expected chain step.
    #[error("decryption failed for {peer}: {reason}")]
    DecryptionFailed {
        /// Sender of the message
        peer: PeerAddress,
        /// Reason for failure
        reason: String,
    },

    /// New session state could not be persisted; discard the result.
    #[error("failed to persist session state: {0}")]
    PersistFailed(String),

    /// No established session for the peer.
    #[error("no session for {peer}")]
    NoSession {
        /// Peer without a session
        peer: PeerAddress,
    },

    /// Directory call failed after retries.
    #[error(transparent)]
    DirectoryUnavailable(#[from] DirectoryError),

    /// Key material was rejected by a cryptographic primitive.
    #[error("cryptographic error: {0}")]
    Crypto(CryptoError),
}

impl SessionError {
    /// Storage read failure.
    pub(crate) fn storage(err: StorageError) -> Self {
        Self::StorageUnavailable(err.to_string())
    }

    /// Storage write failure for session or key state.
    pub(crate) fn persist(err: StorageError) -> Self {
        Self::PersistFailed(err.to_string())
    }

    /// Returns true if the caller may retry later or drop just this message.
    ///
    /// The session is not torn down for any of these.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::NoKeyBundle { .. }
                | Self::UnknownPreKeyId { .. }
                | Self::DecryptionFailed { .. }
                | Self::PersistFailed(_)
                | Self::NoSession { .. }
                | Self::DirectoryUnavailable(_)
        )
    }

    /// Returns true for failures that must prompt re-verification and must
    /// never be retried automatically.
    pub fn is_security_critical(&self) -> bool {
        matches!(self, Self::InvalidSignature { .. } | Self::IdentityKeyChanged { .. })
    }
}
