//! Error types for cryptographic operations.

use thiserror::Error;

/// Errors that can occur in key agreement, ratchet and AEAD operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// A signature did not verify under the claimed identity key.
    #[error("signature verification failed")]
    InvalidSignature,

    /// Key bytes could not be parsed or produced a degenerate DH output.
    #[error("invalid key: {reason}")]
    InvalidKey {
        /// What was wrong with the key
        reason: String,
    },

    /// Authentication tag did not verify (wrong key or tampered ciphertext).
    #[error("decryption failed: {reason}")]
    DecryptionFailed {
        /// Reason for failure
        reason: String,
    },

    /// Message counter is behind the receiving chain and no skipped key is
    /// cached for it (duplicate or expired message).
    #[error("ratchet too far behind: chain at {current}, message counter {requested}")]
    RatchetTooFarBehind {
        /// Counter of the receiving chain
        current: u32,
        /// Counter in the message header
        requested: u32,
    },

    /// Message counter is further ahead than the skip window allows.
    #[error("ratchet too far ahead: chain at {current}, message counter {requested}")]
    RatchetTooFarAhead {
        /// Counter of the receiving chain
        current: u32,
        /// Counter in the message header
        requested: u32,
    },

    /// Chain counter would overflow.
    #[error("chain counter overflow at {current}")]
    CounterOverflow {
        /// Counter at which the chain stopped
        current: u32,
    },

    /// Encrypt was called before a sending chain exists (responder that has
    /// not yet received the first message).
    #[error("no sending chain established")]
    NoSendingChain,

    /// Wire bytes could not be parsed.
    #[error("malformed message: {reason}")]
    MalformedMessage {
        /// What was wrong with the encoding
        reason: String,
    },

    /// Unknown wire format version.
    #[error("unsupported message version: {0}")]
    UnsupportedVersion(u8),
}

impl CryptoError {
    /// Returns true if this error means the ciphertext did not verify or
    /// decrypt under the expected chain step.
    pub fn is_decryption_failure(&self) -> bool {
        matches!(
            self,
            Self::DecryptionFailed { .. }
                | Self::RatchetTooFarBehind { .. }
                | Self::RatchetTooFarAhead { .. }
                | Self::MalformedMessage { .. }
                | Self::UnsupportedVersion(_)
                | Self::InvalidKey { .. }
        )
    }
}
