//! Ratchet message wire format.
//!
//! ```text
//! [version: 1][ratchet_key: 32][previous_chain_length: 4 BE][counter: 4 BE]
//! [nonce: 24][ciphertext + tag: N]
//! ```
//!
//! The first 41 bytes (the header) are authenticated as associated data.

use crate::{
    encryption::{NONCE_SIZE, TAG_SIZE},
    error::CryptoError,
    keys::{KEY_SIZE, PublicKey},
};

/// Current wire format version.
pub const MESSAGE_VERSION: u8 = 1;

/// Encoded header size: version + ratchet key + two counters.
pub const HEADER_SIZE: usize = 1 + KEY_SIZE + 4 + 4;

/// Smallest well-formed message: header, nonce and an empty-plaintext tag.
pub const MIN_MESSAGE_SIZE: usize = HEADER_SIZE + NONCE_SIZE + TAG_SIZE;

/// Ratchet header sent in the clear alongside every ciphertext.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RatchetHeader {
    /// Sender's current DH ratchet public key
    pub ratchet_key: PublicKey,
    /// Length of the sender's previous sending chain
    pub previous_chain_length: u32,
    /// Position of this message in the current sending chain
    pub counter: u32,
}

impl RatchetHeader {
    /// Encode the header to its fixed 41-byte form.
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0u8; HEADER_SIZE];
        bytes[0] = MESSAGE_VERSION;
        bytes[1..33].copy_from_slice(self.ratchet_key.as_bytes());
        bytes[33..37].copy_from_slice(&self.previous_chain_length.to_be_bytes());
        bytes[37..41].copy_from_slice(&self.counter.to_be_bytes());
        bytes
    }

    fn decode(bytes: &[u8; HEADER_SIZE]) -> Result<Self, CryptoError> {
        if bytes[0] != MESSAGE_VERSION {
            return Err(CryptoError::UnsupportedVersion(bytes[0]));
        }

        let ratchet_key = PublicKey::from_slice(&bytes[1..33])?;
        let previous_chain_length = u32::from_be_bytes([bytes[33], bytes[34], bytes[35], bytes[36]]);
        let counter = u32::from_be_bytes([bytes[37], bytes[38], bytes[39], bytes[40]]);

        Ok(Self { ratchet_key, previous_chain_length, counter })
    }
}

/// One encrypted ratchet message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RatchetMessage {
    /// Cleartext, authenticated header
    pub header: RatchetHeader,
    /// The 24-byte `XChaCha20` nonce
    pub nonce: [u8; NONCE_SIZE],
    /// The ciphertext including 16-byte Poly1305 tag
    pub ciphertext: Vec<u8>,
}

impl RatchetMessage {
    /// Encode to wire bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(HEADER_SIZE + NONCE_SIZE + self.ciphertext.len());
        bytes.extend_from_slice(&self.header.encode());
        bytes.extend_from_slice(&self.nonce);
        bytes.extend_from_slice(&self.ciphertext);
        bytes
    }

    /// Decode from wire bytes.
    ///
    /// # Errors
    ///
    /// - `MalformedMessage` if the input is shorter than a minimal message
    /// - `UnsupportedVersion` if the version byte is unknown
    pub fn decode(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() < MIN_MESSAGE_SIZE {
            return Err(CryptoError::MalformedMessage {
                reason: format!("message too short: {} < {MIN_MESSAGE_SIZE}", bytes.len()),
            });
        }

        let mut header_bytes = [0u8; HEADER_SIZE];
        header_bytes.copy_from_slice(&bytes[..HEADER_SIZE]);
        let header = RatchetHeader::decode(&header_bytes)?;

        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(&bytes[HEADER_SIZE..HEADER_SIZE + NONCE_SIZE]);

        let ciphertext = bytes[HEADER_SIZE + NONCE_SIZE..].to_vec();

        Ok(Self { header, nonce, ciphertext })
    }

    /// Plaintext length (ciphertext length minus authentication tag).
    pub fn plaintext_len(&self) -> usize {
        self.ciphertext.len().saturating_sub(TAG_SIZE)
    }
}
