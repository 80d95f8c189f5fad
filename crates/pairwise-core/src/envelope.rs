//! Encrypted envelopes and the handshake body codec.
//!
//! An [`EncryptedEnvelope`] is a message type plus opaque body bytes. For
//! `OrdinaryMessage` the body is an encoded [`RatchetMessage`]. For
//! `HandshakeMessage` it is a [`HandshakeMessage`]:
//!
//! ```text
//! [version: 1][registration_id: 4 BE][signed_prekey_id: 4 BE]
//! [has_one_time_prekey: 1][one_time_prekey_id: 4 BE, if flag = 1]
//! [base_key: 32][identity_key: 64][ratchet message: N]
//! ```

use pairwise_crypto::{
    CryptoError, IDENTITY_KEY_SIZE, IdentityKey, KEY_SIZE, PublicKey, RatchetMessage,
};

use crate::{error::EnvelopeError, records::PendingHandshake};

/// Current handshake body version.
pub const HANDSHAKE_VERSION: u8 = 1;

/// Envelope discriminator, encoded as a small integer on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Ratchet-only message on an established session
    OrdinaryMessage = 1,
    /// First message of a session, carrying the handshake material
    HandshakeMessage = 3,
}

impl MessageType {
    /// Wire value.
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Parse a wire value.
    ///
    /// # Errors
    ///
    /// - `UnknownMessageType` for anything but 1 or 3
    pub fn from_u8(value: u8) -> Result<Self, EnvelopeError> {
        match value {
            1 => Ok(Self::OrdinaryMessage),
            3 => Ok(Self::HandshakeMessage),
            other => Err(EnvelopeError::UnknownMessageType(other)),
        }
    }
}

/// One ciphertext as handed to the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedEnvelope {
    /// How to interpret `body`
    pub message_type: MessageType,
    /// Encoded [`RatchetMessage`] or [`HandshakeMessage`]
    pub body: Vec<u8>,
}

impl EncryptedEnvelope {
    /// Envelope for a message on an established session.
    pub fn ordinary(message: &RatchetMessage) -> Self {
        Self { message_type: MessageType::OrdinaryMessage, body: message.encode() }
    }

    /// Envelope for the first message of a session.
    pub fn handshake(message: &HandshakeMessage) -> Self {
        Self { message_type: MessageType::HandshakeMessage, body: message.encode() }
    }
}

/// Handshake material plus the first ratchet message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeMessage {
    /// Initiator's registration id
    pub registration_id: u32,
    /// Responder's signed prekey the initiator used
    pub signed_prekey_id: u32,
    /// Responder's one-time prekey the initiator claimed, if any
    pub one_time_prekey_id: Option<u32>,
    /// Initiator's ephemeral public key
    pub base_key: PublicKey,
    /// Initiator's identity key
    pub identity_key: IdentityKey,
    /// First ratchet message
    pub message: RatchetMessage,
}

impl HandshakeMessage {
    /// Wrap a ratchet message with the material recorded at establishment.
    pub fn new(pending: &PendingHandshake, message: RatchetMessage) -> Self {
        Self {
            registration_id: pending.registration_id,
            signed_prekey_id: pending.signed_prekey_id,
            one_time_prekey_id: pending.one_time_prekey_id,
            base_key: pending.base_key,
            identity_key: pending.identity_key,
            message,
        }
    }

    /// Encode to wire bytes.
    pub fn encode(&self) -> Vec<u8> {
        let message = self.message.encode();
        let mut bytes = Vec::with_capacity(14 + KEY_SIZE + IDENTITY_KEY_SIZE + message.len());

        bytes.push(HANDSHAKE_VERSION);
        bytes.extend_from_slice(&self.registration_id.to_be_bytes());
        bytes.extend_from_slice(&self.signed_prekey_id.to_be_bytes());
        match self.one_time_prekey_id {
            Some(id) => {
                bytes.push(1);
                bytes.extend_from_slice(&id.to_be_bytes());
            },
            None => bytes.push(0),
        }
        bytes.extend_from_slice(self.base_key.as_bytes());
        bytes.extend_from_slice(&self.identity_key.to_bytes());
        bytes.extend_from_slice(&message);
        bytes
    }

    /// Decode from wire bytes.
    ///
    /// # Errors
    ///
    /// - `UnsupportedVersion` for an unknown version byte
    /// - `Truncated` if a fixed field is cut off
    /// - `Invalid` if a key or the ratchet message does not parse
    pub fn decode(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        let mut reader = Reader { bytes, consumed: 0 };

        let version = reader.u8()?;
        if version != HANDSHAKE_VERSION {
            return Err(EnvelopeError::UnsupportedVersion(version));
        }

        let registration_id = reader.u32()?;
        let signed_prekey_id = reader.u32()?;
        let one_time_prekey_id = match reader.u8()? {
            0 => None,
            1 => Some(reader.u32()?),
            flag => {
                return Err(EnvelopeError::Invalid(CryptoError::MalformedMessage {
                    reason: format!("one-time prekey flag {flag}"),
                }));
            },
        };
        let base_key = PublicKey::from_slice(reader.take(KEY_SIZE)?)?;
        let identity_key = IdentityKey::from_bytes(reader.take(IDENTITY_KEY_SIZE)?)?;
        let message = RatchetMessage::decode(reader.rest())?;

        Ok(Self {
            registration_id,
            signed_prekey_id,
            one_time_prekey_id,
            base_key,
            identity_key,
            message,
        })
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    consumed: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8], EnvelopeError> {
        if self.bytes.len() < len {
            return Err(EnvelopeError::Truncated {
                expected: self.consumed + len,
                actual: self.consumed + self.bytes.len(),
            });
        }
        let (head, tail) = self.bytes.split_at(len);
        self.bytes = tail;
        self.consumed += len;
        Ok(head)
    }

    fn u8(&mut self) -> Result<u8, EnvelopeError> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, EnvelopeError> {
        let bytes = self.take(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn rest(self) -> &'a [u8] {
        self.bytes
    }
}
