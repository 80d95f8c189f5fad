//! Message transport records and inbound dispatch.
//!
//! The transport itself (delivery, push, retries) is external. This module
//! only defines the record shape it carries and turns new-record
//! notifications into [`MessageCipher::decrypt`] calls.

use std::sync::Arc;

use base64::{Engine, engine::general_purpose::STANDARD};
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::{
    address::PeerAddress,
    cipher::MessageCipher,
    directory::KeyDirectory,
    envelope::{EncryptedEnvelope, MessageType},
    env::Environment,
    error::{EnvelopeError, SessionError},
    protocol,
    storage::Storage,
};

/// One record on the append-only message transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportRecord {
    /// Sending device
    pub sender: PeerAddress,
    /// Receiving device
    pub recipient: PeerAddress,
    /// [`MessageType`] wire value
    pub message_type: u8,
    /// Envelope body, standard base64
    pub body: String,
}

impl TransportRecord {
    /// Wrap an envelope for the transport.
    pub fn new(sender: PeerAddress, recipient: PeerAddress, envelope: &EncryptedEnvelope) -> Self {
        Self {
            sender,
            recipient,
            message_type: envelope.message_type.to_u8(),
            body: STANDARD.encode(&envelope.body),
        }
    }

    /// Recover the envelope.
    ///
    /// # Errors
    ///
    /// - `UnknownMessageType` for an unknown discriminator
    /// - `Base64` if the body does not decode
    pub fn envelope(&self) -> Result<EncryptedEnvelope, EnvelopeError> {
        Ok(EncryptedEnvelope {
            message_type: MessageType::from_u8(self.message_type)?,
            body: STANDARD.decode(&self.body).map_err(|e| EnvelopeError::Base64(e.to_string()))?,
        })
    }
}

/// A decrypted inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    /// Sending device
    pub sender: PeerAddress,
    /// Decrypted plaintext
    pub plaintext: Vec<u8>,
}

/// Inbound side of one local device.
pub struct Inbox<S: Storage, E: Environment, D: KeyDirectory + ?Sized> {
    local: PeerAddress,
    cipher: Arc<MessageCipher<S, E, D>>,
}

impl<S: Storage, E: Environment, D: KeyDirectory + ?Sized> Inbox<S, E, D> {
    /// Inbox for the device at `local`.
    pub fn new(local: PeerAddress, cipher: Arc<MessageCipher<S, E, D>>) -> Self {
        Self { local, cipher }
    }

    /// Address this inbox receives for.
    pub fn local(&self) -> &PeerAddress {
        &self.local
    }

    /// Wrap an outgoing envelope from this device.
    pub fn outgoing(&self, recipient: PeerAddress, envelope: &EncryptedEnvelope) -> TransportRecord {
        TransportRecord::new(self.local.clone(), recipient, envelope)
    }

    /// Handle a new-record notification.
    ///
    /// Returns `None` for records addressed to another device.
    ///
    /// # Errors
    ///
    /// - `DecryptionFailed` if the record does not parse
    /// - anything from [`MessageCipher::decrypt`]
    pub async fn on_record(
        &self,
        record: &TransportRecord,
    ) -> Result<Option<ReceivedMessage>, SessionError> {
        if record.recipient != self.local {
            trace!(recipient = %record.recipient, "Ignoring record for another device");
            return Ok(None);
        }

        let envelope = record.envelope().map_err(|e| protocol::rejected(&record.sender, &e))?;
        let plaintext = self.cipher.decrypt(&record.sender, &envelope).await?;

        Ok(Some(ReceivedMessage { sender: record.sender.clone(), plaintext }))
    }
}
