//! Persisted record types.
//!
//! Every record is stored as CBOR wrapped in a version tag:
//!
//! ```text
//! { "version": 1, "record": <record fields> }
//! ```
//!
//! Decoding rejects unknown versions and validates field invariants, so a
//! corrupt or foreign row surfaces as `StorageError::Corrupt` instead of
//! reaching key derivation.

use pairwise_crypto::{
    IdentityKey, IdentityKeyPair, KeyPair, PublicKey, RatchetState, SIGNATURE_SIZE, SecretBytes,
};
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::error::StorageError;

/// Current record format version.
pub const RECORD_VERSION: u8 = 1;

/// Largest registration id (14 bits).
pub const MAX_REGISTRATION_ID: u32 = 0x3FFF;

/// Handshake base keys remembered per peer.
pub const MAX_ACCEPTED_HANDSHAKES: usize = 64;

/// Row key of the single identity record.
pub(crate) const IDENTITY_ROW: &[u8] = b"local";

/// Row key of the key store bookkeeping record.
pub(crate) const KEY_STORE_META_ROW: &[u8] = b"key_store";

/// Field checks run after decoding.
pub trait Validate {
    /// Returns a description of the first violated invariant.
    fn validate(&self) -> Result<(), String>;
}

#[derive(Serialize)]
struct VersionedRef<'a, T> {
    version: u8,
    record: &'a T,
}

#[derive(Deserialize)]
struct Versioned<T> {
    version: u8,
    record: T,
}

/// Encode a record with its version tag.
pub fn encode<T: Serialize>(record: &T) -> Result<Vec<u8>, StorageError> {
    let mut bytes = Vec::new();
    ciborium::into_writer(&VersionedRef { version: RECORD_VERSION, record }, &mut bytes)
        .map_err(|e| StorageError::Serialization(e.to_string()))?;
    Ok(bytes)
}

/// Decode and validate a record.
pub fn decode<T: DeserializeOwned + Validate>(bytes: &[u8]) -> Result<T, StorageError> {
    let versioned: Versioned<T> =
        ciborium::from_reader(bytes).map_err(|e| StorageError::Serialization(e.to_string()))?;

    if versioned.version != RECORD_VERSION {
        return Err(StorageError::Corrupt(format!(
            "unsupported record version {}",
            versioned.version
        )));
    }

    versioned.record.validate().map_err(StorageError::Corrupt)?;
    Ok(versioned.record)
}

/// Big-endian row key for prekey ids, so scans return ids in order.
pub fn prekey_row(id: u32) -> Vec<u8> {
    id.to_be_bytes().to_vec()
}

/// The device's long-term identity.
#[derive(Clone, Serialize, Deserialize)]
pub struct IdentityRecord {
    /// Ed25519 seed
    pub signing_seed: SecretBytes,
    /// X25519 agreement secret
    pub agreement_secret: SecretBytes,
    /// Registration id published in the bundle
    pub registration_id: u32,
    /// Creation time, seconds since the Unix epoch
    pub created_at_secs: u64,
}

impl IdentityRecord {
    /// Rebuild the identity key pair.
    pub fn key_pair(&self) -> IdentityKeyPair {
        IdentityKeyPair::from_seeds(*self.signing_seed.as_bytes(), *self.agreement_secret.as_bytes())
    }
}

impl Validate for IdentityRecord {
    fn validate(&self) -> Result<(), String> {
        if !(1..=MAX_REGISTRATION_ID).contains(&self.registration_id) {
            return Err(format!("registration id {} out of range", self.registration_id));
        }
        Ok(())
    }
}

/// Signed prekey with its identity signature.
#[derive(Clone, Serialize, Deserialize)]
pub struct SignedPreKeyRecord {
    /// Prekey id
    pub id: u32,
    /// Key pair (stored as its secret half)
    pub key_pair: KeyPair,
    /// Ed25519 signature over the public key bytes
    pub signature: Vec<u8>,
    /// Creation time, seconds since the Unix epoch
    pub created_at_secs: u64,
}

impl Validate for SignedPreKeyRecord {
    fn validate(&self) -> Result<(), String> {
        if self.signature.len() != SIGNATURE_SIZE {
            return Err(format!("signature must be {SIGNATURE_SIZE} bytes"));
        }
        Ok(())
    }
}

/// One unconsumed one-time prekey.
#[derive(Clone, Serialize, Deserialize)]
pub struct OneTimePreKeyRecord {
    /// Prekey id
    pub id: u32,
    /// Key pair (stored as its secret half)
    pub key_pair: KeyPair,
}

impl Validate for OneTimePreKeyRecord {
    fn validate(&self) -> Result<(), String> {
        Ok(())
    }
}

/// Key store bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyStoreMeta {
    /// Id assigned to the next generated one-time prekey
    pub next_one_time_prekey_id: u32,
}

impl Validate for KeyStoreMeta {
    fn validate(&self) -> Result<(), String> {
        Ok(())
    }
}

/// Initiator material embedded in the first message of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingHandshake {
    /// Initiator's registration id
    pub registration_id: u32,
    /// Responder's signed prekey id that was used
    pub signed_prekey_id: u32,
    /// Responder's one-time prekey id that was claimed, if any
    pub one_time_prekey_id: Option<u32>,
    /// Initiator's ephemeral public key
    pub base_key: PublicKey,
    /// Initiator's identity key
    pub identity_key: IdentityKey,
}

/// Which side of the handshake this device played.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionRole {
    /// Fetched the peer's bundle
    Initiator,
    /// Derived from a received handshake message
    Responder,
}

/// Established session with one peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Ratchet state
    pub state: RatchetState,
    /// Which side established the session
    pub role: SessionRole,
    /// Initiator's base key; identifies the handshake this session came from
    pub base_key: PublicKey,
    /// Peer identity key at establishment
    pub remote_identity: IdentityKey,
    /// Peer registration id
    pub remote_registration_id: u32,
    /// Present until the first message has been encrypted
    pub pending_handshake: Option<PendingHandshake>,
    /// Establishment time, seconds since the Unix epoch
    pub established_at_secs: u64,
}

impl Validate for SessionRecord {
    fn validate(&self) -> Result<(), String> {
        if self.pending_handshake.is_some() && self.role != SessionRole::Initiator {
            return Err("responder session with pending handshake".to_string());
        }
        if !self.state.can_send() && self.role == SessionRole::Initiator {
            return Err("initiator session without sending chain".to_string());
        }
        Ok(())
    }
}

/// Trust decision for a peer identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrustDecision {
    /// Verified out of band
    Trusted,
    /// Accepted on first use
    Unverified,
}

/// Identity key last observed for a peer and the decision about it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustEntry {
    /// Identity key
    pub identity_key: IdentityKey,
    /// Trust decision
    pub decision: TrustDecision,
}

impl Validate for TrustEntry {
    fn validate(&self) -> Result<(), String> {
        Ok(())
    }
}

/// Base keys of handshakes already accepted from one peer, oldest first.
///
/// Outlives the session it created, so a replayed handshake is refused
/// even after the peer moved on to a newer one.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptedHandshakes {
    /// At most [`MAX_ACCEPTED_HANDSHAKES`] base keys
    pub base_keys: Vec<PublicKey>,
}

impl AcceptedHandshakes {
    /// True if a handshake with `base_key` was accepted before.
    pub fn contains(&self, base_key: &PublicKey) -> bool {
        self.base_keys.contains(base_key)
    }

    /// Remember `base_key`, forgetting the oldest entries past the bound.
    pub fn insert(&mut self, base_key: PublicKey) {
        if self.contains(&base_key) {
            return;
        }
        self.base_keys.push(base_key);
        let excess = self.base_keys.len().saturating_sub(MAX_ACCEPTED_HANDSHAKES);
        self.base_keys.drain(..excess);
    }
}

impl Validate for AcceptedHandshakes {
    fn validate(&self) -> Result<(), String> {
        if self.base_keys.len() > MAX_ACCEPTED_HANDSHAKES {
            return Err(format!("more than {MAX_ACCEPTED_HANDSHAKES} accepted handshakes"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity_record(registration_id: u32) -> IdentityRecord {
        IdentityRecord {
            signing_seed: SecretBytes::new([1; 32]),
            agreement_secret: SecretBytes::new([2; 32]),
            registration_id,
            created_at_secs: 1_700_000_000,
        }
    }

    #[test]
    fn identity_record_restores_same_keys() {
        let record = identity_record(42);
        let decoded: IdentityRecord = decode(&encode(&record).unwrap()).unwrap();

        assert_eq!(decoded.key_pair().public_key(), record.key_pair().public_key());
        assert_eq!(decoded.registration_id, 42);
    }

    #[test]
    fn invalid_registration_id_is_corrupt() {
        let bytes = encode(&identity_record(0)).unwrap();

        assert!(matches!(decode::<IdentityRecord>(&bytes), Err(StorageError::Corrupt(_))));
    }

    #[test]
    fn unknown_version_is_corrupt() {
        #[derive(Serialize)]
        struct Future<'a> {
            version: u8,
            record: &'a KeyStoreMeta,
        }

        let mut bytes = Vec::new();
        let meta = KeyStoreMeta { next_one_time_prekey_id: 1010 };
        ciborium::into_writer(&Future { version: 2, record: &meta }, &mut bytes).unwrap();

        assert!(matches!(decode::<KeyStoreMeta>(&bytes), Err(StorageError::Corrupt(_))));
    }

    #[test]
    fn garbage_is_a_serialization_error() {
        assert!(matches!(
            decode::<TrustEntry>(&[0xFF, 0x00, 0x13]),
            Err(StorageError::Serialization(_))
        ));
    }

    #[test]
    fn truncated_signature_is_corrupt() {
        let record = SignedPreKeyRecord {
            id: 1,
            key_pair: KeyPair::from_secret_bytes([3; 32]),
            signature: vec![0; 63],
            created_at_secs: 0,
        };

        assert!(matches!(
            decode::<SignedPreKeyRecord>(&encode(&record).unwrap()),
            Err(StorageError::Corrupt(_))
        ));
    }

    #[test]
    fn accepted_handshakes_forget_oldest() {
        let key = |i: u8| KeyPair::from_secret_bytes([i; 32]).public_key();
        let mut accepted = AcceptedHandshakes::default();

        for i in 0..=MAX_ACCEPTED_HANDSHAKES as u8 {
            accepted.insert(key(i));
        }
        accepted.insert(key(5));

        assert_eq!(accepted.base_keys.len(), MAX_ACCEPTED_HANDSHAKES);
        assert!(!accepted.contains(&key(0)));
        assert!(accepted.contains(&key(1)));
        assert!(accepted.contains(&key(MAX_ACCEPTED_HANDSHAKES as u8)));
        assert!(decode::<AcceptedHandshakes>(&encode(&accepted).unwrap()).is_ok());
    }

    #[test]
    fn prekey_rows_sort_by_id() {
        assert!(prekey_row(999) < prekey_row(1000));
        assert!(prekey_row(1000) < prekey_row(65536));
    }
}
