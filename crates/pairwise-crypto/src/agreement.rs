//! Asynchronous initial key agreement (X3DH).
//!
//! The initiator combines its identity key and a fresh ephemeral ("base")
//! key with the responder's published identity key, signed prekey and
//! optional one-time prekey:
//!
//! ```text
//! DH1 = DH(IK_a, SPK_b)
//! DH2 = DH(EK_a, IK_b)
//! DH3 = DH(EK_a, SPK_b)
//! DH4 = DH(EK_a, OPK_b)        (only when a one-time prekey was used)
//! SK  = HKDF(0xFF * 32 || DH1 || DH2 || DH3 [|| DH4])
//! ```
//!
//! The responder mirrors the computation with its private halves. Signature
//! verification of the signed prekey is the caller's job and must happen
//! before [`initiate`].

use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::Zeroize;

use crate::{
    error::CryptoError,
    identity::{IDENTITY_KEY_SIZE, IdentityKey, IdentityKeyPair},
    keys::{KEY_SIZE, KeyPair, PublicKey, SecretBytes},
};

/// HKDF info label for the initial shared secret
const AGREEMENT_LABEL: &[u8] = b"pairwiseX3DHv1";

/// Output of the key agreement.
pub struct AgreedSecret {
    shared_secret: SecretBytes,
    associated_data: Vec<u8>,
}

impl AgreedSecret {
    /// 32-byte shared secret, the initial root key.
    pub fn shared_secret(&self) -> &SecretBytes {
        &self.shared_secret
    }

    /// `initiator identity || responder identity`, bound into every message.
    pub fn associated_data(&self) -> &[u8] {
        &self.associated_data
    }
}

/// Initiator side.
///
/// # Errors
///
/// - `InvalidKey` if any peer key yields a degenerate DH output
pub fn initiate(
    identity: &IdentityKeyPair,
    base_key: &KeyPair,
    their_identity: &IdentityKey,
    their_signed_prekey: &PublicKey,
    their_one_time_prekey: Option<&PublicKey>,
) -> Result<AgreedSecret, CryptoError> {
    let mut outputs = vec![
        identity.agreement().diffie_hellman(their_signed_prekey)?,
        base_key.diffie_hellman(their_identity.agreement_key())?,
        base_key.diffie_hellman(their_signed_prekey)?,
    ];
    if let Some(one_time) = their_one_time_prekey {
        outputs.push(base_key.diffie_hellman(one_time)?);
    }

    Ok(AgreedSecret {
        shared_secret: derive_shared_secret(&outputs),
        associated_data: associated_data(&identity.public_key(), their_identity),
    })
}

/// Responder side.
///
/// # Errors
///
/// - `InvalidKey` if the initiator's keys yield a degenerate DH output
pub fn respond(
    identity: &IdentityKeyPair,
    signed_prekey: &KeyPair,
    one_time_prekey: Option<&KeyPair>,
    their_identity: &IdentityKey,
    their_base_key: &PublicKey,
) -> Result<AgreedSecret, CryptoError> {
    let mut outputs = vec![
        signed_prekey.diffie_hellman(their_identity.agreement_key())?,
        identity.agreement().diffie_hellman(their_base_key)?,
        signed_prekey.diffie_hellman(their_base_key)?,
    ];
    if let Some(one_time) = one_time_prekey {
        outputs.push(one_time.diffie_hellman(their_base_key)?);
    }

    Ok(AgreedSecret {
        shared_secret: derive_shared_secret(&outputs),
        associated_data: associated_data(their_identity, &identity.public_key()),
    })
}

fn derive_shared_secret(outputs: &[SecretBytes]) -> SecretBytes {
    let mut ikm = Vec::with_capacity(KEY_SIZE * (outputs.len() + 1));
    ikm.extend_from_slice(&[0xFF; KEY_SIZE]);
    for output in outputs {
        ikm.extend_from_slice(output.as_bytes());
    }

    let hkdf = Hkdf::<Sha256>::new(Some(&[0u8; KEY_SIZE][..]), &ikm);
    let mut shared = [0u8; KEY_SIZE];
    let Ok(()) = hkdf.expand(AGREEMENT_LABEL, &mut shared) else {
        unreachable!("32 bytes is a valid HKDF-SHA256 output length");
    };
    ikm.zeroize();

    SecretBytes::new(shared)
}

fn associated_data(initiator: &IdentityKey, responder: &IdentityKey) -> Vec<u8> {
    let mut ad = Vec::with_capacity(2 * IDENTITY_KEY_SIZE);
    ad.extend_from_slice(&initiator.to_bytes());
    ad.extend_from_slice(&responder.to_bytes());
    ad
}
