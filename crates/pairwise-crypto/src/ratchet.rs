//! KDF chains.
//!
//! A [`SymmetricRatchet`] is one sending or receiving chain: every step turns
//! the chain key into a message key plus the next chain key, and the old
//! chain key is dropped. Message keys are numbered by the chain counter that
//! produced them, which is the counter carried in the message header.
//!
//! [`kdf_root`] is the other half of the double ratchet: it mixes a
//! Diffie-Hellman output into the root key and yields a fresh chain key.

use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::Zeroize;

use crate::{
    error::CryptoError,
    keys::{KEY_SIZE, SecretBytes},
};

type HmacSha256 = Hmac<Sha256>;

/// HMAC input for the next chain key
const CHAIN_STEP: &[u8] = &[0x02];

/// HMAC input for the message key
const MESSAGE_STEP: &[u8] = &[0x01];

/// HKDF info for root key steps
const ROOT_INFO: &[u8] = b"pairwiseRatchetV1";

/// Single-use AEAD key for the message at `counter`.
#[derive(Clone)]
pub struct MessageKey {
    key: [u8; KEY_SIZE],
    counter: u32,
}

impl MessageKey {
    pub(crate) fn from_parts(key: &SecretBytes, counter: u32) -> Self {
        Self { key: *key.as_bytes(), counter }
    }

    /// XChaCha20-Poly1305 key.
    pub fn key(&self) -> &[u8; KEY_SIZE] {
        &self.key
    }

    /// Chain position this key belongs to.
    pub fn counter(&self) -> u32 {
        self.counter
    }
}

impl Drop for MessageKey {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

/// One KDF chain (sending or receiving).
#[derive(Clone, Serialize, Deserialize)]
pub struct SymmetricRatchet {
    chain_key: SecretBytes,
    /// Counter of the next message key
    counter: u32,
}

impl SymmetricRatchet {
    /// Chain starting at counter 0.
    pub fn new(chain_key: SecretBytes) -> Self {
        Self { chain_key, counter: 0 }
    }

    /// Counter of the next key this chain will produce.
    pub fn counter(&self) -> u32 {
        self.counter
    }

    /// Produce the key for the current counter and step the chain.
    ///
    /// # Errors
    ///
    /// - `CounterOverflow` once the counter reached `u32::MAX`; the chain is
    ///   unchanged
    pub fn next_key(&mut self) -> Result<MessageKey, CryptoError> {
        if self.counter == u32::MAX {
            return Err(CryptoError::CounterOverflow { current: self.counter });
        }

        let key = MessageKey { key: self.step(MESSAGE_STEP), counter: self.counter };
        self.chain_key = SecretBytes::new(self.step(CHAIN_STEP));
        self.counter += 1;

        Ok(key)
    }

    /// Step the chain up to `counter` and return its key, along with the keys
    /// passed over on the way (for messages still in flight).
    ///
    /// # Errors
    ///
    /// - `RatchetTooFarBehind` if `counter` was already passed
    /// - `RatchetTooFarAhead` if more than `max_skip` keys would be skipped
    pub fn key_for(
        &mut self,
        counter: u32,
        max_skip: u32,
    ) -> Result<(MessageKey, Vec<MessageKey>), CryptoError> {
        let current = self.counter;
        if counter < current {
            return Err(CryptoError::RatchetTooFarBehind { current, requested: counter });
        }
        if counter - current > max_skip {
            return Err(CryptoError::RatchetTooFarAhead { current, requested: counter });
        }

        let mut skipped = Vec::with_capacity((counter - current) as usize);
        while self.counter < counter {
            skipped.push(self.next_key()?);
        }
        Ok((self.next_key()?, skipped))
    }

    fn step(&self, input: &[u8]) -> [u8; KEY_SIZE] {
        let Ok(mut mac) = HmacSha256::new_from_slice(self.chain_key.as_bytes()) else {
            unreachable!("HMAC-SHA256 accepts any key size");
        };
        mac.update(input);

        let mut output = [0u8; KEY_SIZE];
        output.copy_from_slice(&mac.finalize().into_bytes());
        output
    }
}

/// Mix a Diffie-Hellman output into the root key.
///
/// Returns `(next_root_key, chain_key)`.
pub fn kdf_root(root_key: &SecretBytes, dh_output: &SecretBytes) -> (SecretBytes, SecretBytes) {
    let hkdf = Hkdf::<Sha256>::new(Some(root_key.as_bytes().as_slice()), dh_output.as_bytes());

    let mut okm = [0u8; 2 * KEY_SIZE];
    let Ok(()) = hkdf.expand(ROOT_INFO, &mut okm) else {
        unreachable!("64 bytes is a valid HKDF-SHA256 output length");
    };

    let mut next_root = [0u8; KEY_SIZE];
    let mut chain = [0u8; KEY_SIZE];
    next_root.copy_from_slice(&okm[..KEY_SIZE]);
    chain.copy_from_slice(&okm[KEY_SIZE..]);
    okm.zeroize();

    (SecretBytes::new(next_root), SecretBytes::new(chain))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain() -> SymmetricRatchet {
        SymmetricRatchet::new(SecretBytes::new([7; KEY_SIZE]))
    }

    #[test]
    fn keys_are_numbered_by_counter() {
        let mut chain = chain();
        assert_eq!(chain.counter(), 0);

        let first = chain.next_key().unwrap();
        let second = chain.next_key().unwrap();

        assert_eq!((first.counter(), second.counter()), (0, 1));
        assert_eq!(chain.counter(), 2);
        assert_ne!(first.key(), second.key());
    }

    #[test]
    fn message_key_is_not_next_chain_key() {
        let mut chain = chain();
        let key = chain.next_key().unwrap();

        assert_ne!(key.key(), chain.chain_key.as_bytes());
    }

    #[test]
    fn both_sides_derive_the_same_chain() {
        let mut sender = chain();
        let mut receiver = chain();

        for _ in 0..16 {
            assert_eq!(sender.next_key().unwrap().key(), receiver.next_key().unwrap().key());
        }
    }

    #[test]
    fn key_for_returns_passed_over_keys() {
        let mut reference = chain();
        let expected: Vec<_> = (0..4).map(|_| reference.next_key().unwrap()).collect();

        let mut chain = chain();
        let (key, skipped) = chain.key_for(3, 10).unwrap();

        assert_eq!(key.key(), expected[3].key());
        assert_eq!(skipped.iter().map(MessageKey::counter).collect::<Vec<_>>(), vec![0, 1, 2]);
        assert_eq!(skipped[1].key(), expected[1].key());
        assert_eq!(chain.counter(), 4);
    }

    #[test]
    fn key_for_current_counter_skips_nothing() {
        let (key, skipped) = chain().key_for(0, 0).unwrap();

        assert_eq!(key.counter(), 0);
        assert!(skipped.is_empty());
    }

    #[test]
    fn key_for_rejects_passed_counter() {
        let mut chain = chain();
        chain.key_for(2, 10).unwrap();

        assert_eq!(
            chain.key_for(1, 10).err(),
            Some(CryptoError::RatchetTooFarBehind { current: 3, requested: 1 })
        );
    }

    #[test]
    fn key_for_rejects_large_gap_without_stepping() {
        let mut chain = chain();

        assert_eq!(
            chain.key_for(1001, 1000).err(),
            Some(CryptoError::RatchetTooFarAhead { current: 0, requested: 1001 })
        );
        assert_eq!(chain.counter(), 0);
    }

    #[test]
    fn exhausted_chain_refuses_to_step() {
        let mut chain = chain();
        chain.counter = u32::MAX;

        assert_eq!(
            chain.next_key().err(),
            Some(CryptoError::CounterOverflow { current: u32::MAX })
        );
        assert_eq!(chain.counter(), u32::MAX);
    }

    #[test]
    fn root_step_is_deterministic_and_split() {
        let root = SecretBytes::new([1; KEY_SIZE]);
        let dh = SecretBytes::new([2; KEY_SIZE]);

        let (next_root, chain_key) = kdf_root(&root, &dh);
        let (again_root, again_chain) = kdf_root(&root, &dh);

        assert_ne!(next_root.as_bytes(), chain_key.as_bytes());
        assert_ne!(next_root.as_bytes(), root.as_bytes());
        assert_eq!(next_root.as_bytes(), again_root.as_bytes());
        assert_eq!(chain_key.as_bytes(), again_chain.as_bytes());
    }
}
