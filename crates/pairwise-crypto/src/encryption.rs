//! Message encryption using `XChaCha20-Poly1305`
//!
//! All functions are pure - random bytes must be provided by the caller.

use chacha20poly1305::{
    XChaCha20Poly1305, XNonce,
    aead::{Aead, KeyInit, Payload},
};

use crate::{error::CryptoError, ratchet::MessageKey};

/// Size of the `XChaCha20` nonce (24 bytes)
pub const NONCE_SIZE: usize = 24;

/// Size of the random suffix in the nonce (20 bytes)
pub const NONCE_RANDOM_SIZE: usize = 20;

/// Poly1305 tag size (16 bytes)
pub const TAG_SIZE: usize = 16;

/// Encrypt `plaintext` under a single-use message key.
///
/// `associated_data` is authenticated but not encrypted; callers bind the
/// session identities and the encoded ratchet header here.
pub fn seal(
    message_key: &MessageKey,
    nonce: &[u8; NONCE_SIZE],
    associated_data: &[u8],
    plaintext: &[u8],
) -> Vec<u8> {
    let cipher = XChaCha20Poly1305::new(message_key.key().into());

    let Ok(ciphertext) = cipher
        .encrypt(XNonce::from_slice(nonce), Payload { msg: plaintext, aad: associated_data })
    else {
        unreachable!("XChaCha20-Poly1305 encryption cannot fail with valid inputs");
    };

    ciphertext
}

/// Decrypt and authenticate a ciphertext.
///
/// # Errors
///
/// - `DecryptionFailed`: If authentication tag, key or associated data is
///   incorrect (tamper)
pub fn open(
    message_key: &MessageKey,
    nonce: &[u8; NONCE_SIZE],
    associated_data: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = XChaCha20Poly1305::new(message_key.key().into());

    cipher
        .decrypt(XNonce::from_slice(nonce), Payload { msg: ciphertext, aad: associated_data })
        .map_err(|_| CryptoError::DecryptionFailed { reason: "authentication failed".to_string() })
}

/// Build a 24-byte nonce for `XChaCha20`.
///
/// Structure:
/// - bytes 0-3: message counter (big-endian)
/// - bytes 4-23: random suffix (caller-provided)
pub fn build_nonce(counter: u32, random_suffix: [u8; NONCE_RANDOM_SIZE]) -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    nonce[0..4].copy_from_slice(&counter.to_be_bytes());
    nonce[4..].copy_from_slice(&random_suffix);
    nonce
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{keys::SecretBytes, ratchet::SymmetricRatchet};

    fn test_message_key(seed: u8) -> MessageKey {
        let mut ratchet = SymmetricRatchet::new(SecretBytes::new([seed; 32]));
        ratchet.next_key().unwrap()
    }

    #[test]
    fn seal_open_roundtrip() {
        let key = test_message_key(1);
        let nonce = build_nonce(0, [0xAB; NONCE_RANDOM_SIZE]);

        let ciphertext = seal(&key, &nonce, b"ad", b"Hello, World!");
        let plaintext = open(&key, &nonce, b"ad", &ciphertext).unwrap();

        assert_eq!(plaintext, b"Hello, World!");
    }

    #[test]
    fn ciphertext_is_plaintext_plus_tag() {
        let key = test_message_key(1);
        let nonce = build_nonce(0, [0; NONCE_RANDOM_SIZE]);

        let ciphertext = seal(&key, &nonce, b"", b"test message");
        assert_eq!(ciphertext.len(), b"test message".len() + TAG_SIZE);
    }

    #[test]
    fn empty_plaintext_roundtrip() {
        let key = test_message_key(1);
        let nonce = build_nonce(7, [1; NONCE_RANDOM_SIZE]);

        let ciphertext = seal(&key, &nonce, b"ad", b"");
        assert_eq!(open(&key, &nonce, b"ad", &ciphertext).unwrap(), b"");
    }

    #[test]
    fn wrong_key_fails() {
        let nonce = build_nonce(0, [0; NONCE_RANDOM_SIZE]);
        let ciphertext = seal(&test_message_key(1), &nonce, b"ad", b"secret");

        let result = open(&test_message_key(2), &nonce, b"ad", &ciphertext);
        assert!(matches!(
            result,
            Err(CryptoError::DecryptionFailed { reason }) if reason.contains("authentication")
        ));
    }

    #[test]
    fn wrong_associated_data_fails() {
        let key = test_message_key(1);
        let nonce = build_nonce(0, [0; NONCE_RANDOM_SIZE]);
        let ciphertext = seal(&key, &nonce, b"alice|bob", b"secret");

        assert!(open(&key, &nonce, b"alice|eve", &ciphertext).is_err());
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let key = test_message_key(1);
        let nonce = build_nonce(0, [0; NONCE_RANDOM_SIZE]);
        let mut ciphertext = seal(&key, &nonce, b"ad", b"original message");

        ciphertext[0] ^= 0xFF;

        assert!(open(&key, &nonce, b"ad", &ciphertext).is_err());
    }

    #[test]
    fn nonce_structure() {
        let nonce = build_nonce(0x0102_0304, [0xAB; NONCE_RANDOM_SIZE]);

        assert_eq!(&nonce[0..4], &[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(&nonce[4..24], &[0xAB; 20]);
    }
}
