//! Property-based tests for the double ratchet
//!
//! 1. **Round-trip**: every message decrypts to its plaintext, in any
//!    delivery order within a chain
//! 2. **Single use**: a delivered message never decrypts a second time
//! 3. **Integrity**: flipping any byte of the wire encoding is rejected and
//!    leaves the receiver able to read the original

use pairwise_crypto::{
    IdentityKeyPair, KeyPair, NONCE_RANDOM_SIZE, RatchetMessage, RatchetState, agreement,
};
use proptest::prelude::*;

fn seed32() -> impl Strategy<Value = [u8; 32]> {
    prop::collection::vec(any::<u8>(), 32..=32).prop_map(|v| {
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&v);
        arr
    })
}

fn session(alice_seed: [u8; 32], bob_seed: [u8; 32]) -> (RatchetState, RatchetState) {
    let alice_id = IdentityKeyPair::from_seeds(alice_seed, [1; 32]);
    let bob_id = IdentityKeyPair::from_seeds(bob_seed, [2; 32]);
    let spk = KeyPair::from_secret_bytes([3; 32]);
    let otk = KeyPair::from_secret_bytes([4; 32]);
    let base = KeyPair::from_secret_bytes([5; 32]);

    let a = agreement::initiate(
        &alice_id,
        &base,
        &bob_id.public_key(),
        &spk.public_key(),
        Some(&otk.public_key()),
    )
    .unwrap();
    let b = agreement::respond(&bob_id, &spk, Some(&otk), &alice_id.public_key(), &base.public_key())
        .unwrap();

    let alice = RatchetState::init_initiator(&a, [6; 32], spk.public_key()).unwrap();
    let bob = RatchetState::init_responder(&b, spk);
    (alice, bob)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(50))]

    #[test]
    fn prop_any_delivery_order_decrypts(
        alice_seed in seed32(),
        bob_seed in seed32(),
        order in Just((0..12usize).collect::<Vec<_>>()).prop_shuffle(),
    ) {
        let (mut alice, mut bob) = session(alice_seed, bob_seed);
        let messages: Vec<RatchetMessage> = (0..12u8)
            .map(|i| alice.encrypt(&[i; 3], [i; NONCE_RANDOM_SIZE]).unwrap())
            .collect();

        for (step, &index) in order.iter().enumerate() {
            let plaintext = bob.decrypt(&messages[index], [step as u8; 32]).unwrap();
            prop_assert_eq!(plaintext, vec![index as u8; 3]);
        }
        prop_assert_eq!(bob.skipped_key_count(), 0);
    }

    #[test]
    fn prop_delivered_message_is_single_use(
        alice_seed in seed32(),
        bob_seed in seed32(),
        count in 1usize..8,
        replay in 0usize..8,
    ) {
        let replay = replay % count;
        let (mut alice, mut bob) = session(alice_seed, bob_seed);
        let messages: Vec<_> = (0..count)
            .map(|i| alice.encrypt(b"payload", [i as u8; NONCE_RANDOM_SIZE]).unwrap())
            .collect();

        for message in &messages {
            bob.decrypt(message, [9; 32]).unwrap();
        }

        let result = bob.decrypt(&messages[replay], [9; 32]);
        prop_assert!(result.is_err());
        prop_assert!(result.unwrap_err().is_decryption_failure());
    }

    #[test]
    fn prop_any_flipped_byte_is_rejected(
        plaintext in prop::collection::vec(any::<u8>(), 0..200),
        position in any::<prop::sample::Index>(),
        flip in 1u8..=255,
    ) {
        let (mut alice, mut bob) = session([7; 32], [8; 32]);
        let message = alice.encrypt(&plaintext, [0; NONCE_RANDOM_SIZE]).unwrap();
        let mut wire = message.encode();

        let index = position.index(wire.len());
        wire[index] ^= flip;

        if let Ok(tampered) = RatchetMessage::decode(&wire) {
            prop_assert!(bob.decrypt(&tampered, [1; 32]).is_err());
        }
        prop_assert_eq!(bob.decrypt(&message, [1; 32]).unwrap(), plaintext);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(20))]

    #[test]
    fn prop_alternating_conversation(turns in prop::collection::vec(1usize..4, 1..10)) {
        let (mut alice, mut bob) = session([1; 32], [2; 32]);

        for (turn, burst) in turns.iter().enumerate() {
            let alice_speaks = turn % 2 == 0;
            for i in 0..*burst {
                let text = format!("turn {turn} message {i}");
                let seed = [(turn * 4 + i) as u8; 32];
                if alice_speaks {
                    let message = alice.encrypt(text.as_bytes(), [i as u8; NONCE_RANDOM_SIZE]).unwrap();
                    prop_assert_eq!(bob.decrypt(&message, seed).unwrap(), text.into_bytes());
                } else {
                    let message = bob.encrypt(text.as_bytes(), [i as u8; NONCE_RANDOM_SIZE]).unwrap();
                    prop_assert_eq!(alice.decrypt(&message, seed).unwrap(), text.into_bytes());
                }
            }
        }
    }
}
