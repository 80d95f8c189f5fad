//! Conversations over storage that fails at random.
//!
//! Every operation either succeeds or fails with a storage error and leaves
//! the stored state as it was, so retrying the same call always converges and
//! every envelope that was handed out decrypts to its plaintext.

use std::{future::Future, sync::Arc};

use pairwise_core::{
    ChaoticStorage, MemoryDirectory, MemoryStorage, MessageCipher, PeerAddress, SessionConfig,
    SessionError, SessionProtocol, Table, env::test_utils::MockEnv, key_store::KeyStore,
};
use proptest::prelude::*;

type Chaotic = ChaoticStorage<MemoryStorage>;
type Cipher = MessageCipher<Chaotic, MockEnv, MemoryDirectory>;

const ATTEMPTS: usize = 200;

fn is_storage_fault(err: &SessionError) -> bool {
    matches!(err, SessionError::StorageUnavailable(_) | SessionError::PersistFailed(_))
}

async fn until_ok<T, F, Fut>(mut operation: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, SessionError>>,
{
    for _ in 0..ATTEMPTS {
        match operation().await {
            Ok(value) => return value,
            Err(err) => assert!(is_storage_fault(&err), "unexpected error: {err}"),
        }
    }
    panic!("no success after {ATTEMPTS} attempts");
}

fn chaotic_cipher(storage: &Chaotic, seed: u64, directory: &MemoryDirectory) -> Arc<Cipher> {
    let env = MockEnv::with_seed(seed);
    for _ in 0..ATTEMPTS {
        match KeyStore::initialize(storage.clone(), env.clone(), SessionConfig::default()) {
            Ok(key_store) => {
                let protocol = SessionProtocol::new(
                    Arc::new(key_store),
                    storage.clone(),
                    Arc::new(directory.clone()),
                    env,
                );
                return Arc::new(MessageCipher::new(Arc::new(protocol)));
            },
            Err(err) => assert!(is_storage_fault(&err), "unexpected error: {err}"),
        }
    }
    panic!("key store never initialized");
}

fn block_on<F: Future>(future: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(future)
}

#[test]
fn prop_conversation_survives_storage_faults() {
    proptest!(ProptestConfig::with_cases(24), |(
        failure_rate in 0.0f64..0.3,
        seed in any::<u64>(),
        messages in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..64), 1..20)
    )| {
        block_on(async {
            let directory = MemoryDirectory::new();
            let x_storage = ChaoticStorage::with_seed(MemoryStorage::new(), failure_rate, seed);
            let y_storage =
                ChaoticStorage::with_seed(MemoryStorage::new(), failure_rate, seed.rotate_left(17));
            let x_cipher = chaotic_cipher(&x_storage, seed, &directory);
            let y_cipher = chaotic_cipher(&y_storage, seed.wrapping_add(1), &directory);

            let x = PeerAddress::new("x", 1);
            let y = PeerAddress::new("y", 1);
            until_ok(|| x_cipher.protocol().publish(&x)).await;

            for (i, plaintext) in messages.iter().enumerate() {
                // Y opens; after that the direction alternates
                let (from, to, from_addr, to_addr) = if i % 2 == 0 {
                    (&y_cipher, &x_cipher, &y, &x)
                } else {
                    (&x_cipher, &y_cipher, &x, &y)
                };
                let envelope = until_ok(|| from.encrypt(to_addr, plaintext)).await;
                let decrypted = until_ok(|| to.decrypt(from_addr, &envelope)).await;
                assert_eq!(&decrypted, plaintext);
            }

            assert_eq!(y_storage.inner().row_count(Table::Sessions).unwrap(), 1);
            assert_eq!(x_storage.inner().row_count(Table::Sessions).unwrap(), 1);
            assert!(directory.consumed_count() >= 1);
        });
    });
}
