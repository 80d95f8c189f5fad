//! Concurrent establishment and racing initiators.

use std::sync::Arc;

use async_trait::async_trait;
use pairwise_core::{
    DirectoryError, Establishment, KeyBundle, KeyDirectory, MemoryDirectory, MemoryStorage,
    MessageCipher, MessageType, OneTimePreKeyPolicy, PeerAddress, PublishedBundle,
    SessionConfig, SessionError, SessionProtocol, env::test_utils::MockEnv,
    key_store::KeyStore,
};

fn x() -> PeerAddress {
    PeerAddress::new("x", 1)
}

fn y() -> PeerAddress {
    PeerAddress::new("y", 1)
}

fn z() -> PeerAddress {
    PeerAddress::new("z", 1)
}

fn cipher_with<D: KeyDirectory>(
    seed: u64,
    directory: D,
    config: SessionConfig,
) -> Arc<MessageCipher<MemoryStorage, MockEnv, D>> {
    let storage = MemoryStorage::new();
    let env = MockEnv::with_seed(seed);
    let key_store = Arc::new(KeyStore::initialize(storage.clone(), env.clone(), config).unwrap());
    let protocol = SessionProtocol::new(key_store, storage, Arc::new(directory), env);
    Arc::new(MessageCipher::new(Arc::new(protocol)))
}

/// Directory whose fetches all return the bundle captured at construction,
/// as if every initiator read it before anyone claimed.
struct StaleDirectory {
    inner: MemoryDirectory,
    snapshot: KeyBundle,
}

impl StaleDirectory {
    async fn capture(inner: &MemoryDirectory, address: &PeerAddress) -> Self {
        let snapshot = inner.fetch(address).await.unwrap().unwrap();
        Self { inner: inner.clone(), snapshot }
    }
}

#[async_trait]
impl KeyDirectory for StaleDirectory {
    async fn publish(
        &self,
        address: &PeerAddress,
        bundle: PublishedBundle,
    ) -> Result<(), DirectoryError> {
        self.inner.publish(address, bundle).await
    }

    async fn fetch(&self, _address: &PeerAddress) -> Result<Option<KeyBundle>, DirectoryError> {
        Ok(Some(self.snapshot.clone()))
    }

    async fn mark_consumed(
        &self,
        address: &PeerAddress,
        prekey_id: u32,
    ) -> Result<bool, DirectoryError> {
        self.inner.mark_consumed(address, prekey_id).await
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_encrypts_establish_once() {
    let directory = MemoryDirectory::new();
    let x_cipher = cipher_with(1, directory.clone(), SessionConfig::default());
    x_cipher.protocol().publish(&x()).await.unwrap();
    let y_cipher = cipher_with(2, directory.clone(), SessionConfig::default());

    let mut tasks = Vec::new();
    for i in 0..20u8 {
        let y_cipher = Arc::clone(&y_cipher);
        tasks.push(tokio::spawn(async move {
            (i, y_cipher.encrypt(&x(), &[i]).await.unwrap())
        }));
    }
    let mut sent = Vec::new();
    for task in tasks {
        sent.push(task.await.unwrap());
    }

    assert_eq!(directory.fetch_count(), 1);
    assert_eq!(directory.consumed_count(), 1);

    let (handshakes, ordinary): (Vec<_>, Vec<_>) = sent
        .into_iter()
        .partition(|(_, envelope)| envelope.message_type == MessageType::HandshakeMessage);
    assert_eq!(handshakes.len(), 1);

    for (i, envelope) in handshakes.iter().chain(ordinary.iter()) {
        assert_eq!(x_cipher.decrypt(&y(), envelope).await.unwrap(), vec![*i]);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_decrypts_from_many_peers() {
    let directory = MemoryDirectory::new();
    let x_cipher = cipher_with(1, directory.clone(), SessionConfig::default());
    x_cipher.protocol().publish(&x()).await.unwrap();

    let mut tasks = Vec::new();
    for device in 1..=8u32 {
        let directory = directory.clone();
        let x_cipher = Arc::clone(&x_cipher);
        tasks.push(tokio::spawn(async move {
            let sender = cipher_with(100 + u64::from(device), directory, SessionConfig::default());
            let peer = PeerAddress::new("peer", device);
            for i in 0..5u8 {
                let envelope = sender.encrypt(&x(), &[i]).await.unwrap();
                assert_eq!(x_cipher.decrypt(&peer, &envelope).await.unwrap(), vec![i]);
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    // Senders that lost a claim fell back; every claimed prekey is gone locally too
    let remaining = x_cipher.protocol().key_store().one_time_prekey_count().unwrap();
    assert!(directory.consumed_count() >= 1);
    assert_eq!(directory.consumed_count() + remaining, 10);
    assert_eq!(directory.published_prekey_ids(&x()).unwrap().len(), remaining);
}

#[tokio::test]
async fn test_racing_initiators_never_share_a_prekey() {
    let directory = MemoryDirectory::new();
    let x_cipher = cipher_with(1, directory.clone(), SessionConfig::default());
    x_cipher.protocol().publish(&x()).await.unwrap();

    // Both read the bundle offering 1000 before either claims it
    let y_cipher =
        cipher_with(2, StaleDirectory::capture(&directory, &x()).await, SessionConfig::default());
    let z_cipher =
        cipher_with(3, StaleDirectory::capture(&directory, &x()).await, SessionConfig::default());

    assert_eq!(
        y_cipher.establish(&x()).await.unwrap(),
        Establishment::Created { one_time_prekey_id: Some(1000) }
    );
    assert_eq!(
        z_cipher.establish(&x()).await.unwrap(),
        Establishment::Created { one_time_prekey_id: None }
    );

    // X accepts both handshakes
    let from_y = y_cipher.encrypt(&x(), b"from y").await.unwrap();
    let from_z = z_cipher.encrypt(&x(), b"from z").await.unwrap();
    assert_eq!(x_cipher.decrypt(&y(), &from_y).await.unwrap(), b"from y");
    assert_eq!(x_cipher.decrypt(&z(), &from_z).await.unwrap(), b"from z");

    assert_eq!(directory.consumed_count(), 1);
    assert!(x_cipher.protocol().key_store().one_time_prekey(1000).unwrap().is_none());
}

#[tokio::test]
async fn test_racing_initiator_with_required_policy() {
    let directory = MemoryDirectory::new();
    let x_cipher = cipher_with(1, directory.clone(), SessionConfig::default());
    x_cipher.protocol().publish(&x()).await.unwrap();

    let required = SessionConfig {
        one_time_prekey_policy: OneTimePreKeyPolicy::Required,
        ..SessionConfig::default()
    };
    let y_cipher =
        cipher_with(2, StaleDirectory::capture(&directory, &x()).await, SessionConfig::default());
    let z_cipher = cipher_with(3, StaleDirectory::capture(&directory, &x()).await, required);

    y_cipher.establish(&x()).await.unwrap();
    assert_eq!(z_cipher.establish(&x()).await, Err(SessionError::NoKeyBundle { peer: x() }));
    assert!(!z_cipher.protocol().sessions().has(&x()).unwrap());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_responder_takes_each_prekey_once() {
    // Two directories that both believe they handed out 1000
    let first = MemoryDirectory::new();
    let second = MemoryDirectory::new();
    let x_cipher = cipher_with(1, first.clone(), SessionConfig::default());
    x_cipher.protocol().publish(&x()).await.unwrap();
    let bundle = x_cipher.protocol().key_store().export_public_bundle().unwrap();
    second.publish(&x(), bundle).await.unwrap();

    let y_cipher = cipher_with(2, first, SessionConfig::default());
    let z_cipher = cipher_with(3, second, SessionConfig::default());
    let from_y = y_cipher.encrypt(&x(), b"from y").await.unwrap();
    let from_z = z_cipher.encrypt(&x(), b"from z").await.unwrap();

    let tasks: Vec<_> = [(y(), from_y), (z(), from_z)]
        .into_iter()
        .map(|(peer, envelope)| {
            let x_cipher = Arc::clone(&x_cipher);
            tokio::spawn(async move { x_cipher.decrypt(&peer, &envelope).await })
        })
        .collect();
    let mut results = Vec::new();
    for task in tasks {
        results.push(task.await.unwrap());
    }

    assert_eq!(results.iter().filter(|result| result.is_ok()).count(), 1);
    assert!(results.contains(&Err(SessionError::UnknownPreKeyId { prekey_id: 1000 })));
    assert!(x_cipher.protocol().key_store().one_time_prekey(1000).unwrap().is_none());
}
