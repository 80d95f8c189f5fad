//! Device-local key store.
//!
//! Owns the identity key pair, the active signed prekey and the pool of
//! unconsumed one-time prekeys. Everything lives in [`Storage`], so a restart
//! reloads the same keys.
//!
//! # Lifecycle
//!
//! ```text
//! initialize() ──► no identity on disk ──► generate identity + signed prekey
//!      │                                   + full one-time pool (one batch)
//!      └─────────► identity on disk ─────► load
//! ```
//!
//! One-time prekeys leave the pool when a responder session consumes them
//! (see `SessionProtocol`) or through [`KeyStore::remove_one_time_prekey`].
//! [`KeyStore::replenish_if_needed`] tops the pool back up; the caller then
//! republishes.
//!
//! Every read fails with `StorageUnavailable` when storage cannot be read;
//! the `# Errors` sections below list the other outcomes.

use std::sync::{Mutex, MutexGuard};

use pairwise_crypto::{IdentityKey, IdentityKeyPair, KeyPair, SecretBytes};
use tracing::{debug, info};

use crate::{
    bundle::{OneTimePreKeyPublic, PublishedBundle, SignedPreKeyPublic},
    config::SessionConfig,
    env::Environment,
    error::SessionError,
    records::{
        self, IDENTITY_ROW, IdentityRecord, KEY_STORE_META_ROW, KeyStoreMeta, MAX_REGISTRATION_ID,
        OneTimePreKeyRecord, SignedPreKeyRecord, prekey_row,
    },
    storage::{Storage, Table, WriteBatch},
};

/// Device-local key material.
pub struct KeyStore<S: Storage, E: Environment> {
    storage: S,
    env: E,
    config: SessionConfig,
    identity: IdentityKeyPair,
    registration_id: u32,
    signed_prekey: SignedPreKeyRecord,
    /// Serializes every change to the one-time prekey pool
    pool: Mutex<()>,
}

impl<S: Storage, E: Environment> KeyStore<S, E> {
    /// Load the device keys, generating them on first use.
    ///
    /// Idempotent: a second call against the same storage loads the keys the
    /// first call generated.
    ///
    /// # Errors
    ///
    /// - `StorageUnavailable` if storage cannot be read, holds corrupt key
    ///   records, or the first-use keys cannot be written
    pub fn initialize(storage: S, env: E, config: SessionConfig) -> Result<Self, SessionError> {
        let existing = storage.get(Table::Identity, IDENTITY_ROW).map_err(SessionError::storage)?;

        let (identity, signed_prekey) = match existing {
            Some(bytes) => {
                let identity: IdentityRecord =
                    records::decode(&bytes).map_err(SessionError::storage)?;
                let signed_prekey = Self::load_signed_prekey(&storage, config.signed_prekey_id)?;
                debug!(
                    registration_id = identity.registration_id,
                    signed_prekey_id = signed_prekey.id,
                    "Loaded device keys"
                );
                (identity, signed_prekey)
            },
            None => Self::generate(&storage, &env, &config)?,
        };

        Ok(Self {
            storage,
            env,
            config,
            registration_id: identity.registration_id,
            identity: identity.key_pair(),
            signed_prekey,
            pool: Mutex::new(()),
        })
    }

    fn load_signed_prekey(storage: &S, id: u32) -> Result<SignedPreKeyRecord, SessionError> {
        let bytes = storage
            .get(Table::SignedPreKeys, &prekey_row(id))
            .map_err(SessionError::storage)?
            .ok_or_else(|| {
                SessionError::StorageUnavailable(format!("signed prekey {id} missing"))
            })?;
        records::decode(&bytes).map_err(SessionError::storage)
    }

    fn generate(
        storage: &S,
        env: &E,
        config: &SessionConfig,
    ) -> Result<(IdentityRecord, SignedPreKeyRecord), SessionError> {
        let now = env.wall_clock_secs();
        let identity = IdentityRecord {
            signing_seed: SecretBytes::new(env.random_key_seed()),
            agreement_secret: SecretBytes::new(env.random_key_seed()),
            registration_id: env.random_u32() % MAX_REGISTRATION_ID + 1,
            created_at_secs: now,
        };
        let identity_keys = identity.key_pair();

        let key_pair = KeyPair::from_secret_bytes(env.random_key_seed());
        let signed_prekey = SignedPreKeyRecord {
            id: config.signed_prekey_id,
            signature: identity_keys.sign(key_pair.public_key().as_bytes()).to_vec(),
            key_pair,
            created_at_secs: now,
        };

        let mut batch = WriteBatch::new();
        batch
            .put(
                Table::Identity,
                IDENTITY_ROW.to_vec(),
                records::encode(&identity).map_err(SessionError::storage)?,
            )
            .put(
                Table::SignedPreKeys,
                prekey_row(signed_prekey.id),
                records::encode(&signed_prekey).map_err(SessionError::storage)?,
            );
        let next_id = generate_prekeys(
            &mut batch,
            env,
            config.first_one_time_prekey_id,
            config.one_time_prekey_pool_size,
        )?;
        put_meta(&mut batch, KeyStoreMeta { next_one_time_prekey_id: next_id })?;

        storage.commit(batch).map_err(SessionError::storage)?;

        info!(
            registration_id = identity.registration_id,
            signed_prekey_id = signed_prekey.id,
            one_time_prekeys = config.one_time_prekey_pool_size,
            "Generated device keys"
        );
        Ok((identity, signed_prekey))
    }

    /// Identity key pair.
    pub fn identity(&self) -> &IdentityKeyPair {
        &self.identity
    }

    /// Public identity key.
    pub fn identity_key(&self) -> IdentityKey {
        self.identity.public_key()
    }

    /// Registration id.
    pub fn registration_id(&self) -> u32 {
        self.registration_id
    }

    /// Active signed prekey id.
    pub fn signed_prekey_id(&self) -> u32 {
        self.signed_prekey.id
    }

    /// Active signed prekey pair.
    pub(crate) fn signed_prekey(&self) -> &KeyPair {
        &self.signed_prekey.key_pair
    }

    /// Configuration this store was opened with.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Public bundle for publication, with every unconsumed one-time prekey.
    pub fn export_public_bundle(&self) -> Result<PublishedBundle, SessionError> {
        let one_time_prekeys = self
            .one_time_prekeys()?
            .into_iter()
            .map(|record| OneTimePreKeyPublic {
                id: record.id,
                public_key: record.key_pair.public_key(),
            })
            .collect();

        Ok(PublishedBundle {
            identity_key: self.identity_key(),
            registration_id: self.registration_id,
            signed_prekey: SignedPreKeyPublic {
                id: self.signed_prekey.id,
                public_key: self.signed_prekey.key_pair.public_key(),
                signature: self.signed_prekey.signature.clone(),
            },
            one_time_prekeys,
        })
    }

    /// Look up an unconsumed one-time prekey.
    pub fn one_time_prekey(&self, id: u32) -> Result<Option<KeyPair>, SessionError> {
        let Some(bytes) = self
            .storage
            .get(Table::OneTimePreKeys, &prekey_row(id))
            .map_err(SessionError::storage)?
        else {
            return Ok(None);
        };
        let record: OneTimePreKeyRecord = records::decode(&bytes).map_err(SessionError::storage)?;
        Ok(Some(record.key_pair))
    }

    /// Take a one-time prekey out of the pool.
    ///
    /// # Errors
    ///
    /// - `UnknownPreKeyId` if it was already consumed or never existed
    /// - `PersistFailed` if the removal cannot be written
    pub fn consume_one_time_prekey(&self, id: u32) -> Result<KeyPair, SessionError> {
        let _pool = self.lock_pool()?;
        let key_pair =
            self.one_time_prekey(id)?.ok_or(SessionError::UnknownPreKeyId { prekey_id: id })?;

        let mut batch = WriteBatch::new();
        self.queue_removal(&mut batch, id);
        self.storage.commit(batch).map_err(SessionError::persist)?;

        debug!(prekey_id = id, "Consumed one-time prekey");
        Ok(key_pair)
    }

    /// Drop a one-time prekey from the pool. Returns whether it was present.
    ///
    /// # Errors
    ///
    /// - `PersistFailed` if the removal cannot be written
    pub fn remove_one_time_prekey(&self, id: u32) -> Result<bool, SessionError> {
        let _pool = self.lock_pool()?;
        if self.one_time_prekey(id)?.is_none() {
            return Ok(false);
        }

        let mut batch = WriteBatch::new();
        self.queue_removal(&mut batch, id);
        self.storage.commit(batch).map_err(SessionError::persist)?;

        debug!(prekey_id = id, "Removed one-time prekey");
        Ok(true)
    }

    /// Exclusive access to the one-time prekey pool.
    ///
    /// A caller that looks a prekey up and later commits its removal holds
    /// this across both, so two handshakes naming the same id cannot both
    /// use it.
    pub(crate) fn lock_pool(&self) -> Result<MutexGuard<'_, ()>, SessionError> {
        self.pool.lock().map_err(|_| {
            SessionError::StorageUnavailable("one-time prekey pool lock poisoned".to_string())
        })
    }

    /// Queue removal of a one-time prekey into a larger batch.
    pub(crate) fn queue_removal(&self, batch: &mut WriteBatch, id: u32) {
        batch.delete(Table::OneTimePreKeys, prekey_row(id));
    }

    /// Number of unconsumed one-time prekeys.
    pub fn one_time_prekey_count(&self) -> Result<usize, SessionError> {
        Ok(self.storage.scan(Table::OneTimePreKeys).map_err(SessionError::storage)?.len())
    }

    /// Generate `count` more one-time prekeys with fresh ids.
    ///
    /// Returns the new ids. Ids are never reused, even after consumption.
    ///
    /// # Errors
    ///
    /// - `PersistFailed` if the new keys cannot be written
    pub fn replenish(&self, count: u32) -> Result<Vec<u32>, SessionError> {
        let _pool = self.lock_pool()?;

        let meta = self.load_meta()?;
        let mut batch = WriteBatch::new();
        let next_id =
            generate_prekeys(&mut batch, &self.env, meta.next_one_time_prekey_id, count)?;
        put_meta(&mut batch, KeyStoreMeta { next_one_time_prekey_id: next_id })?;
        self.storage.commit(batch).map_err(SessionError::persist)?;

        let ids: Vec<u32> = (meta.next_one_time_prekey_id..next_id).collect();
        debug!(count, first_id = meta.next_one_time_prekey_id, "Replenished one-time prekeys");
        Ok(ids)
    }

    /// Top the pool up to the configured size if it fell below the threshold.
    ///
    /// Returns the new ids (empty if nothing was needed).
    ///
    /// # Errors
    ///
    /// Same as [`replenish`](Self::replenish).
    pub fn replenish_if_needed(&self) -> Result<Vec<u32>, SessionError> {
        let remaining = u32::try_from(self.one_time_prekey_count()?).unwrap_or(u32::MAX);
        if remaining >= self.config.replenish_threshold {
            return Ok(Vec::new());
        }
        self.replenish(self.config.one_time_prekey_pool_size.saturating_sub(remaining))
    }

    fn one_time_prekeys(&self) -> Result<Vec<OneTimePreKeyRecord>, SessionError> {
        self.storage
            .scan(Table::OneTimePreKeys)
            .map_err(SessionError::storage)?
            .iter()
            .map(|(_, bytes)| records::decode(bytes).map_err(SessionError::storage))
            .collect()
    }

    fn load_meta(&self) -> Result<KeyStoreMeta, SessionError> {
        let bytes = self
            .storage
            .get(Table::Meta, KEY_STORE_META_ROW)
            .map_err(SessionError::storage)?
            .ok_or_else(|| SessionError::StorageUnavailable("key store meta missing".to_string()))?;
        records::decode(&bytes).map_err(SessionError::storage)
    }
}

/// Queue `count` fresh prekeys starting at `first_id`; returns the next id.
fn generate_prekeys<E: Environment>(
    batch: &mut WriteBatch,
    env: &E,
    first_id: u32,
    count: u32,
) -> Result<u32, SessionError> {
    let next_id = first_id.checked_add(count).ok_or_else(|| {
        SessionError::PersistFailed("one-time prekey id space exhausted".to_string())
    })?;

    for id in first_id..next_id {
        let key_pair = KeyPair::from_secret_bytes(env.random_key_seed());
        let record = OneTimePreKeyRecord { id, key_pair };
        batch.put(
            Table::OneTimePreKeys,
            prekey_row(id),
            records::encode(&record).map_err(SessionError::persist)?,
        );
    }
    Ok(next_id)
}

fn put_meta(batch: &mut WriteBatch, meta: KeyStoreMeta) -> Result<(), SessionError> {
    batch.put(
        Table::Meta,
        KEY_STORE_META_ROW.to_vec(),
        records::encode(&meta).map_err(SessionError::persist)?,
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        env::test_utils::MockEnv,
        storage::{ChaoticStorage, MemoryStorage},
    };

    fn open(storage: &MemoryStorage) -> KeyStore<MemoryStorage, MockEnv> {
        KeyStore::initialize(storage.clone(), MockEnv::with_seed(1), SessionConfig::default())
            .unwrap()
    }

    #[test]
    fn first_use_generates_full_pool() {
        let storage = MemoryStorage::new();
        let store = open(&storage);

        let bundle = store.export_public_bundle().unwrap();
        let ids: Vec<u32> = bundle.one_time_prekeys.iter().map(|p| p.id).collect();

        assert_eq!(ids, (1000..1010).collect::<Vec<_>>());
        assert_eq!(bundle.signed_prekey.id, 1);
        assert!(bundle.offer().verify().is_ok());
        assert!((1..=MAX_REGISTRATION_ID).contains(&store.registration_id()));
    }

    #[test]
    fn initialize_is_idempotent() {
        let storage = MemoryStorage::new();
        let first = open(&storage);
        let second =
            KeyStore::initialize(storage.clone(), MockEnv::with_seed(99), SessionConfig::default())
                .unwrap();

        assert_eq!(first.identity_key(), second.identity_key());
        assert_eq!(first.registration_id(), second.registration_id());
        assert_eq!(
            first.export_public_bundle().unwrap(),
            second.export_public_bundle().unwrap()
        );
    }

    #[test]
    fn consumed_prekey_is_gone() {
        let store = open(&MemoryStorage::new());

        let pair = store.consume_one_time_prekey(1000).unwrap();
        assert!(store.one_time_prekey(1000).unwrap().is_none());
        assert_eq!(
            store.consume_one_time_prekey(1000).unwrap_err(),
            SessionError::UnknownPreKeyId { prekey_id: 1000 }
        );

        let offered = store.export_public_bundle().unwrap();
        assert!(offered.one_time_prekeys.iter().all(|p| p.public_key != pair.public_key()));
        assert_eq!(offered.one_time_prekeys.len(), 9);
    }

    #[test]
    fn remove_reports_presence() {
        let store = open(&MemoryStorage::new());

        assert!(store.remove_one_time_prekey(1003).unwrap());
        assert!(!store.remove_one_time_prekey(1003).unwrap());
        assert!(!store.remove_one_time_prekey(5).unwrap());
    }

    #[test]
    fn replenish_never_reuses_ids() {
        let store = open(&MemoryStorage::new());
        for id in 1000..1008 {
            store.consume_one_time_prekey(id).unwrap();
        }

        assert_eq!(store.one_time_prekey_count().unwrap(), 2);
        let new_ids = store.replenish_if_needed().unwrap();

        assert_eq!(new_ids, (1010..1018).collect::<Vec<_>>());
        assert_eq!(store.one_time_prekey_count().unwrap(), 10);
        assert!(store.replenish_if_needed().unwrap().is_empty());
    }

    #[test]
    fn next_id_survives_reload() {
        let storage = MemoryStorage::new();
        open(&storage).replenish(5).unwrap();

        let reopened = open(&storage);
        assert_eq!(reopened.replenish(1).unwrap(), vec![1015]);
    }

    #[test]
    fn failed_first_use_leaves_nothing_behind() {
        let inner = MemoryStorage::new();
        let chaotic = ChaoticStorage::new(inner.clone(), 1.0);

        let result = KeyStore::initialize(chaotic, MockEnv::new(), SessionConfig::default());
        assert!(matches!(result, Err(SessionError::StorageUnavailable(_))));
        assert_eq!(inner.row_count(Table::Identity).unwrap(), 0);
        assert_eq!(inner.row_count(Table::OneTimePreKeys).unwrap(), 0);
    }

    #[test]
    fn missing_signed_prekey_is_reported() {
        let storage = MemoryStorage::new();
        let _ = open(&storage);

        let mut batch = WriteBatch::new();
        batch.delete(Table::SignedPreKeys, prekey_row(1));
        storage.commit(batch).unwrap();

        assert!(matches!(
            KeyStore::initialize(storage, MockEnv::new(), SessionConfig::default()),
            Err(SessionError::StorageUnavailable(_))
        ));
    }
}
