//! Key-bundle directory boundary.
//!
//! The directory is an external collaborator keyed by peer address. It
//! stores one [`PublishedBundle`] per device and hands out at most one
//! one-time prekey per fetch. Consumption is a separate, explicit call so two
//! initiators racing on the same prekey can be told apart: the first
//! `mark_consumed` returns `true`, every later one `false`.
//!
//! A consumed id stays consumed. Republishing a pool that still lists it
//! (the owner has not seen the handshake yet) must not offer it again.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use tracing::debug;

use crate::{
    address::PeerAddress,
    bundle::{KeyBundle, PublishedBundle},
    config::RetryPolicy,
    env::Environment,
    error::{DirectoryError, SessionError},
    key_store::KeyStore,
    retry,
    storage::Storage,
};

/// Shared directory of public key bundles.
#[async_trait]
pub trait KeyDirectory: Send + Sync + 'static {
    /// Replace the device's published bundle (upsert, whole pool). Ids
    /// previously removed by `mark_consumed` are dropped from the new pool.
    async fn publish(
        &self,
        address: &PeerAddress,
        bundle: PublishedBundle,
    ) -> Result<(), DirectoryError>;

    /// Read a bundle. `None` if the device never published one. Has no side
    /// effects: the offered one-time prekey stays published until marked.
    async fn fetch(&self, address: &PeerAddress) -> Result<Option<KeyBundle>, DirectoryError>;

    /// Remove one one-time prekey from the device's published pool.
    ///
    /// Returns `true` if this call removed it, `false` if it was already gone.
    async fn mark_consumed(
        &self,
        address: &PeerAddress,
        prekey_id: u32,
    ) -> Result<bool, DirectoryError>;
}

/// Publish the local bundle, retrying transient failures.
///
/// # Errors
///
/// - `StorageUnavailable` if the local pool cannot be read
/// - `DirectoryUnavailable` if the directory keeps failing
pub async fn publish_bundle<S, E, D>(
    key_store: &KeyStore<S, E>,
    directory: &D,
    env: &E,
    policy: &RetryPolicy,
    address: &PeerAddress,
) -> Result<(), SessionError>
where
    S: Storage,
    E: Environment,
    D: KeyDirectory + ?Sized,
{
    let bundle = key_store.export_public_bundle()?;
    let one_time_prekeys = bundle.one_time_prekeys.len();

    retry::with_backoff(env, policy, "publish", || directory.publish(address, bundle.clone()))
        .await?;

    debug!(peer = %address, one_time_prekeys, "Published key bundle");
    Ok(())
}

#[derive(Default)]
struct Counters {
    publishes: AtomicUsize,
    fetches: AtomicUsize,
    consumed: AtomicUsize,
    /// Remaining calls to fail with `Unavailable`
    outages: AtomicUsize,
}

#[derive(Default)]
struct Entry {
    bundle: Option<PublishedBundle>,
    /// Ids handed out by `mark_consumed`; never offered again
    consumed: HashSet<u32>,
}

type Entries = HashMap<PeerAddress, Entry>;

/// In-memory directory for tests and single-process deployments.
///
/// Thread-safe via Arc<Mutex<_>>. Clone shares the same underlying bundles.
#[derive(Clone, Default)]
pub struct MemoryDirectory {
    entries: Arc<Mutex<Entries>>,
    counters: Arc<Counters>,
}

impl MemoryDirectory {
    /// Empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `calls` operations with a transient error.
    pub fn fail_next(&self, calls: usize) {
        self.counters.outages.store(calls, Ordering::SeqCst);
    }

    /// Number of `fetch` calls that reached the directory.
    pub fn fetch_count(&self) -> usize {
        self.counters.fetches.load(Ordering::SeqCst)
    }

    #[cfg(test)]
    fn publish_count(&self) -> usize {
        self.counters.publishes.load(Ordering::SeqCst)
    }

    /// Number of successful removals by `mark_consumed`.
    pub fn consumed_count(&self) -> usize {
        self.counters.consumed.load(Ordering::SeqCst)
    }

    /// Ids currently published for a device.
    pub fn published_prekey_ids(&self, address: &PeerAddress) -> Result<Vec<u32>, DirectoryError> {
        let entries = self.lock()?;
        Ok(entries
            .get(address)
            .and_then(|entry| entry.bundle.as_ref())
            .map(|bundle| bundle.one_time_prekeys.iter().map(|p| p.id).collect())
            .unwrap_or_default())
    }

    /// Overwrite a stored bundle in place, bypassing `publish`.
    ///
    /// Simulates a tampered directory entry.
    pub fn tamper<F: FnOnce(&mut PublishedBundle)>(
        &self,
        address: &PeerAddress,
        edit: F,
    ) -> Result<bool, DirectoryError> {
        let mut entries = self.lock()?;
        Ok(entries.get_mut(address).and_then(|entry| entry.bundle.as_mut()).map(edit).is_some())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Entries>, DirectoryError> {
        self.entries.lock().map_err(|_| DirectoryError::Unavailable("lock poisoned".to_string()))
    }

    fn check_outage(&self) -> Result<(), DirectoryError> {
        let outage = self
            .counters
            .outages
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if outage {
            return Err(DirectoryError::Unavailable("simulated outage".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl KeyDirectory for MemoryDirectory {
    async fn publish(
        &self,
        address: &PeerAddress,
        mut bundle: PublishedBundle,
    ) -> Result<(), DirectoryError> {
        self.check_outage()?;
        bundle.one_time_prekeys.sort_by_key(|prekey| prekey.id);
        bundle.one_time_prekeys.dedup_by_key(|prekey| prekey.id);

        let mut entries = self.lock()?;
        let entry = entries.entry(address.clone()).or_default();
        let listed = bundle.one_time_prekeys.len();
        bundle.one_time_prekeys.retain(|prekey| !entry.consumed.contains(&prekey.id));
        if bundle.one_time_prekeys.len() < listed {
            debug!(
                peer = %address,
                dropped = listed - bundle.one_time_prekeys.len(),
                "Dropped already consumed one-time prekeys from published pool"
            );
        }
        entry.bundle = Some(bundle);

        self.counters.publishes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn fetch(&self, address: &PeerAddress) -> Result<Option<KeyBundle>, DirectoryError> {
        self.check_outage()?;
        self.counters.fetches.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .lock()?
            .get(address)
            .and_then(|entry| entry.bundle.as_ref())
            .map(PublishedBundle::offer))
    }

    async fn mark_consumed(
        &self,
        address: &PeerAddress,
        prekey_id: u32,
    ) -> Result<bool, DirectoryError> {
        self.check_outage()?;
        let mut entries = self.lock()?;
        let removed = entries.get_mut(address).is_some_and(|entry| {
            let Some(bundle) = entry.bundle.as_mut() else {
                return false;
            };
            let removed = bundle.remove_one_time_prekey(prekey_id);
            if removed {
                entry.consumed.insert(prekey_id);
            }
            removed
        });
        if removed {
            self.counters.consumed.fetch_add(1, Ordering::SeqCst);
        }
        Ok(removed)
    }
}
