//! Registry of live lockers.
//!
//! The manager hands out one [`Locker`] per secret, binding each to the
//! collection named by its public id, and owns the whole-process operations:
//! lock everything, wipe everything.

use std::sync::Arc;

use dashmap::DashMap;

use crate::cache::CredentialCache;
use crate::crypto::CryptoProvider;
use crate::error::LockerError;
use crate::store::CollectionProvider;

use super::{Locker, Secret};

pub struct LockerManager {
    cache: Arc<CredentialCache>,
    crypto: Arc<dyn CryptoProvider>,
    collections: Arc<dyn CollectionProvider>,
    /// Live lockers keyed by public id.
    lockers: DashMap<String, Arc<Locker>>,
}

impl std::fmt::Debug for LockerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockerManager")
            .field("lockers", &self.lockers.len())
            .finish_non_exhaustive()
    }
}

impl LockerManager {
    pub fn new(
        cache: Arc<CredentialCache>,
        crypto: Arc<dyn CryptoProvider>,
        collections: Arc<dyn CollectionProvider>,
    ) -> Self {
        Self {
            cache,
            crypto,
            collections,
            lockers: DashMap::new(),
        }
    }

    /// The shared credential cache.
    pub fn cache(&self) -> &Arc<CredentialCache> {
        &self.cache
    }

    /// Get the locker for a seed, creating it on first access. The same seed
    /// always yields the same instance.
    pub fn open(&self, seed: &str) -> Arc<Locker> {
        let secret = Secret::new(seed, self.crypto.as_ref());
        self.lockers
            .entry(secret.public_id().to_string())
            .or_insert_with(|| {
                tracing::debug!(locker = secret.public_id(), "creating locker");
                let collection = self.collections.open(secret.public_id());
                Arc::new(Locker::new(
                    secret.clone(),
                    collection,
                    Arc::clone(&self.crypto),
                    Arc::clone(&self.cache),
                ))
            })
            .clone()
    }

    /// Find an already-open locker by its public id.
    pub fn get_by_public_id(&self, public_id: &str) -> Option<Arc<Locker>> {
        self.lockers.get(public_id).map(|entry| entry.clone())
    }

    /// All currently open lockers.
    pub fn list(&self) -> Vec<Arc<Locker>> {
        self.lockers.iter().map(|entry| entry.clone()).collect()
    }

    /// Invalidate every cached key, locking all lockers at once.
    pub fn lock_all(&self) {
        Locker::lock_all(&self.cache);
    }

    /// Destroy every known collection and forget every locker. Keys are
    /// invalidated first so nothing waiting survives the wipe.
    pub async fn wipe(&self) -> Result<(), LockerError> {
        tracing::debug!(lockers = self.lockers.len(), "wiping all lockers");
        self.lock_all();

        let lockers = self.list();
        for locker in lockers {
            locker.destroy().await?;
        }

        self.lockers.clear();
        Ok(())
    }
}
