//! The locker unlock/lock state machine.
//!
//! A [`Locker`] represents one encrypted collection. It is "unlocked" exactly
//! while the shared [`CredentialCache`] holds a valid entry for its seed;
//! there is no separate state flag to drift out of sync. Every data operation
//! starts with a key-resolution step against the cache, so an operation
//! issued while locked simply waits for the next [`Locker::unlock`] instead
//! of failing eagerly, and fails with [`LockerError::Locked`] only if the key
//! is invalidated before one arrives.
//!
//! Password correctness is proven by the canary protocol: a well-known meta
//! document holds a random value encrypted under the real key, and a
//! candidate key is accepted iff it can decrypt it.

pub mod item;
pub mod manager;
pub mod secret;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use crate::cache::{CredentialCache, KeyRequest, now_millis};
use crate::crypto::{CryptoProvider, DerivedKey};
use crate::error::LockerError;
use crate::store::{Document, DocumentKind, DocumentStore, StoreError};

pub use item::{Item, ItemData, ItemMeta, ItemSummary};
pub use manager::LockerManager;
pub use secret::Secret;

/// Well-known id of the decrypt-check canary document.
const DECRYPT_CHECK_ID: &str = "META_DECRYPT_CHECK";

/// Bits of random material stored in the canary.
const CANARY_BITS: usize = 128;

/// Named metadata documents a locker carries besides the canary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetadataKey {
    Name,
    Description,
}

impl MetadataKey {
    pub const ALL: [MetadataKey; 2] = [MetadataKey::Name, MetadataKey::Description];

    /// The well-known document id for this key.
    pub fn document_id(self) -> &'static str {
        match self {
            MetadataKey::Name => "META_NAME",
            MetadataKey::Description => "META_DESCRIPTION",
        }
    }
}

/// One encrypted collection with unlock/lock state.
pub struct Locker {
    secret: Secret,
    collection: Arc<dyn DocumentStore>,
    crypto: Arc<dyn CryptoProvider>,
    cache: Arc<CredentialCache>,
    /// Decrypted cache of the named metadata documents.
    metadata: Mutex<HashMap<MetadataKey, String>>,
    /// Serializes canary checks so two concurrent unlocks cannot interleave
    /// reads and writes of the canary document.
    unlock_gate: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for Locker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Locker")
            .field("secret", &self.secret)
            .field("locked", &self.is_locked())
            .finish_non_exhaustive()
    }
}

impl Locker {
    /// Bind a locker to its collection. Cheap; nothing is fetched until an
    /// operation runs.
    pub fn new(
        secret: Secret,
        collection: Arc<dyn DocumentStore>,
        crypto: Arc<dyn CryptoProvider>,
        cache: Arc<CredentialCache>,
    ) -> Self {
        Self {
            secret,
            collection,
            crypto,
            cache,
            metadata: Mutex::new(HashMap::new()),
            unlock_gate: tokio::sync::Mutex::new(()),
        }
    }

    pub fn secret(&self) -> &Secret {
        &self.secret
    }

    pub fn public_id(&self) -> &str {
        self.secret.public_id()
    }

    /// Decrypted metadata loaded so far.
    pub fn metadata(&self) -> HashMap<MetadataKey, String> {
        self.metadata
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Derive a key from the passphrase, prove it against the canary, and on
    /// success publish it to the credential cache (resolving anyone waiting).
    ///
    /// On failure the cache is left untouched.
    pub async fn unlock(&self, password: &str) -> Result<DerivedKey, LockerError> {
        tracing::debug!(locker = self.public_id(), "unlocking");
        let key = self.crypto.derive_key(password, self.secret.seed());

        let _gate = self.unlock_gate.lock().await;
        self.check_encryption_key(&key).await?;

        self.cache.put(self.secret.seed(), key.clone());
        tracing::debug!(locker = self.public_id(), "unlocked");
        Ok(key)
    }

    /// Forget the derived key, rejecting any operation currently waiting on
    /// it.
    pub fn lock(&self) {
        tracing::debug!(locker = self.public_id(), "locking");
        self.cache.invalidate(self.secret.seed());
    }

    /// Whether no valid, unexpired key is cached. A peek: does not refresh
    /// the TTL.
    pub fn is_locked(&self) -> bool {
        self.cache.lookup(self.secret.seed()).is_none()
    }

    /// Lock every locker sharing `cache` at once.
    pub fn lock_all(cache: &CredentialCache) {
        tracing::debug!("locking all lockers");
        cache.invalidate_all();
    }

    /// Destroy the underlying collection. The locker object stays usable as
    /// a (now empty) fresh collection.
    pub async fn destroy(&self) -> Result<(), LockerError> {
        self.lock();
        self.collection.destroy_all().await?;
        self.metadata
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        Ok(())
    }

    /// Verify a candidate key against the canary document, initializing the
    /// canary on first use.
    async fn check_encryption_key(&self, key: &DerivedKey) -> Result<(), LockerError> {
        match self.collection.get(DECRYPT_CHECK_ID).await? {
            None => {
                // First use: this is the initializing path, not verification.
                tracing::debug!(locker = self.public_id(), "no canary, initializing locker");
                self.initialize_locker(key).await
            }
            Some(doc) => {
                let Some(ciphertext) = doc.value else {
                    return Err(LockerError::BadPassword);
                };
                match self.crypto.decrypt(key, &ciphertext) {
                    Ok(plain) if !plain.is_empty() => Ok(()),
                    _ => {
                        tracing::debug!(locker = self.public_id(), "canary decrypt failed");
                        Err(LockerError::BadPassword)
                    }
                }
            }
        }
    }

    /// Store a canary: a random value encrypted under the accepted key.
    async fn initialize_locker(&self, key: &DerivedKey) -> Result<(), LockerError> {
        let clue = self.crypto.random_key(CANARY_BITS);
        let sealed = self.crypto.encrypt(key, &clue)?;
        self.collection.put(Document::meta(DECRYPT_CHECK_ID, sealed)).await?;
        Ok(())
    }

    /// Key resolution preceding every data operation.
    ///
    /// A cache hit additionally re-`put`s the key so a burst of operations
    /// keeps the session alive. A miss waits for an unlock; rejection of the
    /// wait (explicit lock, global lock, or sweep eviction) is `Locked`.
    async fn encryption_key(&self) -> Result<DerivedKey, LockerError> {
        let request = self.cache.get(self.secret.seed());
        match &request {
            KeyRequest::Ready(key) => self.cache.put(self.secret.seed(), key.clone()),
            KeyRequest::Pending { reason, .. } => {
                tracing::debug!(
                    locker = self.public_id(),
                    %reason,
                    "encryption key unavailable, waiting for unlock"
                );
            }
        }
        request.wait().await.map_err(|_| LockerError::Locked)
    }

    /// List all items: decrypted tag and metadata plus payload presence
    /// flags, ordered by the store's tag index.
    pub async fn list(&self) -> Result<Vec<ItemSummary>, LockerError> {
        let key = self.encryption_key().await?;
        let docs = self.collection.query(DocumentKind::Data).await?;
        docs.into_iter()
            .map(|doc| self.summarize(&key, doc))
            .collect()
    }

    fn summarize(&self, key: &DerivedKey, doc: Document) -> Result<ItemSummary, LockerError> {
        let meta: ItemMeta =
            serde_json::from_str(&self.decrypt_field(key, &doc, doc.encrypted_meta.as_deref())?)?;
        let data: ItemData =
            serde_json::from_str(&self.decrypt_field(key, &doc, doc.encrypted_data.as_deref())?)?;
        let tag = self.decrypt_field(key, &doc, doc.encrypted_tag.as_deref())?;

        Ok(ItemSummary {
            id: doc.id,
            rev: doc.rev,
            tag,
            meta,
            has_password: data.password.is_some(),
            has_login: data.login.is_some(),
            has_notes: data.notes.is_some(),
        })
    }

    fn decrypt_field(
        &self,
        key: &DerivedKey,
        doc: &Document,
        field: Option<&str>,
    ) -> Result<String, LockerError> {
        let ciphertext = field.ok_or_else(|| LockerError::MalformedDocument(doc.id.clone()))?;
        Ok(self.crypto.decrypt(key, ciphertext)?)
    }

    /// Encrypt and store an item. Existing items (id and revision present)
    /// are updated in place; new items get a store-assigned id. Returns the
    /// item with its fresh id/revision and `updated` stamp.
    pub async fn save(&self, mut item: Item) -> Result<Item, LockerError> {
        let key = self.encryption_key().await?;

        item.meta.updated = Some(now_millis());

        let encrypted_tag = self.crypto.encrypt(&key, &item.tag)?;
        let encrypted_meta = self.crypto.encrypt(&key, &serde_json::to_string(&item.meta)?)?;
        let encrypted_data = self.crypto.encrypt(&key, &serde_json::to_string(&item.data)?)?;

        let saved = match (&item.id, &item.rev) {
            (Some(id), Some(rev)) => {
                let mut doc = Document::data(id.clone(), encrypted_tag, encrypted_meta, encrypted_data);
                doc.rev = Some(rev.clone());
                self.collection.put(doc).await?
            }
            // Missing either half of the identity means a fresh document.
            _ => {
                let doc = Document::data(String::new(), encrypted_tag, encrypted_meta, encrypted_data);
                self.collection.post(doc).await?
            }
        };

        item.id = Some(saved.id);
        item.rev = saved.rev;
        Ok(item)
    }

    /// Fetch and decrypt one item.
    pub async fn get(&self, item_id: &str) -> Result<Item, LockerError> {
        let key = self.encryption_key().await?;
        let doc = self
            .collection
            .get(item_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(item_id.to_string()))?;

        let meta: ItemMeta =
            serde_json::from_str(&self.decrypt_field(&key, &doc, doc.encrypted_meta.as_deref())?)?;
        let data: ItemData =
            serde_json::from_str(&self.decrypt_field(&key, &doc, doc.encrypted_data.as_deref())?)?;
        let tag = self.decrypt_field(&key, &doc, doc.encrypted_tag.as_deref())?;

        Ok(Item {
            id: Some(doc.id),
            rev: doc.rev,
            tag,
            meta,
            data,
        })
    }

    /// Delete an item by id.
    pub async fn delete_by_id(&self, item_id: &str) -> Result<(), LockerError> {
        let _key = self.encryption_key().await?;
        let doc = self
            .collection
            .get(item_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(item_id.to_string()))?;
        self.collection.remove(&doc).await?;
        Ok(())
    }

    /// Fetch and decrypt all named metadata documents into the in-memory
    /// map. Missing documents are skipped.
    pub async fn load_metadata(&self) -> Result<(), LockerError> {
        let key = self.encryption_key().await?;
        for meta_key in MetadataKey::ALL {
            let Some(doc) = self.collection.get(meta_key.document_id()).await? else {
                continue;
            };
            let Some(ciphertext) = doc.value else {
                continue;
            };
            let plain = self.crypto.decrypt(&key, &ciphertext)?;
            self.metadata
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(meta_key, plain);
        }
        Ok(())
    }

    /// Encrypt and upsert one named metadata document, then update the
    /// in-memory map.
    pub async fn save_metadata(
        &self,
        meta_key: MetadataKey,
        value: &str,
    ) -> Result<(), LockerError> {
        let key = self.encryption_key().await?;

        let mut doc = Document::meta(meta_key.document_id(), self.crypto.encrypt(&key, value)?);
        doc.rev = self
            .collection
            .get(meta_key.document_id())
            .await?
            .and_then(|existing| existing.rev);
        self.collection.put(doc).await?;

        self.metadata
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(meta_key, value.to_string());
        Ok(())
    }

    /// Name the locker. Stored encrypted like every other metadata value.
    pub async fn set_name(&self, name: &str) -> Result<(), LockerError> {
        self.save_metadata(MetadataKey::Name, name).await
    }
}
