//! In-memory document store.
//!
//! A process-local [`DocumentStore`] with the same observable contract as the
//! replicated backend: revision tokens, conflict detection, and a tag-ordered
//! data query. Backs the test suite and any host that wants a non-persistent
//! collection.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use rand::RngCore;

use super::{CollectionProvider, Document, DocumentKind, DocumentStore, StoreError};

/// One in-memory collection.
#[derive(Debug, Default)]
pub struct MemoryStore {
    docs: DashMap<String, Document>,
    next_seq: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_rev(&self) -> String {
        // Same shape as replicated stores: a generation counter plus a nonce.
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed) + 1;
        let mut nonce = [0u8; 4];
        rand::rng().fill_bytes(&mut nonce);
        format!("{seq}-{}", hex::encode(nonce))
    }

    fn fresh_id() -> String {
        let mut bytes = [0u8; 16];
        rand::rng().fill_bytes(&mut bytes);
        hex::encode(bytes)
    }

    /// Number of stored documents.
    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get(&self, id: &str) -> Result<Option<Document>, StoreError> {
        Ok(self.docs.get(id).map(|doc| doc.clone()))
    }

    async fn put(&self, mut doc: Document) -> Result<Document, StoreError> {
        if let Some(existing) = self.docs.get(&doc.id) {
            if existing.rev != doc.rev {
                return Err(StoreError::Conflict(doc.id));
            }
        } else if doc.rev.is_some() {
            // A revision for a document that does not exist.
            return Err(StoreError::Conflict(doc.id));
        }

        doc.rev = Some(self.next_rev());
        self.docs.insert(doc.id.clone(), doc.clone());
        Ok(doc)
    }

    async fn post(&self, mut doc: Document) -> Result<Document, StoreError> {
        if doc.id.is_empty() {
            doc.id = Self::fresh_id();
        }
        doc.rev = None;
        self.put(doc).await
    }

    async fn remove(&self, doc: &Document) -> Result<(), StoreError> {
        let Some(existing) = self.docs.get(&doc.id) else {
            return Err(StoreError::NotFound(doc.id.clone()));
        };
        if existing.rev != doc.rev {
            return Err(StoreError::Conflict(doc.id.clone()));
        }
        drop(existing);
        self.docs.remove(&doc.id);
        Ok(())
    }

    async fn query(&self, kind: DocumentKind) -> Result<Vec<Document>, StoreError> {
        let mut results: Vec<Document> = self
            .docs
            .iter()
            .filter(|entry| entry.kind == kind)
            .map(|entry| entry.clone())
            .collect();
        // The replicated store emits rows keyed by the encrypted tag.
        results.sort_by(|a, b| a.encrypted_tag.cmp(&b.encrypted_tag));
        Ok(results)
    }

    async fn destroy_all(&self) -> Result<(), StoreError> {
        self.docs.clear();
        Ok(())
    }
}

/// Memoizing [`CollectionProvider`] over in-memory collections.
#[derive(Debug, Default)]
pub struct MemoryCollections {
    collections: DashMap<String, Arc<MemoryStore>>,
}

impl MemoryCollections {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CollectionProvider for MemoryCollections {
    fn open(&self, name: &str) -> Arc<dyn DocumentStore> {
        self.collections
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(MemoryStore::new()))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn get_missing_is_none() {
        let store = MemoryStore::new();
        assert_eq!(store.get("nope").await.unwrap().map(|d| d.id), None);
    }

    #[tokio::test]
    async fn put_assigns_revision() {
        let store = MemoryStore::new();
        let saved = store.put(Document::meta("META_NAME", "cipher")).await.unwrap();
        assert_eq!(saved.id, "META_NAME");
        assert!(saved.rev.is_some());

        let fetched = store.get("META_NAME").await.unwrap().unwrap();
        assert_eq!(fetched.rev, saved.rev);
        assert_eq!(fetched.value.as_deref(), Some("cipher"));
    }

    #[tokio::test]
    async fn put_with_stale_rev_conflicts() {
        let store = MemoryStore::new();
        let first = store.put(Document::meta("doc", "v1")).await.unwrap();

        let mut update = first.clone();
        update.value = Some("v2".to_string());
        let second = store.put(update).await.unwrap();
        assert_ne!(first.rev, second.rev);

        // Re-using the first revision must conflict.
        let mut stale = first;
        stale.value = Some("v3".to_string());
        assert_eq!(
            store.put(stale).await,
            Err(StoreError::Conflict("doc".to_string()))
        );
    }

    #[tokio::test]
    async fn put_new_doc_with_rev_conflicts() {
        let store = MemoryStore::new();
        let mut doc = Document::meta("doc", "v1");
        doc.rev = Some("1-deadbeef".to_string());
        assert!(matches!(store.put(doc).await, Err(StoreError::Conflict(_))));
    }

    #[tokio::test]
    async fn post_assigns_fresh_ids() {
        let store = MemoryStore::new();
        let a = store
            .post(Document::data("", "t1", "m1", "d1"))
            .await
            .unwrap();
        let b = store
            .post(Document::data("", "t2", "m2", "d2"))
            .await
            .unwrap();
        assert!(!a.id.is_empty());
        assert_ne!(a.id, b.id);
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn remove_requires_matching_rev() {
        let store = MemoryStore::new();
        let saved = store.put(Document::meta("doc", "v1")).await.unwrap();

        let mut stale = saved.clone();
        stale.rev = Some("0-00000000".to_string());
        assert!(matches!(
            store.remove(&stale).await,
            Err(StoreError::Conflict(_))
        ));

        store.remove(&saved).await.unwrap();
        assert!(store.get("doc").await.unwrap().is_none());
        assert!(matches!(
            store.remove(&saved).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn query_filters_by_kind_and_orders_by_tag() {
        let store = MemoryStore::new();
        store.put(Document::meta("META_NAME", "cipher")).await.unwrap();
        store
            .post(Document::data("", "bbb", "m1", "d1"))
            .await
            .unwrap();
        store
            .post(Document::data("", "aaa", "m2", "d2"))
            .await
            .unwrap();

        let rows = store.query(DocumentKind::Data).await.unwrap();
        assert_eq!(rows.len(), 2);
        let tags: Vec<_> = rows.iter().map(|d| d.encrypted_tag.clone()).collect();
        assert_eq!(
            tags,
            vec![Some("aaa".to_string()), Some("bbb".to_string())]
        );
    }

    #[tokio::test]
    async fn destroy_all_empties_the_collection() {
        let store = MemoryStore::new();
        store.put(Document::meta("doc", "v1")).await.unwrap();
        store.destroy_all().await.unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn collections_are_memoized_by_name() {
        let provider = MemoryCollections::new();
        let a = provider.open("shared$abc");
        a.put(Document::meta("doc", "v1")).await.unwrap();

        let same = provider.open("shared$abc");
        assert!(same.get("doc").await.unwrap().is_some());

        let other = provider.open("shared$def");
        assert!(other.get("doc").await.unwrap().is_none());
    }
}
