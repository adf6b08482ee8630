//! Document-store collaborator interface.
//!
//! Each locker owns one collection in a replicated document store, named by
//! the locker's public id. The core consumes the store purely through this
//! capability trait; replication and conflict resolution live on the other
//! side of it. Documents carry an id, an opaque optimistic-concurrency
//! revision token, a kind tag, and encrypted payload fields the store never
//! interprets.

pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use memory::{MemoryCollections, MemoryStore};

/// Document kind tag, used by [`DocumentStore::query`] to scan one class of
/// documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentKind {
    /// Small named documents: locker name, description, decrypt-check canary.
    Meta,
    /// Encrypted items.
    Data,
}

/// A stored document. Payload fields are ciphertext; the store passes them
/// through untouched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    #[serde(rename = "_id")]
    pub id: String,
    /// Optimistic-concurrency token, opaque to this crate.
    #[serde(rename = "_rev", skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,
    #[serde(rename = "type")]
    pub kind: DocumentKind,
    /// Encrypted value of a meta document.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    /// Encrypted item metadata (data documents).
    #[serde(rename = "encryptedMeta", skip_serializing_if = "Option::is_none")]
    pub encrypted_meta: Option<String>,
    /// Encrypted item payload (data documents).
    #[serde(rename = "encryptedData", skip_serializing_if = "Option::is_none")]
    pub encrypted_data: Option<String>,
    /// Encrypted tag, used as the index key of the data query.
    #[serde(rename = "encryptedTag", skip_serializing_if = "Option::is_none")]
    pub encrypted_tag: Option<String>,
}

impl Document {
    /// A meta document holding one encrypted value.
    pub fn meta(id: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            rev: None,
            kind: DocumentKind::Meta,
            value: Some(value.into()),
            encrypted_meta: None,
            encrypted_data: None,
            encrypted_tag: None,
        }
    }

    /// A data document holding one encrypted item.
    pub fn data(
        id: impl Into<String>,
        encrypted_tag: impl Into<String>,
        encrypted_meta: impl Into<String>,
        encrypted_data: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            rev: None,
            kind: DocumentKind::Data,
            value: None,
            encrypted_meta: Some(encrypted_meta.into()),
            encrypted_data: Some(encrypted_data.into()),
            encrypted_tag: Some(encrypted_tag.into()),
        }
    }
}

/// Document-store failures, passed through to callers with their original
/// detail.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The document does not exist.
    #[error("document not found: {0}")]
    NotFound(String),

    /// The revision token did not match the stored document.
    #[error("revision conflict for document {0}")]
    Conflict(String),

    /// Any other backend failure.
    #[error("document store failure: {0}")]
    Backend(String),
}

/// Capability interface for one collection of the document store.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Fetch a document by id. Absence is not an error.
    async fn get(&self, id: &str) -> Result<Option<Document>, StoreError>;

    /// Create or update a document, honoring its revision token. Returns the
    /// stored document with its new revision.
    async fn put(&self, doc: Document) -> Result<Document, StoreError>;

    /// Store a new document under a store-assigned id.
    async fn post(&self, doc: Document) -> Result<Document, StoreError>;

    /// Remove a document (by id and revision).
    async fn remove(&self, doc: &Document) -> Result<(), StoreError>;

    /// Scan all documents of one kind, ordered by their encrypted tag index.
    async fn query(&self, kind: DocumentKind) -> Result<Vec<Document>, StoreError>;

    /// Destroy the whole collection.
    async fn destroy_all(&self) -> Result<(), StoreError>;
}

/// Opens named collections. The locker manager uses this to bind each locker
/// to the collection named by its public id.
pub trait CollectionProvider: Send + Sync {
    fn open(&self, name: &str) -> std::sync::Arc<dyn DocumentStore>;
}
