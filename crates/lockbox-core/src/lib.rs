//! Client-side encrypted locker library.
//!
//! A passphrase unlocks a named, encrypted item collection; the derived key
//! is cached with a sliding TTL so repeated operations do not re-prompt.
//! Two components carry the real invariants:
//!
//! - [`cache::CredentialCache`]: derived keys in memory with single-flight
//!   get-or-wait semantics, a periodic eviction sweep, and a session-scoped
//!   snapshot.
//! - [`locker::Locker`]: the unlock/lock state machine over one collection,
//!   wrapping every store operation behind a key-resolution step.
//!
//! The document store, the cryptography provider, and the snapshot slot are
//! consumed through capability traits ([`store::DocumentStore`],
//! [`crypto::CryptoProvider`], [`session::SnapshotSlot`]); in-memory
//! implementations of all three ship with the crate.

pub mod cache;
pub mod crypto;
pub mod error;
pub mod locker;
pub mod session;
pub mod store;

pub use cache::{CacheEntry, CacheOptions, CredentialCache, KeyRequest, MissReason};
pub use crypto::{AesGcmProvider, CryptoProvider, DerivedKey};
pub use error::LockerError;
pub use locker::{Item, ItemData, ItemMeta, ItemSummary, Locker, LockerManager, MetadataKey, Secret};
pub use session::{MemorySlot, SnapshotSlot};
pub use store::{Document, DocumentKind, DocumentStore, StoreError};
