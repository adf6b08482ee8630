//! Locker items: the decrypted shapes callers work with.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Item metadata, safe to show in a listing once decrypted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Unix milliseconds of the last save; stamped by the locker.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated: Option<u64>,
}

/// Item payload. The sensitive part: never rendered in listings, only in
/// presence flags.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub login: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl fmt::Debug for ItemData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ItemData")
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .field("login", &self.login)
            .field("notes", &self.notes.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

/// A full item, payload included.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Item {
    /// Absent until first saved; assigned by the document store.
    pub id: Option<String>,
    /// Revision of the document this item was loaded from.
    pub rev: Option<String>,
    /// User-chosen index tag (stored encrypted).
    pub tag: String,
    pub meta: ItemMeta,
    pub data: ItemData,
}

impl Item {
    /// A new, never-saved item.
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            ..Self::default()
        }
    }
}

/// One row of a locker listing: decrypted metadata and payload presence
/// flags, without the payload itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemSummary {
    pub id: String,
    pub rev: Option<String>,
    pub tag: String,
    pub meta: ItemMeta,
    pub has_password: bool,
    pub has_login: bool,
    pub has_notes: bool,
}
