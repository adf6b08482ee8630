//! Error types for locker operations.
//!
//! Nothing here is fatal to the process; every failure is per-operation.
//! Store and crypto failures are passed through with their original detail,
//! except where the canary protocol deliberately reclassifies a decryption
//! failure as [`LockerError::BadPassword`].

use thiserror::Error;

pub use crate::cache::Rejected;
pub use crate::crypto::CryptoError;
pub use crate::store::StoreError;

/// Failures surfaced by [`Locker`](crate::locker::Locker) operations.
#[derive(Debug, Error)]
pub enum LockerError {
    /// The canary document could not be decrypted with the derived key.
    #[error("bad password")]
    BadPassword,

    /// A data operation's key request was rejected before an unlock arrived.
    #[error("locker is locked")]
    Locked,

    /// Document-store failure, passed through.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Cryptographic failure outside the canary path, passed through.
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// A stored document lacks the encrypted fields its kind requires.
    #[error("document {0} is missing required encrypted fields")]
    MalformedDocument(String),

    /// A decrypted payload did not parse.
    #[error("malformed item payload: {0}")]
    Corrupt(#[from] serde_json::Error),
}
