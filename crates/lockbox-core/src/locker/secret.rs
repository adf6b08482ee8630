//! Locker identity.

use std::fmt;

use zeroize::Zeroize;

use crate::crypto::CryptoProvider;

/// Prefix of every public collection name.
const PUBLIC_ID_PREFIX: &str = "shared$";

/// A locker's identity: the user-held seed and the public id derived from it.
///
/// The seed does triple duty, inherited behavior this crate keeps as-is: it is
/// the credential-cache key, the source of the public id, and the KDF salt.
/// The public id (`shared$` + hex digest of the seed) is deterministic,
/// collision-resistant, and safe to use as a collection name or log field;
/// the seed itself never leaves this struct except for key derivation and
/// cache addressing.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret {
    seed: String,
    public_id: String,
}

impl Secret {
    /// Derive the identity for a seed.
    pub fn new(seed: impl Into<String>, crypto: &dyn CryptoProvider) -> Self {
        let seed = seed.into();
        let public_id = format!("{PUBLIC_ID_PREFIX}{}", crypto.hash(&seed));
        Self { seed, public_id }
    }

    /// The seed, for key derivation and cache addressing only. Do not log.
    pub(crate) fn seed(&self) -> &str {
        &self.seed
    }

    /// The non-secret collection identifier.
    pub fn public_id(&self) -> &str {
        &self.public_id
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Secret")
            .field("seed", &"[REDACTED]")
            .field("public_id", &self.public_id)
            .finish()
    }
}

impl Drop for Secret {
    fn drop(&mut self) {
        self.seed.zeroize();
    }
}
