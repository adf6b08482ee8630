//! Cryptography provider seam for locker operations.
//!
//! The locker core never calls cryptographic primitives directly. Everything
//! goes through the [`CryptoProvider`] capability trait: authenticated
//! encryption of document fields, passphrase key derivation, public-id
//! hashing, and random key generation. [`AesGcmProvider`] is the default
//! implementation, wired to AES-256-GCM, PBKDF2-HMAC-SHA256, and SHA-256.
//!
//! All provider calls are treated as fast and non-suspending; the trait is
//! synchronous by design.

use std::fmt;
use std::num::NonZeroU32;

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use rand::RngCore;
use ring::{digest, pbkdf2};
use secrecy::{ExposeSecret, SecretBox};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// PBKDF2 iteration count. Fixed: the same `(password, seed)` pair must
/// always yield the same key across sessions.
const PBKDF2_ITERATIONS: NonZeroU32 = NonZeroU32::new(100_000).unwrap();

/// AES-GCM nonce size in bytes (96 bits).
const NONCE_LEN: usize = 12;

/// Errors that can occur during cryptographic operations.
#[derive(Error, Debug)]
pub enum CryptoError {
    /// Authenticated decryption failed.
    ///
    /// With an AEAD cipher this means the key is wrong or the ciphertext has
    /// been tampered with; the two cases are cryptographically
    /// indistinguishable.
    #[error("decryption failed - wrong key or corrupted ciphertext")]
    DecryptFailed,

    /// The ciphertext is not in the expected encoding.
    #[error("malformed ciphertext: {0}")]
    MalformedCiphertext(String),

    /// Encryption itself failed. Should not happen with a well-formed key.
    #[error("encryption failed")]
    EncryptFailed,
}

/// A derived encryption key, the only secret this crate ever caches.
///
/// Wraps the raw 256-bit KDF output in a [`SecretBox`] so the material is
/// zeroed on drop and never shows up in `Debug` output. Serde support exists
/// solely for the session-scoped cache snapshot; the serialized form is the
/// hex-encoded key material and must never reach durable storage.
pub struct DerivedKey {
    material: SecretBox<[u8; 32]>,
}

impl Clone for DerivedKey {
    fn clone(&self) -> Self {
        Self::new(*self.expose())
    }
}

impl DerivedKey {
    /// Wrap raw key material.
    pub fn new(material: [u8; 32]) -> Self {
        Self {
            material: SecretBox::new(Box::new(material)),
        }
    }

    /// Scoped access to the raw key bytes.
    pub(crate) fn expose(&self) -> &[u8; 32] {
        self.material.expose_secret()
    }
}

impl fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DerivedKey([REDACTED])")
    }
}

impl PartialEq for DerivedKey {
    fn eq(&self, other: &Self) -> bool {
        self.expose() == other.expose()
    }
}

impl Eq for DerivedKey {}

impl Serialize for DerivedKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(self.expose()))
    }
}

impl<'de> Deserialize<'de> for DerivedKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        let bytes = hex::decode(&encoded).map_err(D::Error::custom)?;
        let material: [u8; 32] = bytes
            .try_into()
            .map_err(|_| D::Error::custom("derived key must be 32 bytes"))?;
        Ok(Self::new(material))
    }
}

/// Capability interface for the cryptography collaborator.
pub trait CryptoProvider: Send + Sync {
    /// Encrypt `plaintext` under `key`, returning a self-contained ciphertext.
    fn encrypt(&self, key: &DerivedKey, plaintext: &str) -> Result<String, CryptoError>;

    /// Decrypt a ciphertext produced by [`CryptoProvider::encrypt`].
    fn decrypt(&self, key: &DerivedKey, ciphertext: &str) -> Result<String, CryptoError>;

    /// Derive an encryption key from a passphrase and a seed acting as salt.
    ///
    /// Deterministic: the same `(password, seed)` always yields the same key.
    fn derive_key(&self, password: &str, seed: &str) -> DerivedKey;

    /// Hash an input to a hex digest. Used to derive non-secret public ids.
    fn hash(&self, input: &str) -> String;

    /// Generate `bits` of cryptographically random material, hex encoded.
    fn random_key(&self, bits: usize) -> String;
}

/// Default [`CryptoProvider`] backed by AES-256-GCM and PBKDF2-HMAC-SHA256.
#[derive(Debug, Default, Clone, Copy)]
pub struct AesGcmProvider;

impl AesGcmProvider {
    pub fn new() -> Self {
        Self
    }

    fn cipher(key: &DerivedKey) -> Aes256Gcm {
        Aes256Gcm::new(key.expose().into())
    }
}

impl CryptoProvider for AesGcmProvider {
    fn encrypt(&self, key: &DerivedKey, plaintext: &str) -> Result<String, CryptoError> {
        let cipher = Self::cipher(key);
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let sealed = cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| CryptoError::EncryptFailed)?;

        // Nonce is prepended so the ciphertext is self-contained.
        let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
        out.extend_from_slice(nonce.as_slice());
        out.extend_from_slice(&sealed);
        Ok(BASE64.encode(out))
    }

    fn decrypt(&self, key: &DerivedKey, ciphertext: &str) -> Result<String, CryptoError> {
        let raw = BASE64
            .decode(ciphertext)
            .map_err(|e| CryptoError::MalformedCiphertext(e.to_string()))?;
        if raw.len() <= NONCE_LEN {
            return Err(CryptoError::MalformedCiphertext(
                "ciphertext shorter than nonce".to_string(),
            ));
        }

        let (nonce, sealed) = raw.split_at(NONCE_LEN);
        let cipher = Self::cipher(key);
        let plain = cipher
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|_| CryptoError::DecryptFailed)?;
        String::from_utf8(plain).map_err(|_| CryptoError::DecryptFailed)
    }

    fn derive_key(&self, password: &str, seed: &str) -> DerivedKey {
        let mut material = [0u8; 32];
        pbkdf2::derive(
            pbkdf2::PBKDF2_HMAC_SHA256,
            PBKDF2_ITERATIONS,
            seed.as_bytes(),
            password.as_bytes(),
            &mut material,
        );
        DerivedKey::new(material)
    }

    fn hash(&self, input: &str) -> String {
        hex::encode(digest::digest(&digest::SHA256, input.as_bytes()))
    }

    fn random_key(&self, bits: usize) -> String {
        let mut bytes = vec![0u8; bits.div_ceil(8)];
        rand::rng().fill_bytes(&mut bytes);
        hex::encode(bytes)
    }
}
