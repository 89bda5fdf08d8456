//! Key types with secure memory handling.
//!
//! All key types automatically zeroize their memory on drop to prevent
//! sensitive data from persisting in memory.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::aead;
use tvault_common::{ContainerId, Result};

/// Length of encryption keys in bytes (256-bit).
pub const KEY_LENGTH: usize = 32;

/// Length of KDF salts in bytes.
pub const SALT_LENGTH: usize = 32;

const KEY_CHECK_PLAINTEXT: &[u8] = b"tvault:key-check:v1";
const GENERATE_DOMAIN: &[u8] = b"tvault:master-key:v1";

/// Master key of a container.
///
/// The root of the key hierarchy. It never encrypts payload data directly;
/// per-container keys are derived from it.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct MasterKey {
    key: [u8; KEY_LENGTH],
}

impl MasterKey {
    /// Create a master key from raw bytes.
    pub fn from_bytes(key: [u8; KEY_LENGTH]) -> Self {
        Self { key }
    }

    /// Create a master key from a slice, checking its length.
    pub fn from_slice(key: &[u8]) -> Option<Self> {
        let key: [u8; KEY_LENGTH] = key.try_into().ok()?;
        Some(Self { key })
    }

    /// Get the key bytes.
    ///
    /// # Security
    /// The returned slice should be used immediately and not stored.
    pub fn as_bytes(&self) -> &[u8; KEY_LENGTH] {
        &self.key
    }

    /// Derive the key that encrypts the payload of container `id`.
    pub fn derive_payload_key(&self, id: &ContainerId) -> PayloadKey {
        PayloadKey::from_bytes(self.derive(id, b"payload"))
    }

    fn derive(&self, id: &ContainerId, label: &[u8]) -> [u8; KEY_LENGTH] {
        let mut hasher = Blake2b::<U32>::new();
        hasher.update(self.key);
        hasher.update(id.as_bytes());
        hasher.update(label);

        let mut derived = [0u8; KEY_LENGTH];
        derived.copy_from_slice(&hasher.finalize());
        derived
    }

    /// Produce the key-check blob stored in the header.
    ///
    /// # Postconditions
    /// - [`MasterKey::verify_key_check`] accepts the result for the same key and id
    pub fn key_check(&self, id: &ContainerId) -> Result<Vec<u8>> {
        let check_key = PayloadKey::from_bytes(self.derive(id, b"key-check"));
        aead::encrypt(check_key.as_bytes(), KEY_CHECK_PLAINTEXT)
    }

    /// Whether this key opens the key-check blob of container `id`.
    pub fn verify_key_check(&self, id: &ContainerId, check: &[u8]) -> bool {
        let check_key = PayloadKey::from_bytes(self.derive(id, b"key-check"));
        match aead::decrypt(check_key.as_bytes(), check) {
            Ok(plain) => plain.as_slice().ct_eq(KEY_CHECK_PLAINTEXT).into(),
            Err(_) => false,
        }
    }
}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MasterKey([REDACTED])")
    }
}

/// Generate a fresh master key from an entropy seed.
///
/// The seed is mixed with 32 bytes of OS randomness, so a weak seed never
/// weakens the key below what the OS provides.
pub fn generate_master_key(seed: &[u8]) -> MasterKey {
    let mut os = [0u8; KEY_LENGTH];
    rand::thread_rng().fill_bytes(&mut os);

    let mut hasher = Blake2b::<U32>::new();
    hasher.update(GENERATE_DOMAIN);
    hasher.update(seed);
    hasher.update(os);
    os.zeroize();

    let mut key = [0u8; KEY_LENGTH];
    key.copy_from_slice(&hasher.finalize());
    MasterKey::from_bytes(key)
}

/// Key that encrypts a container payload.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct PayloadKey {
    key: [u8; KEY_LENGTH],
}

impl PayloadKey {
    pub fn from_bytes(key: [u8; KEY_LENGTH]) -> Self {
        Self { key }
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LENGTH] {
        &self.key
    }
}

impl fmt::Debug for PayloadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PayloadKey([REDACTED])")
    }
}

/// Salt for key derivation. Serialized as unpadded URL-safe base64.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Salt(pub [u8; SALT_LENGTH]);

impl Salt {
    /// Generate a random salt.
    pub fn generate() -> Self {
        let mut salt = [0u8; SALT_LENGTH];
        rand::thread_rng().fill_bytes(&mut salt);
        Self(salt)
    }

    pub fn from_bytes(bytes: [u8; SALT_LENGTH]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; SALT_LENGTH] {
        &self.0
    }
}

impl Serialize for Salt {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&URL_SAFE_NO_PAD.encode(self.0))
    }
}

impl<'de> Deserialize<'de> for Salt {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        let bytes = URL_SAFE_NO_PAD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)?;
        let salt: [u8; SALT_LENGTH] = bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("salt must be 32 bytes"))?;
        Ok(Self(salt))
    }
}
