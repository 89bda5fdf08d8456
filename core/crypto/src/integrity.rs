//! Container integrity tags.
//!
//! With the HMAC provider the whole container (header bytes and encrypted
//! payload) is authenticated under a key derived from a separate integrity
//! password, independent of the credential that decrypts the payload.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::kdf::{derive_bytes, KdfParams};
use crate::keys::{Salt, KEY_LENGTH};
use tvault_common::{Error, IntegrityType, Result};

type HmacSha256 = Hmac<Sha256>;

/// Length of an HMAC-SHA256 tag.
pub const TAG_LENGTH: usize = 32;

/// Key for integrity tags, derived from the integrity password.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct IntegrityKey {
    key: [u8; KEY_LENGTH],
}

impl IntegrityKey {
    /// Derive the key with Argon2id.
    ///
    /// # Errors
    /// - Returns error if the password is empty or params are invalid
    pub fn derive(password: &[u8], salt: &Salt, params: &KdfParams) -> Result<Self> {
        derive_bytes(password, salt, params).map(|key| Self { key })
    }

    pub fn from_bytes(key: [u8; KEY_LENGTH]) -> Self {
        Self { key }
    }

    fn mac(&self) -> Result<HmacSha256> {
        HmacSha256::new_from_slice(&self.key)
            .map_err(|e| Error::Crypto(format!("Invalid HMAC key: {}", e)))
    }
}

impl fmt::Debug for IntegrityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IntegrityKey([REDACTED])")
    }
}

/// Integrity provider selected from the container header.
#[derive(Debug, Clone)]
pub enum IntegrityProvider {
    None,
    Hmac(IntegrityKey),
}

impl IntegrityProvider {
    pub fn kind(&self) -> IntegrityType {
        match self {
            IntegrityProvider::None => IntegrityType::None,
            IntegrityProvider::Hmac(_) => IntegrityType::Hmac,
        }
    }

    /// Compute the tag over the concatenation of `parts`.
    ///
    /// # Postconditions
    /// - Empty for `None`, `TAG_LENGTH` bytes for `Hmac`
    pub fn tag(&self, parts: &[&[u8]]) -> Result<Vec<u8>> {
        match self {
            IntegrityProvider::None => Ok(Vec::new()),
            IntegrityProvider::Hmac(key) => {
                let mut mac = key.mac()?;
                for part in parts {
                    mac.update(part);
                }
                Ok(mac.finalize().into_bytes().to_vec())
            }
        }
    }

    /// Verify `tag` over the concatenation of `parts` in constant time.
    ///
    /// `None` accepts any input.
    pub fn verify(&self, parts: &[&[u8]], tag: &[u8]) -> bool {
        match self {
            IntegrityProvider::None => true,
            IntegrityProvider::Hmac(key) => {
                let Ok(mut mac) = key.mac() else {
                    return false;
                };
                for part in parts {
                    mac.update(part);
                }
                mac.verify_slice(tag).is_ok()
            }
        }
    }
}
