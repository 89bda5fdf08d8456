//! Cryptographic primitives for tvault containers.
//!
//! This crate provides:
//! - Key derivation using Argon2id
//! - Authenticated, chunked encryption using XChaCha20-Poly1305
//! - Shamir secret sharing of master keys
//! - HMAC-SHA256 integrity tags
//! - Token encoding for master keys and shares
//! - Entropy accumulation for key generation
//!
//! # Security Guarantees
//! - All key material is automatically zeroized on drop
//! - No plaintext or key material is ever logged
//! - Constant-time operations for sensitive comparisons

pub mod aead;
pub mod entropy;
pub mod integrity;
pub mod kdf;
pub mod keys;
pub mod shamir;
pub mod stream;
pub mod token;

pub use entropy::{EntropyAccumulator, EntropySeed};
pub use integrity::{IntegrityKey, IntegrityProvider};
pub use kdf::{derive_master_key, KdfParams};
pub use keys::{generate_master_key, MasterKey, PayloadKey, Salt};
pub use shamir::{Share, ShamirError};
pub use stream::{DecryptingStream, EncryptingStream};
pub use token::{decode_any, decode_token, encode_token, Token, TokenError, TokenKind};
