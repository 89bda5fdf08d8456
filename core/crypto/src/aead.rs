//! Authenticated encryption using XChaCha20-Poly1305.
//!
//! XChaCha20-Poly1305 provides both confidentiality and authenticity,
//! with a 24-byte nonce that is safe for random generation. Ciphertexts are
//! laid out as `nonce || ciphertext || tag`.

use chacha20poly1305::{
    aead::{generic_array::GenericArray, Aead, AeadCore, KeyInit, OsRng, Payload},
    XChaCha20Poly1305,
};

use crate::keys::KEY_LENGTH;
use tvault_common::{Error, Result};

/// Nonce size for XChaCha20-Poly1305 (24 bytes).
pub const NONCE_SIZE: usize = 24;

/// Authentication tag size (16 bytes).
pub const TAG_SIZE: usize = 16;

fn cipher(key: &[u8]) -> Result<XChaCha20Poly1305> {
    if key.len() != KEY_LENGTH {
        return Err(Error::Crypto(format!(
            "Invalid key length: expected {}, got {}",
            KEY_LENGTH,
            key.len()
        )));
    }
    Ok(XChaCha20Poly1305::new(GenericArray::from_slice(key)))
}

/// Encrypt plaintext, authenticating `aad` alongside it.
///
/// # Postconditions
/// - Returns nonce || ciphertext || tag with a fresh random nonce
///
/// # Errors
/// - Returns error if key length is incorrect
pub fn encrypt_with_aad(key: &[u8], plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
    let cipher = cipher(key)?;
    let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);

    let ciphertext = cipher
        .encrypt(&nonce, Payload { msg: plaintext, aad })
        .map_err(|e| Error::Crypto(format!("Encryption failed: {}", e)))?;

    let mut result = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    result.extend_from_slice(&nonce);
    result.extend_from_slice(&ciphertext);
    Ok(result)
}

/// Decrypt output of [`encrypt_with_aad`].
///
/// # Errors
/// - Returns error if key length is incorrect
/// - Returns error if ciphertext is too short
/// - Returns error if the tag does not authenticate ciphertext and `aad`
pub fn decrypt_with_aad(key: &[u8], ciphertext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
    let cipher = cipher(key)?;

    if ciphertext.len() < NONCE_SIZE + TAG_SIZE {
        return Err(Error::Crypto("Ciphertext too short".to_string()));
    }

    let (nonce_bytes, encrypted) = ciphertext.split_at(NONCE_SIZE);
    cipher
        .decrypt(
            GenericArray::from_slice(nonce_bytes),
            Payload {
                msg: encrypted,
                aad,
            },
        )
        .map_err(|e| Error::Crypto(format!("Decryption failed: {}", e)))
}

/// Encrypt plaintext without associated data.
pub fn encrypt(key: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    encrypt_with_aad(key, plaintext, &[])
}

/// Decrypt ciphertext without associated data.
pub fn decrypt(key: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
    decrypt_with_aad(key, ciphertext, &[])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let key = [42u8; KEY_LENGTH];
        let ciphertext = encrypt(&key, b"Hello, World!").unwrap();
        assert_eq!(ciphertext.len(), NONCE_SIZE + 13 + TAG_SIZE);
        assert_eq!(decrypt(&key, &ciphertext).unwrap(), b"Hello, World!");
    }

    #[test]
    fn test_different_nonce_each_time() {
        let key = [42u8; KEY_LENGTH];
        let ct1 = encrypt(&key, b"same").unwrap();
        let ct2 = encrypt(&key, b"same").unwrap();
        assert_ne!(&ct1[..NONCE_SIZE], &ct2[..NONCE_SIZE]);
    }

    #[test]
    fn test_wrong_key_fails() {
        let ciphertext = encrypt(&[1u8; KEY_LENGTH], b"Secret data").unwrap();
        assert!(decrypt(&[2u8; KEY_LENGTH], &ciphertext).is_err());
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let key = [42u8; KEY_LENGTH];
        let mut ciphertext = encrypt(&key, b"Important data").unwrap();
        ciphertext[NONCE_SIZE + 5] ^= 0xFF;
        assert!(decrypt(&key, &ciphertext).is_err());
    }

    #[test]
    fn test_aad_must_match() {
        let key = [3u8; KEY_LENGTH];
        let ciphertext = encrypt_with_aad(&key, b"chunk", b"index-0").unwrap();

        assert_eq!(decrypt_with_aad(&key, &ciphertext, b"index-0").unwrap(), b"chunk");
        assert!(decrypt_with_aad(&key, &ciphertext, b"index-1").is_err());
        assert!(decrypt(&key, &ciphertext).is_err());
    }

    #[test]
    fn test_invalid_key_length() {
        assert!(encrypt(&[0u8; 16], b"data").is_err());
        assert!(decrypt(&[0u8; 16], &[0u8; 64]).is_err());
    }

    #[test]
    fn test_empty_plaintext() {
        let key = [42u8; KEY_LENGTH];
        let ciphertext = encrypt(&key, b"").unwrap();
        assert!(decrypt(&key, &ciphertext).unwrap().is_empty());
    }
}
