//! Chunked streaming encryption for container payloads.
//!
//! The payload is split into fixed-size chunks, each sealed independently
//! with XChaCha20-Poly1305. The chunk index and a final-chunk flag are bound
//! into each chunk's associated data together with a caller-supplied context,
//! so chunks cannot be reordered, dropped, duplicated or moved between
//! containers, and truncation after any chunk is detected.
//!
//! # Format
//! - Header: version (1) + chunk_size (4)
//! - Frames: final flag (1) + frame length (4) + nonce || ciphertext || tag

use std::io::{Read, Write};

use crate::aead::{decrypt_with_aad, encrypt_with_aad, NONCE_SIZE, TAG_SIZE};
use crate::keys::KEY_LENGTH;
use tvault_common::{Error, Result};

/// Default chunk size for streaming encryption (64 KiB).
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Upper bound accepted for chunk sizes (16 MiB).
pub const MAX_CHUNK_SIZE: usize = 16 * 1024 * 1024;

/// Header size: version (1) + chunk_size (4).
pub const HEADER_SIZE: usize = 5;

/// Stream encryption version.
pub const STREAM_VERSION: u8 = 1;

fn chunk_aad(context: &[u8], index: u64, is_final: bool) -> Vec<u8> {
    let mut aad = Vec::with_capacity(context.len() + 9);
    aad.extend_from_slice(context);
    aad.extend_from_slice(&index.to_le_bytes());
    aad.push(is_final as u8);
    aad
}

/// Read until `buf` is full or the reader is exhausted.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(filled)
}

fn check_key(key: &[u8]) -> Result<()> {
    if key.len() != KEY_LENGTH {
        return Err(Error::Crypto("Invalid key length".to_string()));
    }
    Ok(())
}

/// Encrypting stream that processes data in chunks.
pub struct EncryptingStream<'a> {
    key: &'a [u8],
    context: &'a [u8],
    chunk_size: usize,
}

impl<'a> EncryptingStream<'a> {
    /// Create a new encrypting stream bound to `context`.
    ///
    /// # Errors
    /// - Returns error if key length is invalid
    pub fn new(key: &'a [u8], context: &'a [u8]) -> Result<Self> {
        check_key(key)?;
        Ok(Self {
            key,
            context,
            chunk_size: DEFAULT_CHUNK_SIZE,
        })
    }

    /// Set custom chunk size, clamped to `1..=MAX_CHUNK_SIZE`.
    pub fn with_chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size.clamp(1, MAX_CHUNK_SIZE);
        self
    }

    /// Encrypt data from reader and write to writer.
    ///
    /// # Postconditions
    /// - Exactly one frame carries the final flag, and it is the last one
    /// - Empty input produces a single empty final frame
    ///
    /// # Errors
    /// - I/O errors from reader/writer
    /// - Encryption errors
    pub fn encrypt_stream<R: Read, W: Write>(&self, mut reader: R, mut writer: W) -> Result<u64> {
        writer.write_all(&[STREAM_VERSION])?;
        writer.write_all(&(self.chunk_size as u32).to_le_bytes())?;

        let mut current = vec![0u8; self.chunk_size];
        let mut next = vec![0u8; self.chunk_size];
        let mut len = read_full(&mut reader, &mut current)?;
        let mut index = 0u64;
        let mut total = 0u64;

        loop {
            // Only a full chunk can be followed by more data.
            let next_len = if len == self.chunk_size {
                read_full(&mut reader, &mut next)?
            } else {
                0
            };
            let is_final = next_len == 0;

            let aad = chunk_aad(self.context, index, is_final);
            let frame = encrypt_with_aad(self.key, &current[..len], &aad)?;
            writer.write_all(&[is_final as u8])?;
            writer.write_all(&(frame.len() as u32).to_le_bytes())?;
            writer.write_all(&frame)?;
            total += len as u64;

            if is_final {
                break;
            }
            std::mem::swap(&mut current, &mut next);
            len = next_len;
            index += 1;
        }

        Ok(total)
    }
}

/// Decrypting stream that processes encrypted chunks.
pub struct DecryptingStream<'a> {
    key: &'a [u8],
    context: &'a [u8],
}

impl<'a> DecryptingStream<'a> {
    /// Create a new decrypting stream bound to `context`.
    ///
    /// # Errors
    /// - Returns error if key length is invalid
    pub fn new(key: &'a [u8], context: &'a [u8]) -> Result<Self> {
        check_key(key)?;
        Ok(Self { key, context })
    }

    /// Decrypt data from reader and write to writer.
    ///
    /// # Preconditions
    /// - Format must match EncryptingStream output under the same context
    ///
    /// # Errors
    /// - I/O errors
    /// - Invalid format, truncation or trailing data
    /// - Authentication failure (tampered data, wrong key or context)
    pub fn decrypt_stream<R: Read, W: Write>(&self, mut reader: R, mut writer: W) -> Result<u64> {
        let mut header = [0u8; HEADER_SIZE];
        if read_full(&mut reader, &mut header)? != HEADER_SIZE {
            return Err(Error::Crypto("Truncated stream header".to_string()));
        }
        if header[0] != STREAM_VERSION {
            return Err(Error::Crypto(format!(
                "Unsupported stream version: {}",
                header[0]
            )));
        }
        let chunk_size = u32::from_le_bytes([header[1], header[2], header[3], header[4]]) as usize;
        if chunk_size == 0 || chunk_size > MAX_CHUNK_SIZE {
            return Err(Error::Crypto(format!("Invalid chunk size: {}", chunk_size)));
        }

        let max_frame = NONCE_SIZE + chunk_size + TAG_SIZE;
        let mut frame = Vec::with_capacity(max_frame);
        let mut total = 0u64;
        let mut index = 0u64;

        loop {
            let mut prefix = [0u8; 5];
            if read_full(&mut reader, &mut prefix)? != prefix.len() {
                return Err(Error::Crypto("Truncated stream".to_string()));
            }
            let is_final = match prefix[0] {
                0 => false,
                1 => true,
                other => {
                    return Err(Error::Crypto(format!("Invalid chunk flag: {}", other)));
                }
            };
            let frame_len = u32::from_le_bytes([prefix[1], prefix[2], prefix[3], prefix[4]]) as usize;
            if !(NONCE_SIZE + TAG_SIZE..=max_frame).contains(&frame_len) {
                return Err(Error::Crypto(format!("Invalid chunk length: {}", frame_len)));
            }

            frame.resize(frame_len, 0);
            if read_full(&mut reader, &mut frame)? != frame_len {
                return Err(Error::Crypto("Truncated stream".to_string()));
            }

            let aad = chunk_aad(self.context, index, is_final);
            let plaintext = decrypt_with_aad(self.key, &frame, &aad)?;
            writer.write_all(&plaintext)?;
            total += plaintext.len() as u64;

            if is_final {
                break;
            }
            index += 1;
        }

        let mut trailing = [0u8; 1];
        if read_full(&mut reader, &mut trailing)? != 0 {
            return Err(Error::Crypto("Trailing data after final chunk".to_string()));
        }

        Ok(total)
    }
}

/// Encrypt a complete byte slice using streaming encryption.
pub fn encrypt_bytes(key: &[u8], context: &[u8], data: &[u8], chunk_size: usize) -> Result<Vec<u8>> {
    let stream = EncryptingStream::new(key, context)?.with_chunk_size(chunk_size);
    let mut output = Vec::with_capacity(data.len() + HEADER_SIZE + 64);
    stream.encrypt_stream(data, &mut output)?;
    Ok(output)
}

/// Decrypt a complete byte slice that was encrypted with streaming encryption.
pub fn decrypt_bytes(key: &[u8], context: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    let stream = DecryptingStream::new(key, context)?;
    let mut output = Vec::with_capacity(data.len());
    stream.decrypt_stream(data, &mut output)?;
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; KEY_LENGTH] = [42u8; KEY_LENGTH];
    const CTX: &[u8] = b"container-1";

    #[test]
    fn test_stream_roundtrip() {
        let plaintext = b"Hello, streaming encryption!";
        let encrypted = encrypt_bytes(&KEY, CTX, plaintext, DEFAULT_CHUNK_SIZE).unwrap();
        assert_eq!(decrypt_bytes(&KEY, CTX, &encrypted).unwrap(), plaintext);
    }

    #[test]
    fn test_stream_multiple_chunks() {
        let plaintext: Vec<u8> = (0..(16 * 3 + 5)).map(|i| i as u8).collect();
        let encrypted = encrypt_bytes(&KEY, CTX, &plaintext, 16).unwrap();
        assert_eq!(decrypt_bytes(&KEY, CTX, &encrypted).unwrap(), plaintext);
    }

    #[test]
    fn test_stream_exact_multiple_of_chunk() {
        let plaintext = vec![7u8; 32];
        let encrypted = encrypt_bytes(&KEY, CTX, &plaintext, 16).unwrap();
        // Two full frames, no trailing empty frame.
        let frame = 5 + NONCE_SIZE + 16 + TAG_SIZE;
        assert_eq!(encrypted.len(), HEADER_SIZE + 2 * frame);
        assert_eq!(decrypt_bytes(&KEY, CTX, &encrypted).unwrap(), plaintext);
    }

    #[test]
    fn test_stream_empty_data() {
        let encrypted = encrypt_bytes(&KEY, CTX, b"", DEFAULT_CHUNK_SIZE).unwrap();
        assert_eq!(encrypted[HEADER_SIZE], 1);
        assert!(decrypt_bytes(&KEY, CTX, &encrypted).unwrap().is_empty());
    }

    #[test]
    fn test_stream_wrong_key_or_context_fails() {
        let encrypted = encrypt_bytes(&KEY, CTX, b"Secret", DEFAULT_CHUNK_SIZE).unwrap();
        assert!(decrypt_bytes(&[1u8; KEY_LENGTH], CTX, &encrypted).is_err());
        assert!(decrypt_bytes(&KEY, b"container-2", &encrypted).is_err());
    }

    #[test]
    fn test_stream_truncation_detected() {
        let plaintext = vec![1u8; 40];
        let encrypted = encrypt_bytes(&KEY, CTX, &plaintext, 16).unwrap();
        let frame = 5 + NONCE_SIZE + 16 + TAG_SIZE;

        // Drop the final frame entirely.
        let cut = &encrypted[..HEADER_SIZE + 2 * frame];
        assert!(decrypt_bytes(&KEY, CTX, cut).is_err());

        // Forge the final flag on an intermediate frame.
        let mut forged = cut.to_vec();
        forged[HEADER_SIZE + frame] = 1;
        assert!(decrypt_bytes(&KEY, CTX, &forged).is_err());
    }

    #[test]
    fn test_stream_reorder_detected() {
        let plaintext: Vec<u8> = (0..48).collect();
        let encrypted = encrypt_bytes(&KEY, CTX, &plaintext, 16).unwrap();
        let frame = 5 + NONCE_SIZE + 16 + TAG_SIZE;

        let mut swapped = encrypted[..HEADER_SIZE].to_vec();
        swapped.extend_from_slice(&encrypted[HEADER_SIZE + frame..HEADER_SIZE + 2 * frame]);
        swapped.extend_from_slice(&encrypted[HEADER_SIZE..HEADER_SIZE + frame]);
        swapped.extend_from_slice(&encrypted[HEADER_SIZE + 2 * frame..]);
        assert!(decrypt_bytes(&KEY, CTX, &swapped).is_err());
    }

    #[test]
    fn test_stream_trailing_data_rejected() {
        let mut encrypted = encrypt_bytes(&KEY, CTX, b"abc", DEFAULT_CHUNK_SIZE).unwrap();
        encrypted.push(0);
        assert!(decrypt_bytes(&KEY, CTX, &encrypted).is_err());
    }

    #[test]
    fn test_stream_header_format() {
        let encrypted = encrypt_bytes(&KEY, CTX, b"Test", DEFAULT_CHUNK_SIZE).unwrap();
        assert_eq!(encrypted[0], STREAM_VERSION);
        let chunk_size = u32::from_le_bytes(encrypted[1..5].try_into().unwrap());
        assert_eq!(chunk_size as usize, DEFAULT_CHUNK_SIZE);
    }
}
