//! On-disk container format.
//!
//! Layout (integers little-endian):
//!
//! ```text
//! magic    4   "TVLT"
//! version  u16
//! hdr_len  u32
//! header   hdr_len bytes of JSON
//! hdr_crc  u32  CRC-32 of magic..header
//! pay_len  u64
//! payload  pay_len bytes (chunked AEAD stream)
//! tag_len  u8   0 or 32
//! tag      tag_len bytes
//! ```
//!
//! Everything up to and including the header is readable without any key,
//! which is what the scanner and info reader rely on.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use thiserror::Error;

use tvault_common::{
    CompressionType, ContainerId, EngineError, ErrorCode, IntegrityType, TokenType,
};
use tvault_crypto::{KdfParams, Salt};

/// File signature.
pub const MAGIC: &[u8; 4] = b"TVLT";

/// Current format version.
pub const FORMAT_VERSION: u16 = 1;

/// Conventional file extension for containers.
pub const CONTAINER_EXTENSION: &str = "tvlt";

/// Upper bound on the JSON header size.
pub const MAX_HEADER_LEN: u32 = 1024 * 1024;

const PREFIX_LEN: usize = 4 + 2 + 4;

/// Errors reading or parsing a container file.
#[derive(Debug, Error)]
pub enum FormatError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Not a container: bad signature")]
    BadMagic,

    #[error("Unsupported container version {0}")]
    UnsupportedVersion(u16),

    #[error("Header length {0} out of range")]
    HeaderTooLarge(u32),

    #[error("Header checksum mismatch")]
    ChecksumMismatch,

    #[error("Malformed header: {0}")]
    Header(#[from] serde_json::Error),

    #[error("Container is truncated")]
    Truncated,

    #[error("Invalid integrity tag length {0}")]
    TagLength(u8),

    #[error("Unexpected data after integrity tag")]
    TrailingData,
}

impl FormatError {
    /// Wrap into the open error of the calling phase.
    ///
    /// Unsupported versions keep their own code; everything else means the
    /// file is missing, not a container, or corrupt.
    pub fn into_engine(self, open_code: ErrorCode) -> EngineError {
        match self {
            FormatError::UnsupportedVersion(_) => {
                EngineError::wrap(ErrorCode::ContainerVersionUnsupported, self)
            }
            other => EngineError::wrap(open_code, other),
        }
    }
}

fn read_exact_or_truncated<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<(), FormatError> {
    reader.read_exact(buf).map_err(|e| match e.kind() {
        std::io::ErrorKind::UnexpectedEof => FormatError::Truncated,
        _ => FormatError::Io(e),
    })
}

/// Descriptive metadata, readable without a key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub name: String,
    #[serde(default)]
    pub comment: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Shamir parameters, present for `share` containers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShamirParams {
    pub shares: u8,
    pub threshold: u8,
}

/// Integrity provider settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityHeader {
    pub provider: IntegrityType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub salt: Option<Salt>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kdf: Option<KdfParams>,
}

impl IntegrityHeader {
    pub fn none() -> Self {
        Self {
            provider: IntegrityType::None,
            salt: None,
            kdf: None,
        }
    }
}

/// Master key settings.
///
/// `salt` and `kdf` are present when the master key is derived from a
/// passphrase at unseal time (token type `none`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyHeader {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub salt: Option<Salt>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kdf: Option<KdfParams>,
    /// Base64 key-check blob.
    pub check: String,
}

/// Unencrypted container header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerHeader {
    pub id: ContainerId,
    pub version: u16,
    pub metadata: Metadata,
    pub token_type: TokenType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shamir: Option<ShamirParams>,
    pub compression: CompressionType,
    pub integrity: IntegrityHeader,
    pub key: KeyHeader,
}

/// Encode the authenticated prefix: magic, version, length and JSON header.
pub fn encode_header(header: &ContainerHeader) -> Result<Vec<u8>, FormatError> {
    let json = serde_json::to_vec(header)?;
    let len = u32::try_from(json.len())
        .ok()
        .filter(|len| *len <= MAX_HEADER_LEN)
        .ok_or(FormatError::HeaderTooLarge(u32::MAX))?;

    let mut out = Vec::with_capacity(PREFIX_LEN + json.len());
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&json);
    Ok(out)
}

/// A parsed container.
#[derive(Debug, Clone)]
pub struct ContainerFile {
    pub header: ContainerHeader,
    /// Raw prefix bytes (magic through JSON header), covered by the tag.
    pub header_bytes: Vec<u8>,
    pub payload: Vec<u8>,
    pub tag: Vec<u8>,
}

impl ContainerFile {
    /// Serialize to the on-disk representation.
    pub fn to_bytes(&self) -> Vec<u8> {
        let crc = crc32fast::hash(&self.header_bytes);
        let mut out =
            Vec::with_capacity(self.header_bytes.len() + self.payload.len() + self.tag.len() + 17);
        out.extend_from_slice(&self.header_bytes);
        out.extend_from_slice(&crc.to_le_bytes());
        out.extend_from_slice(&(self.payload.len() as u64).to_le_bytes());
        out.extend_from_slice(&self.payload);
        out.push(self.tag.len() as u8);
        out.extend_from_slice(&self.tag);
        out
    }

    /// Parse a whole container from memory.
    pub fn parse(bytes: &[u8]) -> Result<Self, FormatError> {
        let mut reader = bytes;
        let (header, header_bytes) = read_header_from(&mut reader)?;

        let mut len = [0u8; 8];
        read_exact_or_truncated(&mut reader, &mut len)?;
        let pay_len = u64::from_le_bytes(len);
        if pay_len > reader.len() as u64 {
            return Err(FormatError::Truncated);
        }
        let (payload, rest) = reader.split_at(pay_len as usize);

        let (&tag_len, rest) = rest.split_first().ok_or(FormatError::Truncated)?;
        if tag_len != 0 && tag_len != 32 {
            return Err(FormatError::TagLength(tag_len));
        }
        if rest.len() < tag_len as usize {
            return Err(FormatError::Truncated);
        }
        if rest.len() > tag_len as usize {
            return Err(FormatError::TrailingData);
        }

        Ok(Self {
            header,
            header_bytes,
            payload: payload.to_vec(),
            tag: rest.to_vec(),
        })
    }

    /// Read and parse a container file.
    pub fn read(path: &Path) -> Result<Self, FormatError> {
        let bytes = std::fs::read(path)?;
        Self::parse(&bytes)
    }
}

fn read_header_from<R: Read>(reader: &mut R) -> Result<(ContainerHeader, Vec<u8>), FormatError> {
    let mut prefix = [0u8; PREFIX_LEN];
    read_exact_or_truncated(reader, &mut prefix[..4])?;
    if &prefix[..4] != MAGIC {
        return Err(FormatError::BadMagic);
    }
    read_exact_or_truncated(reader, &mut prefix[4..])?;

    let version = u16::from_le_bytes([prefix[4], prefix[5]]);
    if version != FORMAT_VERSION {
        return Err(FormatError::UnsupportedVersion(version));
    }
    let hdr_len = u32::from_le_bytes([prefix[6], prefix[7], prefix[8], prefix[9]]);
    if hdr_len > MAX_HEADER_LEN {
        return Err(FormatError::HeaderTooLarge(hdr_len));
    }

    let mut header_bytes = Vec::with_capacity(PREFIX_LEN + hdr_len as usize);
    header_bytes.extend_from_slice(&prefix);
    header_bytes.resize(PREFIX_LEN + hdr_len as usize, 0);
    read_exact_or_truncated(reader, &mut header_bytes[PREFIX_LEN..])?;

    let mut crc = [0u8; 4];
    read_exact_or_truncated(reader, &mut crc)?;
    if u32::from_le_bytes(crc) != crc32fast::hash(&header_bytes) {
        return Err(FormatError::ChecksumMismatch);
    }

    let header: ContainerHeader = serde_json::from_slice(&header_bytes[PREFIX_LEN..])?;
    if header.version != version {
        return Err(FormatError::UnsupportedVersion(header.version));
    }
    Ok((header, header_bytes))
}

/// Read only the unencrypted header of the container at `path`.
pub fn read_header(path: &Path) -> Result<ContainerHeader, FormatError> {
    let mut reader = BufReader::new(File::open(path)?);
    read_header_from(&mut reader).map(|(header, _)| header)
}

/// Whether `path` is a regular file starting with the container signature.
pub fn has_signature(path: &Path) -> bool {
    let Ok(mut file) = File::open(path) else {
        return false;
    };
    let mut magic = [0u8; 4];
    file.read_exact(&mut magic).is_ok() && &magic == MAGIC
}

#[cfg(test)]
pub(crate) fn sample_header() -> ContainerHeader {
    let now = Utc::now();
    ContainerHeader {
        id: ContainerId::generate(),
        version: FORMAT_VERSION,
        metadata: Metadata {
            name: "sample".to_string(),
            comment: "a comment".to_string(),
            tags: vec!["a".to_string(), "b".to_string()],
            created_at: now,
            updated_at: now,
        },
        token_type: TokenType::Share,
        shamir: Some(ShamirParams {
            shares: 5,
            threshold: 3,
        }),
        compression: CompressionType::Zip,
        integrity: IntegrityHeader::none(),
        key: KeyHeader {
            salt: None,
            kdf: None,
            check: "AAAA".to_string(),
        },
    }
}
