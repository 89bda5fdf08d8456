//! Finding containers on disk and reading their public headers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use tvault_common::{
    CompressionType, ContainerId, EngineError, EngineResult, ErrorCode, IntegrityType, ResultExt,
    TokenType,
};

use crate::format::{has_signature, read_header, ContainerHeader};
use crate::token_io::TokenFormat;

/// List the containers directly inside `dir`.
///
/// Files are recognised by signature, not extension. Subdirectories are not
/// descended into. A missing directory yields an empty list.
///
/// # Errors
/// - `FileOperation` if `dir` exists but cannot be listed
pub fn scan(dir: &Path) -> EngineResult<Vec<String>> {
    if !dir.exists() {
        debug!(dir = %dir.display(), "Scan directory missing");
        return Ok(Vec::new());
    }
    let entries = fs::read_dir(dir)
        .code(ErrorCode::FileOperation)
        .map_err(|e| e.with_details(dir.display().to_string()))?;

    let mut found = Vec::new();
    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "Skipping unreadable entry");
                continue;
            }
        };
        let is_file = entry.file_type().map(|t| t.is_file()).unwrap_or(false);
        let path = entry.path();
        if is_file && has_signature(&path) {
            found.push(path.to_string_lossy().into_owned());
        }
    }
    found.sort();
    debug!(dir = %dir.display(), count = found.len(), "Scan complete");
    Ok(found)
}

/// Public header fields of a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerInfo {
    pub id: ContainerId,
    pub name: String,
    pub version: u16,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub comment: String,
    pub tags: Vec<String>,
    pub token_type: TokenType,
    pub integrity_provider_type: IntegrityType,
    pub compression_type: CompressionType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shares: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<u8>,
}

impl From<ContainerHeader> for ContainerInfo {
    fn from(header: ContainerHeader) -> Self {
        Self {
            id: header.id,
            name: header.metadata.name,
            version: header.version,
            created_at: header.metadata.created_at,
            updated_at: header.metadata.updated_at,
            comment: header.metadata.comment,
            tags: header.metadata.tags,
            token_type: header.token_type,
            integrity_provider_type: header.integrity.provider,
            compression_type: header.compression,
            shares: header.shamir.map(|p| p.shares),
            threshold: header.shamir.map(|p| p.threshold),
        }
    }
}

impl ContainerInfo {
    /// Render as `key: value` lines.
    pub fn to_plaintext(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "id: {}", self.id);
        let _ = writeln!(out, "name: {}", self.name);
        let _ = writeln!(out, "version: {}", self.version);
        let _ = writeln!(out, "created_at: {}", self.created_at.to_rfc3339());
        let _ = writeln!(out, "updated_at: {}", self.updated_at.to_rfc3339());
        let _ = writeln!(out, "comment: {}", self.comment);
        let _ = writeln!(out, "tags: {}", self.tags.join(","));
        let _ = writeln!(out, "token_type: {}", self.token_type);
        let _ = writeln!(out, "integrity_provider_type: {}", self.integrity_provider_type);
        let _ = writeln!(out, "compression_type: {}", self.compression_type);
        if let (Some(shares), Some(threshold)) = (self.shares, self.threshold) {
            let _ = writeln!(out, "shares: {}", shares);
            let _ = writeln!(out, "threshold: {}", threshold);
        }
        out
    }
}

/// Read the unencrypted header of the container at `path`.
///
/// # Errors
/// - `InfoPathRequired` for an empty path
/// - `ContainerOpenFile` if the file is missing, not a container, or has a
///   corrupt header
/// - `ContainerVersionUnsupported` for a newer format
pub fn info(path: &Path) -> EngineResult<ContainerInfo> {
    if path.as_os_str().is_empty() {
        return Err(ErrorCode::InfoPathRequired.into());
    }
    let header = read_header(path).map_err(|e| {
        e.into_engine(ErrorCode::ContainerOpenFile)
            .with_details(path.display().to_string())
    })?;
    Ok(header.into())
}

/// Where container info is written besides the caller's result.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum InfoSink {
    #[default]
    Stdout,
    File { path: PathBuf, format: TokenFormat },
}

impl InfoSink {
    /// # Errors
    /// - `InfoWriterTypeInvalid` for a type other than `stdout` or `file`
    /// - `InfoWriterFormatInvalid` for an unknown format
    /// - `InfoWriterPathRequired` for `file` without a path
    pub fn from_args(
        writer_type: &str,
        format: Option<&str>,
        path: Option<&str>,
    ) -> EngineResult<Self> {
        let format = match format {
            None | Some("") => TokenFormat::Json,
            Some(s) => TokenFormat::parse(s).ok_or_else(|| {
                EngineError::new(ErrorCode::InfoWriterFormatInvalid).with_details(s)
            })?,
        };
        match writer_type {
            "" | "stdout" => Ok(InfoSink::Stdout),
            "file" => {
                let path = path
                    .filter(|p| !p.is_empty())
                    .ok_or(ErrorCode::InfoWriterPathRequired)?;
                Ok(InfoSink::File {
                    path: PathBuf::from(path),
                    format,
                })
            }
            other => Err(EngineError::new(ErrorCode::InfoWriterTypeInvalid).with_details(other)),
        }
    }

    /// Write `info` to the sink's file, if any.
    pub fn write(&self, info: &ContainerInfo) -> EngineResult<()> {
        let InfoSink::File { path, format } = self else {
            return Ok(());
        };
        let body = match format {
            TokenFormat::Json => {
                serde_json::to_string_pretty(info).code(ErrorCode::FileOperation)?
            }
            TokenFormat::Plaintext => info.to_plaintext(),
        };
        fs::write(path, body)
            .code(ErrorCode::FileOperation)
            .map_err(|e| e.with_details(path.display().to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{sample_header, ContainerFile, encode_header};

    fn write_container(path: &Path) -> ContainerHeader {
        let header = sample_header();
        let file = ContainerFile {
            header_bytes: encode_header(&header).unwrap(),
            header: header.clone(),
            payload: vec![1, 2, 3],
            tag: Vec::new(),
        };
        fs::write(path, file.to_bytes()).unwrap();
        header
    }

    #[test]
    fn test_scan_by_signature() {
        let dir = tempfile::tempdir().unwrap();
        write_container(&dir.path().join("b.tvlt"));
        write_container(&dir.path().join("a.dat"));
        fs::write(dir.path().join("fake.tvlt"), b"not a container").unwrap();
        fs::write(dir.path().join("tiny"), b"TV").unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        write_container(&dir.path().join("sub").join("nested.tvlt"));

        let found = scan(dir.path()).unwrap();
        let names: Vec<_> = found
            .iter()
            .map(|p| Path::new(p).file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.dat", "b.tvlt"]);
    }

    #[test]
    fn test_scan_missing_dir() {
        let dir = tempfile::tempdir().unwrap();
        assert!(scan(&dir.path().join("nope")).unwrap().is_empty());
    }

    #[test]
    fn test_info_reads_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.tvlt");
        let header = write_container(&path);

        let info = info(&path).unwrap();
        assert_eq!(info.id, header.id);
        assert_eq!(info.name, "sample");
        assert_eq!(info.tags, vec!["a", "b"]);
        assert_eq!(info.token_type, TokenType::Share);
        assert_eq!(info.shares, Some(5));
        assert_eq!(info.threshold, Some(3));

        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["integrity_provider_type"], "none");
        assert_eq!(json["compression_type"], "zip");
    }

    #[test]
    fn test_info_open_errors() {
        let dir = tempfile::tempdir().unwrap();
        let missing = info(&dir.path().join("missing.tvlt")).unwrap_err();
        assert_eq!(missing.code(), ErrorCode::ContainerOpenFile);
        assert!(missing.is_open_error());

        let junk = dir.path().join("junk.tvlt");
        fs::write(&junk, b"hello world, definitely not a container").unwrap();
        assert_eq!(info(&junk).unwrap_err().code(), ErrorCode::ContainerOpenFile);

        let path = dir.path().join("c.tvlt");
        write_container(&path);
        let mut bytes = fs::read(&path).unwrap();
        bytes[12] ^= 0xff;
        fs::write(&path, bytes).unwrap();
        assert_eq!(info(&path).unwrap_err().code(), ErrorCode::ContainerOpenFile);

        assert_eq!(info(Path::new("")).unwrap_err().code(), ErrorCode::InfoPathRequired);
    }

    #[test]
    fn test_info_sink() {
        assert_eq!(InfoSink::from_args("", None, None).unwrap(), InfoSink::Stdout);
        assert_eq!(
            InfoSink::from_args("socket", None, None).unwrap_err().code(),
            ErrorCode::InfoWriterTypeInvalid
        );
        assert_eq!(
            InfoSink::from_args("file", None, None).unwrap_err().code(),
            ErrorCode::InfoWriterPathRequired
        );
        assert_eq!(
            InfoSink::from_args("file", Some("xml"), Some("x")).unwrap_err().code(),
            ErrorCode::InfoWriterFormatInvalid
        );

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.tvlt");
        write_container(&path);
        let info = info(&path).unwrap();

        let out = dir.path().join("info.txt");
        let sink = InfoSink::from_args("file", Some("plaintext"), out.to_str()).unwrap();
        sink.write(&info).unwrap();
        let text = fs::read_to_string(&out).unwrap();
        assert!(text.contains("name: sample"));
        assert!(text.contains("threshold: 3"));

        let out = dir.path().join("info.json");
        let sink = InfoSink::from_args("file", None, out.to_str()).unwrap();
        sink.write(&info).unwrap();
        let parsed: ContainerInfo =
            serde_json::from_str(&fs::read_to_string(&out).unwrap()).unwrap();
        assert_eq!(parsed, info);
    }
}
