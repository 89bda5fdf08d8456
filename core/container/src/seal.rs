//! Sealing a folder into a new container.
//!
//! The helpers below (key preparation, integrity setup, payload encryption
//! and the final write) are shared with reseal.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::Utc;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use tvault_common::{
    CompressionType, ContainerId, EngineError, EngineResult, ErrorCode, IntegrityType, Passphrase,
    ResultExt, SensitiveBytes, TokenType,
};
use tvault_crypto::shamir::{self, Share};
use tvault_crypto::stream::encrypt_bytes;
use tvault_crypto::{
    derive_master_key, generate_master_key, EntropySeed, IntegrityKey, IntegrityProvider,
    KdfParams, MasterKey, Salt,
};

use crate::compression;
use crate::config::EngineConfig;
use crate::format::{
    encode_header, ContainerFile, ContainerHeader, IntegrityHeader, KeyHeader, Metadata,
    ShamirParams, FORMAT_VERSION,
};
use crate::paths::StagedFile;
use crate::progress::{Operation, Stage, StageObserver};
use crate::token_io::{IssuedTokens, TokenSink};

/// Share count and threshold used when a caller enables sharing without
/// choosing them.
pub const DEFAULT_SHARES: u32 = 5;
pub const DEFAULT_THRESHOLD: u32 = 3;

/// Requested Shamir parameters, before validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShamirRequest {
    pub shares: u32,
    pub threshold: u32,
}

impl Default for ShamirRequest {
    fn default() -> Self {
        Self {
            shares: DEFAULT_SHARES,
            threshold: DEFAULT_THRESHOLD,
        }
    }
}

impl ShamirRequest {
    fn validate(&self) -> EngineResult<ShamirParams> {
        shamir::validate_params(self.shares, self.threshold)?;
        Ok(ShamirParams {
            shares: self.shares as u8,
            threshold: self.threshold as u8,
        })
    }
}

/// Material the master key is made from.
#[derive(Debug)]
pub enum KeySource {
    /// Derived with Argon2id for token type `none`; mixed with OS randomness
    /// for `master` and `share`.
    Passphrase(Passphrase),
    /// Seed taken from the entropy accumulator.
    Entropy(EntropySeed),
    /// OS randomness only. Not usable for token type `none`.
    Random,
}

impl KeySource {
    fn seed_bytes(&self) -> &[u8] {
        match self {
            KeySource::Passphrase(p) => p.as_bytes(),
            KeySource::Entropy(seed) => &seed.as_bytes()[..],
            KeySource::Random => &[],
        }
    }
}

/// Parameters of a seal.
#[derive(Debug)]
pub struct SealRequest {
    pub folder: PathBuf,
    pub destination: PathBuf,
    pub overwrite: bool,
    /// Defaults to the destination file stem.
    pub name: Option<String>,
    pub comment: Option<String>,
    pub tags: Vec<String>,
    pub key_source: Option<KeySource>,
    pub token_type: TokenType,
    /// Required for token type `share`, ignored otherwise.
    pub shamir: Option<ShamirRequest>,
    pub integrity: IntegrityType,
    pub integrity_password: Option<Passphrase>,
    pub compression: CompressionType,
    pub token_sink: TokenSink,
}

impl SealRequest {
    /// A request with no key source, no integrity and zip compression.
    pub fn new(folder: impl Into<PathBuf>, destination: impl Into<PathBuf>) -> Self {
        Self {
            folder: folder.into(),
            destination: destination.into(),
            overwrite: false,
            name: None,
            comment: None,
            tags: Vec::new(),
            key_source: None,
            token_type: TokenType::None,
            shamir: None,
            integrity: IntegrityType::None,
            integrity_password: None,
            compression: CompressionType::Zip,
            token_sink: TokenSink::Stdout,
        }
    }
}

/// Result of a seal.
#[derive(Debug)]
pub struct SealOutcome {
    pub path: PathBuf,
    pub id: ContainerId,
    pub size: u64,
    pub tokens: IssuedTokens,
}

/// A freshly prepared master key with its header entry and issued tokens.
pub(crate) struct PreparedKey {
    pub master: MasterKey,
    pub header: KeyHeader,
    pub shamir: Option<ShamirParams>,
    pub tokens: IssuedTokens,
}

/// Build the master key for a new container.
///
/// # Errors
/// - `ContainerPassphraseRequired` if `token_type` is `none` and the source
///   is not a passphrase
/// - Shamir parameter errors for `share`
/// - KDF and key-check failures under the operation's create code
pub(crate) fn prepare_key(
    op: Operation,
    token_type: TokenType,
    source: &KeySource,
    shamir_request: Option<ShamirRequest>,
    id: &ContainerId,
    kdf: &KdfParams,
) -> EngineResult<PreparedKey> {
    let create_code = match op {
        Operation::Reseal => ErrorCode::ResealEncryptContainer,
        _ => ErrorCode::SealCreateContainer,
    };

    let (master, salt, kdf) = match (token_type, source) {
        (TokenType::None, KeySource::Passphrase(passphrase)) => {
            let salt = Salt::generate();
            let master = derive_master_key(passphrase.as_bytes(), &salt, kdf).code(create_code)?;
            (master, Some(salt), Some(*kdf))
        }
        (TokenType::None, _) => {
            return Err(ErrorCode::ContainerPassphraseRequired.into());
        }
        (_, source) => (generate_master_key(source.seed_bytes()), None, None),
    };

    let check = master.key_check(id).code(create_code)?;
    let header = KeyHeader {
        salt,
        kdf,
        check: URL_SAFE_NO_PAD.encode(check),
    };

    let (shamir, tokens) = match token_type {
        TokenType::None => (None, IssuedTokens::default()),
        TokenType::Master => (None, IssuedTokens::master(&master)),
        TokenType::Share => {
            let params = shamir_request.unwrap_or_default().validate()?;
            let shares: Vec<Share> = shamir::split(
                &master,
                params.threshold as u32,
                params.shares as u32,
                id,
            )?;
            (Some(params), IssuedTokens::shares(&shares))
        }
    };

    Ok(PreparedKey {
        master,
        header,
        shamir,
        tokens,
    })
}

/// Create a fresh integrity provider.
///
/// # Errors
/// - `IntegrityProviderNewPassphraseRequired` for `hmac` without a password
pub(crate) fn new_integrity(
    op: Operation,
    kind: IntegrityType,
    password: Option<&Passphrase>,
    kdf: &KdfParams,
) -> EngineResult<(IntegrityProvider, IntegrityHeader)> {
    match kind {
        IntegrityType::None => Ok((IntegrityProvider::None, IntegrityHeader::none())),
        IntegrityType::Hmac => {
            let password = password
                .filter(|p| !p.is_empty())
                .ok_or(ErrorCode::IntegrityProviderNewPassphraseRequired)?;
            let salt = Salt::generate();
            let key = IntegrityKey::derive(password.as_bytes(), &salt, kdf)
                .code(op.derive_integrity_code())?;
            Ok((
                IntegrityProvider::Hmac(key),
                IntegrityHeader {
                    provider: IntegrityType::Hmac,
                    salt: Some(salt),
                    kdf: Some(*kdf),
                },
            ))
        }
    }
}

/// Encrypt an archive under the payload key of container `id`.
pub(crate) fn encrypt_payload(
    op: Operation,
    master: &MasterKey,
    id: &ContainerId,
    archive: &SensitiveBytes,
    chunk_size: usize,
) -> EngineResult<Vec<u8>> {
    let key = master.derive_payload_key(id);
    encrypt_bytes(key.as_bytes(), id.as_bytes(), archive.as_bytes(), chunk_size)
        .code(op.encrypt_code())
}

/// Encode the header and compute the integrity tag.
pub(crate) fn assemble(
    op: Operation,
    header: ContainerHeader,
    payload: Vec<u8>,
    provider: &IntegrityProvider,
) -> EngineResult<ContainerFile> {
    let create_header_code = match op {
        Operation::Reseal => ErrorCode::ResealWriteContainer,
        _ => ErrorCode::SealCreateContainerHeader,
    };
    let header_bytes = encode_header(&header).code(create_header_code)?;
    let tag = provider
        .tag(&[header_bytes.as_slice(), payload.as_slice()])
        .code(op.create_integrity_code())?;

    Ok(ContainerFile {
        header,
        header_bytes,
        payload,
        tag,
    })
}

/// Rename a staged container into place.
pub(crate) fn commit_container(
    op: Operation,
    staged: StagedFile,
    overwrite: bool,
) -> EngineResult<()> {
    let dest = staged.dest().to_path_buf();
    staged.commit(overwrite).map_err(|e| match e.kind() {
        io::ErrorKind::AlreadyExists => {
            EngineError::new(ErrorCode::ContainerPathExists).with_details(dest.display().to_string())
        }
        _ => EngineError::wrap(op.write_code(), e).with_details(dest.display().to_string()),
    })
}

/// Default container name for a destination path.
pub(crate) fn default_name(destination: &Path) -> String {
    destination
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

impl SealRequest {
    /// Check paths, credentials, Shamir parameters and the integrity
    /// password. Touches no key material.
    ///
    /// Returns the validated Shamir parameters for `share` containers.
    pub fn validate(&self) -> EngineResult<Option<ShamirParams>> {
        validate(self)
    }
}

fn validate(req: &SealRequest) -> EngineResult<Option<ShamirParams>> {
    if req.destination.as_os_str().is_empty() {
        return Err(ErrorCode::ContainerNewPathRequired.into());
    }
    if req.folder.as_os_str().is_empty() {
        return Err(ErrorCode::ContainerFolderPathRequired.into());
    }
    if !req.folder.is_dir() {
        return Err(EngineError::new(ErrorCode::ContainerFolderPathRequired)
            .with_details(format!("not a directory: {}", req.folder.display())));
    }
    if req.destination.exists() && !req.overwrite {
        return Err(EngineError::new(ErrorCode::ContainerPathExists)
            .with_details(req.destination.display().to_string()));
    }

    let shamir = match req.token_type {
        TokenType::Share => Some(req.shamir.unwrap_or_default().validate()?),
        _ => None,
    };

    match (&req.key_source, req.token_type) {
        (None, _) | (Some(KeySource::Entropy(_) | KeySource::Random), TokenType::None) => {
            return Err(ErrorCode::ContainerPassphraseRequired.into());
        }
        (Some(KeySource::Passphrase(p)), _) if p.is_empty() => {
            return Err(ErrorCode::ContainerPassphraseRequired.into());
        }
        _ => {}
    }

    if req.integrity == IntegrityType::Hmac
        && req.integrity_password.as_ref().map_or(true, Passphrase::is_empty)
    {
        return Err(ErrorCode::IntegrityProviderNewPassphraseRequired.into());
    }

    Ok(shamir)
}

/// Write issued tokens to the caller's token file.
fn write_tokens(
    token_type: TokenType,
    tokens: &IssuedTokens,
    sink: &TokenSink,
) -> EngineResult<Option<StagedFile>> {
    let TokenSink::File { path, format } = sink else {
        return Ok(None);
    };
    if tokens.is_empty() {
        return Ok(None);
    }
    let code = match token_type {
        TokenType::Share => ErrorCode::SealWriteTokensShare,
        _ => ErrorCode::SealWriteTokenMaster,
    };
    let text = SensitiveBytes::new(tokens.render(*format)?.into_bytes());
    StagedFile::write(path, text.as_bytes())
        .code(code)
        .map(Some)
        .map_err(|e| e.with_details(path.display().to_string()))
}

/// Seal `req.folder` into a new container at `req.destination`.
///
/// # Preconditions
/// - `req.folder` is a directory
/// - `req.destination` does not exist, unless `req.overwrite`
///
/// # Postconditions
/// - On success the container is fully written and synced
/// - On failure nothing exists at the destination that was not there before
///
/// # Errors
/// - Validation errors for missing paths, credentials or Shamir parameters
/// - Seal-phase operational errors for each failing stage
pub fn seal(
    req: &SealRequest,
    config: &EngineConfig,
    observer: &mut dyn StageObserver,
) -> EngineResult<SealOutcome> {
    observer.on_stage(Stage::Validating);
    let shamir_params = validate(req)?;
    let id = ContainerId::generate();
    let op = Operation::Seal;

    observer.on_stage(Stage::Compressing);
    let archive = SensitiveBytes::new(
        compression::pack(req.compression, &req.folder).map_err(|e| op.pack_error(e))?,
    );
    debug!(id = %id, archive_len = archive.len(), "Folder packed");

    observer.on_stage(Stage::KeyPreparing);
    let source = req
        .key_source
        .as_ref()
        .ok_or(ErrorCode::ContainerPassphraseRequired)?;
    let shamir_request = shamir_params.map(|p| ShamirRequest {
        shares: p.shares as u32,
        threshold: p.threshold as u32,
    });
    let key = prepare_key(op, req.token_type, source, shamir_request, &id, &config.kdf)?;

    observer.on_stage(Stage::Encrypting);
    let payload = encrypt_payload(op, &key.master, &id, &archive, config.chunk_size)?;
    drop(archive);

    observer.on_stage(Stage::TaggingIntegrity);
    let (provider, integrity) = new_integrity(
        op,
        req.integrity,
        req.integrity_password.as_ref(),
        &config.integrity_kdf,
    )?;

    let now = Utc::now();
    let header = ContainerHeader {
        id,
        version: FORMAT_VERSION,
        metadata: Metadata {
            name: req
                .name
                .clone()
                .filter(|n| !n.is_empty())
                .unwrap_or_else(|| default_name(&req.destination)),
            comment: req.comment.clone().unwrap_or_default(),
            tags: req.tags.clone(),
            created_at: now,
            updated_at: now,
        },
        token_type: req.token_type,
        shamir: key.shamir,
        compression: req.compression,
        integrity,
        key: key.header.clone(),
    };
    let file = assemble(op, header, payload, &provider)?;

    observer.on_stage(Stage::Writing);
    let bytes = file.to_bytes();
    let staged = StagedFile::write(&req.destination, &bytes)
        .code(ErrorCode::SealWriteContainer)
        .map_err(|e| e.with_details(req.destination.display().to_string()))?;

    let token_file = write_tokens(req.token_type, &key.tokens, &req.token_sink)?;
    let token_path = token_file.as_ref().map(|f| f.dest().to_path_buf());
    if let Some(token_file) = token_file {
        let code = match req.token_type {
            TokenType::Share => ErrorCode::SealWriteTokensShare,
            _ => ErrorCode::SealWriteTokenMaster,
        };
        token_file.commit(true).code(code)?;
    }

    if let Err(e) = commit_container(op, staged, req.overwrite) {
        if let Some(path) = token_path {
            if let Err(rm) = fs::remove_file(&path) {
                warn!(path = %path.display(), error = %rm, "Failed to remove token file");
            }
        }
        return Err(e);
    }

    observer.on_stage(Stage::Done);
    info!(
        path = %req.destination.display(),
        id = %id,
        size = bytes.len(),
        token_type = %req.token_type,
        integrity = %req.integrity,
        compression = %req.compression,
        "Container sealed"
    );

    Ok(SealOutcome {
        path: req.destination.clone(),
        id,
        size: bytes.len() as u64,
        tokens: key.tokens,
    })
}
