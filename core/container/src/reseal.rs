//! Resealing: re-encrypting a container from its mount folder.
//!
//! The current credentials are checked in full (key check, integrity tag and
//! payload decryption) before anything new is accepted. The folder at the
//! mount path is then packed and sealed under the same container id, with
//! updated metadata and optionally new key material or integrity settings.
//! The result replaces the target through a temp file and rename, so the
//! original is untouched on any failure.

use chrono::Utc;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use tvault_common::{
    ContainerId, EngineError, EngineResult, ErrorCode, IntegrityType, Passphrase, ResultExt,
    SensitiveBytes, TokenType,
};
use tvault_crypto::IntegrityProvider;

use crate::compression;
use crate::config::EngineConfig;
use crate::format::{ContainerHeader, IntegrityHeader, KeyHeader, Metadata, ShamirParams, FORMAT_VERSION};
use crate::paths::{resolve_path, StagedFile};
use crate::progress::{Operation, Stage, StageObserver};
use crate::seal::{
    assemble, commit_container, encrypt_payload, new_integrity, prepare_key, KeySource,
    ShamirRequest,
};
use crate::token_io::{CredentialInput, IssuedTokens};
use crate::unseal::{open_and_decrypt, Opened};

/// Metadata fields to replace. `None` keeps the current value.
#[derive(Debug, Clone, Default)]
pub struct MetadataUpdate {
    pub name: Option<String>,
    pub comment: Option<String>,
    pub tags: Option<Vec<String>>,
}

/// Integrity changes.
#[derive(Debug, Default)]
pub struct IntegrityUpdate {
    /// Target provider. `None` keeps the current one.
    pub provider: Option<IntegrityType>,
    /// Password for the current `hmac` tag.
    pub current_password: Option<Passphrase>,
    /// New password. Without one an `hmac` container keeps its key.
    pub new_password: Option<Passphrase>,
}

/// New key material.
#[derive(Debug, Default)]
pub struct RekeyRequest {
    /// Target token type. `None` keeps the current one.
    pub token_type: Option<TokenType>,
    /// Passphrase for a `none` target; seed material for `master`/`share`.
    pub new_passphrase: Option<Passphrase>,
    /// Share parameters for a `share` target. Defaults to the current ones.
    pub shamir: Option<ShamirRequest>,
}

impl RekeyRequest {
    /// Whether any new key material was asked for.
    pub fn is_requested(&self) -> bool {
        self.token_type.is_some() || self.new_passphrase.is_some() || self.shamir.is_some()
    }
}

/// Parameters of a reseal.
#[derive(Debug)]
pub struct ResealRequest {
    pub current_path: PathBuf,
    /// Defaults to `current_path`.
    pub new_path: Option<PathBuf>,
    /// Folder whose contents become the new payload.
    pub folder: PathBuf,
    pub credentials: CredentialInput,
    pub metadata: MetadataUpdate,
    pub integrity: IntegrityUpdate,
    pub rekey: RekeyRequest,
}

impl ResealRequest {
    pub fn new(
        current_path: impl Into<PathBuf>,
        folder: impl Into<PathBuf>,
        credentials: CredentialInput,
    ) -> Self {
        Self {
            current_path: current_path.into(),
            new_path: None,
            folder: folder.into(),
            credentials,
            metadata: MetadataUpdate::default(),
            integrity: IntegrityUpdate::default(),
            rekey: RekeyRequest::default(),
        }
    }

    /// Where the resealed container is written.
    pub fn target(&self) -> &Path {
        match &self.new_path {
            Some(path) if !path.as_os_str().is_empty() => path,
            _ => &self.current_path,
        }
    }
}

/// Result of a reseal.
#[derive(Debug)]
pub struct ResealOutcome {
    pub path: PathBuf,
    pub id: ContainerId,
    pub size: u64,
    /// Present only when new key material was issued.
    pub tokens: Option<IssuedTokens>,
}

/// Whether two paths name the same file.
pub(crate) fn same_path(a: &Path, b: &Path) -> bool {
    resolve_path(a) == resolve_path(b)
}

fn validate(req: &ResealRequest) -> EngineResult<()> {
    if req.current_path.as_os_str().is_empty() {
        return Err(ErrorCode::ContainerCurrentPathRequired.into());
    }
    if req.folder.as_os_str().is_empty() {
        return Err(ErrorCode::ContainerFolderPathRequired.into());
    }
    if !req.folder.is_dir() {
        return Err(EngineError::new(ErrorCode::ContainerFolderPathRequired)
            .with_details(format!("not a directory: {}", req.folder.display())));
    }

    let target = req.target();
    if !same_path(target, &req.current_path) && target.exists() {
        return Err(EngineError::new(ErrorCode::ContainerPathExists)
            .with_details(target.display().to_string()));
    }

    if let Some(shamir) = &req.rekey.shamir {
        tvault_crypto::shamir::validate_params(shamir.shares, shamir.threshold)?;
    }
    Ok(())
}

/// How the key is carried into the new container.
enum KeyPlan {
    Keep,
    Rekey {
        token_type: TokenType,
        source: KeySource,
        shamir: Option<ShamirRequest>,
    },
}

fn plan_key(rekey: &RekeyRequest, current: &ContainerHeader) -> EngineResult<KeyPlan> {
    if !rekey.is_requested() {
        return Ok(KeyPlan::Keep);
    }
    let token_type = rekey.token_type.unwrap_or(current.token_type);
    let passphrase = rekey.new_passphrase.clone().filter(|p| !p.is_empty());

    let source = match (token_type, passphrase) {
        (_, Some(passphrase)) => KeySource::Passphrase(passphrase),
        (TokenType::None, None) => return Err(ErrorCode::ContainerPassphraseRequired.into()),
        (_, None) => KeySource::Random,
    };
    let shamir = rekey.shamir.or_else(|| {
        current.shamir.map(|p| ShamirRequest {
            shares: p.shares as u32,
            threshold: p.threshold as u32,
        })
    });
    Ok(KeyPlan::Rekey {
        token_type,
        source,
        shamir,
    })
}

/// How integrity is carried into the new container.
enum IntegrityPlan {
    None,
    Keep,
    New(Passphrase),
}

fn plan_integrity(update: &IntegrityUpdate, current: &IntegrityHeader) -> EngineResult<IntegrityPlan> {
    let target = update.provider.unwrap_or(current.provider);
    let new_password = update.new_password.clone().filter(|p| !p.is_empty());

    match (target, new_password, current.provider) {
        (IntegrityType::None, _, _) => Ok(IntegrityPlan::None),
        (IntegrityType::Hmac, Some(password), _) => Ok(IntegrityPlan::New(password)),
        (IntegrityType::Hmac, None, IntegrityType::Hmac) => Ok(IntegrityPlan::Keep),
        (IntegrityType::Hmac, None, IntegrityType::None) => {
            Err(ErrorCode::IntegrityProviderNewPassphraseRequired.into())
        }
    }
}

/// Reseal the container at `req.current_path` from `req.folder`.
///
/// # Preconditions
/// - `req.credentials` open the current container
/// - `req.integrity.current_password` is set if the container uses `hmac`
///
/// # Postconditions
/// - The container id and creation time are preserved
/// - `updated_at` is now
/// - On failure the file at `req.current_path` is byte-for-byte unchanged
///   and nothing is left at `req.new_path`
///
/// # Errors
/// - `ContainerPathExists` if a distinct `new_path` already exists
/// - Every unseal credential and integrity error
/// - Reseal-phase operational errors
pub fn reseal(
    req: &ResealRequest,
    config: &EngineConfig,
    observer: &mut dyn StageObserver,
) -> EngineResult<ResealOutcome> {
    let op = Operation::Reseal;
    observer.on_stage(Stage::Validating);
    validate(req)?;
    let target = req.target().to_path_buf();
    let in_place = same_path(&target, &req.current_path);

    let Opened {
        file,
        master,
        integrity,
        archive,
    } = open_and_decrypt(
        op,
        &req.current_path,
        &req.credentials,
        req.integrity.current_password.as_ref(),
        observer,
    )?;
    drop(archive);
    let current = file.header;
    let key_plan = plan_key(&req.rekey, &current)?;
    let integrity_plan = plan_integrity(&req.integrity, &current.integrity)?;
    debug!(id = %current.id, in_place, "Current credentials verified");

    observer.on_stage(Stage::Compressing);
    let archive = SensitiveBytes::new(
        compression::pack(current.compression, &req.folder).map_err(|e| op.pack_error(e))?,
    );

    observer.on_stage(Stage::KeyPreparing);
    let id = current.id;
    let (master, key_header, token_type, shamir, tokens): (
        _,
        KeyHeader,
        TokenType,
        Option<ShamirParams>,
        Option<IssuedTokens>,
    ) = match key_plan {
        KeyPlan::Keep => (
            master,
            current.key.clone(),
            current.token_type,
            current.shamir,
            None,
        ),
        KeyPlan::Rekey {
            token_type,
            source,
            shamir,
        } => {
            let prepared = prepare_key(op, token_type, &source, shamir, &id, &config.kdf)?;
            (
                prepared.master,
                prepared.header,
                token_type,
                prepared.shamir,
                Some(prepared.tokens),
            )
        }
    };

    observer.on_stage(Stage::Encrypting);
    let payload = encrypt_payload(op, &master, &id, &archive, config.chunk_size)?;
    drop(archive);

    observer.on_stage(Stage::TaggingIntegrity);
    let (provider, integrity_header) = match integrity_plan {
        IntegrityPlan::None => (IntegrityProvider::None, IntegrityHeader::none()),
        IntegrityPlan::Keep => (integrity, current.integrity.clone()),
        IntegrityPlan::New(password) => new_integrity(
            op,
            IntegrityType::Hmac,
            Some(&password),
            &config.integrity_kdf,
        )?,
    };

    let update = &req.metadata;
    let header = ContainerHeader {
        id,
        version: FORMAT_VERSION,
        metadata: Metadata {
            name: update
                .name
                .clone()
                .filter(|n| !n.is_empty())
                .unwrap_or_else(|| current.metadata.name.clone()),
            comment: update
                .comment
                .clone()
                .unwrap_or_else(|| current.metadata.comment.clone()),
            tags: update
                .tags
                .clone()
                .unwrap_or_else(|| current.metadata.tags.clone()),
            created_at: current.metadata.created_at,
            updated_at: Utc::now(),
        },
        token_type,
        shamir: if token_type == TokenType::Share { shamir } else { None },
        compression: current.compression,
        integrity: integrity_header,
        key: key_header,
    };
    let file = assemble(op, header, payload, &provider)?;

    observer.on_stage(Stage::Writing);
    let bytes = file.to_bytes();
    let staged = StagedFile::write(&target, &bytes)
        .code(ErrorCode::ResealWriteContainer)
        .map_err(|e| e.with_details(target.display().to_string()))?;
    commit_container(op, staged, in_place)?;

    observer.on_stage(Stage::Done);
    info!(
        path = %target.display(),
        id = %id,
        size = bytes.len(),
        rekeyed = tokens.is_some(),
        token_type = %token_type,
        integrity = %provider.kind(),
        "Container resealed"
    );

    Ok(ResealOutcome {
        path: target,
        id,
        size: bytes.len() as u64,
        tokens,
    })
}
