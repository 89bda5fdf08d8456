//! Opening a container and restoring its folder.
//!
//! Checks run in a fixed order and stop at the first failure: the file must
//! open and parse, the supplied credential kind must match the header, the
//! key must pass the key check, the integrity tag must verify, and only then
//! is the payload decrypted and unpacked.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use tvault_common::{
    EngineError, EngineResult, ErrorCode, IntegrityType, Passphrase, ResultExt, SensitiveBytes,
    TokenType,
};
use tvault_crypto::stream::decrypt_bytes;
use tvault_crypto::{decode_any, derive_master_key, shamir, IntegrityKey, IntegrityProvider};
use tvault_crypto::{MasterKey, Share, Token};

use crate::compression::{self, UnpackStats};
use crate::format::{ContainerFile, ContainerHeader};
use crate::progress::{Operation, Stage, StageObserver};
use crate::token_io::CredentialInput;

/// Parameters of an unseal.
#[derive(Debug)]
pub struct UnsealRequest {
    pub container: PathBuf,
    /// Created if missing.
    pub destination: PathBuf,
    pub credentials: CredentialInput,
    /// Required when the container uses `hmac` integrity.
    pub integrity_password: Option<Passphrase>,
}

/// Result of an unseal.
#[derive(Debug)]
pub struct UnsealOutcome {
    pub folder: PathBuf,
    pub header: ContainerHeader,
    pub stats: UnpackStats,
}

/// A verified, decrypted container.
pub(crate) struct Opened {
    pub file: ContainerFile,
    pub master: MasterKey,
    pub integrity: IntegrityProvider,
    pub archive: SensitiveBytes,
}

/// Key material matched against the header's token type.
enum Credential<'a> {
    Passphrase(&'a Passphrase),
    Master(MasterKey),
    Shares(Vec<Share>),
}

fn corrupt(op: Operation, what: &str) -> EngineError {
    EngineError::new(op.open_code()).with_details(format!("malformed header: {}", what))
}

/// Pick the credential the header asks for.
///
/// # Errors
/// - `TokenTypeInvalid` if only credentials of another kind were supplied
/// - `ContainerPassphraseRequired` if a `none` container gets nothing
/// - Get-token-string error if a `master`/`share` container gets nothing
fn resolve_credential<'a>(
    op: Operation,
    token_type: TokenType,
    input: &'a CredentialInput,
) -> EngineResult<Credential<'a>> {
    let mut tokens = Vec::with_capacity(input.tokens.len());
    for raw in &input.tokens {
        tokens.push(decode_any(raw).map_err(|e| op.token_error(e))?);
    }

    let mismatch = |found: &str| {
        EngineError::new(ErrorCode::TokenTypeInvalid).with_details(format!(
            "container expects {} credentials, got {}",
            token_type, found
        ))
    };

    match token_type {
        TokenType::None => match (&input.passphrase, tokens.is_empty()) {
            (Some(passphrase), _) => Ok(Credential::Passphrase(passphrase)),
            (None, false) => Err(mismatch("tokens")),
            (None, true) => Err(ErrorCode::ContainerPassphraseRequired.into()),
        },
        TokenType::Master => {
            let mut shares = 0;
            for token in tokens {
                match token {
                    Token::Master(key) => return Ok(Credential::Master(key)),
                    Token::Share(_) => shares += 1,
                    Token::Passphrase(_) => {}
                }
            }
            if shares > 0 {
                Err(mismatch("share tokens"))
            } else if input.passphrase.is_some() {
                Err(mismatch("a passphrase"))
            } else {
                Err(op.token_string_code().into())
            }
        }
        TokenType::Share => {
            let mut shares = Vec::new();
            for token in tokens {
                match token {
                    Token::Share(share) => shares.push(share),
                    Token::Master(_) => return Err(mismatch("a master token")),
                    Token::Passphrase(_) => {}
                }
            }
            if !shares.is_empty() {
                Ok(Credential::Shares(shares))
            } else if input.passphrase.is_some() {
                Err(mismatch("a passphrase"))
            } else {
                Err(op.token_string_code().into())
            }
        }
    }
}

fn restore_master(
    op: Operation,
    header: &ContainerHeader,
    credential: Credential<'_>,
) -> EngineResult<MasterKey> {
    let master = match credential {
        Credential::Passphrase(passphrase) => {
            let salt = header.key.salt.as_ref().ok_or_else(|| corrupt(op, "key salt"))?;
            let kdf = header.key.kdf.as_ref().ok_or_else(|| corrupt(op, "key kdf"))?;
            derive_master_key(passphrase.as_bytes(), salt, kdf).code(op.restore_key_code())?
        }
        Credential::Master(key) => key,
        Credential::Shares(shares) => {
            let params = header.shamir.ok_or_else(|| corrupt(op, "shamir parameters"))?;
            shamir::reconstruct(&shares, params.threshold, &header.id)
                .map_err(|e| op.shamir_error(e))?
        }
    };

    let check = URL_SAFE_NO_PAD
        .decode(header.key.check.as_bytes())
        .map_err(|_| corrupt(op, "key check"))?;
    if !master.verify_key_check(&header.id, &check) {
        return Err(ErrorCode::CredentialRejected.into());
    }
    Ok(master)
}

/// Rebuild the integrity provider from the header and verify the tag.
fn verify_integrity(
    op: Operation,
    file: &ContainerFile,
    password: Option<&Passphrase>,
) -> EngineResult<IntegrityProvider> {
    let provider = match file.header.integrity.provider {
        IntegrityType::None => {
            if !file.tag.is_empty() {
                return Err(EngineError::new(ErrorCode::IntegrityVerificationFailed)
                    .with_details("unexpected integrity tag"));
            }
            IntegrityProvider::None
        }
        IntegrityType::Hmac => {
            let password = password
                .filter(|p| !p.is_empty())
                .ok_or(ErrorCode::IntegrityCurrentPassphraseRequired)?;
            let integrity = &file.header.integrity;
            let salt = integrity.salt.as_ref().ok_or_else(|| corrupt(op, "integrity salt"))?;
            let kdf = integrity.kdf.as_ref().ok_or_else(|| corrupt(op, "integrity kdf"))?;
            let key = IntegrityKey::derive(password.as_bytes(), salt, kdf)
                .code(op.derive_integrity_code())?;
            IntegrityProvider::Hmac(key)
        }
    };

    if !provider.verify(&[file.header_bytes.as_slice(), file.payload.as_slice()], &file.tag) {
        return Err(ErrorCode::IntegrityVerificationFailed.into());
    }
    Ok(provider)
}

/// Open, authenticate and decrypt the container at `path`.
///
/// Reports `OpeningHeader` through `Decrypting` to `observer`.
pub(crate) fn open_and_decrypt(
    op: Operation,
    path: &Path,
    input: &CredentialInput,
    integrity_password: Option<&Passphrase>,
    observer: &mut dyn StageObserver,
) -> EngineResult<Opened> {
    observer.on_stage(Stage::OpeningHeader);
    let file = ContainerFile::read(path)
        .map_err(|e| e.into_engine(op.open_code()).with_details(path.display().to_string()))?;
    debug!(path = %path.display(), id = %file.header.id, "Header read");

    observer.on_stage(Stage::TokenResolving);
    let credential = resolve_credential(op, file.header.token_type, input)?;

    observer.on_stage(Stage::KeyReconstructing);
    let master = restore_master(op, &file.header, credential)?;

    observer.on_stage(Stage::IntegrityVerifying);
    let integrity = verify_integrity(op, &file, integrity_password)?;

    observer.on_stage(Stage::Decrypting);
    let key = master.derive_payload_key(&file.header.id);
    let archive = decrypt_bytes(key.as_bytes(), file.header.id.as_bytes(), &file.payload)
        .code(ErrorCode::UnsealContainer)?;

    Ok(Opened {
        file,
        master,
        integrity,
        archive: SensitiveBytes::new(archive),
    })
}

/// Restore the folder sealed in `req.container` into `req.destination`.
///
/// # Postconditions
/// - `req.destination` holds the sealed tree; existing files at the same
///   relative paths are overwritten
///
/// # Errors
/// - Open errors if the file is missing, not a container, or corrupt
/// - Credential errors, see the module documentation for their order
/// - Unpack errors
pub fn unseal(req: &UnsealRequest, observer: &mut dyn StageObserver) -> EngineResult<UnsealOutcome> {
    observer.on_stage(Stage::Validating);
    if req.container.as_os_str().is_empty() {
        return Err(ErrorCode::ContainerCurrentPathRequired.into());
    }
    if req.destination.as_os_str().is_empty() {
        return Err(ErrorCode::ContainerFolderPathRequired.into());
    }

    let opened = open_and_decrypt(
        Operation::Unseal,
        &req.container,
        &req.credentials,
        req.integrity_password.as_ref(),
        observer,
    )?;

    observer.on_stage(Stage::Decompressing);
    let header = opened.file.header.clone();
    let stats = compression::unpack(header.compression, opened.archive.as_bytes(), &req.destination)
        .map_err(|e| {
            let code = match e {
                tvault_common::Error::Io(_) => ErrorCode::UnsealUnpackContent,
                _ => ErrorCode::UnsealCompressionUnpack,
            };
            EngineError::wrap(code, e)
        })?;

    observer.on_stage(Stage::Done);
    info!(
        path = %req.container.display(),
        dest = %req.destination.display(),
        files = stats.files,
        bytes = stats.bytes,
        "Container unsealed"
    );

    Ok(UnsealOutcome {
        folder: req.destination.clone(),
        header,
        stats,
    })
}
