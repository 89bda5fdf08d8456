//! Argument shapes of the command surface.
//!
//! These mirror what the desktop bridge sends. Field names are part of the
//! wire contract; conversion into container requests happens here so the
//! engine only deals with typed values.

use serde::Deserialize;
use std::fmt;
use std::path::PathBuf;

use tvault_common::{CompressionType, EngineResult, IntegrityType, Passphrase, TokenType};
use tvault_container::{
    CredentialInput, IntegrityUpdate, KeySource, MetadataUpdate, RekeyRequest, ResealRequest,
    SealRequest, ShamirRequest, TokenSink, TokenSource,
};

/// Split a comma-separated tag list, dropping empty entries.
pub fn parse_tags(tags: Option<&str>) -> Vec<String> {
    tags.unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}

/// Arguments of `run_encrypt`.
#[derive(Clone, Default, Deserialize)]
pub struct EncryptArgs {
    pub name: Option<String>,
    pub container_path: String,
    pub folder_path: String,
    #[serde(default)]
    pub compression_type: String,
    pub passphrase: Option<String>,
    #[serde(default)]
    pub token_type: String,
    #[serde(default)]
    pub token_save_type: String,
    pub token_save_path: Option<String>,
    #[serde(default)]
    pub is_shamir_enabled: bool,
    pub number_of_shares: Option<u32>,
    pub threshold: Option<u32>,
    #[serde(default)]
    pub integrity_provider: String,
    pub additional_password: Option<String>,
    pub comment: Option<String>,
    pub tags: Option<String>,
    #[serde(default)]
    pub use_entropy: bool,
    #[serde(default)]
    pub overwrite: bool,
}

impl fmt::Debug for EncryptArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptArgs")
            .field("container_path", &self.container_path)
            .field("folder_path", &self.folder_path)
            .field("token_type", &self.token_type)
            .field("integrity_provider", &self.integrity_provider)
            .field("use_entropy", &self.use_entropy)
            .finish_non_exhaustive()
    }
}

impl EncryptArgs {
    /// Requested token type. An empty type with sharing enabled means
    /// `share`.
    pub fn token_type(&self) -> EngineResult<TokenType> {
        if self.token_type.trim().is_empty() && self.is_shamir_enabled {
            return Ok(TokenType::Share);
        }
        self.token_type.parse()
    }

    /// Build the seal request.
    ///
    /// `master`/`share` containers take the passphrase as seed material,
    /// falling back to OS randomness. Collected entropy is attached by the
    /// engine.
    pub fn to_request(&self) -> EngineResult<SealRequest> {
        let token_type = self.token_type()?;
        let compression = match self.compression_type.trim() {
            "" => CompressionType::Zip,
            other => other.parse()?,
        };
        let integrity: IntegrityType = self.integrity_provider.parse()?;
        let token_sink = TokenSink::from_args(
            &self.token_save_type,
            Some("json"),
            self.token_save_path.as_deref(),
        )?;

        let passphrase = Passphrase::from_optional(self.passphrase.as_deref());
        let key_source = match (token_type, passphrase) {
            (TokenType::None, passphrase) => passphrase.map(KeySource::Passphrase),
            (_, Some(passphrase)) => Some(KeySource::Passphrase(passphrase)),
            (_, None) => Some(KeySource::Random),
        };

        let mut req = SealRequest::new(&self.folder_path, &self.container_path);
        req.overwrite = self.overwrite;
        req.name = non_empty(&self.name).map(str::to_string);
        req.comment = self.comment.clone();
        req.tags = parse_tags(self.tags.as_deref());
        req.key_source = key_source;
        req.token_type = token_type;
        req.shamir = (token_type == TokenType::Share).then(|| ShamirRequest {
            shares: self.number_of_shares.unwrap_or(ShamirRequest::default().shares),
            threshold: self.threshold.unwrap_or(ShamirRequest::default().threshold),
        });
        req.integrity = integrity;
        req.integrity_password = Passphrase::from_optional(self.additional_password.as_deref());
        req.compression = compression;
        req.token_sink = token_sink;
        Ok(req)
    }
}

/// Arguments of `run_decrypt`.
#[derive(Clone, Default, Deserialize)]
pub struct DecryptArgs {
    pub container_path: String,
    pub folder_path: String,
    /// Passphrase, or a single token.
    pub token: Option<String>,
    pub master_token: Option<String>,
    pub token_reader_type: Option<String>,
    pub token_format: Option<String>,
    pub token_flag: Option<String>,
    pub token_path: Option<String>,
    pub additional_password: Option<String>,
}

impl fmt::Debug for DecryptArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecryptArgs")
            .field("container_path", &self.container_path)
            .field("folder_path", &self.folder_path)
            .field("token_reader_type", &self.token_reader_type)
            .field("token_format", &self.token_format)
            .field("token_path", &self.token_path)
            .finish_non_exhaustive()
    }
}

impl DecryptArgs {
    /// Collect the credentials the caller supplied.
    ///
    /// Resolution order:
    /// 1. `token` together with `master_token`: both are used
    /// 2. a token reader with a format: the reader decides
    /// 3. `token` alone: a passphrase, or a token if it is encoded
    pub fn credentials(&self) -> EngineResult<CredentialInput> {
        let token = non_empty(&self.token);
        let master = non_empty(&self.master_token);
        let reader = non_empty(&self.token_reader_type);
        let format = non_empty(&self.token_format);

        let input = match (token, master, reader, format) {
            (Some(token), Some(master), _, _) => {
                let mut input = CredentialInput::default();
                input.absorb(vec![token.to_string(), master.to_string()]);
                input
            }
            (_, _, Some(reader), Some(format)) => TokenSource::from_args(
                reader,
                Some(format),
                self.token_flag.as_deref(),
                self.token_path.as_deref(),
            )?
            .read()?,
            (Some(token), None, _, _) => {
                let mut input = CredentialInput::default();
                input.absorb(vec![token.to_string()]);
                input
            }
            (None, master, _, _) => {
                let mut input = CredentialInput::default();
                input.absorb(master.into_iter().map(str::to_string).collect());
                input
            }
        };
        Ok(input)
    }

    pub fn integrity_password(&self) -> Option<Passphrase> {
        Passphrase::from_optional(self.additional_password.as_deref())
    }
}

/// Arguments of `run_reseal`.
#[derive(Clone, Default, Deserialize)]
pub struct ResealArgs {
    pub current_path: String,
    pub new_path: Option<String>,
    pub folder_path: String,
    pub name: Option<String>,
    /// Current passphrase of a `none` container.
    pub passphrase: Option<String>,
    pub comment: Option<String>,
    pub tags: Option<String>,
    pub integrity_provider: Option<String>,
    pub current_integrity_password: Option<String>,
    pub new_integrity_password: Option<String>,
    pub master_token: Option<String>,
    pub shares: Option<Vec<String>>,
    /// Token type of the current container, selecting which credential
    /// field is read.
    pub token_type: Option<String>,
    pub token_json_path: Option<String>,
    pub new_passphrase: Option<String>,
    pub rekey_token_type: Option<String>,
    pub rekey_shares: Option<u32>,
    pub rekey_threshold: Option<u32>,
}

impl fmt::Debug for ResealArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResealArgs")
            .field("current_path", &self.current_path)
            .field("new_path", &self.new_path)
            .field("folder_path", &self.folder_path)
            .field("token_type", &self.token_type)
            .field("rekey_token_type", &self.rekey_token_type)
            .finish_non_exhaustive()
    }
}

impl ResealArgs {
    /// Credentials for the current container.
    ///
    /// With `token_type` set only the matching field is read: `master_token`
    /// for `master`, `token_json_path` or `shares` for `share`, `passphrase`
    /// for `none`. Without it every supplied field is used.
    pub fn credentials(&self) -> EngineResult<CredentialInput> {
        let mut input = CredentialInput::default();
        let token_type = match non_empty(&self.token_type) {
            Some(t) => Some(t.parse::<TokenType>()?),
            None => None,
        };

        let wants = |t: TokenType| token_type.is_none() || token_type == Some(t);
        if wants(TokenType::Share) {
            if let Some(path) = non_empty(&self.token_json_path) {
                let read = TokenSource::from_args("file", Some("json"), None, Some(path))?.read()?;
                input.absorb(read.tokens.clone());
            } else if let Some(shares) = &self.shares {
                input.absorb(shares.clone());
            }
        }
        if wants(TokenType::Master) {
            if let Some(master) = non_empty(&self.master_token) {
                input.absorb(vec![master.to_string()]);
            }
        }
        if wants(TokenType::None) {
            if let Some(passphrase) = non_empty(&self.passphrase) {
                input.absorb(vec![passphrase.to_string()]);
            }
        }
        Ok(input)
    }

    pub fn to_request(&self) -> EngineResult<ResealRequest> {
        let credentials = self.credentials()?;
        let mut req = ResealRequest::new(&self.current_path, &self.folder_path, credentials);
        req.new_path = non_empty(&self.new_path).map(PathBuf::from);

        req.metadata = MetadataUpdate {
            name: non_empty(&self.name).map(str::to_string),
            comment: self.comment.clone(),
            tags: self.tags.as_deref().map(|t| parse_tags(Some(t))),
        };

        req.integrity = IntegrityUpdate {
            provider: match non_empty(&self.integrity_provider) {
                Some(p) => Some(p.parse()?),
                None => None,
            },
            current_password: Passphrase::from_optional(
                self.current_integrity_password.as_deref(),
            ),
            new_password: Passphrase::from_optional(self.new_integrity_password.as_deref()),
        };

        let shamir = match (self.rekey_shares, self.rekey_threshold) {
            (None, None) => None,
            (shares, threshold) => Some(ShamirRequest {
                shares: shares.unwrap_or(ShamirRequest::default().shares),
                threshold: threshold.unwrap_or(ShamirRequest::default().threshold),
            }),
        };
        req.rekey = RekeyRequest {
            token_type: match non_empty(&self.rekey_token_type) {
                Some(t) => Some(t.parse()?),
                None => None,
            },
            new_passphrase: Passphrase::from_optional(self.new_passphrase.as_deref()),
            shamir,
        };
        Ok(req)
    }
}

/// Arguments of `run_container_info` and `container_info_once`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ContainerInfoArgs {
    pub path: String,
}
