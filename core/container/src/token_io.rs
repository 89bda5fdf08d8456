//! Reading credentials from callers and writing issued tokens.
//!
//! Readers take tokens from a flag value or a file, as plaintext or JSON.
//! Writers either hand issued tokens back in the result only, or also write
//! them to a caller-chosen file.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use zeroize::{Zeroize, ZeroizeOnDrop};

use tvault_common::{EngineError, EngineResult, ErrorCode, Passphrase, ResultExt};
use tvault_crypto::token::is_encoded;
use tvault_crypto::{encode_token, MasterKey, Share, Token};

/// Separator between tokens in a plaintext flag or line.
pub const TOKEN_SEPARATOR: char = '|';

/// Where a reader takes tokens from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenReaderType {
    Flag,
    File,
}

impl FromStr for TokenReaderType {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "flag" => Ok(TokenReaderType::Flag),
            "file" => Ok(TokenReaderType::File),
            other => Err(EngineError::new(ErrorCode::TokenReaderTypeInvalid).with_details(other)),
        }
    }
}

/// Encoding of a token source or token file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TokenFormat {
    Plaintext,
    #[default]
    Json,
}

impl TokenFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenFormat::Plaintext => "plaintext",
            TokenFormat::Json => "json",
        }
    }

    pub(crate) fn parse(s: &str) -> Option<Self> {
        match s {
            "plaintext" => Some(TokenFormat::Plaintext),
            "json" => Some(TokenFormat::Json),
            _ => None,
        }
    }
}

impl fmt::Display for TokenFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Credentials supplied for opening a container.
///
/// `tokens` holds the raw strings; they are decoded once the container
/// header says which kind is expected.
#[derive(Clone, Default, Zeroize, ZeroizeOnDrop)]
pub struct CredentialInput {
    pub passphrase: Option<Passphrase>,
    pub tokens: Vec<String>,
}

impl CredentialInput {
    pub fn passphrase(passphrase: Passphrase) -> Self {
        Self {
            passphrase: Some(passphrase),
            tokens: Vec::new(),
        }
    }

    pub fn tokens(tokens: Vec<String>) -> Self {
        Self {
            passphrase: None,
            tokens,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.passphrase.is_none() && self.tokens.is_empty()
    }

    /// Add strings read from a caller. Unprefixed strings are passphrases;
    /// the first one wins if a passphrase was not already set.
    pub fn absorb(&mut self, values: Vec<String>) {
        for value in values {
            if is_encoded(&value) {
                self.tokens.push(value.trim().to_string());
            } else if self.passphrase.is_none() && !value.trim().is_empty() {
                self.passphrase = Some(Passphrase::new(value));
            }
        }
    }
}

impl fmt::Debug for CredentialInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialInput")
            .field("passphrase", &self.passphrase.is_some())
            .field("tokens", &self.tokens.len())
            .finish()
    }
}

/// A configured token reader.
#[derive(Clone)]
pub enum TokenSource {
    Flag { value: String, format: TokenFormat },
    File { path: PathBuf, format: TokenFormat },
}

impl fmt::Debug for TokenSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenSource::Flag { format, .. } => write!(f, "TokenSource::Flag({})", format),
            TokenSource::File { path, format } => {
                write!(f, "TokenSource::File({}, {})", path.display(), format)
            }
        }
    }
}

impl TokenSource {
    /// Build a reader from caller arguments.
    ///
    /// # Errors
    /// - `TokenReaderTypeInvalid` for an unknown reader type
    /// - `TokenReaderFormatInvalid` for an unknown format
    /// - `TokenReaderFlagRequired` / `TokenReaderPathRequired` when the
    ///   value for the chosen type is missing or empty
    pub fn from_args(
        reader_type: &str,
        format: Option<&str>,
        flag: Option<&str>,
        path: Option<&str>,
    ) -> EngineResult<Self> {
        let reader_type: TokenReaderType = reader_type.parse()?;
        let format = match format {
            None | Some("") => TokenFormat::Plaintext,
            Some(s) => TokenFormat::parse(s).ok_or_else(|| {
                EngineError::new(ErrorCode::TokenReaderFormatInvalid).with_details(s)
            })?,
        };

        match reader_type {
            TokenReaderType::Flag => {
                let value = flag
                    .filter(|v| !v.is_empty())
                    .ok_or(ErrorCode::TokenReaderFlagRequired)?;
                Ok(TokenSource::Flag {
                    value: value.to_string(),
                    format,
                })
            }
            TokenReaderType::File => {
                let path = path
                    .filter(|p| !p.is_empty())
                    .ok_or(ErrorCode::TokenReaderPathRequired)?;
                Ok(TokenSource::File {
                    path: PathBuf::from(path),
                    format,
                })
            }
        }
    }

    /// Read credentials.
    ///
    /// # Errors
    /// - `UnsealReadAll` if the token file cannot be read
    /// - `UnsealUnmarshalTokenList` for malformed or empty JSON documents
    pub fn read(&self) -> EngineResult<CredentialInput> {
        let mut input = CredentialInput::default();
        match self {
            TokenSource::Flag { value, format } => read_text(value, *format, &mut input)?,
            TokenSource::File { path, format } => {
                let mut text = std::fs::read_to_string(path)
                    .code(ErrorCode::UnsealReadAll)
                    .map_err(|e| e.with_details(path.display().to_string()))?;
                let result = read_text(&text, *format, &mut input);
                text.zeroize();
                result?;
            }
        }
        Ok(input)
    }
}

fn read_text(text: &str, format: TokenFormat, input: &mut CredentialInput) -> EngineResult<()> {
    match format {
        TokenFormat::Plaintext => {
            for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
                input.absorb(split_plaintext(line));
            }
            Ok(())
        }
        TokenFormat::Json => read_json(text, input),
    }
}

/// Split a plaintext value into tokens.
///
/// The value is split on `|` only when every piece is an encoded token, so a
/// passphrase containing `|` is kept whole.
pub fn split_plaintext(value: &str) -> Vec<String> {
    let pieces: Vec<&str> = value
        .split(TOKEN_SEPARATOR)
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect();
    if pieces.len() > 1 && pieces.iter().all(|p| is_encoded(p)) {
        pieces.into_iter().map(str::to_string).collect()
    } else {
        vec![value.to_string()]
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum TokenDocument {
    List(Vec<String>),
    Object(TokenFile),
}

#[derive(Deserialize)]
struct TokenFile {
    #[serde(default)]
    passphrase: Option<String>,
    #[serde(default)]
    master_token: Option<String>,
    #[serde(default)]
    share_list: Option<BTreeMap<String, String>>,
    #[serde(default)]
    token_list: Option<Vec<String>>,
}

fn read_json(text: &str, input: &mut CredentialInput) -> EngineResult<()> {
    let document: TokenDocument =
        serde_json::from_str(text).code(ErrorCode::UnsealUnmarshalTokenList)?;

    let mut values = Vec::new();
    match document {
        TokenDocument::List(list) => values.extend(list),
        TokenDocument::Object(file) => {
            if let Some(passphrase) = file.passphrase.filter(|p| !p.is_empty()) {
                input.passphrase = Some(Passphrase::new(passphrase));
            }
            values.extend(file.master_token);
            values.extend(file.share_list.into_iter().flat_map(|m| m.into_values()));
            values.extend(file.token_list.into_iter().flatten());
        }
    }

    if values.is_empty() && input.passphrase.is_none() {
        return Err(EngineError::new(ErrorCode::UnsealUnmarshalTokenList)
            .with_details("token document holds no tokens"));
    }
    input.absorb(values);
    Ok(())
}

/// Where issued tokens go besides the result.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum TokenSink {
    /// Only returned to the caller.
    #[default]
    Stdout,
    /// Also written to a caller-chosen file.
    File { path: PathBuf, format: TokenFormat },
}

impl TokenSink {
    /// Build a writer from caller arguments.
    ///
    /// # Errors
    /// - `TokenWriterTypeInvalid` for a type other than `stdout` or `file`
    /// - `TokenWriterFormatInvalid` for an unknown format
    /// - `TokenWriterPathRequired` for `file` without a path
    pub fn from_args(
        writer_type: &str,
        format: Option<&str>,
        path: Option<&str>,
    ) -> EngineResult<Self> {
        let format = match format {
            None | Some("") => TokenFormat::Json,
            Some(s) => TokenFormat::parse(s).ok_or_else(|| {
                EngineError::new(ErrorCode::TokenWriterFormatInvalid).with_details(s)
            })?,
        };
        match writer_type {
            "" | "stdout" => Ok(TokenSink::Stdout),
            "file" => {
                let path = path
                    .filter(|p| !p.is_empty())
                    .ok_or(ErrorCode::TokenWriterPathRequired)?;
                Ok(TokenSink::File {
                    path: PathBuf::from(path),
                    format,
                })
            }
            other => Err(EngineError::new(ErrorCode::TokenWriterTypeInvalid).with_details(other)),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        match self {
            TokenSink::Stdout => None,
            TokenSink::File { path, .. } => Some(path),
        }
    }
}

/// Tokens issued by seal or reseal.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuedTokens {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_list: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub share_list: Option<BTreeMap<String, String>>,
}

impl IssuedTokens {
    pub fn master(key: &MasterKey) -> Self {
        Self {
            master_token: Some(encode_token(&Token::Master(key.clone()))),
            token_list: None,
            share_list: None,
        }
    }

    pub fn shares(shares: &[Share]) -> Self {
        let mut list = Vec::with_capacity(shares.len());
        let mut map = BTreeMap::new();
        for share in shares {
            let token = encode_token(&Token::Share(share.clone()));
            map.insert(share.index().to_string(), token.clone());
            list.push(token);
        }
        Self {
            master_token: None,
            token_list: Some(list),
            share_list: Some(map),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.master_token.is_none() && self.token_list.is_none() && self.share_list.is_none()
    }

    /// Render for a token file.
    pub fn render(&self, format: TokenFormat) -> EngineResult<String> {
        match format {
            TokenFormat::Json => {
                serde_json::to_string_pretty(self).code(ErrorCode::SealGenerateAndSaveTokens)
            }
            TokenFormat::Plaintext => {
                let mut lines: Vec<&str> = Vec::new();
                lines.extend(self.master_token.as_deref());
                lines.extend(self.token_list.iter().flatten().map(String::as_str));
                let mut out = lines.join("\n");
                out.push('\n');
                Ok(out)
            }
        }
    }
}

impl fmt::Debug for IssuedTokens {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IssuedTokens")
            .field("master_token", &self.master_token.as_ref().map(|_| "[REDACTED]"))
            .field("token_list", &self.token_list.as_ref().map(Vec::len))
            .finish()
    }
}

impl Drop for IssuedTokens {
    fn drop(&mut self) {
        self.master_token.zeroize();
        self.token_list.zeroize();
        if let Some(map) = self.share_list.as_mut() {
            map.values_mut().for_each(Zeroize::zeroize);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tvault_common::ContainerId;
    use tvault_crypto::shamir;

    fn sample_shares() -> (ContainerId, Vec<Share>) {
        let id = ContainerId::generate();
        let key = MasterKey::from_bytes([5u8; 32]);
        let shares = shamir::split(&key, 2, 3, &id).unwrap();
        (id, shares)
    }

    #[test]
    fn test_reader_arg_errors() {
        let err = TokenSource::from_args("socket", None, None, None).unwrap_err();
        assert_eq!(err.code(), ErrorCode::TokenReaderTypeInvalid);

        let err = TokenSource::from_args("flag", Some("xml"), Some("x"), None).unwrap_err();
        assert_eq!(err.code(), ErrorCode::TokenReaderFormatInvalid);

        let err = TokenSource::from_args("flag", None, Some(""), None).unwrap_err();
        assert_eq!(err.code(), ErrorCode::TokenReaderFlagRequired);

        let err = TokenSource::from_args("file", Some("json"), None, None).unwrap_err();
        assert_eq!(err.code(), ErrorCode::TokenReaderPathRequired);
    }

    #[test]
    fn test_plaintext_flag_with_joined_shares() {
        let (_, shares) = sample_shares();
        let issued = IssuedTokens::shares(&shares);
        let list = issued.token_list.clone().unwrap();
        let joined = list.join("|");

        let source = TokenSource::from_args("flag", Some("plaintext"), Some(&joined), None).unwrap();
        let input = source.read().unwrap();
        assert_eq!(input.tokens, list);
        assert!(input.passphrase.is_none());
    }

    #[test]
    fn test_plaintext_flag_passphrase_with_separator() {
        let source =
            TokenSource::from_args("flag", Some("plaintext"), Some("pa|ss"), None).unwrap();
        let input = source.read().unwrap();
        assert!(input.tokens.is_empty());
        assert_eq!(input.passphrase.as_ref().unwrap().expose(), "pa|ss");
    }

    #[test]
    fn test_blank_values_are_not_passphrases() {
        let mut input = CredentialInput::default();
        input.absorb(vec!["  ".to_string(), "\t".to_string(), "real one".to_string()]);
        assert_eq!(input.passphrase.as_ref().unwrap().expose(), "real one");

        let mut input = CredentialInput::default();
        input.absorb(vec![" \n".to_string()]);
        assert!(input.is_empty());
    }

    #[test]
    fn test_json_file_from_issued_shares() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.json");
        let (_, shares) = sample_shares();
        let issued = IssuedTokens::shares(&shares);
        std::fs::write(&path, issued.render(TokenFormat::Json).unwrap()).unwrap();

        let source = TokenSource::from_args(
            "file",
            Some("json"),
            None,
            Some(path.to_str().unwrap()),
        )
        .unwrap();
        let input = source.read().unwrap();
        // share_list and token_list both carry every share.
        assert_eq!(input.tokens.len(), 6);
    }

    #[test]
    fn test_json_variants() {
        let key = MasterKey::from_bytes([9u8; 32]);
        let master = IssuedTokens::master(&key).master_token.clone().unwrap();

        let mut input = CredentialInput::default();
        read_json(&format!(r#"{{"master_token": "{}"}}"#, master), &mut input).unwrap();
        assert_eq!(input.tokens, vec![master.clone()]);

        let mut input = CredentialInput::default();
        read_json(&format!(r#"["{}"]"#, master), &mut input).unwrap();
        assert_eq!(input.tokens.len(), 1);

        let mut input = CredentialInput::default();
        read_json(r#"{"passphrase": "secret"}"#, &mut input).unwrap();
        assert_eq!(input.passphrase.as_ref().unwrap().expose(), "secret");

        let mut input = CredentialInput::default();
        let err = read_json("{}", &mut input).unwrap_err();
        assert_eq!(err.code(), ErrorCode::UnsealUnmarshalTokenList);

        let err = read_json("not json", &mut input).unwrap_err();
        assert_eq!(err.code(), ErrorCode::UnsealUnmarshalTokenList);
    }

    #[test]
    fn test_missing_token_file() {
        let source =
            TokenSource::from_args("file", Some("plaintext"), None, Some("/nonexistent/t.txt"))
                .unwrap();
        assert_eq!(source.read().unwrap_err().code(), ErrorCode::UnsealReadAll);
    }

    #[test]
    fn test_writer_args() {
        assert_eq!(TokenSink::from_args("stdout", None, None).unwrap(), TokenSink::Stdout);

        let err = TokenSink::from_args("email", None, None).unwrap_err();
        assert_eq!(err.code(), ErrorCode::TokenWriterTypeInvalid);

        let err = TokenSink::from_args("file", Some("json"), None).unwrap_err();
        assert_eq!(err.code(), ErrorCode::TokenWriterPathRequired);

        let err = TokenSink::from_args("file", Some("yaml"), Some("/tmp/t")).unwrap_err();
        assert_eq!(err.code(), ErrorCode::TokenWriterFormatInvalid);

        let sink = TokenSink::from_args("file", None, Some("/tmp/t.json")).unwrap();
        assert_eq!(sink.path(), Some(Path::new("/tmp/t.json")));
    }

    #[test]
    fn test_issued_shares_shape() {
        let (_, shares) = sample_shares();
        let issued = IssuedTokens::shares(&shares);
        let json = serde_json::to_value(&issued).unwrap();

        assert!(json.get("master_token").is_none());
        assert_eq!(json["token_list"].as_array().unwrap().len(), 3);
        assert_eq!(json["share_list"].as_object().unwrap().len(), 3);
        assert!(json["share_list"].get("1").is_some());

        let text = issued.render(TokenFormat::Plaintext).unwrap();
        assert_eq!(text.lines().count(), 3);
    }

    #[test]
    fn test_debug_redacts() {
        let input = CredentialInput::passphrase(Passphrase::new("hunter2"));
        assert!(!format!("{:?}", input).contains("hunter2"));

        let issued = IssuedTokens::master(&MasterKey::from_bytes([1u8; 32]));
        let token = issued.master_token.clone().unwrap();
        assert!(!format!("{:?}", issued).contains(&token));
    }
}
