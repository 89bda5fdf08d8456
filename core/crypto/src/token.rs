//! Caller-facing credential tokens.
//!
//! Master and share tokens are `tvt1.` followed by the unpadded URL-safe
//! base64 of a small JSON envelope. The passphrase token is the passphrase
//! itself and carries no framing.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use zeroize::Zeroize;

use crate::keys::MasterKey;
use crate::shamir::{Share, SIGNATURE_LENGTH};
use tvault_common::{EngineError, ErrorCode, Passphrase, TokenType};

/// Prefix identifying an encoded token.
pub const TOKEN_PREFIX: &str = "tvt1.";

/// A decoded credential.
#[derive(Debug, Clone)]
pub enum Token {
    Passphrase(Passphrase),
    Master(MasterKey),
    Share(Share),
}

/// Which credential kind a token string is expected to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Passphrase,
    Master,
    Share,
}

impl TokenKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenKind::Passphrase => "passphrase",
            TokenKind::Master => "master",
            TokenKind::Share => "share",
        }
    }

    /// Credential kind that opens a container sealed with `token_type`.
    pub fn for_token_type(token_type: TokenType) -> Self {
        match token_type {
            TokenType::None => TokenKind::Passphrase,
            TokenType::Master => TokenKind::Master,
            TokenType::Share => TokenKind::Share,
        }
    }
}

impl Token {
    pub fn kind(&self) -> TokenKind {
        match self {
            Token::Passphrase(_) => TokenKind::Passphrase,
            Token::Master(_) => TokenKind::Master,
            Token::Share(_) => TokenKind::Share,
        }
    }
}

/// Errors from decoding tokens.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TokenError {
    #[error("Token is not in a recognised format")]
    InvalidFormat,

    #[error("Passphrase is empty")]
    PassphraseRequired,

    #[error("Expected a {expected} token, got a {found} token")]
    WrongKind {
        expected: &'static str,
        found: &'static str,
    },

    #[error("Failed to parse token envelope: {0}")]
    Envelope(String),

    #[error("Master token does not hold a 32-byte key")]
    DecodeMasterKey,

    #[error("Share token value is not valid base64")]
    DecodeShareValue,

    #[error("Share token signature is malformed")]
    DecodeShareSignature,
}

impl TokenError {
    pub fn code(&self) -> ErrorCode {
        match self {
            TokenError::InvalidFormat => ErrorCode::UnsealInvalidTokenFormat,
            TokenError::PassphraseRequired => ErrorCode::ContainerPassphraseRequired,
            TokenError::WrongKind { .. } => ErrorCode::TokenTypeInvalid,
            TokenError::Envelope(_) => ErrorCode::UnsealParseToken,
            TokenError::DecodeMasterKey => ErrorCode::UnsealDecodeMasterKey,
            TokenError::DecodeShareValue => ErrorCode::UnsealDecodeShareValue,
            TokenError::DecodeShareSignature => ErrorCode::UnsealDecodeShareSignature,
        }
    }
}

impl From<TokenError> for EngineError {
    fn from(err: TokenError) -> Self {
        let code = err.code();
        EngineError::wrap(code, err)
    }
}

#[derive(Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum Envelope {
    Master {
        value: String,
    },
    Share {
        index: u8,
        value: String,
        signature: String,
    },
}

/// Encode a token into its caller-facing string.
pub fn encode_token(token: &Token) -> String {
    let envelope = match token {
        Token::Passphrase(p) => return p.expose().to_string(),
        Token::Master(key) => Envelope::Master {
            value: URL_SAFE_NO_PAD.encode(key.as_bytes()),
        },
        Token::Share(share) => Envelope::Share {
            index: share.index(),
            value: URL_SAFE_NO_PAD.encode(share.value()),
            signature: URL_SAFE_NO_PAD.encode(share.signature()),
        },
    };

    // Envelope only holds strings and integers, serialization cannot fail.
    let mut json = serde_json::to_vec(&envelope).unwrap_or_default();
    let encoded = format!("{}{}", TOKEN_PREFIX, URL_SAFE_NO_PAD.encode(&json));
    json.zeroize();
    encoded
}

/// Whether `s` looks like an encoded (non-passphrase) token.
pub fn is_encoded(s: &str) -> bool {
    s.trim().starts_with(TOKEN_PREFIX)
}

/// Decode a token of any kind. Strings without the token prefix are
/// passphrases, with surrounding whitespace removed.
pub fn decode_any(s: &str) -> Result<Token, TokenError> {
    let trimmed = s.trim();
    let Some(body) = trimmed.strip_prefix(TOKEN_PREFIX) else {
        if trimmed.is_empty() {
            return Err(TokenError::PassphraseRequired);
        }
        return Ok(Token::Passphrase(Passphrase::new(trimmed)));
    };

    let mut json = URL_SAFE_NO_PAD
        .decode(body.as_bytes())
        .map_err(|_| TokenError::InvalidFormat)?;
    let envelope = serde_json::from_slice::<Envelope>(&json);
    json.zeroize();
    let envelope = envelope.map_err(|e| TokenError::Envelope(e.to_string()))?;

    match envelope {
        Envelope::Master { mut value } => {
            let bytes = URL_SAFE_NO_PAD.decode(value.as_bytes());
            value.zeroize();
            let mut bytes = bytes.map_err(|_| TokenError::DecodeMasterKey)?;
            let key = MasterKey::from_slice(&bytes).ok_or(TokenError::DecodeMasterKey);
            bytes.zeroize();
            key.map(Token::Master)
        }
        Envelope::Share {
            index,
            mut value,
            signature,
        } => {
            let bytes = URL_SAFE_NO_PAD.decode(value.as_bytes());
            value.zeroize();
            let bytes = bytes.map_err(|_| TokenError::DecodeShareValue)?;
            if index == 0 || bytes.is_empty() {
                return Err(TokenError::DecodeShareValue);
            }
            let signature: [u8; SIGNATURE_LENGTH] = URL_SAFE_NO_PAD
                .decode(signature.as_bytes())
                .map_err(|_| TokenError::DecodeShareSignature)?
                .try_into()
                .map_err(|_| TokenError::DecodeShareSignature)?;
            Ok(Token::Share(Share::from_parts(index, bytes, signature)))
        }
    }
}

/// Decode a token that must be of `kind`.
///
/// # Errors
/// - `WrongKind` if the string decodes to another credential kind
/// - Decoding errors for malformed tokens
pub fn decode_token(kind: TokenKind, s: &str) -> Result<Token, TokenError> {
    let token = decode_any(s)?;
    if token.kind() != kind {
        return Err(TokenError::WrongKind {
            expected: kind.as_str(),
            found: token.kind().as_str(),
        });
    }
    Ok(token)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::KEY_LENGTH;
    use crate::shamir;
    use tvault_common::ContainerId;

    #[test]
    fn test_master_token_roundtrip() {
        let key = MasterKey::from_bytes([0x11; KEY_LENGTH]);
        let encoded = encode_token(&Token::Master(key.clone()));
        assert!(encoded.starts_with(TOKEN_PREFIX));

        match decode_token(TokenKind::Master, &encoded).unwrap() {
            Token::Master(decoded) => assert_eq!(decoded.as_bytes(), key.as_bytes()),
            other => panic!("unexpected token {:?}", other.kind()),
        }
    }

    #[test]
    fn test_share_token_roundtrip_keeps_signature() {
        let id = ContainerId::generate();
        let key = MasterKey::from_bytes([0x22; KEY_LENGTH]);
        let shares = shamir::split(&key, 2, 3, &id).unwrap();

        let encoded = encode_token(&Token::Share(shares[2].clone()));
        match decode_token(TokenKind::Share, &encoded).unwrap() {
            Token::Share(share) => {
                assert_eq!(share, shares[2]);
                assert!(share.verify(&id));
            }
            other => panic!("unexpected token {:?}", other.kind()),
        }
    }

    #[test]
    fn test_passphrase_token_is_raw() {
        let token = Token::Passphrase(Passphrase::new("correct horse"));
        assert_eq!(encode_token(&token), "correct horse");
        assert_eq!(decode_any("correct horse").unwrap().kind(), TokenKind::Passphrase);
    }

    #[test]
    fn test_blank_passphrase_rejected() {
        for blank in ["", "   ", "\t\n", " \r\n "] {
            let err = decode_any(blank).unwrap_err();
            assert_eq!(err, TokenError::PassphraseRequired);
            assert_eq!(err.code(), ErrorCode::ContainerPassphraseRequired);
        }

        match decode_any("  correct horse\n").unwrap() {
            Token::Passphrase(p) => assert_eq!(p.expose(), "correct horse"),
            other => panic!("unexpected token {:?}", other.kind()),
        }
    }

    #[test]
    fn test_wrong_kind() {
        let encoded = encode_token(&Token::Master(MasterKey::from_bytes([1; KEY_LENGTH])));
        let err = decode_token(TokenKind::Share, &encoded).unwrap_err();
        assert_eq!(err.code(), ErrorCode::TokenTypeInvalid);

        let err = decode_token(TokenKind::Master, "just a passphrase").unwrap_err();
        assert_eq!(err.code(), ErrorCode::TokenTypeInvalid);
    }

    #[test]
    fn test_malformed_tokens() {
        assert_eq!(decode_any("tvt1.!!!").unwrap_err(), TokenError::InvalidFormat);

        let not_json = format!("{}{}", TOKEN_PREFIX, URL_SAFE_NO_PAD.encode(b"nope"));
        assert_eq!(decode_any(&not_json).unwrap_err().code(), ErrorCode::UnsealParseToken);

        let short_key = format!(
            "{}{}",
            TOKEN_PREFIX,
            URL_SAFE_NO_PAD.encode(br#"{"type":"master","value":"AAAA"}"#)
        );
        assert_eq!(decode_any(&short_key).unwrap_err(), TokenError::DecodeMasterKey);

        let bad_sig = format!(
            "{}{}",
            TOKEN_PREFIX,
            URL_SAFE_NO_PAD.encode(br#"{"type":"share","index":1,"value":"AAAA","signature":"AAAA"}"#)
        );
        assert_eq!(decode_any(&bad_sig).unwrap_err(), TokenError::DecodeShareSignature);
    }
}
