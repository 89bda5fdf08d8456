//! Error codes that differ between seal, unseal and reseal.
//!
//! Reseal runs the unseal and seal pipelines but reports failures under its
//! own codes, so shared steps ask the running [`Operation`] which code to use.

use tvault_common::{EngineError, Error, ErrorCode};
use tvault_crypto::{ShamirError, TokenError};

use crate::progress::Operation;

impl Operation {
    pub(crate) fn open_code(self) -> ErrorCode {
        match self {
            Operation::Reseal => ErrorCode::ResealOpenContainer,
            _ => ErrorCode::UnsealOpenContainer,
        }
    }

    pub(crate) fn token_string_code(self) -> ErrorCode {
        match self {
            Operation::Reseal => ErrorCode::ResealGetTokenString,
            _ => ErrorCode::UnsealGetTokenString,
        }
    }

    pub(crate) fn restore_key_code(self) -> ErrorCode {
        match self {
            Operation::Reseal => ErrorCode::ResealRestoreMasterKey,
            _ => ErrorCode::UnsealRestoreMasterKey,
        }
    }

    pub(crate) fn encrypt_code(self) -> ErrorCode {
        match self {
            Operation::Reseal => ErrorCode::ResealEncryptContainer,
            _ => ErrorCode::SealEncryptContainer,
        }
    }

    pub(crate) fn write_code(self) -> ErrorCode {
        match self {
            Operation::Reseal => ErrorCode::ResealWriteContainer,
            _ => ErrorCode::SealWriteContainer,
        }
    }

    pub(crate) fn create_integrity_code(self) -> ErrorCode {
        match self {
            Operation::Reseal => ErrorCode::ResealCreateIntegrityProvider,
            _ => ErrorCode::SealCreateIntegrityProvider,
        }
    }

    pub(crate) fn derive_integrity_code(self) -> ErrorCode {
        match self {
            Operation::Reseal => ErrorCode::ResealDeriveAdditionalPassword,
            _ => ErrorCode::SealDeriveIntegrityProviderPassphrase,
        }
    }

    /// Code for a failure while packing the source folder.
    pub(crate) fn pack_error(self, err: Error) -> EngineError {
        let code = match (self, &err) {
            (Operation::Reseal, _) => ErrorCode::ResealCompressFolder,
            (_, Error::Io(_)) | (_, Error::InvalidInput(_)) => ErrorCode::SealCompressFolder,
            _ => ErrorCode::SealCompressionPack,
        };
        EngineError::wrap(code, err)
    }

    /// Re-code a token decoding failure for this operation.
    ///
    /// Kind mismatches and blank passphrases keep their own codes everywhere.
    pub(crate) fn token_error(self, err: TokenError) -> EngineError {
        match (self, &err) {
            (Operation::Reseal, TokenError::WrongKind { .. } | TokenError::PassphraseRequired) => {
                err.into()
            }
            (Operation::Reseal, _) => EngineError::wrap(ErrorCode::ResealParseTokens, err),
            _ => err.into(),
        }
    }

    /// Re-code a share reconstruction failure for this operation.
    pub(crate) fn shamir_error(self, err: ShamirError) -> EngineError {
        match err {
            ShamirError::Recover(_) => EngineError::wrap(self.restore_key_code(), err),
            other => other.into(),
        }
    }
}
