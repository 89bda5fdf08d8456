//! Error types for tvault.
//!
//! Two layers:
//! - [`Error`] is the low-level library error (crypto, I/O, serialization).
//! - [`EngineError`] carries a stable numeric [`ErrorCode`] and is what every
//!   engine operation reports to callers, rendered on the wire as an
//!   [`ErrorReport`].

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Low-level error type shared by the tvault crates.
#[derive(Debug, Error)]
pub enum Error {
    /// Cryptographic operation failed.
    #[error("Cryptographic error: {0}")]
    Crypto(String),

    /// Container format violation.
    #[error("Format error: {0}")]
    Format(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Resource already exists.
    #[error("Already exists: {0}")]
    AlreadyExists(String),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Boxed error used as the source of an [`EngineError`].
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Broad classification of an error, reported as `type` on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ErrorType {
    /// Caller supplied invalid or missing parameters.
    Validation = 1,
    /// Caller supplied wrong or mismatched credentials.
    Credential = 2,
    /// Something failed while doing the work.
    Operational = 3,
}

/// Phase an error belongs to, reported as `category` on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ErrorCategory {
    Container = 1,
    Compression = 2,
    Integrity = 3,
    Shamir = 4,
    Token = 5,
    Unseal = 6,
    Seal = 7,
    Reseal = 8,
    Info = 9,
    Entropy = 10,
    Engine = 11,
}

macro_rules! error_codes {
    ($( $name:ident = $value:literal, $ty:ident, $cat:ident, $msg:literal; )*) => {
        /// Stable error codes shared with callers.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u16)]
        pub enum ErrorCode {
            $( $name = $value, )*
        }

        impl ErrorCode {
            /// Human-readable English message.
            pub fn message(self) -> &'static str {
                match self {
                    $( ErrorCode::$name => $msg, )*
                }
            }

            /// Classification of this code.
            pub fn error_type(self) -> ErrorType {
                match self {
                    $( ErrorCode::$name => ErrorType::$ty, )*
                }
            }

            /// Phase this code belongs to.
            pub fn category(self) -> ErrorCategory {
                match self {
                    $( ErrorCode::$name => ErrorCategory::$cat, )*
                }
            }

            /// Look up a code by its numeric value.
            pub fn from_u16(value: u16) -> Option<Self> {
                match value {
                    $( $value => Some(ErrorCode::$name), )*
                    _ => None,
                }
            }
        }
    };
}

error_codes! {
    ContainerCurrentPathRequired = 0x000, Validation, Container, "Current container path is required";
    ContainerNewPathRequired = 0x001, Validation, Container, "New container path is required";
    ContainerFolderPathRequired = 0x002, Validation, Container, "Folder path is required";
    ContainerPassphraseRequired = 0x003, Validation, Container, "Container passphrase is required";
    CompressionTypeInvalid = 0x004, Validation, Compression, "Invalid compression type";
    IntegrityProviderTypeInvalid = 0x005, Validation, Integrity, "Invalid integrity provider type";
    IntegrityProviderNewPassphraseRequired = 0x006, Validation, Integrity, "New integrity passphrase is required";
    ShamirSharesEqualZero = 0x007, Validation, Shamir, "Number of shares must be greater than zero";
    ShamirThresholdEqualZero = 0x008, Validation, Shamir, "Threshold must be greater than zero";
    ShamirSharesLessThanThreshold = 0x009, Validation, Shamir, "Number of shares must be greater than or equal to threshold";
    ShamirSharesLessThanTwo = 0x010, Validation, Shamir, "Number of shares must be at least two";
    ShamirThresholdLessThanTwo = 0x011, Validation, Shamir, "Threshold must be at least two";
    ShamirSharesGreaterThan255 = 0x012, Validation, Shamir, "Number of shares cannot exceed 255";
    ShamirThresholdGreaterThan255 = 0x013, Validation, Shamir, "Threshold cannot exceed 255";
    TokenWriterTypeInvalid = 0x014, Validation, Token, "Invalid token writer type";
    TokenWriterPathRequired = 0x015, Validation, Token, "Token writer path is required";
    TokenWriterFormatInvalid = 0x016, Validation, Token, "Invalid token writer format";
    TokenReaderTypeInvalid = 0x017, Validation, Token, "Invalid token reader type";
    TokenReaderFlagRequired = 0x018, Validation, Token, "Token reader flag is required";
    TokenReaderPathRequired = 0x019, Validation, Token, "Token reader path is required";
    TokenReaderFormatInvalid = 0x020, Validation, Token, "Invalid token reader format";
    ContainerOpenFile = 0x043, Operational, Container, "Failed to open container file";
    UnsealOpenContainer = 0x064, Operational, Unseal, "Failed to open container";
    UnsealGetTokenString = 0x065, Operational, Unseal, "Failed to get token string";
    UnsealParseTokens = 0x066, Credential, Unseal, "Failed to parse tokens";
    UnsealRestoreMasterKey = 0x067, Credential, Unseal, "Failed to restore master key";
    UnsealContainer = 0x068, Operational, Unseal, "Container opening error";
    UnsealUnpackContent = 0x069, Operational, Unseal, "Failed to unpack content";
    UnsealGetReader = 0x070, Operational, Unseal, "Failed to get payload reader";
    UnsealReadAll = 0x071, Operational, Unseal, "Failed to read all data";
    UnsealInvalidTokenFormat = 0x072, Credential, Unseal, "Invalid token format";
    UnsealUnmarshalTokenList = 0x073, Credential, Unseal, "Failed to unmarshal token list";
    UnsealParseToken = 0x074, Credential, Unseal, "Failed to parse token";
    UnsealDecodeMasterKey = 0x075, Credential, Unseal, "Failed to decode master key";
    UnsealDecodeShareValue = 0x076, Credential, Unseal, "Failed to decode share value";
    UnsealDecodeShareSignature = 0x077, Credential, Unseal, "Failed to decode share signature";
    UnsealCompressionUnpack = 0x078, Operational, Unseal, "Failed to unpack compressed data";
    SealCompressFolder = 0x079, Operational, Seal, "Failed to compress folder";
    SealCreateContainer = 0x080, Operational, Seal, "Failed to create container";
    SealCreateIntegrityProvider = 0x081, Operational, Seal, "Failed to create integrity provider";
    SealDeriveIntegrityProviderPassphrase = 0x082, Operational, Seal, "Failed to derive integrity provider passphrase";
    SealGenerateAndSaveTokens = 0x083, Operational, Seal, "Failed to generate and save tokens";
    SealCompressionPack = 0x084, Operational, Seal, "Failed to pack compressed data";
    SealCreateContainerHeader = 0x085, Operational, Seal, "Failed to create container header";
    SealEncryptContainer = 0x086, Operational, Seal, "Failed to encrypt container";
    SealWriteContainer = 0x087, Operational, Seal, "Failed to write container";
    SealShamirSplit = 0x088, Operational, Seal, "Failed to split key using Shamir scheme";
    SealWriteTokensShare = 0x089, Operational, Seal, "Failed to write share tokens";
    SealBuildShareToken = 0x090, Operational, Seal, "Failed to build share token";
    SealWriteTokenMaster = 0x091, Operational, Seal, "Failed to write master token";
    SealBuildMasterToken = 0x092, Operational, Seal, "Failed to build master token";
    ResealOpenContainer = 0x093, Operational, Reseal, "Failed to open container for reseal";
    ResealGetTokenString = 0x094, Operational, Reseal, "Failed to get token string during reseal";
    ResealParseTokens = 0x095, Credential, Reseal, "Failed to parse tokens during reseal";
    ResealRestoreMasterKey = 0x096, Credential, Reseal, "Failed to restore master key during reseal";
    ResealCompressFolder = 0x097, Operational, Reseal, "Failed to compress folder during reseal";
    ResealEncryptContainer = 0x098, Operational, Reseal, "Failed to encrypt container during reseal";
    ResealWriteContainer = 0x099, Operational, Reseal, "Failed to write container during reseal";
    ResealCreateIntegrityProvider = 0x100, Operational, Reseal, "Failed to create integrity provider during reseal";
    ResealDeriveAdditionalPassword = 0x101, Operational, Reseal, "Failed to derive additional password during reseal";
    TokenTypeInvalid = 0x102, Credential, Token, "Invalid token type";
    InfoWriterTypeInvalid = 0x105, Validation, Info, "Invalid info writer type";
    InfoWriterPathRequired = 0x106, Validation, Info, "Info writer path is required";
    InfoWriterFormatInvalid = 0x107, Validation, Info, "Invalid info writer format";
    InfoPathRequired = 0x108, Validation, Info, "Container path is required for info";
    ContainerBusy = 0x110, Operational, Engine, "Another job is already using this container path";
    IntegrityVerificationFailed = 0x111, Credential, Integrity, "Integrity verification failed";
    IntegrityCurrentPassphraseRequired = 0x112, Validation, Integrity, "Current integrity passphrase is required";
    ContainerPathExists = 0x113, Validation, Container, "Output path already exists";
    ShamirNotEnoughShares = 0x114, Credential, Shamir, "Not enough valid shares to restore the master key";
    ShamirShareSignatureInvalid = 0x115, Credential, Shamir, "Share signature does not match this container";
    CredentialRejected = 0x116, Credential, Unseal, "Key material does not open this container";
    EntropyInsufficient = 0x117, Validation, Entropy, "Not enough entropy has been collected";
    JobTimeout = 0x118, Operational, Engine, "Operation did not finish in time";
    ContainerVersionUnsupported = 0x119, Operational, Container, "Unsupported container format version";
    FileOperation = 0x11A, Operational, Engine, "File system operation failed";
    JobAborted = 0x11B, Operational, Engine, "Operation stopped before reporting a result";
}

impl ErrorCode {
    /// Numeric wire value.
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Optional hint shown to the user alongside the message.
    pub fn suggestion(self) -> Option<&'static str> {
        match self {
            ErrorCode::ContainerOpenFile
            | ErrorCode::UnsealOpenContainer
            | ErrorCode::ResealOpenContainer => {
                Some("Check that the file exists and is a tvault container")
            }
            ErrorCode::IntegrityVerificationFailed => {
                Some("Check the integrity password; the container may have been modified")
            }
            ErrorCode::ShamirNotEnoughShares => {
                Some("Provide at least as many shares as the container threshold")
            }
            ErrorCode::TokenTypeInvalid => {
                Some("Use the kind of credential this container was sealed with")
            }
            ErrorCode::CredentialRejected => Some("Check the passphrase or token and try again"),
            ErrorCode::ContainerBusy => Some("Wait for the running operation to finish"),
            _ => None,
        }
    }

    /// Whether this code means the container file is missing or unreadable,
    /// as opposed to a credential problem.
    pub fn is_open_error(self) -> bool {
        matches!(
            self,
            ErrorCode::ContainerOpenFile
                | ErrorCode::UnsealOpenContainer
                | ErrorCode::ResealOpenContainer
                | ErrorCode::ContainerVersionUnsupported
        )
    }
}

/// Coded error reported by every engine operation.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct EngineError {
    code: ErrorCode,
    message: String,
    details: Option<String>,
    #[source]
    source: Option<BoxError>,
}

impl EngineError {
    /// Create an error carrying the default message for `code`.
    pub fn new(code: ErrorCode) -> Self {
        Self {
            code,
            message: code.message().to_string(),
            details: None,
            source: None,
        }
    }

    /// Create an error wrapping an underlying cause.
    pub fn wrap(code: ErrorCode, source: impl Into<BoxError>) -> Self {
        Self {
            source: Some(source.into()),
            ..Self::new(code)
        }
    }

    /// Attach free-form details.
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn details(&self) -> Option<&str> {
        self.details.as_deref()
    }

    /// Validation and credential errors can be retried with corrected input.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self.code.error_type(),
            ErrorType::Validation | ErrorType::Credential
        )
    }

    /// See [`ErrorCode::is_open_error`].
    pub fn is_open_error(&self) -> bool {
        self.code.is_open_error()
    }

    /// Render the wire representation.
    pub fn report(&self) -> ErrorReport {
        let mut unwrapped = Vec::new();
        let mut cause = self.source.as_deref().map(|e| e as &(dyn std::error::Error + 'static));
        while let Some(err) = cause {
            unwrapped.push(err.to_string());
            cause = err.source();
        }

        ErrorReport {
            message: self.message.clone(),
            code: self.code.as_u16(),
            kind: self.code.error_type() as u8,
            category: self.code.category() as u8,
            details: self.details.clone(),
            suggestion: self.code.suggestion().map(str::to_string),
            unwrapped,
        }
    }
}

impl From<ErrorCode> for EngineError {
    fn from(code: ErrorCode) -> Self {
        EngineError::new(code)
    }
}

/// Serializable error shape shared with callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub message: String,
    pub code: u16,
    #[serde(rename = "type")]
    pub kind: u8,
    pub category: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unwrapped: Vec<String>,
}

impl ErrorReport {
    /// Resolve the numeric code back to an [`ErrorCode`].
    pub fn error_code(&self) -> Option<ErrorCode> {
        ErrorCode::from_u16(self.code)
    }
}

impl From<&EngineError> for ErrorReport {
    fn from(err: &EngineError) -> Self {
        err.report()
    }
}

/// Attach an [`ErrorCode`] to any fallible result.
pub trait ResultExt<T> {
    fn code(self, code: ErrorCode) -> std::result::Result<T, EngineError>;
}

impl<T, E> ResultExt<T> for std::result::Result<T, E>
where
    E: Into<BoxError>,
{
    fn code(self, code: ErrorCode) -> std::result::Result<T, EngineError> {
        self.map_err(|e| EngineError::wrap(code, e))
    }
}
