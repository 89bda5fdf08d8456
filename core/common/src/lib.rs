//! Common utilities and types shared across the tvault crates.
//!
//! Holds the error taxonomy reported to callers and the small enums that
//! describe how a container was sealed.

pub mod error;
pub mod types;

pub use error::{
    EngineError, Error, ErrorCategory, ErrorCode, ErrorReport, ErrorType, Result, ResultExt,
};
pub use types::{CompressionType, ContainerId, IntegrityType, Passphrase, SensitiveBytes, TokenType};

/// Result of an engine operation.
pub type EngineResult<T> = std::result::Result<T, EngineError>;
