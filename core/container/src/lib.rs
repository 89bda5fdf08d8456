//! Container engine for tvault.
//!
//! This crate provides:
//! - The on-disk container format and header reader
//! - Seal, unseal and reseal pipelines with stage reporting
//! - Token sources and sinks for callers
//! - Folder compression, container scanning and a per-path lock table
//!
//! # Architecture
//! Pipelines are synchronous and report progress through a
//! [`progress::StageObserver`]. Async job handling lives in `tvault-app`.

mod codes;
pub mod compression;
pub mod config;
pub mod format;
pub mod lock;
pub mod paths;
pub mod progress;
pub mod reseal;
pub mod scanner;
pub mod seal;
pub mod token_io;
pub mod unseal;

pub use compression::UnpackStats;
pub use config::EngineConfig;
pub use format::{ContainerHeader, FormatError, Metadata, ShamirParams, CONTAINER_EXTENSION};
pub use lock::{PathGuard, PathLocks};
pub use progress::{NoProgress, Operation, Stage, StageObserver};
pub use reseal::{
    reseal, IntegrityUpdate, MetadataUpdate, RekeyRequest, ResealOutcome, ResealRequest,
};
pub use scanner::{info, scan, ContainerInfo, InfoSink};
pub use seal::{seal, KeySource, SealOutcome, SealRequest, ShamirRequest};
pub use token_io::{
    CredentialInput, IssuedTokens, TokenFormat, TokenReaderType, TokenSink, TokenSource,
};
pub use unseal::{unseal, UnsealOutcome, UnsealRequest};

#[cfg(test)]
pub(crate) mod testutil {
    use crate::config::EngineConfig;
    use tvault_crypto::KdfParams;

    /// Config with cheap Argon2 parameters.
    pub fn test_config() -> EngineConfig {
        let kdf = KdfParams {
            memory_cost: 1024,
            time_cost: 1,
            parallelism: 1,
        };
        EngineConfig {
            kdf,
            integrity_kdf: kdf,
            ..EngineConfig::default()
        }
    }
}
