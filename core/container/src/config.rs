//! Engine configuration.

use serde::{Deserialize, Serialize};
use std::path::Path;

use tvault_common::{Error, Result};
use tvault_crypto::entropy::DEFAULT_TARGET_BITS;
use tvault_crypto::stream::{DEFAULT_CHUNK_SIZE, MAX_CHUNK_SIZE};
use tvault_crypto::KdfParams;

/// Default time a caller waits for a job before giving up.
pub const DEFAULT_JOB_TIMEOUT_SECS: u64 = 300;

/// Tunables for sealing and for the job layer.
///
/// Stored as JSON. Missing fields take their defaults, so a config file only
/// needs the values it changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Argon2id parameters for master keys derived from a passphrase.
    pub kdf: KdfParams,
    /// Argon2id parameters for integrity keys.
    pub integrity_kdf: KdfParams,
    /// Entropy bits required before a key can be generated.
    pub entropy_target_bits: u32,
    /// Seconds a caller waits for a job's terminal event.
    pub job_timeout_secs: u64,
    /// Plaintext bytes per encrypted payload chunk.
    pub chunk_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            kdf: KdfParams::moderate(),
            integrity_kdf: KdfParams::moderate(),
            entropy_target_bits: DEFAULT_TARGET_BITS,
            job_timeout_secs: DEFAULT_JOB_TIMEOUT_SECS,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

impl EngineConfig {
    /// Load a configuration file.
    ///
    /// # Errors
    /// - I/O errors reading `path`
    /// - Malformed JSON
    /// - Out-of-range values, see [`EngineConfig::validate`]
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        let config: Self = serde_json::from_slice(&bytes)?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path` if it exists, otherwise use the defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Check that every value is usable.
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 || self.chunk_size > MAX_CHUNK_SIZE {
            return Err(Error::InvalidInput(format!(
                "chunk_size must be between 1 and {}",
                MAX_CHUNK_SIZE
            )));
        }
        if self.job_timeout_secs == 0 {
            return Err(Error::InvalidInput(
                "job_timeout_secs must be positive".to_string(),
            ));
        }
        if self.entropy_target_bits == 0 {
            return Err(Error::InvalidInput(
                "entropy_target_bits must be positive".to_string(),
            ));
        }
        for params in [&self.kdf, &self.integrity_kdf] {
            if params.time_cost == 0 || params.parallelism == 0 {
                return Err(Error::InvalidInput(
                    "KDF time_cost and parallelism must be positive".to_string(),
                ));
            }
        }
        Ok(())
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
