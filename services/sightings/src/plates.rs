//! Salted, memory-hard pseudonyms for license plates.
//!
//! Stored cars only ever carry the output of [`PlateHasher::hash`]. The salt is
//! server-held and must stay stable for the lifetime of the data set, since
//! duplicate detection relies on equal plates hashing equally.

use crate::config::ConfigError;
use base64::{engine::general_purpose::STANDARD, Engine};
use scrypt::Params;
use secrecy::{ExposeSecret, SecretString};
use thiserror::Error;

/// scrypt cost: N = 2^15
pub const LOG_N: u8 = 15;
/// scrypt block size
pub const R: u32 = 8;
/// scrypt parallelism
pub const P: u32 = 1;
/// Derived key length in bytes
pub const HASH_LEN: usize = 32;

#[derive(Error, Debug)]
pub enum PlateHashError {
    #[error("Plate hash derivation failed: {0}")]
    Derivation(String),

    #[error("Plate hash derivation exceeded {0:?}")]
    Timeout(std::time::Duration),

    #[error("Plate hash worker failed: {0}")]
    Worker(String),
}

pub struct PlateHasher {
    salt: SecretString,
    params: Params,
}

impl PlateHasher {
    /// Create a hasher with the production scrypt parameters
    pub fn new(salt: SecretString) -> Result<Self, ConfigError> {
        Self::with_params(salt, LOG_N, R, P)
    }

    /// Create a hasher with explicit scrypt cost parameters
    pub fn with_params(salt: SecretString, log_n: u8, r: u32, p: u32) -> Result<Self, ConfigError> {
        if salt.expose_secret().is_empty() {
            return Err(ConfigError::MissingRequired("plates.salt".to_string()));
        }
        let params = Params::new(log_n, r, p, HASH_LEN).map_err(|e| ConfigError::InvalidValue {
            key: "plates.scrypt".to_string(),
            message: e.to_string(),
        })?;
        Ok(Self { salt, params })
    }

    /// Hash a (state, plate) pair into a base64 identifier.
    ///
    /// Blocking and deliberately slow; async callers should run it on the
    /// blocking pool.
    pub fn hash(&self, state: &str, plate: &str) -> Result<String, PlateHashError> {
        let license = normalize(state, plate);
        let mut output = [0u8; HASH_LEN];
        scrypt::scrypt(
            license.as_bytes(),
            self.salt.expose_secret().as_bytes(),
            &self.params,
            &mut output,
        )
        .map_err(|e| PlateHashError::Derivation(e.to_string()))?;
        Ok(STANDARD.encode(output))
    }
}

/// Canonical `"{STATE}-{PLATE}"` form fed into the hash
pub fn normalize(state: &str, plate: &str) -> String {
    let plate: String = plate
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_uppercase())
        .collect();
    format!("{}-{}", state.trim().to_uppercase(), plate)
}
