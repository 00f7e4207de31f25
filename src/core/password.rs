//! Password hashing
//!
//! [`ScryptHasher`] derives a key with scrypt (N = 2^15, r = 8, p = 1, 32
//! byte key) from a fresh random 32 byte salt and encodes the result as
//! `base64(salt):base64(key)` using unpadded standard base64. Verification
//! recomputes the key with the same parameters and compares in constant time.
//!
//! Hashing is CPU and memory heavy; async callers go through
//! [`hash_password`] / [`verify_password`], which run the hasher on the
//! blocking thread pool.

use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD_NO_PAD;
use rand::RngCore;
use rand::rngs::OsRng;
use subtle::ConstantTimeEq;

const DEFAULT_LOG_N: u8 = 15;
const DEFAULT_R: u32 = 8;
const DEFAULT_P: u32 = 1;
const KEY_LEN: usize = 32;
const DEFAULT_SALT_LEN: usize = 32;
const MIN_SALT_LEN: usize = 16;

/// Hasher error types
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HashError {
    #[error("Malformed password hash: {0}")]
    Malformed(&'static str),

    #[error("Invalid hasher parameters: {0}")]
    InvalidParams(String),

    #[error("Password hashing failed: {0}")]
    Internal(String),
}

/// One-way credential hashing with constant-time verification
pub trait PasswordHasher: Send + Sync {
    fn hash(&self, password: &str) -> Result<String, HashError>;

    /// `Ok(false)` on mismatch; `Err(Malformed)` if `encoded` cannot be parsed
    fn verify(&self, password: &str, encoded: &str) -> Result<bool, HashError>;
}

/// scrypt-based [`PasswordHasher`]
#[derive(Debug, Clone)]
pub struct ScryptHasher {
    params: scrypt::Params,
    salt_len: usize,
}

impl ScryptHasher {
    /// Production parameter set
    pub fn new() -> Self {
        Self {
            params: default_params(),
            salt_len: DEFAULT_SALT_LEN,
        }
    }

    /// Custom cost parameters. Hashes produced with non-default parameters
    /// only verify against a hasher configured the same way.
    pub fn with_params(log_n: u8, r: u32, p: u32) -> Result<Self, HashError> {
        let params = scrypt::Params::new(log_n, r, p, KEY_LEN)
            .map_err(|e| HashError::InvalidParams(e.to_string()))?;
        Ok(Self {
            params,
            salt_len: DEFAULT_SALT_LEN,
        })
    }

    pub fn salt_len(mut self, len: usize) -> Result<Self, HashError> {
        if len < MIN_SALT_LEN {
            return Err(HashError::InvalidParams(format!(
                "salt must be at least {} bytes",
                MIN_SALT_LEN
            )));
        }
        self.salt_len = len;
        Ok(self)
    }

    pub fn params(&self) -> &scrypt::Params {
        &self.params
    }

    fn derive(&self, password: &str, salt: &[u8]) -> Result<[u8; KEY_LEN], HashError> {
        let mut key = [0u8; KEY_LEN];
        scrypt::scrypt(password.as_bytes(), salt, &self.params, &mut key)
            .map_err(|e| HashError::Internal(e.to_string()))?;
        Ok(key)
    }
}

impl Default for ScryptHasher {
    fn default() -> Self {
        Self::new()
    }
}

fn default_params() -> scrypt::Params {
    scrypt::Params::new(DEFAULT_LOG_N, DEFAULT_R, DEFAULT_P, KEY_LEN)
        .unwrap_or_else(|_| scrypt::Params::recommended())
}

impl PasswordHasher for ScryptHasher {
    fn hash(&self, password: &str) -> Result<String, HashError> {
        let mut salt = vec![0u8; self.salt_len];
        OsRng.fill_bytes(&mut salt);

        let key = self.derive(password, &salt)?;
        Ok(format!(
            "{}:{}",
            STANDARD_NO_PAD.encode(&salt),
            STANDARD_NO_PAD.encode(key)
        ))
    }

    fn verify(&self, password: &str, encoded: &str) -> Result<bool, HashError> {
        let (salt, expected) = decode(encoded)?;
        let key = self.derive(password, &salt)?;
        Ok(key.as_slice().ct_eq(expected.as_slice()).into())
    }
}

/// Split `salt:key` into its decoded parts
fn decode(encoded: &str) -> Result<(Vec<u8>, Vec<u8>), HashError> {
    let mut parts = encoded.split(':');
    let (Some(salt), Some(key), None) = (parts.next(), parts.next(), parts.next()) else {
        return Err(HashError::Malformed("expected exactly two segments"));
    };
    if salt.is_empty() || key.is_empty() {
        return Err(HashError::Malformed("empty segment"));
    }

    let salt = STANDARD_NO_PAD
        .decode(salt)
        .map_err(|_| HashError::Malformed("salt is not valid base64"))?;
    let key = STANDARD_NO_PAD
        .decode(key)
        .map_err(|_| HashError::Malformed("key is not valid base64"))?;
    Ok((salt, key))
}

/// Hash on the blocking pool
pub async fn hash_password(
    hasher: Arc<dyn PasswordHasher>,
    password: String,
) -> Result<String, HashError> {
    tokio::task::spawn_blocking(move || hasher.hash(&password))
        .await
        .map_err(|e| HashError::Internal(e.to_string()))?
}

/// Verify on the blocking pool
pub async fn verify_password(
    hasher: Arc<dyn PasswordHasher>,
    password: String,
    encoded: String,
) -> Result<bool, HashError> {
    tokio::task::spawn_blocking(move || hasher.verify(&password, &encoded))
        .await
        .map_err(|e| HashError::Internal(e.to_string()))?
}
