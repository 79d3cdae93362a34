//! Construction-time configuration of the encryption overlay.

use std::fmt;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer, Serialize};

use crate::crypto::{CipherAlgorithm, CipherKey};
use crate::error::StorageError;

/// Default shard depth of encrypted keys.
pub const DEFAULT_DIR_LEVELS: usize = 2;

/// Default size of the metadata worker pool.
pub const DEFAULT_META_WORKERS: usize = 4;

/// Default bound on waiting for one listing's fan-out to complete.
pub const DEFAULT_META_TIMEOUT: Duration = Duration::from_secs(60);

/// A SHA-256 hex digest has 32 two-character slices.
pub const MAX_DIR_LEVELS: usize = 32;

/// What a listing does when one entry fails to resolve.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FanOutPolicy {
    /// Fail the whole listing with the first error
    #[default]
    FailFast,
    /// Log and leave the bad entry out
    SkipFailed,
}

fn default_dir_levels() -> usize {
    DEFAULT_DIR_LEVELS
}

fn default_meta_workers() -> usize {
    DEFAULT_META_WORKERS
}

fn default_meta_timeout() -> Duration {
    DEFAULT_META_TIMEOUT
}

fn deserialize_secret<'de, D>(deserializer: D) -> Result<SecretString, D::Error>
where
    D: Deserializer<'de>,
{
    String::deserialize(deserializer).map(SecretString::from)
}

fn deserialize_optional_secret<'de, D>(deserializer: D) -> Result<Option<SecretString>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.map(SecretString::from))
}

/// Encryption settings: key material plus layout and concurrency knobs.
#[derive(Clone, Deserialize)]
pub struct EncryptionConfig {
    /// Cipher key material
    #[serde(deserialize_with = "deserialize_secret")]
    pub key: SecretString,
    /// Base IV (32 hex digits) or a seed to derive it from
    #[serde(default, deserialize_with = "deserialize_optional_secret")]
    pub iv: Option<SecretString>,
    #[serde(default)]
    pub algo: CipherAlgorithm,
    /// Number of two-character shard directories above each hashed key
    #[serde(default = "default_dir_levels")]
    pub dir_levels: usize,
    /// Size of the metadata worker pool
    #[serde(default = "default_meta_workers")]
    pub meta_workers: usize,
    #[serde(default = "default_meta_timeout", with = "humantime_serde")]
    pub meta_timeout: Duration,
    #[serde(default)]
    pub fan_out_policy: FanOutPolicy,
}

impl EncryptionConfig {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: SecretString::from(key.into()),
            iv: None,
            algo: CipherAlgorithm::default(),
            dir_levels: DEFAULT_DIR_LEVELS,
            meta_workers: DEFAULT_META_WORKERS,
            meta_timeout: DEFAULT_META_TIMEOUT,
            fan_out_policy: FanOutPolicy::default(),
        }
    }

    #[must_use]
    pub fn with_iv(mut self, iv: impl Into<String>) -> Self {
        self.iv = Some(SecretString::from(iv.into()));
        self
    }

    #[must_use]
    pub fn with_algo(mut self, algo: CipherAlgorithm) -> Self {
        self.algo = algo;
        self
    }

    #[must_use]
    pub fn with_dir_levels(mut self, dir_levels: usize) -> Self {
        self.dir_levels = dir_levels;
        self
    }

    #[must_use]
    pub fn with_meta_workers(mut self, meta_workers: usize) -> Self {
        self.meta_workers = meta_workers;
        self
    }

    #[must_use]
    pub fn with_meta_timeout(mut self, meta_timeout: Duration) -> Self {
        self.meta_timeout = meta_timeout;
        self
    }

    #[must_use]
    pub fn with_fan_out_policy(mut self, policy: FanOutPolicy) -> Self {
        self.fan_out_policy = policy;
        self
    }

    pub fn validate(&self) -> Result<(), StorageError> {
        if self.key.expose_secret().is_empty() {
            return Err(StorageError::config("encryption key is empty"));
        }
        if self.dir_levels > MAX_DIR_LEVELS {
            return Err(StorageError::config(format!(
                "dir_levels must be at most {MAX_DIR_LEVELS}, got {}",
                self.dir_levels
            )));
        }
        if self.meta_workers == 0 {
            return Err(StorageError::config("meta_workers must be at least 1"));
        }
        if self.meta_timeout.is_zero() {
            return Err(StorageError::config("meta_timeout must be positive"));
        }
        Ok(())
    }

    /// Validate and derive the key set.
    pub fn derive_key(&self) -> Result<CipherKey, StorageError> {
        self.validate()?;
        CipherKey::derive(
            self.key.expose_secret(),
            self.iv.as_ref().map(|iv| iv.expose_secret()),
            self.algo,
        )
        .map_err(|e| StorageError::config(e.to_string()))
    }
}

impl fmt::Debug for EncryptionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionConfig")
            .field("key", &"[REDACTED]")
            .field("iv", &self.iv.as_ref().map(|_| "[REDACTED]"))
            .field("algo", &self.algo)
            .field("dir_levels", &self.dir_levels)
            .field("meta_workers", &self.meta_workers)
            .field("meta_timeout", &self.meta_timeout)
            .field("fan_out_policy", &self.fan_out_policy)
            .finish()
    }
}
