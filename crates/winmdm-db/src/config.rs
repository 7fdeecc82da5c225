//! Store configuration.
//!
//! Loaded from a TOML file; every field has a default so a missing file or
//! a partial file is valid.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::tx::RetryPolicy;
use crate::{DbError, Result};

/// Complete store configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub disk_encryption: DiskEncryptionConfig,
}

/// Database file settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database file. Empty = `winmdm.db` in the working directory.
    #[serde(default)]
    pub path: String,
    /// How long a writer waits on a locked database before failing.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

/// Unit-of-work retry settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

/// Bulk write batch ceilings. These bound statement size only; the
/// converged state does not depend on them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    #[serde(default = "default_batch_size")]
    pub upsert_batch_size: usize,
    #[serde(default = "default_batch_size")]
    pub delete_batch_size: usize,
}

/// Disk-encryption classification settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskEncryptionConfig {
    /// Seconds after a key update during which an unencrypted disk report
    /// still counts as verifying.
    #[serde(default = "default_grace_period_secs")]
    pub grace_period_secs: u64,
}

// Default value functions

pub(crate) fn default_busy_timeout_ms() -> u64 {
    5000
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_delay_ms() -> u64 {
    20
}

fn default_max_delay_ms() -> u64 {
    1000
}

fn default_batch_size() -> usize {
    1000
}

fn default_grace_period_secs() -> u64 {
    winmdm_types::DEFAULT_DISK_ENCRYPTION_GRACE_SECS
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: String::new(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            upsert_batch_size: default_batch_size(),
            delete_batch_size: default_batch_size(),
        }
    }
}

impl Default for DiskEncryptionConfig {
    fn default() -> Self {
        Self {
            grace_period_secs: default_grace_period_secs(),
        }
    }
}

impl DatabaseConfig {
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

impl DiskEncryptionConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }
}

impl StoreConfig {
    /// Load configuration from `path`.
    ///
    /// Falls back to defaults if the file does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .map_err(|e| DbError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: StoreConfig =
            toml::from_str(content).map_err(|e| DbError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.retry.max_attempts == 0 {
            return Err(DbError::Config("retry.max_attempts must be at least 1".into()));
        }
        if self.batch.upsert_batch_size == 0 || self.batch.delete_batch_size == 0 {
            return Err(DbError::Config("batch sizes must be at least 1".into()));
        }
        Ok(())
    }

    pub fn database_path(&self) -> PathBuf {
        if self.database.path.is_empty() {
            PathBuf::from("winmdm.db")
        } else {
            PathBuf::from(&self.database.path)
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts,
            base_delay: Duration::from_millis(self.retry.base_delay_ms),
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
        }
    }
}
