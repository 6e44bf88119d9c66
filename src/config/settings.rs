use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::batch::BatchOptions;
use crate::cache::CacheOptions;
use crate::error::{Error, Result};

pub const CONFIG_FILE_NAME: &str = "folio.toml";
const DB_FILE_NAME: &str = "folio.db";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FolioConfig {
    pub data_dir: PathBuf,
    pub cache: CacheConfig,
    pub batch: BatchConfig,
    pub sharing: SharingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of cached embeddings.
    pub max_size: usize,
    /// Entry time-to-live in seconds.
    pub expiration_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub batch_size: usize,
    pub concurrency: usize,
    pub continue_on_error: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SharingConfig {
    /// Lifetime of access tokens issued without an explicit expiry.
    pub token_ttl_hours: i64,
    /// Lifetime of invitations issued without an explicit expiry. 0 = never expire.
    pub invitation_ttl_hours: i64,
}

impl FolioConfig {
    /// Reads a TOML config file. Missing keys fall back to defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        let config: FolioConfig = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Loads `<data_dir>/folio.toml` if present, otherwise defaults rooted at `data_dir`.
    pub fn load_from_data_dir<P: AsRef<Path>>(data_dir: P) -> Result<Self> {
        let data_dir = data_dir.as_ref();
        let path = data_dir.join(CONFIG_FILE_NAME);

        let mut config = if path.exists() {
            Self::load(&path)?
        } else {
            Self::default()
        };
        config.data_dir = data_dir.to_path_buf();
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.cache.max_size == 0 {
            return Err(Error::Config("cache.max_size must be at least 1".to_string()));
        }
        if self.batch.batch_size == 0 {
            return Err(Error::Config("batch.batch_size must be at least 1".to_string()));
        }
        if self.batch.concurrency == 0 {
            return Err(Error::Config("batch.concurrency must be at least 1".to_string()));
        }
        if self.sharing.token_ttl_hours <= 0 {
            return Err(Error::Config("sharing.token_ttl_hours must be positive".to_string()));
        }
        if self.sharing.invitation_ttl_hours < 0 {
            return Err(Error::Config(
                "sharing.invitation_ttl_hours cannot be negative".to_string(),
            ));
        }
        Ok(())
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))
    }

    #[must_use]
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join(DB_FILE_NAME)
    }

    #[must_use]
    pub fn config_path(&self) -> PathBuf {
        self.data_dir.join(CONFIG_FILE_NAME)
    }
}

impl CacheConfig {
    #[must_use]
    pub fn options(&self) -> CacheOptions {
        CacheOptions {
            max_size: self.max_size,
            expiration: Duration::from_secs(self.expiration_secs),
        }
    }
}

impl BatchConfig {
    #[must_use]
    pub fn options(&self) -> BatchOptions {
        BatchOptions {
            batch_size: self.batch_size,
            concurrency: self.concurrency,
            continue_on_error: self.continue_on_error,
        }
    }
}

impl SharingConfig {
    #[must_use]
    pub fn token_ttl(&self) -> chrono::Duration {
        chrono::Duration::hours(self.token_ttl_hours)
    }

    #[must_use]
    pub fn invitation_ttl(&self) -> Option<chrono::Duration> {
        (self.invitation_ttl_hours > 0).then(|| chrono::Duration::hours(self.invitation_ttl_hours))
    }
}

impl Default for FolioConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            cache: CacheConfig::default(),
            batch: BatchConfig::default(),
            sharing: SharingConfig::default(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size: 1000,
            expiration_secs: 60 * 60,
        }
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        let options = BatchOptions::default();
        Self {
            batch_size: options.batch_size,
            concurrency: options.concurrency,
            continue_on_error: options.continue_on_error,
        }
    }
}

impl Default for SharingConfig {
    fn default() -> Self {
        Self {
            token_ttl_hours: 24 * 7,
            invitation_ttl_hours: 24 * 7,
        }
    }
}
