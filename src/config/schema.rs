//! Configuration schema for pkgcache
//!
//! Configuration is stored at `~/.config/pkgcache/config.toml`

use crate::cache::CacheSettings;
use crate::error::{CacheError, CacheResult};
use crate::source::tar::DEFAULT_MANIFEST;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General settings
    pub general: GeneralConfig,

    /// Cache settings
    pub cache: CacheConfig,

    /// Resource source settings
    pub source: SourceConfig,
}

/// General application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log format: "text" or "json"
    pub log_format: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_format: "text".to_string(),
        }
    }
}

/// Cache settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Cache root; must already exist
    pub cache_path: Option<PathBuf>,

    /// Evict entries idle longer than this (seconds); unset never evicts
    pub expiration_secs: Option<u64>,

    /// Identity passed to the resource source
    pub identity: Option<String>,

    /// Store content that isn't a valid package as a single file
    pub cache_invalid_package_as_file: bool,

    /// Never extract packages
    pub always_cache_as_file: bool,

    /// Give up acquiring an entry after this long (seconds)
    pub acquire_timeout_secs: u64,

    /// Sleep between contended attempts (milliseconds)
    pub poll_interval_ms: u64,

    /// Skip the source freshness check for entries used this recently (seconds)
    pub freshness_window_secs: u64,

    /// Maximum evictions per sweep (0 = unbounded)
    pub max_evictions_per_sweep: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_path: None,
            expiration_secs: None,
            identity: None,
            cache_invalid_package_as_file: true,
            always_cache_as_file: false,
            acquire_timeout_secs: 120,
            poll_interval_ms: 750,
            freshness_window_secs: 120,
            max_evictions_per_sweep: 10,
        }
    }
}

impl CacheConfig {
    /// Runtime settings; fails if no cache path is configured
    pub fn to_settings(&self) -> CacheResult<CacheSettings> {
        let cache_path = self
            .cache_path
            .clone()
            .filter(|p| !p.as_os_str().is_empty())
            .ok_or(CacheError::CachePathNotConfigured)?;

        Ok(CacheSettings {
            cache_path,
            expiration: self.expiration_secs.map(Duration::from_secs),
            identity: self.identity.clone(),
            cache_invalid_package_as_file: self.cache_invalid_package_as_file,
            always_cache_as_file: self.always_cache_as_file,
            acquire_timeout: Duration::from_secs(self.acquire_timeout_secs),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            freshness_window: Duration::from_secs(self.freshness_window_secs),
            max_evictions_per_sweep: self.max_evictions_per_sweep,
        })
    }
}

/// Resource source settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// Root of a local directory repository
    pub repository_path: Option<PathBuf>,

    /// Manifest file required at the root of every package
    pub manifest: String,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            repository_path: None,
            manifest: DEFAULT_MANIFEST.to_string(),
        }
    }
}
