//! Module for application configuration settings.
//!
//! User configurations may be specified in a configuration file.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytesize::ByteSize;
use objfs::cache::ContentCache;
use objfs::read::{BlockPool, ReadOptions};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

fn objfs_data_dir() -> Option<PathBuf> {
    if let Some(path) = dirs::cache_dir() {
        return Some(path.join("objfs"));
    }

    dirs::home_dir().map(|path| path.join(".cache").join("objfs"))
}

/// The content cache configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct CacheConfig {
    /// Whether whole objects are cached on local disk at all.
    pub enabled: bool,

    /// The path to the cache directory.
    pub path: PathBuf,

    /// Objects larger than this are always read remotely.
    pub max_object_size: ByteSize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: objfs_data_dir()
                .map_or_else(|| PathBuf::from("/tmp/objfs/cache"), |dir| dir.join("content")),
            max_object_size: ByteSize::mib(64),
        }
    }
}

/// Read path tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ReadConfig {
    /// Size of one read-ahead block.
    pub prefetch_block_size: ByteSize,

    /// Blocks fetched ahead of the reader. Zero disables read-ahead.
    pub prefetch_depth: usize,

    /// Read-ahead fetches allowed in flight across all open files.
    pub prefetch_workers: usize,

    /// Pull the whole object locally on first read and serve ranges from it.
    pub cache_file_for_range_read: bool,
}

impl Default for ReadConfig {
    fn default() -> Self {
        Self {
            prefetch_block_size: ByteSize::mib(8),
            prefetch_depth: 4,
            prefetch_workers: 16,
            cache_file_for_range_read: false,
        }
    }
}

/// Application configuration structure.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    /// The bucket projected by the filesystem.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket: Option<String>,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub read: ReadConfig,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration validation errors: {0:?}")]
    ValidationErrors(Vec<String>),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] toml::ser::Error),

    #[error("Deserialization error: {0}")]
    DeserializationError(#[from] toml::de::Error),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl Config {
    /// Validate the correctness of the configuration.
    ///
    /// Returns:
    /// - `Ok(())` if the configuration is valid.
    /// - `Err(Vec<String>)` containing every validation error message otherwise.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if let Some(bucket) = &self.bucket
            && bucket.is_empty()
        {
            errors.push("Bucket name must not be empty.".to_owned());
        }

        if self.cache.enabled && self.cache.path.parent().is_none() {
            errors.push(format!(
                "Cache path '{}' has no parent directory.",
                self.cache.path.display()
            ));
        }

        if self.read.prefetch_depth > 0 {
            if self.read.prefetch_block_size.as_u64() == 0 {
                errors.push("Read-ahead block size must be positive.".to_owned());
            }
            if self.read.prefetch_workers == 0 {
                errors.push("Read-ahead needs at least one worker.".to_owned());
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Returns config file paths in descending priority order.
    /// On macOS, skips `dirs::config_dir()` (resolves to ~/Library/Application Support/).
    fn config_search_paths() -> Vec<PathBuf> {
        let mut paths = Vec::new();

        #[cfg(not(target_os = "macos"))]
        if let Some(xdg) = dirs::config_dir() {
            paths.push(xdg.join("objfs").join("config.toml"));
        }

        if let Some(home) = dirs::home_dir() {
            paths.push(home.join(".config").join("objfs").join("config.toml"));
        }

        paths.push(PathBuf::from("/etc/objfs/config.toml"));

        paths
    }

    /// Finds the first existing config file from search paths.
    fn find_config_file() -> Option<PathBuf> {
        Self::config_search_paths().into_iter().find(|p| p.exists())
    }

    /// Loads config from a single TOML file.
    fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        debug!(path = ?path, "Loading configuration file.");
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Loads configuration from the external path if given, else from the
    /// first config file found, else the defaults.
    ///
    /// Errors if a config file exists but is malformed or invalid.
    pub fn load(external_config_path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match external_config_path
            .map(Path::to_path_buf)
            .or_else(Self::find_config_file)
        {
            Some(path) => Self::load_from_file(&path)?,
            None => {
                debug!("No configuration file found, using defaults.");
                Self::default()
            }
        };
        config.validate().map_err(ConfigError::ValidationErrors)?;
        Ok(config)
    }

    /// Render the effective configuration as TOML.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Per-handle read options for this configuration.
    ///
    /// `cache` is the mount's content cache, already opened and recovered;
    /// it is ignored when caching is disabled.
    pub fn read_options(&self, cache: Option<Arc<Mutex<ContentCache>>>) -> ReadOptions {
        let prefetch = (self.read.prefetch_depth > 0).then(|| {
            Arc::new(BlockPool::new(
                self.read.prefetch_block_size.as_u64(),
                self.read.prefetch_depth,
                self.read.prefetch_workers,
            ))
        });
        ReadOptions {
            content_cache: cache.filter(|_| self.cache.enabled),
            cache_max_object_size: self.cache.max_object_size.as_u64(),
            prefetch,
        }
    }
}
