//! Configuration management for the lightbox daemon.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/lightbox/config.toml`.

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("listen_addr must be an address like 127.0.0.1:3000, got {0}")]
    InvalidListenAddr(String),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),

    #[error("fill_timeout_secs must be between 1 and 3600, got {0}")]
    InvalidFillTimeout(u64),

    #[error("max_concurrent_decodes must be between 1 and 1024, got {0}")]
    InvalidMaxConcurrentDecodes(usize),

    #[error("max_image_pixels must be greater than 0, got {0}")]
    InvalidMaxImagePixels(u64),

    #[error("cache.{0}: redis address must not be empty")]
    MissingCacheAddress(&'static str),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure for the lightbox daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// HTTP server and logging.
    pub server: ServerConfig,

    /// Where images and frontend resources live.
    pub paths: PathsConfig,

    /// Cache backends for derived artifacts.
    pub cache: CachesConfig,

    /// Image decoding limits.
    pub imaging: ImagingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the HTTP server binds to.
    pub listen_addr: String,

    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Write daily log files here in addition to stderr.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PathsConfig {
    /// Root of the browsable image tree.
    pub image_dir: PathBuf,

    /// Frontend assets, served under `/static/`.
    pub resource_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CachesConfig {
    /// Rendered thumbnails.
    pub thumbnails: CacheConfig,

    /// Image dimensions.
    pub metadata: CacheConfig,
}

/// One cache backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CacheConfig {
    /// One file per entry below `dir`. The filesystem must support user
    /// extended attributes.
    File { dir: PathBuf },

    /// An external Redis-compatible server.
    Redis {
        address: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        password: Option<String>,
        #[serde(default)]
        prefix: String,
    },

    /// An in-process server. Contents are lost on restart.
    Embedded {
        #[serde(default)]
        prefix: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ImagingConfig {
    /// Upper bound for producing one thumbnail or one metadata entry.
    pub fill_timeout_secs: u64,

    /// Images decoded at the same time.
    pub max_concurrent_decodes: usize,

    /// Larger images are refused before decoding.
    pub max_image_pixels: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:3000".to_string(),
            log_level: "info".to_string(),
            log_dir: None,
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            image_dir: dirs::picture_dir().unwrap_or_else(|| PathBuf::from(".")),
            resource_dir: PathBuf::from("dist"),
        }
    }
}

impl Default for CachesConfig {
    fn default() -> Self {
        Self {
            thumbnails: CacheConfig::File {
                dir: default_cache_dir().join("thumbnails"),
            },
            metadata: CacheConfig::Embedded {
                prefix: "meta:".to_string(),
            },
        }
    }
}

impl Default for ImagingConfig {
    fn default() -> Self {
        Self {
            fill_timeout_secs: 30,
            max_concurrent_decodes: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            max_image_pixels: 100_000_000,
        }
    }
}

impl ImagingConfig {
    pub fn fill_timeout(&self) -> Duration {
        Duration::from_secs(self.fill_timeout_secs)
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("lightbox")
        .join("config.toml")
}

/// Returns the default cache directory path.
fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("lightbox")
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - LIGHTBOX_LISTEN_ADDR: Override the HTTP listen address
    /// - LIGHTBOX_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    /// - LIGHTBOX_IMAGE_DIR: Override the image root
    pub fn apply_env_overrides(&mut self) {
        if let Ok(addr) = std::env::var("LIGHTBOX_LISTEN_ADDR") {
            if !addr.is_empty() {
                tracing::info!("Overriding listen_addr from environment: {}", addr);
                self.server.listen_addr = addr;
            }
        }

        if let Ok(level) = std::env::var("LIGHTBOX_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log_level from environment: {}", level);
                self.server.log_level = level;
            }
        }

        if let Ok(dir) = std::env::var("LIGHTBOX_IMAGE_DIR") {
            if !dir.is_empty() {
                tracing::info!("Overriding image_dir from environment: {}", dir);
                self.paths.image_dir = PathBuf::from(dir);
            }
        }
    }

    /// Validate the configuration values.
    ///
    /// Returns an error if any configuration value is outside the valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.listen_addr.parse::<SocketAddr>().is_err() {
            return Err(ConfigError::InvalidListenAddr(
                self.server.listen_addr.clone(),
            ));
        }

        let level = self.server.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.server.log_level.clone()));
        }

        let timeout = self.imaging.fill_timeout_secs;
        if !(1..=3600).contains(&timeout) {
            return Err(ConfigError::InvalidFillTimeout(timeout));
        }

        let decodes = self.imaging.max_concurrent_decodes;
        if !(1..=1024).contains(&decodes) {
            return Err(ConfigError::InvalidMaxConcurrentDecodes(decodes));
        }

        if self.imaging.max_image_pixels == 0 {
            return Err(ConfigError::InvalidMaxImagePixels(0));
        }

        for (name, cache) in [
            ("thumbnails", &self.cache.thumbnails),
            ("metadata", &self.cache.metadata),
        ] {
            if let CacheConfig::Redis { address, .. } = cache {
                if address.trim().is_empty() {
                    return Err(ConfigError::MissingCacheAddress(name));
                }
            }
        }

        Ok(())
    }

    /// The listen address as a socket address. Call after [`Config::validate`].
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        self.server
            .listen_addr
            .parse()
            .with_context(|| format!("Invalid listen address: {}", self.server.listen_addr))
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    /// If the file exists but is invalid TOML, returns an error with
    /// a helpful message.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file.
    ///
    /// Creates parent directories if they don't exist.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!("Configuration saved to {:?}", path);
        Ok(())
    }

    /// Create file cache directories that live below the default cache
    /// directory. Other configured directories must already exist.
    pub fn create_default_cache_dirs(&self) -> Result<()> {
        self.create_cache_dirs_below(&default_cache_dir())
    }

    fn create_cache_dirs_below(&self, base: &Path) -> Result<()> {
        for cache in [&self.cache.thumbnails, &self.cache.metadata] {
            if let CacheConfig::File { dir } = cache {
                if dir.starts_with(base) {
                    fs::create_dir_all(dir).with_context(|| {
                        format!("Failed to create cache directory: {}", dir.display())
                    })?;
                }
            }
        }
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}
