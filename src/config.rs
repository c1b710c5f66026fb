//! Configuration file parser for ~/.config/rillet/config.toml.
//!
//! The config file is optional; a missing file yields `Config::default()`.
//! Unknown keys are accepted but logged as likely typos.
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::feed::{SyncOptions, DEFAULT_USER_AGENT};

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Config file too large: {0}")]
    TooLarge(String),

    #[error("HOME environment variable not set")]
    NoHome,
}

// ============================================================================
// Configuration
// ============================================================================

/// Top-level configuration. Every key is optional.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// SQLite database file; defaults to `<config dir>/rillet.db`
    pub database_path: Option<PathBuf>,

    /// Icon directory; defaults to `<config dir>/icons`
    pub icons_dir: Option<PathBuf>,

    /// Seconds a source rests after a bulk sweep refreshed it
    pub refresh_cooldown_secs: u64,

    /// Days a soft-deleted entry is kept before purge
    pub retention_days: u64,

    /// Upper bound on simultaneous fetches during a sweep
    pub max_concurrent_fetches: usize,

    /// Per-request HTTP timeout
    pub request_timeout_secs: u64,

    pub user_agent: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: None,
            icons_dir: None,
            refresh_cooldown_secs: 60,
            retention_days: 30,
            max_concurrent_fetches: 10,
            request_timeout_secs: 30,
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

impl Config {
    /// Maximum config file size (1 MB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    const KNOWN_KEYS: [&'static str; 7] = [
        "database_path",
        "icons_dir",
        "refresh_cooldown_secs",
        "retention_days",
        "max_concurrent_fetches",
        "request_timeout_secs",
        "user_agent",
    ];

    /// `~/.config/rillet`
    pub fn config_dir() -> Result<PathBuf, ConfigError> {
        let home = std::env::var_os("HOME").ok_or(ConfigError::NoHome)?;
        Ok(PathBuf::from(home).join(".config").join("rillet"))
    }

    /// Load configuration from a TOML file.
    ///
    /// - Missing or blank file → `Ok(Config::default())`
    /// - Invalid TOML or wrong value types → `Err(ConfigError::Parse)`
    /// - Files over 1 MB → `Err(ConfigError::TooLarge)`
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::metadata(path) {
            Ok(meta) if meta.len() > Self::MAX_FILE_SIZE => {
                return Err(ConfigError::TooLarge(format!(
                    "Config file is {} bytes (max {} bytes)",
                    meta.len(),
                    Self::MAX_FILE_SIZE
                )));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
            Ok(_) => {}
        }

        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "Config file disappeared, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };

        Self::parse(&content)
    }

    /// Parse configuration from TOML text.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }

        if let Ok(raw) = content.parse::<toml::Table>() {
            for key in raw.keys() {
                if !Self::KNOWN_KEYS.contains(&key.as_str()) {
                    tracing::warn!(key = %key, "Unknown key in config file, ignoring");
                }
            }
        }

        let config: Config = toml::from_str(content)?;
        tracing::info!(
            cooldown_secs = config.refresh_cooldown_secs,
            concurrency = config.max_concurrent_fetches,
            "Loaded configuration"
        );
        Ok(config)
    }

    pub fn database_path(&self, config_dir: &Path) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(|| config_dir.join("rillet.db"))
    }

    pub fn icons_dir(&self, config_dir: &Path) -> PathBuf {
        self.icons_dir
            .clone()
            .unwrap_or_else(|| config_dir.join("icons"))
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_days.saturating_mul(86_400))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    pub fn sync_options(&self) -> SyncOptions {
        SyncOptions {
            concurrency: self.max_concurrent_fetches.max(1),
            cooldown: Duration::from_secs(self.refresh_cooldown_secs),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
