//! # shaman-config
//!
//! Configuration management for the Shaman file store.
//!
//! Loads configuration from:
//! 1. `~/.shaman/config.toml` (global)
//! 2. `./shaman.toml` (local, overrides global)
//! 3. Environment variables (highest priority)
//!
//! The loaded [`Config`] is handed to the service object explicitly; there is
//! no process-wide configuration instance.

pub mod logging;
pub mod testing;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Directory name of the blob store below the storage root.
pub const FILE_STORE_DIR: &str = "file-store";
/// Directory name of the checkout tree below the storage root.
pub const CHECKOUT_DIR: &str = "jobs";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub shaman: ShamanConfig,
    pub garbage_collect: GarbageCollectConfig,
    pub report: ReportConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Load config from standard locations
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Config::default();

        // 1. Global config (~/.shaman/config.toml)
        if let Some(global_path) = Self::global_config_path() {
            if global_path.exists() {
                debug!("Loading global config from {:?}", global_path);
                config = Self::parse_file(&global_path)?;
            }
        }

        // 2. Local config (./shaman.toml) - overrides global
        let local_path = Path::new("shaman.toml");
        if local_path.exists() {
            debug!("Loading local config from {:?}", local_path);
            let local = Self::parse_file(local_path)?;
            config.merge(local);
        }

        // 3. Environment variable overrides
        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Load config from a single explicit file, then apply environment overrides.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        debug!("Loading config from {:?}", path);
        let mut config = Self::parse_file(path)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn parse_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    /// Global config path: ~/.shaman/config.toml
    pub fn global_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(".shaman/config.toml"))
    }

    /// Merge a local config over this one. Only values that differ from the
    /// defaults replace the current ones.
    fn merge(&mut self, other: Config) {
        let defaults = Config::default();

        if other.shaman.enabled != defaults.shaman.enabled {
            self.shaman.enabled = other.shaman.enabled;
        }
        if other.shaman.storage_root != defaults.shaman.storage_root {
            self.shaman.storage_root = other.shaman.storage_root;
        }
        if other.shaman.checkout_root.is_some() {
            self.shaman.checkout_root = other.shaman.checkout_root;
        }
        if other.garbage_collect.period_secs != defaults.garbage_collect.period_secs {
            self.garbage_collect.period_secs = other.garbage_collect.period_secs;
        }
        if other.garbage_collect.max_age_secs != defaults.garbage_collect.max_age_secs {
            self.garbage_collect.max_age_secs = other.garbage_collect.max_age_secs;
        }
        if !other.garbage_collect.extra_checkout_dirs.is_empty() {
            self.garbage_collect.extra_checkout_dirs = other.garbage_collect.extra_checkout_dirs;
        }
        if other.report.interval_secs != defaults.report.interval_secs {
            self.report.interval_secs = other.report.interval_secs;
        }
        if other.logging.level != defaults.logging.level {
            self.logging.level = other.logging.level;
        }
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var("SHAMAN_STORAGE_ROOT") {
            self.shaman.storage_root = PathBuf::from(path);
        }
        if let Ok(path) = std::env::var("SHAMAN_CHECKOUT_ROOT") {
            self.shaman.checkout_root = Some(PathBuf::from(path));
        }
        if let Ok(secs) = std::env::var("SHAMAN_GC_MAX_AGE_SECS") {
            if let Ok(n) = secs.parse() {
                self.garbage_collect.max_age_secs = n;
            }
        }
    }

    /// Reject settings the background tasks cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.garbage_collect.period_secs == 0 {
            return Err(ConfigError::Invalid(
                "garbage_collect.period_secs must be positive".to_string(),
            ));
        }
        if self.report.interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "report.interval_secs must be positive".to_string(),
            ));
        }
        if let Some(dir) = self
            .garbage_collect
            .extra_checkout_dirs
            .iter()
            .find(|d| !d.is_absolute())
        {
            return Err(ConfigError::Invalid(format!(
                "garbage_collect.extra_checkout_dirs entry {:?} must be absolute",
                dir
            )));
        }
        Ok(())
    }

    /// Root directory of the blob store (`uploading/` and `stored/` live below it).
    pub fn file_store_path(&self) -> PathBuf {
        self.shaman.storage_root.join(FILE_STORE_DIR)
    }

    /// Root directory of the checkout tree.
    pub fn checkout_path(&self) -> PathBuf {
        self.shaman
            .checkout_root
            .clone()
            .unwrap_or_else(|| self.shaman.storage_root.join(CHECKOUT_DIR))
    }

    /// Generate default config TOML string
    pub fn default_toml() -> String {
        toml::to_string_pretty(&Config::default()).unwrap_or_default()
    }
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShamanConfig {
    /// When false, every file store operation is refused.
    pub enabled: bool,
    /// Directory holding the file store and (by default) the checkouts.
    pub storage_root: PathBuf,
    /// Override for the checkout tree location.
    pub checkout_root: Option<PathBuf>,
}

impl Default for ShamanConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            storage_root: PathBuf::from("./shaman-storage"),
            checkout_root: None,
        }
    }
}

/// Garbage collection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GarbageCollectConfig {
    /// Seconds between two periodic collection runs.
    pub period_secs: u64,
    /// Blobs younger than this are never collected.
    pub max_age_secs: u64,
    /// Additional directories whose symlinks keep blobs alive.
    pub extra_checkout_dirs: Vec<PathBuf>,
}

impl GarbageCollectConfig {
    pub fn period(&self) -> Duration {
        Duration::from_secs(self.period_secs)
    }

    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }
}

impl Default for GarbageCollectConfig {
    fn default() -> Self {
        Self {
            period_secs: 24 * 3600,
            max_age_secs: 31 * 24 * 3600,
            extra_checkout_dirs: Vec::new(),
        }
    }
}

/// Diagnostic reporting configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportConfig {
    pub interval_secs: u64,
}

impl ReportConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self { interval_secs: 600 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// One of error, warn, info, debug, trace
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}
