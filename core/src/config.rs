//! Log configuration.
//!
//! Detail and summary logs are configured independently: each can go to the
//! console, to a rotating file, or both, and each decides whether verbatim
//! wire payloads (`RawData`) are written.
//!
//! # Example
//!
//! ```
//! use correlate_core::config::LogConfig;
//!
//! let config = LogConfig::from_toml_str(r#"
//!     app_name = "profile-service"
//!
//!     [detail]
//!     raw_data = true
//!     log_file = true
//!
//!     [file]
//!     directory = "/var/log/profile"
//!     max_size_mb = 50
//! "#).unwrap();
//!
//! assert!(config.detail.raw_data);
//! assert!(config.detail.log_console);
//! assert!(!config.summary.log_file);
//! assert_eq!(config.file.max_backups, 3);
//! ```

use crate::masking::MaskingConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Configuration error.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The TOML document could not be parsed.
    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// An environment value had the wrong shape.
    #[error("Invalid value for {key}: {value}")]
    InvalidValue {
        /// Variable name
        key: String,
        /// Offending value
        value: String,
    },
}

/// Sink toggles for one log kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SinkConfig {
    /// Emit verbatim wire payloads.
    pub raw_data: bool,
    /// Write to the rotating log file.
    pub log_file: bool,
    /// Write to stdout.
    pub log_console: bool,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            raw_data: false,
            log_file: false,
            log_console: true,
        }
    }
}

/// Rotation policy for file sinks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileRotation {
    /// Directory holding the log files.
    pub directory: PathBuf,
    /// Rotate once the active file exceeds this many megabytes.
    pub max_size_mb: u64,
    /// Number of rotated files kept.
    pub max_backups: usize,
    /// Rotated files older than this many days are removed.
    pub max_age_days: u64,
}

impl Default for FileRotation {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("./logs"),
            max_size_mb: 10,
            max_backups: 3,
            max_age_days: 7,
        }
    }
}

impl FileRotation {
    /// Maximum active file size in bytes.
    #[must_use]
    pub const fn max_size_bytes(&self) -> u64 {
        self.max_size_mb.saturating_mul(1024 * 1024)
    }
}

/// Configuration of the correlation logger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Application name written as `AppName`.
    pub app_name: String,
    /// Instance identifier; resolved from the environment when unset.
    pub instance: Option<String>,
    /// Detail log sinks.
    pub detail: SinkConfig,
    /// Summary log sinks.
    pub summary: SinkConfig,
    /// Rotation policy shared by both file sinks.
    pub file: FileRotation,
    /// Call-site masking lists, merged with the built-in ones.
    pub masking: MaskingConfig,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            app_name: "correlate".to_string(),
            instance: None,
            detail: SinkConfig::default(),
            summary: SinkConfig::default(),
            file: FileRotation::default(),
            masking: MaskingConfig::default(),
        }
    }
}

impl LogConfig {
    /// Parse a configuration from TOML. Missing keys take their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] if the document is not valid TOML or a
    /// value has the wrong type.
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(source)?)
    }

    /// Load configuration from process environment variables.
    ///
    /// See [`LogConfig::from_lookup`] for the recognized variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] if a boolean variable is not a boolean.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through a variable lookup function.
    ///
    /// Recognized keys: `SERVICE_NAME`, `INSTANCE_ID`, `LOG_DIR`,
    /// `LOG_DETAIL_RAW_DATA`, `LOG_DETAIL_FILE`, `LOG_DETAIL_CONSOLE`,
    /// `LOG_SUMMARY_FILE`, `LOG_SUMMARY_CONSOLE`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] if a boolean variable is not a boolean.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(name) = lookup("SERVICE_NAME") {
            config.app_name = name;
        }
        config.instance = lookup("INSTANCE_ID");
        if let Some(dir) = lookup("LOG_DIR") {
            config.file.directory = PathBuf::from(dir);
        }

        let flag = |key: &str, default: bool| -> Result<bool, ConfigError> {
            lookup(key).map_or(Ok(default), |value| parse_bool(key, &value))
        };
        config.detail.raw_data = flag("LOG_DETAIL_RAW_DATA", config.detail.raw_data)?;
        config.detail.log_file = flag("LOG_DETAIL_FILE", config.detail.log_file)?;
        config.detail.log_console = flag("LOG_DETAIL_CONSOLE", config.detail.log_console)?;
        config.summary.log_file = flag("LOG_SUMMARY_FILE", config.summary.log_file)?;
        config.summary.log_console = flag("LOG_SUMMARY_CONSOLE", config.summary.log_console)?;

        Ok(config)
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}
