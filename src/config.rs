//! Configuration management for codeconfig
//!
//! Settings are loaded from environment variables with sensible defaults.
//!
//! # Environment Variables
//!
//! - `CODECONFIG_BIND_HOST`: Host the per-service collection servers bind - default: "127.0.0.1"
//! - `CODECONFIG_COLLECT_LOG_DIR`: Directory for per-service collection logs - default: ".codeconfig/collect"
//! - `CODECONFIG_MAX_CONCURRENT_BUILDS`: Image builds in flight - default: logical CPU count
//! - `CODECONFIG_LOG_LEVEL`: Logging level - default: "info"
//! - `CODECONFIG_LOG_JSON`: Emit JSON logs (true|false) - default: "false"
//!
//! # Example
//!
//! ```no_run
//! use codeconfig::CollectorConfig;
//!
//! let config = CollectorConfig::default();
//! config.validate().expect("Invalid configuration");
//! println!("{}", config);
//! ```

use crate::project::PreviewFeature;
use crate::session::SessionOptions;
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;

const DEFAULT_BIND_HOST: &str = "127.0.0.1";
const DEFAULT_COLLECT_LOG_DIR: &str = ".codeconfig/collect";
const DEFAULT_LOG_LEVEL: &str = "info";

pub const BIND_HOST_ENV: &str = "CODECONFIG_BIND_HOST";
pub const COLLECT_LOG_DIR_ENV: &str = "CODECONFIG_COLLECT_LOG_DIR";
pub const MAX_CONCURRENT_BUILDS_ENV: &str = "CODECONFIG_MAX_CONCURRENT_BUILDS";
pub const LOG_LEVEL_ENV: &str = "CODECONFIG_LOG_LEVEL";
pub const LOG_JSON_ENV: &str = "CODECONFIG_LOG_JSON";

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Configuration validation failed
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    /// Failed to parse configuration value
    #[error("Failed to parse {field}: {error}")]
    ParseError { field: String, error: String },
}

#[derive(Debug, Clone)]
pub struct CollectorConfig {
    pub bind_host: String,

    pub collect_log_dir: PathBuf,

    /// `None` sizes the build pool from the machine
    pub max_concurrent_builds: Option<usize>,

    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,

    pub log_json: bool,
}

impl Default for CollectorConfig {
    /// Loads `CODECONFIG_*` variables; anything missing or unparseable
    /// falls back to its default. Use [`CollectorConfig::from_env`] to have
    /// bad values reported instead.
    fn default() -> Self {
        let bind_host = env::var(BIND_HOST_ENV)
            .ok()
            .filter(|h| !h.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_BIND_HOST.to_string());

        let collect_log_dir = env::var(COLLECT_LOG_DIR_ENV)
            .ok()
            .filter(|d| !d.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_COLLECT_LOG_DIR));

        let max_concurrent_builds = env::var(MAX_CONCURRENT_BUILDS_ENV)
            .ok()
            .and_then(|v| v.parse::<usize>().ok());

        let log_level = env::var(LOG_LEVEL_ENV)
            .unwrap_or_else(|_| DEFAULT_LOG_LEVEL.to_string())
            .to_lowercase();

        let log_json = env::var(LOG_JSON_ENV)
            .ok()
            .and_then(|v| v.parse::<bool>().ok())
            .unwrap_or(false);

        Self {
            bind_host,
            collect_log_dir,
            max_concurrent_builds,
            log_level,
            log_json,
        }
    }
}

fn parse_env<T>(key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match env::var(key) {
        Ok(value) => value
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::ParseError {
                field: key.to_string(),
                error: e.to_string(),
            }),
        Err(_) => Ok(None),
    }
}

impl CollectorConfig {
    /// Strict variant of `default()`: unparseable values are errors and the
    /// result is validated.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.max_concurrent_builds = parse_env::<usize>(MAX_CONCURRENT_BUILDS_ENV)?;
        if let Some(log_json) = parse_env::<bool>(LOG_JSON_ENV)? {
            config.log_json = log_json;
        }
        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if any validation fails
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bind_host.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "Bind host must not be empty".to_string(),
            ));
        }

        if self.max_concurrent_builds == Some(0) {
            return Err(ConfigError::ValidationFailed(
                "Max concurrent builds must be at least 1".to_string(),
            ));
        }

        match self.log_level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => {
                return Err(ConfigError::ValidationFailed(format!(
                    "Invalid log level: {}. Valid options: trace, debug, info, warn, error",
                    self.log_level
                )))
            }
        }

        Ok(())
    }

    /// Session settings for a collection run of a project with `preview`
    pub fn session_options(&self, preview: Vec<PreviewFeature>) -> SessionOptions {
        SessionOptions::new(self.bind_host.clone(), self.collect_log_dir.clone())
            .with_preview(preview)
    }

    pub fn to_display_map(&self) -> HashMap<String, String> {
        let mut map = HashMap::new();

        map.insert("bind_host".to_string(), self.bind_host.clone());
        map.insert(
            "collect_log_dir".to_string(),
            self.collect_log_dir.display().to_string(),
        );
        if let Some(max) = self.max_concurrent_builds {
            map.insert("max_concurrent_builds".to_string(), max.to_string());
        }
        map.insert("log_level".to_string(), self.log_level.clone());
        map.insert("log_json".to_string(), self.log_json.to_string());

        map
    }
}

impl fmt::Display for CollectorConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Codeconfig Configuration:")?;
        writeln!(f, "  Bind Host: {}", self.bind_host)?;
        writeln!(f, "  Collect Log Dir: {}", self.collect_log_dir.display())?;
        match self.max_concurrent_builds {
            Some(max) => writeln!(f, "  Max Concurrent Builds: {}", max)?,
            None => writeln!(f, "  Max Concurrent Builds: auto")?,
        }
        writeln!(f, "  Log Level: {}", self.log_level)?;
        writeln!(f, "  Log JSON: {}", self.log_json)?;
        Ok(())
    }
}
