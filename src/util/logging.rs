//! Structured logging setup for codeconfig
//!
//! Logs go to stderr so that command output on stdout (collected requirements
//! as JSON) stays machine readable.
//!
//! # Example
//!
//! ```no_run
//! use codeconfig::util::logging::{init_logging, LoggingConfig};
//! use codeconfig::CollectorConfig;
//!
//! init_logging(LoggingConfig::from_config(&CollectorConfig::default()));
//!
//! tracing::info!(service = "orders", "Collecting requirements");
//! ```

use crate::config::CollectorConfig;
use std::env;
use std::sync::Once;
use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Ensures logging is only initialized once
static INIT: Once = Once::new();

/// Dependencies that are noisy at info level
const QUIET_TARGETS: &[&str] = &["h2", "hyper", "tower", "tonic", "bollard"];

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Minimum log level to display
    pub level: Level,

    /// Use JSON output format
    pub use_json: bool,

    /// Include the module target (e.g., codeconfig::session) in logs
    pub include_target: bool,

    /// Include file and line number information
    pub include_location: bool,

    pub include_thread_ids: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            use_json: false,
            include_target: true,
            include_location: false,
            include_thread_ids: false,
        }
    }
}

impl LoggingConfig {
    /// Level and format from the loaded configuration
    pub fn from_config(config: &CollectorConfig) -> Self {
        Self {
            level: parse_level(&config.log_level),
            use_json: config.log_json,
            ..Default::default()
        }
    }
}

/// Parses a log level, case-insensitively. Unknown values fall back to INFO.
///
/// ```
/// use codeconfig::util::logging::parse_level;
/// use tracing::Level;
///
/// assert_eq!(parse_level("debug"), Level::DEBUG);
/// assert_eq!(parse_level("WARN"), Level::WARN);
/// assert_eq!(parse_level("chatty"), Level::INFO);
/// ```
pub fn parse_level(level_str: &str) -> Level {
    match level_str.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => {
            eprintln!(
                "Invalid log level '{}', defaulting to INFO. Valid levels: trace, debug, info, warn, error",
                level_str
            );
            Level::INFO
        }
    }
}

fn build_filter(level: Level) -> EnvFilter {
    let mut filter = EnvFilter::from_default_env();

    if let Ok(directive) = format!("codeconfig={}", level).parse() {
        filter = filter.add_directive(directive);
    }

    // RUST_LOG, when set, decides about dependencies
    if env::var("RUST_LOG").is_err() {
        for target in QUIET_TARGETS {
            if let Ok(directive) = format!("{}=warn", target).parse() {
                filter = filter.add_directive(directive);
            }
        }
    }

    filter
}

/// Initializes the global subscriber. Only the first call has any effect.
pub fn init_logging(config: LoggingConfig) {
    INIT.call_once(|| {
        let filter = build_filter(config.level);

        if config.use_json {
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    fmt::layer()
                        .json()
                        .with_writer(std::io::stderr)
                        .with_target(config.include_target)
                        .with_file(config.include_location)
                        .with_line_number(config.include_location)
                        .with_thread_ids(config.include_thread_ids)
                        .with_thread_names(config.include_thread_ids),
                )
                .init();
        } else {
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    fmt::layer()
                        .with_writer(std::io::stderr)
                        .with_target(config.include_target)
                        .with_file(config.include_location)
                        .with_line_number(config.include_location)
                        .with_thread_ids(config.include_thread_ids)
                        .with_thread_names(config.include_thread_ids),
                )
                .init();
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use yare::parameterized;

    #[parameterized(
        trace = { "trace", Level::TRACE },
        debug = { "debug", Level::DEBUG },
        info = { "info", Level::INFO },
        warn = { "warn", Level::WARN },
        error = { "error", Level::ERROR },
        mixed_case = { "Debug", Level::DEBUG },
        invalid = { "invalid", Level::INFO },
        empty = { "", Level::INFO },
    )]
    fn test_parse_level(input: &str, expected: Level) {
        assert_eq!(parse_level(input), expected);
    }

    #[test]
    fn test_default_config() {
        let config = LoggingConfig::default();
        assert_eq!(config.level, Level::INFO);
        assert!(!config.use_json);
        assert!(config.include_target);
        assert!(!config.include_location);
    }

    #[test]
    fn test_from_collector_config() {
        let config = CollectorConfig {
            bind_host: "127.0.0.1".to_string(),
            collect_log_dir: ".codeconfig/collect".into(),
            max_concurrent_builds: None,
            log_level: "warn".to_string(),
            log_json: true,
        };

        let logging = LoggingConfig::from_config(&config);
        assert_eq!(logging.level, Level::WARN);
        assert!(logging.use_json);
    }

    #[test]
    fn test_filter_includes_crate_directive() {
        let filter = build_filter(Level::DEBUG);
        assert!(filter.to_string().contains("codeconfig=debug"));
    }
}
