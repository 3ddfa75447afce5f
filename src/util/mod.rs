//! Utility modules for codeconfig

pub mod logging;

pub use logging::{init_logging, LoggingConfig};
