pub mod commands;
pub mod handlers;
pub mod output;

pub use commands::{BuildArgs, CliArgs, CollectArgs, Commands, ConfigArgs, ProjectArgs};
pub use output::{OutputFormat, OutputFormatter};
