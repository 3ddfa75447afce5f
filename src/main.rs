use codeconfig::cli::commands::{CliArgs, Commands};
use codeconfig::cli::handlers::{handle_build, handle_collect, handle_config};
use codeconfig::util::logging::{init_logging, parse_level, LoggingConfig};
use codeconfig::{CollectorConfig, VERSION};

use clap::Parser;
use tracing::{debug, Level};

#[tokio::main]
async fn main() {
    let args = CliArgs::parse();
    init_logging_from_args(&args);

    debug!("codeconfig v{} starting", VERSION);
    debug!("Arguments: {:?}", args);

    let exit_code = match &args.command {
        Commands::Collect(collect_args) => handle_collect(collect_args).await,
        Commands::Build(build_args) => handle_build(build_args).await,
        Commands::Config(config_args) => handle_config(config_args).await,
    };

    std::process::exit(exit_code);
}

/// Command line flags win over `CODECONFIG_LOG_LEVEL`
fn init_logging_from_args(args: &CliArgs) {
    let config = CollectorConfig::default();

    let level = if let Some(level_str) = &args.log_level {
        parse_level(level_str)
    } else if args.verbose {
        Level::DEBUG
    } else if args.quiet {
        Level::ERROR
    } else {
        parse_level(&config.log_level)
    };

    init_logging(LoggingConfig {
        level,
        ..LoggingConfig::from_config(&config)
    });
}
