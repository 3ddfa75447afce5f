use crate::project::PreviewFeature;
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Discover what cloud resources each service needs by running it
#[derive(Parser, Debug)]
#[command(
    name = "codeconfig",
    about = "Collects per-service cloud resource requirements and builds service images",
    version,
    author,
    long_about = "codeconfig runs every service of a project in collection mode against a \
                  private local control plane, records the resources each service declares \
                  (APIs, schedules, topics, buckets, databases and more) and reports them \
                  as one requirement set per service. It can also build a container image \
                  per service with bounded parallelism."
)]
pub struct CliArgs {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(long, global = true, value_name = "LEVEL", help = "Set logging level")]
    pub log_level: Option<String>,

    #[arg(short = 'v', long, global = true, help = "Enable debug logging")]
    pub verbose: bool,

    #[arg(
        short = 'q',
        long,
        global = true,
        conflicts_with = "verbose",
        help = "Quiet mode - suppress non-error output"
    )]
    pub quiet: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    #[command(
        about = "Collect the resource requirements of every service",
        long_about = "Starts each service with SERVICE_ADDRESS and SERVICE_ENVIRONMENT=collection \
                      set, records what it registers, and prints the requirements.\n\n\
                      Examples:\n  \
                      codeconfig collect --service services/orders.ts --start 'npx ts-node {file}'\n  \
                      codeconfig collect --dir app --service api.py --service jobs.py --start 'python {file}' --preview sql-databases"
    )]
    Collect(CollectArgs),

    #[command(
        about = "Build a container image for every service",
        long_about = "Builds one image per service, tagged <project>-<service>, with a bounded \
                      number of builds in flight.\n\n\
                      Examples:\n  \
                      codeconfig build --service services/orders.ts\n  \
                      codeconfig build --service main.go --dockerfile go.dockerfile --concurrency 2"
    )]
    Build(BuildArgs),

    #[command(about = "Show the effective configuration")]
    Config(ConfigArgs),
}

/// Where the project lives and which files are services
#[derive(Args, Debug, Clone)]
pub struct ProjectArgs {
    #[arg(
        short = 'd',
        long,
        value_name = "DIR",
        default_value = ".",
        help = "Project directory; service files are relative to it"
    )]
    pub dir: PathBuf,

    #[arg(
        short = 'n',
        long,
        value_name = "NAME",
        help = "Project name (defaults to the directory name)"
    )]
    pub name: Option<String>,

    #[arg(
        short = 's',
        long = "service",
        value_name = "FILE",
        required = true,
        help = "Service entrypoint file (repeatable)"
    )]
    pub services: Vec<PathBuf>,

    #[arg(
        long,
        value_name = "FEATURE",
        value_parser = parse_preview,
        help = "Enable a preview feature: sql-databases, websockets, http (repeatable)"
    )]
    pub preview: Vec<PreviewFeature>,

    #[arg(
        long,
        value_name = "PATH",
        help = "Dockerfile for every service; '{file}' expands to the service file (default: Dockerfile)"
    )]
    pub dockerfile: Option<String>,

    #[arg(
        long = "build-arg",
        value_name = "KEY=VALUE",
        value_parser = parse_key_value,
        help = "Build argument passed to every image build (repeatable)"
    )]
    pub build_args: Vec<(String, String)>,
}

#[derive(Parser, Debug, Clone)]
pub struct CollectArgs {
    #[command(flatten)]
    pub project: ProjectArgs,

    #[arg(
        long,
        value_name = "COMMAND",
        help = "Command that starts a service; '{file}' expands to the service file"
    )]
    pub start: Option<String>,

    #[arg(
        long = "env",
        value_name = "KEY=VALUE",
        value_parser = parse_key_value,
        help = "Extra environment variable for every service (repeatable)"
    )]
    pub env: Vec<(String, String)>,

    #[arg(
        short = 'f',
        long,
        value_enum,
        default_value = "json",
        help = "Output format"
    )]
    pub format: OutputFormatArg,

    #[arg(
        short = 'o',
        long,
        value_name = "FILE",
        help = "Write output to file instead of stdout"
    )]
    pub output: Option<PathBuf>,
}

#[derive(Parser, Debug, Clone)]
pub struct BuildArgs {
    #[command(flatten)]
    pub project: ProjectArgs,

    #[arg(
        short = 'c',
        long,
        value_name = "N",
        help = "Maximum concurrent builds (defaults to the number of CPUs)"
    )]
    pub concurrency: Option<usize>,
}

#[derive(Parser, Debug, Clone)]
pub struct ConfigArgs {
    #[arg(
        short = 'f',
        long,
        value_enum,
        default_value = "human",
        help = "Output format"
    )]
    pub format: OutputFormatArg,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormatArg {
    Json,
    Human,
}

impl From<OutputFormatArg> for super::output::OutputFormat {
    fn from(arg: OutputFormatArg) -> Self {
        match arg {
            OutputFormatArg::Json => super::output::OutputFormat::Json,
            OutputFormatArg::Human => super::output::OutputFormat::Human,
        }
    }
}

fn parse_preview(s: &str) -> Result<PreviewFeature, String> {
    s.parse()
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("Invalid KEY=VALUE pair: {}", s)),
    }
}
