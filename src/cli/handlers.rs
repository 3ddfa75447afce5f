//! Subcommand handlers. Each returns the process exit code.

use super::commands::{BuildArgs, CollectArgs, ConfigArgs, ProjectArgs};
use super::output::OutputFormatter;
use crate::build::{BuildOrchestrator, BuildStatus, DockerImageBuilder};
use crate::collector::RequirementsSet;
use crate::config::CollectorConfig;
use crate::coordinator::CollectionCoordinator;
use crate::project::{normalized_service_name, BuildContext, Project, Service};
use crate::runner::CommandRunner;
use anyhow::{Context, Result};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

const DEFAULT_DOCKERFILE: &str = "Dockerfile";
const FILE_PLACEHOLDER: &str = "{file}";

fn forward_slashes(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

/// Assembles the project from command line flags
pub fn load_project(args: &ProjectArgs, start: Option<&str>) -> Result<Project> {
    let name = match &args.name {
        Some(name) => name.clone(),
        None => args
            .dir
            .canonicalize()
            .ok()
            .and_then(|dir| dir.file_name().map(|n| n.to_string_lossy().to_string()))
            .unwrap_or_else(|| "project".to_string()),
    };

    let mut project = Project::new(name, &args.dir).with_preview(args.preview.iter().copied());
    let build_args: HashMap<String, String> = args.build_args.iter().cloned().collect();

    for file in &args.services {
        let file_ref = forward_slashes(file);
        let dockerfile = args
            .dockerfile
            .as_deref()
            .unwrap_or(DEFAULT_DOCKERFILE)
            .replace(FILE_PLACEHOLDER, &file_ref);

        let context =
            BuildContext::for_handler(&args.dir, dockerfile, file, build_args.clone(), &[])
                .with_context(|| format!("Unable to create build context for {}", file.display()))?;

        let mut service = Service::new(normalized_service_name(&project.name, file), file, context);
        if let Some(start) = start {
            service = service.with_start_cmd(start.replace(FILE_PLACEHOLDER, &file_ref));
        }

        debug!(service = %service.name(), file = %file.display(), "Loaded service");
        project.add_service(service)?;
    }

    Ok(project)
}

fn load_config() -> Option<CollectorConfig> {
    match CollectorConfig::from_env() {
        Ok(config) => Some(config),
        Err(e) => {
            error!("{}", e);
            eprintln!("Error: {}", e);
            None
        }
    }
}

/// Stop signal flipped on Ctrl-C
fn stop_on_ctrl_c() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping services");
            let _ = tx.send(true);
        }
    });
    rx
}

/// Where database migrations come from, once any service declared a database
fn migration_notice(project: &Project, results: &HashMap<String, RequirementsSet>) -> Option<String> {
    let databases: usize = results.values().map(|r| r.sql_databases.len()).sum();
    if databases == 0 {
        return None;
    }

    let (image, present) = project.default_migration_image();
    Some(if present {
        format!(
            "{} SQL database(s) declared; migrations will be built as image {}",
            databases, image
        )
    } else {
        format!(
            "{} SQL database(s) declared but {} has no migrations directory",
            databases,
            project.directory.display()
        )
    })
}

fn write_output(output: &str, path: Option<&Path>) -> Result<()> {
    match path {
        Some(path) => std::fs::write(path, output)
            .with_context(|| format!("Failed to write output to {}", path.display())),
        None => {
            println!("{}", output);
            Ok(())
        }
    }
}

pub async fn handle_collect(args: &CollectArgs) -> i32 {
    let Some(config) = load_config() else {
        return 2;
    };

    let project = match load_project(&args.project, args.start.as_deref()) {
        Ok(project) => project,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            return 2;
        }
    };

    let env: BTreeMap<String, String> = args.env.iter().cloned().collect();
    let options = config
        .session_options(project.preview.clone())
        .with_env(env);
    let runner = Arc::new(CommandRunner::new().with_working_dir(&project.directory));

    let coordinator =
        CollectionCoordinator::new(runner, options).with_stop_signal(stop_on_ctrl_c());

    match coordinator.collect(&project).await {
        Ok(results) => {
            info!(services = results.len(), "Requirements collected");
            if let Some(notice) = migration_notice(&project, &results) {
                info!("{}", notice);
                eprintln!("{}", notice);
            }

            let formatter = OutputFormatter::new(args.format.into());
            let written = formatter
                .format_requirements(&results)
                .and_then(|out| write_output(&out, args.output.as_deref()));

            match written {
                Ok(()) => 0,
                Err(e) => {
                    error!("{:#}", e);
                    eprintln!("Error: {:#}", e);
                    1
                }
            }
        }
        Err(e) => {
            error!("{}", e);
            eprintln!("Error: {}", e);
            eprintln!(
                "Service logs are kept in {}",
                config.collect_log_dir.display()
            );
            1
        }
    }
}

pub async fn handle_build(args: &BuildArgs) -> i32 {
    let Some(config) = load_config() else {
        return 2;
    };

    let project = match load_project(&args.project, None) {
        Ok(project) => project,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            return 2;
        }
    };

    let builder = match DockerImageBuilder::connect() {
        Ok(builder) => builder,
        Err(e) => {
            error!("Failed to connect to Docker: {}", e);
            eprintln!("Error: Failed to connect to Docker: {}", e);
            return 1;
        }
    };

    if let Err(e) = builder.daemon_version().await {
        error!("Docker daemon is unreachable: {}", e);
        eprintln!("Error: Docker daemon is unreachable: {}", e);
        return 1;
    }

    let mut orchestrator = BuildOrchestrator::new(Arc::new(builder));
    if let Some(max) = args.concurrency.or(config.max_concurrent_builds) {
        orchestrator = orchestrator.with_max_concurrency(max);
    }

    let mut updates = match orchestrator.build_services(&project) {
        Ok(rx) => rx,
        Err(e) => {
            error!("{}", e);
            eprintln!("Error: {}", e);
            return 2;
        }
    };

    let formatter = OutputFormatter::new(super::output::OutputFormat::Human);
    let mut failed = Vec::new();
    while let Some(update) = updates.recv().await {
        println!("{}", formatter.format_build_update(&update));
        if update.status == BuildStatus::Error {
            failed.push(update.service_name);
        }
    }

    if failed.is_empty() {
        info!(services = project.services().len(), "All images built");
        0
    } else {
        failed.sort();
        eprintln!("Error: image build failed for {}", failed.join(", "));
        1
    }
}

pub async fn handle_config(args: &ConfigArgs) -> i32 {
    let config = CollectorConfig::default();
    if let Err(e) = config.validate() {
        warn!("{}", e);
    }

    match OutputFormatter::new(args.format.into()).format_config(&config) {
        Ok(output) => {
            println!("{}", output);
            0
        }
        Err(e) => {
            eprintln!("Error: {:#}", e);
            1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::RequirementsCollector;
    use crate::project::PreviewFeature;
    use std::path::PathBuf;

    fn project_args(dir: &Path) -> ProjectArgs {
        ProjectArgs {
            dir: dir.to_path_buf(),
            name: Some("shop".to_string()),
            services: vec![PathBuf::from("services/orders.ts"), PathBuf::from("jobs.py")],
            preview: vec![PreviewFeature::SqlDatabases],
            dockerfile: Some("{file}.dockerfile".to_string()),
            build_args: vec![("STAGE".to_string(), "dev".to_string())],
        }
    }

    #[test]
    fn test_load_project_expands_placeholders() {
        let args = project_args(Path::new("."));
        let project = load_project(&args, Some("node {file}")).unwrap();

        assert_eq!(project.name, "shop");
        assert!(project.has_preview(PreviewFeature::SqlDatabases));

        let orders = &project.services()[0];
        assert_eq!(orders.name(), "shop_services-orders");
        assert_eq!(orders.start_cmd(), Some("node services/orders.ts"));
        assert_eq!(
            orders.build_context().dockerfile,
            PathBuf::from("services/orders.ts.dockerfile")
        );
        assert_eq!(orders.build_context().args["HANDLER"], "services/orders.ts");
        assert_eq!(orders.build_context().args["STAGE"], "dev");
    }

    #[test]
    fn test_load_project_without_start_command() {
        let project = load_project(&project_args(Path::new(".")), None).unwrap();
        assert!(project.services().iter().all(|s| s.start_cmd().is_none()));
    }

    #[test]
    fn test_load_project_unsupported_runtime() {
        let mut args = project_args(Path::new("."));
        args.services = vec![PathBuf::from("main.rb")];

        let err = load_project(&args, None).unwrap_err();
        assert!(format!("{:#}", err).contains("main.rb"));
    }

    #[test]
    fn test_migration_notice_only_with_databases() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let mut args = project_args(temp_dir.path());
        args.services = vec![PathBuf::from("orders.ts")];
        let project = load_project(&args, None).unwrap();
        let service = &project.services()[0];

        let collector = RequirementsCollector::new(service);
        let mut results = HashMap::from([(service.name().to_string(), collector.snapshot())]);
        assert!(migration_notice(&project, &results).is_none());

        collector.declare_sql_database("orders".to_string(), None);
        results.insert(service.name().to_string(), collector.snapshot());
        let notice = migration_notice(&project, &results).unwrap();
        assert!(notice.contains("no migrations directory"));

        std::fs::create_dir(temp_dir.path().join("migrations")).unwrap();
        let notice = migration_notice(&project, &results).unwrap();
        assert!(notice.contains("image shop-migrations"));
    }

    #[test]
    fn test_load_project_duplicate_service() {
        let mut args = project_args(Path::new("."));
        args.services = vec![PathBuf::from("api.ts"), PathBuf::from("api.ts")];

        assert!(load_project(&args, None).is_err());
    }
}
