//! Collection fan-out across every service in a project

use crate::collector::RequirementsSet;
use crate::project::Project;
use crate::runner::ServiceRunner;
use crate::session::{CollectionSession, SessionError, SessionOptions};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;
use tracing::{debug, error, info};

/// Every service that failed to collect, sorted by service name
#[derive(Debug)]
pub struct AggregateError {
    pub failures: Vec<ServiceFailure>,
}

/// A session error, or a session task that died before producing one
#[derive(Debug, thiserror::Error)]
pub enum ServiceFailure {
    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("collection task for service {service} panicked: {message}")]
    Panicked { service: String, message: String },
}

impl ServiceFailure {
    pub fn service(&self) -> &str {
        match self {
            ServiceFailure::Session(e) => e.service(),
            ServiceFailure::Panicked { service, .. } => service,
        }
    }
}

impl AggregateError {
    pub fn services(&self) -> Vec<&str> {
        self.failures.iter().map(|f| f.service()).collect()
    }
}

impl fmt::Display for AggregateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "requirement collection failed for {} service(s):",
            self.failures.len()
        )?;
        for failure in &self.failures {
            write!(f, "\n  {}: {}", failure.service(), failure)?;
        }
        Ok(())
    }
}

impl std::error::Error for AggregateError {}

pub struct CollectionCoordinator {
    runner: Arc<dyn ServiceRunner>,
    options: SessionOptions,
    stop: Option<watch::Receiver<bool>>,
}

impl CollectionCoordinator {
    pub fn new(runner: Arc<dyn ServiceRunner>, options: SessionOptions) -> Self {
        Self {
            runner,
            options,
            stop: None,
        }
    }

    /// Flipping the sender to `true` asks every running service to terminate
    pub fn with_stop_signal(mut self, stop: watch::Receiver<bool>) -> Self {
        self.stop = Some(stop);
        self
    }

    /// Collects every service concurrently. Either all services succeed or
    /// the error lists every one that did not.
    pub async fn collect(
        &self,
        project: &Project,
    ) -> Result<HashMap<String, RequirementsSet>, AggregateError> {
        let results: Arc<Mutex<Vec<RequirementsSet>>> = Arc::new(Mutex::new(Vec::new()));
        let errors: Arc<Mutex<Vec<ServiceFailure>>> = Arc::new(Mutex::new(Vec::new()));

        // Without an external signal nobody ever stops; keep the sender alive
        // for the duration of the run so receivers never see a closed channel.
        let (_local_stop_tx, local_stop_rx) = watch::channel(false);
        let stop = self.stop.clone().unwrap_or(local_stop_rx);

        let mut options = self.options.clone();
        options.preview = project.preview.clone();

        info!(
            project = %project.name,
            services = project.services().len(),
            "Collecting service requirements"
        );

        let mut tasks = Vec::with_capacity(project.services().len());
        for service in project.services() {
            let name = service.name().to_string();
            let session = CollectionSession::new(service.clone(), options.clone());
            let runner = Arc::clone(&self.runner);
            let stop = stop.clone();
            let results = Arc::clone(&results);
            let errors = Arc::clone(&errors);

            let handle = tokio::spawn(async move {
                match session.collect(runner.as_ref(), stop).await {
                    Ok(requirements) => results
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .push(requirements),
                    Err(e) => errors
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .push(e.into()),
                }
            });
            tasks.push((name, handle));
        }

        for (name, handle) in tasks {
            if let Err(e) = handle.await {
                error!(service = %name, "Collection task failed: {}", e);
                errors
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(ServiceFailure::Panicked {
                        service: name,
                        message: e.to_string(),
                    });
            }
        }

        let mut failures =
            std::mem::take(&mut *errors.lock().unwrap_or_else(PoisonError::into_inner));
        if !failures.is_empty() {
            failures.sort_by(|a, b| a.service().cmp(b.service()));
            return Err(AggregateError { failures });
        }

        let collected = std::mem::take(&mut *results.lock().unwrap_or_else(PoisonError::into_inner));
        debug!(project = %project.name, collected = collected.len(), "Collection complete");

        Ok(collected
            .into_iter()
            .map(|requirements| (requirements.service_name.clone(), requirements))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::project::{BuildContext, PreviewFeature, Service};
    use crate::runner::{LaunchConfig, ProcessError, RunUpdate};
    use async_trait::async_trait;
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    /// Fails the services named in `failing`, succeeds silently otherwise
    struct ScriptedRunner {
        failing: Vec<&'static str>,
    }

    #[async_trait]
    impl ServiceRunner for ScriptedRunner {
        async fn run(
            &self,
            service: &Service,
            _launch: &LaunchConfig,
            _updates: mpsc::Sender<RunUpdate>,
            _stop: watch::Receiver<bool>,
        ) -> Result<(), ProcessError> {
            if self.failing.contains(&service.name()) {
                return Err(ProcessError::Exited {
                    service: service.name().to_string(),
                    status: "exit status: 1".to_string(),
                });
            }
            Ok(())
        }
    }

    /// Holds every service until all of them are running at once
    struct BarrierRunner {
        barrier: tokio::sync::Barrier,
    }

    #[async_trait]
    impl ServiceRunner for BarrierRunner {
        async fn run(
            &self,
            _service: &Service,
            _launch: &LaunchConfig,
            _updates: mpsc::Sender<RunUpdate>,
            _stop: watch::Receiver<bool>,
        ) -> Result<(), ProcessError> {
            self.barrier.wait().await;
            Ok(())
        }
    }

    struct PanickingRunner;

    #[async_trait]
    impl ServiceRunner for PanickingRunner {
        async fn run(
            &self,
            _service: &Service,
            _launch: &LaunchConfig,
            _updates: mpsc::Sender<RunUpdate>,
            _stop: watch::Receiver<bool>,
        ) -> Result<(), ProcessError> {
            panic!("runner exploded");
        }
    }

    fn project(names: &[&str]) -> Project {
        let mut project = Project::new("shop", ".").with_preview([PreviewFeature::Http]);
        for name in names {
            project
                .add_service(Service::new(
                    *name,
                    format!("{}.ts", name),
                    BuildContext::new(".", "Dockerfile"),
                ))
                .unwrap();
        }
        project
    }

    fn coordinator(runner: Arc<dyn ServiceRunner>, dir: &TempDir) -> CollectionCoordinator {
        CollectionCoordinator::new(runner, SessionOptions::new("127.0.0.1", dir.path()))
    }

    #[tokio::test]
    async fn test_all_services_succeed() {
        let temp_dir = TempDir::new().unwrap();
        let runner = Arc::new(ScriptedRunner { failing: vec![] });

        let results = coordinator(runner, &temp_dir)
            .collect(&project(&["a", "b", "c"]))
            .await
            .unwrap();

        assert_eq!(results.len(), 3);
        assert!(results["b"].is_empty());
    }

    #[tokio::test]
    async fn test_failures_are_aggregated_and_sorted() {
        let temp_dir = TempDir::new().unwrap();
        let runner = Arc::new(ScriptedRunner {
            failing: vec!["c", "a"],
        });

        let err = coordinator(runner, &temp_dir)
            .collect(&project(&["a", "b", "c"]))
            .await
            .unwrap_err();

        assert_eq!(err.services(), vec!["a", "c"]);
        let message = err.to_string();
        assert!(message.contains("2 service(s)"));
        assert!(message.contains("a: service a exited"));
        assert!(message.contains("c: service c exited"));
    }

    #[tokio::test]
    async fn test_panicked_session_reported_as_failure() {
        let temp_dir = TempDir::new().unwrap();

        let err = coordinator(Arc::new(PanickingRunner), &temp_dir)
            .collect(&project(&["only"]))
            .await
            .unwrap_err();

        assert_eq!(err.services(), vec!["only"]);
        assert!(matches!(err.failures[0], ServiceFailure::Panicked { .. }));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_sessions_run_concurrently_beyond_cpu_count() {
        let temp_dir = TempDir::new().unwrap();
        let cpus = std::thread::available_parallelism().map_or(1, |n| n.get());
        let count = cpus + 4;

        let names: Vec<String> = (0..count).map(|i| format!("svc{}", i)).collect();
        let mut project = Project::new("shop", ".");
        for name in &names {
            project
                .add_service(Service::new(
                    name.as_str(),
                    format!("{}.ts", name),
                    BuildContext::new(".", "Dockerfile"),
                ))
                .unwrap();
        }

        let runner = Arc::new(BarrierRunner {
            barrier: tokio::sync::Barrier::new(count),
        });

        let results = tokio::time::timeout(
            std::time::Duration::from_secs(10),
            coordinator(runner, &temp_dir).collect(&project),
        )
        .await
        .expect("sessions were not all running at the same time")
        .unwrap();
        assert_eq!(results.len(), count);
    }

    #[tokio::test]
    async fn test_empty_project_collects_nothing() {
        let temp_dir = TempDir::new().unwrap();
        let runner = Arc::new(ScriptedRunner { failing: vec![] });

        let results = coordinator(runner, &temp_dir)
            .collect(&project(&[]))
            .await
            .unwrap();
        assert!(results.is_empty());
    }
}
