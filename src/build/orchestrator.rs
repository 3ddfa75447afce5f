//! Bounded-parallel image builds

use super::update::{BuildUpdate, BuildUpdateWriter};
use super::{default_build_concurrency, BuildError, ImageBuilder};
use crate::project::Project;
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::sync::Semaphore;
use tracing::{debug, error, info};

/// Builds every service of a project with at most `max_concurrency` builds
/// in flight.
pub struct BuildOrchestrator {
    builder: Arc<dyn ImageBuilder>,
    max_concurrency: usize,
}

impl BuildOrchestrator {
    pub fn new(builder: Arc<dyn ImageBuilder>) -> Self {
        Self {
            builder,
            max_concurrency: default_build_concurrency(),
        }
    }

    /// Overrides the concurrency limit. Zero is treated as one.
    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency.max(1);
        self
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    /// Starts building every service and returns the update stream.
    ///
    /// Each service yields one `Building` update when it gets a build slot,
    /// any number of output lines, then exactly one `Complete` or `Error`.
    /// The stream ends once every build has finished and released its slot.
    /// Must be called from within a tokio runtime.
    pub fn build_services(
        &self,
        project: &Project,
    ) -> Result<UnboundedReceiver<BuildUpdate>, BuildError> {
        if project.services().is_empty() {
            return Err(BuildError::NoServices);
        }

        let permits = Arc::new(Semaphore::new(self.max_concurrency));
        let (tx, rx) = mpsc::unbounded_channel();

        info!(
            project = %project.name,
            services = project.services().len(),
            max_concurrency = self.max_concurrency,
            "Building service images"
        );

        let mut tasks = Vec::with_capacity(project.services().len());
        for service in project.services() {
            let name = service.name().to_string();
            let service = service.clone();
            let project_name = project.name.clone();
            let builder = Arc::clone(&self.builder);
            let permits = Arc::clone(&permits);
            let writer = BuildUpdateWriter::new(service.name(), tx.clone());

            let handle = tokio::spawn(async move {
                let Ok(_permit) = permits.acquire_owned().await else {
                    return;
                };

                writer.building(format!("Building image for service {}", service.name()));

                match builder.build(&project_name, &service, writer.clone()).await {
                    Ok(image) => {
                        debug!(service = %service.name(), image = %image, "Image built");
                        writer.complete(format!("Built image {}", image));
                    }
                    Err(e) => {
                        error!(service = %service.name(), "Image build failed: {}", e);
                        writer.error(e);
                    }
                }
            });
            tasks.push((name, handle));
        }

        let capacity = self.max_concurrency as u32;
        tokio::spawn(async move {
            for (name, handle) in tasks {
                if let Err(e) = handle.await {
                    error!(service = %name, "Build task failed: {}", e);
                    BuildUpdateWriter::new(name.clone(), tx.clone()).error(BuildError::Panicked {
                        service: name,
                        message: e.to_string(),
                    });
                }
            }

            // Every slot back in the pool before the stream closes
            let _drained = permits.acquire_many(capacity).await;
            drop(tx);
            debug!("All image builds finished");
        });

        Ok(rx)
    }
}
