//! Container image builds for a project's services
//!
//! [`BuildOrchestrator`] fans builds out across services under a concurrency
//! limit and reports progress as a stream of [`BuildUpdate`]s. How a single
//! image is produced is owned by an [`ImageBuilder`]; [`DockerImageBuilder`]
//! talks to the local Docker daemon.

pub mod docker;
pub mod orchestrator;
pub mod update;

pub use docker::DockerImageBuilder;
pub use orchestrator::BuildOrchestrator;
pub use update::{BuildStatus, BuildUpdate, BuildUpdateWriter};

use crate::project::Service;
use async_trait::async_trait;
use std::io;
use sysinfo::System;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BuildError {
    /// Nothing to build
    #[error("no services to build")]
    NoServices,

    /// The build context could not be packaged
    #[error("unable to prepare build context for service {service}: {source}")]
    Context {
        service: String,
        #[source]
        source: io::Error,
    },

    /// Talking to the container engine failed
    #[error("container engine request failed for service {service}: {source}")]
    Docker {
        service: String,
        #[source]
        source: bollard::errors::Error,
    },

    /// The engine accepted the build but reported a failure
    #[error("image build failed for service {service}: {message}")]
    Daemon { service: String, message: String },

    #[error("build task for service {service} panicked: {message}")]
    Panicked { service: String, message: String },
}

/// Produces one container image for one service
#[async_trait]
pub trait ImageBuilder: Send + Sync {
    /// Builds the image and returns its tag. Progress lines go to `output`.
    async fn build(
        &self,
        project_name: &str,
        service: &Service,
        output: BuildUpdateWriter,
    ) -> Result<String, BuildError>;
}

/// Image tag for a service, `<project>-<service>`
pub fn image_name(project_name: &str, service_name: &str) -> String {
    format!("{}-{}", project_name, service_name)
}

/// Default number of concurrent builds: logical CPUs, capped by what the
/// process is actually allowed to use
pub fn default_build_concurrency() -> usize {
    let sys = System::new_all();
    let cpus = sys.cpus().len();

    let allowed = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);

    match cpus {
        0 => allowed,
        n => n.min(allowed),
    }
    .max(1)
}
