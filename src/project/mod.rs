//! Project model: the set of services collected and built together
//!
//! Loading a project from its on-disk configuration happens elsewhere; this
//! module only holds the already-resolved descriptors.

pub mod preview;
pub mod runtime;
pub mod service;

pub use preview::PreviewFeature;
pub use runtime::Runtime;
pub use service::{normalized_service_name, BuildContext, Service, DEFAULT_SERVICE_TYPE};

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while assembling a project
#[derive(Debug, Error)]
pub enum ProjectError {
    /// Handler extension has no known runtime
    #[error("runtime '{extension}' not supported for handler {}", .handler.display())]
    UnsupportedRuntime { handler: PathBuf, extension: String },

    /// Two services resolved to the same name
    #[error("service {name} is defined more than once, services must only be matched by a single pattern")]
    DuplicateService { name: String },
}

#[derive(Debug, Clone)]
pub struct Project {
    pub name: String,
    pub directory: PathBuf,
    pub preview: Vec<PreviewFeature>,
    services: Vec<Service>,
}

impl Project {
    pub fn new(name: impl Into<String>, directory: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            directory: directory.into(),
            preview: Vec::new(),
            services: Vec::new(),
        }
    }

    pub fn with_preview(mut self, features: impl IntoIterator<Item = PreviewFeature>) -> Self {
        for feature in features {
            if !self.preview.contains(&feature) {
                self.preview.push(feature);
            }
        }
        self
    }

    pub fn add_service(&mut self, service: Service) -> Result<(), ProjectError> {
        if self.services.iter().any(|s| s.name() == service.name()) {
            return Err(ProjectError::DuplicateService {
                name: service.name().to_string(),
            });
        }

        self.services.push(service);
        Ok(())
    }

    pub fn services(&self) -> &[Service] {
        &self.services
    }

    pub fn has_preview(&self, feature: PreviewFeature) -> bool {
        self.preview.contains(&feature)
    }

    /// Image name used for database migrations and whether the project
    /// ships a `migrations` directory at all
    pub fn default_migration_image(&self) -> (String, bool) {
        let required = self.directory.join("migrations").is_dir();
        (format!("{}-migrations", self.name), required)
    }
}
