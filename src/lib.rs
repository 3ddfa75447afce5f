//! codeconfig - runtime discovery of per-service cloud resource requirements
//!
//! Instead of statically analysing service code, codeconfig runs each
//! service in *collection* mode. The service registers the resources it
//! needs (APIs, schedules, topics, buckets, queues, databases, ...) with a
//! private gRPC control plane stood up for that one run, and the recorded
//! registrations become the service's [`RequirementsSet`].
//!
//! # Core Concepts
//!
//! - **Collection session**: one ephemeral server, one launched service, one
//!   requirement set. The server never outlives the session.
//! - **Api registry**: per-service, per-api route table that drops routes
//!   overlapping an existing one and records the conflict.
//! - **Coordinator**: collects every service of a project concurrently and
//!   either returns all results or an error naming every failed service.
//! - **Build orchestrator**: builds service images with bounded parallelism
//!   and streams progress.
//!
//! # Example Usage
//!
//! ```no_run
//! use codeconfig::{
//!     BuildContext, CollectionCoordinator, CollectorConfig, CommandRunner, Project, Service,
//! };
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut project = Project::new("shop", ".");
//! project.add_service(
//!     Service::new("shop_orders", "orders.py", BuildContext::new(".", "Dockerfile"))
//!         .with_start_cmd("python orders.py"),
//! )?;
//!
//! let config = CollectorConfig::default();
//! let coordinator = CollectionCoordinator::new(
//!     Arc::new(CommandRunner::new()),
//!     config.session_options(project.preview.clone()),
//! );
//!
//! for (service, requirements) in coordinator.collect(&project).await? {
//!     println!("{}: {} apis", service, requirements.apis.len());
//! }
//! # Ok(())
//! # }
//! ```

pub mod build;
pub mod cli;
pub mod collector;
pub mod config;
pub mod coordinator;
pub mod project;
pub mod proto;
pub mod runner;
pub mod session;
pub mod util;

pub use build::{BuildError, BuildOrchestrator, BuildStatus, BuildUpdate, ImageBuilder};
pub use collector::{ApiRegistry, RegistrationConflict, RequirementsCollector, RequirementsSet};
pub use config::{CollectorConfig, ConfigError};
pub use coordinator::{AggregateError, CollectionCoordinator, ServiceFailure};
pub use project::{BuildContext, PreviewFeature, Project, ProjectError, Service};
pub use runner::{CommandRunner, LaunchConfig, ProcessError, ServiceRunner};
pub use session::{CollectionSession, SessionError, SessionOptions, SessionState};
pub use util::{init_logging, LoggingConfig};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
