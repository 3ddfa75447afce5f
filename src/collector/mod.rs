//! Requirement collection: the registration surface a service calls while
//! running in collection mode, and the server that exposes it.

pub mod api;
pub mod dispatch;
pub mod requirements;
pub mod server;

pub use api::{normalize_path, ApiRegistry, ApiSpec, RegistrationConflict, SecurityDefinition, Worker};
pub use dispatch::Dispatcher;
pub use requirements::{
    BlobEvent, BucketListener, Cadence, HttpProxy, RequirementsCollector, RequirementsSet,
    Schedule, SqlDatabase, Subscription, WebsocketEvent, WebsocketHandler,
};
pub use server::CollectionServer;
