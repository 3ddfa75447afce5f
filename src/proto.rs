//! Generated types for the collection protocol (`codeconfig.v1`)

#![allow(clippy::all)]

tonic::include_proto!("codeconfig.v1");

pub use apis_client::ApisClient;
pub use apis_server::{Apis, ApisServer};
pub use http_proxies_client::HttpProxiesClient;
pub use http_proxies_server::{HttpProxies, HttpProxiesServer};
pub use resources_client::ResourcesClient;
pub use resources_server::{Resources, ResourcesServer};
pub use schedules_client::SchedulesClient;
pub use schedules_server::{Schedules, SchedulesServer};
pub use storage_listeners_client::StorageListenersClient;
pub use storage_listeners_server::{StorageListeners, StorageListenersServer};
pub use subscriptions_client::SubscriptionsClient;
pub use subscriptions_server::{Subscriptions, SubscriptionsServer};
pub use websockets_client::WebsocketsClient;
pub use websockets_server::{Websockets, WebsocketsServer};
