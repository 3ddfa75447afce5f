//! Per-service aggregate of everything a service declares during collection

use super::api::{ApiRegistry, ApiSpec, RegistrationConflict, SecurityDefinition, Worker};
use crate::project::Service;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Cadence {
    /// Fixed rate such as "5 minutes"
    Every(String),
    Cron(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Schedule {
    pub name: String,
    pub cadence: Cadence,
    pub target: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Subscription {
    pub topic: String,
    pub target: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WebsocketEvent {
    Connect,
    Disconnect,
    Message,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WebsocketHandler {
    pub socket: String,
    pub event: WebsocketEvent,
    pub target: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BlobEvent {
    Created,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BucketListener {
    pub bucket: String,
    pub event: BlobEvent,
    pub key_prefix: String,
    pub target: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HttpProxy {
    pub host: String,
    pub target: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SqlDatabase {
    pub name: String,
    pub migrations: Option<String>,
}

/// Everything one service declared in one collection run. Plain data, handed
/// to the deployment layer as-is.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RequirementsSet {
    pub service_name: String,
    pub service_file: PathBuf,
    pub service_type: String,
    pub apis: BTreeMap<String, ApiSpec>,
    pub schedules: Vec<Schedule>,
    pub topics: Vec<String>,
    pub subscriptions: Vec<Subscription>,
    pub websockets: Vec<WebsocketHandler>,
    pub bucket_listeners: Vec<BucketListener>,
    pub http_proxies: Vec<HttpProxy>,
    pub buckets: Vec<String>,
    pub queues: Vec<String>,
    pub key_value_stores: Vec<String>,
    pub sql_databases: Vec<SqlDatabase>,
    pub secrets: Vec<String>,
    /// Rejected route registrations; never fatal
    pub conflicts: Vec<RegistrationConflict>,
}

impl RequirementsSet {
    pub fn has_databases(&self) -> bool {
        !self.sql_databases.is_empty()
    }

    /// True when the service made no declarations at all
    pub fn is_empty(&self) -> bool {
        self.apis.is_empty()
            && self.schedules.is_empty()
            && self.topics.is_empty()
            && self.subscriptions.is_empty()
            && self.websockets.is_empty()
            && self.bucket_listeners.is_empty()
            && self.http_proxies.is_empty()
            && self.buckets.is_empty()
            && self.queues.is_empty()
            && self.key_value_stores.is_empty()
            && self.sql_databases.is_empty()
            && self.secrets.is_empty()
    }
}

#[derive(Debug, Default)]
struct Declarations {
    schedules: Vec<Schedule>,
    topics: Vec<String>,
    subscriptions: Vec<Subscription>,
    websockets: Vec<WebsocketHandler>,
    bucket_listeners: Vec<BucketListener>,
    http_proxies: Vec<HttpProxy>,
    buckets: Vec<String>,
    queues: Vec<String>,
    key_value_stores: Vec<String>,
    sql_databases: Vec<SqlDatabase>,
    secrets: Vec<String>,
    conflicts: Vec<RegistrationConflict>,
}

/// Thread-safe collector for a single service. One instance per collection
/// session; never shared across services.
#[derive(Debug)]
pub struct RequirementsCollector {
    service_name: String,
    service_file: PathBuf,
    service_type: String,
    apis: Mutex<BTreeMap<String, Arc<ApiRegistry>>>,
    declarations: Mutex<Declarations>,
}

impl RequirementsCollector {
    pub fn new(service: &Service) -> Self {
        Self {
            service_name: service.name().to_string(),
            service_file: service.file_path().to_path_buf(),
            service_type: service.service_type().to_string(),
            apis: Mutex::new(BTreeMap::new()),
            declarations: Mutex::new(Declarations::default()),
        }
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Registry for `name`, created on first reference
    pub fn api(&self, name: &str) -> Arc<ApiRegistry> {
        let mut apis = self.apis.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            apis.entry(name.to_string())
                .or_insert_with(|| Arc::new(ApiRegistry::new(&self.service_name, name))),
        )
    }

    fn declare<F>(&self, append: F)
    where
        F: FnOnce(&mut Declarations),
    {
        let mut declarations = self
            .declarations
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        append(&mut declarations);
    }

    /// Adds a route to `api`. An overlapping route is dropped and recorded as
    /// a conflict against this service; the call itself never fails.
    pub fn add_worker(&self, api: &str, path: String, methods: Vec<String>) {
        let worker = Worker {
            path,
            methods,
            target: self.service_name.clone(),
        };

        debug!(service = %self.service_name, api, worker = %worker, "Registering api worker");

        if let Err(conflict) = self.api(api).add_worker(worker) {
            warn!(service = %self.service_name, api, "{}", conflict);
            self.declare(|d| d.conflicts.push(conflict));
        }
    }

    pub fn add_security_definition(&self, api: &str, name: String, definition: SecurityDefinition) {
        self.api(api).add_security_definition(name, definition);
    }

    pub fn add_security(&self, api: &str, name: String, scopes: Option<Vec<String>>) {
        self.api(api).add_security(name, scopes);
    }

    pub fn add_schedule(&self, name: String, cadence: Cadence) {
        let schedule = Schedule {
            name,
            cadence,
            target: self.service_name.clone(),
        };
        self.declare(|d| d.schedules.push(schedule));
    }

    pub fn add_subscription(&self, topic: String) {
        let subscription = Subscription {
            topic,
            target: self.service_name.clone(),
        };
        self.declare(|d| d.subscriptions.push(subscription));
    }

    pub fn add_websocket_handler(&self, socket: String, event: WebsocketEvent) {
        let handler = WebsocketHandler {
            socket,
            event,
            target: self.service_name.clone(),
        };
        self.declare(|d| d.websockets.push(handler));
    }

    pub fn add_bucket_listener(&self, bucket: String, event: BlobEvent, key_prefix: String) {
        let listener = BucketListener {
            bucket,
            event,
            key_prefix,
            target: self.service_name.clone(),
        };
        self.declare(|d| d.bucket_listeners.push(listener));
    }

    pub fn add_http_proxy(&self, host: String) {
        let proxy = HttpProxy {
            host,
            target: self.service_name.clone(),
        };
        self.declare(|d| d.http_proxies.push(proxy));
    }

    pub fn declare_topic(&self, name: String) {
        self.declare(|d| d.topics.push(name));
    }

    pub fn declare_bucket(&self, name: String) {
        self.declare(|d| d.buckets.push(name));
    }

    pub fn declare_queue(&self, name: String) {
        self.declare(|d| d.queues.push(name));
    }

    pub fn declare_key_value_store(&self, name: String) {
        self.declare(|d| d.key_value_stores.push(name));
    }

    pub fn declare_secret(&self, name: String) {
        self.declare(|d| d.secrets.push(name));
    }

    pub fn declare_sql_database(&self, name: String, migrations: Option<String>) {
        self.declare(|d| d.sql_databases.push(SqlDatabase { name, migrations }));
    }

    pub fn has_databases(&self) -> bool {
        !self
            .declarations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .sql_databases
            .is_empty()
    }

    /// Copies the current state into a plain `RequirementsSet`
    pub fn snapshot(&self) -> RequirementsSet {
        let apis = self
            .apis
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(name, registry)| (name.clone(), registry.spec()))
            .collect();

        let d = self
            .declarations
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        RequirementsSet {
            service_name: self.service_name.clone(),
            service_file: self.service_file.clone(),
            service_type: self.service_type.clone(),
            apis,
            schedules: d.schedules.clone(),
            topics: d.topics.clone(),
            subscriptions: d.subscriptions.clone(),
            websockets: d.websockets.clone(),
            bucket_listeners: d.bucket_listeners.clone(),
            http_proxies: d.http_proxies.clone(),
            buckets: d.buckets.clone(),
            queues: d.queues.clone(),
            key_value_stores: d.key_value_stores.clone(),
            sql_databases: d.sql_databases.clone(),
            secrets: d.secrets.clone(),
            conflicts: d.conflicts.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::project::BuildContext;

    fn collector() -> RequirementsCollector {
        let service = Service::new(
            "shop_orders",
            "services/orders.ts",
            BuildContext::new(".", "Dockerfile"),
        );
        RequirementsCollector::new(&service)
    }

    #[test]
    fn test_fresh_collector_is_empty() {
        let requirements = collector().snapshot();

        assert!(requirements.is_empty());
        assert!(!requirements.has_databases());
        assert_eq!(requirements.service_name, "shop_orders");
        assert_eq!(requirements.service_file, PathBuf::from("services/orders.ts"));
        assert_eq!(requirements.service_type, "default");
    }

    #[test]
    fn test_api_created_lazily_and_reused() {
        let collector = collector();
        let first = collector.api("public");
        let second = collector.api("public");

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(collector.snapshot().apis.len(), 1);
    }

    #[test]
    fn test_conflicting_worker_recorded_not_added() {
        let collector = collector();
        collector.add_worker("public", "/orders/{id}".into(), vec!["GET".into()]);
        collector.add_worker("public", "/orders/:orderId".into(), vec!["GET".into()]);
        // Same path on another API is unrelated
        collector.add_worker("admin", "/orders/{id}".into(), vec!["GET".into()]);

        let requirements = collector.snapshot();
        assert_eq!(requirements.apis["public"].workers.len(), 1);
        assert_eq!(requirements.apis["admin"].workers.len(), 1);
        assert_eq!(requirements.conflicts.len(), 1);
        assert_eq!(requirements.conflicts[0].service, "shop_orders");
        assert_eq!(requirements.conflicts[0].rejected.path, "/orders/:orderId");
    }

    #[test]
    fn test_worker_target_is_owning_service() {
        let collector = collector();
        collector.add_worker("public", "/orders".into(), vec!["POST".into()]);

        let requirements = collector.snapshot();
        assert_eq!(requirements.apis["public"].workers[0].target, "shop_orders");
    }

    #[test]
    fn test_duplicate_declarations_are_kept() {
        let collector = collector();
        collector.declare_bucket("images".into());
        collector.declare_bucket("images".into());
        collector.add_schedule("nightly".into(), Cadence::Cron("0 0 * * *".into()));
        collector.add_schedule("nightly".into(), Cadence::Every("1 day".into()));

        let requirements = collector.snapshot();
        assert_eq!(requirements.buckets, vec!["images", "images"]);
        assert_eq!(requirements.schedules.len(), 2);
    }

    #[test]
    fn test_every_resource_kind_recorded() {
        let collector = collector();
        collector.add_schedule("tick".into(), Cadence::Every("5 minutes".into()));
        collector.declare_topic("events".into());
        collector.add_subscription("events".into());
        collector.add_websocket_handler("chat".into(), WebsocketEvent::Message);
        collector.add_bucket_listener("images".into(), BlobEvent::Created, "thumbs/".into());
        collector.add_http_proxy("localhost:3000".into());
        collector.declare_bucket("images".into());
        collector.declare_queue("jobs".into());
        collector.declare_key_value_store("cache".into());
        collector.declare_secret("api-key".into());
        collector.declare_sql_database("orders".into(), Some("file://migrations/orders".into()));

        assert!(collector.has_databases());

        let requirements = collector.snapshot();
        assert!(!requirements.is_empty());
        assert_eq!(requirements.schedules[0].target, "shop_orders");
        assert_eq!(requirements.topics, vec!["events"]);
        assert_eq!(requirements.subscriptions[0].topic, "events");
        assert_eq!(requirements.websockets[0].event, WebsocketEvent::Message);
        assert_eq!(requirements.bucket_listeners[0].key_prefix, "thumbs/");
        assert_eq!(requirements.http_proxies[0].host, "localhost:3000");
        assert_eq!(requirements.queues, vec!["jobs"]);
        assert_eq!(requirements.key_value_stores, vec!["cache"]);
        assert_eq!(requirements.secrets, vec!["api-key"]);
        assert_eq!(
            requirements.sql_databases[0].migrations.as_deref(),
            Some("file://migrations/orders")
        );
    }

    #[test]
    fn test_snapshot_serializes_to_json() {
        let collector = collector();
        collector.add_worker("public", "/orders".into(), vec!["GET".into()]);
        collector.add_security("public", "oidc".into(), None);

        let json = serde_json::to_value(collector.snapshot()).unwrap();
        assert_eq!(json["apis"]["public"]["workers"][0]["path"], "/orders");
        assert_eq!(json["apis"]["public"]["security"]["oidc"], serde_json::json!([]));
    }
}
