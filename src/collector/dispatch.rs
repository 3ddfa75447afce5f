//! gRPC front of a session's collector
//!
//! Each resource kind is its own narrow protocol service. A single
//! `Dispatcher` value implements all of them on top of one
//! `RequirementsCollector`, so every call a service makes during its session
//! lands in that session's collector and nowhere else.

use super::api::SecurityDefinition;
use super::requirements::{BlobEvent, Cadence, RequirementsCollector, WebsocketEvent};
use crate::proto::{
    self, api_security_definition, resource_declare_request, schedule_registration,
    ApiSecurityDefinitionRegistration, ApiSecurityRegistration, ApiWorkerRegistration,
    BlobEventRegistration, BlobEventType, HttpProxyRegistration, RegistrationResponse,
    ResourceDeclareRequest, ScheduleRegistration, SubscriptionRegistration,
    WebsocketEventType, WebsocketHandlerRegistration,
};
use std::sync::Arc;
use tonic::{Request, Response, Status};
use tracing::debug;

type RegistrationResult = Result<Response<RegistrationResponse>, Status>;

fn registered() -> RegistrationResult {
    Ok(Response::new(RegistrationResponse {}))
}

fn require_name(field: &str, value: &str) -> Result<(), Status> {
    if value.trim().is_empty() {
        return Err(Status::invalid_argument(format!("{} must not be empty", field)));
    }
    Ok(())
}

fn security_definition(
    definition: Option<proto::ApiSecurityDefinition>,
) -> Result<SecurityDefinition, Status> {
    match definition.and_then(|d| d.definition) {
        Some(api_security_definition::Definition::Oidc(oidc)) => Ok(SecurityDefinition::Oidc {
            issuer: oidc.issuer,
            audiences: oidc.audiences,
        }),
        None => Err(Status::invalid_argument(
            "security definition must specify a scheme",
        )),
    }
}

/// Per-session protocol dispatcher
#[derive(Debug, Clone)]
pub struct Dispatcher {
    collector: Arc<RequirementsCollector>,
}

impl Dispatcher {
    pub fn new(collector: Arc<RequirementsCollector>) -> Self {
        Self { collector }
    }

    pub fn collector(&self) -> &Arc<RequirementsCollector> {
        &self.collector
    }
}

#[tonic::async_trait]
impl proto::Resources for Dispatcher {
    async fn declare(&self, request: Request<ResourceDeclareRequest>) -> RegistrationResult {
        let req = request.into_inner();
        require_name("resource name", &req.name)?;

        debug!(service = %self.collector.service_name(), resource = %req.name, "Resources.Declare");

        use resource_declare_request::Config;
        match req.config {
            Some(Config::Bucket(_)) => self.collector.declare_bucket(req.name),
            Some(Config::Topic(_)) => self.collector.declare_topic(req.name),
            Some(Config::Queue(_)) => self.collector.declare_queue(req.name),
            Some(Config::KeyValueStore(_)) => self.collector.declare_key_value_store(req.name),
            Some(Config::Secret(_)) => self.collector.declare_secret(req.name),
            Some(Config::SqlDatabase(sql)) => {
                let migrations = (!sql.migrations.is_empty()).then_some(sql.migrations);
                self.collector.declare_sql_database(req.name, migrations);
            }
            Some(Config::Api(api)) => {
                // Validate everything before recording anything
                let definitions = api
                    .security_definitions
                    .into_iter()
                    .map(|(name, def)| security_definition(Some(def)).map(|d| (name, d)))
                    .collect::<Result<Vec<_>, Status>>()?;

                let registry = self.collector.api(&req.name);
                for (name, definition) in definitions {
                    registry.add_security_definition(name, definition);
                }
                for (name, scopes) in api.security {
                    registry.add_security(name, Some(scopes.scopes));
                }
            }
            None => {
                return Err(Status::invalid_argument(format!(
                    "resource {} has no configuration",
                    req.name
                )))
            }
        }

        registered()
    }
}

#[tonic::async_trait]
impl proto::Apis for Dispatcher {
    async fn register_worker(&self, request: Request<ApiWorkerRegistration>) -> RegistrationResult {
        let req = request.into_inner();
        require_name("api", &req.api)?;

        if req.methods.is_empty() {
            return Err(Status::invalid_argument(format!(
                "worker {} on api {} declares no methods",
                req.path, req.api
            )));
        }

        self.collector.add_worker(&req.api, req.path, req.methods);
        registered()
    }

    async fn register_security_definition(
        &self,
        request: Request<ApiSecurityDefinitionRegistration>,
    ) -> RegistrationResult {
        let req = request.into_inner();
        require_name("api", &req.api)?;
        require_name("security definition name", &req.name)?;

        let definition = security_definition(req.definition)?;
        self.collector
            .add_security_definition(&req.api, req.name, definition);
        registered()
    }

    async fn register_security(&self, request: Request<ApiSecurityRegistration>) -> RegistrationResult {
        let req = request.into_inner();
        require_name("api", &req.api)?;
        require_name("security name", &req.name)?;

        self.collector
            .add_security(&req.api, req.name, req.scopes.map(|s| s.scopes));
        registered()
    }
}

#[tonic::async_trait]
impl proto::Schedules for Dispatcher {
    async fn register_schedule(&self, request: Request<ScheduleRegistration>) -> RegistrationResult {
        let req = request.into_inner();
        require_name("schedule name", &req.schedule_name)?;

        let cadence = match req.cadence {
            Some(schedule_registration::Cadence::Every(every)) => Cadence::Every(every.rate),
            Some(schedule_registration::Cadence::Cron(cron)) => Cadence::Cron(cron.expression),
            None => {
                return Err(Status::invalid_argument(format!(
                    "schedule {} has no cadence",
                    req.schedule_name
                )))
            }
        };

        self.collector.add_schedule(req.schedule_name, cadence);
        registered()
    }
}

#[tonic::async_trait]
impl proto::Subscriptions for Dispatcher {
    async fn register_subscription(
        &self,
        request: Request<SubscriptionRegistration>,
    ) -> RegistrationResult {
        let req = request.into_inner();
        require_name("topic name", &req.topic_name)?;

        self.collector.add_subscription(req.topic_name);
        registered()
    }
}

#[tonic::async_trait]
impl proto::Websockets for Dispatcher {
    async fn register_handler(
        &self,
        request: Request<WebsocketHandlerRegistration>,
    ) -> RegistrationResult {
        let req = request.into_inner();
        require_name("socket name", &req.socket_name)?;

        let event = match WebsocketEventType::try_from(req.event_type) {
            Ok(WebsocketEventType::Connect) => WebsocketEvent::Connect,
            Ok(WebsocketEventType::Disconnect) => WebsocketEvent::Disconnect,
            Ok(WebsocketEventType::Message) => WebsocketEvent::Message,
            Err(_) => {
                return Err(Status::invalid_argument(format!(
                    "unknown websocket event type {}",
                    req.event_type
                )))
            }
        };

        self.collector.add_websocket_handler(req.socket_name, event);
        registered()
    }
}

#[tonic::async_trait]
impl proto::StorageListeners for Dispatcher {
    async fn register_listener(&self, request: Request<BlobEventRegistration>) -> RegistrationResult {
        let req = request.into_inner();
        require_name("bucket name", &req.bucket_name)?;

        let event = match BlobEventType::try_from(req.blob_event_type) {
            Ok(BlobEventType::Created) => BlobEvent::Created,
            Ok(BlobEventType::Deleted) => BlobEvent::Deleted,
            Err(_) => {
                return Err(Status::invalid_argument(format!(
                    "unknown blob event type {}",
                    req.blob_event_type
                )))
            }
        };

        self.collector
            .add_bucket_listener(req.bucket_name, event, req.key_prefix_filter);
        registered()
    }
}

#[tonic::async_trait]
impl proto::HttpProxies for Dispatcher {
    async fn register_proxy(&self, request: Request<HttpProxyRegistration>) -> RegistrationResult {
        let req = request.into_inner();
        require_name("host", &req.host)?;

        self.collector.add_http_proxy(req.host);
        registered()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::project::{BuildContext, Service};
    use crate::proto::{Apis, Resources, Schedules, Websockets};
    use std::collections::HashMap;

    fn dispatcher() -> Dispatcher {
        let service = Service::new("svc", "svc.ts", BuildContext::new(".", "Dockerfile"));
        Dispatcher::new(Arc::new(RequirementsCollector::new(&service)))
    }

    #[tokio::test]
    async fn test_declare_without_config_rejected() {
        let dispatcher = dispatcher();
        let status = dispatcher
            .declare(Request::new(ResourceDeclareRequest {
                name: "images".to_string(),
                config: None,
            }))
            .await
            .unwrap_err();

        assert_eq!(status.code(), tonic::Code::InvalidArgument);
        assert!(dispatcher.collector().snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_declare_empty_name_rejected() {
        let dispatcher = dispatcher();
        let status = dispatcher
            .declare(Request::new(ResourceDeclareRequest {
                name: "  ".to_string(),
                config: Some(resource_declare_request::Config::Bucket(
                    proto::BucketResource {},
                )),
            }))
            .await
            .unwrap_err();

        assert_eq!(status.code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn test_declare_sql_database_without_migrations() {
        let dispatcher = dispatcher();
        dispatcher
            .declare(Request::new(ResourceDeclareRequest {
                name: "orders".to_string(),
                config: Some(resource_declare_request::Config::SqlDatabase(
                    proto::SqlDatabaseResource {
                        migrations: String::new(),
                    },
                )),
            }))
            .await
            .unwrap();

        let requirements = dispatcher.collector().snapshot();
        assert_eq!(requirements.sql_databases[0].name, "orders");
        assert!(requirements.sql_databases[0].migrations.is_none());
    }

    #[tokio::test]
    async fn test_declare_api_records_security() {
        let dispatcher = dispatcher();
        dispatcher
            .declare(Request::new(ResourceDeclareRequest {
                name: "public".to_string(),
                config: Some(resource_declare_request::Config::Api(proto::ApiResource {
                    security_definitions: HashMap::from([(
                        "user".to_string(),
                        proto::ApiSecurityDefinition {
                            definition: Some(api_security_definition::Definition::Oidc(
                                proto::ApiOpenIdConnectDefinition {
                                    issuer: "https://issuer".to_string(),
                                    audiences: vec!["shop".to_string()],
                                },
                            )),
                        },
                    )]),
                    security: HashMap::from([(
                        "user".to_string(),
                        proto::ApiScopes {
                            scopes: vec!["orders:read".to_string()],
                        },
                    )]),
                })),
            }))
            .await
            .unwrap();

        let api = &dispatcher.collector().snapshot().apis["public"];
        assert!(api.workers.is_empty());
        assert_eq!(api.security["user"], vec!["orders:read".to_string()]);
        assert!(api.security_definitions.contains_key("user"));
    }

    #[tokio::test]
    async fn test_register_security_without_scopes_is_empty() {
        let dispatcher = dispatcher();
        dispatcher
            .register_security(Request::new(ApiSecurityRegistration {
                api: "public".to_string(),
                name: "user".to_string(),
                scopes: None,
            }))
            .await
            .unwrap();

        let api = &dispatcher.collector().snapshot().apis["public"];
        assert_eq!(api.security.get("user"), Some(&Vec::new()));
    }

    #[tokio::test]
    async fn test_register_worker_without_methods_rejected() {
        let dispatcher = dispatcher();
        let status = dispatcher
            .register_worker(Request::new(ApiWorkerRegistration {
                api: "public".to_string(),
                path: "/orders".to_string(),
                methods: vec![],
            }))
            .await
            .unwrap_err();

        assert_eq!(status.code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn test_register_duplicate_worker_still_succeeds() {
        let dispatcher = dispatcher();
        for _ in 0..2 {
            dispatcher
                .register_worker(Request::new(ApiWorkerRegistration {
                    api: "public".to_string(),
                    path: "/orders/{id}".to_string(),
                    methods: vec!["GET".to_string()],
                }))
                .await
                .unwrap();
        }

        let requirements = dispatcher.collector().snapshot();
        assert_eq!(requirements.apis["public"].workers.len(), 1);
        assert_eq!(requirements.conflicts.len(), 1);
    }

    #[tokio::test]
    async fn test_schedule_without_cadence_rejected() {
        let dispatcher = dispatcher();
        let status = dispatcher
            .register_schedule(Request::new(ScheduleRegistration {
                schedule_name: "nightly".to_string(),
                cadence: None,
            }))
            .await
            .unwrap_err();

        assert_eq!(status.code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn test_unknown_websocket_event_rejected() {
        let dispatcher = dispatcher();
        let status = dispatcher
            .register_handler(Request::new(WebsocketHandlerRegistration {
                socket_name: "chat".to_string(),
                event_type: 42,
            }))
            .await
            .unwrap_err();

        assert_eq!(status.code(), tonic::Code::InvalidArgument);
        assert!(dispatcher.collector().snapshot().websockets.is_empty());
    }
}
