//! Ephemeral per-session gRPC server

use super::dispatch::Dispatcher;
use super::requirements::RequirementsCollector;
use crate::proto::{
    ApisServer, HttpProxiesServer, ResourcesServer, SchedulesServer, StorageListenersServer,
    SubscriptionsServer, WebsocketsServer,
};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;
use tracing::{debug, error, warn};

/// Upper bound on waiting for open connections to drain during `stop`
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// A running collection server bound to an OS-assigned port.
///
/// The server task never outlives this value: `stop` shuts it down
/// gracefully, and dropping an unstopped server aborts the task.
pub struct CollectionServer {
    address: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl CollectionServer {
    /// Binds `host:0` and starts serving every registration service for
    /// `collector` in the background.
    pub async fn start(host: &str, collector: Arc<RequirementsCollector>) -> io::Result<Self> {
        let listener = TcpListener::bind((host, 0)).await?;
        let address = listener.local_addr()?;
        let service_name = collector.service_name().to_string();

        let dispatcher = Dispatcher::new(collector);
        let (_health_reporter, health_service) = tonic_health::server::health_reporter();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        debug!(service = %service_name, %address, "Starting collection server");

        let server = Server::builder()
            .trace_fn(|_| tracing::debug_span!("collection-server"))
            .add_service(health_service)
            .add_service(ResourcesServer::new(dispatcher.clone()))
            .add_service(ApisServer::new(dispatcher.clone()))
            .add_service(SchedulesServer::new(dispatcher.clone()))
            .add_service(SubscriptionsServer::new(dispatcher.clone()))
            .add_service(WebsocketsServer::new(dispatcher.clone()))
            .add_service(StorageListenersServer::new(dispatcher.clone()))
            .add_service(HttpProxiesServer::new(dispatcher))
            .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async {
                let _ = shutdown_rx.await;
            });

        let handle = tokio::spawn(async move {
            match server.await {
                Ok(()) => debug!(service = %service_name, "Collection server stopped"),
                Err(e) => error!(
                    service = %service_name,
                    "Unable to run local collection server: {}", e
                ),
            }
        });

        Ok(Self {
            address,
            shutdown: Some(shutdown_tx),
            handle: Some(handle),
        })
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Signals shutdown and waits for the server task, aborting it if open
    /// connections do not drain in time.
    pub async fn stop(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }

        if let Some(mut handle) = self.handle.take() {
            match tokio::time::timeout(SHUTDOWN_GRACE, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(address = %self.address, "Collection server task failed: {}", e),
                Err(_) => {
                    warn!(address = %self.address, "Collection server did not drain, aborting");
                    handle.abort();
                }
            }
        }
    }
}

impl Drop for CollectionServer {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::project::{BuildContext, Service};
    use crate::proto::{ApiWorkerRegistration, ApisClient};

    fn collector() -> Arc<RequirementsCollector> {
        let service = Service::new("svc", "svc.ts", BuildContext::new(".", "Dockerfile"));
        Arc::new(RequirementsCollector::new(&service))
    }

    #[tokio::test]
    async fn test_server_binds_ephemeral_port() {
        let first = CollectionServer::start("127.0.0.1", collector()).await.unwrap();
        let second = CollectionServer::start("127.0.0.1", collector()).await.unwrap();

        assert_ne!(first.address().port(), 0);
        assert_ne!(first.address(), second.address());

        first.stop().await;
        second.stop().await;
    }

    #[tokio::test]
    async fn test_registration_reaches_collector() {
        let collector = collector();
        let server = CollectionServer::start("127.0.0.1", Arc::clone(&collector))
            .await
            .unwrap();

        let mut client = ApisClient::connect(format!("http://{}", server.address()))
            .await
            .unwrap();
        client
            .register_worker(ApiWorkerRegistration {
                api: "public".to_string(),
                path: "/orders".to_string(),
                methods: vec!["GET".to_string()],
            })
            .await
            .unwrap();
        drop(client);

        server.stop().await;

        assert_eq!(collector.snapshot().apis["public"].workers.len(), 1);
    }

    #[tokio::test]
    async fn test_stopped_server_refuses_connections() {
        let server = CollectionServer::start("127.0.0.1", collector()).await.unwrap();
        let address = server.address();
        server.stop().await;

        assert!(tokio::net::TcpStream::connect(address).await.is_err());
    }

    #[tokio::test]
    async fn test_bind_failure_is_reported() {
        let result = CollectionServer::start("256.0.0.1", collector()).await;
        assert!(result.is_err());
    }
}
