//! One collection run for one service
//!
//! A session stands up a private collection server, launches the service in
//! collection mode pointed at that server, and turns whatever the service
//! registered into a [`RequirementsSet`].
//!
//! ```text
//! Idle -> Listening -> Running -> Stopped
//! ```
//!
//! The server is stopped on every exit path. [`CollectionSession::collect`]
//! stops it explicitly; dropping a session that still owns a server aborts
//! the server task.

use crate::collector::{CollectionServer, RequirementsCollector, RequirementsSet};
use crate::project::{PreviewFeature, Service};
use crate::runner::{LaunchConfig, ProcessError, RunUpdate, ServiceRunner};
use std::collections::BTreeMap;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Buffered run updates between the launched process and the log writer
const UPDATE_BUFFER: usize = 256;

#[derive(Debug, Error)]
pub enum SessionError {
    /// The service uses a capability the project has not enabled
    #[error(
        "service {service} ({}) requires a database, but the project does not have the '{feature}' \
         preview feature enabled. Add {feature} to the project's preview features to enable it",
        .file.display()
    )]
    Configuration {
        service: String,
        file: PathBuf,
        feature: PreviewFeature,
    },

    #[error("unable to start collection server for service {service}: {source}")]
    Transport {
        service: String,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error("unable to create collection log for service {service}: {source}")]
    LogFile {
        service: String,
        #[source]
        source: io::Error,
    },

    /// A session method was called out of order
    #[error("collection session for {service} is {state:?}, expected {expected:?}")]
    InvalidState {
        service: String,
        state: SessionState,
        expected: SessionState,
    },
}

impl SessionError {
    /// Name of the service the failure belongs to
    pub fn service(&self) -> &str {
        match self {
            SessionError::Configuration { service, .. }
            | SessionError::Transport { service, .. }
            | SessionError::LogFile { service, .. }
            | SessionError::InvalidState { service, .. } => service,
            SessionError::Process(e) => match e {
                ProcessError::MissingStartCommand { service }
                | ProcessError::Spawn { service, .. }
                | ProcessError::Wait { service, .. }
                | ProcessError::Exited { service, .. }
                | ProcessError::Stopped { service } => service,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Listening,
    Running,
    Stopped,
}

/// Settings shared by every session of a collection run
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Host the collection server binds; port is always OS-assigned
    pub bind_host: String,
    /// Directory receiving one log file per service per run
    pub log_dir: PathBuf,
    pub preview: Vec<PreviewFeature>,
    /// Extra environment for launched services
    pub env: BTreeMap<String, String>,
}

impl SessionOptions {
    pub fn new(bind_host: impl Into<String>, log_dir: impl Into<PathBuf>) -> Self {
        Self {
            bind_host: bind_host.into(),
            log_dir: log_dir.into(),
            preview: Vec::new(),
            env: BTreeMap::new(),
        }
    }

    pub fn with_preview(mut self, preview: Vec<PreviewFeature>) -> Self {
        self.preview = preview;
        self
    }

    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }
}

pub struct CollectionSession {
    service: Service,
    options: SessionOptions,
    state: SessionState,
    collector: Arc<RequirementsCollector>,
    server: Option<CollectionServer>,
    log_path: Option<PathBuf>,
}

impl CollectionSession {
    pub fn new(service: Service, options: SessionOptions) -> Self {
        let collector = Arc::new(RequirementsCollector::new(&service));
        Self {
            service,
            options,
            state: SessionState::Idle,
            collector,
            server: None,
            log_path: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn service(&self) -> &Service {
        &self.service
    }

    /// Log file of the most recent run, kept for post-mortem diagnostics
    pub fn log_path(&self) -> Option<&Path> {
        self.log_path.as_deref()
    }

    pub fn address(&self) -> Option<SocketAddr> {
        self.server.as_ref().map(|s| s.address())
    }

    fn expect_state(&self, expected: SessionState) -> Result<(), SessionError> {
        if self.state != expected {
            return Err(SessionError::InvalidState {
                service: self.service.name().to_string(),
                state: self.state,
                expected,
            });
        }
        Ok(())
    }

    /// Binds a fresh collection server for this session
    pub async fn start(&mut self) -> Result<SocketAddr, SessionError> {
        self.expect_state(SessionState::Idle)?;

        let server = CollectionServer::start(&self.options.bind_host, Arc::clone(&self.collector))
            .await
            .map_err(|source| SessionError::Transport {
                service: self.service.name().to_string(),
                source,
            })?;

        let address = server.address();
        self.server = Some(server);
        self.state = SessionState::Listening;

        debug!(service = %self.service.name(), %address, "Collection session listening");
        Ok(address)
    }

    /// Launches the service in collection mode and waits for it to exit
    pub async fn run(
        &mut self,
        runner: &dyn ServiceRunner,
        stop: watch::Receiver<bool>,
    ) -> Result<(), SessionError> {
        self.expect_state(SessionState::Listening)?;
        let address = self.address().ok_or_else(|| SessionError::InvalidState {
            service: self.service.name().to_string(),
            state: self.state,
            expected: SessionState::Listening,
        })?;

        let (log_file, log_path) = self.create_log_file()?;
        self.log_path = Some(log_path);

        let (updates_tx, updates_rx) = mpsc::channel(UPDATE_BUFFER);
        let log_writer = spawn_log_writer(log_file, updates_rx);

        let launch = LaunchConfig::collection(address).with_env(self.options.env.clone());
        self.state = SessionState::Running;

        let result = runner.run(&self.service, &launch, updates_tx, stop).await;

        // The runner dropped its sender; wait for the writer to flush
        if let Err(e) = log_writer.await {
            warn!(service = %self.service.name(), "Collection log writer failed: {}", e);
        }

        result.map_err(SessionError::from)
    }

    /// Precondition checks on what the service declared
    pub fn finish(&self) -> Result<RequirementsSet, SessionError> {
        let requirements = self.collector.snapshot();

        if requirements.has_databases()
            && !self.options.preview.contains(&PreviewFeature::SqlDatabases)
        {
            return Err(SessionError::Configuration {
                service: self.service.name().to_string(),
                file: self.service.file_path().to_path_buf(),
                feature: PreviewFeature::SqlDatabases,
            });
        }

        if !requirements.conflicts.is_empty() {
            warn!(
                service = %self.service.name(),
                conflicts = requirements.conflicts.len(),
                "Overlapping api workers were dropped"
            );
        }

        Ok(requirements)
    }

    /// Stops the server. Safe to call in any state.
    pub async fn stop(&mut self) {
        if let Some(server) = self.server.take() {
            server.stop().await;
        }
        self.state = SessionState::Stopped;
    }

    /// Full session: start, run, check, and always stop
    pub async fn collect(
        mut self,
        runner: &dyn ServiceRunner,
        stop: watch::Receiver<bool>,
    ) -> Result<RequirementsSet, SessionError> {
        let result = self.collect_inner(runner, stop).await;
        self.stop().await;

        match &result {
            Ok(requirements) => info!(
                service = %self.service.name(),
                empty = requirements.is_empty(),
                "Collected service requirements"
            ),
            Err(e) => warn!(service = %self.service.name(), "Collection failed: {}", e),
        }

        result
    }

    async fn collect_inner(
        &mut self,
        runner: &dyn ServiceRunner,
        stop: watch::Receiver<bool>,
    ) -> Result<RequirementsSet, SessionError> {
        self.start().await?;
        self.run(runner, stop).await?;
        self.finish()
    }

    fn create_log_file(&self) -> Result<(std::fs::File, PathBuf), SessionError> {
        let log_error = |source: io::Error| SessionError::LogFile {
            service: self.service.name().to_string(),
            source,
        };

        std::fs::create_dir_all(&self.options.log_dir).map_err(log_error)?;

        let file = tempfile::Builder::new()
            .prefix(&format!("{}-", self.service.name()))
            .suffix(".log")
            .tempfile_in(&self.options.log_dir)
            .map_err(log_error)?;

        file.keep().map_err(|e| log_error(e.error))
    }
}

/// Appends every update to the session log until the channel closes
fn spawn_log_writer(file: std::fs::File, mut updates: mpsc::Receiver<RunUpdate>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut file = tokio::fs::File::from_std(file);
        let mut failed = false;

        while let Some(update) = updates.recv().await {
            // Keep draining after a write failure so the service never blocks
            if failed {
                continue;
            }

            let mut entry = update.message;
            entry.push('\n');
            if let Some(error) = update.error {
                entry.push_str(&error);
                entry.push('\n');
            }

            if let Err(e) = file.write_all(entry.as_bytes()).await {
                warn!(service = %update.service_name, "Unable to write collection log: {}", e);
                failed = true;
            }
        }

        if let Err(e) = file.flush().await {
            warn!("Unable to flush collection log: {}", e);
        }
    })
}
