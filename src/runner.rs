//! Launching a service-under-collection
//!
//! How a service process is started is owned by a [`ServiceRunner`]. The
//! session only decides what the process is told: the control-plane address
//! and the execution mode, handed over as environment variables.

use crate::project::Service;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

/// How long output already written by an exited service may take to arrive
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Control-plane address (`host:port`) the service must register against
pub const ADDRESS_ENV: &str = "SERVICE_ADDRESS";

/// Execution mode, see [`ExecutionMode`]
pub const MODE_ENV: &str = "SERVICE_ENVIRONMENT";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Declare resources and exit
    Collection,
    /// Serve traffic locally
    Run,
}

impl ExecutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionMode::Collection => "collection",
            ExecutionMode::Run => "run",
        }
    }
}

/// What a launched service is told about its environment
#[derive(Debug, Clone)]
pub struct LaunchConfig {
    pub address: String,
    pub mode: ExecutionMode,
    /// Caller supplied variables; never override address or mode
    pub env: BTreeMap<String, String>,
}

impl LaunchConfig {
    pub fn collection(address: SocketAddr) -> Self {
        Self {
            address: address.to_string(),
            mode: ExecutionMode::Collection,
            env: BTreeMap::new(),
        }
    }

    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env.extend(env);
        self
    }

    /// Full environment for the launched process
    pub fn environment(&self) -> BTreeMap<String, String> {
        let mut env = self.env.clone();
        // Python buffers stdout when not attached to a tty
        env.entry("PYTHONUNBUFFERED".to_string())
            .or_insert_with(|| "TRUE".to_string());
        env.insert(ADDRESS_ENV.to_string(), self.address.clone());
        env.insert(MODE_ENV.to_string(), self.mode.as_str().to_string());
        env
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Starting,
    Running,
    Done,
    Error,
}

/// One line of progress from a launched service
#[derive(Debug, Clone)]
pub struct RunUpdate {
    pub service_name: String,
    pub status: RunStatus,
    pub message: String,
    pub error: Option<String>,
}

impl RunUpdate {
    pub fn new(service_name: &str, status: RunStatus, message: impl Into<String>) -> Self {
        Self {
            service_name: service_name.to_string(),
            status,
            message: message.into(),
            error: None,
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("service {service} has no start command")]
    MissingStartCommand { service: String },

    #[error("unable to launch service {service}: {source}")]
    Spawn {
        service: String,
        #[source]
        source: std::io::Error,
    },

    #[error("unable to wait for service {service}: {source}")]
    Wait {
        service: String,
        #[source]
        source: std::io::Error,
    },

    #[error("service {service} exited with {status}")]
    Exited { service: String, status: String },

    #[error("service {service} was stopped before it finished")]
    Stopped { service: String },
}

/// Launches a service and waits for it to finish
#[async_trait]
pub trait ServiceRunner: Send + Sync {
    /// Runs `service` to completion. Output goes to `updates`; a `true` on
    /// `stop` asks the runner to terminate the service.
    async fn run(
        &self,
        service: &Service,
        launch: &LaunchConfig,
        updates: mpsc::Sender<RunUpdate>,
        stop: watch::Receiver<bool>,
    ) -> Result<(), ProcessError>;
}

/// Runs the service's start command through a shell
#[derive(Debug, Clone)]
pub struct CommandRunner {
    shell: String,
    working_dir: Option<PathBuf>,
}

impl Default for CommandRunner {
    fn default() -> Self {
        Self {
            shell: "sh".to_string(),
            working_dir: None,
        }
    }
}

impl CommandRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

/// Resolves once `stop` reads `true`. Never resolves if the sender is gone.
async fn stop_requested(stop: &mut watch::Receiver<bool>) {
    loop {
        if *stop.borrow_and_update() {
            return;
        }
        if stop.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Kills everything the start command spawned, not just the shell.
///
/// `pgid` is the shell's pid, captured at spawn; the group outlives the shell
/// while any member is alive, so the id stays valid after the shell is reaped.
#[cfg(unix)]
fn terminate_group(pgid: Option<u32>, child: &mut Child, service: &str) {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Some(pgid) = pgid else {
        return;
    };
    match killpg(Pid::from_raw(pgid as i32), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => {
            warn!(service = %service, "Unable to terminate process group: {}", e);
            let _ = child.start_kill();
        }
    }
}

#[cfg(not(unix))]
fn terminate_group(_pgid: Option<u32>, child: &mut Child, service: &str) {
    if let Err(e) = child.start_kill() {
        debug!(service = %service, "Unable to terminate service: {}", e);
    }
}

/// Waits for buffered output, giving up on pipes a leftover process holds open
async fn drain_output(forwarders: Vec<JoinHandle<()>>, service: &str) {
    let deadline = Instant::now() + OUTPUT_DRAIN_TIMEOUT;
    for mut forwarder in forwarders {
        if tokio::time::timeout_at(deadline, &mut forwarder).await.is_err() {
            debug!(service = %service, "Output still open after exit, detaching");
            forwarder.abort();
        }
    }
}

async fn forward_lines<R>(reader: R, service: String, updates: mpsc::Sender<RunUpdate>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let _ = updates
                    .send(RunUpdate::new(&service, RunStatus::Running, line))
                    .await;
            }
            Ok(None) => break,
            Err(e) => {
                warn!(service = %service, "Unable to read service output: {}", e);
                break;
            }
        }
    }
}

#[async_trait]
impl ServiceRunner for CommandRunner {
    async fn run(
        &self,
        service: &Service,
        launch: &LaunchConfig,
        updates: mpsc::Sender<RunUpdate>,
        mut stop: watch::Receiver<bool>,
    ) -> Result<(), ProcessError> {
        let name = service.name().to_string();
        let start_cmd = service
            .start_cmd()
            .ok_or_else(|| ProcessError::MissingStartCommand {
                service: name.clone(),
            })?;

        let mut command = Command::new(&self.shell);
        command
            .arg("-c")
            .arg(start_cmd)
            .envs(launch.environment())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(unix)]
        command.process_group(0);

        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }

        debug!(service = %name, command = %start_cmd, mode = launch.mode.as_str(), "Launching service");

        let mut child = command.spawn().map_err(|source| ProcessError::Spawn {
            service: name.clone(),
            source,
        })?;

        let pgid = child.id();

        let _ = updates
            .send(RunUpdate::new(&name, RunStatus::Starting, format!("Started {}", start_cmd)))
            .await;

        let mut forwarders = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            forwarders.push(tokio::spawn(forward_lines(stdout, name.clone(), updates.clone())));
        }
        if let Some(stderr) = child.stderr.take() {
            forwarders.push(tokio::spawn(forward_lines(stderr, name.clone(), updates.clone())));
        }

        let status = tokio::select! {
            status = child.wait() => status,
            _ = stop_requested(&mut stop) => {
                debug!(service = %name, "Stop requested, terminating service");
                terminate_group(pgid, &mut child, &name);
                if let Err(e) = child.wait().await {
                    warn!(service = %name, "Unable to reap service: {}", e);
                }
                drain_output(forwarders, &name).await;
                return Err(ProcessError::Stopped { service: name });
            }
        };

        // Background processes left behind do not outlive the run
        terminate_group(pgid, &mut child, &name);
        drain_output(forwarders, &name).await;

        let status = status.map_err(|source| ProcessError::Wait {
            service: name.clone(),
            source,
        })?;

        if status.success() {
            let _ = updates
                .send(RunUpdate::new(&name, RunStatus::Done, "Service exited"))
                .await;
            Ok(())
        } else {
            let _ = updates
                .send(
                    RunUpdate::new(&name, RunStatus::Error, "Service failed")
                        .with_error(status.to_string()),
                )
                .await;
            Err(ProcessError::Exited {
                service: name,
                status: status.to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::project::BuildContext;
    use std::time::Duration;

    fn service(start_cmd: Option<&str>) -> Service {
        let service = Service::new("svc", "svc.py", BuildContext::new(".", "Dockerfile"));
        match start_cmd {
            Some(cmd) => service.with_start_cmd(cmd),
            None => service,
        }
    }

    fn launch() -> LaunchConfig {
        LaunchConfig::collection("127.0.0.1:50051".parse().unwrap())
    }

    async fn drain(mut rx: mpsc::Receiver<RunUpdate>) -> Vec<RunUpdate> {
        let mut updates = Vec::new();
        while let Some(update) = rx.recv().await {
            updates.push(update);
        }
        updates
    }

    #[test]
    fn test_environment_contains_address_and_mode() {
        let mut extra = BTreeMap::new();
        extra.insert(ADDRESS_ENV.to_string(), "spoofed:1".to_string());
        extra.insert("API_KEY".to_string(), "secret".to_string());

        let env = launch().with_env(extra).environment();
        assert_eq!(env[ADDRESS_ENV], "127.0.0.1:50051");
        assert_eq!(env[MODE_ENV], "collection");
        assert_eq!(env["API_KEY"], "secret");
        assert_eq!(env["PYTHONUNBUFFERED"], "TRUE");
    }

    #[test]
    fn test_execution_mode_strings() {
        assert_eq!(ExecutionMode::Collection.as_str(), "collection");
        assert_eq!(ExecutionMode::Run.as_str(), "run");
    }

    #[tokio::test]
    async fn test_missing_start_command() {
        let (tx, _rx) = mpsc::channel(8);
        let (_stop_tx, stop_rx) = watch::channel(false);

        let err = CommandRunner::new()
            .run(&service(None), &launch(), tx, stop_rx)
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessError::MissingStartCommand { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_output_and_environment_forwarded() {
        let (tx, rx) = mpsc::channel(64);
        let (_stop_tx, stop_rx) = watch::channel(false);

        let svc = service(Some("echo \"$SERVICE_ENVIRONMENT@$SERVICE_ADDRESS\""));
        CommandRunner::new()
            .run(&svc, &launch(), tx, stop_rx)
            .await
            .unwrap();

        let updates = drain(rx).await;
        assert!(updates
            .iter()
            .any(|u| u.message == "collection@127.0.0.1:50051"));
        assert_eq!(updates.last().unwrap().status, RunStatus::Done);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_non_zero_exit_is_error() {
        let (tx, rx) = mpsc::channel(64);
        let (_stop_tx, stop_rx) = watch::channel(false);

        let err = CommandRunner::new()
            .run(&service(Some("exit 3")), &launch(), tx, stop_rx)
            .await
            .unwrap_err();

        assert!(matches!(err, ProcessError::Exited { .. }));
        let updates = drain(rx).await;
        assert_eq!(updates.last().unwrap().status, RunStatus::Error);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stop_signal_terminates_service() {
        let (tx, _rx) = mpsc::channel(64);
        let (stop_tx, stop_rx) = watch::channel(false);

        let svc = service(Some("sleep 30"));
        let run = tokio::spawn(async move {
            CommandRunner::new().run(&svc, &launch(), tx, stop_rx).await
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        stop_tx.send(true).unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .expect("runner did not stop")
            .unwrap();
        assert!(matches!(result, Err(ProcessError::Stopped { .. })));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stop_signal_terminates_forked_commands() {
        let (tx, _rx) = mpsc::channel(64);
        let (stop_tx, stop_rx) = watch::channel(false);

        let svc = service(Some("sleep 20; echo done"));
        let run = tokio::spawn(async move {
            CommandRunner::new().run(&svc, &launch(), tx, stop_rx).await
        });

        tokio::time::sleep(Duration::from_millis(200)).await;
        stop_tx.send(true).unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .expect("runner did not stop")
            .unwrap();
        assert!(matches!(result, Err(ProcessError::Stopped { .. })));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_background_process_does_not_block_exit() {
        let (tx, rx) = mpsc::channel(64);
        let (_stop_tx, stop_rx) = watch::channel(false);

        let svc = service(Some("echo ready; (sleep 20 &); exit 0"));
        let result = tokio::time::timeout(
            Duration::from_secs(5),
            CommandRunner::new().run(&svc, &launch(), tx, stop_rx),
        )
        .await
        .expect("runner blocked on leftover process");

        assert!(result.is_ok());
        let updates = drain(rx).await;
        assert!(updates.iter().any(|u| u.message == "ready"));
        assert_eq!(updates.last().unwrap().status, RunStatus::Done);
    }
}
