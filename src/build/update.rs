//! Build progress events

use super::BuildError;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildStatus {
    Building,
    Complete,
    Error,
}

impl BuildStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, BuildStatus::Building)
    }
}

impl fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BuildStatus::Building => "building",
            BuildStatus::Complete => "complete",
            BuildStatus::Error => "error",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
pub struct BuildUpdate {
    pub service_name: String,
    pub status: BuildStatus,
    pub message: String,
    pub error: Option<Arc<BuildError>>,
}

/// Sends updates for one service into the shared build stream.
///
/// Sends never fail from the caller's point of view: once the receiving end
/// is gone, updates are discarded.
#[derive(Debug, Clone)]
pub struct BuildUpdateWriter {
    service_name: String,
    tx: UnboundedSender<BuildUpdate>,
}

impl BuildUpdateWriter {
    pub fn new(service_name: impl Into<String>, tx: UnboundedSender<BuildUpdate>) -> Self {
        Self {
            service_name: service_name.into(),
            tx,
        }
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    fn send(&self, status: BuildStatus, message: String, error: Option<Arc<BuildError>>) {
        let _ = self.tx.send(BuildUpdate {
            service_name: self.service_name.clone(),
            status,
            message,
            error,
        });
    }

    pub fn building(&self, message: impl Into<String>) {
        self.send(BuildStatus::Building, message.into(), None);
    }

    /// Forwards engine output, one `Building` update per non-blank line
    pub fn write_lines(&self, output: &str) {
        for line in output.lines().map(str::trim_end).filter(|l| !l.trim().is_empty()) {
            self.building(line);
        }
    }

    pub fn complete(&self, message: impl Into<String>) {
        self.send(BuildStatus::Complete, message.into(), None);
    }

    pub fn error(&self, error: BuildError) {
        let message = error.to_string();
        self.send(BuildStatus::Error, message, Some(Arc::new(error)));
    }
}
