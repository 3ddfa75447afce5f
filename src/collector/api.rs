//! Per-API route registry with overlap detection
//!
//! Workers are identified by their normalized path and their HTTP methods.
//! Parameter names never distinguish routes, so `/users/{id}` and
//! `/users/:userId` are the same path. Two workers collide when their paths
//! normalize identically and they share at least one method.

use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{PoisonError, RwLock};

/// Canonical token every path parameter normalizes to
const PARAM_TOKEN: &str = ":param";

/// A declared route
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Worker {
    pub path: String,
    pub methods: Vec<String>,
    /// Service that handles the route
    pub target: String,
}

impl Worker {
    pub fn new(path: impl Into<String>, methods: &[&str], target: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            methods: methods.iter().map(|m| m.to_string()).collect(),
            target: target.into(),
        }
    }

    /// True when both workers would answer the same request
    pub fn overlaps(&self, other: &Worker) -> bool {
        normalize_path(&self.path) == normalize_path(&other.path)
            && self.methods.iter().any(|m| other.methods.contains(m))
    }
}

impl fmt::Display for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.methods.join(","), self.path)
    }
}

/// Authentication scheme attached to an API
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SecurityDefinition {
    Oidc { issuer: String, audiences: Vec<String> },
}

/// A worker rejected because it overlaps one already registered
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegistrationConflict {
    pub service: String,
    pub api: String,
    pub existing: Worker,
    pub rejected: Worker,
}

impl fmt::Display for RegistrationConflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "service {}: overlapping worker {} already registered on api {}, can't add new worker {}",
            self.service, self.existing, self.api, self.rejected
        )
    }
}

impl std::error::Error for RegistrationConflict {}

/// Snapshot of one API's declarations
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ApiSpec {
    pub workers: Vec<Worker>,
    pub security_definitions: BTreeMap<String, SecurityDefinition>,
    pub security: BTreeMap<String, Vec<String>>,
}

/// Splits a route on `/`, replaces parameter segments (`:id`, `{id}`) with a
/// canonical token and lower-cases everything else. Empty segments are
/// dropped, so leading and trailing slashes are insignificant.
pub fn normalize_path(path: &str) -> String {
    path.split('/')
        .filter(|segment| !segment.is_empty())
        .map(|segment| {
            if is_param(segment) {
                PARAM_TOKEN.to_string()
            } else {
                segment.to_lowercase()
            }
        })
        .collect::<Vec<_>>()
        .join("/")
}

fn is_param(segment: &str) -> bool {
    segment.starts_with(':') || (segment.starts_with('{') && segment.ends_with('}'))
}

/// Routes and security settings of one named API within one service
#[derive(Debug)]
pub struct ApiRegistry {
    service: String,
    name: String,
    inner: RwLock<ApiSpec>,
}

impl ApiRegistry {
    pub fn new(service: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            name: name.into(),
            inner: RwLock::new(ApiSpec::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Appends `worker` unless it overlaps an existing one, in which case
    /// the new worker is dropped and the conflict returned.
    pub fn add_worker(&self, worker: Worker) -> Result<(), RegistrationConflict> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);

        if let Some(existing) = inner.workers.iter().find(|w| w.overlaps(&worker)) {
            return Err(RegistrationConflict {
                service: self.service.clone(),
                api: self.name.clone(),
                existing: existing.clone(),
                rejected: worker,
            });
        }

        inner.workers.push(worker);
        Ok(())
    }

    pub fn add_security_definition(&self, name: impl Into<String>, definition: SecurityDefinition) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.security_definitions.insert(name.into(), definition);
    }

    /// `None` is stored as an explicit empty scope list
    pub fn add_security(&self, name: impl Into<String>, scopes: Option<Vec<String>>) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.security.insert(name.into(), scopes.unwrap_or_default());
    }

    pub fn worker_count(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .workers
            .len()
    }

    pub fn spec(&self) -> ApiSpec {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
