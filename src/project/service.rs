//! Service descriptors

use super::runtime::Runtime;
use super::ProjectError;
use regex::Regex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

pub const DEFAULT_SERVICE_TYPE: &str = "default";

/// Everything the image builder needs to produce a service image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildContext {
    /// Directory sent to the container engine as the build context
    pub base_dir: PathBuf,
    /// Dockerfile path relative to `base_dir`
    pub dockerfile: PathBuf,
    pub args: HashMap<String, String>,
    pub ignore: Vec<String>,
}

impl BuildContext {
    pub fn new(base_dir: impl Into<PathBuf>, dockerfile: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            dockerfile: dockerfile.into(),
            args: HashMap::new(),
            ignore: Vec::new(),
        }
    }

    /// Build context for a handler whose runtime is inferred from its
    /// extension; runtime defaults are merged under any explicit args.
    pub fn for_handler(
        base_dir: impl Into<PathBuf>,
        dockerfile: impl Into<PathBuf>,
        handler: &Path,
        args: HashMap<String, String>,
        ignore: &[String],
    ) -> Result<Self, ProjectError> {
        let runtime = Runtime::from_handler(handler)?;

        let mut merged = runtime.build_args(handler);
        merged.extend(args);

        Ok(Self {
            base_dir: base_dir.into(),
            dockerfile: dockerfile.into(),
            args: merged,
            ignore: runtime.build_ignore(ignore),
        })
    }
}

/// One user-authored deployable unit. Immutable once the project is loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Service {
    name: String,
    file_path: PathBuf,
    service_type: String,
    start_cmd: Option<String>,
    build_context: BuildContext,
}

impl Service {
    pub fn new(
        name: impl Into<String>,
        file_path: impl Into<PathBuf>,
        build_context: BuildContext,
    ) -> Self {
        Self {
            name: name.into(),
            file_path: file_path.into(),
            service_type: DEFAULT_SERVICE_TYPE.to_string(),
            start_cmd: None,
            build_context,
        }
    }

    pub fn with_type(mut self, service_type: impl Into<String>) -> Self {
        let service_type = service_type.into();
        if !service_type.is_empty() {
            self.service_type = service_type;
        }
        self
    }

    pub fn with_start_cmd(mut self, start_cmd: impl Into<String>) -> Self {
        self.start_cmd = Some(start_cmd.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn file_path(&self) -> &Path {
        &self.file_path
    }

    pub fn service_type(&self) -> &str {
        &self.service_type
    }

    pub fn start_cmd(&self) -> Option<&str> {
        self.start_cmd.as_deref()
    }

    pub fn build_context(&self) -> &BuildContext {
        &self.build_context
    }
}

fn non_word() -> &'static Regex {
    static NON_WORD: OnceLock<Regex> = OnceLock::new();
    NON_WORD.get_or_init(|| Regex::new(r"[^\w-]").expect("static pattern is valid"))
}

/// Derives a stable service name from its entrypoint path, prefixed with
/// the project name so images group per project.
///
/// `("shop", "services/orders.api.ts")` becomes `"shop_services-orders-api"`.
pub fn normalized_service_name(project_name: &str, service_path: &Path) -> String {
    let without_ext = service_path.with_extension("");
    let path = without_ext.to_string_lossy();

    let name = format!("{}_{}", project_name, path)
        .replace(['/', '\\'], "-")
        .replace('.', "-");

    non_word().replace_all(&name, "-").to_lowercase()
}
