//! Language runtime detection from a service handler's file extension

use super::ProjectError;
use std::collections::HashMap;
use std::path::Path;

/// Patterns every image build context ignores regardless of runtime
const COMMON_IGNORE: &[&str] = &[
    ".codeconfig/",
    ".git/",
    ".idea/",
    ".vscode/",
    ".github/",
    "*.dockerfile",
    "*.dockerignore",
];

const NODE_IGNORE: &[&str] = &["node_modules/"];
const PYTHON_IGNORE: &[&str] = &["__pycache__/", "*.pyc", ".venv/"];
const DOTNET_IGNORE: &[&str] = &["bin/", "obj/"];

/// Runtime of a service, derived from its handler file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Runtime {
    TypeScript,
    JavaScript,
    Python,
    Go,
    CSharp,
}

impl Runtime {
    /// Detects the runtime from the handler's extension
    pub fn from_handler(handler: &Path) -> Result<Self, ProjectError> {
        let ext = handler
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        match ext {
            "ts" => Ok(Runtime::TypeScript),
            "js" => Ok(Runtime::JavaScript),
            "py" => Ok(Runtime::Python),
            "go" => Ok(Runtime::Go),
            "cs" => Ok(Runtime::CSharp),
            other => Err(ProjectError::UnsupportedRuntime {
                handler: handler.to_path_buf(),
                extension: other.to_string(),
            }),
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Runtime::TypeScript => "ts",
            Runtime::JavaScript => "js",
            Runtime::Python => "py",
            Runtime::Go => "go",
            Runtime::CSharp => "cs",
        }
    }

    /// Default build args handed to the image build. `HANDLER` always uses
    /// forward slashes so Dockerfiles stay platform independent.
    pub fn build_args(&self, handler: &Path) -> HashMap<String, String> {
        let handler = handler.to_string_lossy().replace('\\', "/");
        HashMap::from([("HANDLER".to_string(), handler)])
    }

    /// Ignore patterns for the build context, `additional` first
    pub fn build_ignore(&self, additional: &[String]) -> Vec<String> {
        let specific: &[&str] = match self {
            Runtime::TypeScript | Runtime::JavaScript => NODE_IGNORE,
            Runtime::Python => PYTHON_IGNORE,
            Runtime::CSharp => DOTNET_IGNORE,
            Runtime::Go => &[],
        };

        additional
            .iter()
            .cloned()
            .chain(specific.iter().chain(COMMON_IGNORE).map(|p| p.to_string()))
            .collect()
    }
}
