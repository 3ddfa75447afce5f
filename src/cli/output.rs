//! Output formatting for command results
//!
//! JSON is the machine-readable handoff to the deployment layer; the human
//! format is a per-service summary.

use crate::build::{BuildStatus, BuildUpdate};
use crate::collector::RequirementsSet;
use crate::config::CollectorConfig;
use anyhow::{Context, Result};
use std::collections::{BTreeMap, HashMap};
use std::fmt::Write;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Json,
    Human,
}

pub struct OutputFormatter {
    format: OutputFormat,
}

impl OutputFormatter {
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Formats collected requirements, ordered by service name
    pub fn format_requirements(&self, results: &HashMap<String, RequirementsSet>) -> Result<String> {
        let ordered: BTreeMap<&String, &RequirementsSet> = results.iter().collect();

        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(&ordered)
                .context("Failed to serialize requirements to JSON"),
            OutputFormat::Human => Ok(self.format_requirements_human(&ordered)),
        }
    }

    fn format_requirements_human(&self, results: &BTreeMap<&String, &RequirementsSet>) -> String {
        let mut output = String::new();

        for (name, requirements) in results {
            let _ = writeln!(output, "{} ({})", name, requirements.service_file.display());

            if requirements.is_empty() {
                let _ = writeln!(output, "  no resources declared");
                continue;
            }

            for (api, spec) in &requirements.apis {
                let _ = writeln!(output, "  api {}", api);
                for worker in &spec.workers {
                    let _ = writeln!(output, "    {}", worker);
                }
            }

            let counts = [
                ("schedules", requirements.schedules.len()),
                ("topics", requirements.topics.len()),
                ("subscriptions", requirements.subscriptions.len()),
                ("websocket handlers", requirements.websockets.len()),
                ("bucket listeners", requirements.bucket_listeners.len()),
                ("http proxies", requirements.http_proxies.len()),
                ("buckets", requirements.buckets.len()),
                ("queues", requirements.queues.len()),
                ("key-value stores", requirements.key_value_stores.len()),
                ("sql databases", requirements.sql_databases.len()),
                ("secrets", requirements.secrets.len()),
            ];
            for (label, count) in counts.iter().filter(|(_, count)| *count > 0) {
                let _ = writeln!(output, "  {}: {}", label, count);
            }

            for conflict in &requirements.conflicts {
                let _ = writeln!(output, "  warning: {}", conflict);
            }
        }

        output
    }

    /// One line per build update
    pub fn format_build_update(&self, update: &BuildUpdate) -> String {
        match self.format {
            OutputFormat::Json => serde_json::json!({
                "service": update.service_name,
                "status": update.status.to_string(),
                "message": update.message,
                "error": update.error.as_ref().map(|e| e.to_string()),
            })
            .to_string(),
            OutputFormat::Human => match update.status {
                BuildStatus::Building => format!("[{}] {}", update.service_name, update.message),
                BuildStatus::Complete => format!("[{}] done: {}", update.service_name, update.message),
                BuildStatus::Error => format!("[{}] failed: {}", update.service_name, update.message),
            },
        }
    }

    pub fn format_config(&self, config: &CollectorConfig) -> Result<String> {
        match self.format {
            OutputFormat::Json => {
                let map: BTreeMap<String, String> = config.to_display_map().into_iter().collect();
                serde_json::to_string_pretty(&map).context("Failed to serialize config to JSON")
            }
            OutputFormat::Human => Ok(config.to_string()),
        }
    }
}
