//! CLI configuration.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use turbo_dedupe::DedupeConfig;
use turbo_query::QueryConfig;

/// File names searched for, in order, from the working directory upwards.
pub const CONFIG_NAMES: [&str; 3] = ["turbo-query.toml", ".turbo-query.toml", "turbo-query.json"];

/// CLI configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CliConfig {
    /// Coalescing configuration.
    #[serde(default)]
    pub dedupe: DedupeConfig,

    /// Cache and retry configuration.
    #[serde(default)]
    pub query: QueryConfig,

    /// Simulation defaults.
    #[serde(default)]
    pub simulate: SimulateConfig,
}

impl CliConfig {
    /// Load config from a file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(path, &content)
    }

    /// Parse config content, as JSON for `.json` paths and TOML otherwise.
    pub fn parse(path: &Path, content: &str) -> Result<Self> {
        if is_json(path) {
            serde_json::from_str(content)
                .with_context(|| format!("Failed to parse JSON config: {}", path.display()))
        } else {
            toml::from_str(content)
                .with_context(|| format!("Failed to parse TOML config: {}", path.display()))
        }
    }

    /// Save config to a file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = if is_json(path) {
            serde_json::to_string_pretty(self)?
        } else {
            toml::to_string_pretty(self)?
        };

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))
    }
}

fn is_json(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "json")
}

/// Defaults for `tq simulate`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulateConfig {
    /// Views requesting the same list.
    #[serde(default = "default_views")]
    pub views: usize,

    /// Views requesting a different page.
    #[serde(default = "default_distinct_views")]
    pub distinct_views: usize,

    /// Simulated upstream latency.
    #[serde(default = "default_latency_ms")]
    pub latency_ms: u64,

    /// Base URL procedures are addressed under.
    #[serde(default = "default_base_url")]
    pub base_url: String,
}

fn default_views() -> usize {
    3
}

fn default_distinct_views() -> usize {
    1
}

fn default_latency_ms() -> u64 {
    50
}

fn default_base_url() -> String {
    "http://localhost:3000/rpc".to_string()
}

impl Default for SimulateConfig {
    fn default() -> Self {
        Self {
            views: default_views(),
            distinct_views: default_distinct_views(),
            latency_ms: default_latency_ms(),
            base_url: default_base_url(),
        }
    }
}

/// Generate a default turbo-query.toml config file.
pub fn generate_default_config() -> String {
    r#"# Query CLI configuration

[dedupe]
# Only coalesce GET calls.
filter_get_only = true
# Buffered items per stream replica; omit for unbounded.
# replica_capacity = 16

[query]
stale_after_ms = 1000
evict_after_ms = 300000
sweep_interval_ms = 120000
retry = 0
retry_delay_ms = 1000
event_capacity = 64

[simulate]
views = 3
distinct_views = 1
latency_ms = 50
base_url = "http://localhost:3000/rpc"
"#
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_template_parses_to_defaults() {
        let config = CliConfig::parse(Path::new("turbo-query.toml"), &generate_default_config()).unwrap();

        assert_eq!(config.query, QueryConfig::default());
        assert_eq!(config.dedupe, DedupeConfig::default());
        assert_eq!(config.simulate.views, 3);
    }

    #[test]
    fn test_partial_json_config() {
        let config = CliConfig::parse(
            Path::new("turbo-query.json"),
            r#"{"query": {"retry": 2}, "simulate": {"views": 5}}"#,
        )
        .unwrap();

        assert_eq!(config.query.retry, 2);
        assert_eq!(config.query.stale_after_ms, Some(1000));
        assert_eq!(config.simulate.views, 5);
        assert_eq!(config.simulate.latency_ms, 50);
    }

    #[test]
    fn test_invalid_toml_is_reported() {
        let err = CliConfig::parse(Path::new("turbo-query.toml"), "[query\n").unwrap_err();
        assert!(format!("{:#}", err).contains("Failed to parse TOML config"));
    }
}
