//! Configuration loading from TOML files
//!
//! Config file is selected via:
//! 1. --config <path> command line argument
//! 2. CONFIG_FILE environment variable
//! 3. Default: config/dev.toml

use crate::domain::types::{Counter, Service};
use anyhow::{bail, Context};
use serde::Deserialize;
use std::collections::HashSet;
use std::env;
use std::fs;
use std::path::Path;
use tracing::warn;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct SiteConfig {
    /// Unique site identifier (e.g., "town-hall", "north-branch")
    #[serde(default = "default_site_id")]
    pub id: String,
}

fn default_site_id() -> String {
    "queue".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Seconds a CALLED token may go unanswered before it becomes NO_SHOW
    #[serde(default = "default_no_show_timeout_secs")]
    pub no_show_timeout_secs: u64,
    /// How often expired no-show deadlines are swept
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
    /// Position at or below which a "nearly up" intent is sent
    #[serde(default = "default_nearly_up_position")]
    pub nearly_up_position: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            no_show_timeout_secs: default_no_show_timeout_secs(),
            sweep_interval_ms: default_sweep_interval_ms(),
            nearly_up_position: default_nearly_up_position(),
        }
    }
}

fn default_no_show_timeout_secs() -> u64 {
    300
}

fn default_sweep_interval_ms() -> u64 {
    1000
}

fn default_nearly_up_position() -> usize {
    3
}

#[derive(Debug, Clone, Deserialize)]
pub struct EstimatorConfig {
    /// Base URL of the wait-time prediction service (unset disables it)
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_estimator_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self { url: None, timeout_ms: default_estimator_timeout_ms() }
    }
}

fn default_estimator_timeout_ms() -> u64 {
    500
}

#[derive(Debug, Clone, Deserialize)]
pub struct NotifierConfig {
    /// File path for the notification intent log (JSONL format)
    #[serde(default = "default_intent_file")]
    pub file: String,
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self { file: default_intent_file(), channel_capacity: default_channel_capacity() }
    }
}

fn default_intent_file() -> String {
    "intents.jsonl".to_string()
}

fn default_channel_capacity() -> usize {
    1000
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct SnapshotConfig {
    /// Where engine state is loaded from at startup and saved at shutdown
    #[serde(default)]
    pub file: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_interval")]
    pub interval_secs: u64,
    /// Prometheus metrics HTTP port (0 to disable)
    #[serde(default = "default_prometheus_port")]
    pub prometheus_port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { interval_secs: default_metrics_interval(), prometheus_port: default_prometheus_port() }
    }
}

fn default_metrics_interval() -> u64 {
    10
}

fn default_prometheus_port() -> u16 {
    9090
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceEntry {
    pub id: String,
    pub name: String,
    #[serde(default = "default_avg_handle_minutes")]
    pub avg_handle_minutes: u32,
    #[serde(default = "default_true")]
    pub active: bool,
}

fn default_avg_handle_minutes() -> u32 {
    5
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct CounterEntry {
    pub id: String,
    /// Number shown to citizens ("proceed to counter 3")
    pub label: u32,
    pub service: String,
    #[serde(default = "default_true")]
    pub active: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TomlConfig {
    #[serde(default)]
    pub site: SiteConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub estimator: EstimatorConfig,
    #[serde(default)]
    pub notifier: NotifierConfig,
    #[serde(default)]
    pub snapshot: SnapshotConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub services: Vec<ServiceEntry>,
    #[serde(default)]
    pub counters: Vec<CounterEntry>,
}

/// Main configuration struct used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    site_id: String,
    no_show_timeout_secs: u64,
    sweep_interval_ms: u64,
    nearly_up_position: usize,
    estimator_url: Option<String>,
    estimator_timeout_ms: u64,
    intent_file: String,
    intent_channel_capacity: usize,
    snapshot_file: Option<String>,
    metrics_interval_secs: u64,
    prometheus_port: u16,
    config_file: String,
    services: Vec<Service>,
    counters: Vec<Counter>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            site_id: default_site_id(),
            no_show_timeout_secs: default_no_show_timeout_secs(),
            sweep_interval_ms: default_sweep_interval_ms(),
            nearly_up_position: default_nearly_up_position(),
            estimator_url: None,
            estimator_timeout_ms: default_estimator_timeout_ms(),
            intent_file: default_intent_file(),
            intent_channel_capacity: default_channel_capacity(),
            snapshot_file: None,
            metrics_interval_secs: default_metrics_interval(),
            prometheus_port: default_prometheus_port(),
            config_file: "default".to_string(),
            services: vec![Service::new("general", "General", default_avg_handle_minutes())],
            counters: vec![Counter::new("counter-1", 1, "general")],
        }
    }
}

impl Config {
    /// Determine config file path from the CLI flag or environment
    pub fn resolve_config_path(cli_path: Option<&str>) -> String {
        if let Some(path) = cli_path {
            return path.to_string();
        }

        // Check CONFIG_FILE environment variable
        if let Ok(path) = env::var("CONFIG_FILE") {
            return path;
        }

        // Default to dev.toml
        "config/dev.toml".to_string()
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let toml_config: TomlConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        Self::from_toml(toml_config, path.display().to_string())
    }

    fn from_toml(toml_config: TomlConfig, config_file: String) -> anyhow::Result<Self> {
        let mut service_ids = HashSet::new();
        let mut services = Vec::with_capacity(toml_config.services.len());
        for entry in toml_config.services {
            if !service_ids.insert(entry.id.clone()) {
                bail!("duplicate service id '{}'", entry.id);
            }
            let mut service = Service::new(entry.id, &entry.name, entry.avg_handle_minutes);
            service.active = entry.active;
            services.push(service);
        }

        let mut counter_ids = HashSet::new();
        let mut counters = Vec::with_capacity(toml_config.counters.len());
        for entry in toml_config.counters {
            if !service_ids.contains(&entry.service) {
                bail!("counter '{}' references unknown service '{}'", entry.id, entry.service);
            }
            if !counter_ids.insert(entry.id.clone()) {
                bail!("duplicate counter id '{}'", entry.id);
            }
            let mut counter = Counter::new(entry.id, entry.label, entry.service);
            counter.active = entry.active;
            counters.push(counter);
        }

        if toml_config.engine.nearly_up_position == 0 {
            bail!("engine.nearly_up_position must be at least 1");
        }

        Ok(Self {
            site_id: toml_config.site.id,
            no_show_timeout_secs: toml_config.engine.no_show_timeout_secs,
            sweep_interval_ms: toml_config.engine.sweep_interval_ms,
            nearly_up_position: toml_config.engine.nearly_up_position,
            estimator_url: toml_config.estimator.url.filter(|url| !url.is_empty()),
            estimator_timeout_ms: toml_config.estimator.timeout_ms,
            intent_file: toml_config.notifier.file,
            intent_channel_capacity: toml_config.notifier.channel_capacity.max(1),
            snapshot_file: toml_config.snapshot.file.filter(|f| !f.is_empty()),
            metrics_interval_secs: toml_config.metrics.interval_secs,
            prometheus_port: toml_config.metrics.prometheus_port,
            config_file,
            services,
            counters,
        })
    }

    /// Load configuration - tries TOML file first, falls back to defaults
    pub fn load(cli_path: Option<&str>) -> Self {
        Self::load_from_path(&Self::resolve_config_path(cli_path))
    }

    pub fn load_from_path(path: &str) -> Self {
        match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                warn!(error = %format!("{e:#}"), "config_load_failed_using_defaults");
                Self::default()
            }
        }
    }

    // Getters for all config fields
    pub fn site_id(&self) -> &str {
        &self.site_id
    }

    pub fn no_show_timeout_secs(&self) -> u64 {
        self.no_show_timeout_secs
    }

    pub fn sweep_interval_ms(&self) -> u64 {
        self.sweep_interval_ms
    }

    pub fn nearly_up_position(&self) -> usize {
        self.nearly_up_position
    }

    pub fn estimator_url(&self) -> Option<&str> {
        self.estimator_url.as_deref()
    }

    pub fn estimator_timeout_ms(&self) -> u64 {
        self.estimator_timeout_ms
    }

    pub fn intent_file(&self) -> &str {
        &self.intent_file
    }

    pub fn intent_channel_capacity(&self) -> usize {
        self.intent_channel_capacity
    }

    pub fn snapshot_file(&self) -> Option<&str> {
        self.snapshot_file.as_deref()
    }

    pub fn metrics_interval_secs(&self) -> u64 {
        self.metrics_interval_secs
    }

    pub fn prometheus_port(&self) -> u16 {
        self.prometheus_port
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }

    pub fn services(&self) -> &[Service] {
        &self.services
    }

    pub fn counters(&self) -> &[Counter] {
        &self.counters
    }

    /// Builder method to set the no-show timeout
    pub fn with_no_show_timeout_secs(mut self, secs: u64) -> Self {
        self.no_show_timeout_secs = secs;
        self
    }

    /// Builder method to replace the seeded services and counters
    pub fn with_layout(mut self, services: Vec<Service>, counters: Vec<Counter>) -> Self {
        self.services = services;
        self.counters = counters;
        self
    }

    /// Builder method for tests to set the estimator timeout
    #[cfg(test)]
    pub fn with_estimator_timeout_ms(mut self, ms: u64) -> Self {
        self.estimator_timeout_ms = ms;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.site_id(), "queue");
        assert_eq!(config.no_show_timeout_secs(), 300);
        assert_eq!(config.sweep_interval_ms(), 1000);
        assert_eq!(config.nearly_up_position(), 3);
        assert_eq!(config.estimator_url(), None);
        assert_eq!(config.estimator_timeout_ms(), 500);
        assert_eq!(config.metrics_interval_secs(), 10);
        assert_eq!(config.services().len(), 1);
        assert_eq!(config.counters()[0].service_id.as_str(), "general");
    }

    #[test]
    fn test_resolve_config_path_from_cli() {
        assert_eq!(Config::resolve_config_path(Some("config/north.toml")), "config/north.toml");
    }

    #[test]
    fn test_intent_file_default() {
        let notifier = NotifierConfig::default();
        assert_eq!(notifier.file, "intents.jsonl");
        assert_eq!(Config::default().intent_file(), "intents.jsonl");
    }

    #[test]
    fn test_sections_are_optional() {
        let toml_config: TomlConfig = toml::from_str("[site]\nid = \"x\"\n").unwrap();
        let config = Config::from_toml(toml_config, "inline".into()).unwrap();
        assert_eq!(config.site_id(), "x");
        assert_eq!(config.no_show_timeout_secs(), 300);
        assert!(config.services().is_empty());
    }

    #[test]
    fn test_counter_with_unknown_service_is_rejected() {
        let toml_config: TomlConfig = toml::from_str(
            r#"
[[counters]]
id = "c1"
label = 1
service = "ghost"
"#,
        )
        .unwrap();
        let err = Config::from_toml(toml_config, "inline".into()).unwrap_err();
        assert!(err.to_string().contains("unknown service 'ghost'"));
    }

    #[test]
    fn test_duplicate_service_is_rejected() {
        let toml_config: TomlConfig = toml::from_str(
            r#"
[[services]]
id = "a"
name = "A"

[[services]]
id = "a"
name = "A again"
"#,
        )
        .unwrap();
        assert!(Config::from_toml(toml_config, "inline".into()).is_err());
    }

    #[test]
    fn test_empty_estimator_url_disables() {
        let toml_config: TomlConfig = toml::from_str("[estimator]\nurl = \"\"\n").unwrap();
        let config = Config::from_toml(toml_config, "inline".into()).unwrap();
        assert_eq!(config.estimator_url(), None);
        assert_eq!(config.with_estimator_timeout_ms(20).estimator_timeout_ms(), 20);
    }
}
