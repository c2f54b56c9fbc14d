//! Configuration resolution for Flowpool.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (~/.config/flowpool/settings.json)
//! 3. Project config (.flowpool/settings.json)
//! 4. Environment variables
//! 5. CLI arguments (highest priority, applied by the binary)

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// Complete Flowpool configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub resources: ResourceDefaults,
    /// Per-resource overrides, keyed by resource name.
    #[serde(default)]
    pub overrides: HashMap<String, ResourceOverride>,
    #[serde(default)]
    pub content: ContentConfig,
}

/// Service-process configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub log_level: String,
    pub log_json: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_json: false,
        }
    }
}

/// Defaults applied to every runnable resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceDefaults {
    /// Bound on each of a resource's two queues.
    pub queue_capacity: usize,
    /// Back-off used by the async queue adapters when a queue is empty.
    pub poll_interval_ms: u64,
    /// Idle time after which a started resource pauses itself.
    pub max_inactivity_secs: u64,
    /// How often the inactivity watcher checks the idle time.
    pub usage_check_secs: u64,
    /// How often the lazy watcher looks at the inbound queue.
    pub new_msg_check_ms: u64,
    /// In-flight task limit for async handlers.
    pub async_task_limit: usize,
    pub respawn_initial_delay_ms: u64,
    pub respawn_max_delay_ms: u64,
}

impl Default for ResourceDefaults {
    fn default() -> Self {
        Self {
            queue_capacity: 1000,
            poll_interval_ms: 500,
            max_inactivity_secs: 300,
            usage_check_secs: 10,
            new_msg_check_ms: 1000,
            async_task_limit: 100,
            respawn_initial_delay_ms: 100,
            respawn_max_delay_ms: 5000,
        }
    }
}

impl ResourceDefaults {
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub const fn max_inactivity(&self) -> Duration {
        Duration::from_secs(self.max_inactivity_secs)
    }

    pub const fn usage_check_interval(&self) -> Duration {
        Duration::from_secs(self.usage_check_secs)
    }

    pub const fn new_msg_check_interval(&self) -> Duration {
        Duration::from_millis(self.new_msg_check_ms)
    }
}

/// Settings for a single named resource. Unset fields fall back to the
/// resource's own registration values or to [`ResourceDefaults`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceOverride {
    pub replicas: Option<usize>,
    pub lazy: Option<bool>,
    pub async_task_limit: Option<usize>,
}

/// Content collaborator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContentConfig {
    /// Maximum number of concurrent fetch batches.
    pub fetch_concurrency: usize,
    /// Number of references fetched per batch.
    pub batch_size: usize,
    pub retry_attempts: u32,
    pub retry_delay_ms: u64,
}

impl Default for ContentConfig {
    fn default() -> Self {
        Self {
            fetch_concurrency: 4,
            batch_size: 1,
            retry_attempts: 3,
            retry_delay_ms: 1000,
        }
    }
}

impl ContentConfig {
    pub const fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

/// Load configuration with hierarchical resolution.
pub fn load_config(project_dir: Option<&Path>) -> Result<Config> {
    let mut config = Config::default();

    if let Some(global_path) = global_config_path()
        && global_path.exists()
    {
        let global = load_config_file(&global_path)?;
        merge_config(&mut config, global);
    }

    if let Some(dir) = project_dir {
        let project_path = dir.join(".flowpool").join("settings.json");
        if project_path.exists() {
            let project = load_config_file(&project_path)?;
            merge_config(&mut config, project);
        }
    }

    apply_env_overrides(&mut config, |name| std::env::var(name).ok());

    Ok(config)
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("flowpool").join("settings.json"))
}

fn load_config_file(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

fn merge_config(base: &mut Config, overlay: Config) {
    base.service = overlay.service;
    base.resources = overlay.resources;
    base.content = overlay.content;

    for (name, layer) in overlay.overrides {
        let entry = base.overrides.entry(name).or_default();
        if layer.replicas.is_some() {
            entry.replicas = layer.replicas;
        }
        if layer.lazy.is_some() {
            entry.lazy = layer.lazy;
        }
        if layer.async_task_limit.is_some() {
            entry.async_task_limit = layer.async_task_limit;
        }
    }
}

fn apply_env_overrides(config: &mut Config, var: impl Fn(&str) -> Option<String>) {
    fn parsed<T: std::str::FromStr>(
        var: &impl Fn(&str) -> Option<String>,
        name: &str,
    ) -> Option<T> {
        let raw = var(name)?;
        match raw.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(variable = name, value = %raw, "Ignoring unparsable environment override");
                None
            }
        }
    }

    if let Some(n) = parsed(&var, "FLOWPOOL_QUEUE_CAPACITY") {
        config.resources.queue_capacity = n;
    }
    if let Some(n) = parsed(&var, "FLOWPOOL_MAX_INACTIVITY_SECS") {
        config.resources.max_inactivity_secs = n;
    }
    if let Some(n) = parsed(&var, "FLOWPOOL_ASYNC_TASK_LIMIT") {
        config.resources.async_task_limit = n;
    }
    if let Some(n) = parsed(&var, "FLOWPOOL_FETCH_CONCURRENCY") {
        config.content.fetch_concurrency = n;
    }
    if let Some(n) = parsed(&var, "FLOWPOOL_CONTENT_BATCH_SIZE") {
        config.content.batch_size = n;
    }
    if let Some(level) = var("FLOWPOOL_LOG_LEVEL") {
        config.service.log_level = level;
    }
}
