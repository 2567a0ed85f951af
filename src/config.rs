//! Runtime configuration.
//!
//! Configuration can be loaded from:
//! 1. TOML file (`.refgen.toml`)
//! 2. Environment variables (with `REFGEN_` prefix)
//!
//! Environment variables override TOML configuration.
//!
//! # Example TOML Configuration
//!
//! ```toml
//! [runtime]
//! worker_nodes = ["worker-1", "worker-2"]
//! max_concurrent_tasks = 16
//! max_task_retries = 3
//! task_retry_delay_ms = 50
//! enable_reconstruction = true
//! max_inline_bytes = 102400
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::constants::{
    DEFAULT_CONFIG_FILE, DEFAULT_MAX_CONCURRENT_TASKS, DEFAULT_MAX_INLINE_BYTES,
    DEFAULT_MAX_TASK_RETRIES, DEFAULT_TASK_RETRY_DELAY_MS, DEFAULT_WORKER_NODE, ENV_PREFIX,
};
use crate::types::NodeId;

/// Tunables for a [`Runtime`](crate::runtime::Runtime).
///
/// # Examples
///
/// ```
/// use refgen::config::RuntimeConfig;
///
/// let config = RuntimeConfig::default()
///     .with_worker_nodes(["a", "b"])
///     .with_max_task_retries(0)
///     .with_reconstruction(false);
///
/// assert_eq!(config.worker_nodes.len(), 2);
/// assert_eq!(config.max_task_retries, 0);
/// assert!(!config.enable_reconstruction);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Worker nodes registered at startup.
    pub worker_nodes: Vec<NodeId>,

    /// Upper bound on task attempts running at once.
    pub max_concurrent_tasks: usize,

    /// Re-executions allowed per task, shared by retries and reconstructions.
    /// Overridden per task by [`TaskOptions::max_retries`](crate::domain::TaskOptions).
    pub max_task_retries: u32,

    /// Delay before a retry or reconstruction attempt starts.
    pub task_retry_delay_ms: u64,

    /// Whether lost outputs are regenerated by re-executing their task.
    pub enable_reconstruction: bool,

    /// Serialized payloads up to this size are placed on the owner node.
    pub max_inline_bytes: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            worker_nodes: vec![NodeId::new(DEFAULT_WORKER_NODE)],
            max_concurrent_tasks: DEFAULT_MAX_CONCURRENT_TASKS,
            max_task_retries: DEFAULT_MAX_TASK_RETRIES,
            task_retry_delay_ms: DEFAULT_TASK_RETRY_DELAY_MS,
            enable_reconstruction: true,
            max_inline_bytes: DEFAULT_MAX_INLINE_BYTES,
        }
    }
}

impl RuntimeConfig {
    /// Loads `.refgen.toml` from the working directory if present, then
    /// applies `REFGEN_*` environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = if let Ok(contents) = std::fs::read_to_string(DEFAULT_CONFIG_FILE) {
            Self::from_toml(&contents)?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Loads a TOML file, then applies environment overrides.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Io {
            path: path.as_ref().display().to_string(),
            error: e.to_string(),
        })?;
        let mut config = Self::from_toml(&contents)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Parses the `[runtime]` table of a TOML document. A missing table
    /// yields the defaults.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        #[derive(Deserialize)]
        struct FullConfig {
            #[serde(default)]
            runtime: RuntimeConfig,
        }

        let full: FullConfig =
            toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;

        Ok(full.runtime)
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));

        // Comma-separated node list
        if let Some(nodes) = var("WORKER_NODES") {
            self.worker_nodes = nodes
                .split(',')
                .map(str::trim)
                .filter(|n| !n.is_empty())
                .map(NodeId::new)
                .collect();
        }
        if let Some(v) = var("MAX_CONCURRENT_TASKS") {
            if let Ok(v) = v.parse() {
                self.max_concurrent_tasks = v;
            }
        }
        if let Some(v) = var("MAX_TASK_RETRIES") {
            if let Ok(v) = v.parse() {
                self.max_task_retries = v;
            }
        }
        if let Some(v) = var("TASK_RETRY_DELAY_MS") {
            if let Ok(v) = v.parse() {
                self.task_retry_delay_ms = v;
            }
        }
        if let Some(v) = var("ENABLE_RECONSTRUCTION") {
            if let Ok(v) = v.parse() {
                self.enable_reconstruction = v;
            }
        }
        if let Some(v) = var("MAX_INLINE_BYTES") {
            if let Ok(v) = v.parse() {
                self.max_inline_bytes = v;
            }
        }
    }

    /// Rejects configurations the runtime cannot operate with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_tasks == 0 {
            return Err(ConfigError::Invalid(
                "max_concurrent_tasks must be at least 1".to_string(),
            ));
        }
        if self.worker_nodes.iter().any(NodeId::is_owner) {
            return Err(ConfigError::Invalid(format!(
                "worker node name '{}' is reserved for the owner",
                NodeId::owner()
            )));
        }
        Ok(())
    }

    /// The retry delay as a [`Duration`].
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.task_retry_delay_ms)
    }

    /// Sets the worker nodes.
    pub fn with_worker_nodes<I, N>(mut self, nodes: I) -> Self
    where
        I: IntoIterator<Item = N>,
        N: Into<NodeId>,
    {
        self.worker_nodes = nodes.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the concurrent attempt limit.
    pub fn with_max_concurrent_tasks(mut self, max: usize) -> Self {
        self.max_concurrent_tasks = max;
        self
    }

    /// Sets the default per-task retry budget.
    pub fn with_max_task_retries(mut self, retries: u32) -> Self {
        self.max_task_retries = retries;
        self
    }

    /// Sets the retry delay in milliseconds.
    pub fn with_task_retry_delay_ms(mut self, delay_ms: u64) -> Self {
        self.task_retry_delay_ms = delay_ms;
        self
    }

    /// Enables or disables reconstruction of lost outputs.
    pub fn with_reconstruction(mut self, enabled: bool) -> Self {
        self.enable_reconstruction = enabled;
        self
    }

    /// Sets the inline payload threshold.
    pub fn with_max_inline_bytes(mut self, bytes: usize) -> Self {
        self.max_inline_bytes = bytes;
        self
    }
}

/// Configuration errors.
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading configuration file.
    Io {
        /// Path to the configuration file.
        path: String,
        /// Error message.
        error: String,
    },
    /// Parse error in configuration.
    Parse(String),
    /// The configuration parsed but cannot be used.
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io { path, error } => {
                write!(f, "Failed to read config file '{path}': {error}")
            },
            Self::Parse(e) => write!(f, "Failed to parse config: {e}"),
            Self::Invalid(e) => write!(f, "Invalid config: {e}"),
        }
    }
}

impl std::error::Error for ConfigError {}
