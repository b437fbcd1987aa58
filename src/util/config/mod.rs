//! Runtime configuration
//!
//! Describes the node a [`TaskEngine`](crate::runtime::scheduler::TaskEngine)
//! serves and the thread pools it spawns.
//!
//! # Example
//!
//! ```toml
//! node_name = "replica1"
//! timer_resolution_ms = 10
//!
//! [[pools]]
//! name = "THREAD_POOL_DEFAULT"
//! worker_count = 4
//!
//! [[pools]]
//! name = "THREAD_POOL_REPLICATION"
//! worker_count = 8
//! partitioned = true
//! ```
//!
//! # Usage
//!
//! ```rust,no_run
//! use weft::util::config::load_config;
//!
//! let config = load_config("weft.toml").unwrap();
//! ```

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::thread;

use crate::runtime::task::THREAD_POOL_DEFAULT;

/// Configuration of one node's task engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Name of the node the engine serves; must match the node's own name
    #[serde(default = "default_node_name")]
    pub node_name: String,
    /// Longest the delay thread sleeps before re-checking its queue
    #[serde(default = "default_timer_resolution_ms")]
    pub timer_resolution_ms: u64,
    /// How long an idle worker blocks before re-checking the stop flag
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    /// Thread pools to spawn
    #[serde(default = "default_pools")]
    pub pools: Vec<PoolConfig>,
}

fn default_node_name() -> String {
    "node".to_string()
}

fn default_timer_resolution_ms() -> u64 {
    10
}

fn default_idle_timeout_ms() -> u64 {
    100
}

fn default_pools() -> Vec<PoolConfig> {
    vec![PoolConfig::default()]
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            node_name: default_node_name(),
            timer_resolution_ms: default_timer_resolution_ms(),
            idle_timeout_ms: default_idle_timeout_ms(),
            pools: default_pools(),
        }
    }
}

/// Configuration of one thread pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Pool name, matched against the pool of registered task codes
    pub name: String,
    /// Number of worker threads
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    /// Give each worker its own queue and route tasks by `hash % worker_count`
    #[serde(default)]
    pub partitioned: bool,
}

fn default_worker_count() -> usize {
    thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            name: THREAD_POOL_DEFAULT.to_string(),
            worker_count: default_worker_count(),
            partitioned: false,
        }
    }
}

impl PoolConfig {
    /// A pool named `name` with `worker_count` shared-queue workers.
    pub fn new(
        name: impl Into<String>,
        worker_count: usize,
    ) -> Self {
        Self {
            name: name.into(),
            worker_count,
            partitioned: false,
        }
    }

    /// Same pool, with per-worker queues.
    pub fn partitioned(mut self) -> Self {
        self.partitioned = true;
        self
    }
}

impl RuntimeConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: RuntimeConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Render as a TOML document.
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Check that pools are named uniquely and have workers.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pools.is_empty() {
            return Err(ConfigError::Invalid("no thread pool configured".to_string()));
        }

        for (i, pool) in self.pools.iter().enumerate() {
            if pool.name.is_empty() {
                return Err(ConfigError::Invalid(format!("pool #{} has no name", i)));
            }
            if pool.worker_count == 0 {
                return Err(ConfigError::Invalid(format!(
                    "pool `{}` has no workers",
                    pool.name
                )));
            }
            if self.pools[..i].iter().any(|p| p.name == pool.name) {
                return Err(ConfigError::Invalid(format!(
                    "pool `{}` configured twice",
                    pool.name
                )));
            }
        }
        Ok(())
    }

    /// Configuration of the pool named `name`.
    pub fn pool(
        &self,
        name: &str,
    ) -> Option<&PoolConfig> {
        self.pools.iter().find(|p| p.name == name)
    }
}

/// Load a configuration file.
pub fn load_config(path: impl AsRef<Path>) -> Result<RuntimeConfig, ConfigError> {
    let content = fs::read_to_string(path.as_ref())?;
    RuntimeConfig::from_toml_str(&content)
}

/// Write a configuration file, creating parent directories as needed.
pub fn save_config(
    path: impl AsRef<Path>,
    config: &RuntimeConfig,
) -> Result<(), ConfigError> {
    let path = path.as_ref();
    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() && !dir.exists() {
            fs::create_dir_all(dir)?;
        }
    }

    fs::write(path, config.to_toml_string()?)?;
    Ok(())
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Config parse error: {0}")]
    ParseError(#[from] toml::de::Error),
    #[error("Config serialize error: {0}")]
    SerializeError(#[from] toml::ser::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}
