//! Configuration - type-safe, loaded from TOML with full defaults so the
//! engine runs with no config file at all.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub engine: EngineConfig,
    pub feeds: Vec<FeedConfig>,
}

/// Execution engine tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Worker pool size
    pub workers: usize,

    /// Bounded order queue capacity; senders block when full
    pub queue_capacity: usize,

    /// Status poller interval
    pub poll_interval_ms: u64,

    /// Risk monitor sweep period
    pub risk_sweep_secs: u64,

    /// Stale-order sweep period
    pub stale_sweep_secs: u64,

    /// SUBMITTED orders untouched for this long get a poller re-attached
    pub stale_after_secs: i64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 100,
            poll_interval_ms: 1000,
            risk_sweep_secs: 5,
            stale_sweep_secs: 10,
            stale_after_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    /// Feed name, unique within the manager
    pub name: String,

    /// Websocket endpoint
    pub url: String,

    /// Auth headers added to the upgrade request
    #[serde(default)]
    pub auth_headers: Vec<(String, String)>,

    /// Symbols subscribed at startup
    #[serde(default)]
    pub symbols: Vec<String>,

    #[serde(default = "default_reconnect_base_secs")]
    pub reconnect_base_secs: u64,

    #[serde(default = "default_reconnect_max_secs")]
    pub reconnect_max_secs: u64,

    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
}

fn default_reconnect_base_secs() -> u64 {
    5
}

fn default_reconnect_max_secs() -> u64 {
    60
}

fn default_max_reconnect_attempts() -> u32 {
    10
}

impl Default for Config {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            feeds: Vec::new(),
        }
    }
}

impl Config {
    /// Load from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::Config(format!("failed to read config: {e}")))?;
        toml::from_str(&content).map_err(|e| Error::Config(format!("failed to parse config: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_yields_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.engine.workers, 4);
        assert_eq!(config.engine.queue_capacity, 100);
        assert!(config.feeds.is_empty());
    }

    #[test]
    fn partial_engine_section_keeps_other_defaults() {
        let config: Config = toml::from_str(
            r#"
            [engine]
            workers = 8

            [[feeds]]
            name = "primary"
            url = "wss://ticks.example.com/stream"
            symbols = ["ACME"]
            "#,
        )
        .unwrap();
        assert_eq!(config.engine.workers, 8);
        assert_eq!(config.engine.poll_interval_ms, 1000);
        assert_eq!(config.feeds.len(), 1);
        assert_eq!(config.feeds[0].max_reconnect_attempts, 10);
    }
}
