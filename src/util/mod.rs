//! Runtime configuration and small helpers

use serde::{Deserialize, Serialize};

/// Controller runtime configuration, loadable from `cascade.toml` with
/// `CASCADE_*` environment overrides
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    /// capacity of each per-module message queue
    pub queue_capacity: usize,
    /// socket address the client manager listens on
    pub listen_addr: String,
    /// dispatch loop tick interval in milliseconds
    pub tick_interval_ms: u64,
    /// ticks spent draining modules on shutdown before giving up
    pub shutdown_retries: u32,
    pub log_level: String,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            queue_capacity: crate::transport::QUEUE_CAPACITY,
            listen_addr: "127.0.0.1:31093".to_string(),
            tick_interval_ms: 5,
            shutdown_retries: 200,
            log_level: "info".to_string(),
        }
    }
}

impl SystemConfig {
    pub fn load() -> crate::Result<Self> {
        let cfg = config::Config::builder()
            .add_source(config::File::with_name("cascade").required(false))
            .add_source(config::Environment::with_prefix("CASCADE"))
            .build()?;
        Ok(cfg.try_deserialize()?)
    }

    /// Rendered defaults for `--print-config`
    pub fn to_toml(&self) -> String {
        toml::to_string_pretty(self).unwrap_or_default()
    }
}
