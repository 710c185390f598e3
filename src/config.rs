//! Configuration management for Ratewarden.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, WardenError};
use crate::ratelimit::LimiterConfig;

/// Prefix for environment overrides, e.g. `RATEWARDEN__SERVER__LISTEN_ADDR`.
const ENV_PREFIX: &str = "RATEWARDEN";

/// Main configuration for the Ratewarden service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WardenConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Governor tuning shared by every limiter
    #[serde(default)]
    pub governor: GovernorConfig,

    /// Named limiters
    #[serde(default)]
    pub limiters: HashMap<String, LimiterConfig>,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// Interval between retention sweeps in seconds
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

fn default_sweep_interval() -> u64 {
    60
}

/// Counter store and sink tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GovernorConfig {
    /// Maximum counter records held in the local cache
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,

    /// Budget for each durable store call in milliseconds
    #[serde(default = "default_store_timeout")]
    pub store_timeout_ms: u64,

    /// Budget for each violation sink call in milliseconds
    #[serde(default = "default_sink_timeout")]
    pub sink_timeout_ms: u64,

    /// Number of lock shards serializing per-key read-modify-write
    #[serde(default = "default_lock_shards")]
    pub lock_shards: usize,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            cache_capacity: default_cache_capacity(),
            store_timeout_ms: default_store_timeout(),
            sink_timeout_ms: default_sink_timeout(),
            lock_shards: default_lock_shards(),
        }
    }
}

fn default_cache_capacity() -> usize {
    10_000
}

fn default_store_timeout() -> u64 {
    250
}

fn default_sink_timeout() -> u64 {
    250
}

fn default_lock_shards() -> usize {
    64
}

impl WardenConfig {
    /// Parse configuration from a YAML document.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| WardenError::Config(format!("Failed to parse config: {}", e)))
    }

    /// Load layered configuration: the optional file at `path`, then
    /// `RATEWARDEN__*` environment variables on top.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let config: WardenConfig = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Check every limiter definition and the governor tuning.
    pub fn validate(&self) -> Result<()> {
        if self.governor.lock_shards == 0 {
            return Err(WardenError::Config(
                "governor.lock_shards must be greater than 0".into(),
            ));
        }
        for (name, limiter) in &self.limiters {
            limiter
                .clone()
                .into_parts()
                .map_err(|e| WardenError::Config(format!("limiter '{}': {}", name, e)))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::WindowMode;

    #[test]
    fn test_defaults() {
        let config = WardenConfig::default();
        assert_eq!(config.server.listen_addr.port(), 8080);
        assert_eq!(config.server.sweep_interval_secs, 60);
        assert_eq!(config.governor.cache_capacity, 10_000);
        assert_eq!(config.governor.store_timeout_ms, 250);
        assert!(config.limiters.is_empty());
    }

    #[test]
    fn test_from_yaml_with_limiters() {
        let yaml = r#"
server:
  listen_addr: "0.0.0.0:9000"
governor:
  cache_capacity: 500
limiters:
  login:
    window_ms: 900000
    max_requests: 5
    progressive_penalty:
      enabled: true
  api:
    window_ms: 60000
    max_requests: 100
    sliding_window: true
    burst_allowance:
      max_burst: 20
      burst_window_ms: 1000
    whitelist: ["ip:10.0.0.1"]
"#;
        let config = WardenConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.server.listen_addr.port(), 9000);
        assert_eq!(config.server.sweep_interval_secs, 60);
        assert_eq!(config.governor.cache_capacity, 500);
        assert_eq!(config.governor.lock_shards, 64);

        let login = &config.limiters["login"];
        assert_eq!(login.rule.max_requests, 5);
        assert!(login.options.progressive_penalty.enabled);
        assert_eq!(login.options.progressive_penalty.multiplier, 2.0);

        let api = &config.limiters["api"];
        assert_eq!(api.options.window_mode(), WindowMode::Sliding);
        assert_eq!(api.options.burst_allowance.unwrap().max_burst, 20);
        assert!(api.options.whitelist.contains("ip:10.0.0.1"));

        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_limiter() {
        let yaml = r#"
limiters:
  broken:
    window_ms: 0
    max_requests: 5
"#;
        let config = WardenConfig::from_yaml(yaml).unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("broken"));
    }

    #[test]
    fn test_from_yaml_rejects_garbage() {
        assert!(WardenConfig::from_yaml("server: [").is_err());
    }

    #[test]
    fn test_load_without_file_uses_defaults() {
        let config = WardenConfig::load(None).unwrap();
        assert_eq!(config.governor.sink_timeout_ms, 250);
    }

    #[test]
    fn test_load_from_file() {
        let path = std::env::temp_dir().join(format!("ratewarden-{}.yaml", uuid::Uuid::new_v4()));
        std::fs::write(
            &path,
            "governor:\n  store_timeout_ms: 75\nlimiters:\n  api:\n    window_ms: 1000\n    max_requests: 3\n",
        )
        .unwrap();

        let config = WardenConfig::load(Some(&path)).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(config.governor.store_timeout_ms, 75);
        assert_eq!(config.limiters["api"].rule.max_requests, 3);
    }
}
