//! Configuration for the juggler server and broker.
//!
//! Supports YAML file and environment variable overrides.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Environment variable controlling the tracing filter.
pub const LOG_ENV_VAR: &str = "JUGGLER_LOG";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Server listener and per-connection knobs.
    pub server: ServerConfig,
    /// Broker timing and queueing knobs.
    pub broker: BrokerConfig,
    /// Redis backend settings.
    pub redis: RedisConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to.
    pub host: String,
    /// Port for the websocket listener.
    pub port: u16,
    /// Outbound frame queue per connection; overflow closes the connection.
    pub writer_queue_capacity: usize,
    /// Queue feeding the per-connection handler hook task.
    pub handler_queue_capacity: usize,
    /// Upper clamp applied to client-requested call timeouts.
    pub max_call_timeout_ms: u64,
    /// Interval of the pending-call expiration sweep.
    pub expiration_sweep_interval_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 9000,
            writer_queue_capacity: 256,
            handler_queue_capacity: 64,
            max_call_timeout_ms: 120_000,
            expiration_sweep_interval_ms: 100,
        }
    }
}

impl ServerConfig {
    pub fn max_call_timeout(&self) -> Duration {
        Duration::from_millis(self.max_call_timeout_ms)
    }

    pub fn expiration_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.expiration_sweep_interval_ms)
    }
}

/// Broker configuration.
///
/// `default_call_timeout_ms` replaces any process-wide default: callers that
/// submit a zero timeout get this value, and nothing ever goes below 1 ms.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Expiration applied to calls submitted without a timeout.
    pub default_call_timeout_ms: u64,
    /// Bound on each blocking dequeue cycle in the calls pump.
    pub blocking_timeout_ms: u64,
    /// Capacity of the per-stream delivery queue; overflow drops the oldest.
    pub stream_queue_capacity: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            default_call_timeout_ms: 60_000,
            blocking_timeout_ms: 5_000,
            stream_queue_capacity: 64,
        }
    }
}

impl BrokerConfig {
    /// The effective timeout for a submitted call: zero falls back to the
    /// configured default, and the floor is 1 ms.
    pub fn effective_call_timeout(&self, requested: Duration) -> Duration {
        let t = if requested.is_zero() {
            Duration::from_millis(self.default_call_timeout_ms)
        } else {
            requested
        };
        t.max(Duration::from_millis(1))
    }

    pub fn blocking_timeout(&self) -> Duration {
        Duration::from_millis(self.blocking_timeout_ms)
    }
}

/// Redis backend configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    /// Redis connection URL.
    pub url: String,
    /// Enforce cluster-slot locality on callee queue groups.
    pub cluster: bool,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            cluster: false,
        }
    }
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Priority (highest to lowest):
    /// 1. Environment variables
    /// 2. Config file
    /// 3. Defaults
    pub fn load() -> Result<Self, ConfigError> {
        let config_path =
            std::env::var("JUGGLER_CONFIG").unwrap_or_else(|_| "config.yaml".to_string());

        let mut config = if Path::new(&config_path).exists() {
            Self::from_file(&config_path)?
        } else {
            Self::default()
        };

        config.apply_env_overrides();

        Ok(config)
    }

    /// Load configuration from a YAML file.
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::FileRead(path.to_string(), e.to_string()))?;

        serde_yaml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Apply environment variable overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var("JUGGLER_HOST") {
            self.server.host = host;
        }

        if let Ok(port) = std::env::var("JUGGLER_PORT") {
            if let Ok(p) = port.parse() {
                self.server.port = p;
            }
        }

        if let Ok(url) = std::env::var("JUGGLER_REDIS_URL") {
            self.redis.url = url;
        }

        if let Ok(timeout) = std::env::var("JUGGLER_DEFAULT_CALL_TIMEOUT_MS") {
            if let Ok(t) = timeout.parse() {
                self.broker.default_call_timeout_ms = t;
            }
        }
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{0}': {1}")]
    FileRead(String, String),

    #[error("Failed to parse config: {0}")]
    Parse(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = Config::default();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.broker.default_call_timeout_ms, 60_000);
        assert_eq!(config.broker.stream_queue_capacity, 64);
        assert_eq!(config.redis.url, "redis://localhost:6379");
        assert!(!config.redis.cluster);
    }

    #[test]
    fn parse_yaml() {
        let yaml = r#"
server:
  host: 127.0.0.1
  port: 9400

broker:
  default_call_timeout_ms: 5000
  stream_queue_capacity: 16

redis:
  url: redis://redis.internal:6379
  cluster: true
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 9400);
        assert_eq!(config.broker.default_call_timeout_ms, 5000);
        assert_eq!(config.broker.stream_queue_capacity, 16);
        assert!(config.redis.cluster);
        // unspecified fields keep their defaults
        assert_eq!(config.server.writer_queue_capacity, 256);
    }

    #[test]
    fn timeout_clamps() {
        let broker = BrokerConfig::default();
        assert_eq!(
            broker.effective_call_timeout(Duration::ZERO),
            Duration::from_millis(60_000)
        );
        assert_eq!(
            broker.effective_call_timeout(Duration::from_nanos(10)),
            Duration::from_millis(1)
        );
        assert_eq!(
            broker.effective_call_timeout(Duration::from_secs(2)),
            Duration::from_secs(2)
        );
    }
}
