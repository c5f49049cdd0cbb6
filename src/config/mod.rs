//! Transport configuration.
//!
//! Loaded from YAML files or environment variables; every field has a
//! default suitable for local development against a localhost broker.

use std::time::Duration;

use serde::Deserialize;

use crate::error::{Result, TransportError};

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "courier.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "COURIER_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "COURIER";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "COURIER_LOG";

/// Main transport configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Broker connection settings.
    pub broker: BrokerConfig,
    /// Event pub/sub settings.
    pub events: EventsConfig,
    /// RPC call settings.
    pub rpc: RpcConfig,
    /// Consumer redelivery settings.
    pub consumer: ConsumerConfig,
    /// Schema codec settings.
    pub schema: SchemaConfig,
}

/// Broker connection settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// AMQP connection URL (e.g., amqp://localhost:5672).
    pub url: String,
    /// Heartbeat interval in seconds (0 = broker default).
    pub heartbeat_secs: u16,
    /// Fixed delay between reconnection attempts, in milliseconds.
    pub reconnect_delay_ms: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: "amqp://localhost:5672".to_string(),
            heartbeat_secs: 30,
            reconnect_delay_ms: 5000,
        }
    }
}

impl BrokerConfig {
    /// Connection URI with the heartbeat parameter applied.
    ///
    /// A heartbeat already present in the configured URL wins.
    pub fn amqp_uri(&self) -> String {
        if self.heartbeat_secs == 0 || self.url.contains("heartbeat=") {
            return self.url.clone();
        }
        let sep = if self.url.contains('?') { '&' } else { '?' };
        format!("{}{}heartbeat={}", self.url, sep, self.heartbeat_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

/// Event pub/sub settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    /// Topic exchange events are published to.
    pub exchange: String,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            exchange: "courier.events".to_string(),
        }
    }
}

/// Reply address strategy for RPC calls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReplyMode {
    /// Per-client exclusive auto-delete queue. Works on any AMQP broker.
    #[default]
    ExclusiveQueue,
    /// RabbitMQ's `amq.rabbitmq.reply-to` pseudo-queue.
    DirectReplyTo,
}

/// RPC call settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    /// Default time to wait for a reply, in milliseconds.
    pub default_timeout_ms: u64,
    /// Reply address strategy.
    pub reply: ReplyMode,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 5000,
            reply: ReplyMode::ExclusiveQueue,
        }
    }
}

impl RpcConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }
}

/// Consumer redelivery settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// Redelivery attempts before a message is considered poisoned.
    pub max_retries: u32,
    /// Route poisoned messages to `<queue>.dlq` instead of dropping them.
    pub dead_letter: bool,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            dead_letter: true,
        }
    }
}

/// Schema codec settings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SchemaConfig {
    /// Path to a compiled protobuf `FileDescriptorSet`.
    pub descriptor_path: Option<String>,
}

impl TransportConfig {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `courier.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `COURIER_CONFIG` environment variable (if set)
    /// 4. Environment variables with `COURIER` prefix (e.g. `COURIER__BROKER__URL`)
    pub fn load(path: Option<&str>) -> Result<Self> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize().map_err(TransportError::from)
    }

    /// Create config for testing.
    pub fn for_test() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_defaults() {
        let config = TransportConfig::default();
        assert_eq!(config.broker.url, "amqp://localhost:5672");
        assert_eq!(config.broker.reconnect_delay(), Duration::from_secs(5));
        assert_eq!(config.events.exchange, "courier.events");
        assert_eq!(config.rpc.default_timeout(), Duration::from_secs(5));
        assert_eq!(config.rpc.reply, ReplyMode::ExclusiveQueue);
        assert_eq!(config.consumer.max_retries, 3);
        assert!(config.consumer.dead_letter);
        assert!(config.schema.descriptor_path.is_none());
    }

    #[test]
    fn test_amqp_uri_appends_heartbeat() {
        let broker = BrokerConfig {
            url: "amqp://broker:5672".to_string(),
            heartbeat_secs: 15,
            ..Default::default()
        };
        assert_eq!(broker.amqp_uri(), "amqp://broker:5672?heartbeat=15");
    }

    #[test]
    fn test_amqp_uri_respects_existing_heartbeat() {
        let broker = BrokerConfig {
            url: "amqp://broker:5672?heartbeat=60".to_string(),
            heartbeat_secs: 15,
            ..Default::default()
        };
        assert_eq!(broker.amqp_uri(), "amqp://broker:5672?heartbeat=60");
    }

    #[test]
    fn test_amqp_uri_zero_heartbeat_untouched() {
        let broker = BrokerConfig {
            url: "amqp://broker:5672".to_string(),
            heartbeat_secs: 0,
            ..Default::default()
        };
        assert_eq!(broker.amqp_uri(), "amqp://broker:5672");
    }

    #[test]
    #[serial]
    fn test_env_override() {
        std::env::set_var("COURIER__BROKER__URL", "amqp://rabbit.staging:5672");
        std::env::set_var("COURIER__RPC__DEFAULT_TIMEOUT_MS", "10000");

        let config = TransportConfig::load(None).expect("load config");
        assert_eq!(config.broker.url, "amqp://rabbit.staging:5672");
        assert_eq!(config.rpc.default_timeout_ms, 10000);

        std::env::remove_var("COURIER__BROKER__URL");
        std::env::remove_var("COURIER__RPC__DEFAULT_TIMEOUT_MS");
    }

    #[test]
    #[serial]
    fn test_yaml_file_load() {
        use std::io::Write;

        let mut file = tempfile::Builder::new()
            .suffix(".yaml")
            .tempfile()
            .expect("temp file");
        writeln!(
            file,
            "broker:\n  url: amqp://rabbit.test:5672\nconsumer:\n  max_retries: 7\n  dead_letter: false"
        )
        .expect("write yaml");

        let config =
            TransportConfig::load(Some(file.path().to_str().expect("path"))).expect("load config");
        assert_eq!(config.broker.url, "amqp://rabbit.test:5672");
        assert_eq!(config.consumer.max_retries, 7);
        assert!(!config.consumer.dead_letter);
        // untouched sections keep their defaults
        assert_eq!(config.rpc.default_timeout_ms, 5000);
    }
}
