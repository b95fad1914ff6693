//! Connector configuration.
//!
//! Configuration is read from a TOML file and then overridden by
//! `MESSAGE_CONNECTOR_*` environment variables. Every section has defaults,
//! so an empty file (or no file at all) yields a working local setup.
//!
//! ```toml
//! [headers]
//! event_type = "eventType"
//!
//! [lock]
//! timeout_ms = 5000
//!
//! [dispatch]
//! max_retries = 5
//!
//! [transport]
//! brokers = "redpanda:9092"
//! input_topic = "message-events"
//!
//! [store]
//! postgres_url = "postgres://connector@db/connector"
//! ```
//!
//! | Variable | Field |
//! |---|---|
//! | `MESSAGE_CONNECTOR_CONFIG` | path of the TOML file |
//! | `MESSAGE_CONNECTOR_BROKERS` | `transport.brokers` |
//! | `MESSAGE_CONNECTOR_INPUT_TOPIC` | `transport.input_topic` |
//! | `MESSAGE_CONNECTOR_OUTPUT_TOPIC` | `transport.output_topic` |
//! | `MESSAGE_CONNECTOR_ERROR_TOPIC` | `transport.error_topic` |
//! | `MESSAGE_CONNECTOR_CONSUMER_GROUP` | `transport.consumer_group` |
//! | `MESSAGE_CONNECTOR_LOCK_TIMEOUT_MS` | `lock.timeout_ms` |
//! | `MESSAGE_CONNECTOR_POSTGRES_URL` | `store.postgres_url` |
//! | `MESSAGE_CONNECTOR_LOG` | `observability.log_filter` |
//!
//! # Example
//!
//! ```no_run
//! use message_connector_runtime::config::ConnectorConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ConnectorConfig::from_env()?;
//! println!("Consuming {}", config.transport.input_topic);
//! # Ok(())
//! # }
//! ```

use crate::retry::RetryPolicy;
use message_connector_core::HeaderNames;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Environment variable holding the configuration file path.
pub const CONFIG_PATH_VAR: &str = "MESSAGE_CONNECTOR_CONFIG";

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The configuration file could not be read
    #[error("Failed to read configuration file '{path}': {source}")]
    Io {
        /// File path
        path: String,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// The configuration file is not valid TOML for this schema
    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// An environment override could not be parsed
    #[error("Invalid value '{value}' for {var}")]
    InvalidValue {
        /// Variable name
        var: String,
        /// Offending value
        value: String,
    },

    /// A value is out of range
    #[error("Configuration validation failed: {0}")]
    Validation(String),
}

/// Lock acquisition settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Bound on the wait for a correlation lock; waits indefinitely when unset
    pub timeout_ms: Option<u64>,
}

impl LockConfig {
    /// Lock timeout as a duration.
    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

/// Dispatch retry settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Retries after the first attempt
    pub max_retries: usize,
    /// Delay before the first retry
    pub initial_delay_ms: u64,
    /// Cap on the delay between retries
    pub max_delay_ms: u64,
    /// Growth factor between delays
    pub multiplier: f64,
}

impl DispatchConfig {
    /// Validate dispatch settings.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] if a value is out of range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.multiplier < 1.0 || !self.multiplier.is_finite() {
            return Err(ConfigError::Validation("dispatch.multiplier must be >= 1.0".to_string()));
        }
        if self.max_delay_ms < self.initial_delay_ms {
            return Err(ConfigError::Validation(
                "dispatch.max_delay_ms must be >= dispatch.initial_delay_ms".to_string(),
            ));
        }
        Ok(())
    }

    /// Retry policy for output dispatch.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::builder()
            .max_retries(self.max_retries)
            .initial_delay(Duration::from_millis(self.initial_delay_ms))
            .max_delay(Duration::from_millis(self.max_delay_ms))
            .multiplier(self.multiplier)
            .build()
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 100,
            max_delay_ms: 5_000,
            multiplier: 2.0,
        }
    }
}

/// Idempotent receiver settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdempotencyConfig {
    /// Drop redelivered messages by id
    pub enabled: bool,
    /// Number of message ids remembered
    pub capacity: usize,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            capacity: 100_000,
        }
    }
}

/// Dead-letter queue settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeadLetterConfig {
    /// Messages kept before the oldest is dropped
    pub max_size: usize,
}

impl Default for DeadLetterConfig {
    fn default() -> Self {
        Self { max_size: 1_000 }
    }
}

/// Broker settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Comma-separated bootstrap servers
    pub brokers: String,
    /// Topic carrying BPMN message events
    pub input_topic: String,
    /// Topic for released commands without a destination header
    pub output_topic: String,
    /// Topic for discarded and undecodable messages; in-memory queue when unset
    pub error_topic: Option<String>,
    /// Consumer group id
    pub consumer_group: String,
    /// Consumers started in the consumer group
    pub concurrency: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            brokers: "localhost:9092".to_string(),
            input_topic: "message-events".to_string(),
            output_topic: "message-commands".to_string(),
            error_topic: None,
            consumer_group: "message-connector".to_string(),
            concurrency: 16,
        }
    }
}

/// Message group and lock storage.
///
/// Without a `postgres_url` groups and locks live in process memory: pending
/// messages are lost on restart and only one connector instance may consume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Database holding message groups and advisory locks
    pub postgres_url: Option<String>,
    /// Size of the connection pool
    pub max_connections: u32,
    /// Pause between attempts on a lock held by another instance
    pub lock_poll_interval_ms: u64,
}

impl StoreConfig {
    /// Whether groups and locks are kept in `PostgreSQL`.
    #[must_use]
    pub const fn is_persistent(&self) -> bool {
        self.postgres_url.is_some()
    }

    /// Lock poll interval as a duration.
    #[must_use]
    pub const fn lock_poll_interval(&self) -> Duration {
        Duration::from_millis(self.lock_poll_interval_ms)
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            postgres_url: None,
            max_connections: 20,
            lock_poll_interval_ms: 100,
        }
    }
}

/// Logging and metrics settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// `tracing` filter directive, used when `RUST_LOG` is unset
    pub log_filter: String,
    /// Install the Prometheus recorder
    pub metrics_enabled: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_filter: "info".to_string(),
            metrics_enabled: true,
        }
    }
}

/// Complete connector configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectorConfig {
    /// Header names shared with producers
    pub headers: HeaderNames,
    /// Lock acquisition
    pub lock: LockConfig,
    /// Dispatch retry
    pub dispatch: DispatchConfig,
    /// Idempotent receiver
    pub idempotency: IdempotencyConfig,
    /// Dead-letter queue
    pub dead_letter: DeadLetterConfig,
    /// Broker
    pub transport: TransportConfig,
    /// Group and lock storage
    pub store: StoreConfig,
    /// Logging and metrics
    pub observability: ObservabilityConfig,
}

impl ConnectorConfig {
    /// Parse a TOML document. Missing sections and fields take their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] on malformed input.
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    /// Read and parse a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] or [`ConfigError::Parse`].
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    /// Load from the process environment and validate.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be loaded, an override is
    /// malformed, or validation fails.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load using `lookup` to read variables, then validate.
    ///
    /// Reads the file named by [`CONFIG_PATH_VAR`] if set, applies overrides,
    /// and validates the result.
    ///
    /// # Errors
    ///
    /// See [`ConnectorConfig::from_env`].
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = match lookup(CONFIG_PATH_VAR) {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_overrides(&lookup)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `MESSAGE_CONNECTOR_*` overrides read through `lookup`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] if a numeric override does not parse.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(brokers) = lookup("MESSAGE_CONNECTOR_BROKERS") {
            self.transport.brokers = brokers;
        }
        if let Some(topic) = lookup("MESSAGE_CONNECTOR_INPUT_TOPIC") {
            self.transport.input_topic = topic;
        }
        if let Some(topic) = lookup("MESSAGE_CONNECTOR_OUTPUT_TOPIC") {
            self.transport.output_topic = topic;
        }
        if let Some(topic) = lookup("MESSAGE_CONNECTOR_ERROR_TOPIC") {
            self.transport.error_topic = Some(topic);
        }
        if let Some(group) = lookup("MESSAGE_CONNECTOR_CONSUMER_GROUP") {
            self.transport.consumer_group = group;
        }
        if let Some(timeout) = lookup("MESSAGE_CONNECTOR_LOCK_TIMEOUT_MS") {
            self.lock.timeout_ms = Some(parse_var("MESSAGE_CONNECTOR_LOCK_TIMEOUT_MS", &timeout)?);
        }
        if let Some(url) = lookup("MESSAGE_CONNECTOR_POSTGRES_URL") {
            self.store.postgres_url = Some(url);
        }
        if let Some(filter) = lookup("MESSAGE_CONNECTOR_LOG") {
            self.observability.log_filter = filter;
        }
        Ok(())
    }

    /// Validate every section.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] describing the first invalid value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let headers = [
            ("headers.event_type", &self.headers.event_type),
            ("headers.correlation_id", &self.headers.correlation_id),
            ("headers.message_name", &self.headers.message_name),
            ("headers.correlation_key", &self.headers.correlation_key),
            ("headers.payload_type", &self.headers.payload_type),
        ];
        if let Some((field, _)) = headers.iter().find(|(_, name)| name.trim().is_empty()) {
            return Err(ConfigError::Validation(format!("{field} cannot be empty")));
        }

        self.dispatch.validate()?;

        if self.idempotency.enabled && self.idempotency.capacity == 0 {
            return Err(ConfigError::Validation("idempotency.capacity must be > 0".to_string()));
        }
        if self.dead_letter.max_size == 0 {
            return Err(ConfigError::Validation("dead_letter.max_size must be > 0".to_string()));
        }
        if self.transport.brokers.trim().is_empty() {
            return Err(ConfigError::Validation("transport.brokers cannot be empty".to_string()));
        }
        if self.transport.input_topic.trim().is_empty() || self.transport.output_topic.trim().is_empty() {
            return Err(ConfigError::Validation("transport topics cannot be empty".to_string()));
        }
        if self.transport.concurrency == 0 {
            return Err(ConfigError::Validation("transport.concurrency must be > 0".to_string()));
        }
        if self.store.postgres_url.as_deref().is_some_and(|url| url.trim().is_empty()) {
            return Err(ConfigError::Validation("store.postgres_url cannot be empty".to_string()));
        }
        if self.store.max_connections == 0 || self.store.lock_poll_interval_ms == 0 {
            return Err(ConfigError::Validation(
                "store.max_connections and store.lock_poll_interval_ms must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_var<T: FromStr>(var: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        var: var.to_string(),
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn defaults_are_valid() {
        let config = ConnectorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.headers.event_type, "eventType");
        assert_eq!(config.lock.timeout(), None);
        assert!(!config.store.is_persistent());
    }

    #[test]
    fn postgres_url_selects_persistent_store() {
        let config = ConnectorConfig::from_lookup(lookup(&[(
            "MESSAGE_CONNECTOR_POSTGRES_URL",
            "postgres://connector@db/connector",
        )]))
        .unwrap();
        assert!(config.store.is_persistent());
        assert_eq!(config.store.lock_poll_interval(), Duration::from_millis(100));

        let config = ConnectorConfig::from_toml_str(
            r#"
            [store]
            postgres_url = "postgres://db/groups"
            max_connections = 4
            "#,
        )
        .unwrap();
        assert_eq!(config.store.postgres_url.as_deref(), Some("postgres://db/groups"));
        assert_eq!(config.store.max_connections, 4);

        let result = ConnectorConfig::from_lookup(lookup(&[("MESSAGE_CONNECTOR_POSTGRES_URL", " ")]));
        assert!(matches!(result, Err(ConfigError::Validation(_))));
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = ConnectorConfig::from_toml_str(
            r#"
            [lock]
            timeout_ms = 250

            [headers]
            event_type = "type"
            "#,
        )
        .unwrap();

        assert_eq!(config.lock.timeout(), Some(Duration::from_millis(250)));
        assert_eq!(config.headers.event_type, "type");
        assert_eq!(config.headers.correlation_id, "correlationId");
        assert_eq!(config.dispatch, DispatchConfig::default());
    }

    #[test]
    fn malformed_toml_is_a_parse_error() {
        let result = ConnectorConfig::from_toml_str("[lock\ntimeout_ms = ");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn environment_overrides_file_values() {
        let config = ConnectorConfig::from_lookup(lookup(&[
            ("MESSAGE_CONNECTOR_BROKERS", "redpanda:29092"),
            ("MESSAGE_CONNECTOR_LOCK_TIMEOUT_MS", "1500"),
            ("MESSAGE_CONNECTOR_ERROR_TOPIC", "message-errors"),
        ]))
        .unwrap();

        assert_eq!(config.transport.brokers, "redpanda:29092");
        assert_eq!(config.lock.timeout_ms, Some(1500));
        assert_eq!(config.transport.error_topic.as_deref(), Some("message-errors"));
    }

    #[test]
    fn malformed_override_is_reported() {
        let result = ConnectorConfig::from_lookup(lookup(&[("MESSAGE_CONNECTOR_LOCK_TIMEOUT_MS", "soon")]));
        assert!(matches!(
            result,
            Err(ConfigError::InvalidValue { ref var, .. }) if var == "MESSAGE_CONNECTOR_LOCK_TIMEOUT_MS"
        ));
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let result = ConnectorConfig::from_lookup(lookup(&[(CONFIG_PATH_VAR, "/nonexistent/connector.toml")]));
        assert!(matches!(result, Err(ConfigError::Io { .. })));
    }

    #[test]
    fn validation_rejects_out_of_range_values() {
        let mut config = ConnectorConfig::default();
        config.headers.event_type = String::new();
        assert!(matches!(config.validate(), Err(ConfigError::Validation(_))));

        let mut config = ConnectorConfig::default();
        config.dispatch.multiplier = 0.5;
        assert!(config.validate().is_err());

        let mut config = ConnectorConfig::default();
        config.dead_letter.max_size = 0;
        assert!(config.validate().is_err());

        let mut config = ConnectorConfig::default();
        config.transport.concurrency = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn retry_policy_follows_dispatch_section() {
        let dispatch = DispatchConfig {
            max_retries: 7,
            initial_delay_ms: 10,
            max_delay_ms: 40,
            multiplier: 3.0,
        };
        let policy = dispatch.retry_policy();
        assert_eq!(policy.max_retries, 7);
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(10));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(30));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(40));
    }
}
