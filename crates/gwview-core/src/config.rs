//! Configuration types for the gateway view pipeline
//!
//! Uses the `config` crate for layered configuration from files and environment.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::GatewayError;
use crate::registry::ConfigTypeSpec;

/// Root configuration shared by every binary
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ViewSyncConfig {
    #[serde(default)]
    pub broker: BrokerConfig,

    #[serde(default)]
    pub aggregator: AggregatorConfig,

    #[serde(default)]
    pub recorder: RecorderConfig,

    /// Unified update stream
    #[serde(default)]
    pub unified: UnifiedStreamConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    /// Source-of-truth services
    #[serde(default)]
    pub services: ServicesConfig,

    /// Config types to register at startup
    #[serde(default)]
    pub config_types: Vec<ConfigTypeSpec>,

    #[serde(default)]
    pub observability: ObservabilityConfig,
}

// ============================================================================
// Broker Configuration
// ============================================================================

/// NATS connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(default = "default_broker_url")]
    pub url: String,

    /// Connection name (for monitoring)
    #[serde(default = "default_connection_name")]
    pub connection_name: String,

    /// Acknowledgement wait time for consumers
    #[serde(with = "humantime_serde", default = "default_ack_wait")]
    pub ack_wait: Duration,
}

fn default_broker_url() -> String {
    "nats://localhost:4222".to_string()
}

fn default_connection_name() -> String {
    "gateway-view-sync".to_string()
}

fn default_ack_wait() -> Duration {
    Duration::from_secs(30)
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: default_broker_url(),
            connection_name: default_connection_name(),
            ack_wait: default_ack_wait(),
        }
    }
}

// ============================================================================
// Worker Configurations
// ============================================================================

/// Aggregator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatorConfig {
    /// Stream holding the per-network change topics
    #[serde(default = "default_cdc_stream")]
    pub cdc_stream: String,

    /// Retention of the change stream when this process creates it
    #[serde(with = "humantime_serde", default = "default_cdc_max_age")]
    pub cdc_max_age: Duration,

    /// Leading component of every change topic name
    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,

    /// Durable consumer name
    #[serde(default = "default_aggregator_consumer")]
    pub consumer: String,

    /// Bound on waiting for a publish confirmation
    #[serde(with = "humantime_serde", default = "default_delivery_timeout")]
    pub delivery_timeout: Duration,

    /// Bound on a single wait for the next message
    #[serde(with = "humantime_serde", default = "default_poll_timeout")]
    pub poll_timeout: Duration,
}

fn default_cdc_stream() -> String {
    "GATEWAY_CDC".to_string()
}

fn default_cdc_max_age() -> Duration {
    Duration::from_secs(24 * 60 * 60)
}

fn default_topic_prefix() -> String {
    "cdc".to_string()
}

fn default_aggregator_consumer() -> String {
    "gwview-aggregator".to_string()
}

fn default_delivery_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_poll_timeout() -> Duration {
    Duration::from_secs(1)
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            cdc_stream: default_cdc_stream(),
            cdc_max_age: default_cdc_max_age(),
            topic_prefix: default_topic_prefix(),
            consumer: default_aggregator_consumer(),
            delivery_timeout: default_delivery_timeout(),
            poll_timeout: default_poll_timeout(),
        }
    }
}

/// Recorder configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecorderConfig {
    /// Durable consumer name
    #[serde(default = "default_recorder_consumer")]
    pub consumer: String,

    /// Config types whose updates are dropped
    #[serde(default)]
    pub retired_config_types: Vec<String>,

    /// Bound on a single wait for the next message
    #[serde(with = "humantime_serde", default = "default_poll_timeout")]
    pub poll_timeout: Duration,
}

fn default_recorder_consumer() -> String {
    "gwview-recorder".to_string()
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            consumer: default_recorder_consumer(),
            retired_config_types: Vec::new(),
            poll_timeout: default_poll_timeout(),
        }
    }
}

/// Unified update stream configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnifiedStreamConfig {
    #[serde(default = "default_unified_stream")]
    pub stream: String,

    #[serde(default = "default_unified_topic")]
    pub topic: String,

    /// Retention of the unified stream
    #[serde(with = "humantime_serde", default = "default_max_age")]
    pub max_age: Duration,
}

fn default_unified_stream() -> String {
    "GATEWAY_VIEW_UPDATES".to_string()
}

fn default_unified_topic() -> String {
    "gateway_view_updates".to_string()
}

fn default_max_age() -> Duration {
    Duration::from_secs(7 * 24 * 60 * 60)
}

impl Default for UnifiedStreamConfig {
    fn default() -> Self {
        Self {
            stream: default_unified_stream(),
            topic: default_unified_topic(),
            max_age: default_max_age(),
        }
    }
}

// ============================================================================
// Storage Configuration
// ============================================================================

/// Which view store backs the process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackendKind {
    Memory,
    Sql,
    WideColumn,
    ReadOnly,
}

/// SQL placeholder and upsert conventions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SqlDialectKind {
    Postgres,
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_backend")]
    pub backend: StorageBackendKind,

    #[serde(default)]
    pub sql: SqlConfig,

    #[serde(default)]
    pub wide_column: WideColumnConfig,
}

fn default_backend() -> StorageBackendKind {
    StorageBackendKind::Sql
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            sql: SqlConfig::default(),
            wide_column: WideColumnConfig::default(),
        }
    }
}

/// Relational backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SqlConfig {
    #[serde(default = "default_sql_url")]
    pub url: String,

    #[serde(default = "default_dialect")]
    pub dialect: SqlDialectKind,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_sql_url() -> String {
    "postgres://localhost:5432/gateway_views".to_string()
}

fn default_dialect() -> SqlDialectKind {
    SqlDialectKind::Postgres
}

fn default_max_connections() -> u32 {
    8
}

impl Default for SqlConfig {
    fn default() -> Self {
        Self {
            url: default_sql_url(),
            dialect: default_dialect(),
            max_connections: default_max_connections(),
        }
    }
}

/// Wide-column backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WideColumnConfig {
    #[serde(default = "default_table")]
    pub table: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,

    /// Endpoint override (local emulators)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
}

fn default_table() -> String {
    "gateway_views".to_string()
}

impl Default for WideColumnConfig {
    fn default() -> Self {
        Self {
            table: default_table(),
            region: None,
            endpoint: None,
        }
    }
}

// ============================================================================
// Source-of-Truth Services
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServicesConfig {
    /// Configuration service base URL
    #[serde(default = "default_configurator_url")]
    pub configurator_url: String,

    /// Gateway status service base URL
    #[serde(default = "default_state_url")]
    pub state_url: String,

    #[serde(with = "humantime_serde", default = "default_connect_timeout")]
    pub connect_timeout: Duration,

    #[serde(with = "humantime_serde", default = "default_request_timeout")]
    pub request_timeout: Duration,
}

fn default_configurator_url() -> String {
    "http://localhost:9100".to_string()
}

fn default_state_url() -> String {
    "http://localhost:9101".to_string()
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

impl Default for ServicesConfig {
    fn default() -> Self {
        Self {
            configurator_url: default_configurator_url(),
            state_url: default_state_url(),
            connect_timeout: default_connect_timeout(),
            request_timeout: default_request_timeout(),
        }
    }
}

// ============================================================================
// Observability
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log format: "json" or "pretty"
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

// ============================================================================
// Configuration Loading
// ============================================================================

impl ViewSyncConfig {
    /// Load configuration from file and environment
    pub fn load(path: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();

        builder = builder.add_source(config::Config::try_from(&Self::default())?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path));
        }

        // Environment variables with prefix GWVIEW_, e.g. GWVIEW_STORAGE__BACKEND
        builder = builder.add_source(
            config::Environment::with_prefix("GWVIEW")
                .separator("__")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }

    /// Reject settings that would only fail once messages flow
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.aggregator.topic_prefix.is_empty() {
            return Err(GatewayError::config("aggregator.topic_prefix is empty"));
        }
        if self.unified.topic.is_empty() {
            return Err(GatewayError::config("unified.topic is empty"));
        }
        if self.aggregator.delivery_timeout.is_zero() {
            return Err(GatewayError::config("aggregator.delivery_timeout must be positive"));
        }
        if self.storage.backend == StorageBackendKind::Sql && self.storage.sql.url.is_empty() {
            return Err(GatewayError::config("storage.sql.url is required for the sql backend"));
        }

        let mut seen = std::collections::HashSet::new();
        for spec in &self.config_types {
            if !seen.insert(spec.name.as_str()) {
                return Err(GatewayError::config(format!(
                    "config type {} is declared twice",
                    spec.name
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ConfigScopeKind;
    use std::io::Write;

    #[test]
    fn test_defaults_roundtrip_through_loader() {
        let config = ViewSyncConfig::load(None).unwrap();
        assert_eq!(config.storage.backend, StorageBackendKind::Sql);
        assert_eq!(config.aggregator.topic_prefix, "cdc");
        assert_eq!(config.aggregator.delivery_timeout, Duration::from_secs(10));
        assert_eq!(config.unified.topic, "gateway_view_updates");
        assert_eq!(config.aggregator.cdc_max_age, Duration::from_secs(86_400));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_settings() {
        let mut config = ViewSyncConfig::default();
        config.aggregator.delivery_timeout = Duration::ZERO;
        assert!(matches!(
            config.validate(),
            Err(GatewayError::Configuration { .. })
        ));

        let mut config = ViewSyncConfig::default();
        let spec = ConfigTypeSpec {
            name: "mme".into(),
            scope: ConfigScopeKind::Gateway,
        };
        config.config_types = vec![spec.clone(), spec];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[storage]
backend = "wide_column"

[recorder]
retired_config_types = ["legacy_mesh"]

[[config_types]]
name = "cellular_gateway"
scope = "gateway"
"#
        )
        .unwrap();

        let path = file.path().to_str().unwrap().to_string();
        let config = ViewSyncConfig::load(Some(&path)).unwrap();
        assert_eq!(config.storage.backend, StorageBackendKind::WideColumn);
        assert_eq!(config.recorder.retired_config_types, vec!["legacy_mesh"]);
        assert_eq!(config.config_types.len(), 1);
    }
}
