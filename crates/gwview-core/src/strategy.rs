//! Strategy Pattern Traits for the gateway view pipeline
//!
//! Each trait is a seam where an implementation is chosen at process start:
//! the broker the workers talk to, the store the views live in, and the
//! source-of-truth services the read-only store reconstructs from.
//!
//! ## Strategy Hierarchy
//!
//! ```text
//! Lifecycle (start/stop)
//!     │
//!     ├── MessageSource (consumes from the broker)
//!     │       └── JetStreamSource, MemorySource
//!     │
//!     └── MessageSink (publishes to the broker)
//!             └── JetStreamSink, MemorySink
//!
//! ViewStore (materialized views)
//!     └── MemoryStore, SqlStore, WideColumnStore, ReadOnlyStore
//!
//! ConfigurationService / StatusService (source of truth)
//!     └── HttpConfigurationService, HttpStatusService, MemorySourceOfTruth
//! ```

use crate::error::Result;
use crate::message::BrokerMessage;
use crate::state::{GatewayState, GatewayUpdateParams};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};

/// Gateway views keyed by gateway ID
pub type ViewMap = HashMap<String, GatewayState>;

// ============================================================================
// Lifecycle Management
// ============================================================================

/// Lifecycle management for components
///
/// Provides graceful startup and shutdown semantics.
#[async_trait]
pub trait Lifecycle: Send + Sync {
    /// Start the component
    ///
    /// Called once before any operations. Should establish connections
    /// and prepare for operation.
    async fn start(&self) -> Result<()>;

    /// Stop the component gracefully
    async fn stop(&self) -> Result<()>;

    /// Check if the component is running
    fn is_running(&self) -> bool;
}

/// Health check capability
#[async_trait]
pub trait HealthCheck: Send + Sync {
    /// Returns Ok(()) if healthy, Err with details if not.
    async fn health_check(&self) -> Result<()>;

    /// Get component name for health reporting
    fn component_name(&self) -> &'static str;
}

// ============================================================================
// Transport Strategies
// ============================================================================

/// Message source strategy - consumes from the broker
#[async_trait]
pub trait MessageSource: Lifecycle + HealthCheck {
    /// Wait for the next message.
    ///
    /// Returns `Ok(None)` when no message arrived within the source's poll
    /// window, so callers can check their stop flag between waits.
    async fn next_message(&self) -> Result<Option<BrokerMessage>>;

    /// Commit the consumer position past `message`.
    ///
    /// Called only after the message has been fully processed.
    async fn commit(&self, message: &BrokerMessage) -> Result<()>;
}

/// Message sink strategy - publishes to the broker
#[async_trait]
pub trait MessageSink: Lifecycle + HealthCheck {
    /// Publish one message keyed by `key`.
    ///
    /// Returns only after the broker has confirmed the message is stored.
    async fn publish(&self, topic: &str, key: &str, payload: Bytes) -> Result<()>;

    /// Flush any buffered messages
    async fn flush(&self) -> Result<()>;
}

// ============================================================================
// Storage Strategy
// ============================================================================

/// Materialized gateway view storage. All operations are scoped to a network.
#[async_trait]
pub trait ViewStore: HealthCheck {
    /// All views of a network
    async fn get_views_for_network(&self, network_id: &str) -> Result<ViewMap>;

    /// Views of the named gateways
    async fn get_views(&self, network_id: &str, gateway_ids: &[String]) -> Result<ViewMap>;

    /// Apply updates, creating views that do not exist yet
    async fn update_or_create(
        &self,
        network_id: &str,
        updates: BTreeMap<String, GatewayUpdateParams>,
    ) -> Result<()>;

    /// Delete whole views
    async fn delete(&self, network_id: &str, gateway_ids: &[String]) -> Result<()>;

    /// Provision schema; idempotent
    async fn init_tables(&self) -> Result<()>;

    /// Backend name for logging and health reporting
    fn backend_name(&self) -> &'static str;
}

// ============================================================================
// Source-of-Truth Strategies
// ============================================================================

/// Read access to the configuration service
#[async_trait]
pub trait ConfigurationService: Send + Sync {
    /// Gateways registered in a network. Fails if the network is unknown.
    async fn list_gateway_ids(&self, network_id: &str) -> Result<Vec<String>>;

    /// Serialized registration record (physical device) of a gateway
    async fn load_record(&self, network_id: &str, gateway_id: &str) -> Result<Vec<u8>>;

    /// Serialized configs of a gateway keyed by config type
    async fn load_configs(
        &self,
        network_id: &str,
        gateway_id: &str,
    ) -> Result<BTreeMap<String, Vec<u8>>>;
}

/// Read access to reported gateway status
#[async_trait]
pub trait StatusService: Send + Sync {
    /// Serialized status, `None` if the gateway never reported
    async fn load_status(&self, network_id: &str, gateway_id: &str) -> Result<Option<Vec<u8>>>;
}
