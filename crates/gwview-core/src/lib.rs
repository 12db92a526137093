//! # Gateway View Core
//!
//! Core types, registry, decoder and strategy traits for the gateway view
//! pipeline: a materialized, per-gateway view of config, status and
//! registration state derived from change events.
//!
//! ## Architecture
//!
//! ```text
//! source tables ──► per-category change topics
//!                          │
//!                    ┌─────▼──────┐      ┌──────────┐      ┌───────────┐
//!                    │ Aggregator │─────►│ unified  │─────►│ Recorder  │
//!                    │  (decode,  │      │  topic   │      │ (decode,  │
//!                    │  publish)  │      └──────────┘      │  apply)   │
//!                    └────────────┘                        └─────┬─────┘
//!                                                                │
//!                                                          ┌─────▼─────┐
//!                                                          │ ViewStore │
//!                                                          └───────────┘
//! ```

pub mod config;
pub mod decoder;
pub mod error;
pub mod message;
pub mod metrics;
pub mod registry;
pub mod state;
pub mod strategy;

pub use crate::config::*;
pub use decoder::*;
pub use error::*;
pub use message::*;
pub use crate::metrics::*;
pub use registry::*;
pub use state::*;
pub use strategy::*;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::config::ViewSyncConfig;
    pub use crate::error::{GatewayError, Result};
    pub use crate::message::{
        BrokerMessage, GatewayConfigUpdate, GatewayRecordUpdate, GatewayStatusUpdate,
        GatewayUpdate, Operation, UpdatePayload, UpdateType,
    };
    pub use crate::registry::{ConfigManager, ConfigRegistry};
    pub use crate::state::{GatewayRecord, GatewayState, GatewayStatus, GatewayUpdateParams};
    pub use crate::strategy::{
        ConfigurationService, HealthCheck, Lifecycle, MessageSink, MessageSource,
        StatusService, ViewMap, ViewStore,
    };
}
