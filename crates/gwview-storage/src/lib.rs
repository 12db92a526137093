//! # Gateway View Storage
//!
//! `ViewStore` backends for materialized gateway views:
//!
//! - [`MemoryStore`]: per-network maps, for tests and local runs
//! - [`SqlStore`]: one table per network, one upsert per gateway
//! - [`WideColumnStore`]: batched key-value items (DynamoDB in production)
//! - [`ReadOnlyStore`]: live reconstruction from the source-of-truth services
//!
//! The backend is chosen once at startup by [`build_store`].

pub mod batch;
pub mod codec;
pub mod dynamo;
pub mod memory;
pub mod read_only;
pub mod services;
pub mod sql;
pub mod wide_column;

pub use batch::{chunk_keys, BatchOutcome, MAX_BATCH_ATTEMPTS, MAX_BATCH_SIZE};
pub use dynamo::DynamoDbClient;
pub use memory::MemoryStore;
pub use read_only::ReadOnlyStore;
pub use services::{http_services, HttpConfigurationService, HttpStatusService, MemorySourceOfTruth};
pub use sql::{SqlDialect, SqlStore};
pub use wide_column::{MemoryWideColumnClient, WideColumnClient, WideColumnStore};

use gwview_core::config::{StorageBackendKind, ViewSyncConfig};
use gwview_core::prelude::*;
use std::sync::Arc;
use tracing::info;

/// Build the configured view store
pub async fn build_store(
    config: &ViewSyncConfig,
    registry: Arc<ConfigRegistry>,
    configurations: Arc<dyn ConfigurationService>,
    statuses: Arc<dyn StatusService>,
) -> Result<Arc<dyn ViewStore>> {
    let store: Arc<dyn ViewStore> = match config.storage.backend {
        StorageBackendKind::Memory => Arc::new(MemoryStore::new()),
        StorageBackendKind::Sql => Arc::new(SqlStore::connect(&config.storage.sql, registry).await?),
        StorageBackendKind::WideColumn => {
            let client = DynamoDbClient::from_config(&config.storage.wide_column).await;
            Arc::new(WideColumnStore::new(client, registry))
        }
        StorageBackendKind::ReadOnly => {
            Arc::new(ReadOnlyStore::new(configurations, statuses, registry))
        }
    };

    info!(backend = store.backend_name(), "View store ready");
    Ok(store)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_factory_selects_backend() {
        let truth = Arc::new(MemorySourceOfTruth::new());
        let registry = Arc::new(ConfigRegistry::new());

        let mut config = ViewSyncConfig::default();
        config.storage.backend = StorageBackendKind::Memory;
        let store = build_store(&config, registry.clone(), truth.clone(), truth.clone())
            .await
            .unwrap();
        assert_eq!(store.backend_name(), "memory");

        config.storage.backend = StorageBackendKind::ReadOnly;
        let store = build_store(&config, registry, truth.clone(), truth).await.unwrap();
        assert_eq!(store.backend_name(), "read_only");
        assert!(store.health_check().await.is_ok());
    }
}
