//! Read-only view store
//!
//! Rebuilds views on demand from the source-of-truth services. Used when
//! the materialized views are suspect; every mutation is refused.

use async_trait::async_trait;
use gwview_core::prelude::*;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

use crate::codec::{decode_configs, decode_record, decode_status};

pub struct ReadOnlyStore {
    configurations: Arc<dyn ConfigurationService>,
    statuses: Arc<dyn StatusService>,
    registry: Arc<ConfigRegistry>,
}

impl ReadOnlyStore {
    pub fn new(
        configurations: Arc<dyn ConfigurationService>,
        statuses: Arc<dyn StatusService>,
        registry: Arc<ConfigRegistry>,
    ) -> Self {
        Self {
            configurations,
            statuses,
            registry,
        }
    }

    async fn reconstruct(&self, network_id: &str, gateway_id: &str) -> Result<GatewayState> {
        let record = self.configurations.load_record(network_id, gateway_id).await?;
        let configs = self.configurations.load_configs(network_id, gateway_id).await?;
        let status = self.statuses.load_status(network_id, gateway_id).await?;

        Ok(GatewayState {
            gateway_id: gateway_id.to_string(),
            config: decode_configs(&self.registry, gateway_id, configs)?,
            status: decode_status(status.as_deref())?,
            record: decode_record(Some(&record))?,
            offset: 0,
        })
    }
}

#[async_trait]
impl HealthCheck for ReadOnlyStore {
    async fn health_check(&self) -> Result<()> {
        Ok(())
    }

    fn component_name(&self) -> &'static str {
        "read_only_store"
    }
}

#[async_trait]
impl ViewStore for ReadOnlyStore {
    async fn get_views_for_network(&self, network_id: &str) -> Result<ViewMap> {
        let gateway_ids = self.configurations.list_gateway_ids(network_id).await?;
        self.get_views(network_id, &gateway_ids).await
    }

    async fn get_views(&self, network_id: &str, gateway_ids: &[String]) -> Result<ViewMap> {
        let mut views = ViewMap::with_capacity(gateway_ids.len());
        for gateway_id in gateway_ids {
            let state = self.reconstruct(network_id, gateway_id).await?;
            views.insert(gateway_id.clone(), state);
        }
        debug!(network_id, count = views.len(), "Reconstructed views");
        Ok(views)
    }

    async fn update_or_create(
        &self,
        _network_id: &str,
        _updates: BTreeMap<String, GatewayUpdateParams>,
    ) -> Result<()> {
        Err(GatewayError::ReadOnly)
    }

    async fn delete(&self, _network_id: &str, _gateway_ids: &[String]) -> Result<()> {
        Err(GatewayError::ReadOnly)
    }

    async fn init_tables(&self) -> Result<()> {
        Err(GatewayError::ReadOnly)
    }

    fn backend_name(&self) -> &'static str {
        "read_only"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::MemorySourceOfTruth;
    use gwview_core::JsonConfigManager;
    use serde_json::json;

    fn store(truth: Arc<MemorySourceOfTruth>) -> ReadOnlyStore {
        let registry = ConfigRegistry::new();
        registry
            .register(Arc::new(JsonConfigManager::gateway_scoped("mme")))
            .unwrap();
        ReadOnlyStore::new(truth.clone(), truth, Arc::new(registry))
    }

    #[tokio::test]
    async fn test_reconstructs_from_services() {
        let truth = Arc::new(MemorySourceOfTruth::new());
        truth.put_record("net1", "gw1", br#"{"hardware_id": "hw1"}"#.to_vec());
        truth.put_config("net1", "gw1", "mme", br#"{"tac": 1}"#.to_vec());
        truth.put_record("net1", "gw2", br#"{"hardware_id": "hw2"}"#.to_vec());
        truth.put_status("net1", "gw2", br#"{"checkin_time": 5}"#.to_vec());

        let views = store(truth).get_views_for_network("net1").await.unwrap();
        assert_eq!(views.len(), 2);

        let gw1 = &views["gw1"];
        assert_eq!(gw1.record.as_ref().unwrap().hardware_id, "hw1");
        assert_eq!(gw1.config["mme"], json!({"tac": 1}));
        assert_eq!(gw1.status, None);
        assert_eq!(views["gw2"].status.as_ref().unwrap().checkin_time, 5);
    }

    #[tokio::test]
    async fn test_mutations_are_refused() {
        let store = store(Arc::new(MemorySourceOfTruth::new()));
        assert!(matches!(
            store.update_or_create("net1", BTreeMap::new()).await,
            Err(GatewayError::ReadOnly)
        ));
        assert!(matches!(
            store.delete("net1", &["gw1".into()]).await,
            Err(GatewayError::ReadOnly)
        ));
        assert!(store.get_views_for_network("net1").await.unwrap_err().is_not_found());
    }
}
