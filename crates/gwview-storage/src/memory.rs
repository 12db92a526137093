//! In-memory view store
//!
//! Reads fail fast when the network or a requested gateway is unknown.

use async_trait::async_trait;
use gwview_core::metrics::StorageMetrics;
use gwview_core::prelude::*;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use tracing::trace;

pub struct MemoryStore {
    networks: RwLock<HashMap<String, ViewMap>>,
    metrics: StorageMetrics,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            networks: RwLock::new(HashMap::new()),
            metrics: StorageMetrics::new("memory"),
        }
    }

    fn network_not_found(network_id: &str) -> GatewayError {
        GatewayError::not_found(format!("network {}", network_id))
    }
}

#[async_trait]
impl HealthCheck for MemoryStore {
    async fn health_check(&self) -> Result<()> {
        Ok(())
    }

    fn component_name(&self) -> &'static str {
        "memory_store"
    }
}

#[async_trait]
impl ViewStore for MemoryStore {
    async fn get_views_for_network(&self, network_id: &str) -> Result<ViewMap> {
        self.networks
            .read()
            .get(network_id)
            .cloned()
            .ok_or_else(|| Self::network_not_found(network_id))
    }

    async fn get_views(&self, network_id: &str, gateway_ids: &[String]) -> Result<ViewMap> {
        let networks = self.networks.read();
        let views = networks
            .get(network_id)
            .ok_or_else(|| Self::network_not_found(network_id))?;

        gateway_ids
            .iter()
            .map(|id| {
                views
                    .get(id)
                    .cloned()
                    .map(|state| (id.clone(), state))
                    .ok_or_else(|| GatewayError::not_found(format!("gateway {}", id)))
            })
            .collect()
    }

    async fn update_or_create(
        &self,
        network_id: &str,
        updates: BTreeMap<String, GatewayUpdateParams>,
    ) -> Result<()> {
        let mut networks = self.networks.write();
        let views = networks.entry(network_id.to_string()).or_default();

        let mut stale = 0;
        for (gateway_id, params) in updates {
            match views.get_mut(&gateway_id) {
                Some(state) => {
                    if !state.apply(&params) {
                        stale += 1;
                    }
                }
                None => {
                    let state = GatewayState::from_params(gateway_id.clone(), &params);
                    views.insert(gateway_id, state);
                }
            }
        }

        if stale > 0 {
            trace!(network_id, stale, "Rejected stale updates");
            self.metrics.record_stale(stale);
        }
        Ok(())
    }

    async fn delete(&self, network_id: &str, gateway_ids: &[String]) -> Result<()> {
        if let Some(views) = self.networks.write().get_mut(network_id) {
            for id in gateway_ids {
                views.remove(id);
            }
        }
        Ok(())
    }

    async fn init_tables(&self) -> Result<()> {
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn one(gateway_id: &str, params: GatewayUpdateParams) -> BTreeMap<String, GatewayUpdateParams> {
        BTreeMap::from([(gateway_id.to_string(), params)])
    }

    #[tokio::test]
    async fn test_reads_fail_fast_on_misses() {
        let store = MemoryStore::new();
        assert!(store.get_views_for_network("net1").await.unwrap_err().is_not_found());

        store
            .update_or_create("net1", one("gw1", GatewayUpdateParams::at_offset(1)))
            .await
            .unwrap();
        let err = store
            .get_views("net1", &["gw1".into(), "gw2".into()])
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_offset_gating() {
        let store = MemoryStore::new();
        store
            .update_or_create("net1", one("gw1", GatewayUpdateParams::at_offset(4).with_config("mme", json!(1))))
            .await
            .unwrap();
        store
            .update_or_create("net1", one("gw1", GatewayUpdateParams::at_offset(4).with_config("mme", json!(2))))
            .await
            .unwrap();

        let views = store.get_views("net1", &["gw1".into()]).await.unwrap();
        assert_eq!(views["gw1"].config["mme"], json!(1));
        assert_eq!(views["gw1"].offset, 4);
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let store = MemoryStore::new();
        store
            .update_or_create("net1", one("gw1", GatewayUpdateParams::at_offset(1)))
            .await
            .unwrap();
        store.delete("net1", &["gw1".into()]).await.unwrap();
        store.delete("net1", &["gw1".into()]).await.unwrap();
        store.delete("net9", &["gw1".into()]).await.unwrap();

        assert!(store.get_views_for_network("net1").await.unwrap().is_empty());
    }
}
