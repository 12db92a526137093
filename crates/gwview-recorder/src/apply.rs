//! Update application
//!
//! What each (category, operation) pair does to the view store:
//!
//! | category | upsert (c/r/u)                          | delete (d)                     |
//! |----------|-----------------------------------------|--------------------------------|
//! | config   | set the type on the single target view  | remove the type from all targets |
//! | status   | set the status                          | ignored                        |
//! | record   | set the record                          | delete the whole view          |
//!
//! Config types on the retired list are ignored in both directions, and a
//! config upsert whose scope resolves to more than one gateway is not stored.

use gwview_core::prelude::*;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{debug, trace};

/// What happened to one update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// Dropped by policy, with the reason
    Ignored(&'static str),
}

pub struct UpdateApplier {
    store: Arc<dyn ViewStore>,
    registry: Arc<ConfigRegistry>,
    retired_config_types: HashSet<String>,
}

impl UpdateApplier {
    pub fn new(
        store: Arc<dyn ViewStore>,
        registry: Arc<ConfigRegistry>,
        retired_config_types: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            store,
            registry,
            retired_config_types: retired_config_types.into_iter().collect(),
        }
    }

    pub fn store(&self) -> &Arc<dyn ViewStore> {
        &self.store
    }

    /// Apply `update`, which sits at `offset` in the unified stream
    pub async fn apply(&self, update: &GatewayUpdate, offset: i64) -> Result<ApplyOutcome> {
        let network_id = update.network_id.as_str();
        let upsert = update.operation.is_upsert();

        match &update.payload {
            UpdatePayload::Config(config) => {
                if self.retired_config_types.contains(&config.config_type) {
                    return Ok(ApplyOutcome::Ignored("retired_config_type"));
                }
                if upsert {
                    self.upsert_config(network_id, config, offset).await
                } else {
                    self.delete_config(network_id, config, offset).await
                }
            }
            UpdatePayload::Status(status) if upsert => {
                if status.status_bytes.is_empty() {
                    return Ok(ApplyOutcome::Ignored("empty_status"));
                }
                let params = GatewayUpdateParams::at_offset(offset)
                    .with_status(GatewayStatus::from_bytes(&status.status_bytes)?);
                self.write_one(network_id, &status.gateway_id, params).await
            }
            UpdatePayload::Status(_) => Ok(ApplyOutcome::Ignored("status_delete")),
            UpdatePayload::Record(record) if upsert => {
                if record.record_bytes.is_empty() {
                    return Ok(ApplyOutcome::Ignored("empty_record"));
                }
                let params = GatewayUpdateParams::at_offset(offset)
                    .with_record(GatewayRecord::from_bytes(&record.record_bytes)?);
                self.write_one(network_id, &record.gateway_id, params).await
            }
            UpdatePayload::Record(record) => {
                debug!(network_id, gateway_id = %record.gateway_id, "Deleting view");
                self.store
                    .delete(network_id, std::slice::from_ref(&record.gateway_id))
                    .await?;
                Ok(ApplyOutcome::Applied)
            }
        }
    }

    async fn upsert_config(
        &self,
        network_id: &str,
        config: &GatewayConfigUpdate,
        offset: i64,
    ) -> Result<ApplyOutcome> {
        let Some(value) = self
            .registry
            .unmarshal_config(&config.config_type, &config.config_bytes)?
        else {
            return Ok(ApplyOutcome::Ignored("empty_config"));
        };

        let gateway_ids = self
            .registry
            .gateway_ids_for_config(&config.config_type, network_id, &config.config_key)
            .await?;
        let [gateway_id] = gateway_ids.as_slice() else {
            trace!(
                network_id,
                config_type = %config.config_type,
                targets = gateway_ids.len(),
                "Config does not resolve to a single gateway"
            );
            return Ok(ApplyOutcome::Ignored("not_gateway_scoped"));
        };

        let params = GatewayUpdateParams::at_offset(offset).with_config(&config.config_type, value);
        self.write_one(network_id, gateway_id, params).await
    }

    async fn delete_config(
        &self,
        network_id: &str,
        config: &GatewayConfigUpdate,
        offset: i64,
    ) -> Result<ApplyOutcome> {
        let gateway_ids = self
            .registry
            .gateway_ids_for_config(&config.config_type, network_id, &config.config_key)
            .await?;
        if gateway_ids.is_empty() {
            return Ok(ApplyOutcome::Ignored("no_targets"));
        }

        let updates: BTreeMap<String, GatewayUpdateParams> = gateway_ids
            .into_iter()
            .map(|id| {
                let params = GatewayUpdateParams::at_offset(offset).delete_config(&config.config_type);
                (id, params)
            })
            .collect();
        self.store.update_or_create(network_id, updates).await?;
        Ok(ApplyOutcome::Applied)
    }

    async fn write_one(
        &self,
        network_id: &str,
        gateway_id: &str,
        params: GatewayUpdateParams,
    ) -> Result<ApplyOutcome> {
        let updates = BTreeMap::from([(gateway_id.to_string(), params)]);
        self.store.update_or_create(network_id, updates).await?;
        Ok(ApplyOutcome::Applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gwview_core::{ConfigScopeKind, ConfigTypeSpec};
    use gwview_storage::{MemorySourceOfTruth, MemoryStore};

    fn applier(retired: &[&str]) -> UpdateApplier {
        let directory = Arc::new(MemorySourceOfTruth::new());
        directory.put_record("net1", "gw1", b"{}".to_vec());
        directory.put_record("net1", "gw2", b"{}".to_vec());

        let registry = ConfigRegistry::from_specs(
            &[
                ConfigTypeSpec {
                    name: "mme".into(),
                    scope: ConfigScopeKind::Gateway,
                },
                ConfigTypeSpec {
                    name: "features".into(),
                    scope: ConfigScopeKind::Network,
                },
            ],
            directory,
        )
        .unwrap();

        UpdateApplier::new(
            Arc::new(MemoryStore::new()),
            Arc::new(registry),
            retired.iter().map(|s| s.to_string()),
        )
    }

    fn config(op: Operation, config_type: &str, key: &str, bytes: &[u8]) -> GatewayUpdate {
        GatewayUpdate::new(
            op,
            "net1",
            UpdatePayload::Config(GatewayConfigUpdate {
                config_key: key.into(),
                config_type: config_type.into(),
                config_bytes: bytes.to_vec(),
            }),
        )
    }

    fn status(op: Operation, bytes: &[u8]) -> GatewayUpdate {
        GatewayUpdate::new(
            op,
            "net1",
            UpdatePayload::Status(GatewayStatusUpdate {
                gateway_id: "gw1".into(),
                status_bytes: bytes.to_vec(),
            }),
        )
    }

    fn record(op: Operation) -> GatewayUpdate {
        GatewayUpdate::new(
            op,
            "net1",
            UpdatePayload::Record(GatewayRecordUpdate {
                gateway_id: "gw1".into(),
                record_bytes: br#"{"hardware_id": "hw1"}"#.to_vec(),
            }),
        )
    }

    async fn view(applier: &UpdateApplier) -> GatewayState {
        applier
            .store()
            .get_views("net1", &["gw1".into()])
            .await
            .unwrap()
            .remove("gw1")
            .unwrap()
    }

    #[tokio::test]
    async fn test_stale_update_leaves_state_unchanged() {
        let applier = applier(&[]);
        applier
            .apply(&config(Operation::Create, "mme", "gw1", br#"{"v": 1}"#), 10)
            .await
            .unwrap();
        let before = view(&applier).await;

        for offset in [10, 9, 1] {
            applier
                .apply(&config(Operation::Update, "mme", "gw1", br#"{"v": 2}"#), offset)
                .await
                .unwrap();
            applier
                .apply(&config(Operation::Delete, "mme", "gw1", b""), offset)
                .await
                .unwrap();
        }
        assert_eq!(view(&applier).await, before);
    }

    #[tokio::test]
    async fn test_config_upsert_then_delete_converges() {
        let applier = applier(&[]);
        applier
            .apply(&status(Operation::Update, br#"{"checkin_time": 1}"#), 1)
            .await
            .unwrap();
        applier
            .apply(&config(Operation::Create, "mme", "gw1", b"[1]"), 2)
            .await
            .unwrap();
        applier
            .apply(&config(Operation::Delete, "mme", "gw1", b"[1]"), 3)
            .await
            .unwrap();

        let state = view(&applier).await;
        assert!(state.config.is_empty());
        assert_eq!(state.status.unwrap().checkin_time, 1);
        assert_eq!(state.offset, 3);
    }

    #[tokio::test]
    async fn test_network_scoped_config_is_not_stored() {
        let applier = applier(&[]);
        applier.apply(&record(Operation::Create), 1).await.unwrap();

        let outcome = applier
            .apply(&config(Operation::Update, "features", "net1", br#"{"x": 1}"#), 2)
            .await
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::Ignored("not_gateway_scoped"));

        let views = applier.store().get_views_for_network("net1").await.unwrap();
        assert!(views.values().all(|v| !v.config.contains_key("features")));
    }

    #[tokio::test]
    async fn test_retired_types_are_ignored() {
        let applier = applier(&["legacy"]);
        let outcome = applier
            .apply(&config(Operation::Create, "legacy", "gw1", b"not json"), 1)
            .await
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::Ignored("retired_config_type"));
    }

    #[tokio::test]
    async fn test_unregistered_type_is_an_error() {
        let applier = applier(&[]);
        let err = applier
            .apply(&config(Operation::Create, "unknown", "gw1", b"{}"), 1)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::UnregisteredConfigType(_)));
    }

    #[tokio::test]
    async fn test_status_delete_ignored_and_record_delete_removes_view() {
        let applier = applier(&[]);
        applier.apply(&record(Operation::Create), 1).await.unwrap();

        let outcome = applier.apply(&status(Operation::Delete, b""), 2).await.unwrap();
        assert_eq!(outcome, ApplyOutcome::Ignored("status_delete"));
        assert_eq!(view(&applier).await.record.unwrap().hardware_id, "hw1");

        applier.apply(&record(Operation::Delete), 3).await.unwrap();
        let views = applier.store().get_views_for_network("net1").await.unwrap();
        assert!(views.is_empty());
    }

    #[tokio::test]
    async fn test_empty_config_is_no_op() {
        let applier = applier(&[]);
        let outcome = applier
            .apply(&config(Operation::Update, "mme", "gw1", b""), 1)
            .await
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::Ignored("empty_config"));
        assert!(applier.store().get_views_for_network("net1").await.is_err());
    }

    #[tokio::test]
    async fn test_status_with_null_fields_is_applied() {
        let applier = applier(&[]);
        let outcome = applier
            .apply(&status(Operation::Update, br#"{"checkin_time": 5, "hardware_id": null}"#), 4)
            .await
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::Applied);

        let state = view(&applier).await;
        let status = state.status.unwrap();
        assert_eq!(status.checkin_time, 5);
        assert_eq!(status.hardware_id, "");
        assert_eq!(state.offset, 4);
    }
}
