//! Operational commands over a view store
//!
//! Each command works on one network at a time so that the caller can report
//! a failure and carry on with the next network.

use gwview_core::prelude::*;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

/// Materialized views for `network_id`, all of them when `gateway_ids` is empty
pub async fn print_views(
    store: &dyn ViewStore,
    network_id: &str,
    gateway_ids: &[String],
) -> Result<BTreeMap<String, GatewayState>> {
    let views = if gateway_ids.is_empty() {
        store.get_views_for_network(network_id).await?
    } else {
        store.get_views(network_id, gateway_ids).await?
    };
    Ok(views.into_iter().collect())
}

/// How a materialized view disagrees with the source of truth
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Mismatch {
    /// Known to the source of truth but not materialized
    Missing { gateway_id: String },
    /// Materialized but unknown to the source of truth
    Unexpected { gateway_id: String },
    /// Present in both with different contents
    Differs {
        gateway_id: String,
        fields: Vec<&'static str>,
    },
}

/// Compare `store` against `reference` for one network; offsets are ignored
pub async fn verify_network(
    store: &dyn ViewStore,
    reference: &dyn ViewStore,
    network_id: &str,
) -> Result<Vec<Mismatch>> {
    let expected = reference.get_views_for_network(network_id).await?;
    let actual = match store.get_views_for_network(network_id).await {
        Ok(views) => views,
        Err(e) if e.is_not_found() => ViewMap::new(),
        Err(e) => return Err(e),
    };

    let gateway_ids: BTreeSet<&String> = expected.keys().chain(actual.keys()).collect();
    let mut mismatches = Vec::new();
    for gateway_id in gateway_ids {
        let mismatch = match (expected.get(gateway_id), actual.get(gateway_id)) {
            (Some(_), None) => Some(Mismatch::Missing {
                gateway_id: gateway_id.clone(),
            }),
            (None, Some(_)) => Some(Mismatch::Unexpected {
                gateway_id: gateway_id.clone(),
            }),
            (Some(want), Some(have)) => {
                let fields = differing_fields(want, have);
                (!fields.is_empty()).then(|| Mismatch::Differs {
                    gateway_id: gateway_id.clone(),
                    fields,
                })
            }
            (None, None) => None,
        };
        mismatches.extend(mismatch);
    }

    debug!(network_id, mismatches = mismatches.len(), "Verified network");
    Ok(mismatches)
}

fn differing_fields(want: &GatewayState, have: &GatewayState) -> Vec<&'static str> {
    let mut fields = Vec::new();
    if want.config != have.config {
        fields.push("config");
    }
    if want.status != have.status {
        fields.push("status");
    }
    if want.record != have.record {
        fields.push("record");
    }
    fields
}

/// Result of reseeding one network
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReseedReport {
    /// Gateways handed to the store
    pub written: usize,
    /// Gateways whose stored offset is at or above the reseed offset and
    /// therefore kept their current view
    pub skipped: Vec<String>,
}

/// Write the live reconstruction of a network into `store` at `offset`.
///
/// Config types held by a view but absent from the reconstruction are
/// deleted. The store only accepts offsets above what a view holds, so
/// `offset` must exceed the stored offsets for the reseed to take effect;
/// views it cannot overwrite are listed in the report.
pub async fn reseed_network(
    store: &dyn ViewStore,
    reference: &dyn ViewStore,
    network_id: &str,
    offset: i64,
) -> Result<ReseedReport> {
    let views = reference.get_views_for_network(network_id).await?;
    let current = match store.get_views_for_network(network_id).await {
        Ok(views) => views,
        Err(e) if e.is_not_found() => ViewMap::new(),
        Err(e) => return Err(e),
    };

    let mut report = ReseedReport::default();
    let mut updates = BTreeMap::new();
    for (gateway_id, state) in views {
        let existing = current.get(&gateway_id);
        if existing.is_some_and(|view| view.offset >= offset) {
            report.skipped.push(gateway_id);
            continue;
        }
        let params = seed_params(state, existing, offset);
        updates.insert(gateway_id, params);
    }
    report.written = updates.len();
    store.update_or_create(network_id, updates).await?;

    info!(
        network_id,
        written = report.written,
        skipped = report.skipped.len(),
        offset,
        "Reseeded network"
    );
    Ok(report)
}

fn seed_params(state: GatewayState, existing: Option<&GatewayState>, offset: i64) -> GatewayUpdateParams {
    let mut params = GatewayUpdateParams::at_offset(offset);
    if let Some(existing) = existing {
        for config_type in existing.config.keys() {
            if !state.config.contains_key(config_type) {
                params = params.delete_config(config_type.clone());
            }
        }
    }
    for (config_type, value) in state.config {
        params = params.with_config(config_type, value);
    }
    if let Some(status) = state.status {
        params = params.with_status(status);
    }
    if let Some(record) = state.record {
        params = params.with_record(record);
    }
    params
}

pub async fn delete_views(store: &dyn ViewStore, network_id: &str, gateway_ids: &[String]) -> Result<()> {
    store.delete(network_id, gateway_ids).await?;
    info!(network_id, count = gateway_ids.len(), "Deleted views");
    Ok(())
}

/// Read `source` until it goes quiet, keeping updates that name `gateway_id`.
///
/// Each entry is the message offset and the update in its wire form.
pub async fn replay_gateway<S: MessageSource + ?Sized>(
    source: &S,
    network_id: &str,
    gateway_id: &str,
) -> Result<Vec<(i64, Value)>> {
    let mut matches = Vec::new();
    let mut scanned = 0u64;
    while let Some(message) = source.next_message().await? {
        scanned += 1;
        let update = GatewayUpdate::from_bytes(&message.payload)?;
        if update.network_id != network_id || !update.names_gateway(gateway_id) {
            continue;
        }
        let wire: Value = serde_json::from_slice(&update.to_bytes()?).map_err(|e| {
            GatewayError::serialization_with_source("Failed to render update", e)
        })?;
        matches.push((message.offset, wire));
    }

    debug!(scanned, matched = matches.len(), "Replay finished");
    Ok(matches)
}

#[cfg(test)]
mod tests {
    use super::*;
    use gwview_core::{ConfigScopeKind, ConfigTypeSpec};
    use gwview_storage::{MemorySourceOfTruth, MemoryStore, ReadOnlyStore};
    use gwview_transport::MemoryBroker;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    fn reference(truth: Arc<MemorySourceOfTruth>) -> ReadOnlyStore {
        let registry = ConfigRegistry::from_specs(
            &[ConfigTypeSpec {
                name: "mme".into(),
                scope: ConfigScopeKind::Gateway,
            }],
            truth.clone(),
        )
        .unwrap();
        ReadOnlyStore::new(truth.clone(), truth, Arc::new(registry))
    }

    fn truth() -> Arc<MemorySourceOfTruth> {
        let truth = Arc::new(MemorySourceOfTruth::new());
        truth.put_record("net1", "gw1", br#"{"hardware_id": "hw1"}"#.to_vec());
        truth.put_config("net1", "gw1", "mme", br#"{"tac": 1}"#.to_vec());
        truth.put_record("net1", "gw2", br#"{"hardware_id": "hw2"}"#.to_vec());
        truth
    }

    #[tokio::test]
    async fn test_reseed_then_verify_is_clean() {
        let reference = reference(truth());
        let store = MemoryStore::new();

        let before = verify_network(&store, &reference, "net1").await.unwrap();
        assert_eq!(before.len(), 2);
        assert!(matches!(before[0], Mismatch::Missing { .. }));

        let report = reseed_network(&store, &reference, "net1", 0).await.unwrap();
        assert_eq!(report.written, 2);
        assert!(report.skipped.is_empty());
        assert!(verify_network(&store, &reference, "net1").await.unwrap().is_empty());

        let views = print_views(&store, "net1", &[]).await.unwrap();
        assert_eq!(views["gw1"].config["mme"], json!({"tac": 1}));
        assert_eq!(views["gw1"].offset, 0);
    }

    #[tokio::test]
    async fn test_verify_reports_differences() {
        let reference = reference(truth());
        let store = MemoryStore::new();
        reseed_network(&store, &reference, "net1", 5).await.unwrap();

        let updates = BTreeMap::from([
            (
                "gw1".to_string(),
                GatewayUpdateParams::at_offset(6).with_config("mme", json!({"tac": 2})),
            ),
            ("gw3".to_string(), GatewayUpdateParams::at_offset(6)),
        ]);
        store.update_or_create("net1", updates).await.unwrap();

        let mismatches = verify_network(&store, &reference, "net1").await.unwrap();
        assert_eq!(
            mismatches,
            vec![
                Mismatch::Differs {
                    gateway_id: "gw1".into(),
                    fields: vec!["config"],
                },
                Mismatch::Unexpected {
                    gateway_id: "gw3".into(),
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_reseed_keeps_newer_views() {
        let reference = reference(truth());
        let store = MemoryStore::new();
        let newer = BTreeMap::from([(
            "gw1".to_string(),
            GatewayUpdateParams::at_offset(10).with_config("mme", json!({"tac": 9})),
        )]);
        store.update_or_create("net1", newer).await.unwrap();

        let report = reseed_network(&store, &reference, "net1", 3).await.unwrap();
        assert_eq!(report.written, 1);
        assert_eq!(report.skipped, vec!["gw1".to_string()]);

        let views = print_views(&store, "net1", &[]).await.unwrap();
        assert_eq!(views["gw1"].config["mme"], json!({"tac": 9}));
        assert_eq!(views["gw1"].offset, 10);
        assert_eq!(views["gw2"].offset, 3);
    }

    #[tokio::test]
    async fn test_unknown_network_fails_verify() {
        let reference = reference(truth());
        let err = verify_network(&MemoryStore::new(), &reference, "net9")
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_replay_filters_by_gateway() {
        let broker = MemoryBroker::new();
        for (network_id, gateway_id) in [("net1", "gw1"), ("net1", "gw2"), ("net2", "gw1"), ("net1", "gw1")] {
            let update = GatewayUpdate::new(
                Operation::Update,
                network_id,
                UpdatePayload::Status(GatewayStatusUpdate {
                    gateway_id: gateway_id.into(),
                    status_bytes: b"{}".to_vec(),
                }),
            );
            broker
                .append("gateway_view_updates", Some(network_id), update.to_bytes().unwrap())
                .await;
        }

        let source = broker.source("gateway_view_updates", Duration::from_millis(20));
        let matches = replay_gateway(&source, "net1", "gw1").await.unwrap();

        let offsets: Vec<i64> = matches.iter().map(|(offset, _)| *offset).collect();
        assert_eq!(offsets, vec![1, 4]);
        assert_eq!(matches[0].1["NetworkID"], "net1");
    }

    #[tokio::test]
    async fn test_reseed_removes_config_types_gone_from_source_of_truth() {
        let truth = truth();
        let reference = reference(truth.clone());
        let store = MemoryStore::new();
        let old = BTreeMap::from([(
            "gw2".to_string(),
            GatewayUpdateParams::at_offset(1).with_config("mme", json!({"tac": 7})),
        )]);
        store.update_or_create("net1", old).await.unwrap();
        assert!(!verify_network(&store, &reference, "net1").await.unwrap().is_empty());

        let report = reseed_network(&store, &reference, "net1", 100).await.unwrap();
        assert_eq!(report.written, 2);

        let views = print_views(&store, "net1", &[]).await.unwrap();
        assert!(views["gw2"].config.is_empty());
        assert_eq!(views["gw2"].offset, 100);
        assert!(verify_network(&store, &reference, "net1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reseed_at_stored_offset_reports_skipped() {
        let reference = reference(truth());
        let store = MemoryStore::new();
        reseed_network(&store, &reference, "net1", 0).await.unwrap();

        let report = reseed_network(&store, &reference, "net1", 0).await.unwrap();
        assert_eq!(report.written, 0);
        assert_eq!(report.skipped, vec!["gw1".to_string(), "gw2".to_string()]);
    }
}
