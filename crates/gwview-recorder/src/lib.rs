//! # Gateway View Recorder
//!
//! Consumes the unified gateway update topic and applies each update to the
//! view store, stamped with the update's position in the topic. The store
//! rejects positions at or below what a view already holds, so replays
//! after a restart are harmless.
//!
//! ## Usage
//!
//! ```rust,ignore
//! let source = JetStreamSource::new(JetStreamSourceConfig::for_unified(&config));
//! let applier = UpdateApplier::new(store, registry, config.recorder.retired_config_types.clone());
//!
//! let recorder = Recorder::new(source, applier);
//! recorder.run().await?;
//! ```

pub mod apply;

pub use apply::{ApplyOutcome, UpdateApplier};

use gwview_core::prelude::*;
use gwview_core::{decode_unified_message, ErrorContext, ErrorContextExt, RecorderMetrics};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Unified-topic to view-store pipeline
pub struct Recorder<S: MessageSource> {
    source: Arc<S>,
    applier: UpdateApplier,
    metrics: RecorderMetrics,
    running: AtomicBool,
    stop_requested: AtomicBool,
    processed: AtomicU64,
}

impl<S: MessageSource + 'static> Recorder<S> {
    pub fn new(source: S, applier: UpdateApplier) -> Self {
        Self {
            source: Arc::new(source),
            applier,
            metrics: RecorderMetrics::new("gwview_recorder"),
            running: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
            processed: AtomicU64::new(0),
        }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn store(&self) -> &Arc<dyn ViewStore> {
        self.applier.store()
    }

    /// Run until stopped or until the first failure.
    ///
    /// A stop requested before or during startup is honored; a stopped
    /// recorder does not run again.
    pub async fn run(&self) -> Result<()> {
        info!(backend = self.store().backend_name(), "Starting recorder");

        self.source.start().await?;
        self.source.health_check().await?;
        self.store().health_check().await?;
        self.running.store(true, Ordering::SeqCst);

        let outcome = self.consume().await;
        self.running.store(false, Ordering::SeqCst);

        if let Err(ref e) = outcome {
            error!(error = %e, "Recorder failed");
            self.metrics.record_error(error_type(e));
        }

        let shutdown = self.source.stop().await;
        if let Err(ref e) = shutdown {
            warn!(error = %e, "Failed to stop source");
        }

        info!(
            processed = self.processed.load(Ordering::Relaxed),
            "Recorder stopped"
        );
        // A consume failure takes precedence over a failed shutdown
        outcome.and(shutdown)
    }

    async fn consume(&self) -> Result<()> {
        while !self.stop_requested.load(Ordering::SeqCst) {
            let Some(message) = self.source.next_message().await? else {
                continue;
            };

            self.record(&message).await?;
            self.source.commit(&message).await?;
            self.processed.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    async fn record(&self, message: &BrokerMessage) -> Result<()> {
        let update = decode_unified_message(&message.payload).with_context(
            ErrorContext::new("recorder", "decode").with_offset(message.offset),
        )?;
        let update_type = update.update_type().to_string();

        let mut context = ErrorContext::new("recorder", "apply")
            .with_network(update.network_id.as_str())
            .with_offset(message.offset);
        if let Some(gateway_id) = update.payload.gateway_id() {
            context = context.with_gateway(gateway_id);
        }

        let start = Instant::now();
        let outcome = self
            .applier
            .apply(&update, message.offset)
            .await
            .with_context(context)?;
        self.metrics.record_apply_latency(start.elapsed());

        match outcome {
            ApplyOutcome::Applied => {
                self.metrics
                    .record_applied(&update_type, update.operation.as_code());
            }
            ApplyOutcome::Ignored(reason) => self.metrics.record_ignored(reason),
        }

        debug!(
            network_id = %update.network_id,
            update_type = %update_type,
            operation = %update.operation,
            offset = message.offset,
            ?outcome,
            "Recorded update"
        );
        Ok(())
    }

    /// Request a stop after the in-flight message
    pub fn stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn processed_count(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }
}

fn error_type(error: &GatewayError) -> &'static str {
    match error {
        GatewayError::Decode { .. } | GatewayError::UnrecognizedOperation(_) => "decode",
        GatewayError::UnregisteredConfigType(_) => "unregistered_config_type",
        GatewayError::Storage { .. } | GatewayError::RetryExhausted { .. } => "storage",
        GatewayError::Service { .. } => "service",
        GatewayError::Broker { .. } => "broker",
        _ => "other",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gwview_core::{ConfigScopeKind, ConfigTypeSpec};
    use gwview_storage::{MemorySourceOfTruth, MemoryStore};
    use gwview_transport::{MemoryBroker, MemorySource};
    use serde_json::json;
    use std::time::Duration;

    const UNIFIED: &str = "gateway_view_updates";

    fn recorder(source: MemorySource) -> Arc<Recorder<MemorySource>> {
        let registry = ConfigRegistry::from_specs(
            &[ConfigTypeSpec {
                name: "mme".into(),
                scope: ConfigScopeKind::Gateway,
            }],
            Arc::new(MemorySourceOfTruth::new()),
        )
        .unwrap();
        let applier = UpdateApplier::new(Arc::new(MemoryStore::new()), Arc::new(registry), Vec::new());
        Arc::new(Recorder::new(source, applier))
    }

    async fn publish(broker: &MemoryBroker, update: GatewayUpdate) {
        let key = update.network_id.clone();
        broker
            .append(UNIFIED, Some(&key), update.to_bytes().unwrap())
            .await;
    }

    fn config_update(op: Operation, network_id: &str, gateway_id: &str, value: serde_json::Value) -> GatewayUpdate {
        GatewayUpdate::new(
            op,
            network_id,
            UpdatePayload::Config(GatewayConfigUpdate {
                config_key: gateway_id.into(),
                config_type: "mme".into(),
                config_bytes: serde_json::to_vec(&value).unwrap(),
            }),
        )
    }

    fn status_update(network_id: &str, gateway_id: &str, checkin_time: u64) -> GatewayUpdate {
        GatewayUpdate::new(
            Operation::Update,
            network_id,
            UpdatePayload::Status(GatewayStatusUpdate {
                gateway_id: gateway_id.into(),
                status_bytes: serde_json::to_vec(&json!({ "checkin_time": checkin_time })).unwrap(),
            }),
        )
    }

    /// Run until `count` messages are processed, then stop
    async fn run_until(recorder: Arc<Recorder<MemorySource>>, count: u64) -> Result<()> {
        let worker = recorder.clone();
        let handle = tokio::spawn(async move { worker.run().await });

        tokio::time::timeout(Duration::from_secs(5), async {
            while recorder.processed_count() < count && !handle.is_finished() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        recorder.stop();
        handle.await.unwrap()
    }

    #[tokio::test]
    async fn test_views_carry_latest_offset() {
        let broker = MemoryBroker::new();
        publish(&broker, config_update(Operation::Create, "net1", "gw1", json!({"v": 1}))).await;
        publish(&broker, status_update("net1", "gw1", 7)).await;
        publish(&broker, config_update(Operation::Update, "net2", "gw2", json!({"v": 2}))).await;

        let recorder = recorder(broker.source(UNIFIED, Duration::from_millis(10)));
        run_until(recorder.clone(), 3).await.unwrap();

        let net1 = recorder.store().get_views_for_network("net1").await.unwrap();
        let gw1 = &net1["gw1"];
        assert_eq!(gw1.offset, 2);
        assert_eq!(gw1.config["mme"], json!({"v": 1}));
        assert_eq!(gw1.status.as_ref().unwrap().checkin_time, 7);

        let net2 = recorder.store().get_views_for_network("net2").await.unwrap();
        assert_eq!(net2["gw2"].offset, 3);
        assert_eq!(recorder.source().committed_offset(), 3);
    }

    #[tokio::test]
    async fn test_replay_is_idempotent() {
        let broker = MemoryBroker::new();
        publish(&broker, config_update(Operation::Create, "net1", "gw1", json!({"v": 1}))).await;
        publish(&broker, config_update(Operation::Update, "net1", "gw1", json!({"v": 2}))).await;
        publish(&broker, status_update("net1", "gw1", 9)).await;

        let store: Arc<dyn ViewStore> = Arc::new(MemoryStore::new());
        let registry = Arc::new(
            ConfigRegistry::from_specs(
                &[ConfigTypeSpec {
                    name: "mme".into(),
                    scope: ConfigScopeKind::Gateway,
                }],
                Arc::new(MemorySourceOfTruth::new()),
            )
            .unwrap(),
        );

        // First pass processes everything
        let first = Arc::new(Recorder::new(
            broker.source(UNIFIED, Duration::from_millis(10)),
            UpdateApplier::new(store.clone(), registry.clone(), Vec::new()),
        ));
        run_until(first, 3).await.unwrap();
        let after_first = store.get_views_for_network("net1").await.unwrap();

        // A restart that lost its commits replays from the beginning
        let second = Arc::new(Recorder::new(
            broker.source_from(UNIFIED, Duration::from_millis(10), 0),
            UpdateApplier::new(store.clone(), registry, Vec::new()),
        ));
        run_until(second, 3).await.unwrap();

        assert_eq!(store.get_views_for_network("net1").await.unwrap(), after_first);
        assert_eq!(after_first["gw1"].config["mme"], json!({"v": 2}));
        assert_eq!(after_first["gw1"].offset, 3);
    }

    #[tokio::test]
    async fn test_garbage_payload_is_fatal() {
        let broker = MemoryBroker::new();
        publish(&broker, status_update("net1", "gw1", 1)).await;
        broker.append(UNIFIED, Some("net1"), b"not json".to_vec()).await;

        let recorder = recorder(broker.source(UNIFIED, Duration::from_millis(10)));
        let err = run_until(recorder.clone(), 5).await.unwrap_err();

        assert!(matches!(err, GatewayError::Decode { .. }));
        assert_eq!(recorder.processed_count(), 1);
        assert_eq!(recorder.source().committed_offset(), 1);
    }

    #[tokio::test]
    async fn test_apply_failure_is_fatal_without_commit() {
        let broker = MemoryBroker::new();
        let mut update = config_update(Operation::Create, "net1", "gw1", json!({"v": 1}));
        if let UpdatePayload::Config(ref mut config) = update.payload {
            config.config_type = "unknown".into();
        }
        publish(&broker, update).await;

        let recorder = recorder(broker.source(UNIFIED, Duration::from_millis(10)));
        let err = run_until(recorder.clone(), 1).await.unwrap_err();

        assert!(matches!(err, GatewayError::UnregisteredConfigType(ref name) if name == "unknown"));
        assert_eq!(recorder.source().committed_offset(), 0);
    }

    #[tokio::test]
    async fn test_stop_before_run_is_honored() {
        let broker = MemoryBroker::new();
        publish(&broker, status_update("net1", "gw1", 1)).await;

        let recorder = recorder(broker.source(UNIFIED, Duration::from_millis(10)));
        recorder.stop();
        tokio::time::timeout(Duration::from_secs(5), recorder.run())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(recorder.processed_count(), 0);
        assert_eq!(recorder.source().committed_offset(), 0);
        assert!(!recorder.is_running());
    }
}
