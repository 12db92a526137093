//! Metrics for the gateway view pipeline
//!
//! Emits through the `metrics` facade; the binary decides the exporter.

use metrics::{counter, histogram};
use std::time::Duration;

/// Metric names as constants for consistency
pub mod names {
    // Aggregator metrics
    pub const AGGREGATOR_MESSAGES_CONSUMED: &str = "gwview_aggregator_messages_consumed_total";
    pub const AGGREGATOR_MESSAGES_SKIPPED: &str = "gwview_aggregator_messages_skipped_total";
    pub const AGGREGATOR_MESSAGES_PUBLISHED: &str = "gwview_aggregator_messages_published_total";
    pub const AGGREGATOR_PUBLISH_LATENCY: &str = "gwview_aggregator_publish_latency_seconds";
    pub const AGGREGATOR_ERRORS_TOTAL: &str = "gwview_aggregator_errors_total";

    // Recorder metrics
    pub const RECORDER_UPDATES_APPLIED: &str = "gwview_recorder_updates_applied_total";
    pub const RECORDER_UPDATES_IGNORED: &str = "gwview_recorder_updates_ignored_total";
    pub const RECORDER_APPLY_LATENCY: &str = "gwview_recorder_apply_latency_seconds";
    pub const RECORDER_ERRORS_TOTAL: &str = "gwview_recorder_errors_total";

    // Storage metrics
    pub const STORAGE_STALE_UPDATES: &str = "gwview_storage_stale_updates_total";
    pub const STORAGE_BATCH_RETRIES: &str = "gwview_storage_batch_retries_total";
    pub const STORAGE_OPERATION_LATENCY: &str = "gwview_storage_operation_latency_seconds";
}

/// Labels for metrics
pub mod labels {
    pub const COMPONENT: &str = "component";
    pub const UPDATE_TYPE: &str = "update_type";
    pub const OPERATION: &str = "operation";
    pub const REASON: &str = "reason";
    pub const ERROR_TYPE: &str = "error_type";
    pub const BACKEND: &str = "backend";
}

/// Aggregator metrics
#[derive(Clone)]
pub struct AggregatorMetrics {
    component: String,
}

impl AggregatorMetrics {
    pub fn new(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
        }
    }

    pub fn record_consumed(&self) {
        counter!(
            names::AGGREGATOR_MESSAGES_CONSUMED,
            labels::COMPONENT => self.component.clone(),
        )
        .increment(1);
    }

    /// Record a heartbeat envelope that produced no update
    pub fn record_skipped(&self) {
        counter!(
            names::AGGREGATOR_MESSAGES_SKIPPED,
            labels::COMPONENT => self.component.clone(),
        )
        .increment(1);
    }

    pub fn record_published(&self, update_type: &str, operation: &str) {
        counter!(
            names::AGGREGATOR_MESSAGES_PUBLISHED,
            labels::COMPONENT => self.component.clone(),
            labels::UPDATE_TYPE => update_type.to_string(),
            labels::OPERATION => operation.to_string(),
        )
        .increment(1);
    }

    pub fn record_publish_latency(&self, duration: Duration) {
        histogram!(
            names::AGGREGATOR_PUBLISH_LATENCY,
            labels::COMPONENT => self.component.clone(),
        )
        .record(duration.as_secs_f64());
    }

    pub fn record_error(&self, error_type: &str) {
        counter!(
            names::AGGREGATOR_ERRORS_TOTAL,
            labels::COMPONENT => self.component.clone(),
            labels::ERROR_TYPE => error_type.to_string(),
        )
        .increment(1);
    }
}

/// Recorder metrics
#[derive(Clone)]
pub struct RecorderMetrics {
    component: String,
}

impl RecorderMetrics {
    pub fn new(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
        }
    }

    pub fn record_applied(&self, update_type: &str, operation: &str) {
        counter!(
            names::RECORDER_UPDATES_APPLIED,
            labels::COMPONENT => self.component.clone(),
            labels::UPDATE_TYPE => update_type.to_string(),
            labels::OPERATION => operation.to_string(),
        )
        .increment(1);
    }

    /// Record an update dropped by policy
    pub fn record_ignored(&self, reason: &str) {
        counter!(
            names::RECORDER_UPDATES_IGNORED,
            labels::COMPONENT => self.component.clone(),
            labels::REASON => reason.to_string(),
        )
        .increment(1);
    }

    pub fn record_apply_latency(&self, duration: Duration) {
        histogram!(
            names::RECORDER_APPLY_LATENCY,
            labels::COMPONENT => self.component.clone(),
        )
        .record(duration.as_secs_f64());
    }

    pub fn record_error(&self, error_type: &str) {
        counter!(
            names::RECORDER_ERRORS_TOTAL,
            labels::COMPONENT => self.component.clone(),
            labels::ERROR_TYPE => error_type.to_string(),
        )
        .increment(1);
    }
}

/// Storage metrics
#[derive(Clone)]
pub struct StorageMetrics {
    backend: &'static str,
}

impl StorageMetrics {
    pub fn new(backend: &'static str) -> Self {
        Self { backend }
    }

    pub fn record_stale(&self, count: u64) {
        counter!(
            names::STORAGE_STALE_UPDATES,
            labels::BACKEND => self.backend,
        )
        .increment(count);
    }

    pub fn record_batch_retry(&self) {
        counter!(
            names::STORAGE_BATCH_RETRIES,
            labels::BACKEND => self.backend,
        )
        .increment(1);
    }

    pub fn record_latency(&self, operation: &'static str, duration: Duration) {
        histogram!(
            names::STORAGE_OPERATION_LATENCY,
            labels::BACKEND => self.backend,
            labels::OPERATION => operation,
        )
        .record(duration.as_secs_f64());
    }
}
