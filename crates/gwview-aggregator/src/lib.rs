//! # Gateway View Aggregator
//!
//! Consumes every per-network change topic, re-encodes each change as a
//! unified gateway update and publishes it keyed by network, so that one
//! network's updates stay in order downstream.
//!
//! The source position is committed only after the broker has confirmed
//! the publish. Any failure ends the run; the process is expected to be
//! restarted and resume from the last committed position.
//!
//! ## Usage
//!
//! ```rust,ignore
//! let source = JetStreamSource::new(JetStreamSourceConfig::for_changes(&config));
//! let sink = JetStreamSink::new(JetStreamSinkConfig::for_unified(&config));
//!
//! let aggregator = Aggregator::new(source, sink, TopicPattern::new("cdc"), "gateway_view_updates");
//! aggregator.run().await?;
//! ```

use gwview_core::prelude::*;
use gwview_core::{decode_change_message, AggregatorMetrics, ErrorContext, ErrorContextExt, TopicPattern};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, trace, warn};

/// Change-topic to unified-topic pipeline
pub struct Aggregator<S, P>
where
    S: MessageSource,
    P: MessageSink,
{
    source: Arc<S>,
    sink: Arc<P>,
    pattern: TopicPattern,
    unified_topic: String,
    metrics: AggregatorMetrics,
    running: AtomicBool,
    stop_requested: AtomicBool,
    processed: AtomicU64,
}

impl<S, P> Aggregator<S, P>
where
    S: MessageSource + 'static,
    P: MessageSink + 'static,
{
    pub fn new(source: S, sink: P, pattern: TopicPattern, unified_topic: impl Into<String>) -> Self {
        Self {
            source: Arc::new(source),
            sink: Arc::new(sink),
            pattern,
            unified_topic: unified_topic.into(),
            metrics: AggregatorMetrics::new("gwview_aggregator"),
            running: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
            processed: AtomicU64::new(0),
        }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Run until stopped or until the first failure.
    ///
    /// A stop requested before or during startup is honored; a stopped
    /// aggregator does not run again.
    pub async fn run(&self) -> Result<()> {
        info!(
            prefix = self.pattern.prefix(),
            unified_topic = %self.unified_topic,
            "Starting aggregator"
        );

        self.source.start().await?;
        self.sink.start().await?;
        self.source.health_check().await?;
        self.sink.health_check().await?;
        self.running.store(true, Ordering::SeqCst);

        let outcome = self.consume().await;
        self.running.store(false, Ordering::SeqCst);

        if let Err(ref e) = outcome {
            error!(error = %e, "Aggregator failed");
            self.metrics.record_error(error_type(e));
        }

        let shutdown = self.shutdown().await;

        info!(
            processed = self.processed.load(Ordering::Relaxed),
            "Aggregator stopped"
        );
        // A consume failure takes precedence over a failed shutdown
        outcome.and(shutdown)
    }

    /// Flush and stop both ends, attempting every step
    async fn shutdown(&self) -> Result<()> {
        let steps = [
            ("flush_sink", self.sink.flush().await),
            ("stop_sink", self.sink.stop().await),
            ("stop_source", self.source.stop().await),
        ];

        let mut first = None;
        for (step, result) in steps {
            if let Err(e) = result {
                warn!(step, error = %e, "Shutdown step failed");
                first.get_or_insert(e);
            }
        }
        first.map_or(Ok(()), Err)
    }

    async fn consume(&self) -> Result<()> {
        while !self.stop_requested.load(Ordering::SeqCst) {
            let Some(message) = self.source.next_message().await? else {
                continue;
            };
            self.metrics.record_consumed();

            self.forward(&message).await?;
            self.source.commit(&message).await?;
            self.processed.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Decode one change message and publish it to the unified topic
    async fn forward(&self, message: &BrokerMessage) -> Result<()> {
        let Some(update) = decode_change_message(&self.pattern, &message.topic, &message.payload)?
        else {
            trace!(topic = %message.topic, offset = message.offset, "Skipping empty change envelope");
            self.metrics.record_skipped();
            return Ok(());
        };

        let payload = update.to_bytes()?;
        let start = Instant::now();
        let mut context = ErrorContext::new("aggregator", "publish")
            .with_network(update.network_id.as_str())
            .with_offset(message.offset);
        if let Some(gateway_id) = update.payload.gateway_id() {
            context = context.with_gateway(gateway_id);
        }
        self.sink
            .publish(&self.unified_topic, &update.network_id, payload)
            .await
            .with_context(context)?;
        self.metrics.record_publish_latency(start.elapsed());
        self.metrics.record_published(
            &update.update_type().to_string(),
            update.operation.as_code(),
        );

        debug!(
            network_id = %update.network_id,
            update_type = %update.update_type(),
            operation = %update.operation,
            offset = message.offset,
            "Forwarded update"
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
        GatewayError::Decode { .. }
        | GatewayError::UnknownTopic { .. }
        | GatewayError::UnrecognizedOperation(_) => "decode",
        GatewayError::Timeout { .. } => "delivery_timeout",
        GatewayError::Broker { .. } => "broker",
        _ => "other",
    }
}
