//! NATS JetStream broker adapters
//!
//! The stream sequence of a message is its offset. Consumers are pulled with
//! at most one unacknowledged message so delivery order is the stream order.

use async_nats::jetstream::{self, consumer::pull, Context};
use async_nats::HeaderMap;
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use gwview_core::prelude::*;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, trace, warn};

/// Header carrying the partition key of a message
pub const KEY_HEADER: &str = "Gwview-Key";

async fn connect(url: &str, connection_name: &str) -> Result<async_nats::Client> {
    info!(url = %url, "Connecting to NATS");
    async_nats::ConnectOptions::new()
        .name(connection_name)
        .connect(url)
        .await
        .map_err(|e| GatewayError::broker_with_source("Failed to connect", e))
}

async fn ensure_stream(
    js: &Context,
    name: &str,
    subjects: Vec<String>,
    max_age: Duration,
) -> Result<jetstream::stream::Stream> {
    let stream = js
        .get_or_create_stream(jetstream::stream::Config {
            name: name.to_string(),
            subjects,
            retention: jetstream::stream::RetentionPolicy::Limits,
            max_age,
            storage: jetstream::stream::StorageType::File,
            ..Default::default()
        })
        .await
        .map_err(|e| GatewayError::broker_with_source(format!("Failed to open stream {}", name), e))?;
    debug!(stream = name, "Stream ready");
    Ok(stream)
}

fn health_of(client: Option<&async_nats::Client>) -> Result<()> {
    match client {
        Some(c) if c.connection_state() == async_nats::connection::State::Connected => Ok(()),
        Some(_) => Err(GatewayError::broker("Not connected")),
        None => Err(GatewayError::broker("Client not initialized")),
    }
}

// ============================================================================
// Source
// ============================================================================

/// JetStream source configuration
#[derive(Debug, Clone)]
pub struct JetStreamSourceConfig {
    pub url: String,
    pub connection_name: String,
    /// Stream name
    pub stream: String,
    /// Subjects the stream is created with if missing
    pub stream_subjects: Vec<String>,
    pub max_age: Duration,
    /// Durable consumer name; `None` replays the stream from the start without acks
    pub consumer: Option<String>,
    pub filter_subject: String,
    pub ack_wait: Duration,
    /// Bound on a single wait for the next message
    pub poll_timeout: Duration,
}

impl JetStreamSourceConfig {
    /// Source over the per-network change topics
    pub fn for_changes(config: &ViewSyncConfig) -> Self {
        let filter = format!("{}.>", config.aggregator.topic_prefix);
        Self {
            url: config.broker.url.clone(),
            connection_name: config.broker.connection_name.clone(),
            stream: config.aggregator.cdc_stream.clone(),
            stream_subjects: vec![filter.clone()],
            max_age: config.aggregator.cdc_max_age,
            consumer: Some(config.aggregator.consumer.clone()),
            filter_subject: filter,
            ack_wait: config.broker.ack_wait,
            poll_timeout: config.aggregator.poll_timeout,
        }
    }

    /// Source over the unified topic
    pub fn for_unified(config: &ViewSyncConfig) -> Self {
        Self {
            url: config.broker.url.clone(),
            connection_name: config.broker.connection_name.clone(),
            stream: config.unified.stream.clone(),
            stream_subjects: vec![config.unified.topic.clone()],
            max_age: config.unified.max_age,
            consumer: Some(config.recorder.consumer.clone()),
            filter_subject: config.unified.topic.clone(),
            ack_wait: config.broker.ack_wait,
            poll_timeout: config.recorder.poll_timeout,
        }
    }

    /// Replay without a durable position
    pub fn ephemeral(mut self) -> Self {
        self.consumer = None;
        self
    }
}

/// JetStream pull source
pub struct JetStreamSource {
    config: JetStreamSourceConfig,
    client: RwLock<Option<async_nats::Client>>,
    messages: Mutex<Option<pull::Stream>>,
    /// Delivered but not yet committed, by offset
    pending: Mutex<HashMap<i64, jetstream::Message>>,
    running: AtomicBool,
}

impl JetStreamSource {
    pub fn new(config: JetStreamSourceConfig) -> Self {
        Self {
            config,
            client: RwLock::new(None),
            messages: Mutex::new(None),
            pending: Mutex::new(HashMap::new()),
            running: AtomicBool::new(false),
        }
    }

    fn consumer_config(&self) -> pull::Config {
        match &self.config.consumer {
            Some(name) => pull::Config {
                durable_name: Some(name.clone()),
                ack_policy: jetstream::consumer::AckPolicy::Explicit,
                ack_wait: self.config.ack_wait,
                max_ack_pending: 1,
                filter_subject: self.config.filter_subject.clone(),
                ..Default::default()
            },
            None => pull::Config {
                ack_policy: jetstream::consumer::AckPolicy::None,
                deliver_policy: jetstream::consumer::DeliverPolicy::All,
                filter_subject: self.config.filter_subject.clone(),
                ..Default::default()
            },
        }
    }

    fn to_broker_message(message: &jetstream::Message) -> Result<BrokerMessage> {
        let info = message
            .info()
            .map_err(|e| GatewayError::broker(format!("Message without stream metadata: {}", e)))?;
        let offset = info.stream_sequence as i64;

        let mut broker_message = BrokerMessage::new(
            message.subject.to_string(),
            message.payload.clone(),
            offset,
        );
        if let Some(key) = message
            .headers
            .as_ref()
            .and_then(|h| h.get(KEY_HEADER))
        {
            broker_message = broker_message.with_key(key.as_str());
        }
        Ok(broker_message)
    }
}

#[async_trait]
impl Lifecycle for JetStreamSource {
    async fn start(&self) -> Result<()> {
        let client = connect(&self.config.url, &self.config.connection_name).await?;
        let js = jetstream::new(client.clone());
        let stream = ensure_stream(
            &js,
            &self.config.stream,
            self.config.stream_subjects.clone(),
            self.config.max_age,
        )
        .await?;

        let consumer: jetstream::consumer::PullConsumer = match &self.config.consumer {
            Some(name) => stream
                .get_or_create_consumer(name, self.consumer_config())
                .await
                .map_err(|e| GatewayError::broker_with_source("Failed to open consumer", e))?,
            None => stream
                .create_consumer(self.consumer_config())
                .await
                .map_err(|e| GatewayError::broker_with_source("Failed to create consumer", e))?,
        };
        let messages = consumer
            .messages()
            .await
            .map_err(|e| GatewayError::broker_with_source("Failed to open message stream", e))?;

        *self.client.write().await = Some(client);
        *self.messages.lock().await = Some(messages);
        self.running.store(true, Ordering::SeqCst);

        info!(
            stream = %self.config.stream,
            consumer = ?self.config.consumer,
            "JetStream source started"
        );
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);
        *self.messages.lock().await = None;
        self.pending.lock().await.clear();
        *self.client.write().await = None;

        info!("JetStream source stopped");
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HealthCheck for JetStreamSource {
    async fn health_check(&self) -> Result<()> {
        health_of(self.client.read().await.as_ref())
    }

    fn component_name(&self) -> &'static str {
        "jetstream_source"
    }
}

#[async_trait]
impl MessageSource for JetStreamSource {
    async fn next_message(&self) -> Result<Option<BrokerMessage>> {
        let mut guard = self.messages.lock().await;
        let messages = guard
            .as_mut()
            .ok_or_else(|| GatewayError::broker("Source not started"))?;

        let next = match tokio::time::timeout(self.config.poll_timeout, messages.next()).await {
            Err(_) => return Ok(None),
            Ok(None) => return Err(GatewayError::broker("Message stream closed")),
            Ok(Some(next)) => next,
        };
        let message =
            next.map_err(|e| GatewayError::broker_with_source("Failed to receive message", e))?;
        drop(guard);

        let broker_message = Self::to_broker_message(&message)?;
        trace!(
            topic = %broker_message.topic,
            offset = broker_message.offset,
            "Received message"
        );
        if self.config.consumer.is_some() {
            self.pending
                .lock()
                .await
                .insert(broker_message.offset, message);
        }
        Ok(Some(broker_message))
    }

    async fn commit(&self, message: &BrokerMessage) -> Result<()> {
        let Some(delivered) = self.pending.lock().await.remove(&message.offset) else {
            if self.config.consumer.is_some() {
                warn!(offset = message.offset, "Commit for a message that is not pending");
            }
            return Ok(());
        };
        delivered
            .ack()
            .await
            .map_err(|e| GatewayError::broker(format!("Ack failed: {}", e)))?;
        trace!(offset = message.offset, "Committed");
        Ok(())
    }
}

// ============================================================================
// Sink
// ============================================================================

/// JetStream sink configuration
#[derive(Debug, Clone)]
pub struct JetStreamSinkConfig {
    pub url: String,
    pub connection_name: String,
    pub stream: String,
    pub stream_subjects: Vec<String>,
    pub max_age: Duration,
    /// Bound on waiting for the broker's publish confirmation
    pub delivery_timeout: Duration,
}

impl JetStreamSinkConfig {
    /// Sink onto the unified topic
    pub fn for_unified(config: &ViewSyncConfig) -> Self {
        Self {
            url: config.broker.url.clone(),
            connection_name: config.broker.connection_name.clone(),
            stream: config.unified.stream.clone(),
            stream_subjects: vec![config.unified.topic.clone()],
            max_age: config.unified.max_age,
            delivery_timeout: config.aggregator.delivery_timeout,
        }
    }
}

/// JetStream publisher that waits for every publish to be confirmed
pub struct JetStreamSink {
    config: JetStreamSinkConfig,
    client: RwLock<Option<async_nats::Client>>,
    jetstream: RwLock<Option<Context>>,
    running: AtomicBool,
    published: AtomicU64,
}

impl JetStreamSink {
    pub fn new(config: JetStreamSinkConfig) -> Self {
        Self {
            config,
            client: RwLock::new(None),
            jetstream: RwLock::new(None),
            running: AtomicBool::new(false),
            published: AtomicU64::new(0),
        }
    }

    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Lifecycle for JetStreamSink {
    async fn start(&self) -> Result<()> {
        let client = connect(&self.config.url, &self.config.connection_name).await?;
        let js = jetstream::new(client.clone());
        ensure_stream(
            &js,
            &self.config.stream,
            self.config.stream_subjects.clone(),
            self.config.max_age,
        )
        .await?;

        *self.client.write().await = Some(client);
        *self.jetstream.write().await = Some(js);
        self.running.store(true, Ordering::SeqCst);

        info!(stream = %self.config.stream, "JetStream sink started");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);
        self.flush().await?;

        *self.jetstream.write().await = None;
        *self.client.write().await = None;

        info!(
            published = self.published.load(Ordering::Relaxed),
            "JetStream sink stopped"
        );
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HealthCheck for JetStreamSink {
    async fn health_check(&self) -> Result<()> {
        health_of(self.client.read().await.as_ref())
    }

    fn component_name(&self) -> &'static str {
        "jetstream_sink"
    }
}

#[async_trait]
impl MessageSink for JetStreamSink {
    async fn publish(&self, topic: &str, key: &str, payload: Bytes) -> Result<()> {
        let js = self
            .jetstream
            .read()
            .await
            .clone()
            .ok_or_else(|| GatewayError::broker("JetStream not initialized"))?;

        let mut headers = HeaderMap::new();
        headers.insert(KEY_HEADER, key);

        let start = Instant::now();
        let ack = js
            .publish_with_headers(topic.to_string(), headers, payload)
            .await
            .map_err(|e| GatewayError::broker_with_source("Publish failed", e))?;

        let timeout = self.config.delivery_timeout;
        let confirmed = tokio::time::timeout(timeout, ack)
            .await
            .map_err(|_| GatewayError::timeout("publish confirmation", timeout.as_millis() as u64))?
            .map_err(|e| GatewayError::broker_with_source("Publish not confirmed", e))?;

        self.published.fetch_add(1, Ordering::Relaxed);
        trace!(
            topic,
            key,
            sequence = confirmed.sequence,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Published message"
        );
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        if let Some(client) = self.client.read().await.as_ref() {
            client
                .flush()
                .await
                .map_err(|e| GatewayError::broker_with_source("Flush failed", e))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configs_follow_view_sync_config() {
        let mut config = ViewSyncConfig::default();
        config.aggregator.topic_prefix = "x".into();

        let changes = JetStreamSourceConfig::for_changes(&config);
        assert_eq!(changes.filter_subject, "x.>");
        assert_eq!(changes.consumer.as_deref(), Some("gwview-aggregator"));
        assert_eq!(changes.max_age, config.aggregator.cdc_max_age);
        assert_ne!(changes.max_age, config.unified.max_age);

        let unified = JetStreamSourceConfig::for_unified(&config).ephemeral();
        assert_eq!(unified.filter_subject, "gateway_view_updates");
        assert!(unified.consumer.is_none());

        let sink = JetStreamSinkConfig::for_unified(&config);
        assert_eq!(sink.delivery_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_durable_consumer_is_strictly_ordered() {
        let config = ViewSyncConfig::default();
        let source = JetStreamSource::new(JetStreamSourceConfig::for_unified(&config));
        let consumer = source.consumer_config();
        assert_eq!(consumer.max_ack_pending, 1);
        assert_eq!(consumer.durable_name.as_deref(), Some("gwview-recorder"));
    }
}
