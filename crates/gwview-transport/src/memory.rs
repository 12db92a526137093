//! In-memory broker
//!
//! A single append-only log shared by any number of sources and sinks.
//! Offsets are 1-based log positions, so every consumer sees one total order.

use async_trait::async_trait;
use bytes::Bytes;
use gwview_core::prelude::*;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tracing::trace;

use crate::subject::subject_matches;

#[derive(Default)]
struct BrokerLog {
    messages: Mutex<Vec<BrokerMessage>>,
    appended: Notify,
    publish_failure: Mutex<Option<String>>,
    confirm_delay: Mutex<Option<Duration>>,
    flush_failure: Mutex<Option<String>>,
}

const DEFAULT_DELIVERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Shared in-memory message log
#[derive(Clone, Default)]
pub struct MemoryBroker {
    log: Arc<BrokerLog>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a message, returning its offset
    pub async fn append(&self, topic: &str, key: Option<&str>, payload: impl Into<Bytes>) -> i64 {
        let mut messages = self.log.messages.lock().await;
        let offset = messages.len() as i64 + 1;
        let mut message = BrokerMessage::new(topic, payload, offset);
        message.key = key.map(str::to_string);
        messages.push(message);
        drop(messages);

        self.log.appended.notify_waiters();
        offset
    }

    /// Every message published on `topic`, in order
    pub async fn messages_on(&self, topic: &str) -> Vec<BrokerMessage> {
        self.log
            .messages
            .lock()
            .await
            .iter()
            .filter(|m| m.topic == topic)
            .cloned()
            .collect()
    }

    /// Make subsequent publishes fail with `reason`, or succeed again with `None`
    pub async fn set_publish_failure(&self, reason: Option<&str>) {
        *self.log.publish_failure.lock().await = reason.map(str::to_string);
    }

    /// Delay publish confirmations by `delay`, or confirm at once with `None`
    pub async fn set_confirm_delay(&self, delay: Option<Duration>) {
        *self.log.confirm_delay.lock().await = delay;
    }

    /// Make sink flushes fail with `reason`, or succeed again with `None`
    pub async fn set_flush_failure(&self, reason: Option<&str>) {
        *self.log.flush_failure.lock().await = reason.map(str::to_string);
    }

    /// Source reading topics matching `pattern` from the start of the log
    pub fn source(&self, pattern: impl Into<String>, poll_timeout: Duration) -> MemorySource {
        MemorySource {
            log: self.log.clone(),
            pattern: pattern.into(),
            poll_timeout,
            position: AtomicUsize::new(0),
            committed: AtomicI64::new(0),
            running: AtomicBool::new(false),
        }
    }

    /// Source resuming after a previously committed offset
    pub fn source_from(
        &self,
        pattern: impl Into<String>,
        poll_timeout: Duration,
        committed: i64,
    ) -> MemorySource {
        let source = self.source(pattern, poll_timeout);
        source.position.store(committed.max(0) as usize, Ordering::SeqCst);
        source.committed.store(committed, Ordering::SeqCst);
        source
    }

    pub fn sink(&self) -> MemorySink {
        self.sink_with_timeout(DEFAULT_DELIVERY_TIMEOUT)
    }

    /// Sink giving up on a publish confirmation after `delivery_timeout`
    pub fn sink_with_timeout(&self, delivery_timeout: Duration) -> MemorySink {
        MemorySink {
            broker: self.clone(),
            delivery_timeout,
            running: AtomicBool::new(false),
        }
    }
}

/// Consumer over a [`MemoryBroker`]
pub struct MemorySource {
    log: Arc<BrokerLog>,
    pattern: String,
    poll_timeout: Duration,
    position: AtomicUsize,
    committed: AtomicI64,
    running: AtomicBool,
}

impl MemorySource {
    /// Offset of the last committed message, 0 if none
    pub fn committed_offset(&self) -> i64 {
        self.committed.load(Ordering::SeqCst)
    }

    async fn poll_once(&self) -> Option<BrokerMessage> {
        let messages = self.log.messages.lock().await;
        let start = self.position.load(Ordering::SeqCst);
        let (index, message) = messages
            .iter()
            .enumerate()
            .skip(start)
            .find(|(_, m)| subject_matches(&m.topic, &self.pattern))?;
        self.position.store(index + 1, Ordering::SeqCst);
        Some(message.clone())
    }
}

#[async_trait]
impl Lifecycle for MemorySource {
    async fn start(&self) -> Result<()> {
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HealthCheck for MemorySource {
    async fn health_check(&self) -> Result<()> {
        Ok(())
    }

    fn component_name(&self) -> &'static str {
        "memory_source"
    }
}

#[async_trait]
impl MessageSource for MemorySource {
    async fn next_message(&self) -> Result<Option<BrokerMessage>> {
        // Register interest before checking so an append in between is not missed
        let appended = self.log.appended.notified();
        tokio::pin!(appended);
        appended.as_mut().enable();

        if let Some(message) = self.poll_once().await {
            return Ok(Some(message));
        }
        if tokio::time::timeout(self.poll_timeout, appended).await.is_err() {
            return Ok(None);
        }
        Ok(self.poll_once().await)
    }

    async fn commit(&self, message: &BrokerMessage) -> Result<()> {
        self.committed.fetch_max(message.offset, Ordering::SeqCst);
        trace!(offset = message.offset, "Committed");
        Ok(())
    }
}

/// Publisher into a [`MemoryBroker`]
pub struct MemorySink {
    broker: MemoryBroker,
    delivery_timeout: Duration,
    running: AtomicBool,
}

#[async_trait]
impl Lifecycle for MemorySink {
    async fn start(&self) -> Result<()> {
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HealthCheck for MemorySink {
    async fn health_check(&self) -> Result<()> {
        Ok(())
    }

    fn component_name(&self) -> &'static str {
        "memory_sink"
    }
}

#[async_trait]
impl MessageSink for MemorySink {
    async fn publish(&self, topic: &str, key: &str, payload: Bytes) -> Result<()> {
        if let Some(reason) = self.broker.log.publish_failure.lock().await.clone() {
            return Err(GatewayError::broker(reason));
        }
        self.broker.append(topic, Some(key), payload).await;

        // The message is in the log even when its confirmation never arrives
        let delay = *self.broker.log.confirm_delay.lock().await;
        if let Some(delay) = delay {
            let timeout = self.delivery_timeout;
            tokio::time::timeout(timeout, tokio::time::sleep(delay))
                .await
                .map_err(|_| GatewayError::timeout("publish confirmation", timeout.as_millis() as u64))?;
        }
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        if let Some(reason) = self.broker.log.flush_failure.lock().await.clone() {
            return Err(GatewayError::broker(reason));
        }
        Ok(())
    }
}
