//! Change-envelope decoder
//!
//! Two entry points sharing payload construction:
//! - [`decode_change_message`] parses a raw per-table change-capture message
//!   whose topic name encodes the network and category.
//! - [`decode_unified_message`] parses the aggregated-topic envelope and
//!   rebuilds the typed payload for its `UpdateType`.

use serde::Deserialize;
use serde_json::Value;

use crate::error::{GatewayError, Result};
use crate::message::{
    base64_bytes, GatewayConfigUpdate, GatewayRecordUpdate, GatewayStatusUpdate, GatewayUpdate,
    Operation, UpdatePayload, UpdateType,
};

/// Matches `<prefix>.<network>_<category>` change topic names
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicPattern {
    prefix: String,
}

impl TopicPattern {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Broker subject filter covering every change topic under the prefix
    pub fn subject_filter(&self) -> String {
        format!("{}.>", self.prefix)
    }

    /// Topic name for one network and category
    pub fn topic_for(&self, network_id: &str, update_type: UpdateType) -> String {
        format!("{}.{}_{}", self.prefix, network_id, update_type.topic_suffix())
    }

    /// Extract `(network_id, category)` from a topic name
    pub fn parse(&self, topic: &str) -> Result<(String, UpdateType)> {
        let unknown = || GatewayError::UnknownTopic {
            topic: topic.to_string(),
        };

        let rest = topic
            .strip_prefix(self.prefix.as_str())
            .and_then(|rest| rest.strip_prefix('.'))
            .ok_or_else(unknown)?;

        for update_type in UpdateType::all() {
            let Some(network_id) = rest
                .strip_suffix(update_type.topic_suffix())
                .and_then(|head| head.strip_suffix('_'))
            else {
                continue;
            };
            if !network_id.is_empty() {
                return Ok((network_id.to_string(), update_type));
            }
        }
        Err(unknown())
    }
}

/// Outer change-capture message; `payload` is null for heartbeats
#[derive(Debug, Deserialize)]
struct ChangeEnvelope {
    payload: Option<ChangePayload>,
}

#[derive(Debug, Deserialize)]
struct ChangePayload {
    op: String,
    #[serde(default)]
    before: Option<ChangeRow>,
    #[serde(default)]
    after: Option<ChangeRow>,
}

/// One row snapshot of a source table
#[derive(Debug, Deserialize)]
struct ChangeRow {
    key: String,
    #[serde(default, with = "base64_bytes")]
    value: Vec<u8>,
    #[serde(rename = "type", default)]
    config_type: Option<String>,
}

/// Decode a raw change-capture message.
///
/// Returns `Ok(None)` for a null-payload envelope, which callers skip.
pub fn decode_change_message(
    pattern: &TopicPattern,
    topic: &str,
    bytes: &[u8],
) -> Result<Option<GatewayUpdate>> {
    let (network_id, update_type) = pattern.parse(topic)?;

    let envelope: ChangeEnvelope = serde_json::from_slice(bytes)
        .map_err(|e| GatewayError::decode_with_source(format!("Malformed change envelope on {}", topic), e))?;
    let Some(change) = envelope.payload else {
        return Ok(None);
    };

    let operation = Operation::from_code(&change.op)?;
    let row = if operation.is_upsert() {
        change.after
    } else {
        change.before
    }
    .ok_or_else(|| {
        GatewayError::decode(format!(
            "Change envelope on {} has no row image for operation {}",
            topic, operation
        ))
    })?;

    let payload = payload_from_row(update_type, row)?;
    Ok(Some(GatewayUpdate::new(operation, network_id, payload)))
}

fn payload_from_row(update_type: UpdateType, row: ChangeRow) -> Result<UpdatePayload> {
    let payload = match update_type {
        UpdateType::Config => {
            let config_type = row
                .config_type
                .ok_or_else(|| GatewayError::decode("Config row is missing its type"))?;
            UpdatePayload::Config(GatewayConfigUpdate {
                config_key: row.key,
                config_type,
                config_bytes: row.value,
            })
        }
        UpdateType::Status => UpdatePayload::Status(GatewayStatusUpdate {
            gateway_id: row.key,
            status_bytes: row.value,
        }),
        UpdateType::Record => UpdatePayload::Record(GatewayRecordUpdate {
            gateway_id: row.key,
            record_bytes: row.value,
        }),
    };
    Ok(payload)
}

/// Unified envelope with its payload left as a generic mapping
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct UnifiedEnvelope {
    #[serde(rename = "UpdateType")]
    update_type: UpdateType,
    #[serde(rename = "Operation")]
    operation: String,
    #[serde(rename = "NetworkID")]
    network_id: String,
    #[serde(rename = "Payload")]
    payload: Value,
}

/// Decode a message from the unified topic
pub fn decode_unified_message(bytes: &[u8]) -> Result<GatewayUpdate> {
    let envelope: UnifiedEnvelope = serde_json::from_slice(bytes)
        .map_err(|e| GatewayError::decode_with_source("Malformed unified envelope", e))?;

    let operation = Operation::from_code(&envelope.operation)?;
    let payload = payload_from_value(envelope.update_type, envelope.payload)?;
    Ok(GatewayUpdate::new(operation, envelope.network_id, payload))
}

/// Build the typed payload for `update_type`; unknown fields are rejected
fn payload_from_value(update_type: UpdateType, value: Value) -> Result<UpdatePayload> {
    let invalid = |e: serde_json::Error| {
        GatewayError::decode_with_source(format!("Invalid {} payload", update_type), e)
    };
    let payload = match update_type {
        UpdateType::Config => UpdatePayload::Config(serde_json::from_value(value).map_err(invalid)?),
        UpdateType::Status => UpdatePayload::Status(serde_json::from_value(value).map_err(invalid)?),
        UpdateType::Record => UpdatePayload::Record(serde_json::from_value(value).map_err(invalid)?),
    };
    Ok(payload)
}
