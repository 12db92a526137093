//! Message types for the gateway view pipeline
//!
//! Defines the unified update envelope that flows from the aggregator to the
//! recorder, its typed payload variants, and the raw broker message shape
//! shared by every transport.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{GatewayError, Result};

/// Serde adapter for binary fields carried as base64 text on the wire.
///
/// A JSON `null` or a missing field decodes to an empty buffer.
pub mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        match Option::<String>::deserialize(deserializer)? {
            Some(text) => STANDARD
                .decode(text.as_bytes())
                .map_err(serde::de::Error::custom),
            None => Ok(Vec::new()),
        }
    }
}

/// Change operation code as emitted by the capture system
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Create,
    Read,
    Update,
    Delete,
}

impl Operation {
    /// Parse a single-letter operation code
    pub fn from_code(code: &str) -> Result<Self> {
        match code {
            "c" => Ok(Self::Create),
            "r" => Ok(Self::Read),
            "u" => Ok(Self::Update),
            "d" => Ok(Self::Delete),
            other => Err(GatewayError::UnrecognizedOperation(other.to_string())),
        }
    }

    pub fn as_code(&self) -> &'static str {
        match self {
            Self::Create => "c",
            Self::Read => "r",
            Self::Update => "u",
            Self::Delete => "d",
        }
    }

    /// Create, read and update all collapse to an upsert
    pub fn is_upsert(&self) -> bool {
        !matches!(self, Self::Delete)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_code())
    }
}

impl Serialize for Operation {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_code())
    }
}

/// Category of a gateway update
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateType {
    Config,
    Status,
    Record,
}

impl UpdateType {
    /// Suffix of the per-network change topic carrying this category
    pub fn topic_suffix(&self) -> &'static str {
        match self {
            Self::Config => "configurations",
            Self::Status => "gwstatus",
            Self::Record => "gatewayrecords",
        }
    }

    pub fn all() -> [UpdateType; 3] {
        [Self::Config, Self::Status, Self::Record]
    }
}

impl fmt::Display for UpdateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Config => "config",
            Self::Status => "status",
            Self::Record => "record",
        };
        f.write_str(name)
    }
}

/// A config row change. `config_key` names the scope the config applies to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GatewayConfigUpdate {
    #[serde(rename = "ConfigKey")]
    pub config_key: String,
    #[serde(rename = "ConfigType")]
    pub config_type: String,
    #[serde(rename = "ConfigBytes", with = "base64_bytes", default)]
    pub config_bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GatewayStatusUpdate {
    #[serde(rename = "GatewayID")]
    pub gateway_id: String,
    #[serde(rename = "StatusBytes", with = "base64_bytes", default)]
    pub status_bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GatewayRecordUpdate {
    #[serde(rename = "GatewayID")]
    pub gateway_id: String,
    #[serde(rename = "RecordBytes", with = "base64_bytes", default)]
    pub record_bytes: Vec<u8>,
}

/// Typed payload, one variant per update category
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum UpdatePayload {
    Config(GatewayConfigUpdate),
    Status(GatewayStatusUpdate),
    Record(GatewayRecordUpdate),
}

impl UpdatePayload {
    pub fn update_type(&self) -> UpdateType {
        match self {
            Self::Config(_) => UpdateType::Config,
            Self::Status(_) => UpdateType::Status,
            Self::Record(_) => UpdateType::Record,
        }
    }

    /// Gateway the payload names directly; config payloads name a scope instead
    pub fn gateway_id(&self) -> Option<&str> {
        match self {
            Self::Config(_) => None,
            Self::Status(s) => Some(&s.gateway_id),
            Self::Record(r) => Some(&r.gateway_id),
        }
    }
}

/// Unified update envelope published on the aggregated topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayUpdate {
    pub operation: Operation,
    pub network_id: String,
    pub payload: UpdatePayload,
}

/// Wire shape of [`GatewayUpdate`]
#[derive(Serialize)]
struct UnifiedEnvelopeRef<'a> {
    #[serde(rename = "UpdateType")]
    update_type: UpdateType,
    #[serde(rename = "Operation")]
    operation: Operation,
    #[serde(rename = "NetworkID")]
    network_id: &'a str,
    #[serde(rename = "Payload")]
    payload: &'a UpdatePayload,
}

impl GatewayUpdate {
    pub fn new(operation: Operation, network_id: impl Into<String>, payload: UpdatePayload) -> Self {
        Self {
            operation,
            network_id: network_id.into(),
            payload,
        }
    }

    pub fn update_type(&self) -> UpdateType {
        self.payload.update_type()
    }

    /// Serialize to the unified JSON envelope
    pub fn to_bytes(&self) -> Result<Bytes> {
        let wire = UnifiedEnvelopeRef {
            update_type: self.update_type(),
            operation: self.operation,
            network_id: &self.network_id,
            payload: &self.payload,
        };
        serde_json::to_vec(&wire)
            .map(Bytes::from)
            .map_err(|e| GatewayError::serialization_with_source("Failed to encode update", e))
    }

    /// Deserialize from the unified JSON envelope
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        crate::decoder::decode_unified_message(bytes)
    }

    /// Whether this update touches the given gateway without scope resolution
    pub fn names_gateway(&self, gateway_id: &str) -> bool {
        match &self.payload {
            UpdatePayload::Config(c) => c.config_key == gateway_id,
            other => other.gateway_id() == Some(gateway_id),
        }
    }
}

/// A message as read from, or written to, the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMessage {
    /// Topic (subject) the message was published on
    pub topic: String,
    /// Partitioning key, the network ID on the unified topic
    pub key: Option<String>,
    pub payload: Bytes,
    /// Position of the message in its stream
    pub offset: i64,
}

impl BrokerMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>, offset: i64) -> Self {
        Self {
            topic: topic.into(),
            key: None,
            payload: payload.into(),
            offset,
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_codes() {
        assert_eq!(Operation::from_code("c").unwrap(), Operation::Create);
        assert_eq!(Operation::from_code("d").unwrap(), Operation::Delete);
        assert!(Operation::Read.is_upsert());
        assert!(!Operation::Delete.is_upsert());

        let err = Operation::from_code("x").unwrap_err();
        assert!(matches!(err, GatewayError::UnrecognizedOperation(code) if code == "x"));
    }

    #[test]
    fn test_unified_envelope_wire_shape() {
        let update = GatewayUpdate::new(
            Operation::Update,
            "net1",
            UpdatePayload::Status(GatewayStatusUpdate {
                gateway_id: "gw1".to_string(),
                status_bytes: b"up".to_vec(),
            }),
        );

        let value: serde_json::Value = serde_json::from_slice(&update.to_bytes().unwrap()).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "UpdateType": "status",
                "Operation": "u",
                "NetworkID": "net1",
                "Payload": {"GatewayID": "gw1", "StatusBytes": "dXA="}
            })
        );
    }

    #[test]
    fn test_names_gateway() {
        let update = GatewayUpdate::new(
            Operation::Create,
            "net1",
            UpdatePayload::Config(GatewayConfigUpdate {
                config_key: "gw1".to_string(),
                config_type: "mme".to_string(),
                config_bytes: Vec::new(),
            }),
        );
        assert!(update.names_gateway("gw1"));
        assert!(!update.names_gateway("gw2"));
    }
}
