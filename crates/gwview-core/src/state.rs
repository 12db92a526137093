//! Materialized gateway view state
//!
//! [`GatewayState`] is what readers see; [`GatewayUpdateParams`] is what the
//! recorder hands to a store. Every store enforces the same offset rule:
//! an update lands only if its offset is strictly greater than the stored one.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::error::{GatewayError, Result};

/// Reporters send `null` for fields they have no value for
fn null_as_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Option::unwrap_or_default)
}

/// Last-reported health snapshot of a gateway
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayStatus {
    /// Checkin time in milliseconds since the epoch
    #[serde(deserialize_with = "null_as_default")]
    pub checkin_time: u64,
    #[serde(deserialize_with = "null_as_default")]
    pub hardware_id: String,
    #[serde(deserialize_with = "null_as_default")]
    pub cert_expiration_time: i64,
    /// Fields this build does not model
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl GatewayStatus {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| GatewayError::decode_with_source("Failed to decode gateway status", e))
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|e| GatewayError::serialization_with_source("Failed to encode gateway status", e))
    }
}

/// Registration record of a gateway
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayRecord {
    #[serde(deserialize_with = "null_as_default")]
    pub hardware_id: String,
    #[serde(deserialize_with = "null_as_default")]
    pub name: String,
    #[serde(deserialize_with = "null_as_default")]
    pub description: String,
    /// Challenge key material, opaque to the view
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl GatewayRecord {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| GatewayError::decode_with_source("Failed to decode gateway record", e))
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|e| GatewayError::serialization_with_source("Failed to encode gateway record", e))
    }
}

/// Everything known about one gateway
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GatewayState {
    pub gateway_id: String,
    /// Decoded config objects keyed by config type
    pub config: BTreeMap<String, Value>,
    pub status: Option<GatewayStatus>,
    pub record: Option<GatewayRecord>,
    /// Unified-stream position of the last applied update
    pub offset: i64,
}

impl GatewayState {
    pub fn new(gateway_id: impl Into<String>) -> Self {
        Self {
            gateway_id: gateway_id.into(),
            ..Default::default()
        }
    }

    /// State of a gateway created by its first update
    pub fn from_params(gateway_id: impl Into<String>, params: &GatewayUpdateParams) -> Self {
        let mut state = Self::new(gateway_id);
        state.merge(params);
        state
    }

    /// Apply `params` if it is newer than this state.
    ///
    /// Returns `false` when the update is stale and nothing changed.
    pub fn apply(&mut self, params: &GatewayUpdateParams) -> bool {
        if params.offset <= self.offset {
            return false;
        }
        self.merge(params);
        true
    }

    fn merge(&mut self, params: &GatewayUpdateParams) {
        if let Some(ref configs) = params.new_configs {
            for (config_type, value) in configs {
                self.config.insert(config_type.clone(), value.clone());
            }
        }
        if let Some(ref deleted) = params.configs_to_delete {
            for config_type in deleted {
                self.config.remove(config_type);
            }
        }
        if let Some(ref status) = params.new_status {
            self.status = Some(status.clone());
        }
        if let Some(ref record) = params.new_record {
            self.record = Some(record.clone());
        }
        self.offset = params.offset;
    }
}

/// Storage-facing update request. `None` fields leave the stored value unchanged.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GatewayUpdateParams {
    pub new_configs: Option<BTreeMap<String, Value>>,
    pub configs_to_delete: Option<Vec<String>>,
    pub new_status: Option<GatewayStatus>,
    pub new_record: Option<GatewayRecord>,
    pub offset: i64,
}

impl GatewayUpdateParams {
    pub fn at_offset(offset: i64) -> Self {
        Self {
            offset,
            ..Default::default()
        }
    }

    pub fn with_config(mut self, config_type: impl Into<String>, value: Value) -> Self {
        self.new_configs
            .get_or_insert_with(BTreeMap::new)
            .insert(config_type.into(), value);
        self
    }

    pub fn delete_config(mut self, config_type: impl Into<String>) -> Self {
        self.configs_to_delete
            .get_or_insert_with(Vec::new)
            .push(config_type.into());
        self
    }

    pub fn with_status(mut self, status: GatewayStatus) -> Self {
        self.new_status = Some(status);
        self
    }

    pub fn with_record(mut self, record: GatewayRecord) -> Self {
        self.new_record = Some(record);
        self
    }

    /// Whether the config column or attributes change under this update
    pub fn touches_configs(&self) -> bool {
        self.new_configs.as_ref().is_some_and(|c| !c.is_empty())
            || self.configs_to_delete.as_ref().is_some_and(|d| !d.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_stale_update_is_rejected() {
        let mut state = GatewayState::from_params(
            "gw1",
            &GatewayUpdateParams::at_offset(5).with_config("mme", json!({"a": 1})),
        );

        let applied = state.apply(&GatewayUpdateParams::at_offset(5).with_config("mme", json!({"a": 2})));
        assert!(!applied);
        assert_eq!(state.config["mme"], json!({"a": 1}));

        let applied = state.apply(&GatewayUpdateParams::at_offset(3).delete_config("mme"));
        assert!(!applied);
        assert_eq!(state.offset, 5);
    }

    #[test]
    fn test_upsert_then_delete_converges() {
        let mut state = GatewayState::new("gw1");
        state.apply(&GatewayUpdateParams::at_offset(1).with_config("mme", json!(1)));
        state.apply(&GatewayUpdateParams::at_offset(2).with_config("hss", json!(2)));
        state.apply(&GatewayUpdateParams::at_offset(3).delete_config("mme"));

        assert!(!state.config.contains_key("mme"));
        assert_eq!(state.config["hss"], json!(2));
        assert_eq!(state.offset, 3);
    }

    #[test]
    fn test_status_keeps_unknown_fields() {
        let status = GatewayStatus::from_bytes(br#"{"checkin_time": 10, "kernel": "5.4"}"#).unwrap();
        assert_eq!(status.checkin_time, 10);
        assert_eq!(status.extra["kernel"], json!("5.4"));

        let restored = GatewayStatus::from_bytes(&status.to_bytes().unwrap()).unwrap();
        assert_eq!(restored, status);
    }

    #[test]
    fn test_null_fields_decode_as_empty() {
        let status =
            GatewayStatus::from_bytes(br#"{"checkin_time": 5, "hardware_id": null, "cert_expiration_time": null}"#)
                .unwrap();
        assert_eq!(status.checkin_time, 5);
        assert_eq!(status.hardware_id, "");
        assert_eq!(status.cert_expiration_time, 0);

        let record = GatewayRecord::from_bytes(br#"{"hardware_id": "hw1", "name": null, "description": null}"#).unwrap();
        assert_eq!(record.hardware_id, "hw1");
        assert!(record.name.is_empty());
        assert!(record.description.is_empty());
    }
}
