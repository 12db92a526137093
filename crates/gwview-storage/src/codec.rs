//! Byte encodings shared by the persistent backends

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use gwview_core::prelude::*;
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::warn;

/// Config bytes keyed by config type, as persisted
pub type RawConfigs = BTreeMap<String, Vec<u8>>;

/// Serialize a raw config map into one opaque column value
pub fn encode_config_column(configs: &RawConfigs) -> Result<Vec<u8>> {
    let encoded: BTreeMap<&str, String> = configs
        .iter()
        .map(|(config_type, bytes)| (config_type.as_str(), STANDARD.encode(bytes)))
        .collect();
    serde_json::to_vec(&encoded)
        .map_err(|e| GatewayError::serialization_with_source("Failed to encode config column", e))
}

pub fn decode_config_column(bytes: &[u8]) -> Result<RawConfigs> {
    if bytes.is_empty() {
        return Ok(RawConfigs::new());
    }
    let encoded: BTreeMap<String, String> = serde_json::from_slice(bytes)
        .map_err(|e| GatewayError::decode_with_source("Malformed config column", e))?;
    encoded
        .into_iter()
        .map(|(config_type, text)| {
            let bytes = STANDARD.decode(text).map_err(|e| {
                GatewayError::decode_with_source(format!("Malformed {} config bytes", config_type), e)
            })?;
            Ok((config_type, bytes))
        })
        .collect()
}

/// Fold an update's config additions and removals into `configs`
pub fn merge_raw_configs(
    registry: &ConfigRegistry,
    configs: &mut RawConfigs,
    params: &GatewayUpdateParams,
) -> Result<()> {
    if let Some(ref new_configs) = params.new_configs {
        for (config_type, value) in new_configs {
            configs.insert(config_type.clone(), registry.marshal_config(config_type, value)?);
        }
    }
    if let Some(ref deleted) = params.configs_to_delete {
        for config_type in deleted {
            configs.remove(config_type);
        }
    }
    Ok(())
}

/// Decode persisted configs through the registry.
///
/// Types no longer registered are left out of the view.
pub fn decode_configs(
    registry: &ConfigRegistry,
    gateway_id: &str,
    raw: impl IntoIterator<Item = (String, Vec<u8>)>,
) -> Result<BTreeMap<String, Value>> {
    let mut configs = BTreeMap::new();
    for (config_type, bytes) in raw {
        match registry.unmarshal_config(&config_type, &bytes) {
            Ok(Some(value)) => {
                configs.insert(config_type, value);
            }
            Ok(None) => {}
            Err(GatewayError::UnregisteredConfigType(_)) => {
                warn!(gateway_id, config_type = %config_type, "Skipping unregistered config type");
            }
            Err(e) => return Err(e),
        }
    }
    Ok(configs)
}

pub fn decode_status(bytes: Option<&[u8]>) -> Result<Option<GatewayStatus>> {
    bytes
        .filter(|b| !b.is_empty())
        .map(GatewayStatus::from_bytes)
        .transpose()
}

pub fn decode_record(bytes: Option<&[u8]>) -> Result<Option<GatewayRecord>> {
    bytes
        .filter(|b| !b.is_empty())
        .map(GatewayRecord::from_bytes)
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use gwview_core::JsonConfigManager;
    use serde_json::json;
    use std::sync::Arc;

    #[test]
    fn test_config_column_merge_keeps_untouched_types() {
        let registry = ConfigRegistry::new();
        registry
            .register(Arc::new(JsonConfigManager::gateway_scoped("mme")))
            .unwrap();

        let mut raw = RawConfigs::new();
        raw.insert("retired".into(), b"{}".to_vec());
        raw.insert("mme".into(), b"1".to_vec());

        let params = GatewayUpdateParams::at_offset(2).with_config("mme", json!({"tac": 3}));
        merge_raw_configs(&registry, &mut raw, &params).unwrap();

        let column = encode_config_column(&raw).unwrap();
        let restored = decode_config_column(&column).unwrap();
        assert_eq!(restored["retired"], b"{}".to_vec());

        let decoded = decode_configs(&registry, "gw1", restored).unwrap();
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded["mme"], json!({"tac": 3}));
    }
}
