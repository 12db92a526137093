//! Config type registry
//!
//! Maps a config type name to the manager that (de)serializes it and
//! resolves which gateways a config scope applies to. Built once at startup
//! and shared by reference; reads vastly outnumber writes.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{GatewayError, Result};
use crate::strategy::ConfigurationService;

/// Per-type config behaviour
#[async_trait]
pub trait ConfigManager: Send + Sync {
    /// Type name the manager is registered under
    fn config_type(&self) -> &str;

    fn marshal(&self, config: &Value) -> Result<Vec<u8>>;

    fn unmarshal(&self, bytes: &[u8]) -> Result<Value>;

    /// Gateways the config stored under `config_key` applies to
    async fn gateway_ids_for_config(&self, network_id: &str, config_key: &str)
        -> Result<Vec<String>>;
}

/// How a config key resolves to gateways
#[derive(Clone)]
pub enum ConfigScope {
    /// The key is the gateway ID
    Gateway,
    /// The key names the network; every gateway in it is targeted
    Network(Arc<dyn ConfigurationService>),
}

/// JSON-encoded config type
pub struct JsonConfigManager {
    config_type: String,
    scope: ConfigScope,
}

impl JsonConfigManager {
    pub fn gateway_scoped(config_type: impl Into<String>) -> Self {
        Self {
            config_type: config_type.into(),
            scope: ConfigScope::Gateway,
        }
    }

    pub fn network_scoped(
        config_type: impl Into<String>,
        directory: Arc<dyn ConfigurationService>,
    ) -> Self {
        Self {
            config_type: config_type.into(),
            scope: ConfigScope::Network(directory),
        }
    }
}

#[async_trait]
impl ConfigManager for JsonConfigManager {
    fn config_type(&self) -> &str {
        &self.config_type
    }

    fn marshal(&self, config: &Value) -> Result<Vec<u8>> {
        serde_json::to_vec(config).map_err(|e| {
            GatewayError::serialization_with_source(
                format!("Failed to marshal {} config", self.config_type),
                e,
            )
        })
    }

    fn unmarshal(&self, bytes: &[u8]) -> Result<Value> {
        serde_json::from_slice(bytes).map_err(|e| {
            GatewayError::decode_with_source(
                format!("Failed to unmarshal {} config", self.config_type),
                e,
            )
        })
    }

    async fn gateway_ids_for_config(
        &self,
        network_id: &str,
        config_key: &str,
    ) -> Result<Vec<String>> {
        match &self.scope {
            ConfigScope::Gateway => Ok(vec![config_key.to_string()]),
            ConfigScope::Network(directory) => directory.list_gateway_ids(network_id).await,
        }
    }
}

/// Scope of a config type as declared in configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigScopeKind {
    Gateway,
    Network,
}

/// Config type declaration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigTypeSpec {
    pub name: String,
    pub scope: ConfigScopeKind,
}

/// Registry of config managers keyed by type name
#[derive(Default)]
pub struct ConfigRegistry {
    managers: RwLock<HashMap<String, Arc<dyn ConfigManager>>>,
}

impl ConfigRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry of JSON managers from declarations
    pub fn from_specs(
        specs: &[ConfigTypeSpec],
        directory: Arc<dyn ConfigurationService>,
    ) -> Result<Self> {
        let registry = Self::new();
        let managers = specs
            .iter()
            .map(|spec| -> Arc<dyn ConfigManager> {
                match spec.scope {
                    ConfigScopeKind::Gateway => Arc::new(JsonConfigManager::gateway_scoped(&spec.name)),
                    ConfigScopeKind::Network => {
                        Arc::new(JsonConfigManager::network_scoped(&spec.name, directory.clone()))
                    }
                }
            })
            .collect();
        registry.register_all(managers)?;
        Ok(registry)
    }

    /// Register one manager; an existing registration is never overwritten
    pub fn register(&self, manager: Arc<dyn ConfigManager>) -> Result<()> {
        self.register_all(vec![manager])
    }

    /// Register a batch. Either every manager is registered or none is.
    pub fn register_all(&self, managers: Vec<Arc<dyn ConfigManager>>) -> Result<()> {
        let mut registered = self.managers.write();
        let mut added: Vec<String> = Vec::with_capacity(managers.len());

        for manager in managers {
            let config_type = manager.config_type().to_string();
            if registered.contains_key(&config_type) {
                for rollback in &added {
                    registered.remove(rollback);
                }
                return Err(GatewayError::AlreadyRegistered(config_type));
            }
            registered.insert(config_type.clone(), manager);
            added.push(config_type);
        }
        Ok(())
    }

    fn manager(&self, config_type: &str) -> Result<Arc<dyn ConfigManager>> {
        self.managers
            .read()
            .get(config_type)
            .cloned()
            .ok_or_else(|| GatewayError::UnregisteredConfigType(config_type.to_string()))
    }

    pub fn is_registered(&self, config_type: &str) -> bool {
        self.managers.read().contains_key(config_type)
    }

    /// Registered type names, sorted
    pub fn registered_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.managers.read().keys().cloned().collect();
        types.sort();
        types
    }

    pub fn marshal_config(&self, config_type: &str, config: &Value) -> Result<Vec<u8>> {
        self.manager(config_type)?.marshal(config)
    }

    /// Decode a config. An empty payload decodes to `None`.
    pub fn unmarshal_config(&self, config_type: &str, bytes: &[u8]) -> Result<Option<Value>> {
        let manager = self.manager(config_type)?;
        if bytes.is_empty() {
            return Ok(None);
        }
        manager.unmarshal(bytes).map(Some)
    }

    pub async fn gateway_ids_for_config(
        &self,
        config_type: &str,
        network_id: &str,
        config_key: &str,
    ) -> Result<Vec<String>> {
        // Clone the manager out so the lock is not held across the await
        let manager = self.manager(config_type)?;
        manager.gateway_ids_for_config(network_id, config_key).await
    }
}

impl std::fmt::Debug for ConfigRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigRegistry")
            .field("types", &self.registered_types())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;

    struct FixedDirectory(Vec<String>);

    #[async_trait]
    impl ConfigurationService for FixedDirectory {
        async fn list_gateway_ids(&self, _network_id: &str) -> Result<Vec<String>> {
            Ok(self.0.clone())
        }

        async fn load_record(&self, _network_id: &str, gateway_id: &str) -> Result<Vec<u8>> {
            Err(GatewayError::not_found(format!("gateway {}", gateway_id)))
        }

        async fn load_configs(
            &self,
            _network_id: &str,
            _gateway_id: &str,
        ) -> Result<BTreeMap<String, Vec<u8>>> {
            Ok(BTreeMap::new())
        }
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let registry = ConfigRegistry::new();
        registry
            .register(Arc::new(JsonConfigManager::gateway_scoped("mme")))
            .unwrap();

        let err = registry
            .register(Arc::new(JsonConfigManager::gateway_scoped("mme")))
            .unwrap_err();
        assert!(matches!(err, GatewayError::AlreadyRegistered(t) if t == "mme"));
    }

    #[test]
    fn test_batch_registration_rolls_back() {
        let registry = ConfigRegistry::new();
        registry
            .register(Arc::new(JsonConfigManager::gateway_scoped("hss")))
            .unwrap();

        let result = registry.register_all(vec![
            Arc::new(JsonConfigManager::gateway_scoped("mme")),
            Arc::new(JsonConfigManager::gateway_scoped("hss")),
        ]);
        assert!(result.is_err());
        assert!(!registry.is_registered("mme"));
        assert_eq!(registry.registered_types(), vec!["hss".to_string()]);
    }

    #[test]
    fn test_unmarshal_unknown_and_empty() {
        let registry = ConfigRegistry::new();
        registry
            .register(Arc::new(JsonConfigManager::gateway_scoped("mme")))
            .unwrap();

        assert!(matches!(
            registry.unmarshal_config("nope", b"{}"),
            Err(GatewayError::UnregisteredConfigType(_))
        ));
        assert_eq!(registry.unmarshal_config("mme", b"").unwrap(), None);

        let bytes = registry.marshal_config("mme", &json!({"tac": 1})).unwrap();
        assert_eq!(
            registry.unmarshal_config("mme", &bytes).unwrap(),
            Some(json!({"tac": 1}))
        );
    }

    #[tokio::test]
    async fn test_scope_resolution() {
        let directory = Arc::new(FixedDirectory(vec!["gw1".into(), "gw2".into()]));
        let registry = ConfigRegistry::from_specs(
            &[
                ConfigTypeSpec {
                    name: "gateway_cellular".into(),
                    scope: ConfigScopeKind::Gateway,
                },
                ConfigTypeSpec {
                    name: "network_features".into(),
                    scope: ConfigScopeKind::Network,
                },
            ],
            directory,
        )
        .unwrap();

        let ids = registry
            .gateway_ids_for_config("gateway_cellular", "net1", "gw7")
            .await
            .unwrap();
        assert_eq!(ids, vec!["gw7".to_string()]);

        let ids = registry
            .gateway_ids_for_config("network_features", "net1", "net1")
            .await
            .unwrap();
        assert_eq!(ids.len(), 2);
    }
}
