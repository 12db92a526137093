//! Source-of-truth service clients
//!
//! HTTP clients for the configuration and status services, plus an
//! in-memory stand-in holding the same data.
//!
//! Endpoints, relative to the service base URL:
//! - `GET /networks/{network}/gateways` - JSON array of gateway IDs
//! - `GET /networks/{network}/gateways/{gateway}/device` - record bytes
//! - `GET /networks/{network}/gateways/{gateway}/configs` - JSON object, type to base64 bytes
//! - `GET /networks/{network}/gateways/{gateway}/status` - status bytes

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use gwview_core::config::ServicesConfig;
use gwview_core::prelude::*;
use parking_lot::RwLock;
use reqwest::{Client, StatusCode};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::trace;

fn http_client(config: &ServicesConfig) -> Result<Client> {
    Client::builder()
        .connect_timeout(config.connect_timeout)
        .timeout(config.request_timeout)
        .build()
        .map_err(|e| GatewayError::service_with_source("Failed to create HTTP client", e))
}

/// GET `url`; `Ok(None)` on 404
async fn fetch(client: &Client, url: &str) -> Result<Option<reqwest::Response>> {
    let resp = client
        .get(url)
        .send()
        .await
        .map_err(|e| GatewayError::service_with_source(format!("GET {} failed", url), e))?;

    match resp.status() {
        status if status.is_success() => Ok(Some(resp)),
        StatusCode::NOT_FOUND => Ok(None),
        status => {
            let body = resp.text().await.unwrap_or_default();
            Err(GatewayError::service(format!(
                "GET {} returned {}: {}",
                url, status, body
            )))
        }
    }
}

async fn body_bytes(resp: reqwest::Response, url: &str) -> Result<Vec<u8>> {
    resp.bytes()
        .await
        .map(|b| b.to_vec())
        .map_err(|e| GatewayError::service_with_source(format!("Failed to read {}", url), e))
}

fn gateway_url(base: &str, network_id: &str, gateway_id: &str, leaf: &str) -> String {
    format!(
        "{}/networks/{}/gateways/{}/{}",
        base.trim_end_matches('/'),
        network_id,
        gateway_id,
        leaf
    )
}

/// Configuration service over HTTP
pub struct HttpConfigurationService {
    client: Client,
    base_url: String,
}

impl HttpConfigurationService {
    pub fn new(config: &ServicesConfig) -> Result<Self> {
        Ok(Self {
            client: http_client(config)?,
            base_url: config.configurator_url.clone(),
        })
    }
}

#[async_trait]
impl ConfigurationService for HttpConfigurationService {
    async fn list_gateway_ids(&self, network_id: &str) -> Result<Vec<String>> {
        let url = format!(
            "{}/networks/{}/gateways",
            self.base_url.trim_end_matches('/'),
            network_id
        );
        let resp = fetch(&self.client, &url)
            .await?
            .ok_or_else(|| GatewayError::not_found(format!("network {}", network_id)))?;
        let ids: Vec<String> = resp
            .json()
            .await
            .map_err(|e| GatewayError::service_with_source("Malformed gateway list", e))?;
        trace!(network_id, count = ids.len(), "Listed gateways");
        Ok(ids)
    }

    async fn load_record(&self, network_id: &str, gateway_id: &str) -> Result<Vec<u8>> {
        let url = gateway_url(&self.base_url, network_id, gateway_id, "device");
        let resp = fetch(&self.client, &url)
            .await?
            .ok_or_else(|| GatewayError::not_found(format!("gateway {}", gateway_id)))?;
        body_bytes(resp, &url).await
    }

    async fn load_configs(
        &self,
        network_id: &str,
        gateway_id: &str,
    ) -> Result<BTreeMap<String, Vec<u8>>> {
        let url = gateway_url(&self.base_url, network_id, gateway_id, "configs");
        let Some(resp) = fetch(&self.client, &url).await? else {
            return Ok(BTreeMap::new());
        };
        let encoded: BTreeMap<String, String> = resp
            .json()
            .await
            .map_err(|e| GatewayError::service_with_source("Malformed config listing", e))?;

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
}

/// Status service over HTTP
pub struct HttpStatusService {
    client: Client,
    base_url: String,
}

impl HttpStatusService {
    pub fn new(config: &ServicesConfig) -> Result<Self> {
        Ok(Self {
            client: http_client(config)?,
            base_url: config.state_url.clone(),
        })
    }
}

#[async_trait]
impl StatusService for HttpStatusService {
    async fn load_status(&self, network_id: &str, gateway_id: &str) -> Result<Option<Vec<u8>>> {
        let url = gateway_url(&self.base_url, network_id, gateway_id, "status");
        match fetch(&self.client, &url).await? {
            Some(resp) => body_bytes(resp, &url).await.map(Some),
            None => Ok(None),
        }
    }
}

/// Both services from configuration
pub fn http_services(
    config: &ServicesConfig,
) -> Result<(Arc<dyn ConfigurationService>, Arc<dyn StatusService>)> {
    Ok((
        Arc::new(HttpConfigurationService::new(config)?),
        Arc::new(HttpStatusService::new(config)?),
    ))
}

// ============================================================================
// In-memory source of truth
// ============================================================================

#[derive(Debug, Clone, Default)]
struct GatewayEntry {
    record: Vec<u8>,
    configs: BTreeMap<String, Vec<u8>>,
    status: Option<Vec<u8>>,
}

/// Source-of-truth data held in memory
#[derive(Default)]
pub struct MemorySourceOfTruth {
    networks: RwLock<HashMap<String, BTreeMap<String, GatewayEntry>>>,
}

impl MemorySourceOfTruth {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_network(&self, network_id: &str) {
        self.networks
            .write()
            .entry(network_id.to_string())
            .or_default();
    }

    pub fn put_record(&self, network_id: &str, gateway_id: &str, record: Vec<u8>) {
        self.entry(network_id, gateway_id, |e| e.record = record);
    }

    pub fn put_config(&self, network_id: &str, gateway_id: &str, config_type: &str, bytes: Vec<u8>) {
        self.entry(network_id, gateway_id, |e| {
            e.configs.insert(config_type.to_string(), bytes);
        });
    }

    pub fn put_status(&self, network_id: &str, gateway_id: &str, status: Vec<u8>) {
        self.entry(network_id, gateway_id, |e| e.status = Some(status));
    }

    fn entry(&self, network_id: &str, gateway_id: &str, f: impl FnOnce(&mut GatewayEntry)) {
        let mut networks = self.networks.write();
        let gateways = networks.entry(network_id.to_string()).or_default();
        f(gateways.entry(gateway_id.to_string()).or_default());
    }

    fn gateway(&self, network_id: &str, gateway_id: &str) -> Result<GatewayEntry> {
        self.networks
            .read()
            .get(network_id)
            .ok_or_else(|| GatewayError::not_found(format!("network {}", network_id)))?
            .get(gateway_id)
            .cloned()
            .ok_or_else(|| GatewayError::not_found(format!("gateway {}", gateway_id)))
    }
}

#[async_trait]
impl ConfigurationService for MemorySourceOfTruth {
    async fn list_gateway_ids(&self, network_id: &str) -> Result<Vec<String>> {
        self.networks
            .read()
            .get(network_id)
            .map(|gateways| gateways.keys().cloned().collect())
            .ok_or_else(|| GatewayError::not_found(format!("network {}", network_id)))
    }

    async fn load_record(&self, network_id: &str, gateway_id: &str) -> Result<Vec<u8>> {
        Ok(self.gateway(network_id, gateway_id)?.record)
    }

    async fn load_configs(
        &self,
        network_id: &str,
        gateway_id: &str,
    ) -> Result<BTreeMap<String, Vec<u8>>> {
        Ok(self.gateway(network_id, gateway_id)?.configs)
    }
}

#[async_trait]
impl StatusService for MemorySourceOfTruth {
    async fn load_status(&self, network_id: &str, gateway_id: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.gateway(network_id, gateway_id)?.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gateway_url_trims_slash() {
        assert_eq!(
            gateway_url("http://cfg:9100/", "net1", "gw1", "device"),
            "http://cfg:9100/networks/net1/gateways/gw1/device"
        );
    }

    #[tokio::test]
    async fn test_memory_source_of_truth() {
        let truth = MemorySourceOfTruth::new();
        truth.add_network("empty");
        truth.put_record("net1", "gw1", b"{}".to_vec());
        truth.put_config("net1", "gw1", "mme", b"1".to_vec());

        assert!(truth.list_gateway_ids("empty").await.unwrap().is_empty());
        assert_eq!(truth.list_gateway_ids("net1").await.unwrap(), vec!["gw1"]);
        assert_eq!(truth.load_status("net1", "gw1").await.unwrap(), None);
        assert!(truth.list_gateway_ids("net9").await.unwrap_err().is_not_found());
    }
}
