//! Wide-column view store
//!
//! Items are keyed by (`NetworkID`, `GatewayID`). The network ID is
//! lower-cased on every path. Each config type is its own `cfg_<type>`
//! attribute. Batch calls are capped at [`MAX_BATCH_SIZE`] items and
//! unprocessed items are retried through [`run_batched`].

use async_trait::async_trait;
use gwview_core::metrics::StorageMetrics;
use gwview_core::prelude::*;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, trace};

use crate::batch::{run_batched, BatchOutcome, MAX_BATCH_SIZE};
use crate::codec::{decode_configs, decode_record, decode_status};

pub const NETWORK_ID_ATTR: &str = "NetworkID";
pub const GATEWAY_ID_ATTR: &str = "GatewayID";
pub const STATUS_ATTR: &str = "Status";
pub const RECORD_ATTR: &str = "Record";
pub const OFFSET_ATTR: &str = "Offset";
pub const CONFIG_ATTR_PREFIX: &str = "cfg_";

/// Attribute value
#[derive(Debug, Clone, PartialEq)]
pub enum Attr {
    S(String),
    N(i64),
    B(Vec<u8>),
}

/// One stored item, attribute name to value
pub type Item = BTreeMap<String, Attr>;

/// Primary key of an item
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ItemKey {
    pub network_id: String,
    pub gateway_id: String,
}

impl ItemKey {
    pub fn new(network_id: &str, gateway_id: &str) -> Self {
        Self {
            network_id: network_id.to_lowercase(),
            gateway_id: gateway_id.to_string(),
        }
    }

    pub fn of(item: &Item) -> Option<Self> {
        match (item.get(NETWORK_ID_ATTR), item.get(GATEWAY_ID_ATTR)) {
            (Some(Attr::S(network)), Some(Attr::S(gateway))) => Some(Self {
                network_id: network.clone(),
                gateway_id: gateway.clone(),
            }),
            _ => None,
        }
    }
}

/// Keys for `gateway_ids` in first-seen order, each at most once
fn unique_keys(network_id: &str, gateway_ids: &[String]) -> Vec<ItemKey> {
    let mut seen = HashSet::new();
    gateway_ids
        .iter()
        .map(|id| ItemKey::new(network_id, id))
        .filter(|key| seen.insert(key.clone()))
        .collect()
}

impl std::fmt::Display for ItemKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.network_id, self.gateway_id)
    }
}

/// One element of a batch write
#[derive(Debug, Clone, PartialEq)]
pub enum WriteRequest {
    Put(Item),
    Delete(ItemKey),
}

impl WriteRequest {
    fn describe(&self) -> String {
        match self {
            WriteRequest::Put(item) => ItemKey::of(item)
                .map(|k| k.to_string())
                .unwrap_or_else(|| "<keyless item>".to_string()),
            WriteRequest::Delete(key) => key.to_string(),
        }
    }
}

/// Minimal key-value API the store needs from a wide-column database
#[async_trait]
pub trait WideColumnClient: Send + Sync {
    /// Create the table; an existing table is not an error
    async fn create_table(&self) -> Result<()>;

    /// Fetch up to [`MAX_BATCH_SIZE`] items. Missing keys are simply absent.
    async fn batch_get(&self, keys: Vec<ItemKey>) -> Result<BatchOutcome<ItemKey, Item>>;

    /// Apply up to [`MAX_BATCH_SIZE`] puts and deletes
    async fn batch_write(&self, requests: Vec<WriteRequest>) -> Result<BatchOutcome<WriteRequest, ()>>;

    /// Every item in one partition
    async fn query_network(&self, network_id: &str) -> Result<Vec<Item>>;

    async fn ping(&self) -> Result<()>;
}

pub struct WideColumnStore<C> {
    client: C,
    registry: Arc<ConfigRegistry>,
    metrics: StorageMetrics,
}

impl<C: WideColumnClient> WideColumnStore<C> {
    pub fn new(client: C, registry: Arc<ConfigRegistry>) -> Self {
        Self {
            client,
            registry,
            metrics: StorageMetrics::new("wide_column"),
        }
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    async fn batch_get(&self, keys: Vec<ItemKey>) -> Result<Vec<Item>> {
        run_batched(keys, &self.metrics, ItemKey::to_string, |batch| {
            self.client.batch_get(batch)
        })
        .await
    }

    async fn batch_write(&self, requests: Vec<WriteRequest>) -> Result<()> {
        run_batched(requests, &self.metrics, WriteRequest::describe, |batch| {
            self.client.batch_write(batch)
        })
        .await
        .map(|_| ())
    }

    fn item_to_state(&self, item: &Item) -> Result<GatewayState> {
        let gateway_id = match item.get(GATEWAY_ID_ATTR) {
            Some(Attr::S(id)) => id.clone(),
            _ => return Err(GatewayError::storage("Item without a gateway ID")),
        };
        let blob = |name: &str| match item.get(name) {
            Some(Attr::B(bytes)) => Some(bytes.as_slice()),
            _ => None,
        };
        let offset = match item.get(OFFSET_ATTR) {
            Some(Attr::N(offset)) => *offset,
            _ => 0,
        };

        let raw = item.iter().filter_map(|(name, value)| {
            let config_type = name.strip_prefix(CONFIG_ATTR_PREFIX)?;
            match value {
                Attr::B(bytes) => Some((config_type.to_string(), bytes.clone())),
                _ => None,
            }
        });

        Ok(GatewayState {
            config: decode_configs(&self.registry, &gateway_id, raw)?,
            status: decode_status(blob(STATUS_ATTR))?,
            record: decode_record(blob(RECORD_ATTR))?,
            offset,
            gateway_id,
        })
    }

    fn items_to_views(&self, items: &[Item]) -> Result<ViewMap> {
        items
            .iter()
            .map(|item| {
                let state = self.item_to_state(item)?;
                Ok((state.gateway_id.clone(), state))
            })
            .collect()
    }

    /// Next version of an item, `None` if `params` is stale
    fn next_item(&self, key: &ItemKey, existing: Option<&Item>, params: &GatewayUpdateParams) -> Result<Option<Item>> {
        let mut item = match existing {
            Some(item) => {
                if matches!(item.get(OFFSET_ATTR), Some(Attr::N(stored)) if params.offset <= *stored) {
                    return Ok(None);
                }
                item.clone()
            }
            None => Item::from([
                (NETWORK_ID_ATTR.to_string(), Attr::S(key.network_id.clone())),
                (GATEWAY_ID_ATTR.to_string(), Attr::S(key.gateway_id.clone())),
            ]),
        };

        if let Some(ref status) = params.new_status {
            item.insert(STATUS_ATTR.to_string(), Attr::B(status.to_bytes()?));
        }
        if let Some(ref record) = params.new_record {
            item.insert(RECORD_ATTR.to_string(), Attr::B(record.to_bytes()?));
        }
        if let Some(ref configs) = params.new_configs {
            for (config_type, value) in configs {
                let bytes = self.registry.marshal_config(config_type, value)?;
                item.insert(format!("{}{}", CONFIG_ATTR_PREFIX, config_type), Attr::B(bytes));
            }
        }
        if let Some(ref deleted) = params.configs_to_delete {
            for config_type in deleted {
                item.remove(&format!("{}{}", CONFIG_ATTR_PREFIX, config_type));
            }
        }
        item.insert(OFFSET_ATTR.to_string(), Attr::N(params.offset));
        Ok(Some(item))
    }
}

#[async_trait]
impl<C: WideColumnClient> HealthCheck for WideColumnStore<C> {
    async fn health_check(&self) -> Result<()> {
        self.client.ping().await
    }

    fn component_name(&self) -> &'static str {
        "wide_column_store"
    }
}

#[async_trait]
impl<C: WideColumnClient> ViewStore for WideColumnStore<C> {
    async fn get_views_for_network(&self, network_id: &str) -> Result<ViewMap> {
        let start = Instant::now();
        let items = self.client.query_network(&network_id.to_lowercase()).await?;
        self.metrics.record_latency("get_views_for_network", start.elapsed());
        self.items_to_views(&items)
    }

    async fn get_views(&self, network_id: &str, gateway_ids: &[String]) -> Result<ViewMap> {
        let start = Instant::now();
        let items = self.batch_get(unique_keys(network_id, gateway_ids)).await?;
        self.metrics.record_latency("get_views", start.elapsed());
        self.items_to_views(&items)
    }

    async fn update_or_create(
        &self,
        network_id: &str,
        updates: BTreeMap<String, GatewayUpdateParams>,
    ) -> Result<()> {
        if updates.is_empty() {
            return Ok(());
        }
        let start = Instant::now();

        let keys: Vec<ItemKey> = updates
            .keys()
            .map(|id| ItemKey::new(network_id, id))
            .collect();
        let existing: HashMap<ItemKey, Item> = self
            .batch_get(keys.clone())
            .await?
            .into_iter()
            .filter_map(|item| ItemKey::of(&item).map(|key| (key, item)))
            .collect();

        let mut writes = Vec::with_capacity(updates.len());
        let mut stale = 0u64;
        for (key, params) in keys.iter().zip(updates.values()) {
            match self.next_item(key, existing.get(key), params)? {
                Some(item) => writes.push(WriteRequest::Put(item)),
                None => stale += 1,
            }
        }

        if stale > 0 {
            debug!(network_id, stale, "Rejected stale updates");
            self.metrics.record_stale(stale);
        }
        trace!(network_id, writes = writes.len(), "Writing views");
        self.batch_write(writes).await?;
        self.metrics.record_latency("update_or_create", start.elapsed());
        Ok(())
    }

    async fn delete(&self, network_id: &str, gateway_ids: &[String]) -> Result<()> {
        let requests = unique_keys(network_id, gateway_ids)
            .into_iter()
            .map(WriteRequest::Delete)
            .collect();
        self.batch_write(requests).await
    }

    async fn init_tables(&self) -> Result<()> {
        self.client.create_table().await
    }

    fn backend_name(&self) -> &'static str {
        "wide_column"
    }
}

// ============================================================================
// In-memory client
// ============================================================================

/// Wide-column client over a map, with hooks for unprocessed-item behaviour
#[derive(Default)]
pub struct MemoryWideColumnClient {
    items: Mutex<BTreeMap<ItemKey, Item>>,
    /// Calls left that report their last item unprocessed
    flaky_calls: Mutex<usize>,
    /// Gateways that are never processed
    stuck: Mutex<BTreeSet<String>>,
    batch_sizes: Mutex<Vec<usize>>,
    table_created: Mutex<bool>,
}

impl MemoryWideColumnClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `calls` batch calls leave their last item unprocessed
    pub fn fail_last_item(&self, calls: usize) {
        *self.flaky_calls.lock() = calls;
    }

    /// Never process items of `gateway_id`
    pub fn stick(&self, gateway_id: &str) {
        self.stuck.lock().insert(gateway_id.to_string());
    }

    /// Sizes of every batch call received so far
    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batch_sizes.lock().clone()
    }

    pub fn table_created(&self) -> bool {
        *self.table_created.lock()
    }

    pub fn raw_item(&self, key: &ItemKey) -> Option<Item> {
        self.items.lock().get(key).cloned()
    }

    /// Split a batch into (processed, unprocessed).
    ///
    /// Oversized batches and batches naming a key twice are rejected whole.
    fn admit<T>(&self, batch: Vec<T>, key_of: impl Fn(&T) -> Option<ItemKey>) -> Result<(Vec<T>, Vec<T>)> {
        if batch.len() > MAX_BATCH_SIZE {
            return Err(GatewayError::storage(format!(
                "Batch of {} exceeds the limit of {}",
                batch.len(),
                MAX_BATCH_SIZE
            )));
        }
        let mut seen = HashSet::new();
        if let Some(key) = batch.iter().filter_map(&key_of).find(|key| !seen.insert(key.clone())) {
            return Err(GatewayError::storage(format!("Batch names {} more than once", key)));
        }
        self.batch_sizes.lock().push(batch.len());

        let stuck = self.stuck.lock().clone();
        let (mut admitted, mut unprocessed): (Vec<T>, Vec<T>) = batch
            .into_iter()
            .partition(|t| key_of(t).map_or(true, |key| !stuck.contains(&key.gateway_id)));

        let mut flaky = self.flaky_calls.lock();
        if *flaky > 0 {
            *flaky -= 1;
            if let Some(last) = admitted.pop() {
                unprocessed.push(last);
            }
        }
        Ok((admitted, unprocessed))
    }
}

#[async_trait]
impl WideColumnClient for MemoryWideColumnClient {
    async fn create_table(&self) -> Result<()> {
        *self.table_created.lock() = true;
        Ok(())
    }

    async fn batch_get(&self, keys: Vec<ItemKey>) -> Result<BatchOutcome<ItemKey, Item>> {
        let (admitted, unprocessed) = self.admit(keys, |key| Some(key.clone()))?;
        let items = self.items.lock();
        let completed = admitted
            .iter()
            .filter_map(|key| items.get(key).cloned())
            .collect();
        Ok(BatchOutcome {
            completed,
            unprocessed,
        })
    }

    async fn batch_write(&self, requests: Vec<WriteRequest>) -> Result<BatchOutcome<WriteRequest, ()>> {
        let key_of = |request: &WriteRequest| match request {
            WriteRequest::Put(item) => ItemKey::of(item),
            WriteRequest::Delete(key) => Some(key.clone()),
        };
        let (admitted, unprocessed) = self.admit(requests, key_of)?;

        let mut items = self.items.lock();
        for request in admitted {
            match request {
                WriteRequest::Put(item) => {
                    let key = ItemKey::of(&item)
                        .ok_or_else(|| GatewayError::storage("Put without a primary key"))?;
                    items.insert(key, item);
                }
                WriteRequest::Delete(key) => {
                    items.remove(&key);
                }
            }
        }
        Ok(BatchOutcome {
            completed: Vec::new(),
            unprocessed,
        })
    }

    async fn query_network(&self, network_id: &str) -> Result<Vec<Item>> {
        Ok(self
            .items
            .lock()
            .iter()
            .filter(|(key, _)| key.network_id == network_id)
            .map(|(_, item)| item.clone())
            .collect())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gwview_core::JsonConfigManager;
    use serde_json::json;

    fn store() -> WideColumnStore<MemoryWideColumnClient> {
        let registry = ConfigRegistry::new();
        registry
            .register(Arc::new(JsonConfigManager::gateway_scoped("mme")))
            .unwrap();
        WideColumnStore::new(MemoryWideColumnClient::new(), Arc::new(registry))
    }

    fn updates(n: usize, offset: i64) -> BTreeMap<String, GatewayUpdateParams> {
        (0..n)
            .map(|i| {
                (
                    format!("gw{:03}", i),
                    GatewayUpdateParams::at_offset(offset).with_config("mme", json!(i)),
                )
            })
            .collect()
    }

    #[tokio::test]
    async fn test_network_id_is_case_insensitive() {
        let store = store();
        store.update_or_create("NetOne", updates(1, 1)).await.unwrap();

        let key = ItemKey::new("netone", "gw000");
        let item = store.client().raw_item(&key).unwrap();
        assert_eq!(item[NETWORK_ID_ATTR], Attr::S("netone".into()));
        assert!(item.contains_key("cfg_mme"));

        assert_eq!(store.get_views_for_network("NETONE").await.unwrap().len(), 1);
        assert_eq!(
            store.get_views("netONE", &["gw000".into()]).await.unwrap()["gw000"].config["mme"],
            json!(0)
        );
    }

    #[tokio::test]
    async fn test_large_updates_are_chunked() {
        let store = store();
        store.init_tables().await.unwrap();
        assert!(store.client().table_created());
        store.update_or_create("net1", updates(60, 1)).await.unwrap();

        assert!(store.client().batch_sizes().iter().all(|&n| n <= MAX_BATCH_SIZE));
        assert_eq!(store.get_views_for_network("net1").await.unwrap().len(), 60);
    }

    #[tokio::test]
    async fn test_unprocessed_items_eventually_land() {
        let store = store();
        store.client().fail_last_item(2);
        store.update_or_create("net1", updates(3, 1)).await.unwrap();
        assert_eq!(store.get_views_for_network("net1").await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_stuck_item_exhausts_retries() {
        let store = store();
        store.client().stick("gw001");
        let err = store.update_or_create("net1", updates(3, 1)).await.unwrap_err();
        assert!(matches!(err, GatewayError::RetryExhausted { ref message, .. } if message.contains("gw001")));
    }

    #[tokio::test]
    async fn test_stale_updates_and_missing_ids() {
        let store = store();
        store.update_or_create("net1", updates(1, 5)).await.unwrap();

        let mut stale = BTreeMap::new();
        stale.insert("gw000".to_string(), GatewayUpdateParams::at_offset(5).delete_config("mme"));
        store.update_or_create("net1", stale).await.unwrap();

        let views = store
            .get_views("net1", &["gw000".into(), "missing".into()])
            .await
            .unwrap();
        assert_eq!(views.len(), 1);
        assert_eq!(views["gw000"].config["mme"], json!(0));

        store.delete("net1", &["gw000".into()]).await.unwrap();
        assert!(store.get_views_for_network("net1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_repeated_gateway_ids_are_read_and_deleted_once() {
        let store = store();
        store.update_or_create("net1", updates(2, 1)).await.unwrap();

        let ids: Vec<String> = ["gw000", "gw001", "gw000", "gw001", "gw000"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let views = store.get_views("net1", &ids).await.unwrap();
        assert_eq!(views.len(), 2);
        assert_eq!(store.client().batch_sizes().last(), Some(&2));

        store.delete("NET1", &ids).await.unwrap();
        assert!(store.get_views_for_network("net1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_client_rejects_duplicate_keys_in_a_batch() {
        let client = MemoryWideColumnClient::new();
        let key = ItemKey::new("net1", "gw1");
        let err = client.batch_get(vec![key.clone(), key]).await.unwrap_err();
        assert!(matches!(err, GatewayError::Storage { .. }));
        assert!(client.batch_sizes().is_empty());
    }
}
