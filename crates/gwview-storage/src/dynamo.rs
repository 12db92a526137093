//! DynamoDB implementation of [`WideColumnClient`]

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_dynamodb::config::Region;
use aws_sdk_dynamodb::primitives::Blob;
use aws_sdk_dynamodb::types::{
    AttributeDefinition, AttributeValue, BillingMode, DeleteRequest, KeySchemaElement, KeyType,
    KeysAndAttributes, PutRequest, ScalarAttributeType,
};
use aws_sdk_dynamodb::Client;
use gwview_core::config::WideColumnConfig;
use gwview_core::prelude::*;
use std::collections::HashMap;
use tracing::{info, trace};

use crate::batch::BatchOutcome;
use crate::wide_column::{
    Attr, Item, ItemKey, WideColumnClient, WriteRequest, GATEWAY_ID_ATTR, NETWORK_ID_ATTR,
};

type SdkItem = HashMap<String, AttributeValue>;

fn to_sdk(attr: &Attr) -> AttributeValue {
    match attr {
        Attr::S(s) => AttributeValue::S(s.clone()),
        Attr::N(n) => AttributeValue::N(n.to_string()),
        Attr::B(b) => AttributeValue::B(Blob::new(b.clone())),
    }
}

fn from_sdk(name: &str, value: &AttributeValue) -> Result<Attr> {
    match value {
        AttributeValue::S(s) => Ok(Attr::S(s.clone())),
        AttributeValue::N(n) => n
            .parse()
            .map(Attr::N)
            .map_err(|_| GatewayError::storage(format!("Attribute {} is not an integer: {}", name, n))),
        AttributeValue::B(b) => Ok(Attr::B(b.as_ref().to_vec())),
        other => Err(GatewayError::storage(format!(
            "Attribute {} has unsupported type {:?}",
            name, other
        ))),
    }
}

fn item_to_sdk(item: &Item) -> SdkItem {
    item.iter().map(|(k, v)| (k.clone(), to_sdk(v))).collect()
}

fn item_from_sdk(item: &SdkItem) -> Result<Item> {
    item.iter()
        .map(|(k, v)| Ok((k.clone(), from_sdk(k, v)?)))
        .collect()
}

fn key_to_sdk(key: &ItemKey) -> SdkItem {
    HashMap::from([
        (NETWORK_ID_ATTR.to_string(), AttributeValue::S(key.network_id.clone())),
        (GATEWAY_ID_ATTR.to_string(), AttributeValue::S(key.gateway_id.clone())),
    ])
}

fn key_from_sdk(key: &SdkItem) -> Result<ItemKey> {
    ItemKey::of(&item_from_sdk(key)?).ok_or_else(|| GatewayError::storage("Key without NetworkID and GatewayID"))
}

fn build_error(e: aws_sdk_dynamodb::error::BuildError) -> GatewayError {
    GatewayError::storage_with_source("Invalid DynamoDB request", e)
}

fn sdk_error<E>(operation: &'static str) -> impl Fn(E) -> GatewayError
where
    E: std::error::Error + Send + Sync + 'static,
{
    move |e| GatewayError::storage_with_source(format!("DynamoDB {} failed", operation), e)
}

/// DynamoDB-backed client for one table
pub struct DynamoDbClient {
    client: Client,
    table: String,
}

impl DynamoDbClient {
    pub fn new(client: Client, table: impl Into<String>) -> Self {
        Self {
            client,
            table: table.into(),
        }
    }

    /// Client from the ambient AWS configuration, with optional overrides
    pub async fn from_config(config: &WideColumnConfig) -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(ref region) = config.region {
            loader = loader.region(Region::new(region.clone()));
        }
        if let Some(ref endpoint) = config.endpoint {
            loader = loader.endpoint_url(endpoint);
        }
        let sdk_config = loader.load().await;
        Self::new(Client::new(&sdk_config), &config.table)
    }
}

#[async_trait]
impl WideColumnClient for DynamoDbClient {
    async fn create_table(&self) -> Result<()> {
        let key_attr = |name: &str| {
            AttributeDefinition::builder()
                .attribute_name(name)
                .attribute_type(ScalarAttributeType::S)
                .build()
                .map_err(build_error)
        };
        let key_schema = |name: &str, key_type: KeyType| {
            KeySchemaElement::builder()
                .attribute_name(name)
                .key_type(key_type)
                .build()
                .map_err(build_error)
        };

        let result = self
            .client
            .create_table()
            .table_name(&self.table)
            .attribute_definitions(key_attr(NETWORK_ID_ATTR)?)
            .attribute_definitions(key_attr(GATEWAY_ID_ATTR)?)
            .key_schema(key_schema(NETWORK_ID_ATTR, KeyType::Hash)?)
            .key_schema(key_schema(GATEWAY_ID_ATTR, KeyType::Range)?)
            .billing_mode(BillingMode::PayPerRequest)
            .send()
            .await;

        match result {
            Ok(_) => {
                info!(table = %self.table, "Created view table");
                Ok(())
            }
            Err(e)
                if e.as_service_error()
                    .is_some_and(|se| se.is_resource_in_use_exception()) =>
            {
                trace!(table = %self.table, "View table already exists");
                Ok(())
            }
            Err(e) => Err(sdk_error("CreateTable")(e)),
        }
    }

    async fn batch_get(&self, keys: Vec<ItemKey>) -> Result<BatchOutcome<ItemKey, Item>> {
        if keys.is_empty() {
            return Ok(BatchOutcome::complete(Vec::new()));
        }
        let request = KeysAndAttributes::builder()
            .set_keys(Some(keys.iter().map(key_to_sdk).collect()))
            .consistent_read(true)
            .build()
            .map_err(build_error)?;

        let output = self
            .client
            .batch_get_item()
            .request_items(&self.table, request)
            .send()
            .await
            .map_err(sdk_error("BatchGetItem"))?;

        let completed = output
            .responses()
            .and_then(|r| r.get(&self.table))
            .map(|items| items.iter().map(item_from_sdk).collect::<Result<Vec<_>>>())
            .transpose()?
            .unwrap_or_default();
        let unprocessed = output
            .unprocessed_keys()
            .and_then(|u| u.get(&self.table))
            .map(|k| k.keys().iter().map(key_from_sdk).collect::<Result<Vec<_>>>())
            .transpose()?
            .unwrap_or_default();

        Ok(BatchOutcome {
            completed,
            unprocessed,
        })
    }

    async fn batch_write(&self, requests: Vec<WriteRequest>) -> Result<BatchOutcome<WriteRequest, ()>> {
        if requests.is_empty() {
            return Ok(BatchOutcome::complete(Vec::new()));
        }
        let writes = requests
            .iter()
            .map(|request| -> Result<aws_sdk_dynamodb::types::WriteRequest> {
                let builder = aws_sdk_dynamodb::types::WriteRequest::builder();
                let builder = match request {
                    WriteRequest::Put(item) => builder.put_request(
                        PutRequest::builder()
                            .set_item(Some(item_to_sdk(item)))
                            .build()
                            .map_err(build_error)?,
                    ),
                    WriteRequest::Delete(key) => builder.delete_request(
                        DeleteRequest::builder()
                            .set_key(Some(key_to_sdk(key)))
                            .build()
                            .map_err(build_error)?,
                    ),
                };
                Ok(builder.build())
            })
            .collect::<Result<Vec<_>>>()?;

        let output = self
            .client
            .batch_write_item()
            .request_items(&self.table, writes)
            .send()
            .await
            .map_err(sdk_error("BatchWriteItem"))?;

        let mut unprocessed = Vec::new();
        if let Some(left) = output.unprocessed_items().and_then(|u| u.get(&self.table)) {
            for write in left {
                if let Some(put) = write.put_request() {
                    unprocessed.push(WriteRequest::Put(item_from_sdk(put.item())?));
                } else if let Some(delete) = write.delete_request() {
                    unprocessed.push(WriteRequest::Delete(key_from_sdk(delete.key())?));
                }
            }
        }

        Ok(BatchOutcome {
            completed: Vec::new(),
            unprocessed,
        })
    }

    async fn query_network(&self, network_id: &str) -> Result<Vec<Item>> {
        let mut items = Vec::new();
        let mut start_key: Option<SdkItem> = None;

        loop {
            let output = self
                .client
                .query()
                .table_name(&self.table)
                .key_condition_expression("#network = :network")
                .expression_attribute_names("#network", NETWORK_ID_ATTR)
                .expression_attribute_values(":network", AttributeValue::S(network_id.to_string()))
                .consistent_read(true)
                .set_exclusive_start_key(start_key.take())
                .send()
                .await
                .map_err(sdk_error("Query"))?;

            for item in output.items() {
                items.push(item_from_sdk(item)?);
            }
            match output.last_evaluated_key() {
                Some(key) if !key.is_empty() => start_key = Some(key.clone()),
                _ => break,
            }
        }
        Ok(items)
    }

    async fn ping(&self) -> Result<()> {
        self.client
            .describe_table()
            .table_name(&self.table)
            .send()
            .await
            .map_err(sdk_error("DescribeTable"))?;
        Ok(())
    }
}
