//! DynamoDB tables
//!
//! State table: partition key `StateID` (S), sort key `VersionID` (N).
//! Lock table: partition key `LockID` (S). Global-table replicas of the lock
//! table are reached through one client per region.

use super::{ChunkBody, ChunkItem, LockItem, LockTable, StateTable, WriteOp};
use crate::client::RemoteStateClient;
use crate::config::StoreConfig;
use crate::{Result, StateError};
use async_trait::async_trait;
use aws_sdk_dynamodb::Client;
use aws_sdk_dynamodb::operation::query::builders::QueryFluentBuilder;
use aws_sdk_dynamodb::primitives::Blob;
use aws_sdk_dynamodb::types::{AttributeValue, Delete, Put, TransactWriteItem};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;

pub const ATTR_STATE_ID: &str = "StateID";
pub const ATTR_VERSION_ID: &str = "VersionID";
pub const ATTR_BODY: &str = "Body";
pub const ATTR_NEXT_STATE_ID: &str = "NextStateID";
pub const ATTR_TTL: &str = "TTL";
pub const ATTR_LOCK_ID: &str = "LockID";
pub const ATTR_INFO: &str = "Info";
pub const ATTR_DIGEST: &str = "Digest";
/// Set by DynamoDB global tables on replicated items
pub const ATTR_UPDATE_REGION: &str = "aws:rep:updateregion";

type Item = HashMap<String, AttributeValue>;

fn string_attr(item: &Item, name: &str) -> Option<String> {
    item.get(name).and_then(|v| v.as_s().ok()).cloned()
}

fn number_attr(item: &Item, name: &str) -> Option<i64> {
    item.get(name)
        .and_then(|v| v.as_n().ok())
        .and_then(|n| n.parse().ok())
}

fn chunk_from_item(table: &str, item: &Item) -> Result<ChunkItem> {
    let id = string_attr(item, ATTR_STATE_ID)
        .ok_or_else(|| StateError::transport(format!("{} item without {}", table, ATTR_STATE_ID)))?;
    let version = number_attr(item, ATTR_VERSION_ID).ok_or_else(|| {
        StateError::transport(format!("{} item {} without {}", table, id, ATTR_VERSION_ID))
    })?;

    let body = match item.get(ATTR_BODY) {
        Some(AttributeValue::S(text)) => ChunkBody::Text(text.clone()),
        Some(AttributeValue::B(blob)) => ChunkBody::Binary(Bytes::copy_from_slice(blob.as_ref())),
        None => ChunkBody::Text(String::new()),
        Some(other) => {
            return Err(StateError::transport(format!(
                "{} item {} has unexpected body {:?}",
                table, id, other
            )));
        }
    };

    Ok(ChunkItem {
        id,
        version,
        body,
        next_id: string_attr(item, ATTR_NEXT_STATE_ID).filter(|next| !next.is_empty()),
        ttl: number_attr(item, ATTR_TTL).filter(|ttl| *ttl > 0),
    })
}

fn item_from_chunk(chunk: &ChunkItem) -> Item {
    let mut item = Item::new();
    item.insert(ATTR_STATE_ID.to_string(), AttributeValue::S(chunk.id.clone()));
    item.insert(
        ATTR_VERSION_ID.to_string(),
        AttributeValue::N(chunk.version.to_string()),
    );
    let body = match &chunk.body {
        ChunkBody::Text(text) => AttributeValue::S(text.clone()),
        ChunkBody::Binary(bytes) => AttributeValue::B(Blob::new(bytes.to_vec())),
    };
    item.insert(ATTR_BODY.to_string(), body);
    if let Some(next) = chunk.next() {
        item.insert(ATTR_NEXT_STATE_ID.to_string(), AttributeValue::S(next.to_string()));
    }
    if let Some(ttl) = chunk.ttl {
        item.insert(ATTR_TTL.to_string(), AttributeValue::N(ttl.to_string()));
    }
    item
}

fn lock_from_item(item: &Item) -> Option<LockItem> {
    Some(LockItem {
        id: string_attr(item, ATTR_LOCK_ID)?,
        info: string_attr(item, ATTR_INFO),
        digest: string_attr(item, ATTR_DIGEST),
        origin_region: string_attr(item, ATTR_UPDATE_REGION),
    })
}

fn item_from_lock(lock: &LockItem) -> Item {
    let mut item = Item::new();
    item.insert(ATTR_LOCK_ID.to_string(), AttributeValue::S(lock.id.clone()));
    if let Some(info) = &lock.info {
        item.insert(ATTR_INFO.to_string(), AttributeValue::S(info.clone()));
    }
    if let Some(digest) = &lock.digest {
        item.insert(ATTR_DIGEST.to_string(), AttributeValue::S(digest.clone()));
    }
    item
}

fn is_put_conditional_check_failed(
    err: &aws_sdk_dynamodb::error::SdkError<aws_sdk_dynamodb::operation::put_item::PutItemError>,
) -> bool {
    use aws_sdk_dynamodb::error::SdkError;
    use aws_sdk_dynamodb::operation::put_item::PutItemError;

    match err {
        SdkError::ServiceError(service_err) => matches!(
            service_err.err(),
            PutItemError::ConditionalCheckFailedException(_)
        ),
        _ => false,
    }
}

#[derive(Clone)]
pub struct DynamoDbStateTable {
    client: Client,
    table_name: String,
}

impl std::fmt::Debug for DynamoDbStateTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DynamoDbStateTable")
            .field("table_name", &self.table_name)
            .finish()
    }
}

impl DynamoDbStateTable {
    pub fn from_client(client: Client, table_name: impl Into<String>) -> Self {
        Self {
            client,
            table_name: table_name.into(),
        }
    }

    /// Newest-first, eventually consistent query for one id
    fn chunk_query(&self, id: &str, latest_only: bool) -> QueryFluentBuilder {
        let request = self
            .client
            .query()
            .table_name(&self.table_name)
            .key_condition_expression("#id = :id")
            .expression_attribute_names("#id", ATTR_STATE_ID)
            .expression_attribute_values(":id", AttributeValue::S(id.to_string()))
            .scan_index_forward(false);
        if latest_only {
            request.limit(1)
        } else {
            request
        }
    }

    async fn query(&self, id: &str, latest_only: bool) -> Result<Vec<ChunkItem>> {
        let mut chunks = Vec::new();
        let mut last_evaluated_key = None;

        loop {
            let mut request = self.chunk_query(id, latest_only);
            if let Some(key) = last_evaluated_key.take() {
                request = request.set_exclusive_start_key(Some(key));
            }

            let response = request.send().await.map_err(|e| {
                StateError::transport(format!(
                    "DynamoDB Query on table {} failed: {}",
                    self.table_name, e
                ))
            })?;

            for item in response.items() {
                chunks.push(chunk_from_item(&self.table_name, item)?);
            }

            if latest_only {
                break;
            }
            match response.last_evaluated_key() {
                Some(key) if !key.is_empty() => last_evaluated_key = Some(key.clone()),
                _ => break,
            }
        }

        Ok(chunks)
    }

    fn transact_item(&self, op: &WriteOp) -> Result<TransactWriteItem> {
        let item = match op {
            WriteOp::Put(chunk) => {
                let put = Put::builder()
                    .table_name(&self.table_name)
                    .set_item(Some(item_from_chunk(chunk)))
                    .build()
                    .map_err(|e| StateError::transport(e.to_string()))?;
                TransactWriteItem::builder().put(put).build()
            }
            WriteOp::Delete { id, version } => {
                let delete = Delete::builder()
                    .table_name(&self.table_name)
                    .key(ATTR_STATE_ID, AttributeValue::S(id.clone()))
                    .key(ATTR_VERSION_ID, AttributeValue::N(version.to_string()))
                    .build()
                    .map_err(|e| StateError::transport(e.to_string()))?;
                TransactWriteItem::builder().delete(delete).build()
            }
        };
        Ok(item)
    }
}

#[async_trait]
impl StateTable for DynamoDbStateTable {
    fn table_name(&self) -> &str {
        &self.table_name
    }

    async fn query_latest(&self, id: &str) -> Result<Option<ChunkItem>> {
        Ok(self.query(id, true).await?.into_iter().next())
    }

    async fn query_all(&self, id: &str) -> Result<Vec<ChunkItem>> {
        self.query(id, false).await
    }

    async fn transact_write(&self, ops: Vec<WriteOp>) -> Result<()> {
        let items = ops
            .iter()
            .map(|op| self.transact_item(op))
            .collect::<Result<Vec<_>>>()?;

        tracing::debug!(
            "TransactWriteItems on {} with {} items",
            self.table_name,
            items.len()
        );

        self.client
            .transact_write_items()
            .set_transact_items(Some(items))
            .send()
            .await
            .map_err(|e| {
                StateError::transport(format!(
                    "DynamoDB TransactWriteItems on table {} failed: {}",
                    self.table_name, e
                ))
            })?;
        Ok(())
    }
}

#[derive(Clone)]
pub struct DynamoDbLockTable {
    client: Client,
    table_name: String,
    region: String,
}

impl std::fmt::Debug for DynamoDbLockTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DynamoDbLockTable")
            .field("table_name", &self.table_name)
            .field("region", &self.region)
            .finish()
    }
}

impl DynamoDbLockTable {
    pub fn from_client(
        client: Client,
        table_name: impl Into<String>,
        region: impl Into<String>,
    ) -> Self {
        Self {
            client,
            table_name: table_name.into(),
            region: region.into(),
        }
    }

    fn storage_error(&self, call: &str, e: impl std::fmt::Display) -> StateError {
        StateError::transport(format!(
            "DynamoDB {} on table {} in {} failed: {}",
            call, self.table_name, self.region, e
        ))
    }
}

#[async_trait]
impl LockTable for DynamoDbLockTable {
    fn table_name(&self) -> &str {
        &self.table_name
    }

    fn region(&self) -> &str {
        &self.region
    }

    async fn get_item(&self, id: &str) -> Result<Option<LockItem>> {
        let response = self
            .client
            .get_item()
            .table_name(&self.table_name)
            .key(ATTR_LOCK_ID, AttributeValue::S(id.to_string()))
            .consistent_read(true)
            .send()
            .await
            .map_err(|e| self.storage_error("GetItem", e))?;

        Ok(response.item().and_then(lock_from_item))
    }

    async fn put_item(&self, item: LockItem) -> Result<()> {
        self.client
            .put_item()
            .table_name(&self.table_name)
            .set_item(Some(item_from_lock(&item)))
            .send()
            .await
            .map_err(|e| self.storage_error("PutItem", e))?;
        Ok(())
    }

    async fn put_item_if_absent(&self, item: LockItem) -> Result<bool> {
        let result = self
            .client
            .put_item()
            .table_name(&self.table_name)
            .set_item(Some(item_from_lock(&item)))
            .condition_expression("attribute_not_exists(#pk)")
            .expression_attribute_names("#pk", ATTR_LOCK_ID)
            .send()
            .await;

        match result {
            Ok(_) => Ok(true),
            Err(e) if is_put_conditional_check_failed(&e) => Ok(false),
            Err(e) => Err(self.storage_error("PutItem", e)),
        }
    }

    async fn delete_item(&self, id: &str) -> Result<()> {
        self.client
            .delete_item()
            .table_name(&self.table_name)
            .key(ATTR_LOCK_ID, AttributeValue::S(id.to_string()))
            .send()
            .await
            .map_err(|e| self.storage_error("DeleteItem", e))?;
        Ok(())
    }

    async fn query_items(&self, id: &str) -> Result<Vec<LockItem>> {
        let response = self
            .client
            .query()
            .table_name(&self.table_name)
            .key_condition_expression("#pk = :id")
            .expression_attribute_names("#pk", ATTR_LOCK_ID)
            .expression_attribute_values(":id", AttributeValue::S(id.to_string()))
            .send()
            .await
            .map_err(|e| self.storage_error("Query", e))?;

        Ok(response.items().iter().filter_map(lock_from_item).collect())
    }
}

/// Handles for every table a client needs
pub struct DynamoDbTables {
    pub state: Arc<DynamoDbStateTable>,
    pub locks: Option<Arc<DynamoDbLockTable>>,
    pub replicas: Vec<Arc<dyn LockTable>>,
}

fn dynamodb_client(
    sdk_config: &aws_config::SdkConfig,
    region: Option<&str>,
    endpoint: Option<&str>,
) -> Client {
    let mut builder = aws_sdk_dynamodb::config::Builder::from(sdk_config);
    if let Some(region) = region {
        builder = builder.region(aws_sdk_dynamodb::config::Region::new(region.to_string()));
    }
    if let Some(endpoint) = endpoint {
        builder = builder.endpoint_url(endpoint);
    }
    Client::from_conf(builder.build())
}

/// Build table handles from `config`, with credentials from the usual AWS
/// environment.
pub async fn connect(config: &StoreConfig) -> Result<DynamoDbTables> {
    config.validate()?;

    let sdk_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
        .load()
        .await;

    let region = config
        .region
        .clone()
        .or_else(|| sdk_config.region().map(|r| r.to_string()))
        .ok_or_else(|| {
            StateError::config(
                "region is not set; set AWS_REGION or AWS_DEFAULT_REGION, or region in the store configuration",
            )
        })?;

    let client = dynamodb_client(&sdk_config, Some(&region), config.endpoint_for(&region));
    let state = Arc::new(DynamoDbStateTable::from_client(
        client.clone(),
        config.table_name.clone(),
    ));
    let locks = config
        .lock_table
        .as_ref()
        .map(|name| Arc::new(DynamoDbLockTable::from_client(client, name.clone(), region.clone())));

    let mut replicas: Vec<Arc<dyn LockTable>> = Vec::new();
    if let Some(name) = &config.lock_table {
        for replica_region in &config.replica_regions {
            let client = dynamodb_client(
                &sdk_config,
                Some(replica_region),
                config.endpoint_for(replica_region),
            );
            replicas.push(Arc::new(DynamoDbLockTable::from_client(
                client,
                name.clone(),
                replica_region.clone(),
            )));
        }
    }

    tracing::info!(
        "Connected to DynamoDB table {} in {} ({} lock replicas)",
        config.table_name,
        region,
        replicas.len()
    );

    Ok(DynamoDbTables {
        state,
        locks,
        replicas,
    })
}

/// Connect and build a client in one step
pub async fn client_for(config: StoreConfig) -> Result<RemoteStateClient> {
    let tables = connect(&config).await?;

    let mut builder = RemoteStateClient::builder()
        .config(config)
        .state_table(tables.state)
        .replicas(tables.replicas);
    if let Some(locks) = tables.locks {
        builder = builder.lock_table(locks);
    }
    builder.build().await
}
