//! Backing table abstraction
//!
//! The protocol only needs a narrow slice of a key-value store: a state table
//! keyed by `(id, version)` supporting descending queries and multi-item
//! transactions, and a lock table keyed by `id` supporting conditional puts.
//! Implementations live in [`memory`] and, with the `dynamodb` feature, in
//! `dynamodb`.

pub mod memory;

#[cfg(feature = "dynamodb")]
pub mod dynamodb;

pub use memory::{MemoryLockTable, MemoryStateTable};

use crate::Result;
use async_trait::async_trait;
use bytes::Bytes;

/// DynamoDB's upper bound on items per TransactWriteItems call
pub const MAX_TRANSACTION_ITEMS: usize = 100;

/// Stored body of a chunk. Text for uncompressed payloads, binary for gzip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkBody {
    Text(String),
    Binary(Bytes),
}

impl ChunkBody {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            ChunkBody::Text(text) => text.as_bytes(),
            ChunkBody::Binary(bytes) => bytes,
        }
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_binary(&self) -> bool {
        matches!(self, ChunkBody::Binary(_))
    }
}

/// One physical item of the state table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkItem {
    pub id: String,
    pub version: i64,
    pub body: ChunkBody,
    pub next_id: Option<String>,
    /// Expiry in epoch seconds
    pub ttl: Option<i64>,
}

impl ChunkItem {
    /// Id of the following chunk, if this is not the tail of the chain
    pub fn next(&self) -> Option<&str> {
        self.next_id.as_deref().filter(|next| !next.is_empty())
    }
}

/// A staged write inside one table transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    Put(ChunkItem),
    Delete { id: String, version: i64 },
}

impl WriteOp {
    pub fn key(&self) -> (&str, i64) {
        match self {
            WriteOp::Put(item) => (&item.id, item.version),
            WriteOp::Delete { id, version } => (id, *version),
        }
    }
}

/// One item of the lock table: either a lock record (`info`) or a digest
/// record (`digest`).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LockItem {
    pub id: String,
    pub info: Option<String>,
    pub digest: Option<String>,
    /// Region that last wrote this item, when the store replicates it
    pub origin_region: Option<String>,
}

impl LockItem {
    pub fn lock(id: impl Into<String>, info: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            info: Some(info.into()),
            ..Default::default()
        }
    }

    pub fn digest(id: impl Into<String>, digest: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            digest: Some(digest.into()),
            ..Default::default()
        }
    }
}

#[async_trait]
pub trait StateTable: Send + Sync {
    fn table_name(&self) -> &str;

    /// Highest-version item stored under `id` (descending sort, limit 1)
    async fn query_latest(&self, id: &str) -> Result<Option<ChunkItem>>;

    /// Every version stored under `id`, highest first
    async fn query_all(&self, id: &str) -> Result<Vec<ChunkItem>>;

    /// Apply all ops atomically, or none of them
    async fn transact_write(&self, ops: Vec<WriteOp>) -> Result<()>;
}

#[async_trait]
pub trait LockTable: Send + Sync {
    fn table_name(&self) -> &str;

    /// Region this handle talks to
    fn region(&self) -> &str;

    /// Strongly consistent point read
    async fn get_item(&self, id: &str) -> Result<Option<LockItem>>;

    async fn put_item(&self, item: LockItem) -> Result<()>;

    /// Put only if no item exists under the same id. Returns `false` when the
    /// condition failed.
    async fn put_item_if_absent(&self, item: LockItem) -> Result<bool>;

    async fn delete_item(&self, id: &str) -> Result<()>;

    /// Eventually consistent query, used against regional replicas
    async fn query_items(&self, id: &str) -> Result<Vec<LockItem>>;

    /// Region that originated the replicated item. Unknown maps to "".
    fn origin_region_of(&self, item: &LockItem) -> String {
        item.origin_region.clone().unwrap_or_default()
    }
}
