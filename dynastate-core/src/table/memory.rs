//! In-memory tables for tests and embedding
//!
//! State is held in `Arc<RwLock<..>>` so clones share the same data, which is
//! how tests hand one table to a client and keep another handle for
//! inspection. Both tables can be told to fail, to exercise error paths.

use super::{ChunkItem, LockItem, LockTable, MAX_TRANSACTION_ITEMS, StateTable, WriteOp};
use crate::{Result, StateError};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt::Debug;
use std::sync::Arc;

#[derive(Clone)]
pub struct MemoryStateTable {
    name: String,
    items: Arc<RwLock<BTreeMap<(String, i64), ChunkItem>>>,
    transactions: Arc<RwLock<Vec<Vec<WriteOp>>>>,
    /// Fail the n-th upcoming transaction (1 = the next one)
    fail_transaction_in: Arc<Mutex<Option<usize>>>,
}

impl Debug for MemoryStateTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStateTable")
            .field("name", &self.name)
            .field("item_count", &self.items.read().len())
            .finish()
    }
}

impl MemoryStateTable {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            items: Arc::new(RwLock::new(BTreeMap::new())),
            transactions: Arc::new(RwLock::new(Vec::new())),
            fail_transaction_in: Arc::new(Mutex::new(None)),
        }
    }

    /// Every stored item, ordered by `(id, version)`
    pub fn items(&self) -> Vec<ChunkItem> {
        self.items.read().values().cloned().collect()
    }

    /// Insert an item directly, bypassing transactions
    pub fn insert(&self, item: ChunkItem) {
        self.items
            .write()
            .insert((item.id.clone(), item.version), item);
    }

    /// Committed transactions, oldest first
    pub fn transactions(&self) -> Vec<Vec<WriteOp>> {
        self.transactions.read().clone()
    }

    pub fn clear_transactions(&self) {
        self.transactions.write().clear();
    }

    /// Make the n-th upcoming transaction fail without applying anything
    pub fn fail_transaction(&self, nth: usize) {
        *self.fail_transaction_in.lock() = Some(nth.max(1));
    }

    fn take_injected_failure(&self) -> bool {
        let mut countdown = self.fail_transaction_in.lock();
        match *countdown {
            Some(1) => {
                *countdown = None;
                true
            }
            Some(n) => {
                *countdown = Some(n - 1);
                false
            }
            None => false,
        }
    }
}

#[async_trait]
impl StateTable for MemoryStateTable {
    fn table_name(&self) -> &str {
        &self.name
    }

    async fn query_latest(&self, id: &str) -> Result<Option<ChunkItem>> {
        let items = self.items.read();
        Ok(items
            .range((id.to_string(), i64::MIN)..=(id.to_string(), i64::MAX))
            .next_back()
            .map(|(_, item)| item.clone()))
    }

    async fn query_all(&self, id: &str) -> Result<Vec<ChunkItem>> {
        let items = self.items.read();
        Ok(items
            .range((id.to_string(), i64::MIN)..=(id.to_string(), i64::MAX))
            .rev()
            .map(|(_, item)| item.clone())
            .collect())
    }

    async fn transact_write(&self, ops: Vec<WriteOp>) -> Result<()> {
        if ops.is_empty() {
            return Err(StateError::transport(format!(
                "transaction on {} has no items",
                self.name
            )));
        }

        if ops.len() > MAX_TRANSACTION_ITEMS {
            return Err(StateError::transport(format!(
                "transaction on {} has {} items, limit is {}",
                self.name,
                ops.len(),
                MAX_TRANSACTION_ITEMS
            )));
        }

        let mut seen = HashSet::new();
        for op in &ops {
            let (id, version) = op.key();
            if !seen.insert((id.to_string(), version)) {
                return Err(StateError::transport(format!(
                    "transaction on {} touches {}@{} more than once",
                    self.name, id, version
                )));
            }
        }

        if self.take_injected_failure() {
            return Err(StateError::transport(format!(
                "injected transaction failure on {}",
                self.name
            )));
        }

        let mut items = self.items.write();
        for op in &ops {
            match op {
                WriteOp::Put(item) => {
                    items.insert((item.id.clone(), item.version), item.clone());
                }
                WriteOp::Delete { id, version } => {
                    items.remove(&(id.clone(), *version));
                }
            }
        }
        drop(items);

        self.transactions.write().push(ops);
        Ok(())
    }
}

/// Lock table for one region. Items written through a handle are stamped
/// with that handle's region as their replication origin.
#[derive(Clone)]
pub struct MemoryLockTable {
    name: String,
    region: String,
    items: Arc<RwLock<HashMap<String, LockItem>>>,
    unavailable: Arc<RwLock<bool>>,
}

impl Debug for MemoryLockTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryLockTable")
            .field("name", &self.name)
            .field("region", &self.region)
            .field("item_count", &self.items.read().len())
            .finish()
    }
}

impl MemoryLockTable {
    pub fn new(name: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            region: region.into(),
            items: Arc::new(RwLock::new(HashMap::new())),
            unavailable: Arc::new(RwLock::new(false)),
        }
    }

    /// Another region's view of the same table, sharing no data
    pub fn replica(&self, region: impl Into<String>) -> Self {
        Self::new(self.name.clone(), region)
    }

    /// Insert an item as if it had been replicated from `origin`
    pub fn insert_replicated(&self, mut item: LockItem, origin: impl Into<String>) {
        item.origin_region = Some(origin.into());
        self.items.write().insert(item.id.clone(), item);
    }

    pub fn item(&self, id: &str) -> Option<LockItem> {
        self.items.read().get(id).cloned()
    }

    pub fn remove(&self, id: &str) -> Option<LockItem> {
        self.items.write().remove(id)
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        *self.unavailable.write() = unavailable;
    }

    fn check_available(&self) -> Result<()> {
        if *self.unavailable.read() {
            return Err(StateError::transport(format!(
                "lock table {} in {} is unavailable",
                self.name, self.region
            )));
        }
        Ok(())
    }

    fn stamp(&self, mut item: LockItem) -> LockItem {
        item.origin_region = Some(self.region.clone());
        item
    }
}

#[async_trait]
impl LockTable for MemoryLockTable {
    fn table_name(&self) -> &str {
        &self.name
    }

    fn region(&self) -> &str {
        &self.region
    }

    async fn get_item(&self, id: &str) -> Result<Option<LockItem>> {
        self.check_available()?;
        Ok(self.item(id))
    }

    async fn put_item(&self, item: LockItem) -> Result<()> {
        self.check_available()?;
        let item = self.stamp(item);
        self.items.write().insert(item.id.clone(), item);
        Ok(())
    }

    async fn put_item_if_absent(&self, item: LockItem) -> Result<bool> {
        self.check_available()?;
        let item = self.stamp(item);
        let mut items = self.items.write();
        if items.contains_key(&item.id) {
            return Ok(false);
        }
        items.insert(item.id.clone(), item);
        Ok(true)
    }

    async fn delete_item(&self, id: &str) -> Result<()> {
        self.check_available()?;
        self.items.write().remove(id);
        Ok(())
    }

    async fn query_items(&self, id: &str) -> Result<Vec<LockItem>> {
        self.check_available()?;
        Ok(self.item(id).into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::ChunkBody;

    fn chunk(id: &str, version: i64) -> ChunkItem {
        ChunkItem {
            id: id.to_string(),
            version,
            body: ChunkBody::Text(format!("{}@{}", id, version)),
            next_id: None,
            ttl: None,
        }
    }

    #[tokio::test]
    async fn test_query_latest_returns_highest_version() {
        let table = MemoryStateTable::new("state");
        table.insert(chunk("a", 0));
        table.insert(chunk("a", 2));
        table.insert(chunk("ab", 7));

        let latest = table.query_latest("a").await.unwrap().unwrap();
        assert_eq!(latest.version, 2);

        let all = table.query_all("a").await.unwrap();
        assert_eq!(
            all.iter().map(|c| c.version).collect::<Vec<_>>(),
            vec![2, 0]
        );

        assert!(table.query_latest("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_transaction_rejected_as_a_whole() {
        let table = MemoryStateTable::new("state");
        table.insert(chunk("a", 0));

        let duplicate = vec![
            WriteOp::Delete {
                id: "a".to_string(),
                version: 0,
            },
            WriteOp::Put(chunk("a", 0)),
        ];
        assert!(table.transact_write(duplicate).await.is_err());

        let too_many: Vec<_> = (0..=MAX_TRANSACTION_ITEMS as i64)
            .map(|v| WriteOp::Put(chunk("b", v)))
            .collect();
        assert!(table.transact_write(too_many).await.is_err());

        assert_eq!(table.items().len(), 1);
        assert!(table.transactions().is_empty());
    }

    #[tokio::test]
    async fn test_injected_failure_hits_requested_transaction() {
        let table = MemoryStateTable::new("state");
        table.fail_transaction(2);

        table
            .transact_write(vec![WriteOp::Put(chunk("a", 0))])
            .await
            .unwrap();
        assert!(
            table
                .transact_write(vec![WriteOp::Put(chunk("a", 2))])
                .await
                .is_err()
        );
        table
            .transact_write(vec![WriteOp::Put(chunk("a", 4))])
            .await
            .unwrap();

        let versions: Vec<_> = table.items().iter().map(|c| c.version).collect();
        assert_eq!(versions, vec![0, 4]);
    }

    #[tokio::test]
    async fn test_lock_table_conditional_put_and_origin() {
        let table = MemoryLockTable::new("locks", "us-east-1");
        assert!(table.put_item_if_absent(LockItem::lock("k", "one")).await.unwrap());
        assert!(!table.put_item_if_absent(LockItem::lock("k", "two")).await.unwrap());

        let item = table.get_item("k").await.unwrap().unwrap();
        assert_eq!(item.info.as_deref(), Some("one"));
        assert_eq!(table.origin_region_of(&item), "us-east-1");

        table.set_unavailable(true);
        assert!(table.get_item("k").await.is_err());
    }
}
