//! Cooperative locking on the lock table
//!
//! A lock is a single record keyed by the lock path; whoever managed to create
//! it holds the lock. With regional replicas configured, acquisition is only
//! final once every replica shows the same record, since concurrent writers in
//! different regions can each create it locally before replication settles.

use crate::storage::ReplicaConsistencyPoller;
use crate::table::{LockItem, LockTable};
use crate::{Result, StateError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use ulid::Ulid;

/// Metadata stored in a lock record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "PascalCase")]
pub struct LockInfo {
    #[serde(rename = "ID")]
    pub id: String,
    pub operation: String,
    pub info: String,
    pub who: String,
    pub version: String,
    pub created: DateTime<Utc>,
    pub path: String,
}

impl LockInfo {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            who: default_holder(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            created: Utc::now(),
            ..Default::default()
        }
    }

    pub fn with_info(mut self, info: impl Into<String>) -> Self {
        self.info = info.into();
        self
    }

    pub fn with_who(mut self, who: impl Into<String>) -> Self {
        self.who = who.into();
        self
    }

    pub fn marshal(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn unmarshal(data: &str) -> Result<Self> {
        Ok(serde_json::from_str(data)?)
    }
}

fn default_holder() -> String {
    let user = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string());
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
    format!("{}@{}", user, host)
}

fn decode_info(item: &LockItem) -> Result<LockInfo> {
    LockInfo::unmarshal(item.info.as_deref().unwrap_or_default())
}

#[derive(Clone)]
pub struct LockCoordinator {
    lock_table: Option<Arc<dyn LockTable>>,
    replicas: Vec<Arc<dyn LockTable>>,
    poller: ReplicaConsistencyPoller,
}

impl LockCoordinator {
    pub fn new(
        lock_table: Option<Arc<dyn LockTable>>,
        replicas: Vec<Arc<dyn LockTable>>,
        poller: ReplicaConsistencyPoller,
    ) -> Self {
        Self {
            lock_table,
            replicas,
            poller,
        }
    }

    pub fn enabled(&self) -> bool {
        self.lock_table.is_some()
    }

    /// Create the lock record for `lock_path`. Returns the lock id, which is
    /// empty when no lock table is configured.
    pub async fn acquire(&self, lock_path: &str, mut info: LockInfo) -> Result<String> {
        let Some(table) = &self.lock_table else {
            tracing::warn!("No lock table configured, skipping lock for {}", lock_path);
            return Ok(String::new());
        };

        info.path = lock_path.to_string();
        if info.id.is_empty() {
            info.id = Ulid::new().to_string();
        }

        let record = LockItem::lock(lock_path, info.marshal()?);
        if !table.put_item_if_absent(record).await? {
            let (holder, reason) = match self.lock_info(lock_path).await {
                Ok(holder) => (holder, "conditional request failed".to_string()),
                Err(error) => (
                    None,
                    format!(
                        "conditional request failed; failed to read lock info: {}",
                        error
                    ),
                ),
            };
            return Err(StateError::LockHeld {
                info: holder.map(Box::new),
                reason,
            });
        }

        if !self.replicas.is_empty() {
            match self.confirm_replication(lock_path).await {
                Ok(None) => {}
                Ok(Some(holder)) => {
                    tracing::warn!(
                        "Lock {} was taken concurrently by {} ({})",
                        lock_path,
                        holder.who,
                        holder.id
                    );
                    return Err(StateError::LockHeld {
                        info: Some(Box::new(holder)),
                        reason: "lock acquired concurrently in another region".to_string(),
                    });
                }
                Err(error) => {
                    if let Err(release_error) = self.release(lock_path, &info.id).await {
                        tracing::warn!(
                            "Failed to release lock {} after confirmation error: {}",
                            lock_path,
                            release_error
                        );
                    }
                    return Err(error);
                }
            }
        }

        tracing::debug!("Acquired lock {} with id {}", lock_path, info.id);
        Ok(info.id)
    }

    /// Remove the lock record, provided it carries `id`.
    pub async fn release(&self, lock_path: &str, id: &str) -> Result<()> {
        let Some(table) = &self.lock_table else {
            tracing::warn!("No lock table configured, skipping unlock for {}", lock_path);
            return Ok(());
        };

        let mismatch = |info: Option<LockInfo>, reason: String| StateError::LockMismatch {
            id: id.to_string(),
            info: info.map(Box::new),
            reason,
        };

        let item = match table.get_item(lock_path).await {
            Ok(Some(item)) => item,
            Ok(None) => return Err(mismatch(None, "no lock is held".to_string())),
            Err(error) => {
                return Err(mismatch(
                    None,
                    format!("failed to retrieve lock info: {}", error),
                ));
            }
        };

        let holder = decode_info(&item)
            .map_err(|error| mismatch(None, format!("failed to decode lock info: {}", error)))?;

        if holder.id != id {
            return Err(mismatch(
                Some(holder),
                "lock id does not match existing lock".to_string(),
            ));
        }

        table.delete_item(lock_path).await?;
        tracing::debug!("Released lock {} with id {}", lock_path, id);
        Ok(())
    }

    /// Current holder of `lock_path`, if any
    pub async fn lock_info(&self, lock_path: &str) -> Result<Option<LockInfo>> {
        let Some(table) = &self.lock_table else {
            return Ok(None);
        };

        match table.get_item(lock_path).await? {
            Some(item) => Ok(Some(decode_info(&item)?)),
            None => Ok(None),
        }
    }

    /// Wait until every replica holds a lock record with the same origin
    /// region, then report the holder if that region is not ours.
    pub async fn confirm_replication(&self, lock_path: &str) -> Result<Option<LockInfo>> {
        let Some(table) = &self.lock_table else {
            return Ok(None);
        };
        if self.replicas.is_empty() {
            return Ok(None);
        }

        let (origin, item) = self
            .poller
            .poll_until_agree_by(
                &self.replicas,
                |replica| async move {
                    let items = replica.query_items(lock_path).await?;
                    Ok::<_, StateError>(
                        items
                            .into_iter()
                            .next()
                            .map(|item| (replica.origin_region_of(&item), item)),
                    )
                },
                |a: &(String, LockItem), b: &(String, LockItem)| a.0 == b.0,
            )
            .await?;

        if origin.is_empty() || origin == table.region() {
            return Ok(None);
        }

        tracing::debug!(
            "Lock {} replicated from {}, local region is {}",
            lock_path,
            origin,
            table.region()
        );
        Ok(Some(decode_info(&item)?))
    }

    /// Probe each replica with a throwaway write and keep the ones that answer.
    pub async fn filter_healthy_replicas(
        replicas: Vec<Arc<dyn LockTable>>,
    ) -> Vec<Arc<dyn LockTable>> {
        let mut healthy = Vec::with_capacity(replicas.len());

        for replica in replicas {
            let probe = format!("health-check-{}", Ulid::new());
            let result = async {
                replica.put_item(LockItem::lock(&probe, "")).await?;
                replica.delete_item(&probe).await
            }
            .await;

            match result {
                Ok(()) => {
                    tracing::info!("Replica {} is healthy", replica.region());
                    healthy.push(replica);
                }
                Err(error) => {
                    tracing::warn!(
                        "Replica {} is not healthy, skipping it for locking: {}",
                        replica.region(),
                        error
                    );
                }
            }
        }

        healthy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::MemoryLockTable;
    use std::time::Duration;

    const LOCK_PATH: &str = "state/env/dev";

    fn coordinator(table: &MemoryLockTable, replicas: &[&MemoryLockTable]) -> LockCoordinator {
        LockCoordinator::new(
            Some(Arc::new(table.clone())),
            replicas
                .iter()
                .map(|r| Arc::new((*r).clone()) as Arc<dyn LockTable>)
                .collect(),
            ReplicaConsistencyPoller::new(Duration::from_secs(2)),
        )
    }

    #[test]
    fn test_lock_info_json_shape() {
        let info = LockInfo {
            id: "abc".to_string(),
            operation: "apply".to_string(),
            ..Default::default()
        };
        let json = info.marshal().unwrap();
        assert!(json.contains(r#""ID":"abc""#));
        assert!(json.contains(r#""Operation":"apply""#));
        assert_eq!(LockInfo::unmarshal(&json).unwrap(), info);
    }

    #[tokio::test]
    async fn test_acquire_and_release() {
        let table = MemoryLockTable::new("locks", "us-east-1");
        let locks = coordinator(&table, &[]);

        let id = locks.acquire(LOCK_PATH, LockInfo::new("apply")).await.unwrap();
        assert!(!id.is_empty());

        let holder = locks.lock_info(LOCK_PATH).await.unwrap().unwrap();
        assert_eq!(holder.id, id);
        assert_eq!(holder.path, LOCK_PATH);

        locks.release(LOCK_PATH, &id).await.unwrap();
        assert!(table.item(LOCK_PATH).is_none());
    }

    #[tokio::test]
    async fn test_acquire_keeps_caller_id() {
        let table = MemoryLockTable::new("locks", "us-east-1");
        let locks = coordinator(&table, &[]);

        let info = LockInfo {
            id: "fixed".to_string(),
            ..LockInfo::new("plan")
        };
        assert_eq!(locks.acquire(LOCK_PATH, info).await.unwrap(), "fixed");
    }

    #[tokio::test]
    async fn test_contention_reports_holder() {
        let table = MemoryLockTable::new("locks", "us-east-1");
        let locks = coordinator(&table, &[]);

        let first = locks
            .acquire(LOCK_PATH, LockInfo::new("apply").with_who("alice@ci"))
            .await
            .unwrap();
        let err = locks
            .acquire(LOCK_PATH, LockInfo::new("apply"))
            .await
            .unwrap_err();

        assert!(matches!(err, StateError::LockHeld { .. }));
        let holder = err.lock_info().unwrap();
        assert_eq!(holder.id, first);
        assert_eq!(holder.who, "alice@ci");
    }

    #[tokio::test]
    async fn test_release_with_wrong_id() {
        let table = MemoryLockTable::new("locks", "us-east-1");
        let locks = coordinator(&table, &[]);

        let id = locks.acquire(LOCK_PATH, LockInfo::new("apply")).await.unwrap();
        let err = locks.release(LOCK_PATH, "someone-else").await.unwrap_err();

        match &err {
            StateError::LockMismatch { id: given, info, .. } => {
                assert_eq!(given, "someone-else");
                assert_eq!(info.as_ref().unwrap().id, id);
            }
            other => panic!("unexpected error: {}", other),
        }
        assert!(table.item(LOCK_PATH).is_some());
    }

    #[tokio::test]
    async fn test_release_without_lock() {
        let table = MemoryLockTable::new("locks", "us-east-1");
        let err = coordinator(&table, &[])
            .release(LOCK_PATH, "anything")
            .await
            .unwrap_err();
        assert!(matches!(err, StateError::LockMismatch { info: None, .. }));
    }

    #[tokio::test]
    async fn test_release_undecodable_record() {
        let table = MemoryLockTable::new("locks", "us-east-1");
        table
            .put_item(LockItem::lock(LOCK_PATH, "not json"))
            .await
            .unwrap();

        let err = coordinator(&table, &[])
            .release(LOCK_PATH, "anything")
            .await
            .unwrap_err();
        assert!(matches!(err, StateError::LockMismatch { .. }));
        assert!(table.item(LOCK_PATH).is_some());
    }

    #[tokio::test]
    async fn test_no_lock_table() {
        let locks = LockCoordinator::new(
            None,
            Vec::new(),
            ReplicaConsistencyPoller::new(Duration::from_secs(2)),
        );
        assert_eq!(locks.acquire(LOCK_PATH, LockInfo::new("apply")).await.unwrap(), "");
        locks.release(LOCK_PATH, "").await.unwrap();
        assert!(locks.lock_info(LOCK_PATH).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_replicated_lock_confirmed() {
        let local = MemoryLockTable::new("locks", "us-east-1");
        let remote = local.replica("eu-west-1");
        let locks = coordinator(&local, &[&local, &remote]);

        let holder = LockInfo::new("apply");
        let info_json = LockInfo {
            path: LOCK_PATH.to_string(),
            id: "ours".to_string(),
            ..holder.clone()
        }
        .marshal()
        .unwrap();
        remote.insert_replicated(LockItem::lock(LOCK_PATH, info_json), "us-east-1");

        let id = locks
            .acquire(
                LOCK_PATH,
                LockInfo {
                    id: "ours".to_string(),
                    ..holder
                },
            )
            .await
            .unwrap();
        assert_eq!(id, "ours");
    }

    #[tokio::test(start_paused = true)]
    async fn test_cross_region_conflict_reported() {
        let local = MemoryLockTable::new("locks", "us-east-1");
        let remote = local.replica("eu-west-1");
        let locks = coordinator(&local, &[&local, &remote]);

        let theirs = LockInfo {
            id: "theirs".to_string(),
            path: LOCK_PATH.to_string(),
            ..LockInfo::new("apply").with_who("bob@eu")
        };

        // the remote writer wins replication a few seconds after we write
        let (l, r, json) = (local.clone(), remote.clone(), theirs.marshal().unwrap());
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(3)).await;
            l.insert_replicated(LockItem::lock(LOCK_PATH, json.clone()), "eu-west-1");
            r.insert_replicated(LockItem::lock(LOCK_PATH, json), "eu-west-1");
        });

        let err = locks
            .acquire(LOCK_PATH, LockInfo::new("apply"))
            .await
            .unwrap_err();
        assert!(matches!(err, StateError::LockHeld { .. }));
        assert_eq!(err.lock_info().unwrap().id, "theirs");
        assert_eq!(err.lock_info().unwrap().who, "bob@eu");
    }

    #[tokio::test(start_paused = true)]
    async fn test_confirmation_failure_releases_lock() {
        let local = MemoryLockTable::new("locks", "us-east-1");
        let remote = local.replica("eu-west-1");
        let replicas: Vec<Arc<dyn LockTable>> = vec![Arc::new(local.clone()), Arc::new(remote)];
        let locks = LockCoordinator::new(
            Some(Arc::new(local.clone())),
            replicas,
            ReplicaConsistencyPoller::new(Duration::from_secs(2))
                .with_deadline(Some(Duration::from_secs(10))),
        );

        let err = locks
            .acquire(LOCK_PATH, LockInfo::new("apply"))
            .await
            .unwrap_err();
        assert!(matches!(err, StateError::ReplicationTimeout(_)));
        assert!(local.item(LOCK_PATH).is_none());
    }

    #[tokio::test]
    async fn test_filter_healthy_replicas() {
        let up = MemoryLockTable::new("locks", "us-east-1");
        let down = up.replica("eu-west-1");
        down.set_unavailable(true);

        let replicas: Vec<Arc<dyn LockTable>> = vec![Arc::new(up.clone()), Arc::new(down)];
        let healthy = LockCoordinator::filter_healthy_replicas(replicas).await;

        assert_eq!(healthy.len(), 1);
        assert_eq!(healthy[0].region(), "us-east-1");
        assert!(up.item(LOCK_PATH).is_none());
    }
}
