use crate::config::StoreConfig;
use crate::lock::{LockCoordinator, LockInfo};
use crate::operations::{
    DeleteStateOperation, DeleteStateOperationRequest, ReadStateOperation,
    ReadStateOperationOutcome, ReadStateOperationRequest, StateLockOperation,
    StateLockOperationRequest, StateUnlockOperationRequest, WriteStateOperation,
    WriteStateOperationRequest,
};
use crate::storage::{ChecksumGuard, MismatchHook, ReplicaConsistencyPoller, VersionChain};
use crate::table::{LockTable, StateTable};
use crate::{Result, StateError};
use bytes::Bytes;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// A stored document as handed back to callers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    pub data: Bytes,
    /// MD5 of the stored (possibly compressed) bytes
    pub md5: Vec<u8>,
}

#[derive(Default)]
pub struct RemoteStateClientBuilder {
    config: Option<StoreConfig>,
    state_table: Option<Arc<dyn StateTable>>,
    lock_table: Option<Arc<dyn LockTable>>,
    replicas: Vec<Arc<dyn LockTable>>,
    cancel: Option<CancellationToken>,
    mismatch_hook: Option<MismatchHook>,
}

impl RemoteStateClientBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: StoreConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn state_table(mut self, table: Arc<dyn StateTable>) -> Self {
        self.state_table = Some(table);
        self
    }

    pub fn lock_table(mut self, table: Arc<dyn LockTable>) -> Self {
        self.lock_table = Some(table);
        self
    }

    /// Per-region handles of the replicated lock table
    pub fn replicas(mut self, replicas: Vec<Arc<dyn LockTable>>) -> Self {
        self.replicas = replicas;
        self
    }

    /// Stops replica polling when cancelled
    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Called whenever a read sees a digest mismatch
    pub fn on_digest_mismatch(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.mismatch_hook = Some(Arc::new(hook));
        self
    }

    fn resolve_config(&self) -> Result<StoreConfig> {
        let config = self
            .config
            .clone()
            .ok_or_else(|| StateError::config("store config is required"))?;
        config.validate()?;
        Ok(config)
    }

    fn resolve_state_table(&self) -> Result<Arc<dyn StateTable>> {
        self.state_table
            .clone()
            .ok_or_else(|| StateError::config("state table handle is required"))
    }

    fn resolve_lock_table(&self, config: &StoreConfig) -> Result<Option<Arc<dyn LockTable>>> {
        match (&config.lock_table, &self.lock_table) {
            (Some(name), None) => Err(StateError::config(format!(
                "lock table {} is configured but no handle was provided",
                name
            ))),
            (None, Some(_)) => Err(StateError::config(
                "lock table handle provided but lock_table is not configured",
            )),
            (_, table) => Ok(table.clone()),
        }
    }

    pub async fn build(&self) -> Result<RemoteStateClient> {
        let config = self.resolve_config()?;
        let state_table = self.resolve_state_table()?;
        let lock_table = self.resolve_lock_table(&config)?;

        let mut replicas = self.replicas.clone();
        if lock_table.is_none() && !replicas.is_empty() {
            return Err(StateError::config(
                "lock table replicas require a lock table",
            ));
        }
        if !replicas.is_empty() && config.global_table_health_check {
            replicas = LockCoordinator::filter_healthy_replicas(replicas).await;
        }
        if !replicas.is_empty() {
            tracing::info!("Working with {} lock table replicas", replicas.len());
        }

        let polling = &config.polling;
        let poller = ReplicaConsistencyPoller::new(polling.poll_interval())
            .with_deadline(polling.replication_timeout())
            .with_cancellation(self.cancel.clone());

        let chain = Arc::new(VersionChain::new(
            state_table,
            config.codec()?,
            polling.chain_read_interval(),
        ));
        let checksum = Arc::new(
            ChecksumGuard::new(lock_table.clone(), replicas.clone(), poller.clone())
                .with_mismatch_hook(self.mismatch_hook.clone()),
        );
        let locks = Arc::new(LockCoordinator::new(lock_table, replicas, poller));

        Ok(RemoteStateClient {
            lock_path: config.lock_path(),
            read: ReadStateOperation::new(chain.clone(), checksum.clone()),
            write: WriteStateOperation::new(chain.clone(), checksum.clone()),
            delete: DeleteStateOperation::new(chain, checksum),
            lock: StateLockOperation::new(locks),
            config,
        })
    }
}

/// Client for one state document
#[derive(Clone)]
pub struct RemoteStateClient {
    config: StoreConfig,
    lock_path: String,
    read: ReadStateOperation,
    write: WriteStateOperation,
    delete: DeleteStateOperation,
    lock: StateLockOperation,
}

impl RemoteStateClient {
    pub fn builder() -> RemoteStateClientBuilder {
        RemoteStateClientBuilder::new()
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn lock_path(&self) -> &str {
        &self.lock_path
    }

    /// Latest stored document, or `None` when nothing has been stored.
    pub async fn get(&self) -> Result<Option<Payload>> {
        let outcome = self
            .read
            .run(ReadStateOperationRequest {
                path: self.config.path.clone(),
                lock_path: self.lock_path.clone(),
                consistency_timeout: self.config.polling.consistency_timeout(),
                poll_interval: self.config.polling.poll_interval(),
            })
            .await?;

        match outcome {
            ReadStateOperationOutcome::Found(found) => Ok(Some(Payload {
                data: found.data,
                md5: found.md5,
            })),
            ReadStateOperationOutcome::NotFound => Ok(None),
        }
    }

    pub async fn put(&self, data: impl Into<Bytes>) -> Result<()> {
        self.write
            .run(WriteStateOperationRequest {
                path: self.config.path.clone(),
                lock_path: self.lock_path.clone(),
                data: data.into(),
                retention_days: self.config.retention_days,
            })
            .await?;
        Ok(())
    }

    pub async fn delete(&self) -> Result<()> {
        self.delete
            .run(DeleteStateOperationRequest {
                path: self.config.path.clone(),
                lock_path: self.lock_path.clone(),
            })
            .await?;
        Ok(())
    }

    /// Take the document lock. Returns the id needed to release it.
    pub async fn lock(&self, info: LockInfo) -> Result<String> {
        let result = self
            .lock
            .run_lock(StateLockOperationRequest {
                lock_path: self.lock_path.clone(),
                info,
            })
            .await?;
        Ok(result.lock_id)
    }

    pub async fn unlock(&self, id: &str) -> Result<()> {
        self.lock
            .run_unlock(StateUnlockOperationRequest {
                lock_path: self.lock_path.clone(),
                lock_id: id.to_string(),
            })
            .await
    }

    pub async fn lock_info(&self) -> Result<Option<LockInfo>> {
        self.lock.run_info(&self.lock_path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::{MemoryLockTable, MemoryStateTable};

    #[tokio::test]
    async fn test_builder_requires_config_and_table() {
        assert!(RemoteStateClient::builder().build().await.is_err());

        let err = RemoteStateClient::builder()
            .config(StoreConfig::new("states", "prod"))
            .build()
            .await
            .err()
            .unwrap();
        assert!(matches!(err, StateError::Config(_)));
    }

    #[tokio::test]
    async fn test_builder_checks_lock_table_pairing() {
        let mut config = StoreConfig::new("states", "prod");
        config.lock_table = Some("locks".to_string());

        let result = RemoteStateClient::builder()
            .config(config)
            .state_table(Arc::new(MemoryStateTable::new("states")))
            .build()
            .await;
        assert!(matches!(result, Err(StateError::Config(_))));

        let result = RemoteStateClient::builder()
            .config(StoreConfig::new("states", "prod"))
            .state_table(Arc::new(MemoryStateTable::new("states")))
            .lock_table(Arc::new(MemoryLockTable::new("locks", "us-east-1")))
            .build()
            .await;
        assert!(matches!(result, Err(StateError::Config(_))));
    }

    #[tokio::test]
    async fn test_unhealthy_replicas_are_dropped() {
        let mut config = StoreConfig::new("states", "prod");
        config.lock_table = Some("locks".to_string());
        config.region = Some("us-east-1".to_string());
        config.replica_regions = vec!["us-east-1".to_string(), "eu-west-1".to_string()];

        let local = MemoryLockTable::new("locks", "us-east-1");
        let remote = local.replica("eu-west-1");
        remote.set_unavailable(true);
        let replicas: Vec<Arc<dyn LockTable>> = vec![Arc::new(local.clone()), Arc::new(remote)];

        let client = RemoteStateClient::builder()
            .config(config)
            .state_table(Arc::new(MemoryStateTable::new("states")))
            .lock_table(Arc::new(local.clone()))
            .replicas(replicas)
            .build()
            .await
            .unwrap();

        // only the local replica is polled, so locking completes
        let id = client.lock(LockInfo::new("apply")).await.unwrap();
        client.unlock(&id).await.unwrap();
    }

    #[tokio::test]
    async fn test_nested_document_path() {
        let mut config = StoreConfig::new("states", "/infra/dev");
        config.lock_table = Some("locks".to_string());
        let locks = MemoryLockTable::new("locks", "us-east-1");

        let client = RemoteStateClient::builder()
            .config(config)
            .state_table(Arc::new(MemoryStateTable::new("states")))
            .lock_table(Arc::new(locks.clone()))
            .build()
            .await
            .unwrap();
        assert_eq!(client.lock_path(), "states//infra/dev");

        let id = client.lock(LockInfo::new("apply")).await.unwrap();
        assert_eq!(client.lock_info().await.unwrap().unwrap().path, "states//infra/dev");

        client.put("nested").await.unwrap();
        assert_eq!(client.get().await.unwrap().unwrap().data.as_ref(), b"nested");
        assert!(locks.item("states//infra/dev-md5").is_some());

        client.unlock(&id).await.unwrap();
    }

    #[tokio::test]
    async fn test_without_lock_table() {
        let client = RemoteStateClient::builder()
            .config(StoreConfig::new("states", "prod"))
            .state_table(Arc::new(MemoryStateTable::new("states")))
            .build()
            .await
            .unwrap();

        assert_eq!(client.lock_path(), "states/prod");
        assert_eq!(client.lock(LockInfo::new("apply")).await.unwrap(), "");
        client.unlock("").await.unwrap();

        client.put("hello").await.unwrap();
        let payload = client.get().await.unwrap().unwrap();
        assert_eq!(payload.data.as_ref(), b"hello");
    }
}
