use crate::storage::{ChecksumGuard, VersionChain};
use crate::Result;
use std::sync::Arc;

#[derive(Clone)]
pub struct DeleteStateOperation {
    chain: Arc<VersionChain>,
    checksum: Arc<ChecksumGuard>,
}

#[derive(Debug, Clone)]
pub struct DeleteStateOperationRequest {
    pub path: String,
    pub lock_path: String,
}

#[derive(Debug, Clone)]
pub struct DeleteStateOperationResult {
    pub deleted_chunks: usize,
}

impl DeleteStateOperation {
    pub fn new(chain: Arc<VersionChain>, checksum: Arc<ChecksumGuard>) -> Self {
        Self { chain, checksum }
    }

    pub async fn run(&self, request: DeleteStateOperationRequest) -> Result<DeleteStateOperationResult> {
        let DeleteStateOperationRequest { path, lock_path } = request;

        let deleted_chunks = self.chain.delete_chain(&path).await?;

        if let Err(error) = self.checksum.delete_digest(&lock_path).await {
            tracing::warn!("Error deleting state digest for {}: {}", lock_path, error);
        }

        Ok(DeleteStateOperationResult { deleted_chunks })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{ChunkCodec, ReplicaConsistencyPoller, compute_digest};
    use crate::table::{LockItem, LockTable, MemoryLockTable, MemoryStateTable};
    use std::time::Duration;

    #[tokio::test]
    async fn test_delete_removes_chunks_and_digest() {
        let state = MemoryStateTable::new("states");
        let locks = MemoryLockTable::new("locks", "us-east-1");
        let chain = Arc::new(VersionChain::new(
            Arc::new(state.clone()),
            ChunkCodec::new(false, 4).unwrap(),
            Duration::ZERO,
        ));
        let checksum = Arc::new(ChecksumGuard::new(
            Some(Arc::new(locks.clone())),
            Vec::new(),
            ReplicaConsistencyPoller::new(Duration::from_secs(2)),
        ));

        let written = chain
            .write_chain("prod", b"0123456789", &Default::default(), -1)
            .await
            .unwrap();
        checksum
            .record_digest("states/prod", &compute_digest(&written.wire))
            .await
            .unwrap();
        locks
            .put_item(LockItem::lock("states/prod", "{}"))
            .await
            .unwrap();

        let operation = DeleteStateOperation::new(chain, checksum);
        let request = DeleteStateOperationRequest {
            path: "prod".to_string(),
            lock_path: "states/prod".to_string(),
        };

        let result = operation.run(request.clone()).await.unwrap();
        assert_eq!(result.deleted_chunks, 3);
        assert!(state.items().is_empty());
        assert!(locks.item("states/prod-md5").is_none());
        // the lock record is not touched
        assert!(locks.item("states/prod").is_some());

        // digest removal is best effort
        locks.set_unavailable(true);
        let result = operation.run(request).await.unwrap();
        assert_eq!(result.deleted_chunks, 0);
    }
}
