use crate::Result;
use crate::lock::{LockCoordinator, LockInfo};
use std::sync::Arc;

#[derive(Clone)]
pub struct StateLockOperation {
    locks: Arc<LockCoordinator>,
}

#[derive(Debug, Clone)]
pub struct StateLockOperationRequest {
    pub lock_path: String,
    pub info: LockInfo,
}

#[derive(Debug, Clone)]
pub struct StateLockOperationResult {
    /// Empty when locking is disabled
    pub lock_id: String,
}

#[derive(Debug, Clone)]
pub struct StateUnlockOperationRequest {
    pub lock_path: String,
    pub lock_id: String,
}

impl StateLockOperation {
    pub fn new(locks: Arc<LockCoordinator>) -> Self {
        Self { locks }
    }

    pub async fn run_lock(&self, request: StateLockOperationRequest) -> Result<StateLockOperationResult> {
        let StateLockOperationRequest { lock_path, info } = request;

        let operation = info.operation.clone();
        let lock_id = self.locks.acquire(&lock_path, info).await?;
        if !lock_id.is_empty() {
            tracing::info!("Locked {} for {} with id {}", lock_path, operation, lock_id);
        }

        Ok(StateLockOperationResult { lock_id })
    }

    pub async fn run_unlock(&self, request: StateUnlockOperationRequest) -> Result<()> {
        let StateUnlockOperationRequest { lock_path, lock_id } = request;

        self.locks.release(&lock_path, &lock_id).await?;
        tracing::info!("Unlocked {}", lock_path);
        Ok(())
    }

    pub async fn run_info(&self, lock_path: &str) -> Result<Option<LockInfo>> {
        self.locks.lock_info(lock_path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StateError;
    use crate::storage::ReplicaConsistencyPoller;
    use crate::table::MemoryLockTable;
    use std::time::Duration;

    #[tokio::test]
    async fn test_lock_unlock_cycle() {
        let table = MemoryLockTable::new("locks", "us-east-1");
        let operation = StateLockOperation::new(Arc::new(LockCoordinator::new(
            Some(Arc::new(table.clone())),
            Vec::new(),
            ReplicaConsistencyPoller::new(Duration::from_secs(2)),
        )));

        let locked = operation
            .run_lock(StateLockOperationRequest {
                lock_path: "states/prod".to_string(),
                info: LockInfo::new("apply").with_info("nightly run"),
            })
            .await
            .unwrap();

        let holder = operation.run_info("states/prod").await.unwrap().unwrap();
        assert_eq!(holder.id, locked.lock_id);
        assert_eq!(holder.info, "nightly run");

        let err = operation
            .run_lock(StateLockOperationRequest {
                lock_path: "states/prod".to_string(),
                info: LockInfo::new("plan"),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StateError::LockHeld { .. }));

        operation
            .run_unlock(StateUnlockOperationRequest {
                lock_path: "states/prod".to_string(),
                lock_id: locked.lock_id,
            })
            .await
            .unwrap();
        assert!(operation.run_info("states/prod").await.unwrap().is_none());
    }
}
