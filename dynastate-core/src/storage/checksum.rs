use crate::storage::ReplicaConsistencyPoller;
use crate::table::{LockItem, LockTable};
use crate::{Result, StateError};
use md5::{Digest, Md5};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Digest records live next to the lock record under `lock_path + suffix`.
pub const DIGEST_SUFFIX: &str = "-md5";

pub const DIGEST_LEN: usize = 16;

/// Invoked every time a read observes a digest mismatch
pub type MismatchHook = Arc<dyn Fn() + Send + Sync>;

pub fn compute_digest(data: &[u8]) -> Vec<u8> {
    let mut hasher = Md5::new();
    hasher.update(data);
    hasher.finalize().to_vec()
}

pub fn digest_id(lock_path: &str) -> String {
    format!("{}{}", lock_path, DIGEST_SUFFIX)
}

fn decode_digest(item: Option<LockItem>) -> Result<Option<Vec<u8>>> {
    let Some(encoded) = item.and_then(|item| item.digest) else {
        return Ok(None);
    };

    let sum = hex::decode(&encoded)
        .map_err(|e| StateError::InvalidDigest(format!("{:?}: {}", encoded, e)))?;
    if sum.len() != DIGEST_LEN {
        return Err(StateError::InvalidDigest(format!(
            "{:?} is {} bytes, expected {}",
            encoded,
            sum.len(),
            DIGEST_LEN
        )));
    }

    Ok(Some(sum))
}

/// Tracks the MD5 of the last written payload so readers can detect that the
/// table served them something older.
///
/// Digest tracking is only active when a lock table is configured.
#[derive(Clone)]
pub struct ChecksumGuard {
    lock_table: Option<Arc<dyn LockTable>>,
    replicas: Vec<Arc<dyn LockTable>>,
    poller: ReplicaConsistencyPoller,
    mismatch_hook: Option<MismatchHook>,
}

impl ChecksumGuard {
    pub fn new(
        lock_table: Option<Arc<dyn LockTable>>,
        replicas: Vec<Arc<dyn LockTable>>,
        poller: ReplicaConsistencyPoller,
    ) -> Self {
        Self {
            lock_table,
            replicas,
            poller,
            mismatch_hook: None,
        }
    }

    pub fn with_mismatch_hook(mut self, hook: Option<MismatchHook>) -> Self {
        self.mismatch_hook = hook;
        self
    }

    pub fn enabled(&self) -> bool {
        self.lock_table.is_some()
    }

    /// Write or overwrite the digest record. The caller decides whether a
    /// failure matters.
    pub async fn record_digest(&self, lock_path: &str, digest: &[u8]) -> Result<()> {
        let Some(table) = &self.lock_table else {
            return Ok(());
        };

        if digest.len() != DIGEST_LEN {
            return Err(StateError::InvalidDigest(format!(
                "refusing to store {}-byte digest",
                digest.len()
            )));
        }

        table
            .put_item(LockItem::digest(digest_id(lock_path), hex::encode(digest)))
            .await?;
        tracing::debug!("Recorded digest {} for {}", hex::encode(digest), lock_path);
        Ok(())
    }

    /// Digest of the last successful write, if one is recorded.
    ///
    /// With regional replicas configured every replica is read until they
    /// agree; a replica that fails to answer counts as having no digest.
    pub async fn expected_digest(&self, lock_path: &str) -> Result<Option<Vec<u8>>> {
        let Some(table) = &self.lock_table else {
            return Ok(None);
        };

        let id = digest_id(lock_path);

        if self.replicas.is_empty() {
            return decode_digest(table.get_item(&id).await?);
        }

        tracing::debug!("Reading digest for {} from {} replicas", lock_path, self.replicas.len());
        self.poller
            .poll_until_agree(&self.replicas, |replica| {
                let id = id.clone();
                async move {
                    let sum = match replica.get_item(&id).await {
                        Ok(item) => decode_digest(item).unwrap_or_default(),
                        Err(error) => {
                            tracing::debug!(
                                "Digest read from {} failed: {}",
                                replica.region(),
                                error
                            );
                            None
                        }
                    };
                    Ok::<_, StateError>(Some(sum))
                }
            })
            .await
    }

    pub async fn delete_digest(&self, lock_path: &str) -> Result<()> {
        let Some(table) = &self.lock_table else {
            return Ok(());
        };
        table.delete_item(&digest_id(lock_path)).await
    }

    /// Run `read` until the digest it observes matches the recorded one, or
    /// until `timeout` has elapsed.
    ///
    /// `read` returns its value together with the digest of what it saw (empty
    /// when there was nothing to see). A failure to fetch the recorded digest
    /// is logged and the read is accepted as is.
    pub async fn verify_on_read<T, F, Fut>(
        &self,
        lock_path: &str,
        timeout: Duration,
        poll_interval: Duration,
        mut read: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<(T, Vec<u8>)>>,
    {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let (value, observed) = read().await?;

            let expected = match self.expected_digest(lock_path).await {
                Ok(Some(expected)) => expected,
                Ok(None) => return Ok(value),
                Err(error) => {
                    tracing::warn!("Failed to fetch state digest for {}: {}", lock_path, error);
                    return Ok(value);
                }
            };

            if expected == observed {
                return Ok(value);
            }

            tracing::warn!(
                "State digest mismatch for {}: expected '{}', got '{}'",
                lock_path,
                hex::encode(&expected),
                hex::encode(&observed)
            );

            if let Some(hook) = &self.mismatch_hook {
                hook();
            }

            if tokio::time::Instant::now() < deadline {
                tokio::time::sleep(poll_interval).await;
                tracing::info!("Retrying state read for {}", lock_path);
                continue;
            }

            return Err(StateError::StaleRead {
                expected: hex::encode(&expected),
                actual: hex::encode(&observed),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::MemoryLockTable;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn guard(table: &MemoryLockTable) -> ChecksumGuard {
        ChecksumGuard::new(
            Some(Arc::new(table.clone())),
            Vec::new(),
            ReplicaConsistencyPoller::new(Duration::from_secs(2)),
        )
    }

    #[test]
    fn test_compute_digest() {
        assert_eq!(
            hex::encode(compute_digest(b"")),
            "d41d8cd98f00b204e9800998ecf8427e"
        );
    }

    #[tokio::test]
    async fn test_record_and_fetch_digest() {
        let table = MemoryLockTable::new("locks", "us-east-1");
        let guard = guard(&table);
        let sum = compute_digest(b"state");

        assert_eq!(guard.expected_digest("state/dev").await.unwrap(), None);

        guard.record_digest("state/dev", &sum).await.unwrap();
        assert_eq!(
            table.item("state/dev-md5").unwrap().digest,
            Some(hex::encode(&sum))
        );
        assert_eq!(guard.expected_digest("state/dev").await.unwrap(), Some(sum));

        guard.delete_digest("state/dev").await.unwrap();
        assert_eq!(guard.expected_digest("state/dev").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_no_lock_table_disables_tracking() {
        let guard = ChecksumGuard::new(
            None,
            Vec::new(),
            ReplicaConsistencyPoller::new(Duration::from_secs(2)),
        );
        guard
            .record_digest("state/dev", &compute_digest(b"x"))
            .await
            .unwrap();
        assert_eq!(guard.expected_digest("state/dev").await.unwrap(), None);
        assert!(!guard.enabled());
    }

    #[tokio::test]
    async fn test_malformed_digest_record() {
        let table = MemoryLockTable::new("locks", "us-east-1");
        table
            .put_item(LockItem::digest("state/dev-md5", "abcd"))
            .await
            .unwrap();

        let err = guard(&table).expected_digest("state/dev").await.unwrap_err();
        assert!(matches!(err, StateError::InvalidDigest(_)));

        let err = guard(&table)
            .record_digest("state/dev", b"short")
            .await
            .unwrap_err();
        assert!(matches!(err, StateError::InvalidDigest(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_verify_on_read_matches_immediately() {
        let table = MemoryLockTable::new("locks", "us-east-1");
        let sum = compute_digest(b"state");
        let calls = Arc::new(AtomicUsize::new(0));
        let hook_calls = calls.clone();
        let guard = guard(&table).with_mismatch_hook(Some(Arc::new(move || {
            hook_calls.fetch_add(1, Ordering::SeqCst);
        })));
        guard.record_digest("state/dev", &sum).await.unwrap();

        let start = tokio::time::Instant::now();
        let value = guard
            .verify_on_read(
                "state/dev",
                Duration::from_secs(10),
                Duration::from_secs(2),
                || {
                    let sum = sum.clone();
                    async move { Ok(("state", sum)) }
                },
            )
            .await
            .unwrap();

        assert_eq!(value, "state");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_verify_on_read_retries_until_budget_spent() {
        let table = MemoryLockTable::new("locks", "us-east-1");
        let calls = Arc::new(AtomicUsize::new(0));
        let hook_calls = calls.clone();
        let guard = guard(&table).with_mismatch_hook(Some(Arc::new(move || {
            hook_calls.fetch_add(1, Ordering::SeqCst);
        })));
        guard
            .record_digest("state/dev", &compute_digest(b"new"))
            .await
            .unwrap();

        let reads = Arc::new(AtomicUsize::new(0));
        let start = tokio::time::Instant::now();
        let err = guard
            .verify_on_read(
                "state/dev",
                Duration::from_secs(10),
                Duration::from_secs(2),
                || {
                    reads.fetch_add(1, Ordering::SeqCst);
                    async { Ok(((), compute_digest(b"old"))) }
                },
            )
            .await
            .unwrap_err();

        // reads at t = 0, 2, 4, 6, 8 and a final one at the deadline
        assert_eq!(reads.load(Ordering::SeqCst), 6);
        assert_eq!(calls.load(Ordering::SeqCst), 6);
        assert_eq!(start.elapsed(), Duration::from_secs(10));
        match err {
            StateError::StaleRead { expected, actual } => {
                assert_eq!(expected, hex::encode(compute_digest(b"new")));
                assert_eq!(actual, hex::encode(compute_digest(b"old")));
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_verify_on_read_rides_out_lag() {
        let table = MemoryLockTable::new("locks", "us-east-1");
        let guard = guard(&table);
        guard
            .record_digest("state/dev", &compute_digest(b"new"))
            .await
            .unwrap();

        let reads = Arc::new(AtomicUsize::new(0));
        let value = guard
            .verify_on_read(
                "state/dev",
                Duration::from_secs(10),
                Duration::from_secs(2),
                || {
                    let n = reads.fetch_add(1, Ordering::SeqCst);
                    let seen: &'static [u8] = if n < 2 { b"old" } else { b"new" };
                    async move { Ok((seen, compute_digest(seen))) }
                },
            )
            .await
            .unwrap();

        assert_eq!(value, b"new");
        assert_eq!(reads.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_unreadable_digest_accepts_read() {
        let table = MemoryLockTable::new("locks", "us-east-1");
        let guard = guard(&table);
        table.set_unavailable(true);

        let value = guard
            .verify_on_read(
                "state/dev",
                Duration::from_secs(10),
                Duration::from_secs(2),
                || async { Ok((42, compute_digest(b"anything"))) },
            )
            .await
            .unwrap();
        assert_eq!(value, 42);
    }

    #[tokio::test]
    async fn test_expected_digest_across_replicas() {
        let local = MemoryLockTable::new("locks", "us-east-1");
        let remote = local.replica("eu-west-1");
        let sum = compute_digest(b"state");
        for table in [&local, &remote] {
            table.insert_replicated(
                LockItem::digest("state/dev-md5", hex::encode(&sum)),
                "us-east-1",
            );
        }

        let replicas: Vec<Arc<dyn LockTable>> = vec![Arc::new(local.clone()), Arc::new(remote)];
        let guard = ChecksumGuard::new(
            Some(Arc::new(local)),
            replicas,
            ReplicaConsistencyPoller::new(Duration::from_secs(2)),
        );

        assert_eq!(guard.expected_digest("state/dev").await.unwrap(), Some(sum));
    }
}
