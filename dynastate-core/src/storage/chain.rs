use crate::storage::codec::{self, BodyEncoding, ChunkCodec};
use crate::table::{ChunkItem, MAX_TRANSACTION_ITEMS, StateTable, WriteOp};
use crate::{Result, StateError};
use bytes::Bytes;
use chrono::Utc;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use ulid::Ulid;

/// Version a chain is considered to have before its first write.
pub const INITIAL_VERSION: i64 = -2;

/// Committed chains sit on even versions, archive copies on odd ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainState {
    Committed,
    /// Only the archive copy of a write survived; the replacement chain never
    /// landed.
    Pending,
}

impl ChainState {
    pub fn of(version: i64) -> Self {
        if version.rem_euclid(2) == 0 {
            ChainState::Committed
        } else {
            ChainState::Pending
        }
    }
}

/// Chunks of one logical version, head first
#[derive(Debug, Clone, Default)]
pub struct Chain {
    pub chunks: Vec<ChunkItem>,
}

impl Chain {
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn version(&self) -> Option<i64> {
        self.chunks.first().map(|chunk| chunk.version)
    }

    pub fn state(&self) -> Option<ChainState> {
        self.version().map(ChainState::of)
    }

    pub fn encoding(&self) -> BodyEncoding {
        BodyEncoding::detect(self.chunks.iter().map(|chunk| &chunk.body))
    }

    /// Concatenated bodies in chain order, exactly as stored
    pub fn reassemble(&self) -> Bytes {
        codec::join(self.chunks.iter().map(|chunk| &chunk.body))
    }
}

/// Archive expiry for a retention setting. `None` keeps the copy forever.
pub fn archive_ttl(retention_days: i64) -> Option<i64> {
    if retention_days > 0 {
        Some((Utc::now() + chrono::Duration::days(retention_days)).timestamp())
    } else {
        None
    }
}

/// Outcome of a successful chain write
#[derive(Debug, Clone)]
pub struct WrittenChain {
    pub version: i64,
    pub chunks: usize,
    /// Exact bytes stored, which is what the digest is computed over
    pub wire: Bytes,
}

fn continuation_id(path: &str) -> String {
    format!("{}-{}", path, Ulid::new().to_string().to_lowercase())
}

pub struct VersionChain {
    table: Arc<dyn StateTable>,
    codec: ChunkCodec,
    read_interval: Duration,
}

impl VersionChain {
    pub fn new(table: Arc<dyn StateTable>, codec: ChunkCodec, read_interval: Duration) -> Self {
        Self {
            table,
            codec,
            read_interval,
        }
    }

    pub fn codec(&self) -> &ChunkCodec {
        &self.codec
    }

    /// Read the highest-version chain stored under `path`.
    ///
    /// An empty chain means nothing has been written yet.
    pub async fn read_chain(&self, path: &str) -> Result<Chain> {
        let Some(head) = self.table.query_latest(path).await? else {
            return Ok(Chain::default());
        };

        let mut seen = HashSet::from([head.id.clone()]);
        let mut chunks = vec![head];

        while let Some(next) = chunks.last().and_then(|chunk| chunk.next()).map(str::to_string) {
            if !seen.insert(next.clone()) {
                return Err(StateError::inconsistent_chain(
                    path,
                    format!("chunk {} appears twice in the chain", next),
                ));
            }

            if !self.read_interval.is_zero() {
                tokio::time::sleep(self.read_interval).await;
            }

            let chunk = self.table.query_latest(&next).await?.ok_or_else(|| {
                StateError::inconsistent_chain(path, format!("chunk {} is missing", next))
            })?;
            chunks.push(chunk);
        }

        let version = chunks[0].version;
        if let Some(stray) = chunks.iter().find(|chunk| chunk.version != version) {
            return Err(StateError::inconsistent_chain(
                path,
                format!(
                    "chunk {} has version {}, head has version {}",
                    stray.id, stray.version, version
                ),
            ));
        }

        tracing::debug!(
            "Read chain for {} at version {} with {} chunks",
            path,
            version,
            chunks.len()
        );

        Ok(Chain { chunks })
    }

    /// Replace `prior` with a new chain holding `payload`.
    ///
    /// With `retention_days >= 0` the prior chain is first copied to the odd
    /// version between the two, in its own transaction. Otherwise its deletes
    /// ride along with the new chunks.
    pub async fn write_chain(
        &self,
        path: &str,
        payload: &[u8],
        prior: &Chain,
        retention_days: i64,
    ) -> Result<WrittenChain> {
        let archive = retention_days >= 0;
        let base = match (prior.version(), prior.state()) {
            (Some(version), Some(ChainState::Pending)) => version - 1,
            (Some(version), _) => version,
            _ => INITIAL_VERSION,
        };

        let mut archive_ops = Vec::new();
        let mut carried = Vec::new();

        match prior.state() {
            Some(ChainState::Committed) => {
                let ttl = archive_ttl(retention_days);
                for chunk in &prior.chunks {
                    let delete = WriteOp::Delete {
                        id: chunk.id.clone(),
                        version: chunk.version,
                    };
                    if archive {
                        archive_ops.push(delete);
                        archive_ops.push(WriteOp::Put(ChunkItem {
                            version: base + 1,
                            ttl,
                            ..chunk.clone()
                        }));
                    } else {
                        carried.push(delete);
                    }
                }
            }
            Some(ChainState::Pending) => {
                tracing::warn!(
                    "Replacing archive-only chain for {} at version {}",
                    path,
                    base + 1
                );
                // the archive copy already exists; only drop it when archiving is off
                if !archive {
                    carried.extend(prior.chunks.iter().map(|chunk| WriteOp::Delete {
                        id: chunk.id.clone(),
                        version: chunk.version,
                    }));
                }
            }
            None => {}
        }

        let encoded = self.codec.encode(payload)?;
        let version = base + 2;
        let count = encoded.bodies.len();

        let mut ids = Vec::with_capacity(count);
        ids.push(path.to_string());
        ids.extend((1..count).map(|_| continuation_id(path)));

        let mut ops = carried;
        for (i, body) in encoded.bodies.into_iter().enumerate() {
            ops.push(WriteOp::Put(ChunkItem {
                id: ids[i].clone(),
                version,
                body,
                next_id: ids.get(i + 1).cloned(),
                ttl: None,
            }));
        }

        // both steps are checked before either commits
        for step in [&archive_ops, &ops] {
            if step.len() > MAX_TRANSACTION_ITEMS {
                return Err(StateError::TransactionTooLarge {
                    path: path.to_string(),
                    items: step.len(),
                    limit: MAX_TRANSACTION_ITEMS,
                });
            }
        }

        if !archive_ops.is_empty() {
            self.table.transact_write(archive_ops).await?;
            tracing::debug!(
                "Archived {} chunks of {} at version {}",
                prior.chunks.len(),
                path,
                base + 1
            );
        }

        self.table.transact_write(ops).await?;

        tracing::debug!(
            "Wrote chain for {} at version {} with {} chunks ({} bytes)",
            path,
            version,
            count,
            encoded.wire.len()
        );

        Ok(WrittenChain {
            version,
            chunks: count,
            wire: encoded.wire,
        })
    }

    /// Delete every chunk stored under `path`, including the continuation
    /// chunks of every version. Returns the number of items removed.
    pub async fn delete_chain(&self, path: &str) -> Result<usize> {
        let mut seen = HashSet::from([path.to_string()]);
        let mut queue = VecDeque::from([path.to_string()]);
        let mut deletes = Vec::new();

        while let Some(id) = queue.pop_front() {
            for chunk in self.table.query_all(&id).await? {
                if let Some(next) = chunk.next() {
                    if seen.insert(next.to_string()) {
                        queue.push_back(next.to_string());
                    }
                }
                deletes.push(WriteOp::Delete {
                    id: chunk.id,
                    version: chunk.version,
                });
            }
        }

        if deletes.is_empty() {
            tracing::debug!("Nothing stored under {}", path);
            return Ok(0);
        }

        let total = deletes.len();
        for batch in deletes.chunks(MAX_TRANSACTION_ITEMS) {
            self.table.transact_write(batch.to_vec()).await?;
        }

        tracing::info!("Deleted {} chunks stored under {}", total, path);
        Ok(total)
    }

    /// Decode a chain's reassembled bytes back into the caller's payload
    pub fn decode(&self, chain: &Chain, wire: &[u8]) -> Result<Bytes> {
        match chain.encoding() {
            BodyEncoding::Gzip => Ok(Bytes::from(codec::decompress(wire)?)),
            BodyEncoding::Text => Ok(Bytes::copy_from_slice(wire)),
        }
    }
}
