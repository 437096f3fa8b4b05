use crate::storage::{ChecksumGuard, VersionChain, compute_digest};
use crate::{Result, StateError};
use bytes::Bytes;
use std::sync::Arc;

#[derive(Clone)]
pub struct WriteStateOperation {
    chain: Arc<VersionChain>,
    checksum: Arc<ChecksumGuard>,
}

#[derive(Debug, Clone)]
pub struct WriteStateOperationRequest {
    pub path: String,
    pub lock_path: String,
    pub data: Bytes,
    pub retention_days: i64,
}

#[derive(Debug, Clone)]
pub struct WriteStateOperationResult {
    pub version: i64,
    pub chunks: usize,
    pub md5: Vec<u8>,
}

impl WriteStateOperation {
    pub fn new(chain: Arc<VersionChain>, checksum: Arc<ChecksumGuard>) -> Self {
        Self { chain, checksum }
    }

    pub async fn run(&self, request: WriteStateOperationRequest) -> Result<WriteStateOperationResult> {
        let WriteStateOperationRequest {
            path,
            lock_path,
            data,
            retention_days,
        } = request;

        let prior = self.chain.read_chain(&path).await?;
        if self.chain.codec().compression() {
            tracing::info!("Compressing state for {} ({} bytes)", path, data.len());
        }

        let written = self
            .chain
            .write_chain(&path, &data, &prior, retention_days)
            .await?;
        let md5 = compute_digest(&written.wire);

        // the next read would fail its digest check forever without this
        self.checksum
            .record_digest(&lock_path, &md5)
            .await
            .map_err(|e| StateError::transport(format!("failed to store state digest: {}", e)))?;

        tracing::info!(
            "Stored state for {} at version {} in {} chunks",
            path,
            written.version,
            written.chunks
        );

        Ok(WriteStateOperationResult {
            version: written.version,
            chunks: written.chunks,
            md5,
        })
    }
}
