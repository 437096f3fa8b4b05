use crate::storage::{ChainState, ChecksumGuard, VersionChain, compute_digest};
use crate::Result;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone)]
pub struct ReadStateOperation {
    chain: Arc<VersionChain>,
    checksum: Arc<ChecksumGuard>,
}

#[derive(Debug, Clone)]
pub struct ReadStateOperationRequest {
    pub path: String,
    pub lock_path: String,
    pub consistency_timeout: Duration,
    pub poll_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct ReadStateOperationResult {
    pub data: Bytes,
    /// MD5 of the stored (possibly compressed) bytes
    pub md5: Vec<u8>,
    pub version: i64,
    pub state: ChainState,
}

#[derive(Debug, Clone)]
pub enum ReadStateOperationOutcome {
    Found(ReadStateOperationResult),
    NotFound,
}

impl ReadStateOperation {
    pub fn new(chain: Arc<VersionChain>, checksum: Arc<ChecksumGuard>) -> Self {
        Self { chain, checksum }
    }

    pub async fn run(&self, request: ReadStateOperationRequest) -> Result<ReadStateOperationOutcome> {
        let ReadStateOperationRequest {
            path,
            lock_path,
            consistency_timeout,
            poll_interval,
        } = request;

        let path = path.as_str();
        self.checksum
            .verify_on_read(&lock_path, consistency_timeout, poll_interval, move || {
                self.read_once(path)
            })
            .await
    }

    /// One pass over the chain, paired with the digest a reader observed.
    /// The digest is empty when nothing is stored at all.
    async fn read_once(&self, path: &str) -> Result<(ReadStateOperationOutcome, Vec<u8>)> {
        let chain = self.chain.read_chain(path).await?;
        let (Some(version), Some(state)) = (chain.version(), chain.state()) else {
            return Ok((ReadStateOperationOutcome::NotFound, Vec::new()));
        };

        let wire = chain.reassemble();
        let md5 = compute_digest(&wire);

        if wire.is_empty() {
            return Ok((ReadStateOperationOutcome::NotFound, md5));
        }

        let data = self.chain.decode(&chain, &wire)?;
        if data.is_empty() {
            return Ok((ReadStateOperationOutcome::NotFound, md5));
        }

        if state == ChainState::Pending {
            tracing::warn!(
                "Latest write to {} did not complete, serving archived version {}",
                path,
                version
            );
        }

        Ok((
            ReadStateOperationOutcome::Found(ReadStateOperationResult {
                data,
                md5: md5.clone(),
                version,
                state,
            }),
            md5,
        ))
    }
}
