//! Dynastate Core - remote, versioned state documents on key-value tables
//!
//! One logical document per path, stored as:
//! - a chain of size-limited chunks sharing one version, optionally gzip'd
//! - an MD5 digest record used to detect stale reads
//! - a lock record for cooperative mutual exclusion, confirmed across
//!   regional replicas when the lock table is replicated

pub mod client;
pub mod config;
pub mod error;
pub mod lock;
pub mod operations;
pub mod storage;
pub mod table;

pub use client::{Payload, RemoteStateClient, RemoteStateClientBuilder};
pub use config::{PollingConfig, StoreConfig};
pub use error::{Result, StateError};
pub use lock::{LockCoordinator, LockInfo};
pub use storage::{
    BodyEncoding, Chain, ChainState, ChecksumGuard, ChunkCodec, ReplicaConsistencyPoller,
    VersionChain, compute_digest,
};
pub use table::{
    ChunkBody, ChunkItem, LockItem, LockTable, MemoryLockTable, MemoryStateTable, StateTable,
    WriteOp,
};
