//! Storage modules for Dynastate
//!
//! Chunk encoding, version chains over the state table, digest tracking and
//! replica polling over the lock table.

pub mod chain;
pub mod checksum;
pub mod codec;
pub mod replica;

pub use chain::{Chain, ChainState, INITIAL_VERSION, VersionChain, WrittenChain, archive_ttl};
pub use checksum::{ChecksumGuard, DIGEST_SUFFIX, MismatchHook, compute_digest, digest_id};
pub use codec::{BodyEncoding, ChunkCodec, DEFAULT_ITEM_SIZE, EncodedPayload, compress, decompress};
pub use replica::ReplicaConsistencyPoller;
