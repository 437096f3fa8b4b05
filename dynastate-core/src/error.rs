use crate::lock::LockInfo;
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, StateError>;

#[derive(Error, Debug)]
pub enum StateError {
    /// A call against the backing table failed
    #[error("Table error: {0}")]
    Transport(String),

    /// Chunks of one chain disagree on their version, or the chain is broken
    #[error("Inconsistent chunk chain for {path}: {reason}")]
    InconsistentChain { path: String, reason: String },

    /// The stored digest never matched what the table returned
    #[error("{}", stale_read_message(.expected, .actual))]
    StaleRead { expected: String, actual: String },

    #[error("Lock held: {reason}")]
    LockHeld {
        info: Option<Box<LockInfo>>,
        reason: String,
    },

    #[error("Lock mismatch for id {id:?}: {reason}")]
    LockMismatch {
        id: String,
        info: Option<Box<LockInfo>>,
        reason: String,
    },

    #[error("Codec error: {0}")]
    Codec(String),

    /// A single atomic step of a write needs more items than one transaction takes
    #[error("Write to {path} needs {items} table items, a single transaction allows {limit}")]
    TransactionTooLarge {
        path: String,
        items: usize,
        limit: usize,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid digest record: {0}")]
    InvalidDigest(String),

    #[error("Replicas did not agree within {0:?}")]
    ReplicationTimeout(Duration),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StateError {
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    pub fn codec(msg: impl Into<String>) -> Self {
        Self::Codec(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn inconsistent_chain(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InconsistentChain {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Metadata of the lock holder, for contention and mismatch errors
    pub fn lock_info(&self) -> Option<&LockInfo> {
        match self {
            Self::LockHeld { info, .. } | Self::LockMismatch { info, .. } => info.as_deref(),
            _ => None,
        }
    }
}

fn stale_read_message(expected: &str, actual: &str) -> String {
    format!(
        "State data does not have the expected content (expected digest {}, got {}). \
         This may be caused by unusually long replication delays after a previous update. \
         Wait a minute or two and try again; if the problem persists, verify the stored \
         state manually and update the Digest value in the lock table to: {}",
        expected, actual, actual
    )
}
