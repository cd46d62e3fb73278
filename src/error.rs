//! Error types shared by the crate.

use std::error::Error as StdError;
use std::sync::Arc;

use thiserror::Error;

use crate::cache::TxPhase;
use crate::types::{PartitionId, SequenceNumber};

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, CacheError>;

/// Errors raised by the cache.
///
/// The protocol variants report callers that broke the transaction contract.
/// They are never retried internally.
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    /// An operation was issued in the wrong transaction phase.
    #[error("{op} requires the {expected} phase, transaction {tx} is in {actual}")]
    Phase {
        /// Operation that was attempted.
        op: &'static str,
        /// Phase the operation requires.
        expected: &'static str,
        /// Phase the transaction was in.
        actual: TxPhase,
        /// Offending transaction.
        tx: SequenceNumber,
    },
    /// The transaction was already committed or aborted.
    #[error("transaction {0} already completed")]
    AlreadyCompleted(SequenceNumber),
    /// Prefetches were registered but not awaited with `complete_prefetches`.
    #[error("transaction {0} has outstanding prefetches")]
    PrefetchOutstanding(SequenceNumber),
    /// The key was never prefetched or created in this partition.
    #[error("row is not cached; prefetch it first")]
    RowNotCached,
    /// The key's load has not landed yet.
    #[error("row load still pending")]
    LoadPending,
    /// `create_non_existing` on a row that exists.
    #[error("row already exists")]
    RowExists,
    /// Update or delete on a row that does not exist.
    #[error("row does not exist")]
    RowMissing,
    /// A release was attempted by someone other than the lock holder.
    #[error("lock on partition {partition} is not held by {holder}")]
    NotLockHolder {
        /// Partition whose lock was released.
        partition: PartitionId,
        /// Claimed holder.
        holder: SequenceNumber,
    },
    /// A queued lock grant was dropped before it could be delivered.
    #[error("lock grant abandoned")]
    LockAbandoned,
    /// No partition with this id has been recovered.
    #[error("unknown partition {0}")]
    UnknownPartition(PartitionId),
    /// The partition was already recovered.
    #[error("partition {0} already recovered")]
    DuplicatePartition(PartitionId),
    /// A table with this name is already registered.
    #[error("table {0} already registered")]
    DuplicateTable(String),
    /// A storage hook failed.
    #[error("storage: {0}")]
    Storage(Arc<dyn StdError + Send + Sync>),
    /// Durable metadata failed validation.
    #[error("corruption: {0}")]
    Corruption(&'static str),
    /// Invalid argument.
    #[error("invalid argument: {0}")]
    Invalid(String),
    /// Configuration could not be read or validated.
    #[error("config: {0}")]
    Config(String),
}

impl CacheError {
    /// Wraps a storage-layer failure.
    pub fn storage<E>(err: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        CacheError::Storage(Arc::new(err))
    }

    /// Returns true for errors caused by the caller breaking the transaction protocol.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            CacheError::Phase { .. }
                | CacheError::AlreadyCompleted(_)
                | CacheError::PrefetchOutstanding(_)
                | CacheError::RowNotCached
                | CacheError::LoadPending
                | CacheError::RowExists
                | CacheError::RowMissing
                | CacheError::NotLockHolder { .. }
        )
    }
}

impl From<std::io::Error> for CacheError {
    fn from(err: std::io::Error) -> Self {
        CacheError::storage(err)
    }
}
