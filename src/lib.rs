//! Transactional, pipelined write-back cache.
//!
//! Row state is sharded into partitions. Each partition serializes its
//! transactions and checkpoints with a FIFO lock, keeps committed edits in
//! memory and drains them into a storage-supplied checkpoint command on
//! demand. Storage loads run with the partition lock released, so a slow load
//! only delays the transaction that needs the row.
//!
//! Start with [`cache::PipelinedCache`].

#![warn(missing_docs)]

pub mod cache;
pub mod error;
pub mod primitives;
pub mod types;

pub use cache::{
    CacheOptions, CheckpointCommand, CheckpointPolicy, PartitionMetaData, PipelinedCache, Table,
    TableStorage, TxContext, TxPhase, Writeback,
};
pub use error::{CacheError, Result};
pub use types::{PartitionId, RowId, SequenceNumber};
