//! Partitioned transactional cache.
//!
//! The pieces fit together as follows:
//!
//! - [`PipelinedCache`] owns the [`Partition`]s and the registered tables.
//! - A [`TxContext`] is one transaction on one partition. It moves through
//!   [`TxPhase::Prefetch`], [`TxPhase::WaitingForPrefetch`],
//!   [`TxPhase::Execution`] and ends in [`TxPhase::Completed`].
//! - A [`Table`] caches rows per partition and reports dirty rows to the
//!   partition through the [`TrackedRow`] trait.
//! - [`Partition::collect_next_checkpoint`] drains dirty rows into a
//!   storage-supplied [`CheckpointCommand`].

mod meta;
pub mod memory;
pub mod metrics;
mod options;
mod partition;
mod pipelined;
mod row;
mod table;
mod tracked;
mod transaction;
mod writeback;

#[cfg(test)]
mod tests;

pub use meta::PartitionMetaData;
pub use metrics::{CacheMetrics, CounterMetrics, NoopMetrics};
pub use options::{CacheOptions, CheckpointPolicy};
pub use partition::{CheckpointSummary, Partition};
pub use pipelined::PipelinedCache;
pub use row::RowStats;
pub use table::{Table, TableRecovery, TableStorage};
pub use tracked::{
    CheckpointCommand, CompletionAction, PostCheckpointAction, TrackedRow, TransactionListener,
};
pub use transaction::{TxContext, TxPhase};
pub use writeback::{DirtyChange, Writeback};
