use crate::cache::meta::PartitionMetaData;
use crate::cache::writeback::Writeback;
use crate::error::Result;
use crate::types::{PartitionId, RowId, SequenceNumber};

/// Callback run once a checkpoint has been durably written.
pub type PostCheckpointAction = Box<dyn FnOnce() + Send + 'static>;

/// Callback run after a transaction commits, outside the partition lock.
pub type CompletionAction = Box<dyn FnOnce() + Send + 'static>;

/// Batch of write-back work collected from one partition.
///
/// Implemented by the storage layer. The cache only populates the command;
/// persisting it and invoking the post-checkpoint actions afterwards is the
/// implementor's responsibility. When rows were collected, the partition adds
/// one action of its own that lets those rows be evicted again, so actions
/// must run only once the checkpoint is durable.
pub trait CheckpointCommand: Send + 'static {
    /// Receives the partition snapshot to persist with this checkpoint.
    fn set_partition_metadata(&mut self, metadata: PartitionMetaData);

    /// Receives a callback to invoke once the checkpoint is durable.
    fn add_post_checkpoint_action(&mut self, action: PostCheckpointAction);
}

/// Capability a row entry exposes so a partition can collect its delta and
/// roll it back without knowing the concrete table type.
pub trait TrackedRow<C>: Send + Sync {
    /// Identity used to keep the row at most once in a set.
    fn row_id(&self) -> RowId;

    /// Current write-back status.
    fn writeback(&self) -> Writeback;

    /// Appends this row's net delta to `command` and marks the row clean.
    fn add_delta_to_checkpoint(&self, partition: PartitionId, command: &mut C) -> Result<()>;

    /// Captures the pre-transaction image. Returns true the first time per transaction.
    fn add_rollback(&self) -> bool;

    /// Drops the captured image; the transaction's edits are committed.
    fn discard_rollback(&self);

    /// Restores the captured image.
    fn rollback(&self);
}

/// Observer of partition-level transaction completions.
///
/// Used by the orchestration layer to schedule follow-on work, such as waking
/// a session waiting on the partition.
pub trait TransactionListener: Send + Sync {
    /// Called when transaction `tx` commits on `partition`, before the lock
    /// passes to the next waiter.
    fn transaction_completed(&self, partition: PartitionId, tx: SequenceNumber);
}
