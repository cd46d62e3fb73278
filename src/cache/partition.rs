use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use crate::cache::meta::PartitionMetaData;
use crate::cache::metrics::CacheMetrics;
use crate::cache::options::{CacheOptions, CheckpointPolicy};
use crate::cache::tracked::{
    CheckpointCommand, PostCheckpointAction, TrackedRow, TransactionListener,
};
use crate::cache::transaction::TxContext;
use crate::error::{CacheError, Result};
use crate::primitives::concurrency::{FifoLock, Grant, LockSnapshot};
use crate::types::{PartitionId, RowId, SequenceNumber};

/// Why the partition lock is being released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Release {
    /// The holder was a transaction that committed.
    Completed,
    /// Checkpoint finished, prefetch wait, or abort.
    Handoff,
}

/// Result of one checkpoint collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointSummary {
    /// Partition that was checkpointed.
    pub partition: PartitionId,
    /// Sequence number recorded as the last checkpoint id.
    pub checkpoint_id: SequenceNumber,
    /// Row deltas appended to the command.
    pub deltas: usize,
    /// Queued transaction actions handed to the command.
    pub actions: usize,
}

/// One shard of the keyspace.
///
/// Transactions and checkpoints on a partition are serialized by one FIFO
/// lock. The write-back set, rollback log, sequence counter and deduplication
/// vector are only touched by the current lock holder.
pub struct Partition<C> {
    id: PartitionId,
    lock: FifoLock,
    state: Mutex<PartitionState<C>>,
    unpersisted: Arc<Mutex<BTreeMap<RowId, SequenceNumber>>>,
    metrics: Arc<dyn CacheMetrics>,
    listener: Option<Arc<dyn TransactionListener>>,
}

struct PartitionState<C> {
    last_sequence_number: SequenceNumber,
    last_checkpoint_id: SequenceNumber,
    last_checkpoint_at: Instant,
    dedup_vector: Vec<u64>,
    writebacks: BTreeMap<RowId, Arc<dyn TrackedRow<C>>>,
    rollback_log: Vec<Arc<dyn TrackedRow<C>>>,
    post_checkpoint: Vec<PostCheckpointAction>,
}

impl<C: CheckpointCommand> Partition<C> {
    pub(crate) fn recover(
        metadata: PartitionMetaData,
        options: &CacheOptions,
        metrics: Arc<dyn CacheMetrics>,
        listener: Option<Arc<dyn TransactionListener>>,
    ) -> Self {
        Self {
            id: metadata.partition_id,
            lock: FifoLock::new(metadata.partition_id, options.slow_lock_wait()),
            state: Mutex::new(PartitionState {
                last_sequence_number: metadata.last_checkpoint_id,
                last_checkpoint_id: metadata.last_checkpoint_id,
                last_checkpoint_at: Instant::now(),
                dedup_vector: metadata.dedup_vector,
                writebacks: BTreeMap::new(),
                rollback_log: Vec::new(),
                post_checkpoint: Vec::new(),
            }),
            unpersisted: Arc::new(Mutex::new(BTreeMap::new())),
            metrics,
            listener,
        }
    }

    /// Partition id.
    pub fn id(&self) -> PartitionId {
        self.id
    }

    /// Most recently allocated sequence number.
    pub fn last_sequence_number(&self) -> SequenceNumber {
        self.state.lock().last_sequence_number
    }

    /// Id of the last collected checkpoint.
    pub fn last_checkpoint_id(&self) -> SequenceNumber {
        self.state.lock().last_checkpoint_id
    }

    /// Current metadata as of the last collected checkpoint, with the live vector.
    pub fn metadata(&self) -> PartitionMetaData {
        let state = self.state.lock();
        PartitionMetaData {
            partition_id: self.id,
            last_checkpoint_id: state.last_checkpoint_id,
            dedup_vector: state.dedup_vector.clone(),
        }
    }

    /// Number of rows awaiting write-back.
    pub fn dirty_rows(&self) -> usize {
        self.state.lock().writebacks.len()
    }

    /// Number of queued post-checkpoint actions.
    pub fn pending_actions(&self) -> usize {
        self.state.lock().post_checkpoint.len()
    }

    /// Number of rows collected into checkpoints that have not been persisted yet.
    pub fn unpersisted_rows(&self) -> usize {
        self.unpersisted.lock().len()
    }

    /// True while the last checkpoint that collected `row` is not yet durable.
    pub(crate) fn is_unpersisted(&self, row: RowId) -> bool {
        self.unpersisted.lock().contains_key(&row)
    }

    /// Returns a snapshot of the partition lock.
    pub fn lock_snapshot(&self) -> LockSnapshot {
        self.lock.snapshot()
    }

    /// Reports whether accumulated work exceeds `policy`.
    pub fn checkpoint_due(&self, policy: &CheckpointPolicy) -> bool {
        let state = self.state.lock();
        let dirty = state.writebacks.len();
        let actions = state.post_checkpoint.len();
        if dirty >= policy.max_dirty_rows || actions >= policy.max_pending_actions {
            return true;
        }
        let pending = dirty > 0 || actions > 0;
        match policy.max_interval() {
            Some(max) => pending && state.last_checkpoint_at.elapsed() >= max,
            None => false,
        }
    }

    pub(crate) fn metrics(&self) -> &Arc<dyn CacheMetrics> {
        &self.metrics
    }

    pub(crate) fn next_sequence_number(&self) -> SequenceNumber {
        let mut state = self.state.lock();
        state.last_sequence_number = state.last_sequence_number.next();
        state.last_sequence_number
    }

    /// Starts a transaction, waiting behind earlier lock holders.
    ///
    /// The context starts in the prefetch phase and holds the partition lock.
    pub async fn start_transaction(self: &Arc<Self>) -> Result<TxContext<C>> {
        let id = self.acquire_next().await?;
        debug!(partition = %self.id, tx_id = %id, "transaction started");
        Ok(TxContext::new(Arc::clone(self), id))
    }

    /// Reacquires the lock under an id allocated earlier.
    pub(crate) async fn acquire(&self, holder: SequenceNumber) -> Result<()> {
        if self.lock.acquire(holder).await? == Grant::Queued {
            self.metrics.lock_contended();
        }
        Ok(())
    }

    /// Allocates the next sequence number and acquires the lock for it.
    async fn acquire_next(&self) -> Result<SequenceNumber> {
        let (holder, grant) = self
            .lock
            .acquire_next(|| self.next_sequence_number())
            .await?;
        if grant == Grant::Queued {
            self.metrics.lock_contended();
        }
        Ok(holder)
    }

    pub(crate) fn release(&self, holder: SequenceNumber, kind: Release) -> Result<()> {
        if self.lock.holder() != Some(holder) {
            return Err(CacheError::NotLockHolder {
                partition: self.id,
                holder,
            });
        }
        if kind == Release::Completed {
            let committed = std::mem::take(&mut self.state.lock().rollback_log);
            for row in committed {
                row.discard_rollback();
            }
            if let Some(listener) = self.listener.as_ref() {
                listener.transaction_completed(self.id, holder);
            }
        }
        self.lock.release(holder)
    }

    /// Drains the write-back set and queued actions into `command`.
    ///
    /// Runs under the partition lock, so the collected set is a consistent
    /// snapshot. The lock is released even if populating the command fails.
    pub async fn collect_next_checkpoint(&self, command: &mut C) -> Result<CheckpointSummary> {
        let checkpoint_id = self.acquire_next().await?;
        let collected = self.populate_checkpoint(checkpoint_id, command);
        let released = self.release(checkpoint_id, Release::Handoff);
        let summary = collected?;
        released?;
        self.metrics
            .checkpoint_collected(summary.deltas, summary.actions);
        info!(
            partition = %self.id,
            checkpoint_id = %checkpoint_id,
            deltas = summary.deltas,
            actions = summary.actions,
            "checkpoint collected"
        );
        Ok(summary)
    }

    fn populate_checkpoint(
        &self,
        checkpoint_id: SequenceNumber,
        command: &mut C,
    ) -> Result<CheckpointSummary> {
        let (metadata, rows) = {
            let mut state = self.state.lock();
            let metadata = PartitionMetaData {
                partition_id: self.id,
                last_checkpoint_id: checkpoint_id,
                dedup_vector: state.dedup_vector.clone(),
            };
            (metadata, std::mem::take(&mut state.writebacks))
        };
        command.set_partition_metadata(metadata);

        let mut collected = Vec::with_capacity(rows.len());
        let mut rows = rows.into_iter();
        while let Some((id, row)) = rows.next() {
            if let Err(err) = row.add_delta_to_checkpoint(self.id, command) {
                let mut state = self.state.lock();
                state.writebacks.insert(id, row);
                state.writebacks.extend(rows);
                warn!(
                    partition = %self.id,
                    checkpoint_id = %checkpoint_id,
                    appended = collected.len(),
                    restored = state.writebacks.len(),
                    error = %err,
                    "checkpoint population failed"
                );
                return Err(err);
            }
            collected.push(id);
        }
        let deltas = collected.len();

        let actions = {
            let mut state = self.state.lock();
            state.last_checkpoint_id = checkpoint_id;
            state.last_checkpoint_at = Instant::now();
            std::mem::take(&mut state.post_checkpoint)
        };
        let action_count = actions.len();
        for action in actions {
            command.add_post_checkpoint_action(action);
        }
        if !collected.is_empty() {
            self.track_unpersisted(checkpoint_id, collected, command);
        }
        Ok(CheckpointSummary {
            partition: self.id,
            checkpoint_id,
            deltas,
            actions: action_count,
        })
    }

    /// Keeps collected rows resident until `command` reports itself durable.
    fn track_unpersisted(
        &self,
        checkpoint_id: SequenceNumber,
        rows: Vec<RowId>,
        command: &mut C,
    ) {
        self.unpersisted
            .lock()
            .extend(rows.into_iter().map(|row| (row, checkpoint_id)));
        let unpersisted = Arc::clone(&self.unpersisted);
        let partition = self.id;
        command.add_post_checkpoint_action(Box::new(move || {
            let mut rows = unpersisted.lock();
            rows.retain(|_, collected_by| *collected_by > checkpoint_id);
            trace!(
                partition = %partition,
                checkpoint_id = %checkpoint_id,
                unpersisted = rows.len(),
                "checkpoint rows released"
            );
        }));
    }

    pub(crate) fn mark_dirty(&self, row: Arc<dyn TrackedRow<C>>) {
        self.state.lock().writebacks.insert(row.row_id(), row);
    }

    pub(crate) fn mark_clean(&self, row: RowId) {
        self.state.lock().writebacks.remove(&row);
    }

    pub(crate) fn log_rollback(&self, row: Arc<dyn TrackedRow<C>>) {
        self.state.lock().rollback_log.push(row);
    }

    pub(crate) fn enqueue_post_checkpoint(&self, actions: Vec<PostCheckpointAction>) {
        self.state.lock().post_checkpoint.extend(actions);
    }

    /// Undoes the edits of the current lock holder. Returns the number of rows restored.
    pub(crate) fn rollback_transaction(&self) -> usize {
        let touched = std::mem::take(&mut self.state.lock().rollback_log);
        let restored = touched.len();
        for row in &touched {
            row.rollback();
        }
        let mut state = self.state.lock();
        for row in touched {
            if row.writeback().is_dirty() {
                state.writebacks.insert(row.row_id(), row);
            } else {
                state.writebacks.remove(&row.row_id());
            }
        }
        restored
    }

    pub(crate) fn deduplication_position(&self, source: PartitionId) -> Result<u64> {
        let state = self.state.lock();
        state
            .dedup_vector
            .get(source.index())
            .copied()
            .ok_or_else(|| out_of_range(source, state.dedup_vector.len()))
    }

    /// Advances the entry for `source`. Returns the prior position if it moved.
    pub(crate) fn advance_deduplication(
        &self,
        source: PartitionId,
        position: u64,
    ) -> Result<Option<u64>> {
        let mut state = self.state.lock();
        let len = state.dedup_vector.len();
        let slot = state
            .dedup_vector
            .get_mut(source.index())
            .ok_or_else(|| out_of_range(source, len))?;
        if position <= *slot {
            return Ok(None);
        }
        let prior = *slot;
        *slot = position;
        Ok(Some(prior))
    }

    pub(crate) fn restore_deduplication(&self, undo: Vec<(PartitionId, u64)>) {
        let mut state = self.state.lock();
        for (source, prior) in undo.into_iter().rev() {
            if let Some(slot) = state.dedup_vector.get_mut(source.index()) {
                *slot = prior;
            }
        }
    }
}

impl<C> fmt::Debug for Partition<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let lock = self.lock.snapshot();
        let state = self.state.lock();
        f.debug_struct("Partition")
            .field("id", &self.id)
            .field("last_sequence_number", &state.last_sequence_number)
            .field("last_checkpoint_id", &state.last_checkpoint_id)
            .field("dirty_rows", &state.writebacks.len())
            .field("pending_actions", &state.post_checkpoint.len())
            .field("lock", &lock)
            .finish()
    }
}

fn out_of_range(source: PartitionId, len: usize) -> CacheError {
    CacheError::Invalid(format!(
        "source partition {source} outside deduplication vector of length {len}"
    ))
}
