use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use futures::future::join_all;
use tracing::{debug, warn};

use crate::cache::partition::{Partition, Release};
use crate::cache::row::PendingLoad;
use crate::cache::tracked::{CheckpointCommand, CompletionAction, PostCheckpointAction};
use crate::error::{CacheError, Result};
use crate::types::{PartitionId, SequenceNumber};

/// The phase of a transaction.
///
/// Transactions move `Prefetch -> (WaitingForPrefetch) -> Execution -> Completed`.
/// `WaitingForPrefetch` is entered only when at least one load was registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxPhase {
    /// Only prefetch registrations are legal.
    Prefetch,
    /// The partition lock is released while registered loads land.
    WaitingForPrefetch,
    /// Reads, writes and callback registration are legal.
    Execution,
    /// Committed or aborted.
    Completed,
}

impl TxPhase {
    /// Lowercase phase name.
    pub fn as_str(self) -> &'static str {
        match self {
            TxPhase::Prefetch => "prefetch",
            TxPhase::WaitingForPrefetch => "waiting-for-prefetch",
            TxPhase::Execution => "execution",
            TxPhase::Completed => "completed",
        }
    }
}

impl fmt::Display for TxPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unit of work against one partition.
///
/// # Lifecycle
///
/// 1. Obtain a context with [`Partition::start_transaction`]; it holds the partition lock.
/// 2. Register prefetches, then call [`TxContext::complete_prefetches`].
/// 3. Read and write through the tables.
/// 4. [`TxContext::commit`], or [`TxContext::abort`] to roll back.
///
/// # Important
///
/// A context dropped without commit or abort rolls back its edits, releases
/// the lock and then panics (unless the thread is already panicking).
pub struct TxContext<C: CheckpointCommand> {
    partition: Arc<Partition<C>>,
    id: SequenceNumber,
    phase: TxPhase,
    holds_lock: bool,
    prefetches: Vec<PendingLoad>,
    row_releases: Vec<CompletionAction>,
    on_completed: Vec<CompletionAction>,
    on_persisted: Vec<PostCheckpointAction>,
    dedup_undo: Vec<(PartitionId, u64)>,
    started: Instant,
}

impl<C: CheckpointCommand> TxContext<C> {
    pub(crate) fn new(partition: Arc<Partition<C>>, id: SequenceNumber) -> Self {
        Self {
            partition,
            id,
            phase: TxPhase::Prefetch,
            holds_lock: true,
            prefetches: Vec::new(),
            row_releases: Vec::new(),
            on_completed: Vec::new(),
            on_persisted: Vec::new(),
            dedup_undo: Vec::new(),
            started: Instant::now(),
        }
    }

    /// Transaction id; also its position in the partition's lock order.
    pub fn id(&self) -> SequenceNumber {
        self.id
    }

    /// Partition the transaction runs against.
    pub fn partition_id(&self) -> PartitionId {
        self.partition.id()
    }

    /// Current phase.
    pub fn phase(&self) -> TxPhase {
        self.phase
    }

    /// Number of registered loads not yet awaited.
    pub fn outstanding_prefetches(&self) -> usize {
        self.prefetches.len()
    }

    pub(crate) fn partition(&self) -> &Arc<Partition<C>> {
        &self.partition
    }

    pub(crate) fn ensure_prefetch(&self, op: &'static str) -> Result<()> {
        match self.phase {
            TxPhase::Prefetch => Ok(()),
            TxPhase::Completed => Err(CacheError::AlreadyCompleted(self.id)),
            actual => Err(CacheError::Phase {
                op,
                expected: TxPhase::Prefetch.as_str(),
                actual,
                tx: self.id,
            }),
        }
    }

    /// Moves to execution if no prefetch was registered; fails otherwise.
    pub(crate) fn ensure_execution(&mut self, op: &'static str) -> Result<()> {
        match self.phase {
            TxPhase::Execution => Ok(()),
            TxPhase::Prefetch if self.prefetches.is_empty() => {
                self.phase = TxPhase::Execution;
                Ok(())
            }
            TxPhase::Prefetch => Err(CacheError::PrefetchOutstanding(self.id)),
            TxPhase::Completed => Err(CacheError::AlreadyCompleted(self.id)),
            actual => Err(CacheError::Phase {
                op,
                expected: TxPhase::Execution.as_str(),
                actual,
                tx: self.id,
            }),
        }
    }

    pub(crate) fn register_prefetch(&mut self, load: PendingLoad) {
        self.prefetches.push(load);
    }

    pub(crate) fn defer_release(&mut self, release: CompletionAction) {
        self.row_releases.push(release);
    }

    /// Waits for every registered load with the partition lock released, then
    /// reacquires the lock under the same transaction id.
    ///
    /// Other transactions and checkpoints on the partition may run while the
    /// loads are outstanding. On a load failure the transaction stays in
    /// `WaitingForPrefetch` without the lock; the caller should abort it.
    pub async fn complete_prefetches(&mut self) -> Result<()> {
        match self.phase {
            TxPhase::Prefetch => {}
            TxPhase::Completed => return Err(CacheError::AlreadyCompleted(self.id)),
            actual => {
                return Err(CacheError::Phase {
                    op: "complete_prefetches",
                    expected: TxPhase::Prefetch.as_str(),
                    actual,
                    tx: self.id,
                })
            }
        }
        if self.prefetches.is_empty() {
            self.phase = TxPhase::Execution;
            return Ok(());
        }

        let loads = std::mem::take(&mut self.prefetches);
        self.phase = TxPhase::WaitingForPrefetch;
        self.partition.release(self.id, Release::Handoff)?;
        self.holds_lock = false;
        debug!(
            partition = %self.partition.id(),
            tx_id = %self.id,
            loads = loads.len(),
            "waiting for prefetches"
        );

        let outcomes = join_all(loads).await;
        if let Some(err) = outcomes.into_iter().find_map(|outcome| outcome.err()) {
            warn!(
                partition = %self.partition.id(),
                tx_id = %self.id,
                error = %err,
                "prefetch failed"
            );
            return Err(err);
        }

        self.partition.acquire(self.id).await?;
        self.holds_lock = true;
        self.phase = TxPhase::Execution;
        debug!(partition = %self.partition.id(), tx_id = %self.id, "prefetches complete");
        Ok(())
    }

    /// Registers a callback to run right after commit, outside the partition lock.
    pub fn when_completed<F>(&mut self, action: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.ensure_execution("when_completed")?;
        self.on_completed.push(Box::new(action));
        Ok(())
    }

    /// Registers a callback to run once the checkpoint containing this
    /// transaction's effects is durable.
    pub fn when_persisted<F>(&mut self, action: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.ensure_execution("when_persisted")?;
        self.on_persisted.push(Box::new(action));
        Ok(())
    }

    /// Allocates a durable, strictly increasing id from the partition counter.
    pub fn next_sequence_number(&mut self) -> Result<SequenceNumber> {
        self.ensure_execution("next_sequence_number")?;
        Ok(self.partition.next_sequence_number())
    }

    /// Returns the deduplication position recorded for `source`.
    pub fn deduplication_position(&mut self, source: PartitionId) -> Result<u64> {
        self.ensure_execution("deduplication_position")?;
        self.partition.deduplication_position(source)
    }

    /// Advances the deduplication position for `source`.
    ///
    /// Returns `false` if `position` was already applied. The change is
    /// undone if the transaction aborts.
    pub fn advance_deduplication(&mut self, source: PartitionId, position: u64) -> Result<bool> {
        self.ensure_execution("advance_deduplication")?;
        match self.partition.advance_deduplication(source, position)? {
            Some(prior) => {
                self.dedup_undo.push((source, prior));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Commits the transaction and releases the partition lock.
    ///
    /// Persisted callbacks move to the partition's post-checkpoint queue;
    /// completed callbacks run synchronously after the lock is released.
    pub fn commit(&mut self) -> Result<()> {
        self.ensure_execution("commit")?;
        let persisted = std::mem::take(&mut self.on_persisted);
        if !persisted.is_empty() {
            self.partition.enqueue_post_checkpoint(persisted);
        }
        self.partition.release(self.id, Release::Completed)?;
        self.holds_lock = false;
        self.phase = TxPhase::Completed;
        self.dedup_undo.clear();
        self.partition.metrics().transaction_committed();

        for release in std::mem::take(&mut self.row_releases) {
            release();
        }
        for action in std::mem::take(&mut self.on_completed) {
            action();
        }
        debug!(
            partition = %self.partition.id(),
            tx_id = %self.id,
            duration_us = self.started.elapsed().as_micros() as u64,
            "transaction committed"
        );
        Ok(())
    }

    /// Rolls back the transaction's edits and releases the partition lock.
    ///
    /// No completion notification fires and no callbacks run.
    pub fn abort(&mut self) -> Result<()> {
        if self.phase == TxPhase::Completed {
            return Err(CacheError::AlreadyCompleted(self.id));
        }
        self.finish_aborted()
    }

    fn finish_aborted(&mut self) -> Result<()> {
        let mut released = Ok(());
        let mut restored = 0;
        if self.holds_lock {
            restored = self.partition.rollback_transaction();
            self.partition
                .restore_deduplication(std::mem::take(&mut self.dedup_undo));
            released = self.partition.release(self.id, Release::Handoff);
            self.holds_lock = false;
        }
        self.phase = TxPhase::Completed;
        self.prefetches.clear();
        self.on_completed.clear();
        self.on_persisted.clear();
        for release in std::mem::take(&mut self.row_releases) {
            release();
        }
        self.partition.metrics().transaction_aborted();
        warn!(
            partition = %self.partition.id(),
            tx_id = %self.id,
            rows_restored = restored,
            "transaction aborted"
        );
        released
    }
}

impl<C: CheckpointCommand> Drop for TxContext<C> {
    fn drop(&mut self) {
        if self.phase == TxPhase::Completed {
            return;
        }
        let _ = self.finish_aborted();
        if !std::thread::panicking() {
            panic!(
                "transaction {} on partition {} dropped without commit or abort",
                self.id,
                self.partition.id()
            );
        }
    }
}

impl<C: CheckpointCommand> fmt::Debug for TxContext<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TxContext")
            .field("partition", &self.partition.id())
            .field("id", &self.id)
            .field("phase", &self.phase)
            .field("holds_lock", &self.holds_lock)
            .field("prefetches", &self.prefetches.len())
            .finish()
    }
}
