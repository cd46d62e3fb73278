use std::fmt::Debug;
use std::hash::Hash;
use std::marker::PhantomData;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::{debug, trace};

use crate::cache::meta::PartitionMetaData;
use crate::cache::metrics::{default_metrics, CacheMetrics};
use crate::cache::row::{PrefetchOutcome, RowEntry, RowStats};
use crate::cache::tracked::{CheckpointCommand, TrackedRow};
use crate::cache::transaction::TxContext;
use crate::cache::writeback::{DirtyChange, Writeback};
use crate::error::{CacheError, Result};
use crate::types::{PartitionId, SequenceNumber};

/// Storage hooks a concrete table supplies.
///
/// `load_row` may run concurrently for different keys and is awaited with the
/// partition lock released. `append_row_delta` runs while the collecting
/// partition's lock is held and must not call back into the partition.
pub trait TableStorage<K, V, C>: Send + Sync + 'static {
    /// Rehydrates table state for a partition from its durable snapshot.
    fn recover(&self, metadata: &PartitionMetaData) -> Result<()> {
        let _ = metadata;
        Ok(())
    }

    /// Fetches the durable value of `key`, or `None` if the row does not exist.
    fn load_row(&self, partition: PartitionId, key: &K) -> BoxFuture<'static, Result<Option<V>>>;

    /// Serializes one dirty row into `command`.
    ///
    /// `value` is `None` exactly when `writeback` is [`Writeback::Deleted`].
    fn append_row_delta(
        &self,
        command: &mut C,
        writeback: Writeback,
        partition: PartitionId,
        key: &K,
        value: Option<&V>,
    ) -> Result<()>;
}

/// Object-safe view of a table used at partition recovery.
pub trait TableRecovery: Send + Sync {
    /// Table name for logs.
    fn name(&self) -> &str;

    /// Drops cached rows of the partition and runs the storage recover hook.
    fn recover(&self, metadata: &PartitionMetaData) -> Result<()>;
}

type RowMap<K, V, S> = FxHashMap<K, Arc<RowEntry<K, V, S>>>;

/// Keyed collection of cached rows, partitioned by [`PartitionId`].
///
/// All operations take the transaction context and enforce its phase:
/// `prefetch` only in the prefetch phase, everything else in execution.
pub struct Table<K, V, C, S> {
    name: String,
    storage: Arc<S>,
    partitions: Mutex<FxHashMap<PartitionId, RowMap<K, V, S>>>,
    metrics: Arc<dyn CacheMetrics>,
    _command: PhantomData<fn(&mut C)>,
}

impl<K, V, C, S> Table<K, V, C, S>
where
    K: Clone + Eq + Hash + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    C: CheckpointCommand,
    S: TableStorage<K, V, C>,
{
    /// Creates an empty table backed by `storage`.
    pub fn new(name: impl Into<String>, storage: Arc<S>) -> Self {
        Self {
            name: name.into(),
            storage,
            partitions: Mutex::new(FxHashMap::default()),
            metrics: default_metrics(),
            _command: PhantomData,
        }
    }

    /// Sets the metrics sink.
    pub fn with_metrics(mut self, metrics: Arc<dyn CacheMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Table name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Storage hooks backing this table.
    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }

    /// Registers interest in `key` and starts loading it if it is not cached.
    ///
    /// The load is awaited by [`TxContext::complete_prefetches`].
    pub fn prefetch(&self, tx: &mut TxContext<C>, key: K) -> Result<()> {
        tx.ensure_prefetch("prefetch")?;
        let partition = tx.partition_id();
        let row = self.row_or_insert(partition, key, tx.id(), false);
        let outcome = row.begin_prefetch(tx.id(), || {
            let fetch = self.storage.load_row(partition, row.key());
            let metrics = Arc::clone(&self.metrics);
            async move {
                let loaded = fetch.await;
                if loaded.is_err() {
                    metrics.load_failed();
                }
                loaded
            }
            .boxed()
        });
        match outcome {
            PrefetchOutcome::Hit => self.metrics.prefetch_hit(),
            PrefetchOutcome::Joined(pending) => {
                self.metrics.prefetch_hit();
                tx.register_prefetch(pending);
            }
            PrefetchOutcome::Started(pending) => {
                self.metrics.prefetch_miss();
                tx.register_prefetch(pending);
            }
        }
        let releasing = Arc::clone(&row);
        tx.defer_release(Box::new(move || releasing.release_ref()));
        trace!(
            table = %self.name,
            partition = %partition,
            tx_id = %tx.id(),
            key = ?row.key(),
            "prefetch registered"
        );
        Ok(())
    }

    /// Creates a row the caller asserts does not exist.
    ///
    /// The only execution-phase operation that does not need a prior prefetch.
    pub fn create_non_existing(&self, tx: &mut TxContext<C>, key: K, value: V) -> Result<()> {
        tx.ensure_execution("create_non_existing")?;
        let row = self.row_or_insert(tx.partition_id(), key, tx.id(), true);
        row.check_absent()?;
        self.add_rollback(tx, &row);
        let change = row.create(tx.id(), value)?;
        self.track(tx, &row, change);
        Ok(())
    }

    /// Reads a prefetched row. Returns `None` if it does not exist.
    pub fn try_get(&self, tx: &mut TxContext<C>, key: &K) -> Result<Option<V>> {
        tx.ensure_execution("try_get")?;
        let row = self.cached(tx.partition_id(), key)?;
        row.read(tx.id())
    }

    /// Replaces the value of an existing prefetched row.
    pub fn update(&self, tx: &mut TxContext<C>, key: &K, value: V) -> Result<()> {
        tx.ensure_execution("update")?;
        let row = self.cached(tx.partition_id(), key)?;
        row.check_existing()?;
        self.add_rollback(tx, &row);
        let change = row.update(tx.id(), value)?;
        self.track(tx, &row, change);
        Ok(())
    }

    /// Deletes an existing prefetched row.
    pub fn delete(&self, tx: &mut TxContext<C>, key: &K) -> Result<()> {
        tx.ensure_execution("delete")?;
        let row = self.cached(tx.partition_id(), key)?;
        row.check_existing()?;
        self.add_rollback(tx, &row);
        let change = row.delete(tx.id())?;
        self.track(tx, &row, change);
        Ok(())
    }

    /// Drops idle rows of the transaction's partition last used before `last_use_before`.
    ///
    /// Rows that are referenced, loading, dirty, carry rollback state, or
    /// were collected into a checkpoint that is not yet durable stay.
    pub fn evict_idle(
        &self,
        tx: &mut TxContext<C>,
        last_use_before: SequenceNumber,
    ) -> Result<usize> {
        tx.ensure_execution("evict_idle")?;
        let partition = tx.partition_id();
        let owner = Arc::clone(tx.partition());
        let evicted = {
            let mut partitions = self.partitions.lock();
            let Some(rows) = partitions.get_mut(&partition) else {
                return Ok(0);
            };
            let before = rows.len();
            rows.retain(|_, row| {
                !row.is_idle(last_use_before) || owner.is_unpersisted(row.id())
            });
            before - rows.len()
        };
        if evicted > 0 {
            self.metrics.rows_evicted(evicted);
            debug!(
                table = %self.name,
                partition = %partition,
                evicted,
                "evicted idle rows"
            );
        }
        Ok(evicted)
    }

    /// Snapshot of a cached row, if present.
    pub fn row_stats(&self, partition: PartitionId, key: &K) -> Option<RowStats> {
        self.lookup(partition, key).map(|row| row.stats())
    }

    /// Number of rows cached for `partition`.
    pub fn cached_rows(&self, partition: PartitionId) -> usize {
        self.partitions
            .lock()
            .get(&partition)
            .map_or(0, |rows| rows.len())
    }

    fn row_or_insert(
        &self,
        partition: PartitionId,
        key: K,
        tx: SequenceNumber,
        loaded: bool,
    ) -> Arc<RowEntry<K, V, S>> {
        let mut partitions = self.partitions.lock();
        let rows = partitions.entry(partition).or_default();
        if let Some(row) = rows.get(&key) {
            return Arc::clone(row);
        }
        let row = Arc::new(RowEntry::new(
            key.clone(),
            Arc::clone(&self.storage),
            tx,
            loaded,
        ));
        rows.insert(key, Arc::clone(&row));
        row
    }

    fn lookup(&self, partition: PartitionId, key: &K) -> Option<Arc<RowEntry<K, V, S>>> {
        self.partitions
            .lock()
            .get(&partition)
            .and_then(|rows| rows.get(key))
            .cloned()
    }

    fn cached(&self, partition: PartitionId, key: &K) -> Result<Arc<RowEntry<K, V, S>>> {
        self.lookup(partition, key).ok_or(CacheError::RowNotCached)
    }

    /// Logs the row with the transaction the first time it touches it.
    fn add_rollback(&self, tx: &TxContext<C>, row: &Arc<RowEntry<K, V, S>>) {
        let tracked: Arc<dyn TrackedRow<C>> = row.clone();
        if tracked.add_rollback() {
            tx.partition().log_rollback(tracked);
        }
    }

    fn track(&self, tx: &TxContext<C>, row: &Arc<RowEntry<K, V, S>>, change: DirtyChange) {
        let partition = tx.partition();
        match change {
            DirtyChange::Insert => {
                let tracked: Arc<dyn TrackedRow<C>> = row.clone();
                partition.mark_dirty(tracked);
            }
            DirtyChange::Remove => partition.mark_clean(row.id()),
            DirtyChange::Keep => {}
        }
    }
}

impl<K, V, C, S> TableRecovery for Table<K, V, C, S>
where
    K: Clone + Eq + Hash + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    C: CheckpointCommand,
    S: TableStorage<K, V, C>,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn recover(&self, metadata: &PartitionMetaData) -> Result<()> {
        self.partitions.lock().remove(&metadata.partition_id);
        self.storage.recover(metadata)
    }
}
