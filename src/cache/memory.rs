//! In-memory storage hooks and checkpoint command.
//!
//! `MemoryStore` plays the role of the durable backing store for one table and
//! `MemoryCheckpoint` the role of a write-back batch. Deltas staged into a
//! checkpoint only reach the store when [`MemoryCheckpoint::persist`] runs, so
//! tests and the benchmark can observe the cache-to-storage boundary.

use std::fmt::{self, Display};
use std::hash::Hash;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tracing::{debug, trace};

use crate::cache::meta::PartitionMetaData;
use crate::cache::table::TableStorage;
use crate::cache::tracked::{CheckpointCommand, PostCheckpointAction};
use crate::cache::writeback::Writeback;
use crate::error::{CacheError, Result};
use crate::types::PartitionId;

type Rows<K, V> = Arc<RwLock<FxHashMap<(PartitionId, K), V>>>;

/// Durable rows of one table, held in memory.
pub struct MemoryStore<K, V> {
    name: String,
    rows: Rows<K, V>,
    load_latency: Option<Duration>,
    fail_loads: AtomicBool,
    loads: AtomicU64,
    recoveries: AtomicU64,
}

impl<K, V> MemoryStore<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Creates an empty store.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rows: Arc::new(RwLock::new(FxHashMap::default())),
            load_latency: None,
            fail_loads: AtomicBool::new(false),
            loads: AtomicU64::new(0),
            recoveries: AtomicU64::new(0),
        }
    }

    /// Delays every load by `latency`.
    pub fn with_load_latency(mut self, latency: Duration) -> Self {
        self.load_latency = Some(latency);
        self
    }

    /// Table name recorded on every delta.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Writes a durable row directly, bypassing the cache.
    pub fn seed(&self, partition: PartitionId, key: K, value: V) {
        self.rows.write().insert((partition, key), value);
    }

    /// Durable value of `key`.
    pub fn get(&self, partition: PartitionId, key: &K) -> Option<V> {
        self.rows.read().get(&(partition, key.clone())).cloned()
    }

    /// Number of durable rows across all partitions.
    pub fn len(&self) -> usize {
        self.rows.read().len()
    }

    /// Returns true if no durable rows exist.
    pub fn is_empty(&self) -> bool {
        self.rows.read().is_empty()
    }

    /// Number of loads issued so far.
    pub fn loads(&self) -> u64 {
        self.loads.load(Ordering::Relaxed)
    }

    /// Number of recover calls so far.
    pub fn recoveries(&self) -> u64 {
        self.recoveries.load(Ordering::Relaxed)
    }

    /// Makes subsequent loads fail with an I/O error while `fail` is set.
    pub fn fail_loads(&self, fail: bool) {
        self.fail_loads.store(fail, Ordering::Relaxed);
    }
}

impl<K, V> TableStorage<K, V, MemoryCheckpoint> for MemoryStore<K, V>
where
    K: Clone + Eq + Hash + Display + Send + Sync + 'static,
    V: Clone + Display + Send + Sync + 'static,
{
    fn recover(&self, metadata: &PartitionMetaData) -> Result<()> {
        self.recoveries.fetch_add(1, Ordering::Relaxed);
        debug!(
            table = %self.name,
            partition = %metadata.partition_id,
            last_checkpoint_id = %metadata.last_checkpoint_id,
            "memory store recovered"
        );
        Ok(())
    }

    fn load_row(&self, partition: PartitionId, key: &K) -> BoxFuture<'static, Result<Option<V>>> {
        self.loads.fetch_add(1, Ordering::Relaxed);
        let rows = Arc::clone(&self.rows);
        let key = key.clone();
        let latency = self.load_latency;
        let fail = self.fail_loads.load(Ordering::Relaxed);
        async move {
            if let Some(latency) = latency {
                tokio::time::sleep(latency).await;
            }
            if fail {
                return Err(CacheError::from(io::Error::new(
                    io::ErrorKind::Other,
                    format!("injected load failure for {key}"),
                )));
            }
            let value = rows.read().get(&(partition, key)).cloned();
            Ok(value)
        }
        .boxed()
    }

    fn append_row_delta(
        &self,
        command: &mut MemoryCheckpoint,
        writeback: Writeback,
        partition: PartitionId,
        key: &K,
        value: Option<&V>,
    ) -> Result<()> {
        command.record(DeltaRecord {
            table: self.name.clone(),
            partition,
            writeback,
            key: key.to_string(),
            value: value.map(ToString::to_string),
        });

        let rows = Arc::clone(&self.rows);
        let slot = (partition, key.clone());
        match (writeback, value) {
            (Writeback::Deleted, _) => command.stage(move || {
                rows.write().remove(&slot);
            }),
            (Writeback::Created | Writeback::Updated, Some(value)) => {
                let value = value.clone();
                command.stage(move || {
                    rows.write().insert(slot, value);
                })
            }
            (kind, _) => {
                return Err(CacheError::Invalid(format!(
                    "{kind} delta for {key} in table {} has no value",
                    self.name
                )))
            }
        }
        Ok(())
    }
}

impl<K, V> fmt::Debug for MemoryStore<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryStore")
            .field("name", &self.name)
            .field("rows", &self.rows.read().len())
            .field("loads", &self.loads.load(Ordering::Relaxed))
            .finish()
    }
}

/// One row delta captured by a [`MemoryCheckpoint`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeltaRecord {
    /// Table the row belongs to.
    pub table: String,
    /// Partition that collected the row.
    pub partition: PartitionId,
    /// Net write-back status at collection.
    pub writeback: Writeback,
    /// Rendered key.
    pub key: String,
    /// Rendered value; `None` for deletions.
    pub value: Option<String>,
}

/// Write-back batch that applies staged writes to [`MemoryStore`]s on persist.
#[derive(Default)]
pub struct MemoryCheckpoint {
    metadata: Option<PartitionMetaData>,
    deltas: Vec<DeltaRecord>,
    writes: Vec<Box<dyn FnOnce() + Send>>,
    actions: Vec<PostCheckpointAction>,
}

impl MemoryCheckpoint {
    /// Creates an empty command.
    pub fn new() -> Self {
        Self::default()
    }

    /// Metadata handed over by the partition, if any.
    pub fn metadata(&self) -> Option<&PartitionMetaData> {
        self.metadata.as_ref()
    }

    /// Deltas recorded so far, in collection order.
    pub fn deltas(&self) -> &[DeltaRecord] {
        &self.deltas
    }

    /// Number of post-checkpoint actions received.
    pub fn action_count(&self) -> usize {
        self.actions.len()
    }

    /// Records a delta for inspection.
    pub fn record(&mut self, delta: DeltaRecord) {
        self.deltas.push(delta);
    }

    /// Stages a write applied by [`MemoryCheckpoint::persist`].
    pub fn stage<F>(&mut self, write: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.writes.push(Box::new(write));
    }

    /// Applies staged writes, runs post-checkpoint actions and returns the
    /// metadata to recover from.
    pub fn persist(self) -> Result<PartitionMetaData> {
        let metadata = self
            .metadata
            .ok_or_else(|| CacheError::Invalid("checkpoint has no partition metadata".into()))?;
        let writes = self.writes.len();
        for write in self.writes {
            write();
        }
        let actions = self.actions.len();
        for action in self.actions {
            action();
        }
        trace!(
            partition = %metadata.partition_id,
            checkpoint_id = %metadata.last_checkpoint_id,
            writes,
            actions,
            "checkpoint persisted"
        );
        Ok(metadata)
    }
}

impl CheckpointCommand for MemoryCheckpoint {
    fn set_partition_metadata(&mut self, metadata: PartitionMetaData) {
        self.metadata = Some(metadata);
    }

    fn add_post_checkpoint_action(&mut self, action: PostCheckpointAction) {
        self.actions.push(action);
    }
}

impl fmt::Debug for MemoryCheckpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryCheckpoint")
            .field("metadata", &self.metadata)
            .field("deltas", &self.deltas)
            .field("writes", &self.writes.len())
            .field("actions", &self.actions.len())
            .finish()
    }
}
