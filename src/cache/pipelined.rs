use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tracing::{debug, info};

use crate::cache::meta::PartitionMetaData;
use crate::cache::metrics::{default_metrics, CacheMetrics};
use crate::cache::options::CacheOptions;
use crate::cache::partition::{CheckpointSummary, Partition};
use crate::cache::table::{Table, TableRecovery, TableStorage};
use crate::cache::tracked::{CheckpointCommand, TransactionListener};
use crate::cache::transaction::TxContext;
use crate::error::{CacheError, Result};
use crate::types::PartitionId;

/// Entry point of the cache: owns the partitions and the registered tables.
///
/// Partitions are recovered from durable metadata before use. Every table
/// created through the cache is recovered alongside each partition.
pub struct PipelinedCache<C> {
    options: CacheOptions,
    partitions: RwLock<FxHashMap<PartitionId, Arc<Partition<C>>>>,
    tables: RwLock<Vec<Arc<dyn TableRecovery>>>,
    metrics: Arc<dyn CacheMetrics>,
    listener: Option<Arc<dyn TransactionListener>>,
}

impl<C: CheckpointCommand> PipelinedCache<C> {
    /// Creates an empty cache after validating `options`.
    pub fn new(options: CacheOptions) -> Result<Self> {
        options.validate()?;
        Ok(Self {
            options,
            partitions: RwLock::new(FxHashMap::default()),
            tables: RwLock::new(Vec::new()),
            metrics: default_metrics(),
            listener: None,
        })
    }

    /// Sets the metrics sink shared by partitions and tables created afterwards.
    pub fn with_metrics(mut self, metrics: Arc<dyn CacheMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Sets the observer notified when transactions commit.
    pub fn with_listener(mut self, listener: Arc<dyn TransactionListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Options the cache was created with.
    pub fn options(&self) -> &CacheOptions {
        &self.options
    }

    /// Metrics sink.
    pub fn metrics(&self) -> &Arc<dyn CacheMetrics> {
        &self.metrics
    }

    /// Creates a table backed by `storage` and registers it for recovery.
    pub fn create_table<K, V, S>(
        &self,
        name: impl Into<String>,
        storage: Arc<S>,
    ) -> Result<Arc<Table<K, V, C, S>>>
    where
        K: Clone + Eq + Hash + Debug + Send + Sync + 'static,
        V: Clone + Send + Sync + 'static,
        S: TableStorage<K, V, C>,
    {
        let table =
            Arc::new(Table::new(name, storage).with_metrics(Arc::clone(&self.metrics)));
        self.register_table(table.clone())?;
        Ok(table)
    }

    /// Registers a table and recovers it for every partition already present.
    ///
    /// Table names are unique; registering a name twice is rejected before
    /// any cached rows are touched.
    pub fn register_table(&self, table: Arc<dyn TableRecovery>) -> Result<()> {
        if self.has_table(table.name()) {
            return Err(CacheError::DuplicateTable(table.name().to_string()));
        }
        let partitions: Vec<Arc<Partition<C>>> =
            self.partitions.read().values().cloned().collect();
        for partition in partitions {
            table.recover(&partition.metadata())?;
        }
        {
            let mut tables = self.tables.write();
            if tables.iter().any(|t| t.name() == table.name()) {
                return Err(CacheError::DuplicateTable(table.name().to_string()));
            }
            tables.push(Arc::clone(&table));
        }
        debug!(table = table.name(), "table registered");
        Ok(())
    }

    fn has_table(&self, name: &str) -> bool {
        self.tables.read().iter().any(|t| t.name() == name)
    }

    /// Brings a partition online from its durable snapshot.
    ///
    /// Runs every registered table's recovery hook before the partition
    /// accepts transactions. A partition may only be recovered once.
    pub fn recover_partition(&self, metadata: PartitionMetaData) -> Result<Arc<Partition<C>>> {
        if metadata.dedup_vector.len() != self.options.dedup_vector_len {
            return Err(CacheError::Invalid(format!(
                "partition {} has deduplication vector of length {}, expected {}",
                metadata.partition_id,
                metadata.dedup_vector.len(),
                self.options.dedup_vector_len
            )));
        }
        let id = metadata.partition_id;
        if self.partitions.read().contains_key(&id) {
            return Err(CacheError::DuplicatePartition(id));
        }

        let tables: Vec<Arc<dyn TableRecovery>> = self.tables.read().clone();
        for table in &tables {
            table.recover(&metadata)?;
        }

        let last_checkpoint_id = metadata.last_checkpoint_id;
        let partition = Arc::new(Partition::recover(
            metadata,
            &self.options,
            Arc::clone(&self.metrics),
            self.listener.clone(),
        ));
        {
            let mut partitions = self.partitions.write();
            if partitions.contains_key(&id) {
                return Err(CacheError::DuplicatePartition(id));
            }
            partitions.insert(id, Arc::clone(&partition));
        }
        info!(
            partition = %id,
            last_checkpoint_id = %last_checkpoint_id,
            tables = tables.len(),
            "partition recovered"
        );
        Ok(partition)
    }

    /// Recovers a partition that has never been checkpointed.
    pub fn recover_new_partition(&self, id: PartitionId) -> Result<Arc<Partition<C>>> {
        self.recover_partition(PartitionMetaData::initial(id, self.options.dedup_vector_len))
    }

    /// Looks up a recovered partition.
    pub fn partition(&self, id: PartitionId) -> Result<Arc<Partition<C>>> {
        self.partitions
            .read()
            .get(&id)
            .cloned()
            .ok_or(CacheError::UnknownPartition(id))
    }

    /// Ids of all recovered partitions, ascending.
    pub fn partition_ids(&self) -> Vec<PartitionId> {
        let mut ids: Vec<PartitionId> = self.partitions.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Starts a transaction on `id`, waiting behind earlier lock holders.
    pub async fn start_transaction(&self, id: PartitionId) -> Result<TxContext<C>> {
        let partition = self.partition(id)?;
        partition.start_transaction().await
    }

    /// Drains partition `id`'s dirty rows and queued actions into `command`.
    pub async fn collect_next_checkpoint(
        &self,
        id: PartitionId,
        command: &mut C,
    ) -> Result<CheckpointSummary> {
        let partition = self.partition(id)?;
        partition.collect_next_checkpoint(command).await
    }

    /// Partitions whose accumulated work exceeds the configured policy, ascending.
    pub fn partitions_due_for_checkpoint(&self) -> Vec<PartitionId> {
        let mut due: Vec<PartitionId> = self
            .partitions
            .read()
            .values()
            .filter(|partition| partition.checkpoint_due(&self.options.checkpoint))
            .map(|partition| partition.id())
            .collect();
        due.sort_unstable();
        due
    }
}
