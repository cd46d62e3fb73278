#![allow(dead_code)]

use std::sync::{Arc, Once};

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing_subscriber::EnvFilter;

use pipelined_cache::cache::memory::{MemoryCheckpoint, MemoryStore};
use pipelined_cache::cache::{
    CacheOptions, CheckpointCommand, PartitionMetaData, PipelinedCache, PostCheckpointAction,
    Table, TableStorage,
};
use pipelined_cache::{CacheError, PartitionId, Result, Writeback};

pub type Store = MemoryStore<String, String>;
pub type Rows = Table<String, String, MemoryCheckpoint, Store>;

pub const P0: PartitionId = PartitionId(0);

pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("pipelined_cache=debug"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .try_init();
    });
}

pub fn key(k: &str) -> String {
    k.to_string()
}

pub fn options() -> CacheOptions {
    CacheOptions::default().dedup_vector_len(4)
}

/// Cache with one `rows` table over a [`MemoryStore`] and partition 0 recovered.
pub fn memory_cache() -> (Arc<PipelinedCache<MemoryCheckpoint>>, Arc<Store>, Arc<Rows>) {
    init_tracing();
    let cache = PipelinedCache::new(options()).expect("create cache");
    let store = Arc::new(MemoryStore::new("rows"));
    let rows: Arc<Rows> = cache
        .create_table("rows", Arc::clone(&store))
        .expect("create table");
    cache.recover_new_partition(P0).expect("recover partition");
    (Arc::new(cache), store, rows)
}

/// Storage whose loads park until the test opens the gate.
pub struct GatedStore {
    inner: Store,
    started: Arc<Notify>,
    gate: Arc<Notify>,
}

impl GatedStore {
    pub fn new() -> Self {
        Self {
            inner: MemoryStore::new("gated"),
            started: Arc::new(Notify::new()),
            gate: Arc::new(Notify::new()),
        }
    }

    pub fn seed(&self, partition: PartitionId, key: String, value: String) {
        self.inner.seed(partition, key, value);
    }

    pub fn loads(&self) -> u64 {
        self.inner.loads()
    }

    /// Resolves once a load has begun waiting at the gate.
    pub async fn load_started(&self) {
        self.started.notified().await;
    }

    /// Lets one parked load proceed.
    pub fn open_one(&self) {
        self.gate.notify_one();
    }
}

impl TableStorage<String, String, MemoryCheckpoint> for GatedStore {
    fn load_row(
        &self,
        partition: PartitionId,
        key: &String,
    ) -> BoxFuture<'static, Result<Option<String>>> {
        let fetch = self.inner.load_row(partition, key);
        let started = Arc::clone(&self.started);
        let gate = Arc::clone(&self.gate);
        async move {
            started.notify_one();
            gate.notified().await;
            fetch.await
        }
        .boxed()
    }

    fn append_row_delta(
        &self,
        command: &mut MemoryCheckpoint,
        writeback: Writeback,
        partition: PartitionId,
        key: &String,
        value: Option<&String>,
    ) -> Result<()> {
        self.inner
            .append_row_delta(command, writeback, partition, key, value)
    }
}

/// Checkpoint command whose storage refuses the `fail_at`-th delta.
#[derive(Default)]
pub struct FlakyCheckpoint {
    pub metadata: Option<PartitionMetaData>,
    pub deltas: Vec<(Writeback, String)>,
    pub actions: Vec<PostCheckpointAction>,
    pub fail_at: Option<usize>,
}

impl FlakyCheckpoint {
    pub fn failing_at(index: usize) -> Self {
        Self {
            fail_at: Some(index),
            ..Self::default()
        }
    }
}

impl CheckpointCommand for FlakyCheckpoint {
    fn set_partition_metadata(&mut self, metadata: PartitionMetaData) {
        self.metadata = Some(metadata);
    }

    fn add_post_checkpoint_action(&mut self, action: PostCheckpointAction) {
        self.actions.push(action);
    }
}

/// Row storage paired with [`FlakyCheckpoint`].
#[derive(Default)]
pub struct FlakyStore {
    pub appended: Mutex<usize>,
}

impl TableStorage<String, String, FlakyCheckpoint> for FlakyStore {
    fn load_row(
        &self,
        _partition: PartitionId,
        _key: &String,
    ) -> BoxFuture<'static, Result<Option<String>>> {
        async { Ok(None) }.boxed()
    }

    fn append_row_delta(
        &self,
        command: &mut FlakyCheckpoint,
        writeback: Writeback,
        _partition: PartitionId,
        key: &String,
        _value: Option<&String>,
    ) -> Result<()> {
        if command.fail_at == Some(command.deltas.len()) {
            return Err(CacheError::Invalid(format!("refusing delta for {key}")));
        }
        command.deltas.push((writeback, key.clone()));
        *self.appended.lock() += 1;
        Ok(())
    }
}
