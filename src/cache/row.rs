use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use parking_lot::Mutex;

use crate::cache::table::TableStorage;
use crate::cache::tracked::{CheckpointCommand, TrackedRow};
use crate::cache::writeback::{DirtyChange, Writeback};
use crate::error::{CacheError, Result};
use crate::types::{PartitionId, RowId, SequenceNumber};

static NEXT_ROW_ID: AtomicU64 = AtomicU64::new(1);

/// Outstanding storage load, shared by every transaction that prefetched the row.
pub(crate) type PendingLoad = Shared<BoxFuture<'static, Result<()>>>;

/// In-memory slot for one key of one table.
pub(crate) struct RowEntry<K, V, S> {
    id: RowId,
    key: K,
    storage: Arc<S>,
    state: Mutex<RowState<V>>,
}

struct RowState<V> {
    current: Option<V>,
    last_use: SequenceNumber,
    ref_count: u32,
    loaded: bool,
    pending: Option<PendingLoad>,
    writeback: Writeback,
    rollback: Option<RollbackImage<V>>,
}

struct RollbackImage<V> {
    current: Option<V>,
    loaded: bool,
    writeback: Writeback,
}

/// How a prefetch was satisfied.
pub(crate) enum PrefetchOutcome {
    /// Row already loaded.
    Hit,
    /// Another transaction's load is in flight.
    Joined(PendingLoad),
    /// A new load was started.
    Started(PendingLoad),
}

/// Point-in-time view of a cached row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowStats {
    /// Row currently exists.
    pub exists: bool,
    /// Row's durable state has been loaded (or asserted absent by a create).
    pub loaded: bool,
    /// A load is in flight.
    pub pending: bool,
    /// Transactions that prefetched the row and have not completed.
    pub ref_count: u32,
    /// Last transaction that touched the row.
    pub last_use: SequenceNumber,
    /// Write-back status.
    pub writeback: Writeback,
}

impl<K, V, S> RowEntry<K, V, S>
where
    K: Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    S: Send + Sync + 'static,
{
    pub(crate) fn new(key: K, storage: Arc<S>, tx: SequenceNumber, loaded: bool) -> Self {
        Self {
            id: RowId(NEXT_ROW_ID.fetch_add(1, Ordering::Relaxed)),
            key,
            storage,
            state: Mutex::new(RowState {
                current: None,
                last_use: tx,
                ref_count: 0,
                loaded,
                pending: None,
                writeback: Writeback::None,
                rollback: None,
            }),
        }
    }

    pub(crate) fn id(&self) -> RowId {
        self.id
    }

    pub(crate) fn key(&self) -> &K {
        &self.key
    }

    /// Takes a reference for `tx` and starts a load if the row has none.
    pub(crate) fn begin_prefetch<F>(self: &Arc<Self>, tx: SequenceNumber, load: F) -> PrefetchOutcome
    where
        F: FnOnce() -> BoxFuture<'static, Result<Option<V>>>,
    {
        let mut state = self.state.lock();
        state.ref_count += 1;
        state.last_use = state.last_use.max(tx);
        if let Some(pending) = state.pending.as_ref() {
            return PrefetchOutcome::Joined(pending.clone());
        }
        if state.loaded {
            return PrefetchOutcome::Hit;
        }
        let row = Arc::clone(self);
        let fetch = load();
        let pending = async move {
            match fetch.await {
                Ok(value) => {
                    row.finish_load(value);
                    Ok(())
                }
                Err(err) => {
                    row.fail_load();
                    Err(err)
                }
            }
        }
        .boxed()
        .shared();
        state.pending = Some(pending.clone());
        PrefetchOutcome::Started(pending)
    }

    fn finish_load(&self, value: Option<V>) {
        let mut state = self.state.lock();
        debug_assert!(!state.writeback.is_dirty());
        state.current = value;
        state.loaded = true;
        state.pending = None;
        state.writeback = Writeback::None;
    }

    fn fail_load(&self) {
        let mut state = self.state.lock();
        state.pending = None;
    }

    pub(crate) fn release_ref(&self) {
        let mut state = self.state.lock();
        state.ref_count = state.ref_count.saturating_sub(1);
    }

    pub(crate) fn read(&self, tx: SequenceNumber) -> Result<Option<V>> {
        let mut state = self.state.lock();
        ensure_loaded(&state)?;
        state.last_use = state.last_use.max(tx);
        Ok(state.current.clone())
    }

    /// Fails unless a create may proceed.
    pub(crate) fn check_absent(&self) -> Result<()> {
        ensure_absent(&self.state.lock())
    }

    /// Fails unless an update or delete may proceed.
    pub(crate) fn check_existing(&self) -> Result<()> {
        ensure_existing(&self.state.lock())
    }

    pub(crate) fn create(&self, tx: SequenceNumber, value: V) -> Result<DirtyChange> {
        let mut state = self.state.lock();
        ensure_absent(&state)?;
        let (writeback, change) = state.writeback.after_create();
        state.current = Some(value);
        state.loaded = true;
        state.last_use = state.last_use.max(tx);
        state.writeback = writeback;
        Ok(change)
    }

    pub(crate) fn update(&self, tx: SequenceNumber, value: V) -> Result<DirtyChange> {
        let mut state = self.state.lock();
        ensure_existing(&state)?;
        let (writeback, change) = state.writeback.after_update();
        state.current = Some(value);
        state.last_use = state.last_use.max(tx);
        state.writeback = writeback;
        Ok(change)
    }

    pub(crate) fn delete(&self, tx: SequenceNumber) -> Result<DirtyChange> {
        let mut state = self.state.lock();
        ensure_existing(&state)?;
        let (writeback, change) = state.writeback.after_delete();
        state.current = None;
        state.last_use = state.last_use.max(tx);
        state.writeback = writeback;
        Ok(change)
    }

    pub(crate) fn stats(&self) -> RowStats {
        let state = self.state.lock();
        RowStats {
            exists: state.current.is_some(),
            loaded: state.loaded,
            pending: state.pending.is_some(),
            ref_count: state.ref_count,
            last_use: state.last_use,
            writeback: state.writeback,
        }
    }

    /// True if nothing references the row and dropping it loses no state.
    pub(crate) fn is_idle(&self, last_use_before: SequenceNumber) -> bool {
        let state = self.state.lock();
        state.ref_count == 0
            && state.pending.is_none()
            && !state.writeback.is_dirty()
            && state.rollback.is_none()
            && state.last_use < last_use_before
    }
}

fn ensure_loaded<V>(state: &RowState<V>) -> Result<()> {
    if state.pending.is_some() {
        return Err(CacheError::LoadPending);
    }
    if !state.loaded {
        return Err(CacheError::RowNotCached);
    }
    Ok(())
}

fn ensure_absent<V>(state: &RowState<V>) -> Result<()> {
    if state.pending.is_some() {
        return Err(CacheError::LoadPending);
    }
    if state.current.is_some() {
        return Err(CacheError::RowExists);
    }
    Ok(())
}

fn ensure_existing<V>(state: &RowState<V>) -> Result<()> {
    ensure_loaded(state)?;
    if state.current.is_none() {
        return Err(CacheError::RowMissing);
    }
    Ok(())
}

impl<K, V, C, S> TrackedRow<C> for RowEntry<K, V, S>
where
    K: Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    C: CheckpointCommand,
    S: TableStorage<K, V, C>,
{
    fn row_id(&self) -> RowId {
        self.id
    }

    fn writeback(&self) -> Writeback {
        self.state.lock().writeback
    }

    fn add_delta_to_checkpoint(&self, partition: PartitionId, command: &mut C) -> Result<()> {
        let mut state = self.state.lock();
        self.storage.append_row_delta(
            command,
            state.writeback,
            partition,
            &self.key,
            state.current.as_ref(),
        )?;
        state.writeback = Writeback::None;
        Ok(())
    }

    fn add_rollback(&self) -> bool {
        let mut state = self.state.lock();
        if state.rollback.is_some() {
            return false;
        }
        state.rollback = Some(RollbackImage {
            current: state.current.clone(),
            loaded: state.loaded,
            writeback: state.writeback,
        });
        true
    }

    fn discard_rollback(&self) {
        self.state.lock().rollback = None;
    }

    fn rollback(&self) {
        let mut state = self.state.lock();
        if let Some(image) = state.rollback.take() {
            state.current = image.current;
            state.loaded = image.loaded;
            state.writeback = image.writeback;
        }
    }
}
