//! Counters for cache activity.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Trait for tracking cache operations.
///
/// Implementations collect statistics about prefetch hit rates, lock
/// contention, transaction outcomes and checkpoint volume.
pub trait CacheMetrics: Send + Sync {
    /// A prefetch found the row already loaded or loading.
    fn prefetch_hit(&self);

    /// A prefetch had to start a storage load.
    fn prefetch_miss(&self);

    /// A storage load failed.
    fn load_failed(&self);

    /// A lock acquisition had to queue behind another holder.
    fn lock_contended(&self);

    /// A transaction committed.
    fn transaction_committed(&self);

    /// A transaction was rolled back.
    fn transaction_aborted(&self);

    /// A checkpoint was collected.
    ///
    /// # Parameters
    /// * `deltas` - Number of row deltas appended to the command.
    /// * `actions` - Number of post-checkpoint actions handed over.
    fn checkpoint_collected(&self, deltas: usize, actions: usize);

    /// Idle rows were dropped from a table.
    fn rows_evicted(&self, count: usize);
}

/// A no-op implementation of [`CacheMetrics`].
#[derive(Default)]
pub struct NoopMetrics;

impl CacheMetrics for NoopMetrics {
    fn prefetch_hit(&self) {}
    fn prefetch_miss(&self) {}
    fn load_failed(&self) {}
    fn lock_contended(&self) {}
    fn transaction_committed(&self) {}
    fn transaction_aborted(&self) {}
    fn checkpoint_collected(&self, _deltas: usize, _actions: usize) {}
    fn rows_evicted(&self, _count: usize) {}
}

/// A thread-safe counter-based implementation of [`CacheMetrics`].
#[derive(Default)]
pub struct CounterMetrics {
    /// Prefetches served from the cache.
    pub prefetch_hits: AtomicU64,

    /// Prefetches that started a load.
    pub prefetch_misses: AtomicU64,

    /// Failed storage loads.
    pub load_failures: AtomicU64,

    /// Lock acquisitions that queued.
    pub lock_contentions: AtomicU64,

    /// Committed transactions.
    pub commits: AtomicU64,

    /// Aborted transactions.
    pub aborts: AtomicU64,

    /// Collected checkpoints.
    pub checkpoints: AtomicU64,

    /// Row deltas handed to checkpoint commands.
    pub checkpoint_deltas: AtomicU64,

    /// Post-checkpoint actions handed to checkpoint commands.
    pub checkpoint_actions: AtomicU64,

    /// Rows evicted from tables.
    pub evictions: AtomicU64,
}

impl CounterMetrics {
    /// Creates a shared counter set.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fraction of prefetches served without a load.
    pub fn prefetch_hit_rate(&self) -> f64 {
        let hits = self.prefetch_hits.load(Ordering::Relaxed);
        let total = hits + self.prefetch_misses.load(Ordering::Relaxed);
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}

impl CacheMetrics for CounterMetrics {
    fn prefetch_hit(&self) {
        self.prefetch_hits.fetch_add(1, Ordering::Relaxed);
    }

    fn prefetch_miss(&self) {
        self.prefetch_misses.fetch_add(1, Ordering::Relaxed);
    }

    fn load_failed(&self) {
        self.load_failures.fetch_add(1, Ordering::Relaxed);
    }

    fn lock_contended(&self) {
        self.lock_contentions.fetch_add(1, Ordering::Relaxed);
    }

    fn transaction_committed(&self) {
        self.commits.fetch_add(1, Ordering::Relaxed);
    }

    fn transaction_aborted(&self) {
        self.aborts.fetch_add(1, Ordering::Relaxed);
    }

    fn checkpoint_collected(&self, deltas: usize, actions: usize) {
        self.checkpoints.fetch_add(1, Ordering::Relaxed);
        self.checkpoint_deltas
            .fetch_add(deltas as u64, Ordering::Relaxed);
        self.checkpoint_actions
            .fetch_add(actions as u64, Ordering::Relaxed);
    }

    fn rows_evicted(&self, count: usize) {
        self.evictions.fetch_add(count as u64, Ordering::Relaxed);
    }
}

/// Returns the default no-op metrics sink.
pub fn default_metrics() -> Arc<dyn CacheMetrics> {
    Arc::new(NoopMetrics)
}
