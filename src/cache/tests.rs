use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::memory::{MemoryCheckpoint, MemoryStore};
use super::row::RowEntry;
use super::*;
use crate::error::CacheError;
use crate::types::{PartitionId, SequenceNumber};

type Store = MemoryStore<String, String>;
type Rows = Table<String, String, MemoryCheckpoint, Store>;

const P0: PartitionId = PartitionId(0);

struct Fixture {
    cache: PipelinedCache<MemoryCheckpoint>,
    store: Arc<Store>,
    rows: Arc<Rows>,
    partition: Arc<Partition<MemoryCheckpoint>>,
}

fn fixture() -> Fixture {
    fixture_with(None)
}

fn fixture_with(listener: Option<Arc<dyn TransactionListener>>) -> Fixture {
    let mut cache = PipelinedCache::new(CacheOptions::default().dedup_vector_len(4))
        .expect("create cache");
    if let Some(listener) = listener {
        cache = cache.with_listener(listener);
    }
    let store = Arc::new(MemoryStore::new("rows"));
    let rows = cache
        .create_table("rows", Arc::clone(&store))
        .expect("create table");
    let partition = cache.recover_new_partition(P0).expect("recover partition");
    Fixture {
        cache,
        store,
        rows,
        partition,
    }
}

fn key(k: &str) -> String {
    k.to_string()
}

#[derive(Default)]
struct RecordingListener {
    completed: Mutex<Vec<(PartitionId, SequenceNumber)>>,
}

impl TransactionListener for RecordingListener {
    fn transaction_completed(&self, partition: PartitionId, tx: SequenceNumber) {
        self.completed.lock().push((partition, tx));
    }
}

#[tokio::test]
async fn execution_call_without_prefetch_advances_phase() {
    let f = fixture();
    let mut tx = f.partition.start_transaction().await.expect("start");
    assert_eq!(tx.phase(), TxPhase::Prefetch);

    f.rows
        .create_non_existing(&mut tx, key("k"), "v".into())
        .expect("create");
    assert_eq!(tx.phase(), TxPhase::Execution);
    tx.commit().expect("commit");
    assert_eq!(tx.phase(), TxPhase::Completed);
}

#[tokio::test]
async fn prefetch_after_execution_is_a_phase_error() {
    let f = fixture();
    let mut tx = f.partition.start_transaction().await.expect("start");
    f.rows
        .create_non_existing(&mut tx, key("k"), "v".into())
        .expect("create");

    let err = f.rows.prefetch(&mut tx, key("other")).unwrap_err();
    assert!(matches!(
        err,
        CacheError::Phase {
            actual: TxPhase::Execution,
            ..
        }
    ));
    assert!(err.is_protocol_violation());
    tx.commit().expect("commit");
}

#[tokio::test]
async fn outstanding_prefetch_blocks_execution() {
    let f = fixture();
    let mut tx = f.partition.start_transaction().await.expect("start");
    f.rows.prefetch(&mut tx, key("k")).expect("prefetch");
    assert_eq!(tx.outstanding_prefetches(), 1);

    let err = tx.commit().unwrap_err();
    assert!(matches!(err, CacheError::PrefetchOutstanding(_)));
    let err = f.rows.try_get(&mut tx, &key("k")).unwrap_err();
    assert!(matches!(err, CacheError::PrefetchOutstanding(_)));
    assert_eq!(tx.phase(), TxPhase::Prefetch);

    tx.complete_prefetches().await.expect("complete prefetches");
    assert_eq!(tx.phase(), TxPhase::Execution);
    assert_eq!(f.rows.try_get(&mut tx, &key("k")).expect("get"), None);
    tx.commit().expect("commit");
}

#[tokio::test]
async fn complete_prefetches_twice_is_a_phase_error() {
    let f = fixture();
    let mut tx = f.partition.start_transaction().await.expect("start");
    tx.complete_prefetches().await.expect("complete prefetches");
    let err = tx.complete_prefetches().await.unwrap_err();
    assert!(matches!(
        err,
        CacheError::Phase {
            expected: "prefetch",
            ..
        }
    ));
    tx.commit().expect("commit");
}

#[tokio::test]
async fn second_commit_fails() {
    let f = fixture();
    let mut tx = f.partition.start_transaction().await.expect("start");
    tx.commit().expect("commit");

    assert!(matches!(
        tx.commit().unwrap_err(),
        CacheError::AlreadyCompleted(_)
    ));
    assert!(matches!(
        tx.abort().unwrap_err(),
        CacheError::AlreadyCompleted(_)
    ));
    assert_eq!(f.partition.lock_snapshot().holder, None);
}

#[tokio::test]
async fn row_preconditions_are_enforced() {
    let f = fixture();
    f.store.seed(P0, key("present"), "1".into());

    let mut tx = f.partition.start_transaction().await.expect("start");
    f.rows.prefetch(&mut tx, key("present")).expect("prefetch");
    f.rows.prefetch(&mut tx, key("absent")).expect("prefetch");
    tx.complete_prefetches().await.expect("complete prefetches");

    let err = f
        .rows
        .create_non_existing(&mut tx, key("present"), "2".into())
        .unwrap_err();
    assert!(matches!(err, CacheError::RowExists));
    let err = f.rows.update(&mut tx, &key("absent"), "2".into()).unwrap_err();
    assert!(matches!(err, CacheError::RowMissing));
    let err = f.rows.delete(&mut tx, &key("absent")).unwrap_err();
    assert!(matches!(err, CacheError::RowMissing));
    let err = f.rows.update(&mut tx, &key("never"), "2".into()).unwrap_err();
    assert!(matches!(err, CacheError::RowNotCached));

    assert_eq!(
        f.rows.try_get(&mut tx, &key("present")).expect("get"),
        Some("1".to_string())
    );
    assert_eq!(f.partition.dirty_rows(), 0);
    tx.commit().expect("commit");
}

#[tokio::test]
async fn sequence_numbers_increase() {
    let f = fixture();
    let mut tx = f.partition.start_transaction().await.expect("start");
    let first = tx.next_sequence_number().expect("sequence");
    let second = tx.next_sequence_number().expect("sequence");
    assert!(tx.id() < first && first < second);
    tx.commit().expect("commit");

    let mut next = f.partition.start_transaction().await.expect("start");
    assert!(next.id() > second);
    next.commit().expect("commit");
    assert_eq!(f.partition.last_sequence_number(), next.id());
}

#[tokio::test]
async fn abort_restores_rows_and_deduplication() {
    let f = fixture();
    f.store.seed(P0, key("a"), "1".into());

    let mut tx = f.partition.start_transaction().await.expect("start");
    f.rows.prefetch(&mut tx, key("a")).expect("prefetch");
    tx.complete_prefetches().await.expect("complete prefetches");
    f.rows.update(&mut tx, &key("a"), "2".into()).expect("update");
    f.rows
        .create_non_existing(&mut tx, key("b"), "new".into())
        .expect("create");
    assert!(tx
        .advance_deduplication(PartitionId(1), 5)
        .expect("advance"));
    assert_eq!(f.partition.dirty_rows(), 2);
    tx.abort().expect("abort");

    assert_eq!(f.partition.dirty_rows(), 0);
    assert_eq!(f.partition.lock_snapshot().holder, None);
    assert_eq!(f.partition.metadata().dedup_vector, vec![0; 4]);
    let b = f.rows.row_stats(P0, &key("b")).expect("row b cached");
    assert!(!b.exists);
    assert_eq!(b.writeback, Writeback::None);

    let mut tx = f.partition.start_transaction().await.expect("start");
    f.rows.prefetch(&mut tx, key("a")).expect("prefetch");
    assert_eq!(tx.outstanding_prefetches(), 0);
    tx.complete_prefetches().await.expect("complete prefetches");
    assert_eq!(
        f.rows.try_get(&mut tx, &key("a")).expect("get"),
        Some("1".to_string())
    );
    tx.commit().expect("commit");
}

#[tokio::test]
async fn abort_keeps_rows_dirtied_by_earlier_transactions() {
    let f = fixture();
    let mut tx = f.partition.start_transaction().await.expect("start");
    f.rows
        .create_non_existing(&mut tx, key("k"), "v1".into())
        .expect("create");
    tx.commit().expect("commit");

    let mut tx = f.partition.start_transaction().await.expect("start");
    f.rows.prefetch(&mut tx, key("k")).expect("prefetch");
    tx.complete_prefetches().await.expect("complete prefetches");
    f.rows.delete(&mut tx, &key("k")).expect("delete");
    assert_eq!(f.partition.dirty_rows(), 0);
    tx.abort().expect("abort");

    assert_eq!(f.partition.dirty_rows(), 1);
    let stats = f.rows.row_stats(P0, &key("k")).expect("cached");
    assert!(stats.exists);
    assert_eq!(stats.writeback, Writeback::Created);
}

#[tokio::test]
async fn deduplication_positions_only_move_forward() {
    let f = fixture();
    let source = PartitionId(2);
    let mut tx = f.partition.start_transaction().await.expect("start");
    assert_eq!(tx.deduplication_position(source).expect("position"), 0);
    assert!(tx.advance_deduplication(source, 7).expect("advance"));
    assert!(!tx.advance_deduplication(source, 7).expect("advance"));
    assert!(!tx.advance_deduplication(source, 3).expect("advance"));
    assert_eq!(tx.deduplication_position(source).expect("position"), 7);

    let err = tx.advance_deduplication(PartitionId(9), 1).unwrap_err();
    assert!(matches!(err, CacheError::Invalid(_)));
    tx.commit().expect("commit");

    let mut checkpoint = MemoryCheckpoint::new();
    f.partition
        .collect_next_checkpoint(&mut checkpoint)
        .await
        .expect("checkpoint");
    let metadata = checkpoint.metadata().expect("metadata");
    assert_eq!(metadata.dedup_vector, vec![0, 0, 7, 0]);
}

#[tokio::test]
async fn completion_callbacks_and_listener() {
    let listener = Arc::new(RecordingListener::default());
    let observer: Arc<dyn TransactionListener> = listener.clone();
    let f = fixture_with(Some(observer));
    let completed = Arc::new(AtomicUsize::new(0));
    let persisted = Arc::new(AtomicUsize::new(0));

    let mut tx = f.partition.start_transaction().await.expect("start");
    let counter = completed.clone();
    tx.when_completed(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    })
    .expect("when completed");
    let counter = persisted.clone();
    tx.when_persisted(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    })
    .expect("when persisted");
    let committed = tx.id();
    tx.commit().expect("commit");

    assert_eq!(completed.load(Ordering::SeqCst), 1);
    assert_eq!(persisted.load(Ordering::SeqCst), 0);
    assert_eq!(f.partition.pending_actions(), 1);
    assert_eq!(*listener.completed.lock(), vec![(P0, committed)]);

    let mut aborted = f.partition.start_transaction().await.expect("start");
    aborted.abort().expect("abort");
    assert_eq!(listener.completed.lock().len(), 1);

    let mut checkpoint = MemoryCheckpoint::new();
    let summary = f
        .cache
        .collect_next_checkpoint(P0, &mut checkpoint)
        .await
        .expect("checkpoint");
    assert_eq!(summary.actions, 1);
    assert_eq!(f.partition.pending_actions(), 0);
    checkpoint.persist().expect("persist");
    assert_eq!(persisted.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn failed_load_can_be_retried() {
    let f = fixture();
    f.store.seed(P0, key("k"), "v".into());
    f.store.fail_loads(true);

    let mut tx = f.partition.start_transaction().await.expect("start");
    f.rows.prefetch(&mut tx, key("k")).expect("prefetch");
    let err = tx.complete_prefetches().await.unwrap_err();
    assert!(matches!(err, CacheError::Storage(_)));
    assert_eq!(tx.phase(), TxPhase::WaitingForPrefetch);
    assert_eq!(f.partition.lock_snapshot().holder, None);
    tx.abort().expect("abort");

    let stats = f.rows.row_stats(P0, &key("k")).expect("cached");
    assert!(!stats.loaded);
    assert!(!stats.pending);
    assert_eq!(stats.ref_count, 0);

    f.store.fail_loads(false);
    let mut tx = f.partition.start_transaction().await.expect("start");
    f.rows.prefetch(&mut tx, key("k")).expect("prefetch");
    tx.complete_prefetches().await.expect("complete prefetches");
    assert_eq!(
        f.rows.try_get(&mut tx, &key("k")).expect("get"),
        Some("v".to_string())
    );
    tx.commit().expect("commit");
    assert_eq!(f.store.loads(), 2);
}

#[tokio::test]
async fn idle_rows_are_evicted() {
    let f = fixture();
    let mut tx = f.partition.start_transaction().await.expect("start");
    f.rows
        .create_non_existing(&mut tx, key("k"), "v".into())
        .expect("create");
    tx.commit().expect("commit");

    let mut tx = f.partition.start_transaction().await.expect("start");
    let bound = tx.id();
    assert_eq!(f.rows.evict_idle(&mut tx, bound).expect("evict"), 0);
    tx.commit().expect("commit");

    let mut checkpoint = MemoryCheckpoint::new();
    f.partition
        .collect_next_checkpoint(&mut checkpoint)
        .await
        .expect("checkpoint");
    checkpoint.persist().expect("persist");

    let mut tx = f.partition.start_transaction().await.expect("start");
    let bound = tx.id();
    assert_eq!(f.rows.evict_idle(&mut tx, bound).expect("evict"), 1);
    tx.commit().expect("commit");
    assert_eq!(f.rows.cached_rows(P0), 0);
    assert_eq!(f.store.get(P0, &key("k")), Some("v".to_string()));
}

#[tokio::test]
async fn collected_rows_stay_cached_until_persisted() {
    let f = fixture();
    let mut tx = f.partition.start_transaction().await.expect("start");
    f.rows
        .create_non_existing(&mut tx, key("k1"), "v1".into())
        .expect("create");
    tx.commit().expect("commit");

    let mut checkpoint = MemoryCheckpoint::new();
    f.partition
        .collect_next_checkpoint(&mut checkpoint)
        .await
        .expect("checkpoint");
    assert_eq!(f.partition.dirty_rows(), 0);
    assert_eq!(f.partition.unpersisted_rows(), 1);

    let mut tx = f.partition.start_transaction().await.expect("start");
    let bound = tx.id();
    assert_eq!(f.rows.evict_idle(&mut tx, bound).expect("evict"), 0);
    tx.commit().expect("commit");

    let mut tx = f.partition.start_transaction().await.expect("start");
    f.rows.prefetch(&mut tx, key("k1")).expect("prefetch");
    tx.complete_prefetches().await.expect("complete prefetches");
    assert_eq!(
        f.rows.try_get(&mut tx, &key("k1")).expect("get"),
        Some("v1".to_string())
    );
    let err = f
        .rows
        .create_non_existing(&mut tx, key("k1"), "again".into())
        .unwrap_err();
    assert!(matches!(err, CacheError::RowExists));
    tx.commit().expect("commit");
    assert_eq!(f.store.loads(), 0);
    assert_eq!(f.store.get(P0, &key("k1")), None);

    checkpoint.persist().expect("persist");
    assert_eq!(f.partition.unpersisted_rows(), 0);
    let mut tx = f.partition.start_transaction().await.expect("start");
    let bound = tx.id();
    assert_eq!(f.rows.evict_idle(&mut tx, bound).expect("evict"), 1);
    tx.commit().expect("commit");
}

#[tokio::test]
async fn persisting_an_older_checkpoint_keeps_newer_rows_pinned() {
    let f = fixture();
    let mut tx = f.partition.start_transaction().await.expect("start");
    f.rows
        .create_non_existing(&mut tx, key("k"), "v1".into())
        .expect("create");
    tx.commit().expect("commit");
    let mut first = MemoryCheckpoint::new();
    f.partition
        .collect_next_checkpoint(&mut first)
        .await
        .expect("first checkpoint");

    let mut tx = f.partition.start_transaction().await.expect("start");
    f.rows.update(&mut tx, &key("k"), "v2".into()).expect("update");
    tx.commit().expect("commit");
    let mut second = MemoryCheckpoint::new();
    f.partition
        .collect_next_checkpoint(&mut second)
        .await
        .expect("second checkpoint");

    first.persist().expect("persist first");
    assert_eq!(f.partition.unpersisted_rows(), 1);
    let mut tx = f.partition.start_transaction().await.expect("start");
    let bound = tx.id();
    assert_eq!(f.rows.evict_idle(&mut tx, bound).expect("evict"), 0);
    tx.commit().expect("commit");

    second.persist().expect("persist second");
    assert_eq!(f.partition.unpersisted_rows(), 0);
    assert_eq!(f.store.get(P0, &key("k")), Some("v2".to_string()));
}

#[test]
fn add_rollback_captures_once_until_discarded() {
    let store = Arc::new(Store::new("rows"));
    let row: Arc<RowEntry<String, String, Store>> = Arc::new(RowEntry::new(
        key("k"),
        store,
        SequenceNumber(1),
        true,
    ));
    let tracked: Arc<dyn TrackedRow<MemoryCheckpoint>> = row.clone();

    assert!(tracked.add_rollback());
    assert!(!tracked.add_rollback());
    row.create(SequenceNumber(1), "v".into()).expect("create");
    assert_eq!(tracked.writeback(), Writeback::Created);

    tracked.rollback();
    assert!(!row.stats().exists);
    assert_eq!(tracked.writeback(), Writeback::None);

    assert!(tracked.add_rollback());
    tracked.discard_rollback();
    assert!(tracked.add_rollback());
}

#[tokio::test]
async fn registering_a_table_name_twice_is_rejected() {
    let f = fixture();
    let mut tx = f.partition.start_transaction().await.expect("start");
    f.rows
        .create_non_existing(&mut tx, key("k"), "v".into())
        .expect("create");
    tx.commit().expect("commit");

    let again: Arc<dyn TableRecovery> = f.rows.clone();
    let err = f.cache.register_table(again).unwrap_err();
    assert!(matches!(err, CacheError::DuplicateTable(ref name) if name == "rows"));

    let other = Arc::new(Store::new("rows"));
    let err = f
        .cache
        .create_table::<String, String, Store>("rows", other)
        .map(|_| ())
        .unwrap_err();
    assert!(matches!(err, CacheError::DuplicateTable(_)));

    assert_eq!(f.store.recoveries(), 1);
    assert_eq!(f.partition.dirty_rows(), 1);
    assert_eq!(f.rows.cached_rows(P0), 1);
}

#[tokio::test]
async fn recovery_rejects_duplicates_and_bad_vectors() {
    let f = fixture();
    let err = f.cache.recover_new_partition(P0).unwrap_err();
    assert!(matches!(err, CacheError::DuplicatePartition(_)));

    let err = f
        .cache
        .recover_partition(PartitionMetaData::initial(PartitionId(1), 2))
        .unwrap_err();
    assert!(matches!(err, CacheError::Invalid(_)));

    let err = f
        .cache
        .start_transaction(PartitionId(5))
        .await
        .unwrap_err();
    assert!(matches!(err, CacheError::UnknownPartition(_)));

    f.cache
        .recover_new_partition(PartitionId(1))
        .expect("recover second partition");
    assert_eq!(f.cache.partition_ids(), vec![P0, PartitionId(1)]);
    assert_eq!(f.store.recoveries(), 2);
}

#[tokio::test]
async fn checkpoint_due_follows_policy() {
    let policy = CheckpointPolicy {
        max_dirty_rows: 2,
        max_pending_actions: 10,
        max_interval_ms: None,
    };
    let cache: PipelinedCache<MemoryCheckpoint> =
        PipelinedCache::new(CacheOptions::default().checkpoint(policy)).expect("create cache");
    let store = Arc::new(MemoryStore::<String, String>::new("rows"));
    let rows: Arc<Rows> = cache.create_table("rows", store).expect("create table");
    cache.recover_new_partition(P0).expect("recover");

    let mut tx = cache.start_transaction(P0).await.expect("start");
    rows.create_non_existing(&mut tx, key("a"), "1".into())
        .expect("create");
    tx.commit().expect("commit");
    assert!(cache.partitions_due_for_checkpoint().is_empty());

    let mut tx = cache.start_transaction(P0).await.expect("start");
    rows.create_non_existing(&mut tx, key("b"), "2".into())
        .expect("create");
    tx.commit().expect("commit");
    assert_eq!(cache.partitions_due_for_checkpoint(), vec![P0]);
}

#[tokio::test]
#[should_panic(expected = "dropped without commit or abort")]
async fn dropping_uncommitted_transaction_panics() {
    let f = fixture();
    let mut tx = f.partition.start_transaction().await.expect("start");
    f.rows
        .create_non_existing(&mut tx, key("k"), "v".into())
        .expect("create");
    drop(tx);
}

#[tokio::test]
async fn dropped_transaction_leaves_partition_usable() {
    let f = fixture();
    let partition = Arc::clone(&f.partition);
    let rows = Arc::clone(&f.rows);
    let dropped = tokio::spawn(async move {
        let mut tx = partition.start_transaction().await.expect("start");
        rows.create_non_existing(&mut tx, key("k"), "v".into())
            .expect("create");
        drop(tx);
    })
    .await;
    assert!(dropped.unwrap_err().is_panic());

    assert_eq!(f.partition.dirty_rows(), 0);
    let mut tx = f.partition.start_transaction().await.expect("start");
    f.rows
        .create_non_existing(&mut tx, key("k"), "again".into())
        .expect("create after drop");
    tx.commit().expect("commit");
}
