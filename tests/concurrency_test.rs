use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use tempfile::TempDir;

use burrowdb::buffer::BufferPoolManager;
use burrowdb::config::LockManagerConfig;
use burrowdb::error::BurrowDBError;
use burrowdb::storage::disk_manager::DiskManager;
use burrowdb::storage::disk_scheduler::DiskScheduler;
use burrowdb::storage::heap::TableHeap;
use burrowdb::storage::index::{BPlusTreeIndex, IndexKey, IndexWriteUndo, TreeIndexIterator};
use burrowdb::storage::page::{RecordId, TupleMeta};
use burrowdb::storage::tuple::Tuple;
use burrowdb::transaction::{
    IndexWriteRecord, IsolationLevel, LockManager, LockMode, TableWriteRecord,
    TransactionManager, TransactionState,
};

fn setup_storage(pool_size: usize) -> (TempDir, Arc<BufferPoolManager>) {
    let temp_dir = TempDir::new().unwrap();
    let disk_manager = Arc::new(DiskManager::try_new(temp_dir.path().join("test.db")).unwrap());
    let disk_scheduler = Arc::new(DiskScheduler::new(disk_manager));
    let bpm = Arc::new(BufferPoolManager::new(pool_size, disk_scheduler));
    (temp_dir, bpm)
}

fn rid_from_key(key: i64) -> RecordId {
    RecordId::new((key >> 32) as u32, (key & 0xFFFF_FFFF) as u32)
}

/// Threads insert disjoint partitions of the key space while readers verify
/// keys whose insertion finished before the reads began; quiescent iteration
/// sees every key in order.
#[test]
fn concurrent_insert_and_lookup_scale() {
    const WRITERS: i64 = 4;
    const PER_WRITER: i64 = 2500;
    const TOTAL: i64 = WRITERS * PER_WRITER;
    const PRELOADED: i64 = 1000;

    let (_tmp, bpm) = setup_storage(512);
    let index: Arc<BPlusTreeIndex<i64>> = Arc::new(BPlusTreeIndex::new(bpm, 64, 64).unwrap());

    // A prefix every reader may rely on.
    for key in 1..=PRELOADED {
        index.insert(&key, rid_from_key(key)).unwrap();
    }

    let barrier = Arc::new(Barrier::new(WRITERS as usize + 2));
    let mut handles = Vec::new();
    for w in 0..WRITERS {
        let index = index.clone();
        let barrier = barrier.clone();
        handles.push(thread::spawn(move || {
            barrier.wait();
            for i in 0..PER_WRITER {
                let key = w * PER_WRITER + i + 1;
                if key <= PRELOADED {
                    continue;
                }
                index.insert(&key, rid_from_key(key)).unwrap();
            }
        }));
    }
    for _ in 0..2 {
        let index = index.clone();
        let barrier = barrier.clone();
        handles.push(thread::spawn(move || {
            barrier.wait();
            for _ in 0..3 {
                for key in 1..=PRELOADED {
                    assert_eq!(
                        index.get(&key).unwrap(),
                        Some(rid_from_key(key)),
                        "completed insert of {} must be visible",
                        key
                    );
                }
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    for key in 1..=TOTAL {
        assert_eq!(index.get(&key).unwrap(), Some(rid_from_key(key)));
    }

    let mut iter = TreeIndexIterator::new(index, ..);
    let mut expected = 1i64;
    while let Some((key, rid)) = iter.next().unwrap() {
        assert_eq!(key, expected);
        assert_eq!(rid, rid_from_key(expected));
        expected += 1;
    }
    assert_eq!(expected, TOTAL + 1);
}

/// T1 holds S on a row, T2's X blocks, T1 upgrades to X and finishes first,
/// then T2 receives the grant.
#[test]
fn lock_upgrade_beats_waiting_writer() {
    let lock_manager = LockManager::new(LockManagerConfig::default());
    let txn_manager = Arc::new(TransactionManager::new(lock_manager));
    let rid = RecordId::new(1, 1);

    let t1 = txn_manager.begin(IsolationLevel::RepeatableRead);
    let t2 = txn_manager.begin(IsolationLevel::RepeatableRead);

    assert!(txn_manager
        .lock_manager()
        .lock_table(&t1, LockMode::IntentionExclusive, 1)
        .unwrap());
    assert!(txn_manager
        .lock_manager()
        .lock_table(&t2, LockMode::IntentionExclusive, 1)
        .unwrap());
    assert!(txn_manager
        .lock_manager()
        .lock_row(&t1, LockMode::Shared, 1, rid)
        .unwrap());

    let t2_granted = Arc::new(AtomicBool::new(false));
    let waiter = {
        let txn_manager = txn_manager.clone();
        let t2 = t2.clone();
        let flag = t2_granted.clone();
        thread::spawn(move || {
            let ok = txn_manager
                .lock_manager()
                .lock_row(&t2, LockMode::Exclusive, 1, rid)
                .unwrap();
            flag.store(ok, Ordering::SeqCst);
        })
    };
    thread::sleep(Duration::from_millis(50));
    assert!(!t2_granted.load(Ordering::SeqCst));

    // No other upgrader is active, so S -> X succeeds and jumps the queue.
    assert!(txn_manager
        .lock_manager()
        .lock_row(&t1, LockMode::Exclusive, 1, rid)
        .unwrap());
    assert!(!t2_granted.load(Ordering::SeqCst));

    assert!(txn_manager
        .lock_manager()
        .unlock_row(&t1, 1, rid, false)
        .unwrap());
    waiter.join().unwrap();
    assert!(t2_granted.load(Ordering::SeqCst));

    txn_manager.abort(&t1).unwrap();
    txn_manager.commit(&t2).unwrap();
}

/// A two-transaction cycle across two rows is broken within one detection
/// round by aborting the larger txn id; the survivor finishes.
#[test]
fn deadlock_cycle_aborts_youngest_and_survivor_completes() {
    let lock_manager = LockManager::new(LockManagerConfig {
        deadlock_detection_interval: Duration::from_millis(50),
    });
    let txn_manager = Arc::new(TransactionManager::new(lock_manager));
    let rid_a = RecordId::new(1, 1);
    let rid_b = RecordId::new(1, 2);

    let t1 = txn_manager.begin(IsolationLevel::RepeatableRead);
    let t2 = txn_manager.begin(IsolationLevel::RepeatableRead);

    for txn in [&t1, &t2] {
        assert!(txn_manager
            .lock_manager()
            .lock_table(txn, LockMode::IntentionExclusive, 1)
            .unwrap());
    }
    assert!(txn_manager
        .lock_manager()
        .lock_row(&t1, LockMode::Exclusive, 1, rid_a)
        .unwrap());
    assert!(txn_manager
        .lock_manager()
        .lock_row(&t2, LockMode::Exclusive, 1, rid_b)
        .unwrap());

    let survivor = {
        let txn_manager = txn_manager.clone();
        let t1 = t1.clone();
        thread::spawn(move || {
            txn_manager
                .lock_manager()
                .lock_row(&t1, LockMode::Exclusive, 1, rid_b)
                .unwrap()
        })
    };
    let victim = {
        let txn_manager = txn_manager.clone();
        let t2 = t2.clone();
        thread::spawn(move || {
            txn_manager
                .lock_manager()
                .lock_row(&t2, LockMode::Exclusive, 1, rid_a)
                .unwrap()
        })
    };

    // The younger transaction unwinds with a failed acquisition.
    assert!(!victim.join().unwrap());
    assert_eq!(t2.state(), TransactionState::Aborted);
    txn_manager.abort(&t2).unwrap();

    // With the victim's locks gone the survivor gets its grant.
    assert!(survivor.join().unwrap());
    txn_manager.commit(&t1).unwrap();
    assert_eq!(t1.state(), TransactionState::Committed);
}

/// Insert rows (with index entries) inside a transaction, abort, and
/// observe no trace in either the heap or the index.
#[test]
fn abort_undoes_inserted_rows_and_index_entries() {
    let (_tmp, bpm) = setup_storage(128);
    let heap = Arc::new(TableHeap::try_new(bpm.clone()).unwrap());
    let index: Arc<BPlusTreeIndex<i64>> = Arc::new(BPlusTreeIndex::new(bpm, 16, 16).unwrap());
    let undo: Arc<dyn IndexWriteUndo> = index.clone();

    let lock_manager = LockManager::new(LockManagerConfig::default());
    let txn_manager = TransactionManager::new(lock_manager);
    let txn = txn_manager.begin(IsolationLevel::RepeatableRead);

    assert!(txn_manager
        .lock_manager()
        .lock_table(&txn, LockMode::IntentionExclusive, 1)
        .unwrap());

    for (key, payload) in [(1i64, b'a'), (2, b'b'), (3, b'c')] {
        let rid = heap
            .insert_tuple(&TupleMeta::new(txn.id()), &Tuple::new(vec![payload]))
            .unwrap();
        assert!(txn_manager
            .lock_manager()
            .lock_row(&txn, LockMode::Exclusive, 1, rid)
            .unwrap());
        txn.append_table_write(TableWriteRecord::insert(heap.clone(), rid));

        index.insert_with_txn(&key, rid, &txn).unwrap();
        txn.append_index_write(IndexWriteRecord::insert(undo.clone(), key.encode(), rid));
    }

    assert_eq!(heap.live_tuples().unwrap().len(), 3);
    for key in [1i64, 2, 3] {
        assert!(index.get(&key).unwrap().is_some());
    }

    txn_manager.abort(&txn).unwrap();

    for key in [1i64, 2, 3] {
        assert_eq!(index.get(&key).unwrap(), None);
    }
    assert!(heap.live_tuples().unwrap().is_empty());
}

/// Commit keeps effects and releases locks; a later transaction can touch
/// the same rows immediately.
#[test]
fn commit_keeps_rows_and_releases_locks() {
    let (_tmp, bpm) = setup_storage(128);
    let heap = Arc::new(TableHeap::try_new(bpm.clone()).unwrap());
    let index: Arc<BPlusTreeIndex<i64>> = Arc::new(BPlusTreeIndex::new(bpm, 16, 16).unwrap());
    let undo: Arc<dyn IndexWriteUndo> = index.clone();

    let lock_manager = LockManager::new(LockManagerConfig::default());
    let txn_manager = TransactionManager::new(lock_manager);

    let writer = txn_manager.begin(IsolationLevel::RepeatableRead);
    assert!(txn_manager
        .lock_manager()
        .lock_table(&writer, LockMode::IntentionExclusive, 1)
        .unwrap());
    let rid = heap
        .insert_tuple(&TupleMeta::new(writer.id()), &Tuple::new(vec![b'x']))
        .unwrap();
    assert!(txn_manager
        .lock_manager()
        .lock_row(&writer, LockMode::Exclusive, 1, rid)
        .unwrap());
    writer.append_table_write(TableWriteRecord::insert(heap.clone(), rid));
    index.insert_with_txn(&10, rid, &writer).unwrap();
    writer.append_index_write(IndexWriteRecord::insert(undo.clone(), 10i64.encode(), rid));
    txn_manager.commit(&writer).unwrap();

    assert_eq!(index.get(&10).unwrap(), Some(rid));
    assert_eq!(heap.live_tuples().unwrap().len(), 1);

    let reader = txn_manager.begin(IsolationLevel::RepeatableRead);
    assert!(txn_manager
        .lock_manager()
        .lock_table(&reader, LockMode::IntentionShared, 1)
        .unwrap());
    assert!(txn_manager
        .lock_manager()
        .lock_row(&reader, LockMode::Shared, 1, rid)
        .unwrap());
    assert_eq!(heap.tuple(rid).unwrap().data, vec![b'x']);
    txn_manager.commit(&reader).unwrap();
}

/// An index operation issued on behalf of an already-aborted transaction
/// unwinds without touching the tree.
#[test]
fn aborted_transaction_unwinds_index_operations() {
    let (_tmp, bpm) = setup_storage(64);
    let index: Arc<BPlusTreeIndex<i64>> = Arc::new(BPlusTreeIndex::new(bpm, 16, 16).unwrap());

    let lock_manager = LockManager::new(LockManagerConfig::default());
    let txn_manager = TransactionManager::new(lock_manager);
    let txn = txn_manager.begin(IsolationLevel::RepeatableRead);

    index.insert_with_txn(&1, rid_from_key(1), &txn).unwrap();
    txn.set_state(TransactionState::Aborted);

    let err = index.insert_with_txn(&2, rid_from_key(2), &txn).unwrap_err();
    assert!(matches!(err, BurrowDBError::Unwind));
    let err = index.remove_with_txn(&1, &txn).unwrap_err();
    assert!(matches!(err, BurrowDBError::Unwind));

    assert_eq!(index.get(&1).unwrap(), Some(rid_from_key(1)));
    assert_eq!(index.get(&2).unwrap(), None);
}
