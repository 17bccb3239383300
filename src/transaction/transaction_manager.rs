use dashmap::DashMap;
use log::{debug, trace};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::{BurrowDBError, BurrowDBResult};
use crate::transaction::{
    IsolationLevel, LockManager, Transaction, TransactionId, TransactionState, WriteRecordType,
};

/// Hands out transactions and finishes them: commit releases every lock;
/// abort walks the write sets backwards first, then releases.
#[derive(Debug)]
pub struct TransactionManager {
    next_txn_id: AtomicU64,
    lock_manager: Arc<LockManager>,
    active_txns: DashMap<TransactionId, Arc<Transaction>>,
}

impl TransactionManager {
    pub fn new(lock_manager: Arc<LockManager>) -> Self {
        Self {
            next_txn_id: AtomicU64::new(1),
            lock_manager,
            active_txns: DashMap::new(),
        }
    }

    pub fn lock_manager(&self) -> &Arc<LockManager> {
        &self.lock_manager
    }

    pub fn begin(&self, isolation_level: IsolationLevel) -> Arc<Transaction> {
        let txn_id = self.next_txn_id.fetch_add(1, Ordering::SeqCst);
        let txn = Arc::new(Transaction::new(txn_id, isolation_level));
        self.active_txns.insert(txn_id, txn.clone());
        trace!("txn {} began ({:?})", txn_id, isolation_level);
        txn
    }

    pub fn get_transaction(&self, txn_id: TransactionId) -> Option<Arc<Transaction>> {
        self.active_txns.get(&txn_id).map(|entry| entry.value().clone())
    }

    pub fn commit(&self, txn: &Arc<Transaction>) -> BurrowDBResult<()> {
        match txn.state() {
            TransactionState::Committed => {
                return Err(BurrowDBError::Internal(format!(
                    "transaction {} already committed",
                    txn.id()
                )))
            }
            TransactionState::Aborted => {
                return Err(BurrowDBError::Internal(format!(
                    "transaction {} already aborted",
                    txn.id()
                )))
            }
            TransactionState::Growing | TransactionState::Shrinking => {}
        }

        txn.take_table_write_set();
        txn.take_index_write_set();
        self.lock_manager.release_all(txn);
        txn.set_state(TransactionState::Committed);
        self.active_txns.remove(&txn.id());
        debug!("txn {} committed", txn.id());
        Ok(())
    }

    /// Revert the transaction's effects: the table write set in reverse,
    /// then the index write set in reverse, then release every lock.
    pub fn abort(&self, txn: &Arc<Transaction>) -> BurrowDBResult<()> {
        if txn.state() == TransactionState::Committed {
            return Err(BurrowDBError::Internal(format!(
                "transaction {} already committed",
                txn.id()
            )));
        }

        let mut table_writes = txn.take_table_write_set();
        while let Some(record) = table_writes.pop() {
            match record.wtype {
                WriteRecordType::Insert => {
                    let mut meta = record.table.tuple_meta(record.rid)?;
                    meta.mark_deleted(txn.id());
                    record.table.update_tuple_meta(record.rid, meta)?;
                }
                WriteRecordType::Delete => {
                    let mut meta = record.table.tuple_meta(record.rid)?;
                    meta.clear_deleted();
                    record.table.update_tuple_meta(record.rid, meta)?;
                }
                WriteRecordType::Update => {
                    let old_tuple = record.old_tuple.ok_or_else(|| {
                        BurrowDBError::Internal(
                            "update write record without the prior tuple".to_string(),
                        )
                    })?;
                    record.table.update_tuple(record.rid, old_tuple)?;
                }
            }
        }

        let mut index_writes = txn.take_index_write_set();
        while let Some(record) = index_writes.pop() {
            match record.wtype {
                WriteRecordType::Insert => {
                    record.index.remove_encoded(&record.key)?;
                }
                WriteRecordType::Delete => {
                    record.index.insert_encoded(&record.key, record.rid)?;
                }
                WriteRecordType::Update => {
                    let old_key = record.old_key.ok_or_else(|| {
                        BurrowDBError::Internal(
                            "update write record without the prior key".to_string(),
                        )
                    })?;
                    record.index.remove_encoded(&record.key)?;
                    record.index.insert_encoded(&old_key, record.rid)?;
                }
            }
        }

        self.lock_manager.release_all(txn);
        txn.set_state(TransactionState::Aborted);
        self.active_txns.remove(&txn.id());
        debug!("txn {} aborted", txn.id());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferPoolManager;
    use crate::config::LockManagerConfig;
    use crate::storage::disk_manager::DiskManager;
    use crate::storage::disk_scheduler::DiskScheduler;
    use crate::storage::heap::TableHeap;
    use crate::storage::index::{BPlusTreeIndex, IndexKey, IndexWriteUndo};
    use crate::storage::page::TupleMeta;
    use crate::storage::tuple::Tuple;
    use crate::transaction::{IndexWriteRecord, LockMode, TableWriteRecord};
    use tempfile::TempDir;

    fn setup() -> (
        TempDir,
        Arc<BufferPoolManager>,
        TransactionManager,
    ) {
        let temp_dir = TempDir::new().unwrap();
        let disk_manager = Arc::new(DiskManager::try_new(temp_dir.path().join("txn.db")).unwrap());
        let disk_scheduler = Arc::new(DiskScheduler::new(disk_manager));
        let bpm = Arc::new(BufferPoolManager::new(64, disk_scheduler));
        let lock_manager = LockManager::new(LockManagerConfig::default());
        (temp_dir, bpm, TransactionManager::new(lock_manager))
    }

    #[test]
    fn commit_releases_locks_and_finishes() {
        let (_tmp, _bpm, manager) = setup();
        let txn = manager.begin(IsolationLevel::RepeatableRead);
        assert!(manager
            .lock_manager()
            .lock_table(&txn, LockMode::Exclusive, 1)
            .unwrap());

        manager.commit(&txn).unwrap();
        assert_eq!(txn.state(), TransactionState::Committed);
        assert!(manager.get_transaction(txn.id()).is_none());

        // The table lock is gone: another transaction can take it at once.
        let txn2 = manager.begin(IsolationLevel::RepeatableRead);
        assert!(manager
            .lock_manager()
            .lock_table(&txn2, LockMode::Exclusive, 1)
            .unwrap());
        manager.commit(&txn2).unwrap();
    }

    #[test]
    fn commit_twice_fails() {
        let (_tmp, _bpm, manager) = setup();
        let txn = manager.begin(IsolationLevel::RepeatableRead);
        manager.commit(&txn).unwrap();
        assert!(manager.commit(&txn).is_err());
        assert!(manager.abort(&txn).is_err());
    }

    #[test]
    fn abort_reverts_inserts_deletes_and_updates() {
        let (_tmp, bpm, manager) = setup();
        let heap = Arc::new(TableHeap::try_new(bpm).unwrap());

        // Committed baseline rows.
        let setup_txn = manager.begin(IsolationLevel::RepeatableRead);
        let kept = heap
            .insert_tuple(&TupleMeta::new(setup_txn.id()), &Tuple::new(vec![b'k']))
            .unwrap();
        let doomed = heap
            .insert_tuple(&TupleMeta::new(setup_txn.id()), &Tuple::new(vec![b'd']))
            .unwrap();
        manager.commit(&setup_txn).unwrap();

        let txn = manager.begin(IsolationLevel::RepeatableRead);

        // INSERT a row.
        let inserted = heap
            .insert_tuple(&TupleMeta::new(txn.id()), &Tuple::new(vec![b'i']))
            .unwrap();
        txn.append_table_write(TableWriteRecord::insert(heap.clone(), inserted));

        // DELETE a committed row.
        let mut meta = heap.tuple_meta(doomed).unwrap();
        meta.mark_deleted(txn.id());
        heap.update_tuple_meta(doomed, meta).unwrap();
        txn.append_table_write(TableWriteRecord::delete(heap.clone(), doomed));

        // UPDATE a committed row.
        let old_tuple = heap.tuple(kept).unwrap();
        heap.update_tuple(kept, Tuple::new(vec![b'K'])).unwrap();
        txn.append_table_write(TableWriteRecord::update(heap.clone(), kept, old_tuple));

        manager.abort(&txn).unwrap();
        assert_eq!(txn.state(), TransactionState::Aborted);

        // The insert is tombstoned, the delete undone, the update restored.
        assert!(heap.tuple_meta(inserted).unwrap().is_deleted);
        assert!(!heap.tuple_meta(doomed).unwrap().is_deleted);
        assert_eq!(heap.tuple(kept).unwrap().data, vec![b'k']);
        let live: Vec<_> = heap.live_tuples().unwrap();
        assert_eq!(live.len(), 2);
    }

    #[test]
    fn abort_reverts_index_writes_in_reverse() {
        let (_tmp, bpm, manager) = setup();
        let index: Arc<BPlusTreeIndex<i64>> =
            Arc::new(BPlusTreeIndex::new(bpm, 8, 8).unwrap());
        let undo: Arc<dyn IndexWriteUndo> = index.clone();

        // Committed baseline entry.
        let base_rid = crate::storage::page::RecordId::new(1, 1);
        index.insert(&100, base_rid).unwrap();

        let txn = manager.begin(IsolationLevel::RepeatableRead);

        // INSERT a new entry.
        let rid_a = crate::storage::page::RecordId::new(2, 1);
        index.insert_with_txn(&1, rid_a, &txn).unwrap();
        txn.append_index_write(IndexWriteRecord::insert(undo.clone(), 1i64.encode(), rid_a));

        // DELETE the committed entry.
        index.remove_with_txn(&100, &txn).unwrap();
        txn.append_index_write(IndexWriteRecord::delete(
            undo.clone(),
            100i64.encode(),
            base_rid,
        ));

        // UPDATE: move rid_a from key 1 to key 2.
        index.remove_with_txn(&1, &txn).unwrap();
        index.insert_with_txn(&2, rid_a, &txn).unwrap();
        txn.append_index_write(IndexWriteRecord::update(
            undo.clone(),
            2i64.encode(),
            1i64.encode(),
            rid_a,
        ));

        manager.abort(&txn).unwrap();

        // The update rolled back to key 1, which the insert undo then
        // removed; the committed entry is back.
        assert_eq!(index.get(&1).unwrap(), None);
        assert_eq!(index.get(&2).unwrap(), None);
        assert_eq!(index.get(&100).unwrap(), Some(base_rid));
    }

    #[test]
    fn abort_after_deadlock_victimization_releases_locks() {
        let (_tmp, _bpm, manager) = setup();
        let txn = manager.begin(IsolationLevel::RepeatableRead);
        assert!(manager
            .lock_manager()
            .lock_table(&txn, LockMode::Exclusive, 1)
            .unwrap());

        // The detector may have aborted the transaction asynchronously;
        // abort still runs undo and releases locks.
        txn.set_state(TransactionState::Aborted);
        manager.abort(&txn).unwrap();

        let txn2 = manager.begin(IsolationLevel::RepeatableRead);
        assert!(manager
            .lock_manager()
            .lock_table(&txn2, LockMode::Exclusive, 1)
            .unwrap());
        manager.commit(&txn2).unwrap();
    }
}
