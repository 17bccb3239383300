use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::storage::heap::TableHeap;
use crate::storage::index::IndexWriteUndo;
use crate::storage::page::RecordId;
use crate::storage::tuple::Tuple;
use crate::transaction::LockMode;

pub type TransactionId = u64;
pub const INVALID_TRANSACTION_ID: TransactionId = 0;

pub type TableOid = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
}

/// 2PL life cycle: Growing until the first lock release (subject to the
/// isolation rules), then Shrinking, then Committed or Aborted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Growing,
    Shrinking,
    Committed,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteRecordType {
    Insert,
    Delete,
    Update,
}

/// One heap mutation to revert on abort. UPDATE records carry the prior
/// tuple bytes.
#[derive(Debug)]
pub struct TableWriteRecord {
    pub wtype: WriteRecordType,
    pub table: Arc<TableHeap>,
    pub rid: RecordId,
    pub old_tuple: Option<Tuple>,
}

impl TableWriteRecord {
    pub fn insert(table: Arc<TableHeap>, rid: RecordId) -> Self {
        Self {
            wtype: WriteRecordType::Insert,
            table,
            rid,
            old_tuple: None,
        }
    }

    pub fn delete(table: Arc<TableHeap>, rid: RecordId) -> Self {
        Self {
            wtype: WriteRecordType::Delete,
            table,
            rid,
            old_tuple: None,
        }
    }

    pub fn update(table: Arc<TableHeap>, rid: RecordId, old_tuple: Tuple) -> Self {
        Self {
            wtype: WriteRecordType::Update,
            table,
            rid,
            old_tuple: Some(old_tuple),
        }
    }
}

/// One index mutation to revert on abort. Keys are stored encoded so the
/// record does not depend on the index's key type.
#[derive(Debug)]
pub struct IndexWriteRecord {
    pub wtype: WriteRecordType,
    pub index: Arc<dyn IndexWriteUndo>,
    pub key: Vec<u8>,
    pub old_key: Option<Vec<u8>>,
    pub rid: RecordId,
}

impl IndexWriteRecord {
    pub fn insert(index: Arc<dyn IndexWriteUndo>, key: Vec<u8>, rid: RecordId) -> Self {
        Self {
            wtype: WriteRecordType::Insert,
            index,
            key,
            old_key: None,
            rid,
        }
    }

    pub fn delete(index: Arc<dyn IndexWriteUndo>, key: Vec<u8>, rid: RecordId) -> Self {
        Self {
            wtype: WriteRecordType::Delete,
            index,
            key,
            old_key: None,
            rid,
        }
    }

    pub fn update(
        index: Arc<dyn IndexWriteUndo>,
        new_key: Vec<u8>,
        old_key: Vec<u8>,
        rid: RecordId,
    ) -> Self {
        Self {
            wtype: WriteRecordType::Update,
            index,
            key: new_key,
            old_key: Some(old_key),
            rid,
        }
    }
}

#[derive(Debug, Default)]
struct LockSets {
    shared_tables: HashSet<TableOid>,
    exclusive_tables: HashSet<TableOid>,
    intention_shared_tables: HashSet<TableOid>,
    intention_exclusive_tables: HashSet<TableOid>,
    shared_intention_exclusive_tables: HashSet<TableOid>,
    shared_rows: HashMap<TableOid, HashSet<RecordId>>,
    exclusive_rows: HashMap<TableOid, HashSet<RecordId>>,
}

/// A transaction is shared across the worker thread, the lock manager, and
/// the deadlock detector, so its mutable state sits behind its own latches.
#[derive(Debug)]
pub struct Transaction {
    id: TransactionId,
    isolation_level: IsolationLevel,
    state: Mutex<TransactionState>,
    lock_sets: Mutex<LockSets>,
    table_write_set: Mutex<Vec<TableWriteRecord>>,
    index_write_set: Mutex<Vec<IndexWriteRecord>>,
}

impl Transaction {
    pub fn new(id: TransactionId, isolation_level: IsolationLevel) -> Self {
        Self {
            id,
            isolation_level,
            state: Mutex::new(TransactionState::Growing),
            lock_sets: Mutex::new(LockSets::default()),
            table_write_set: Mutex::new(Vec::new()),
            index_write_set: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn isolation_level(&self) -> IsolationLevel {
        self.isolation_level
    }

    pub fn state(&self) -> TransactionState {
        *self.state.lock()
    }

    pub fn set_state(&self, state: TransactionState) {
        *self.state.lock() = state;
    }

    pub fn append_table_write(&self, record: TableWriteRecord) {
        self.table_write_set.lock().push(record);
    }

    pub fn append_index_write(&self, record: IndexWriteRecord) {
        self.index_write_set.lock().push(record);
    }

    pub fn take_table_write_set(&self) -> Vec<TableWriteRecord> {
        std::mem::take(&mut self.table_write_set.lock())
    }

    pub fn take_index_write_set(&self) -> Vec<IndexWriteRecord> {
        std::mem::take(&mut self.index_write_set.lock())
    }

    pub fn held_table_lock_mode(&self, oid: TableOid) -> Option<LockMode> {
        let sets = self.lock_sets.lock();
        if sets.exclusive_tables.contains(&oid) {
            Some(LockMode::Exclusive)
        } else if sets.shared_intention_exclusive_tables.contains(&oid) {
            Some(LockMode::SharedIntentionExclusive)
        } else if sets.shared_tables.contains(&oid) {
            Some(LockMode::Shared)
        } else if sets.intention_exclusive_tables.contains(&oid) {
            Some(LockMode::IntentionExclusive)
        } else if sets.intention_shared_tables.contains(&oid) {
            Some(LockMode::IntentionShared)
        } else {
            None
        }
    }

    pub fn holds_row_locks_on(&self, oid: TableOid) -> bool {
        let sets = self.lock_sets.lock();
        sets.shared_rows.get(&oid).is_some_and(|rows| !rows.is_empty())
            || sets
                .exclusive_rows
                .get(&oid)
                .is_some_and(|rows| !rows.is_empty())
    }

    pub(crate) fn insert_table_lock(&self, mode: LockMode, oid: TableOid) {
        let mut sets = self.lock_sets.lock();
        match mode {
            LockMode::Shared => sets.shared_tables.insert(oid),
            LockMode::Exclusive => sets.exclusive_tables.insert(oid),
            LockMode::IntentionShared => sets.intention_shared_tables.insert(oid),
            LockMode::IntentionExclusive => sets.intention_exclusive_tables.insert(oid),
            LockMode::SharedIntentionExclusive => {
                sets.shared_intention_exclusive_tables.insert(oid)
            }
        };
    }

    pub(crate) fn remove_table_lock(&self, mode: LockMode, oid: TableOid) {
        let mut sets = self.lock_sets.lock();
        match mode {
            LockMode::Shared => sets.shared_tables.remove(&oid),
            LockMode::Exclusive => sets.exclusive_tables.remove(&oid),
            LockMode::IntentionShared => sets.intention_shared_tables.remove(&oid),
            LockMode::IntentionExclusive => sets.intention_exclusive_tables.remove(&oid),
            LockMode::SharedIntentionExclusive => {
                sets.shared_intention_exclusive_tables.remove(&oid)
            }
        };
    }

    pub(crate) fn insert_row_lock(&self, mode: LockMode, oid: TableOid, rid: RecordId) {
        let mut sets = self.lock_sets.lock();
        let rows = match mode {
            LockMode::Shared => &mut sets.shared_rows,
            LockMode::Exclusive => &mut sets.exclusive_rows,
            _ => unreachable!("row locks are shared or exclusive only"),
        };
        rows.entry(oid).or_default().insert(rid);
    }

    pub(crate) fn remove_row_lock(&self, mode: LockMode, oid: TableOid, rid: RecordId) {
        let mut sets = self.lock_sets.lock();
        let rows = match mode {
            LockMode::Shared => &mut sets.shared_rows,
            LockMode::Exclusive => &mut sets.exclusive_rows,
            _ => unreachable!("row locks are shared or exclusive only"),
        };
        if let Some(set) = rows.get_mut(&oid) {
            set.remove(&rid);
        }
    }

    pub fn is_row_locked(&self, mode: LockMode, oid: TableOid, rid: RecordId) -> bool {
        let sets = self.lock_sets.lock();
        let rows = match mode {
            LockMode::Shared => &sets.shared_rows,
            LockMode::Exclusive => &sets.exclusive_rows,
            _ => return false,
        };
        rows.get(&oid).is_some_and(|set| set.contains(&rid))
    }

    /// Drain every held lock, rows first, for commit/abort release.
    pub(crate) fn drain_all_locks(
        &self,
    ) -> (
        Vec<(LockMode, TableOid, RecordId)>,
        Vec<(LockMode, TableOid)>,
    ) {
        let mut sets = self.lock_sets.lock();
        let mut rows = Vec::new();
        for (oid, rids) in sets.shared_rows.drain() {
            rows.extend(rids.into_iter().map(|rid| (LockMode::Shared, oid, rid)));
        }
        for (oid, rids) in sets.exclusive_rows.drain() {
            rows.extend(rids.into_iter().map(|rid| (LockMode::Exclusive, oid, rid)));
        }
        let mut tables = Vec::new();
        tables.extend(
            sets.shared_tables
                .drain()
                .map(|oid| (LockMode::Shared, oid)),
        );
        tables.extend(
            sets.exclusive_tables
                .drain()
                .map(|oid| (LockMode::Exclusive, oid)),
        );
        tables.extend(
            sets.intention_shared_tables
                .drain()
                .map(|oid| (LockMode::IntentionShared, oid)),
        );
        tables.extend(
            sets.intention_exclusive_tables
                .drain()
                .map(|oid| (LockMode::IntentionExclusive, oid)),
        );
        tables.extend(
            sets.shared_intention_exclusive_tables
                .drain()
                .map(|oid| (LockMode::SharedIntentionExclusive, oid)),
        );
        (rows, tables)
    }
}
