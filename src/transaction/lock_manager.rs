use log::{trace, warn};
use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;

use crate::config::LockManagerConfig;
use crate::error::{AbortReason, BurrowDBError, BurrowDBResult};
use crate::storage::page::RecordId;
use crate::transaction::{
    IsolationLevel, TableOid, Transaction, TransactionId, TransactionState,
};
use dashmap::DashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    IntentionShared,
    IntentionExclusive,
    Shared,
    SharedIntentionExclusive,
    Exclusive,
}

#[derive(Debug, Clone)]
struct LockRequest {
    txn_id: TransactionId,
    mode: LockMode,
    granted: bool,
}

#[derive(Debug, Default)]
struct QueueState {
    requests: VecDeque<LockRequest>,
    // at most one transaction may be upgrading per queue
    upgrading: Option<TransactionId>,
}

#[derive(Debug, Default)]
struct LockRequestQueue {
    state: Mutex<QueueState>,
    cv: Condvar,
}

type RowKey = (TableOid, RecordId);

/// Table/row lock manager: per-resource FIFO queues with condition-variable
/// waits, single-upgrader queue-jumping upgrades, and a background thread
/// that breaks waits-for cycles by aborting their youngest member.
#[derive(Debug)]
pub struct LockManager {
    table_lock_map: Mutex<HashMap<TableOid, Arc<LockRequestQueue>>>,
    row_lock_map: Mutex<HashMap<RowKey, Arc<LockRequestQueue>>>,
    // transactions currently known to the lock manager; the detector aborts
    // victims through this table
    txn_registry: DashMap<TransactionId, Arc<Transaction>>,
    shutdown: Arc<AtomicBool>,
    detector_thread: Mutex<Option<thread::JoinHandle<()>>>,
    pub config: LockManagerConfig,
}

impl LockManager {
    pub fn new(config: LockManagerConfig) -> Arc<Self> {
        let manager = Arc::new(Self {
            table_lock_map: Mutex::new(HashMap::new()),
            row_lock_map: Mutex::new(HashMap::new()),
            txn_registry: DashMap::new(),
            shutdown: Arc::new(AtomicBool::new(false)),
            detector_thread: Mutex::new(None),
            config,
        });

        let weak: Weak<LockManager> = Arc::downgrade(&manager);
        let shutdown = manager.shutdown.clone();
        let interval = config.deadlock_detection_interval;
        let handle = thread::Builder::new()
            .name("deadlock-detector".to_string())
            .spawn(move || {
                trace!("deadlock detector started");
                loop {
                    thread::sleep(interval);
                    if shutdown.load(Ordering::Relaxed) {
                        break;
                    }
                    let Some(manager) = weak.upgrade() else {
                        break;
                    };
                    manager.run_cycle_detection();
                }
                trace!("deadlock detector stopped");
            })
            .expect("Failed to spawn deadlock detector thread");
        *manager.detector_thread.lock() = Some(handle);
        manager
    }

    /// Acquire a table lock. `Ok(true)` on grant, `Ok(false)` when the wait
    /// was broken by a deadlock abort; precondition violations move the
    /// transaction to Aborted and surface a typed error.
    pub fn lock_table(
        &self,
        txn: &Arc<Transaction>,
        mode: LockMode,
        oid: TableOid,
    ) -> BurrowDBResult<bool> {
        self.check_isolation_preconditions(txn, mode)?;
        self.txn_registry.insert(txn.id(), txn.clone());

        let queue = self.table_resource(oid);
        self.acquire(txn, mode, queue, LockTarget::Table(oid))
    }

    pub fn unlock_table(&self, txn: &Arc<Transaction>, oid: TableOid) -> BurrowDBResult<bool> {
        let queue = {
            let map = self.table_lock_map.lock();
            map.get(&oid).cloned()
        };
        let Some(queue) = queue else {
            return Err(self.abort_txn(txn, AbortReason::AttemptedUnlockButNoLockHeld));
        };

        let mut state = queue.state.lock();
        let Some(position) = state
            .requests
            .iter()
            .position(|r| r.txn_id == txn.id() && r.granted)
        else {
            drop(state);
            return Err(self.abort_txn(txn, AbortReason::AttemptedUnlockButNoLockHeld));
        };

        // A table lock may not leave while row locks below it remain.
        if txn.holds_row_locks_on(oid) {
            drop(state);
            return Err(self.abort_txn(txn, AbortReason::TableUnlockedBeforeRows));
        }

        let mode = state.requests[position].mode;
        self.apply_unlock_state_transition(txn, mode);
        txn.remove_table_lock(mode, oid);
        state.requests.remove(position);
        drop(state);
        queue.cv.notify_all();
        trace!("txn {} unlocked table {}", txn.id(), oid);
        Ok(true)
    }

    /// Acquire a row lock. Rows take only S or X and require a covering
    /// intention lock on the parent table.
    pub fn lock_row(
        &self,
        txn: &Arc<Transaction>,
        mode: LockMode,
        oid: TableOid,
        rid: RecordId,
    ) -> BurrowDBResult<bool> {
        if !matches!(mode, LockMode::Shared | LockMode::Exclusive) {
            return Err(self.abort_txn(txn, AbortReason::AttemptedIntentionLockOnRow));
        }

        let table_mode = txn.held_table_lock_mode(oid);
        let table_covers = match mode {
            LockMode::Exclusive => matches!(
                table_mode,
                Some(
                    LockMode::IntentionExclusive
                        | LockMode::Exclusive
                        | LockMode::SharedIntentionExclusive
                )
            ),
            LockMode::Shared => table_mode.is_some(),
            _ => false,
        };
        if !table_covers {
            return Err(self.abort_txn(txn, AbortReason::TableLockNotPresent));
        }

        self.check_isolation_preconditions(txn, mode)?;
        self.txn_registry.insert(txn.id(), txn.clone());

        let queue = self.row_resource(oid, rid);
        self.acquire(txn, mode, queue, LockTarget::Row(oid, rid))
    }

    pub fn unlock_row(
        &self,
        txn: &Arc<Transaction>,
        oid: TableOid,
        rid: RecordId,
        force: bool,
    ) -> BurrowDBResult<bool> {
        let queue = {
            let map = self.row_lock_map.lock();
            map.get(&(oid, rid)).cloned()
        };
        let Some(queue) = queue else {
            return Err(self.abort_txn(txn, AbortReason::AttemptedUnlockButNoLockHeld));
        };

        let mut state = queue.state.lock();
        let Some(position) = state
            .requests
            .iter()
            .position(|r| r.txn_id == txn.id() && r.granted)
        else {
            drop(state);
            return Err(self.abort_txn(txn, AbortReason::AttemptedUnlockButNoLockHeld));
        };

        let mode = state.requests[position].mode;
        if !force {
            self.apply_unlock_state_transition(txn, mode);
        }
        txn.remove_row_lock(mode, oid, rid);
        state.requests.remove(position);
        drop(state);
        queue.cv.notify_all();
        trace!("txn {} unlocked row {}:{}", txn.id(), oid, rid);
        Ok(true)
    }

    /// Release everything a finished transaction still holds, rows before
    /// tables, with no 2PL state transitions.
    pub(crate) fn release_all(&self, txn: &Transaction) {
        let (rows, tables) = txn.drain_all_locks();
        for (_, oid, rid) in rows {
            let queue = {
                let map = self.row_lock_map.lock();
                map.get(&(oid, rid)).cloned()
            };
            if let Some(queue) = queue {
                let mut state = queue.state.lock();
                state.requests.retain(|r| r.txn_id != txn.id());
                if state.upgrading == Some(txn.id()) {
                    state.upgrading = None;
                }
                drop(state);
                queue.cv.notify_all();
            }
        }
        for (_, oid) in tables {
            let queue = {
                let map = self.table_lock_map.lock();
                map.get(&oid).cloned()
            };
            if let Some(queue) = queue {
                let mut state = queue.state.lock();
                state.requests.retain(|r| r.txn_id != txn.id());
                if state.upgrading == Some(txn.id()) {
                    state.upgrading = None;
                }
                drop(state);
                queue.cv.notify_all();
            }
        }
        self.txn_registry.remove(&txn.id());
    }

    fn table_resource(&self, oid: TableOid) -> Arc<LockRequestQueue> {
        let mut map = self.table_lock_map.lock();
        map.entry(oid).or_default().clone()
    }

    fn row_resource(&self, oid: TableOid, rid: RecordId) -> Arc<LockRequestQueue> {
        let mut map = self.row_lock_map.lock();
        map.entry((oid, rid)).or_default().clone()
    }

    /// Isolation-level preconditions shared by table and row acquisition.
    fn check_isolation_preconditions(
        &self,
        txn: &Arc<Transaction>,
        mode: LockMode,
    ) -> BurrowDBResult<()> {
        match txn.isolation_level() {
            IsolationLevel::RepeatableRead => {
                if txn.state() == TransactionState::Shrinking {
                    return Err(self.abort_txn(txn, AbortReason::LockOnShrinking));
                }
            }
            IsolationLevel::ReadCommitted => {
                if txn.state() == TransactionState::Shrinking
                    && !matches!(mode, LockMode::Shared | LockMode::IntentionShared)
                {
                    return Err(self.abort_txn(txn, AbortReason::LockOnShrinking));
                }
            }
            IsolationLevel::ReadUncommitted => {
                if !matches!(mode, LockMode::Exclusive | LockMode::IntentionExclusive) {
                    return Err(
                        self.abort_txn(txn, AbortReason::LockSharedOnReadUncommitted)
                    );
                }
                if txn.state() == TransactionState::Shrinking {
                    return Err(self.abort_txn(txn, AbortReason::LockOnShrinking));
                }
            }
        }
        Ok(())
    }

    /// Enqueue, upgrade if the transaction already holds this resource, and
    /// wait for the grant.
    fn acquire(
        &self,
        txn: &Arc<Transaction>,
        mode: LockMode,
        queue: Arc<LockRequestQueue>,
        target: LockTarget,
    ) -> BurrowDBResult<bool> {
        let txn_id = txn.id();
        let mut state = queue.state.lock();

        let mut upgrading = false;
        if let Some(position) = state.requests.iter().position(|r| r.txn_id == txn_id) {
            let old_mode = state.requests[position].mode;
            if old_mode == mode {
                return Ok(true);
            }
            if state.upgrading.is_some() {
                drop(state);
                return Err(self.abort_txn(txn, AbortReason::UpgradeConflict));
            }
            if !can_upgrade(old_mode, mode) {
                drop(state);
                return Err(self.abort_txn(txn, AbortReason::IncompatibleUpgrade));
            }
            // Drop the old grant and reserve the upgrade slot; the new
            // request waits at the tail but jumps the line once compatible.
            state.requests.remove(position);
            self.remove_lock_bookkeeping(txn, old_mode, target);
            state.upgrading = Some(txn_id);
            upgrading = true;
        }

        state.requests.push_back(LockRequest {
            txn_id,
            mode,
            granted: false,
        });

        while !grant_allowed(&state, txn_id, mode) {
            queue.cv.wait(&mut state);
            if txn.state() == TransactionState::Aborted {
                // Woken as a deadlock victim: withdraw and tell the others.
                if state.upgrading == Some(txn_id) {
                    state.upgrading = None;
                }
                state.requests.retain(|r| r.txn_id != txn_id);
                drop(state);
                queue.cv.notify_all();
                warn!("txn {} unwound from {:?} after deadlock abort", txn_id, target);
                return Ok(false);
            }
        }

        if let Some(request) = state
            .requests
            .iter_mut()
            .find(|r| r.txn_id == txn_id && !r.granted)
        {
            request.granted = true;
        }
        if upgrading {
            state.upgrading = None;
        }
        drop(state);

        self.insert_lock_bookkeeping(txn, mode, target);
        trace!("txn {} granted {:?} on {:?}", txn_id, mode, target);
        Ok(true)
    }

    fn insert_lock_bookkeeping(&self, txn: &Transaction, mode: LockMode, target: LockTarget) {
        match target {
            LockTarget::Table(oid) => txn.insert_table_lock(mode, oid),
            LockTarget::Row(oid, rid) => txn.insert_row_lock(mode, oid, rid),
        }
    }

    fn remove_lock_bookkeeping(&self, txn: &Transaction, mode: LockMode, target: LockTarget) {
        match target {
            LockTarget::Table(oid) => txn.remove_table_lock(mode, oid),
            LockTarget::Row(oid, rid) => txn.remove_row_lock(mode, oid, rid),
        }
    }

    fn apply_unlock_state_transition(&self, txn: &Transaction, mode: LockMode) {
        if txn.state() != TransactionState::Growing {
            return;
        }
        match mode {
            LockMode::Shared => {
                if txn.isolation_level() == IsolationLevel::RepeatableRead {
                    txn.set_state(TransactionState::Shrinking);
                }
            }
            LockMode::Exclusive => {
                txn.set_state(TransactionState::Shrinking);
            }
            _ => {}
        }
    }

    fn abort_txn(&self, txn: &Transaction, reason: AbortReason) -> BurrowDBError {
        txn.set_state(TransactionState::Aborted);
        BurrowDBError::TransactionAbort {
            txn_id: txn.id(),
            reason,
        }
    }

    /// One deadlock-detection round: rebuild the waits-for graph from the
    /// live queues, then abort the youngest member of every cycle until the
    /// graph is acyclic.
    pub fn run_cycle_detection(&self) {
        let queues: Vec<Arc<LockRequestQueue>> = {
            let tables = self.table_lock_map.lock();
            let rows = self.row_lock_map.lock();
            tables.values().cloned().chain(rows.values().cloned()).collect()
        };

        // txn -> set of txns it waits for, plus the queues each txn sits in
        let mut graph: BTreeMap<TransactionId, BTreeSet<TransactionId>> = BTreeMap::new();
        let mut member_queues: HashMap<TransactionId, Vec<Arc<LockRequestQueue>>> =
            HashMap::new();
        for queue in &queues {
            let state = queue.state.lock();
            for waiter in state.requests.iter().filter(|r| !r.granted) {
                if self.txn_is_aborted(waiter.txn_id) {
                    continue;
                }
                member_queues
                    .entry(waiter.txn_id)
                    .or_default()
                    .push(queue.clone());
                for holder in state.requests.iter().filter(|r| r.granted) {
                    if holder.txn_id == waiter.txn_id || self.txn_is_aborted(holder.txn_id) {
                        continue;
                    }
                    graph.entry(waiter.txn_id).or_default().insert(holder.txn_id);
                }
            }
        }

        while let Some(victim) = find_cycle_victim(&graph) {
            warn!("deadlock detected, aborting youngest txn {}", victim);
            if let Some(txn) = self.txn_registry.get(&victim) {
                txn.set_state(TransactionState::Aborted);
            }
            graph.remove(&victim);
            for edges in graph.values_mut() {
                edges.remove(&victim);
            }
            if let Some(queues) = member_queues.get(&victim) {
                for queue in queues {
                    let _state = queue.state.lock();
                    queue.cv.notify_all();
                }
            }
        }
    }

    fn txn_is_aborted(&self, txn_id: TransactionId) -> bool {
        self.txn_registry
            .get(&txn_id)
            .map(|txn| txn.state() == TransactionState::Aborted)
            .unwrap_or(false)
    }
}

impl Drop for LockManager {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.detector_thread.lock().take() {
            let _ = handle.join();
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum LockTarget {
    Table(TableOid),
    Row(TableOid, RecordId),
}

/// Hierarchical lock compatibility matrix.
fn modes_compatible(held: LockMode, requested: LockMode) -> bool {
    match held {
        LockMode::IntentionShared => requested != LockMode::Exclusive,
        LockMode::IntentionExclusive => matches!(
            requested,
            LockMode::IntentionShared | LockMode::IntentionExclusive
        ),
        LockMode::Shared => matches!(
            requested,
            LockMode::IntentionShared | LockMode::Shared
        ),
        LockMode::SharedIntentionExclusive => requested == LockMode::IntentionShared,
        LockMode::Exclusive => false,
    }
}

fn can_upgrade(held: LockMode, requested: LockMode) -> bool {
    match held {
        LockMode::IntentionShared => requested != LockMode::IntentionShared,
        LockMode::Shared => matches!(
            requested,
            LockMode::SharedIntentionExclusive | LockMode::Exclusive
        ),
        LockMode::IntentionExclusive => matches!(
            requested,
            LockMode::SharedIntentionExclusive | LockMode::Exclusive
        ),
        LockMode::SharedIntentionExclusive => requested == LockMode::Exclusive,
        LockMode::Exclusive => false,
    }
}

/// A request is grantable iff it is compatible with every current holder,
/// no other upgrade is pending (an upgrader jumps the queue), and no earlier
/// waiter would be overtaken by an incompatible grant.
fn grant_allowed(state: &QueueState, txn_id: TransactionId, mode: LockMode) -> bool {
    for granted in state.requests.iter().filter(|r| r.granted) {
        if granted.txn_id == txn_id {
            continue;
        }
        if !modes_compatible(granted.mode, mode) {
            return false;
        }
    }

    if state.upgrading == Some(txn_id) {
        return true;
    }
    if state.upgrading.is_some() {
        return false;
    }

    for waiting in state.requests.iter().filter(|r| !r.granted) {
        if waiting.txn_id == txn_id {
            return true;
        }
        if !modes_compatible(waiting.mode, mode) {
            return false;
        }
    }
    false
}

/// DFS over the waits-for graph, nodes and children in ascending txn order.
/// Returns the youngest member of the first cycle found.
fn find_cycle_victim(
    graph: &BTreeMap<TransactionId, BTreeSet<TransactionId>>,
) -> Option<TransactionId> {
    fn dfs(
        graph: &BTreeMap<TransactionId, BTreeSet<TransactionId>>,
        node: TransactionId,
        path: &mut Vec<TransactionId>,
        visited: &mut HashSet<TransactionId>,
    ) -> Option<TransactionId> {
        visited.insert(node);
        path.push(node);
        if let Some(children) = graph.get(&node) {
            for &next in children {
                if let Some(position) = path.iter().position(|&n| n == next) {
                    // cycle = path[position..]
                    return path[position..].iter().copied().max();
                }
                if !visited.contains(&next) {
                    if let Some(victim) = dfs(graph, next, path, visited) {
                        return Some(victim);
                    }
                }
            }
        }
        path.pop();
        None
    }

    let mut visited = HashSet::new();
    for &start in graph.keys() {
        if visited.contains(&start) {
            continue;
        }
        let mut path = Vec::new();
        if let Some(victim) = dfs(graph, start, &mut path, &mut visited) {
            return Some(victim);
        }
    }
    None
}
