//! Lock manager: strict two-phase locking over record ids.
//!
//! Each resource carries a FIFO queue of lock requests and a condition
//! signal; a single manager-level mutex guards all tables. Locks are
//! held until transaction end (`unlock_all`), never released early.
//! There is no deadlock detection; an incompatible request blocks
//! until a conflicting holder releases.

use nimbus_common::page::RecordId;
use nimbus_common::types::TxnId;
use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// Lock compatibility modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

/// One entry in a resource's request queue.
#[derive(Debug)]
struct LockRequest {
    txn_id: TxnId,
    mode: LockMode,
    granted: bool,
}

struct LockRequestQueue {
    /// FIFO order of arrival.
    queue: Vec<LockRequest>,
    /// Waiters on this resource.
    cv: Arc<Condvar>,
}

impl LockRequestQueue {
    fn new() -> Self {
        Self {
            queue: Vec::new(),
            cv: Arc::new(Condvar::new()),
        }
    }
}

impl Default for LockRequestQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Default)]
struct LockTables {
    lock_table: HashMap<RecordId, LockRequestQueue>,
    /// Resources each transaction holds, for release at txn end.
    txn_locks: HashMap<TxnId, BTreeSet<RecordId>>,
}

/// Record-granular lock manager.
pub struct LockManager {
    latch: Mutex<LockTables>,
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LockManager {
    /// Creates an empty lock manager.
    pub fn new() -> Self {
        Self {
            latch: Mutex::new(LockTables::default()),
        }
    }

    /// Acquires a shared lock, blocking while another transaction
    /// holds a granted exclusive lock on the resource.
    ///
    /// A transaction that already holds any granted lock on the
    /// resource succeeds immediately.
    pub fn lock_shared(&self, txn_id: TxnId, rid: RecordId) -> bool {
        let mut tables = self.latch.lock();

        let queue = tables.lock_table.entry(rid).or_default();
        if queue.queue.iter().any(|r| r.txn_id == txn_id && r.granted) {
            return true;
        }

        queue.queue.push(LockRequest {
            txn_id,
            mode: LockMode::Shared,
            granted: false,
        });
        let cv = queue.cv.clone();

        loop {
            let queue = tables
                .lock_table
                .get(&rid)
                .expect("queue exists while our request is in it");
            let blocked = queue
                .queue
                .iter()
                .any(|r| r.granted && r.mode == LockMode::Exclusive && r.txn_id != txn_id);
            if !blocked {
                break;
            }
            cv.wait(&mut tables);
        }

        let queue = tables.lock_table.get_mut(&rid).expect("queue exists");
        if let Some(req) = queue
            .queue
            .iter_mut()
            .find(|r| r.txn_id == txn_id && !r.granted && r.mode == LockMode::Shared)
        {
            req.granted = true;
        }
        tables.txn_locks.entry(txn_id).or_default().insert(rid);
        true
    }

    /// Acquires an exclusive lock, blocking while any other
    /// transaction holds a granted lock on the resource.
    ///
    /// The acquiring transaction's own granted shared lock does not
    /// block this path, so it subsumes an upgrade.
    pub fn lock_exclusive(&self, txn_id: TxnId, rid: RecordId) -> bool {
        let mut tables = self.latch.lock();

        let queue = tables.lock_table.entry(rid).or_default();
        if queue
            .queue
            .iter()
            .any(|r| r.txn_id == txn_id && r.granted && r.mode == LockMode::Exclusive)
        {
            return true;
        }

        queue.queue.push(LockRequest {
            txn_id,
            mode: LockMode::Exclusive,
            granted: false,
        });
        let cv = queue.cv.clone();

        loop {
            let queue = tables
                .lock_table
                .get(&rid)
                .expect("queue exists while our request is in it");
            let blocked = queue
                .queue
                .iter()
                .any(|r| r.granted && r.txn_id != txn_id);
            if !blocked {
                break;
            }
            cv.wait(&mut tables);
        }

        let queue = tables.lock_table.get_mut(&rid).expect("queue exists");
        if let Some(req) = queue
            .queue
            .iter_mut()
            .find(|r| r.txn_id == txn_id && !r.granted && r.mode == LockMode::Exclusive)
        {
            req.granted = true;
        }
        tables.txn_locks.entry(txn_id).or_default().insert(rid);
        true
    }

    /// Upgrades a granted shared lock to exclusive in place.
    ///
    /// Returns false if the transaction holds no granted lock on the
    /// resource; returns true immediately if it is already exclusive.
    pub fn lock_upgrade(&self, txn_id: TxnId, rid: RecordId) -> bool {
        let mut tables = self.latch.lock();

        let Some(queue) = tables.lock_table.get(&rid) else {
            return false;
        };
        let Some(pos) = queue
            .queue
            .iter()
            .position(|r| r.txn_id == txn_id && r.granted)
        else {
            return false;
        };
        if queue.queue[pos].mode == LockMode::Exclusive {
            return true;
        }
        let cv = queue.cv.clone();

        loop {
            let queue = tables.lock_table.get(&rid).expect("queue exists");
            let blocked = queue
                .queue
                .iter()
                .any(|r| r.granted && r.txn_id != txn_id);
            if !blocked {
                break;
            }
            cv.wait(&mut tables);
        }

        let queue = tables.lock_table.get_mut(&rid).expect("queue exists");
        if let Some(req) = queue
            .queue
            .iter_mut()
            .find(|r| r.txn_id == txn_id && r.granted)
        {
            req.mode = LockMode::Exclusive;
        }
        true
    }

    /// Releases every lock held by a transaction, waking waiters on
    /// each touched resource and dropping queues that become empty.
    pub fn unlock_all(&self, txn_id: TxnId) {
        let mut tables = self.latch.lock();

        let Some(rids) = tables.txn_locks.remove(&txn_id) else {
            return;
        };

        for rid in rids {
            if let Some(queue) = tables.lock_table.get_mut(&rid) {
                queue.queue.retain(|r| r.txn_id != txn_id);
                queue.cv.notify_all();
                if queue.queue.is_empty() {
                    tables.lock_table.remove(&rid);
                }
            }
        }
    }

    /// Returns true if the transaction appears anywhere in the lock
    /// tables.
    pub fn holds_locks(&self, txn_id: TxnId) -> bool {
        let tables = self.latch.lock();
        tables.txn_locks.contains_key(&txn_id)
            || tables
                .lock_table
                .values()
                .any(|q| q.queue.iter().any(|r| r.txn_id == txn_id))
    }
}
