//! Transaction manager: id allocation and lifecycle.
//!
//! Two-phase locking discipline: a transaction acquires locks while
//! GROWING, and releases them all at commit/abort time through the
//! lock manager (`unlock_all`), passing through SHRINKING on the way
//! to its terminal state.

use crate::lock::LockManager;
use log::debug;
use nimbus_common::types::TxnId;
use nimbus_common::{NimbusError, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// Lifecycle states of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Acquiring locks.
    Growing,
    /// Releasing locks at transaction end.
    Shrinking,
    Committed,
    Aborted,
}

/// A registered transaction.
#[derive(Debug, Clone, Copy)]
pub struct Transaction {
    pub txn_id: TxnId,
    pub state: TransactionState,
}

/// Coordinates begin/commit/abort and delegates lock release.
pub struct TransactionManager {
    lock_manager: Arc<LockManager>,
    next_txn_id: AtomicI64,
    txns: Mutex<HashMap<TxnId, Transaction>>,
}

impl TransactionManager {
    /// Creates a transaction manager over the given lock manager.
    pub fn new(lock_manager: Arc<LockManager>) -> Self {
        Self {
            lock_manager,
            next_txn_id: AtomicI64::new(0),
            txns: Mutex::new(HashMap::new()),
        }
    }

    /// Begins a new transaction in the GROWING state.
    pub fn begin(&self) -> TxnId {
        let txn_id = self.next_txn_id.fetch_add(1, Ordering::SeqCst);
        self.txns.lock().insert(
            txn_id,
            Transaction {
                txn_id,
                state: TransactionState::Growing,
            },
        );
        debug!("txn {} begin", txn_id);
        txn_id
    }

    /// Commits a transaction, releasing all of its locks.
    pub fn commit(&self, txn_id: TxnId) -> Result<()> {
        self.finish(txn_id, TransactionState::Committed)
    }

    /// Aborts a transaction, releasing all of its locks.
    pub fn abort(&self, txn_id: TxnId) -> Result<()> {
        self.finish(txn_id, TransactionState::Aborted)
    }

    fn finish(&self, txn_id: TxnId, terminal: TransactionState) -> Result<()> {
        {
            let mut txns = self.txns.lock();
            let txn = txns
                .get_mut(&txn_id)
                .ok_or(NimbusError::TransactionNotFound(txn_id))?;
            txn.state = TransactionState::Shrinking;
        }

        self.lock_manager.unlock_all(txn_id);

        let mut txns = self.txns.lock();
        if let Some(txn) = txns.get_mut(&txn_id) {
            txn.state = terminal;
        }
        debug!(
            "txn {} {}",
            txn_id,
            if terminal == TransactionState::Committed {
                "committed"
            } else {
                "aborted"
            }
        );
        Ok(())
    }

    /// Looks up a transaction by id.
    pub fn get(&self, txn_id: TxnId) -> Option<Transaction> {
        self.txns.lock().get(&txn_id).copied()
    }

    /// Returns the lock manager this transaction manager delegates to.
    pub fn lock_manager(&self) -> &Arc<LockManager> {
        &self.lock_manager
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nimbus_common::page::{PageId, RecordId};

    fn create_test_manager() -> (TransactionManager, Arc<LockManager>) {
        let lm = Arc::new(LockManager::new());
        let tm = TransactionManager::new(lm.clone());
        (tm, lm)
    }

    #[test]
    fn test_begin_allocates_monotonic_ids() {
        let (tm, _lm) = create_test_manager();

        assert_eq!(tm.begin(), 0);
        assert_eq!(tm.begin(), 1);
        assert_eq!(tm.begin(), 2);
    }

    #[test]
    fn test_begin_registers_growing() {
        let (tm, _lm) = create_test_manager();

        let txn = tm.begin();
        let t = tm.get(txn).unwrap();
        assert_eq!(t.txn_id, txn);
        assert_eq!(t.state, TransactionState::Growing);
    }

    #[test]
    fn test_commit_releases_locks() {
        let (tm, lm) = create_test_manager();

        let txn = tm.begin();
        let r1 = RecordId::new(PageId(1), 0);
        let r2 = RecordId::new(PageId(1), 1);
        assert!(lm.lock_shared(txn, r1));
        assert!(lm.lock_exclusive(txn, r2));

        tm.commit(txn).unwrap();

        assert_eq!(tm.get(txn).unwrap().state, TransactionState::Committed);
        assert!(!lm.holds_locks(txn));
    }

    #[test]
    fn test_abort_releases_locks() {
        let (tm, lm) = create_test_manager();

        let txn = tm.begin();
        let rid = RecordId::new(PageId(2), 0);
        assert!(lm.lock_exclusive(txn, rid));

        tm.abort(txn).unwrap();

        assert_eq!(tm.get(txn).unwrap().state, TransactionState::Aborted);
        assert!(!lm.holds_locks(txn));
    }

    #[test]
    fn test_commit_unknown_txn_fails() {
        let (tm, _lm) = create_test_manager();
        assert!(matches!(
            tm.commit(999),
            Err(NimbusError::TransactionNotFound(999))
        ));
    }

    #[test]
    fn test_get_unknown_txn() {
        let (tm, _lm) = create_test_manager();
        assert!(tm.get(7).is_none());
    }
}
