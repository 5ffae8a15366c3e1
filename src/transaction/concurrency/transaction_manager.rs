use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::common::types::TxnId;
use crate::transaction::concurrency::lock_manager::LockManager;
use crate::transaction::concurrency::transaction::{
    IsolationLevel, Transaction, TransactionState,
};

/// Transaction manager: creates and tracks transactions, and releases
/// their locks at commit or abort (strict two-phase locking).
pub struct TransactionManager {
    next_txn_id: AtomicU32,
    lock_manager: Arc<LockManager>,
    active_transactions: Mutex<HashMap<TxnId, Arc<Transaction>>>,
}

impl TransactionManager {
    pub fn new(lock_manager: Arc<LockManager>) -> Self {
        Self {
            next_txn_id: AtomicU32::new(1),
            lock_manager,
            active_transactions: Mutex::new(HashMap::new()),
        }
    }

    pub fn lock_manager(&self) -> &Arc<LockManager> {
        &self.lock_manager
    }

    /// Begin a new transaction. Ids are monotonically increasing, so a
    /// smaller id always means an older transaction.
    pub fn begin(&self, isolation_level: IsolationLevel) -> Arc<Transaction> {
        let txn_id = self.next_txn_id.fetch_add(1, Ordering::SeqCst);
        let txn = Arc::new(Transaction::new(txn_id, isolation_level));
        self.active_transactions
            .lock()
            .insert(txn_id, Arc::clone(&txn));
        txn
    }

    /// Commit: release all locks and retire the transaction. Returns
    /// false if the transaction was already aborted (it is cleaned up
    /// as an abort instead).
    pub fn commit(&self, txn: &Arc<Transaction>) -> bool {
        if txn.state() == TransactionState::Aborted {
            self.abort(txn);
            return false;
        }
        txn.set_state(TransactionState::Committed);
        self.lock_manager.release_all(txn);
        self.active_transactions.lock().remove(&txn.id());
        true
    }

    /// Abort: mark aborted, release all locks and retire the
    /// transaction.
    pub fn abort(&self, txn: &Arc<Transaction>) {
        txn.set_state(TransactionState::Aborted);
        self.lock_manager.release_all(txn);
        self.active_transactions.lock().remove(&txn.id());
    }

    pub fn get_transaction(&self, txn_id: TxnId) -> Option<Arc<Transaction>> {
        self.active_transactions.lock().get(&txn_id).cloned()
    }

    pub fn active_transaction_ids(&self) -> Vec<TxnId> {
        self.active_transactions.lock().keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::types::Rid;

    fn test_manager() -> TransactionManager {
        TransactionManager::new(Arc::new(LockManager::new()))
    }

    #[test]
    fn ids_are_monotonically_increasing() {
        let tm = test_manager();
        let t1 = tm.begin(IsolationLevel::ReadCommitted);
        let t2 = tm.begin(IsolationLevel::RepeatableRead);
        assert_eq!(t1.id(), 1);
        assert_eq!(t2.id(), 2);
        assert_eq!(t1.state(), TransactionState::Growing);
    }

    #[test]
    fn commit_retires_the_transaction_and_its_locks() {
        let tm = test_manager();
        let r = Rid::new(1, 1);

        let txn = tm.begin(IsolationLevel::RepeatableRead);
        assert!(tm.lock_manager().lock_exclusive(&txn, r).unwrap());
        assert!(tm.get_transaction(txn.id()).is_some());

        assert!(tm.commit(&txn));
        assert_eq!(txn.state(), TransactionState::Committed);
        assert!(txn.locked_rids().is_empty());
        assert!(tm.get_transaction(txn.id()).is_none());
    }

    #[test]
    fn committing_an_aborted_transaction_fails() {
        let tm = test_manager();
        let txn = tm.begin(IsolationLevel::ReadCommitted);
        txn.set_state(TransactionState::Aborted);
        assert!(!tm.commit(&txn));
        assert_eq!(txn.state(), TransactionState::Aborted);
        assert!(tm.get_transaction(txn.id()).is_none());
    }

    #[test]
    fn abort_releases_locks() {
        let tm = test_manager();
        let r = Rid::new(2, 1);

        let txn = tm.begin(IsolationLevel::RepeatableRead);
        assert!(tm.lock_manager().lock_shared(&txn, r).unwrap());
        tm.abort(&txn);
        assert_eq!(txn.state(), TransactionState::Aborted);
        assert!(txn.locked_rids().is_empty());
        assert!(tm.active_transaction_ids().is_empty());
    }
}
