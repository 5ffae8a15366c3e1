use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use log::debug;
use parking_lot::{Condvar, Mutex};

use crate::common::types::{Rid, TxnId};
use crate::transaction::concurrency::transaction::{
    AbortReason, IsolationLevel, Transaction, TransactionError, TransactionState,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LockMode {
    Shared,
    Exclusive,
}

struct LockRequest {
    txn: Arc<Transaction>,
    mode: LockMode,
    granted: bool,
}

#[derive(Default)]
struct RequestQueue {
    requests: VecDeque<LockRequest>,
    /// Transaction currently upgrading shared to exclusive, if any.
    upgrading: Option<TxnId>,
}

#[derive(Default)]
struct RidQueue {
    queue: Mutex<RequestQueue>,
    cv: Condvar,
}

/// Record-level lock manager: strict two-phase locking with wound-wait
/// deadlock prevention.
///
/// Each record id owns a FIFO request queue with its own condition
/// variable. A new request wounds every younger conflicting request
/// ahead of it, so an older transaction never waits behind a younger
/// conflicting one and no wait cycle can form.
#[derive(Default)]
pub struct LockManager {
    lock_table: Mutex<HashMap<Rid, Arc<RidQueue>>>,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire a shared lock, blocking until granted. Returns Ok(false)
    /// without waiting if the transaction is already finished.
    pub fn lock_shared(&self, txn: &Arc<Transaction>, rid: Rid) -> Result<bool, TransactionError> {
        if txn.is_shared_locked(rid) || txn.is_exclusive_locked(rid) {
            return Ok(true);
        }
        match txn.state() {
            TransactionState::Aborted | TransactionState::Committed => return Ok(false),
            TransactionState::Shrinking => {
                return Err(Self::abort(txn, AbortReason::LockOnShrinking));
            }
            TransactionState::Growing => {}
        }
        if txn.isolation_level() == IsolationLevel::ReadUncommitted {
            return Err(Self::abort(txn, AbortReason::SharedLockOnReadUncommitted));
        }

        let queue = self.rid_queue(rid);
        let mut q = queue.queue.lock();
        q.requests.push_back(LockRequest {
            txn: Arc::clone(txn),
            mode: LockMode::Shared,
            granted: false,
        });
        if Self::wound_younger(&mut q, txn.id(), LockMode::Shared) {
            queue.cv.notify_all();
        }

        while Self::need_wait(&q, txn.id()) {
            queue.cv.wait(&mut q);
            if txn.state() == TransactionState::Aborted {
                return Err(TransactionError::Abort {
                    txn_id: txn.id(),
                    reason: AbortReason::Deadlock,
                });
            }
        }
        Self::grant(&mut q, txn.id());
        txn.add_shared_lock(rid);
        Ok(true)
    }

    /// Acquire an exclusive lock, blocking until granted. A transaction
    /// already holding the shared lock is routed to an upgrade.
    pub fn lock_exclusive(
        &self,
        txn: &Arc<Transaction>,
        rid: Rid,
    ) -> Result<bool, TransactionError> {
        if txn.is_exclusive_locked(rid) {
            return Ok(true);
        }
        if txn.is_shared_locked(rid) {
            return self.lock_upgrade(txn, rid);
        }
        match txn.state() {
            TransactionState::Aborted | TransactionState::Committed => return Ok(false),
            TransactionState::Shrinking => {
                return Err(Self::abort(txn, AbortReason::LockOnShrinking));
            }
            TransactionState::Growing => {}
        }

        let queue = self.rid_queue(rid);
        let mut q = queue.queue.lock();
        q.requests.push_back(LockRequest {
            txn: Arc::clone(txn),
            mode: LockMode::Exclusive,
            granted: false,
        });
        if Self::wound_younger(&mut q, txn.id(), LockMode::Exclusive) {
            queue.cv.notify_all();
        }

        while Self::need_wait(&q, txn.id()) {
            queue.cv.wait(&mut q);
            if txn.state() == TransactionState::Aborted {
                return Err(TransactionError::Abort {
                    txn_id: txn.id(),
                    reason: AbortReason::Deadlock,
                });
            }
        }
        Self::grant(&mut q, txn.id());
        txn.add_exclusive_lock(rid);
        Ok(true)
    }

    /// Upgrade a held shared lock to exclusive. Only one transaction may
    /// upgrade per record at a time; a second upgrader is aborted with
    /// an upgrade conflict.
    pub fn lock_upgrade(
        &self,
        txn: &Arc<Transaction>,
        rid: Rid,
    ) -> Result<bool, TransactionError> {
        if txn.is_exclusive_locked(rid) {
            return Ok(true);
        }
        if !txn.is_shared_locked(rid) {
            return Ok(false);
        }
        match txn.state() {
            TransactionState::Aborted | TransactionState::Committed => return Ok(false),
            TransactionState::Shrinking => {
                return Err(Self::abort(txn, AbortReason::LockOnShrinking));
            }
            TransactionState::Growing => {}
        }

        let queue = self.rid_queue(rid);
        let mut q = queue.queue.lock();
        if q.upgrading.is_some() {
            drop(q);
            return Err(Self::abort(txn, AbortReason::UpgradeConflict));
        }
        q.upgrading = Some(txn.id());

        // Requeue the shared entry as an ungranted exclusive request
        // just before the first waiter, preserving FIFO among waiters.
        let pos = q
            .requests
            .iter()
            .position(|r| r.txn.id() == txn.id())
            .expect("upgrading transaction has no queue entry");
        let mut request = q.requests.remove(pos).expect("request position vanished");
        request.mode = LockMode::Exclusive;
        request.granted = false;
        let dest = q
            .requests
            .iter()
            .position(|r| !r.granted)
            .unwrap_or(q.requests.len());
        q.requests.insert(dest, request);
        txn.remove_shared_lock(rid);

        if Self::wound_younger(&mut q, txn.id(), LockMode::Exclusive) {
            queue.cv.notify_all();
        }

        while Self::need_wait(&q, txn.id()) {
            queue.cv.wait(&mut q);
            if txn.state() == TransactionState::Aborted {
                q.upgrading = None;
                queue.cv.notify_all();
                return Err(TransactionError::Abort {
                    txn_id: txn.id(),
                    reason: AbortReason::Deadlock,
                });
            }
        }
        Self::grant(&mut q, txn.id());
        q.upgrading = None;
        txn.add_exclusive_lock(rid);
        Ok(true)
    }

    /// Release the lock held on a record. At repeatable-read isolation
    /// the transaction enters its shrinking phase.
    pub fn unlock(&self, txn: &Arc<Transaction>, rid: Rid) -> bool {
        if !txn.is_shared_locked(rid) && !txn.is_exclusive_locked(rid) {
            return false;
        }
        if txn.isolation_level() == IsolationLevel::RepeatableRead
            && txn.state() == TransactionState::Growing
        {
            txn.set_state(TransactionState::Shrinking);
        }

        let queue = self.rid_queue(rid);
        let mut q = queue.queue.lock();
        if let Some(pos) = q.requests.iter().position(|r| r.txn.id() == txn.id()) {
            q.requests.remove(pos);
        }
        txn.remove_locks(rid);
        queue.cv.notify_all();
        true
    }

    /// Release every lock the transaction still holds (commit/abort).
    pub fn release_all(&self, txn: &Arc<Transaction>) {
        for rid in txn.locked_rids() {
            self.unlock(txn, rid);
        }
    }

    /// Take a shared lock unless the isolation level reads uncommitted
    /// data anyway.
    pub fn lock_shared_if_needed(
        &self,
        txn: &Arc<Transaction>,
        rid: Rid,
    ) -> Result<bool, TransactionError> {
        if txn.isolation_level() == IsolationLevel::ReadUncommitted {
            return Ok(true);
        }
        self.lock_shared(txn, rid)
    }

    /// Take an exclusive lock, upgrading if a shared lock is held.
    pub fn lock_exclusive_if_needed(
        &self,
        txn: &Arc<Transaction>,
        rid: Rid,
    ) -> Result<bool, TransactionError> {
        if txn.is_shared_locked(rid) {
            return self.lock_upgrade(txn, rid);
        }
        self.lock_exclusive(txn, rid)
    }

    /// Drop a shared lock right after the read at read-committed
    /// isolation; other levels keep it until commit.
    pub fn unlock_shared_if_needed(&self, txn: &Arc<Transaction>, rid: Rid) -> bool {
        if txn.isolation_level() == IsolationLevel::ReadCommitted && txn.is_shared_locked(rid) {
            return self.unlock(txn, rid);
        }
        true
    }

    fn rid_queue(&self, rid: Rid) -> Arc<RidQueue> {
        let mut table = self.lock_table.lock();
        Arc::clone(table.entry(rid).or_default())
    }

    fn abort(txn: &Arc<Transaction>, reason: AbortReason) -> TransactionError {
        txn.set_state(TransactionState::Aborted);
        TransactionError::Abort {
            txn_id: txn.id(),
            reason,
        }
    }

    /// Whether the request of `txn_id` must keep waiting. A shared
    /// request waits on any earlier exclusive request; an exclusive
    /// request waits unless it is at the front of the queue.
    fn need_wait(q: &RequestQueue, txn_id: TxnId) -> bool {
        let request = q
            .requests
            .iter()
            .find(|r| r.txn.id() == txn_id)
            .expect("waiting request missing from its queue");
        match request.mode {
            LockMode::Shared => {
                for r in &q.requests {
                    if r.mode == LockMode::Exclusive {
                        return true;
                    }
                    if r.txn.id() == txn_id {
                        return false;
                    }
                }
                unreachable!("request scan passed its own entry");
            }
            LockMode::Exclusive => q
                .requests
                .front()
                .map(|r| r.txn.id())
                .expect("empty queue while waiting")
                != txn_id,
        }
    }

    /// Wound-wait: abort and dequeue every younger transaction ahead of
    /// the new request that conflicts with it. Returns true if anyone
    /// was wounded.
    fn wound_younger(q: &mut RequestQueue, new_txn_id: TxnId, new_mode: LockMode) -> bool {
        let mut wounded = false;
        let mut i = 0;
        while i < q.requests.len() {
            if q.requests[i].txn.id() == new_txn_id {
                break;
            }
            let conflicts =
                new_mode == LockMode::Exclusive || q.requests[i].mode == LockMode::Exclusive;
            if conflicts && new_txn_id < q.requests[i].txn.id() {
                let victim = q.requests.remove(i).expect("victim position vanished");
                victim.txn.set_state(TransactionState::Aborted);
                debug!("txn {} wounded txn {}", new_txn_id, victim.txn.id());
                wounded = true;
            } else {
                i += 1;
            }
        }
        wounded
    }

    fn grant(q: &mut RequestQueue, txn_id: TxnId) {
        let request = q
            .requests
            .iter_mut()
            .find(|r| r.txn.id() == txn_id)
            .expect("granted request missing from its queue");
        request.granted = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn txn(id: TxnId, level: IsolationLevel) -> Arc<Transaction> {
        Arc::new(Transaction::new(id, level))
    }

    #[test]
    fn relocking_a_held_rid_is_a_no_op() {
        let lm = LockManager::new();
        let t = txn(1, IsolationLevel::RepeatableRead);
        let r = Rid::new(1, 1);

        assert!(lm.lock_shared(&t, r).unwrap());
        assert!(lm.lock_shared(&t, r).unwrap());
        assert!(t.is_shared_locked(r));

        // Exclusive over a held exclusive is also a no-op.
        let t2 = txn(2, IsolationLevel::RepeatableRead);
        let r2 = Rid::new(1, 2);
        assert!(lm.lock_exclusive(&t2, r2).unwrap());
        assert!(lm.lock_exclusive(&t2, r2).unwrap());
    }

    #[test]
    fn unlock_without_a_lock_returns_false() {
        let lm = LockManager::new();
        let t = txn(1, IsolationLevel::RepeatableRead);
        assert!(!lm.unlock(&t, Rid::new(9, 9)));
    }

    #[test]
    fn finished_transactions_cannot_lock() {
        let lm = LockManager::new();
        let r = Rid::new(2, 1);

        let t = txn(1, IsolationLevel::RepeatableRead);
        t.set_state(TransactionState::Aborted);
        assert!(!lm.lock_shared(&t, r).unwrap());
        assert!(!lm.lock_exclusive(&t, r).unwrap());

        let t = txn(2, IsolationLevel::RepeatableRead);
        t.set_state(TransactionState::Committed);
        assert!(!lm.lock_shared(&t, r).unwrap());
    }

    #[test]
    fn upgrade_requires_a_shared_lock() {
        let lm = LockManager::new();
        let t = txn(1, IsolationLevel::RepeatableRead);
        let r = Rid::new(3, 1);
        assert!(!lm.lock_upgrade(&t, r).unwrap());

        assert!(lm.lock_shared(&t, r).unwrap());
        assert!(lm.lock_upgrade(&t, r).unwrap());
        assert!(t.is_exclusive_locked(r));
        assert!(!t.is_shared_locked(r));
        // Upgrading again is a no-op.
        assert!(lm.lock_upgrade(&t, r).unwrap());
    }

    #[test]
    fn exclusive_if_needed_routes_through_upgrade() {
        let lm = LockManager::new();
        let t = txn(1, IsolationLevel::RepeatableRead);
        let r = Rid::new(4, 1);

        assert!(lm.lock_shared(&t, r).unwrap());
        assert!(lm.lock_exclusive_if_needed(&t, r).unwrap());
        assert!(t.is_exclusive_locked(r));
    }

    #[test]
    fn release_all_empties_both_lock_sets() {
        let lm = LockManager::new();
        let t = txn(1, IsolationLevel::ReadCommitted);
        let r1 = Rid::new(5, 1);
        let r2 = Rid::new(5, 2);

        assert!(lm.lock_shared(&t, r1).unwrap());
        assert!(lm.lock_exclusive(&t, r2).unwrap());
        lm.release_all(&t);
        assert!(t.locked_rids().is_empty());
    }
}
