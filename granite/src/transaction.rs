//! Transaction management.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::buffer_pool::BufferPool;
use crate::error::{DbError, DbResult};

/// Identifies a transaction. Ids are handed out in increasing order and never
/// reused within one [`TransactionManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransactionId(u64);

impl TransactionId {
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tx {}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxStatus {
    Active,
    Completing,
}

#[derive(Debug, Default)]
struct TransactionManagerState {
    next_transaction_id: AtomicU64,
    transactions: Mutex<HashMap<TransactionId, TxStatus>>,
}

/// Vends transaction ids and tracks which ones are still live. Designed to be
/// shared across threads.
#[derive(Debug, Clone, Default)]
pub struct TransactionManager {
    state: Arc<TransactionManagerState>,
}

impl TransactionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Begins a new transaction and returns its ID.
    pub fn begin(&self) -> TransactionId {
        let tid = TransactionId(self.state.next_transaction_id.fetch_add(1, Ordering::SeqCst) + 1);
        self.state.transactions.lock().insert(tid, TxStatus::Active);
        debug!(%tid, "transaction started");
        tid
    }

    /// True while `tid` may still request pages.
    pub fn is_active(&self, tid: TransactionId) -> bool {
        self.state.transactions.lock().get(&tid) == Some(&TxStatus::Active)
    }

    /// Moves `tid` into completion. Fails if it already committed, aborted or
    /// is being completed by another caller.
    pub(crate) fn start_completion(&self, tid: TransactionId) -> DbResult<()> {
        let mut transactions = self.state.transactions.lock();
        match transactions.get_mut(&tid) {
            Some(status) if *status == TxStatus::Active => {
                *status = TxStatus::Completing;
                Ok(())
            }
            _ => Err(DbError::TransactionNotActive { tid }),
        }
    }

    /// Retires `tid` for good.
    pub(crate) fn retire(&self, tid: TransactionId) {
        self.state.transactions.lock().remove(&tid);
    }

    /// True when no transaction is running or completing.
    pub fn is_idle(&self) -> bool {
        self.state.transactions.lock().is_empty()
    }

    pub fn active_transactions(&self) -> Vec<TransactionId> {
        let mut active: Vec<_> = self
            .state
            .transactions
            .lock()
            .iter()
            .filter(|(_, status)| **status == TxStatus::Active)
            .map(|(tid, _)| *tid)
            .collect();
        active.sort();
        active
    }
}

/// A running transaction. Dropping it without calling [`commit`](Self::commit)
/// or [`abort`](Self::abort) aborts it.
pub struct Transaction {
    id: TransactionId,
    pool: Arc<BufferPool>,
    finished: bool,
}

impl Transaction {
    pub(crate) fn begin(pool: Arc<BufferPool>) -> Self {
        let id = pool.transactions().begin();
        Self {
            id,
            pool,
            finished: false,
        }
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn commit(mut self) -> DbResult<()> {
        self.finished = true;
        self.pool.transaction_complete(self.id, true)
    }

    pub fn abort(mut self) -> DbResult<()> {
        self.finished = true;
        self.pool.transaction_complete(self.id, false)
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("finished", &self.finished)
            .finish()
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        warn!(tid = %self.id, "transaction dropped without completing, aborting");
        if let Err(e) = self.pool.transaction_complete(self.id, false) {
            warn!(tid = %self.id, error = %e, "abort on drop failed");
        }
    }
}
