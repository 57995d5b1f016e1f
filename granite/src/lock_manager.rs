//! Manages page locks for strict two-phase locking.
//!
//! Every page has a [`LockQueue`]: the transactions holding it shared, the one
//! holding it exclusive (never both), and the requests waiting for it in
//! arrival order. Blocked requests add edges to a wait-for graph; a request
//! whose edges would close a cycle is refused with [`DbError::Deadlock`], so
//! the graph stays acyclic and the newest entrant is always the victim.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::error::{DbError, DbResult};
use crate::transaction::TransactionId;
use crate::{PageId, Permissions};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    Shared,
    Exclusive,
}

impl From<Permissions> for LockMode {
    fn from(perm: Permissions) -> Self {
        match perm {
            Permissions::ReadOnly => LockMode::Shared,
            Permissions::ReadWrite => LockMode::Exclusive,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct LockRequest {
    tx_id: TransactionId,
    mode: LockMode,
    /// Shared holder asking for exclusive. Upgrades queue ahead of new requests.
    upgrade: bool,
}

#[derive(Debug, Default)]
struct LockQueue {
    queue: VecDeque<LockRequest>,
    sharing: HashSet<TransactionId>,
    exclusive: Option<TransactionId>,
    cvar: Arc<Condvar>,
}

impl LockQueue {
    fn holds(&self, tx_id: TransactionId, mode: LockMode) -> bool {
        match mode {
            LockMode::Shared => self.sharing.contains(&tx_id) || self.exclusive == Some(tx_id),
            LockMode::Exclusive => self.exclusive == Some(tx_id),
        }
    }

    fn holds_any(&self, tx_id: TransactionId) -> bool {
        self.holds(tx_id, LockMode::Shared)
    }

    /// Returns a list of transaction IDs that are holding a lock that conflicts with the given request.
    fn get_conflicting_holders(&self, request: &LockRequest) -> Vec<TransactionId> {
        let mut holders = Vec::new();
        if let Some(ex_holder) = self.exclusive {
            if ex_holder != request.tx_id {
                holders.push(ex_holder);
            }
        }
        if request.mode == LockMode::Exclusive {
            holders.extend(self.sharing.iter().filter(|h| **h != request.tx_id));
        }
        holders
    }

    fn is_compatible(&self, request: &LockRequest) -> bool {
        self.get_conflicting_holders(request).is_empty()
    }

    /// Everything `queue[index]` is waiting on: conflicting holders plus the
    /// incompatible requests queued ahead of it.
    fn blockers(&self, index: usize) -> HashSet<TransactionId> {
        let request = &self.queue[index];
        let mut blockers: HashSet<_> = self.get_conflicting_holders(request).into_iter().collect();
        for ahead in self.queue.iter().take(index) {
            if ahead.tx_id != request.tx_id
                && (request.mode == LockMode::Exclusive || ahead.mode == LockMode::Exclusive)
            {
                blockers.insert(ahead.tx_id);
            }
        }
        blockers
    }

    fn grant(&mut self, request: LockRequest) {
        match request.mode {
            LockMode::Shared => {
                self.sharing.insert(request.tx_id);
            }
            LockMode::Exclusive => {
                self.sharing.remove(&request.tx_id);
                self.exclusive = Some(request.tx_id);
            }
        }
    }

    /// Grants the longest compatible prefix of the queue: every shared request
    /// up to the first conflict, or a single exclusive request at the head.
    fn grant_prefix(&mut self) -> Vec<TransactionId> {
        let mut granted = Vec::new();
        while let Some(front) = self.queue.front().copied() {
            if !self.is_compatible(&front) {
                break;
            }
            self.queue.pop_front();
            self.grant(front);
            granted.push(front.tx_id);
        }
        granted
    }

    fn unlock(&mut self, tx_id: TransactionId) -> bool {
        let mut changed = self.sharing.remove(&tx_id);
        if self.exclusive == Some(tx_id) {
            self.exclusive = None;
            changed = true;
        }
        changed
    }

    fn withdraw(&mut self, tx_id: TransactionId) -> bool {
        let before = self.queue.len();
        self.queue.retain(|req| req.tx_id != tx_id);
        self.queue.len() != before
    }

    fn is_queued(&self, tx_id: TransactionId) -> bool {
        self.queue.iter().any(|req| req.tx_id == tx_id)
    }

    fn is_idle(&self) -> bool {
        self.queue.is_empty() && self.sharing.is_empty() && self.exclusive.is_none()
    }
}

#[derive(Debug, Default)]
struct LockTable {
    queues: HashMap<PageId, LockQueue>,
    /// Pages each transaction holds any lock on.
    held: HashMap<TransactionId, HashSet<PageId>>,
    waits_for: HashMap<TransactionId, HashSet<TransactionId>>,
}

impl LockTable {
    /// Re-evaluates the waiters of `page_id` after its holders or queue
    /// changed: grants what can be granted, refreshes the wait-for edges of
    /// the rest and wakes every waiter so it can observe the outcome.
    fn grant_waiters(&mut self, page_id: PageId) {
        let Some(queue) = self.queues.get_mut(&page_id) else {
            return;
        };
        let granted = queue.grant_prefix();
        for tx_id in &granted {
            self.held.entry(*tx_id).or_default().insert(page_id);
            self.waits_for.remove(tx_id);
            debug!(tid = %tx_id, page = %page_id, "lock granted to waiter");
        }
        for index in 0..queue.queue.len() {
            let blockers = queue.blockers(index);
            self.waits_for.insert(queue.queue[index].tx_id, blockers);
        }
        queue.cvar.notify_all();
        if queue.is_idle() {
            self.queues.remove(&page_id);
        }
    }

    fn has_cycle_util(&self, start: TransactionId) -> bool {
        let mut visited = HashSet::new();
        let mut stack: Vec<TransactionId> = self
            .waits_for
            .get(&start)
            .map(|edges| edges.iter().copied().collect())
            .unwrap_or_default();
        while let Some(tx_id) = stack.pop() {
            if tx_id == start {
                return true;
            }
            if visited.insert(tx_id) {
                if let Some(edges) = self.waits_for.get(&tx_id) {
                    stack.extend(edges.iter().copied());
                }
            }
        }
        false
    }

    fn forget_waiter(&mut self, tx_id: TransactionId) {
        self.waits_for.remove(&tx_id);
        for edges in self.waits_for.values_mut() {
            edges.remove(&tx_id);
        }
    }
}

/// Holders of one page's lock at a point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LockSnapshot {
    pub shared: Vec<TransactionId>,
    pub exclusive: Option<TransactionId>,
}

#[derive(Debug)]
pub struct LockManager {
    table: Mutex<LockTable>,
    backoff_initial: Duration,
    backoff_max: Duration,
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LockManager {
    pub fn new() -> Self {
        Self::with_backoff(Duration::from_millis(1), Duration::from_millis(50))
    }

    /// A blocked request re-checks its state after `initial`, doubling the
    /// wait up to `max`, even if no release woke it.
    pub fn with_backoff(initial: Duration, max: Duration) -> Self {
        Self {
            table: Mutex::new(LockTable::default()),
            backoff_initial: initial,
            backoff_max: max.max(initial),
        }
    }

    /// Blocks until `tx_id` holds `page_id` in `mode` (or stronger).
    ///
    /// Fails with [`DbError::Deadlock`] when waiting would deadlock, and with
    /// [`DbError::TransactionAborted`] when the request was withdrawn by
    /// [`release_all`](Self::release_all) from another thread.
    pub fn acquire(&self, tx_id: TransactionId, page_id: PageId, mode: LockMode) -> DbResult<()> {
        let mut table = self.table.lock();

        let queue = table.queues.entry(page_id).or_default();
        if queue.holds(tx_id, mode) {
            return Ok(());
        }
        let upgrade = mode == LockMode::Exclusive && queue.sharing.contains(&tx_id);
        let request = LockRequest {
            tx_id,
            mode,
            upgrade,
        };
        if upgrade {
            let at = queue.queue.iter().take_while(|req| req.upgrade).count();
            queue.queue.insert(at, request);
        } else {
            queue.queue.push_back(request);
        }
        let cvar = queue.cvar.clone();
        table.grant_waiters(page_id);

        let mut backoff = self.backoff_initial;
        loop {
            let (granted, queued) = match table.queues.get(&page_id) {
                Some(queue) => (queue.holds(tx_id, mode), queue.is_queued(tx_id)),
                None => (false, false),
            };
            if granted {
                debug!(tid = %tx_id, page = %page_id, ?mode, "lock acquired");
                return Ok(());
            }
            if !queued {
                debug!(tid = %tx_id, page = %page_id, "lock request withdrawn");
                return Err(DbError::TransactionAborted { tid: tx_id });
            }

            if table.has_cycle_util(tx_id) {
                if let Some(queue) = table.queues.get_mut(&page_id) {
                    queue.withdraw(tx_id);
                }
                table.forget_waiter(tx_id);
                table.grant_waiters(page_id);
                warn!(tid = %tx_id, page = %page_id, ?mode, "deadlock detected, aborting requester");
                return Err(DbError::Deadlock {
                    tid: tx_id,
                    page: page_id,
                });
            }

            debug!(tid = %tx_id, page = %page_id, ?mode, ?backoff, "waiting for lock");
            cvar.wait_for(&mut table, backoff);
            backoff = (backoff * 2).min(self.backoff_max);
        }
    }

    /// Releases whatever lock `tx_id` holds on `page_id`.
    pub fn release(&self, tx_id: TransactionId, page_id: PageId) {
        let mut table = self.table.lock();
        let changed = table
            .queues
            .get_mut(&page_id)
            .is_some_and(|queue| queue.unlock(tx_id));
        if let Some(pages) = table.held.get_mut(&tx_id) {
            pages.remove(&page_id);
            if pages.is_empty() {
                table.held.remove(&tx_id);
            }
        }
        if changed {
            debug!(tid = %tx_id, page = %page_id, "lock released");
            table.grant_waiters(page_id);
        }
    }

    /// Releases every lock of `tx_id` and withdraws any request it has queued.
    pub fn release_all(&self, tx_id: TransactionId) {
        let mut table = self.table.lock();
        let mut touched: HashSet<PageId> = table.held.remove(&tx_id).unwrap_or_default();
        for (page_id, queue) in table.queues.iter_mut() {
            if queue.withdraw(tx_id) {
                touched.insert(*page_id);
            }
        }
        table.forget_waiter(tx_id);

        for page_id in &touched {
            if let Some(queue) = table.queues.get_mut(page_id) {
                queue.unlock(tx_id);
            }
            table.grant_waiters(*page_id);
        }
        debug!(tid = %tx_id, pages = touched.len(), "released all locks");
    }

    pub fn holds_lock(&self, tx_id: TransactionId, page_id: PageId) -> bool {
        self.table
            .lock()
            .queues
            .get(&page_id)
            .is_some_and(|queue| queue.holds_any(tx_id))
    }

    pub fn lock_holders(&self, page_id: PageId) -> LockSnapshot {
        let table = self.table.lock();
        match table.queues.get(&page_id) {
            Some(queue) => {
                let mut shared: Vec<_> = queue.sharing.iter().copied().collect();
                shared.sort();
                LockSnapshot {
                    shared,
                    exclusive: queue.exclusive,
                }
            }
            None => LockSnapshot::default(),
        }
    }

    /// Transactions waiting for `page_id`, in queue order.
    pub fn waiters(&self, page_id: PageId) -> Vec<TransactionId> {
        let table = self.table.lock();
        table
            .queues
            .get(&page_id)
            .map(|queue| queue.queue.iter().map(|req| req.tx_id).collect())
            .unwrap_or_default()
    }

    pub fn locked_pages(&self, tx_id: TransactionId) -> Vec<PageId> {
        let table = self.table.lock();
        let mut pages: Vec<_> = table
            .held
            .get(&tx_id)
            .map(|pages| pages.iter().copied().collect())
            .unwrap_or_default();
        pages.sort();
        pages
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;
    use std::time::Instant;

    fn tid(n: u64) -> TransactionId {
        TransactionId::from_raw(n)
    }

    const A: PageId = PageId::new(1, 0);
    const B: PageId = PageId::new(1, 1);

    fn wait_until(what: &str, cond: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn test_shared_locks_coexist() {
        let lm = LockManager::new();
        lm.acquire(tid(1), A, LockMode::Shared).unwrap();
        lm.acquire(tid(2), A, LockMode::Shared).unwrap();
        assert_eq!(
            lm.lock_holders(A),
            LockSnapshot {
                shared: vec![tid(1), tid(2)],
                exclusive: None
            }
        );
        // re-acquiring is a no-op
        lm.acquire(tid(1), A, LockMode::Shared).unwrap();
        assert!(lm.holds_lock(tid(1), A));
        assert!(!lm.holds_lock(tid(3), A));
    }

    #[test]
    fn test_exclusive_waits_for_shared_release() {
        let lm = Arc::new(LockManager::new());
        lm.acquire(tid(1), A, LockMode::Shared).unwrap();

        let acquired = Arc::new(AtomicBool::new(false));
        let handle = {
            let lm = lm.clone();
            let acquired = acquired.clone();
            thread::spawn(move || {
                lm.acquire(tid(2), A, LockMode::Exclusive).unwrap();
                acquired.store(true, Ordering::SeqCst);
            })
        };

        wait_until("tx 2 to queue", || lm.waiters(A) == vec![tid(2)]);
        assert!(!acquired.load(Ordering::SeqCst));

        lm.release(tid(1), A);
        handle.join().unwrap();
        assert!(acquired.load(Ordering::SeqCst));
        assert_eq!(lm.lock_holders(A).exclusive, Some(tid(2)));
        assert!(lm.lock_holders(A).shared.is_empty());
    }

    #[test]
    fn test_sole_holder_upgrades_immediately() {
        let lm = LockManager::new();
        lm.acquire(tid(1), A, LockMode::Shared).unwrap();
        lm.acquire(tid(1), A, LockMode::Exclusive).unwrap();
        assert_eq!(
            lm.lock_holders(A),
            LockSnapshot {
                shared: vec![],
                exclusive: Some(tid(1))
            }
        );
        // exclusive covers shared
        lm.acquire(tid(1), A, LockMode::Shared).unwrap();
        assert_eq!(lm.locked_pages(tid(1)), vec![A]);
    }

    #[test]
    fn test_upgrade_waits_for_other_reader() {
        let lm = Arc::new(LockManager::new());
        lm.acquire(tid(1), A, LockMode::Shared).unwrap();
        lm.acquire(tid(2), A, LockMode::Shared).unwrap();

        let handle = {
            let lm = lm.clone();
            thread::spawn(move || lm.acquire(tid(1), A, LockMode::Exclusive))
        };
        wait_until("upgrade to queue", || lm.waiters(A) == vec![tid(1)]);
        assert_eq!(lm.lock_holders(A).exclusive, None);

        lm.release_all(tid(2));
        handle.join().unwrap().unwrap();
        assert_eq!(lm.lock_holders(A).exclusive, Some(tid(1)));
    }

    #[test]
    fn test_two_way_deadlock_aborts_requester() {
        let lm = Arc::new(LockManager::new());
        lm.acquire(tid(1), A, LockMode::Exclusive).unwrap();
        lm.acquire(tid(2), B, LockMode::Exclusive).unwrap();

        let t1 = {
            let lm = lm.clone();
            thread::spawn(move || lm.acquire(tid(1), B, LockMode::Exclusive))
        };
        wait_until("tx 1 to wait on B", || lm.waiters(B) == vec![tid(1)]);

        let err = lm.acquire(tid(2), A, LockMode::Exclusive).unwrap_err();
        assert!(matches!(err, DbError::Deadlock { tid: t, page } if t == tid(2) && page == A));
        // the victim's request is gone, its existing locks are untouched
        assert!(lm.waiters(A).is_empty());
        assert_eq!(lm.lock_holders(B).exclusive, Some(tid(2)));

        lm.release_all(tid(2));
        t1.join().unwrap().unwrap();
        assert_eq!(lm.locked_pages(tid(1)), vec![A, B]);
    }

    #[test]
    fn test_upgrade_deadlock() {
        let lm = Arc::new(LockManager::new());
        lm.acquire(tid(1), A, LockMode::Shared).unwrap();
        lm.acquire(tid(2), A, LockMode::Shared).unwrap();

        let t1 = {
            let lm = lm.clone();
            thread::spawn(move || lm.acquire(tid(1), A, LockMode::Exclusive))
        };
        wait_until("tx 1 upgrade to queue", || lm.waiters(A) == vec![tid(1)]);

        assert!(matches!(
            lm.acquire(tid(2), A, LockMode::Exclusive),
            Err(DbError::Deadlock { .. })
        ));
        lm.release_all(tid(2));
        t1.join().unwrap().unwrap();
    }

    #[test]
    fn test_waiters_granted_in_arrival_order() {
        let lm = Arc::new(LockManager::new());
        lm.acquire(tid(1), A, LockMode::Exclusive).unwrap();

        let mut handles = Vec::new();
        for (n, mode) in [(2, LockMode::Shared), (3, LockMode::Exclusive), (4, LockMode::Shared)] {
            let lm2 = lm.clone();
            handles.push(thread::spawn(move || lm2.acquire(tid(n), A, mode)));
            wait_until("request to queue", || lm.waiters(A).contains(&tid(n)));
        }
        assert_eq!(lm.waiters(A), vec![tid(2), tid(3), tid(4)]);

        // tx 4 is compatible with tx 2 but must not overtake the writer
        lm.release_all(tid(1));
        wait_until("tx 2 granted", || lm.lock_holders(A).shared == vec![tid(2)]);
        assert_eq!(lm.waiters(A), vec![tid(3), tid(4)]);

        lm.release_all(tid(2));
        wait_until("tx 3 granted", || lm.lock_holders(A).exclusive == Some(tid(3)));
        lm.release_all(tid(3));
        wait_until("tx 4 granted", || lm.lock_holders(A).shared == vec![tid(4)]);

        for handle in handles {
            handle.join().unwrap().unwrap();
        }
    }

    #[test]
    fn test_release_all_withdraws_pending_request() {
        let lm = Arc::new(LockManager::new());
        lm.acquire(tid(1), A, LockMode::Exclusive).unwrap();
        let t2 = {
            let lm = lm.clone();
            thread::spawn(move || lm.acquire(tid(2), A, LockMode::Shared))
        };
        wait_until("tx 2 to queue", || lm.waiters(A) == vec![tid(2)]);

        lm.release_all(tid(2));
        let err = t2.join().unwrap().unwrap_err();
        assert!(matches!(err, DbError::TransactionAborted { .. }));
        assert_eq!(lm.lock_holders(A).exclusive, Some(tid(1)));
    }

    #[test]
    fn test_three_way_cycle() {
        let lm = Arc::new(LockManager::new());
        let c = PageId::new(1, 2);
        lm.acquire(tid(1), A, LockMode::Exclusive).unwrap();
        lm.acquire(tid(2), B, LockMode::Exclusive).unwrap();
        lm.acquire(tid(3), c, LockMode::Exclusive).unwrap();

        let t1 = {
            let lm = lm.clone();
            thread::spawn(move || lm.acquire(tid(1), B, LockMode::Shared))
        };
        wait_until("tx 1 waits on B", || lm.waiters(B) == vec![tid(1)]);
        let t2 = {
            let lm = lm.clone();
            thread::spawn(move || lm.acquire(tid(2), c, LockMode::Shared))
        };
        wait_until("tx 2 waits on C", || lm.waiters(c) == vec![tid(2)]);

        assert!(matches!(
            lm.acquire(tid(3), A, LockMode::Shared),
            Err(DbError::Deadlock { .. })
        ));
        lm.release_all(tid(3));
        t2.join().unwrap().unwrap();
        lm.release_all(tid(2));
        t1.join().unwrap().unwrap();
    }

    #[test]
    fn test_holders_never_conflict_under_contention() {
        let lm = Arc::new(LockManager::with_backoff(
            Duration::from_micros(200),
            Duration::from_millis(5),
        ));
        let pages = [A, B, PageId::new(1, 2)];
        let handles: Vec<_> = (1..=6u64)
            .map(|n| {
                let lm = lm.clone();
                thread::spawn(move || {
                    let mut deadlocks = 0;
                    for round in 0..30u64 {
                        let t = tid(n * 1000 + round);
                        for (i, page) in pages.iter().enumerate() {
                            let mode = if (n + round + i as u64) % 3 == 0 {
                                LockMode::Exclusive
                            } else {
                                LockMode::Shared
                            };
                            match lm.acquire(t, *page, mode) {
                                Ok(()) => {
                                    let snap = lm.lock_holders(*page);
                                    assert!(snap.shared.is_empty() || snap.exclusive.is_none());
                                    if mode == LockMode::Exclusive {
                                        assert_eq!(snap.exclusive, Some(t));
                                    }
                                }
                                Err(DbError::Deadlock { .. }) => {
                                    deadlocks += 1;
                                    break;
                                }
                                Err(e) => panic!("unexpected error: {e}"),
                            }
                        }
                        lm.release_all(t);
                    }
                    deadlocks
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        for page in pages {
            assert_eq!(lm.lock_holders(page), LockSnapshot::default());
        }
    }
}
