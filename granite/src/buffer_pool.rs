//! Manages the buffer pool, a bounded cache of heap pages shared by all
//! transactions.
//!
//! Every page access goes through [`BufferPool::get_page`], which first takes
//! the page lock for the transaction and then returns the cached page, reading
//! it from its heap file on a miss. The pool never writes a page on eviction:
//! only clean pages that nobody has pinned can be evicted, so changes of a
//! running transaction reach the disk only when it commits.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info, warn};

use crate::catalog::Catalog;
use crate::error::{DbError, DbResult};
use crate::image_log::ImageLog;
use crate::lock_manager::LockManager;
use crate::page::HeapPage;
use crate::transaction::{TransactionId, TransactionManager};
use crate::tuple::Tuple;
use crate::{PageId, Permissions, TableId};

/// A cached page and the number of guards pinning it.
#[derive(Debug)]
struct CachedPage {
    page: RwLock<HeapPage>,
    pins: AtomicUsize,
}

impl CachedPage {
    fn new(page: HeapPage) -> Self {
        Self {
            page: RwLock::new(page),
            pins: AtomicUsize::new(0),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HeapPage> {
        self.page.read()
    }

    fn write(&self) -> RwLockWriteGuard<'_, HeapPage> {
        self.page.write()
    }

    fn is_pinned(&self) -> bool {
        self.pins.load(Ordering::Acquire) > 0
    }
}

type Frame = Arc<CachedPage>;

/// A page handed out by the pool. The page stays pinned, and so cannot be
/// evicted, while the guard is alive. Other handles the pool keeps internally
/// never pin.
///
/// Page latches taken through [`read`](Self::read) and [`write`](Self::write)
/// must be dropped before calling back into the pool.
#[derive(Debug)]
pub struct PageGuard {
    page_id: PageId,
    perm: Permissions,
    frame: Frame,
}

impl PageGuard {
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    pub fn permissions(&self) -> Permissions {
        self.perm
    }

    pub fn read(&self) -> RwLockReadGuard<'_, HeapPage> {
        self.frame.read()
    }

    pub fn write(&self) -> DbResult<RwLockWriteGuard<'_, HeapPage>> {
        match self.perm {
            Permissions::ReadWrite => Ok(self.frame.write()),
            Permissions::ReadOnly => Err(DbError::ReadOnlyAccess { page: self.page_id }),
        }
    }
}

impl Drop for PageGuard {
    fn drop(&mut self) {
        self.frame.pins.fetch_sub(1, Ordering::AcqRel);
    }
}

#[derive(Debug, Default)]
struct PoolState {
    frames: HashMap<PageId, Frame>,
    /// Least recently used first.
    lru: VecDeque<PageId>,
    /// Slots reserved by reads in flight.
    loading: usize,
}

impl PoolState {
    fn touch(&mut self, page_id: PageId) {
        self.forget(page_id);
        self.lru.push_back(page_id);
    }

    fn forget(&mut self, page_id: PageId) {
        if let Some(pos) = self.lru.iter().position(|p| *p == page_id) {
            self.lru.remove(pos);
        }
    }
}

#[derive(Debug)]
pub struct BufferPool {
    capacity: usize,
    catalog: Arc<Catalog>,
    lock_manager: Arc<LockManager>,
    transactions: TransactionManager,
    image_log: Option<Mutex<ImageLog>>,
    state: Mutex<PoolState>,
}

impl BufferPool {
    /// A pool with its own lock manager and transaction manager and no image log.
    pub fn new(capacity: usize, catalog: Arc<Catalog>) -> Self {
        Self::with_parts(
            capacity,
            catalog,
            Arc::new(LockManager::new()),
            TransactionManager::new(),
            None,
        )
    }

    pub fn with_parts(
        capacity: usize,
        catalog: Arc<Catalog>,
        lock_manager: Arc<LockManager>,
        transactions: TransactionManager,
        image_log: Option<ImageLog>,
    ) -> Self {
        Self {
            capacity,
            catalog,
            lock_manager,
            transactions,
            image_log: image_log.map(Mutex::new),
            state: Mutex::new(PoolState::default()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of cached pages.
    pub fn len(&self) -> usize {
        self.state.lock().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_cached(&self, page_id: PageId) -> bool {
        self.state.lock().frames.contains_key(&page_id)
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    pub fn lock_manager(&self) -> &Arc<LockManager> {
        &self.lock_manager
    }

    pub fn transactions(&self) -> &TransactionManager {
        &self.transactions
    }

    fn ensure_active(&self, tid: TransactionId) -> DbResult<()> {
        if self.transactions.is_active(tid) {
            Ok(())
        } else {
            Err(DbError::TransactionNotActive { tid })
        }
    }

    /// Locks `page_id` for `tid` according to `perm` and returns the page.
    ///
    /// Blocks while another transaction holds a conflicting lock. Fails with
    /// [`DbError::Deadlock`] if waiting would deadlock and with
    /// [`DbError::PoolExhausted`] if the page is not cached and no cached page
    /// can be evicted. The lock is kept in either case.
    pub fn get_page(
        &self,
        tid: TransactionId,
        page_id: PageId,
        perm: Permissions,
    ) -> DbResult<PageGuard> {
        self.ensure_active(tid)?;
        self.lock_manager.acquire(tid, page_id, perm.into())?;
        // completion may have released this transaction's locks while it queued
        if !self.transactions.is_active(tid) {
            self.lock_manager.release(tid, page_id);
            return Err(DbError::TransactionNotActive { tid });
        }
        let frame = self.fetch(page_id)?;
        Ok(PageGuard {
            page_id,
            perm,
            frame,
        })
    }

    /// Returns the cached page, pinned. Pins are taken under the state lock so
    /// eviction never sees a page half handed out.
    fn fetch(&self, page_id: PageId) -> DbResult<Frame> {
        {
            let mut state = self.state.lock();
            if let Some(frame) = state.frames.get(&page_id).cloned() {
                frame.pins.fetch_add(1, Ordering::AcqRel);
                state.touch(page_id);
                return Ok(frame);
            }
            if state.frames.len() + state.loading >= self.capacity {
                self.evict_page(&mut state)?;
            }
            state.loading += 1;
        }

        let loaded = self
            .catalog
            .heap_file(page_id.table_id)
            .and_then(|file| file.read_page(page_id));

        let mut state = self.state.lock();
        state.loading -= 1;
        let page = loaded?;
        // a concurrent reader may have loaded it first
        let frame = state
            .frames
            .entry(page_id)
            .or_insert_with(|| Arc::new(CachedPage::new(page)))
            .clone();
        frame.pins.fetch_add(1, Ordering::AcqRel);
        state.touch(page_id);
        debug!(page = %page_id, cached = state.frames.len(), "loaded page");
        Ok(frame)
    }

    /// Drops the least recently used page that is clean and not pinned.
    fn evict_page(&self, state: &mut PoolState) -> DbResult<()> {
        let victim = state.lru.iter().copied().find(|page_id| {
            state.frames.get(page_id).is_some_and(|frame| {
                !frame.is_pinned() && frame.page.try_read().is_some_and(|page| !page.is_dirty())
            })
        });
        match victim {
            Some(page_id) => {
                state.frames.remove(&page_id);
                state.forget(page_id);
                debug!(page = %page_id, "evicted page");
                Ok(())
            }
            None => {
                warn!(capacity = self.capacity, "no clean unpinned page to evict");
                Err(DbError::PoolExhausted {
                    capacity: self.capacity,
                })
            }
        }
    }

    /// Releases the lock on a page before the transaction ends.
    ///
    /// This breaks two-phase locking. It is only safe when the transaction
    /// read nothing from the page that its result depends on.
    pub fn release_page(&self, tid: TransactionId, page_id: PageId) {
        self.lock_manager.release(tid, page_id);
    }

    pub fn holds_lock(&self, tid: TransactionId, page_id: PageId) -> bool {
        self.lock_manager.holds_lock(tid, page_id)
    }

    fn cached_frames(&self) -> Vec<(PageId, Frame)> {
        let state = self.state.lock();
        state
            .frames
            .iter()
            .map(|(page_id, frame)| (*page_id, frame.clone()))
            .collect()
    }

    fn dirty_frames(&self, tid: TransactionId) -> Vec<(PageId, Frame)> {
        let mut frames: Vec<_> = self
            .cached_frames()
            .into_iter()
            .filter(|(_, frame)| frame.read().dirtier() == Some(tid))
            .collect();
        frames.sort_by_key(|(page_id, _)| *page_id);
        frames
    }

    /// Pages currently dirtied by `tid`, in page order.
    pub fn dirtied_pages(&self, tid: TransactionId) -> Vec<PageId> {
        self.dirty_frames(tid)
            .into_iter()
            .map(|(page_id, _)| page_id)
            .collect()
    }

    /// Writes the page to disk if it is cached and dirty, and marks it clean.
    pub fn flush_page(&self, page_id: PageId) -> DbResult<()> {
        let frame = self.state.lock().frames.get(&page_id).cloned();
        match frame {
            Some(frame) => self.flush_frame(page_id, &frame),
            None => Ok(()),
        }
    }

    fn flush_frame(&self, page_id: PageId, frame: &Frame) -> DbResult<()> {
        let mut page = frame.write();
        if !page.is_dirty() {
            return Ok(());
        }
        self.catalog.heap_file(page_id.table_id)?.write_page(&mut page)
    }

    /// Flushes every page dirtied by `tid`.
    pub fn flush_pages(&self, tid: TransactionId) -> DbResult<()> {
        for (page_id, frame) in self.dirty_frames(tid) {
            self.flush_frame(page_id, &frame)?;
        }
        Ok(())
    }

    /// Flushes every dirty page.
    ///
    /// Writing pages of running transactions gives up the no-steal guarantee:
    /// their changes reach the disk and an abort can no longer undo them there.
    pub fn flush_all_pages(&self) -> DbResult<()> {
        for (page_id, frame) in self.cached_frames() {
            self.flush_frame(page_id, &frame)?;
        }
        Ok(())
    }

    /// Removes a page from the cache without writing it.
    pub fn discard_page(&self, page_id: PageId) {
        let mut state = self.state.lock();
        if state.frames.remove(&page_id).is_some() {
            state.forget(page_id);
            debug!(page = %page_id, "discarded page");
        }
    }

    /// Commits or aborts `tid`, releases all its locks and retires it.
    ///
    /// On commit the pages dirtied by `tid` are written to disk. If a write
    /// fails the transaction is rolled back instead and the error returned.
    /// On abort the pages are restored in the cache; nothing is written.
    pub fn transaction_complete(&self, tid: TransactionId, commit: bool) -> DbResult<()> {
        self.transactions.start_completion(tid)?;
        let result = if commit {
            self.commit_pages(tid)
        } else {
            self.abort_pages(tid)
        };
        self.lock_manager.release_all(tid);
        self.transactions.retire(tid);
        self.checkpoint_if_idle();

        match &result {
            Ok(()) => info!(%tid, commit, "transaction complete"),
            Err(e) => warn!(%tid, error = %e, "transaction rolled back"),
        }
        result
    }

    /// Empties the image log once no transaction is live. Every page of a
    /// committed transaction is already on disk by then, so recovery has
    /// nothing left to undo.
    fn checkpoint_if_idle(&self) {
        let Some(log) = &self.image_log else {
            return;
        };
        let mut log = log.lock();
        // checked under the log lock: a committer appends only while holding it
        if !self.transactions.is_idle() {
            return;
        }
        match log.truncate() {
            Ok(()) => debug!("image log checkpointed"),
            Err(e) => warn!(error = %e, "image log checkpoint failed"),
        }
    }

    fn with_log(&self, f: impl FnOnce(&mut ImageLog) -> DbResult<()>) -> DbResult<()> {
        match &self.image_log {
            Some(log) => f(&mut log.lock()),
            None => Ok(()),
        }
    }

    fn commit_pages(&self, tid: TransactionId) -> DbResult<()> {
        let pages = self.dirty_frames(tid);

        let logged = self.with_log(|log| {
            for (page_id, frame) in &pages {
                let page = frame.read();
                let before = page.before_image_data().unwrap_or(page.data());
                log.log_update(tid, *page_id, before, page.data())?;
            }
            Ok(())
        });
        if let Err(e) = logged {
            return Err(self.fail_commit(tid, &pages, 0, e));
        }

        for (done, (page_id, frame)) in pages.iter().enumerate() {
            let page = frame.read();
            let written = self
                .catalog
                .heap_file(page_id.table_id)
                .and_then(|file| file.write_page_data(page_id.page_no, page.data()));
            drop(page);
            if let Err(e) = written {
                // the failed write may have reached the disk in part
                return Err(self.fail_commit(tid, &pages, done + 1, e));
            }
        }

        if let Err(e) = self.with_log(|log| log.log_commit(tid)) {
            return Err(self.fail_commit(tid, &pages, pages.len(), e));
        }
        for (_, frame) in &pages {
            frame.write().mark_clean();
        }
        debug!(%tid, pages = pages.len(), "committed pages");
        Ok(())
    }

    /// Undoes a commit that failed after the first `written` of `pages` were
    /// written, wholly or in part.
    fn fail_commit(
        &self,
        tid: TransactionId,
        pages: &[(PageId, Frame)],
        written: usize,
        err: DbError,
    ) -> DbError {
        for (page_id, frame) in &pages[..written] {
            let page = frame.read();
            let Some(before) = page.before_image_data() else {
                continue;
            };
            let restored = self
                .catalog
                .heap_file(page_id.table_id)
                .and_then(|file| file.write_page_data(page_id.page_no, before));
            if let Err(e) = restored {
                warn!(%tid, page = %page_id, error = %e, "failed to restore before-image on disk");
            }
        }
        for (_, frame) in pages {
            frame.write().rollback();
        }
        if let Err(e) = self.with_log(|log| log.log_abort(tid)) {
            warn!(%tid, error = %e, "failed to log abort");
        }
        err
    }

    fn abort_pages(&self, tid: TransactionId) -> DbResult<()> {
        let pages = self.dirty_frames(tid);
        for (_, frame) in &pages {
            frame.write().rollback();
        }
        debug!(%tid, pages = pages.len(), "restored before-images");
        self.with_log(|log| log.log_abort(tid))
    }

    /// Inserts `tuple` into table `table_id` on behalf of `tid`. Returns the
    /// pages that were modified.
    pub fn insert_tuple(
        &self,
        tid: TransactionId,
        table_id: TableId,
        tuple: &mut Tuple,
    ) -> DbResult<Vec<PageId>> {
        self.ensure_active(tid)?;
        self.catalog.heap_file(table_id)?.insert_tuple(self, tid, tuple)
    }

    /// Deletes `tuple`, located by its record id, on behalf of `tid`.
    pub fn delete_tuple(&self, tid: TransactionId, tuple: &Tuple) -> DbResult<PageId> {
        self.ensure_active(tid)?;
        let rid = tuple.record_id().ok_or(DbError::MissingRecordId)?;
        self.catalog
            .heap_file(rid.page_id.table_id)?
            .delete_tuple(self, tid, tuple)
    }
}
