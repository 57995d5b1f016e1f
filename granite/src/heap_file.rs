//! A table stored as a file of fixed-size heap pages.
use std::collections::VecDeque;
use std::fs::{create_dir_all, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::buffer_pool::BufferPool;
use crate::error::{DbError, DbResult};
use crate::failpoint;
use crate::page::HeapPage;
use crate::transaction::TransactionId;
use crate::tuple::{Tuple, TupleDesc};
use crate::{PageId, Permissions, TableId, PAGE_SIZE};

/// Reads and writes the pages of one table. Page `n` lives at byte offset
/// `n * PAGE_SIZE`.
#[derive(Debug)]
pub struct HeapFile {
    id: TableId,
    path: PathBuf,
    desc: Arc<TupleDesc>,
    file: Mutex<File>,
}

impl HeapFile {
    /// Opens the table file, creating it and its parent directories if they don't exist.
    pub fn open<P: AsRef<Path>>(path: P, desc: Arc<TupleDesc>) -> DbResult<Self> {
        let path_ref = path.as_ref();
        if let Some(parent) = path_ref.parent() {
            create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path_ref)?;
        let path = path_ref.canonicalize()?;
        let id = crc32fast::hash(path.to_string_lossy().as_bytes());
        debug!(table = id, path = %path.display(), bytes = file.metadata()?.len(), "opened heap file");

        Ok(Self {
            id,
            path,
            desc,
            file: Mutex::new(file),
        })
    }

    /// Stable for a given file: derived from its absolute path.
    pub fn id(&self) -> TableId {
        self.id
    }

    pub fn desc(&self) -> &Arc<TupleDesc> {
        &self.desc
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn num_pages(&self) -> DbResult<u32> {
        let len = self.file.lock().metadata()?.len();
        Ok(len.div_ceil(PAGE_SIZE as u64) as u32)
    }

    /// Reads a page from disk. Pages past the end of the file do not exist.
    pub fn read_page(&self, page_id: PageId) -> DbResult<HeapPage> {
        if page_id.table_id != self.id || page_id.page_no >= self.num_pages()? {
            return Err(DbError::NoSuchPage { page: page_id });
        }
        failpoint::maybe_fail(failpoint::HEAP_FILE_READ)?;

        let mut data = HeapPage::empty_page_data();
        {
            let mut file = self.file.lock();
            file.seek(SeekFrom::Start(page_id.page_no as u64 * PAGE_SIZE as u64))?;
            // a short last page reads as zero-padded
            let mut filled = 0;
            while filled < PAGE_SIZE {
                let n = file.read(&mut data[filled..])?;
                if n == 0 {
                    break;
                }
                filled += n;
            }
        }
        debug!(page = %page_id, "read page");
        HeapPage::new(page_id, self.desc.clone(), data)
    }

    /// Overwrites page `page_no` with `data` and syncs the file.
    pub fn write_page_data(&self, page_no: u32, data: &[u8]) -> DbResult<()> {
        if data.len() != PAGE_SIZE {
            return Err(DbError::Corrupt {
                detail: format!("page image of {} bytes, expected {PAGE_SIZE}", data.len()),
            });
        }
        failpoint::maybe_fail(failpoint::HEAP_FILE_WRITE)?;

        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(page_no as u64 * PAGE_SIZE as u64))?;
        file.write_all(data)?;
        file.sync_all()?;
        Ok(())
    }

    /// Writes `page` to disk and marks it clean. On failure the page keeps its
    /// dirty flag and before-image.
    pub fn write_page(&self, page: &mut HeapPage) -> DbResult<()> {
        if page.id().table_id != self.id {
            return Err(DbError::NoSuchPage { page: page.id() });
        }
        self.write_page_data(page.id().page_no, page.data())?;
        page.mark_clean();
        debug!(page = %page.id(), "wrote page");
        Ok(())
    }

    /// Appends an empty page to the file and returns its number.
    pub fn append_empty_page(&self) -> DbResult<u32> {
        failpoint::maybe_fail(failpoint::HEAP_FILE_WRITE)?;
        let mut file = self.file.lock();
        let len = file.metadata()?.len();
        let page_no = len.div_ceil(PAGE_SIZE as u64) as u32;
        file.seek(SeekFrom::Start(page_no as u64 * PAGE_SIZE as u64))?;
        file.write_all(&HeapPage::empty_page_data())?;
        file.sync_all()?;
        debug!(table = self.id, page_no, "appended empty page");
        Ok(page_no)
    }

    /// Adds `tuple` to the first page with a free slot, appending a page when
    /// every page is full. Sets the tuple's record id and returns the page
    /// that was modified.
    pub fn insert_tuple(
        &self,
        pool: &BufferPool,
        tid: TransactionId,
        tuple: &mut Tuple,
    ) -> DbResult<Vec<PageId>> {
        if **tuple.desc() != *self.desc {
            return Err(DbError::SchemaMismatch {
                detail: format!("tuple schema {} does not match {}", tuple.desc(), self.desc),
            });
        }

        for page_no in 0..self.num_pages()? {
            let pid = PageId::new(self.id, page_no);
            let held_before = pool.holds_lock(tid, pid);
            let has_room = {
                let guard = pool.get_page(tid, pid, Permissions::ReadOnly)?;
                let page = guard.read();
                page.num_empty_slots() > 0
            };
            if !has_room {
                // nothing was read that matters to the transaction
                if !held_before {
                    pool.release_page(tid, pid);
                }
                continue;
            }

            let guard = pool.get_page(tid, pid, Permissions::ReadWrite)?;
            let mut page = guard.write()?;
            match page.insert_tuple(tuple) {
                Ok(_) => {
                    page.mark_dirty(tid);
                    return Ok(vec![pid]);
                }
                Err(DbError::PageFull { .. }) => continue,
                Err(e) => return Err(e),
            }
        }

        // others may fill a new page before we lock it; append again then
        loop {
            let page_no = self.append_empty_page()?;
            let pid = PageId::new(self.id, page_no);
            let guard = pool.get_page(tid, pid, Permissions::ReadWrite)?;
            let mut page = guard.write()?;
            match page.insert_tuple(tuple) {
                Ok(_) => {
                    page.mark_dirty(tid);
                    return Ok(vec![pid]);
                }
                Err(DbError::PageFull { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Frees the slot named by the tuple's record id.
    pub fn delete_tuple(
        &self,
        pool: &BufferPool,
        tid: TransactionId,
        tuple: &Tuple,
    ) -> DbResult<PageId> {
        let rid = tuple.record_id().ok_or(DbError::MissingRecordId)?;
        if rid.page_id.table_id != self.id {
            return Err(DbError::NoSuchSlot {
                page: rid.page_id,
                slot: rid.slot,
            });
        }
        if rid.page_id.page_no >= self.num_pages()? {
            return Err(DbError::NoSuchPage { page: rid.page_id });
        }
        let guard = pool.get_page(tid, rid.page_id, Permissions::ReadWrite)?;
        let mut page = guard.write()?;
        page.delete_tuple(tuple)?;
        page.mark_dirty(tid);
        Ok(rid.page_id)
    }

    /// Scans the table under `tid`. The iterator starts closed.
    pub fn iterator(self: &Arc<Self>, pool: &Arc<BufferPool>, tid: TransactionId) -> HeapFileIterator {
        HeapFileIterator {
            file: self.clone(),
            pool: pool.clone(),
            tid,
            cursor: None,
        }
    }
}

/// Pull-based iteration over tuples. `next` returns `Ok(None)` at the end.
pub trait TupleIterator {
    fn open(&mut self) -> DbResult<()>;

    /// False at the end and on a closed iterator.
    fn has_next(&mut self) -> DbResult<bool>;

    fn next(&mut self) -> DbResult<Option<Tuple>>;

    /// Restarts from the first tuple.
    fn rewind(&mut self) -> DbResult<()>;

    fn close(&mut self);
}

#[derive(Debug, Default)]
struct Cursor {
    next_page: u32,
    buffered: VecDeque<Tuple>,
}

impl Cursor {
    /// Buffers the next non-empty page. Returns false past the last page.
    fn fill(&mut self, file: &HeapFile, pool: &BufferPool, tid: TransactionId) -> DbResult<bool> {
        while self.buffered.is_empty() {
            if self.next_page >= file.num_pages()? {
                return Ok(false);
            }
            let pid = PageId::new(file.id(), self.next_page);
            let guard = pool.get_page(tid, pid, Permissions::ReadOnly)?;
            self.buffered = guard.read().tuples()?.into();
            self.next_page += 1;
        }
        Ok(true)
    }
}

/// Walks a heap file page by page and slot by slot. Pages are fetched
/// through the buffer pool with shared locks, so they stay locked by the
/// transaction after the iterator moves on.
#[derive(Debug)]
pub struct HeapFileIterator {
    file: Arc<HeapFile>,
    pool: Arc<BufferPool>,
    tid: TransactionId,
    cursor: Option<Cursor>,
}

impl HeapFileIterator {
    pub fn open(&mut self) -> DbResult<()> {
        self.cursor = Some(Cursor::default());
        Ok(())
    }

    pub fn has_next(&mut self) -> DbResult<bool> {
        match self.cursor.as_mut() {
            Some(cursor) => cursor.fill(&self.file, &self.pool, self.tid),
            None => Ok(false),
        }
    }

    pub fn next(&mut self) -> DbResult<Option<Tuple>> {
        let cursor = self.cursor.as_mut().ok_or(DbError::IteratorClosed)?;
        if !cursor.fill(&self.file, &self.pool, self.tid)? {
            return Ok(None);
        }
        Ok(cursor.buffered.pop_front())
    }

    pub fn rewind(&mut self) -> DbResult<()> {
        match self.cursor.as_mut() {
            Some(cursor) => {
                *cursor = Cursor::default();
                Ok(())
            }
            None => Err(DbError::IteratorClosed),
        }
    }

    pub fn close(&mut self) {
        self.cursor = None;
    }

    pub fn is_open(&self) -> bool {
        self.cursor.is_some()
    }
}

impl TupleIterator for HeapFileIterator {
    fn open(&mut self) -> DbResult<()> {
        HeapFileIterator::open(self)
    }

    fn has_next(&mut self) -> DbResult<bool> {
        HeapFileIterator::has_next(self)
    }

    fn next(&mut self) -> DbResult<Option<Tuple>> {
        HeapFileIterator::next(self)
    }

    fn rewind(&mut self) -> DbResult<()> {
        HeapFileIterator::rewind(self)
    }

    fn close(&mut self) {
        HeapFileIterator::close(self)
    }
}

impl Iterator for HeapFileIterator {
    type Item = DbResult<Tuple>;

    /// Yields nothing once closed.
    fn next(&mut self) -> Option<Self::Item> {
        if !self.is_open() {
            return None;
        }
        HeapFileIterator::next(self).transpose()
    }
}
