pub mod buffer_pool;

pub mod catalog;

pub mod config;

pub mod database;

pub mod error;

pub mod failpoint;

pub mod heap_file;

pub mod image_log;

pub mod lock_manager;

pub mod page;

pub mod transaction;

pub mod tuple;

use std::fmt;

/// Bytes per page, header included.
pub const PAGE_SIZE: usize = 4096;

/// Default number of pages cached by a buffer pool.
pub const DEFAULT_PAGES: usize = 50;

pub type TableId = u32;

/// Identifies a page: the table it belongs to and its position in that
/// table's file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PageId {
    pub table_id: TableId,
    pub page_no: u32,
}

impl PageId {
    pub const fn new(table_id: TableId, page_no: u32) -> Self {
        Self { table_id, page_no }
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "page {}:{}", self.table_id, self.page_no)
    }
}

/// Location of a tuple: its page and slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RecordId {
    pub page_id: PageId,
    pub slot: u16,
}

impl RecordId {
    pub const fn new(page_id: PageId, slot: u16) -> Self {
        Self { page_id, slot }
    }
}

/// Access requested for a page. Read-only maps to a shared lock, read-write
/// to an exclusive one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Permissions {
    ReadOnly,
    ReadWrite,
}

pub use buffer_pool::{BufferPool, PageGuard};
pub use catalog::Catalog;
pub use config::EngineConfig;
pub use database::Database;
pub use error::{DbError, DbResult};
pub use heap_file::{HeapFile, HeapFileIterator, TupleIterator};
pub use lock_manager::{LockManager, LockMode};
pub use page::HeapPage;
pub use transaction::{Transaction, TransactionId, TransactionManager};
pub use tuple::{Field, FieldType, Tuple, TupleDesc};
