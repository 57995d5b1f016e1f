//! Error type shared by every component of the engine.

use std::io;

use thiserror::Error;

use crate::transaction::TransactionId;
use crate::PageId;

#[derive(Debug, Error)]
pub enum DbError {
    // === Concurrency ===
    /// Waiting for the lock would have closed a cycle in the wait-for graph.
    /// The requesting transaction is the victim and must be rolled back.
    #[error("deadlock: {tid} aborted while waiting for {page}")]
    Deadlock { tid: TransactionId, page: PageId },

    /// The transaction was aborted by another thread while it waited for a lock.
    #[error("{tid} was aborted while waiting for a lock")]
    TransactionAborted { tid: TransactionId },

    #[error("{tid} is not active")]
    TransactionNotActive { tid: TransactionId },

    // === Buffer pool ===
    #[error("buffer pool exhausted: all {capacity} cached pages are dirty or pinned")]
    PoolExhausted { capacity: usize },

    #[error("{page} was fetched read-only")]
    ReadOnlyAccess { page: PageId },

    // === Storage ===
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("no such page: {page}")]
    NoSuchPage { page: PageId },

    #[error("no tuple in slot {slot} of {page}")]
    NoSuchSlot { page: PageId, slot: u16 },

    #[error("tuple has no record id")]
    MissingRecordId,

    #[error("no free slot on {page}")]
    PageFull { page: PageId },

    #[error("corrupt data: {detail}")]
    Corrupt { detail: String },

    // === Schema ===
    #[error("no such table: {table}")]
    NoSuchTable { table: String },

    #[error("schema mismatch: {detail}")]
    SchemaMismatch { detail: String },

    #[error("string of {len} bytes exceeds the {max} byte field width")]
    StringTooLong { len: usize, max: usize },

    #[error("schema file line {line}: {detail}")]
    SchemaParse { line: usize, detail: String },

    // === Misc ===
    #[error("iterator is not open")]
    IteratorClosed,

    #[error("invalid configuration value {value:?} for {key}")]
    Config { key: String, value: String },
}

impl DbError {
    /// True for errors that end the transaction: the caller has to roll it
    /// back and may retry from the start.
    pub fn is_abort(&self) -> bool {
        matches!(
            self,
            DbError::Deadlock { .. } | DbError::TransactionAborted { .. }
        )
    }
}

pub type DbResult<T> = Result<T, DbError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_abort_classification() {
        let page = PageId::new(1, 0);
        let tid = TransactionId::from_raw(7);
        assert!(DbError::Deadlock { tid, page }.is_abort());
        assert!(DbError::TransactionAborted { tid }.is_abort());
        assert!(!DbError::PoolExhausted { capacity: 2 }.is_abort());
        assert!(!DbError::NoSuchPage { page }.is_abort());
    }

    #[test]
    fn test_messages_name_the_page() {
        let err = DbError::NoSuchSlot {
            page: PageId::new(3, 9),
            slot: 4,
        };
        assert_eq!(err.to_string(), "no tuple in slot 4 of page 3:9");
    }
}
