//! The before/after-image log.
//!
//! Records are appended and synced one at a time:
//!
//! ```text
//! [total_len: u32][tid: u64][crc32: u32][body]
//! body = 1 table:u32 page:u32 before:[u8; PAGE_SIZE] after:[u8; PAGE_SIZE]   update
//!      | 2                                                                    commit
//!      | 3                                                                    abort
//! ```
//!
//! All integers are big-endian. The checksum covers `total_len`, `tid` and the
//! body.

use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use bytes::{Buf, BufMut, BytesMut};
use crc32fast::Hasher;
use tracing::{info, warn};

use crate::catalog::Catalog;
use crate::error::{DbError, DbResult};
use crate::failpoint;
use crate::transaction::TransactionId;
use crate::{PageId, PAGE_SIZE};

const HEADER_LEN: usize = 4 + 8 + 4;

const KIND_UPDATE: u8 = 1;
const KIND_COMMIT: u8 = 2;
const KIND_ABORT: u8 = 3;

const UPDATE_BODY_LEN: usize = 1 + 4 + 4 + 2 * PAGE_SIZE;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogBody {
    Update {
        page: PageId,
        before: Vec<u8>,
        after: Vec<u8>,
    },
    Commit,
    Abort,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub tid: TransactionId,
    pub body: LogBody,
}

#[derive(Debug)]
pub struct ImageLog {
    path: PathBuf,
    file: File,
}

impl ImageLog {
    pub fn open<P: AsRef<Path>>(path: P) -> DbResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .create(true)
            .append(true)
            .open(&path)?;
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn log_update(
        &mut self,
        tid: TransactionId,
        page: PageId,
        before: &[u8],
        after: &[u8],
    ) -> DbResult<()> {
        if before.len() != PAGE_SIZE || after.len() != PAGE_SIZE {
            return Err(DbError::Corrupt {
                detail: format!("page images for {page} must be {PAGE_SIZE} bytes"),
            });
        }
        let mut body = BytesMut::with_capacity(UPDATE_BODY_LEN);
        body.put_u8(KIND_UPDATE);
        body.put_u32(page.table_id);
        body.put_u32(page.page_no);
        body.put_slice(before);
        body.put_slice(after);
        self.append(tid, &body)
    }

    pub fn log_commit(&mut self, tid: TransactionId) -> DbResult<()> {
        self.append(tid, &[KIND_COMMIT])
    }

    pub fn log_abort(&mut self, tid: TransactionId) -> DbResult<()> {
        self.append(tid, &[KIND_ABORT])
    }

    fn append(&mut self, tid: TransactionId, body: &[u8]) -> DbResult<()> {
        failpoint::maybe_fail(failpoint::IMAGE_LOG_APPEND)?;

        let total_len = (HEADER_LEN + body.len()) as u32;
        let mut record = BytesMut::with_capacity(total_len as usize);
        record.put_u32(total_len);
        record.put_u64(tid.as_u64());
        record.put_u32(checksum(total_len, tid.as_u64(), body));
        record.put_slice(body);

        self.file.write_all(&record)?;
        self.file.sync_all()?;
        Ok(())
    }

    /// Reads every complete record. A record cut short at the end of the file
    /// is ignored; a checksum mismatch anywhere else is corruption.
    pub fn records(&mut self) -> DbResult<Vec<LogRecord>> {
        let mut raw = Vec::new();
        self.file.seek(SeekFrom::Start(0))?;
        self.file.read_to_end(&mut raw)?;

        let mut buf = raw.as_slice();
        let mut records = Vec::new();
        while buf.len() >= HEADER_LEN {
            let offset = raw.len() - buf.len();
            let mut header = &buf[..HEADER_LEN];
            let total_len = header.get_u32();
            let tid = header.get_u64();
            let crc = header.get_u32();

            if (total_len as usize) < HEADER_LEN + 1 {
                return Err(DbError::Corrupt {
                    detail: format!("log record at {offset} has length {total_len}"),
                });
            }
            if buf.len() < total_len as usize {
                warn!(offset, "ignoring torn record at end of image log");
                break;
            }
            let body = &buf[HEADER_LEN..total_len as usize];
            if checksum(total_len, tid, body) != crc {
                return Err(DbError::Corrupt {
                    detail: format!("checksum mismatch in log record at {offset}"),
                });
            }
            records.push(LogRecord {
                tid: TransactionId::from_raw(tid),
                body: decode_body(body, offset)?,
            });
            buf.advance(total_len as usize);
        }
        Ok(records)
    }

    /// Undoes transactions that logged updates but neither committed nor
    /// aborted, by writing their before-images back to the heap files. The
    /// log is emptied afterwards. Returns the number of pages restored.
    pub fn recover(&mut self, catalog: &Catalog) -> DbResult<usize> {
        let records = self.records()?;
        let finished: HashSet<TransactionId> = records
            .iter()
            .filter(|r| matches!(r.body, LogBody::Commit | LogBody::Abort))
            .map(|r| r.tid)
            .collect();

        let mut restored = 0;
        let mut losers = HashSet::new();
        // latest first, so the oldest before-image of a page wins
        for record in records.iter().rev() {
            if finished.contains(&record.tid) {
                continue;
            }
            if let LogBody::Update { page, before, .. } = &record.body {
                catalog.heap_file(page.table_id)?.write_page_data(page.page_no, before)?;
                losers.insert(record.tid);
                restored += 1;
            }
        }
        self.truncate()?;
        info!(
            records = records.len(),
            transactions = losers.len(),
            pages = restored,
            "image log recovery finished"
        );
        Ok(restored)
    }

    /// Drops every record. Later appends start at the beginning of the file.
    pub fn truncate(&mut self) -> DbResult<()> {
        self.file.set_len(0)?;
        self.file.sync_all()?;
        Ok(())
    }
}

fn checksum(total_len: u32, tid: u64, body: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(&total_len.to_be_bytes());
    hasher.update(&tid.to_be_bytes());
    hasher.update(body);
    hasher.finalize()
}

fn decode_body(mut body: &[u8], offset: usize) -> DbResult<LogBody> {
    let corrupt = |what: &str| DbError::Corrupt {
        detail: format!("{what} in log record at {offset}"),
    };
    match body.get_u8() {
        KIND_UPDATE => {
            if body.len() != UPDATE_BODY_LEN - 1 {
                return Err(corrupt("bad update length"));
            }
            let table_id = body.get_u32();
            let page_no = body.get_u32();
            let before = body[..PAGE_SIZE].to_vec();
            let after = body[PAGE_SIZE..].to_vec();
            Ok(LogBody::Update {
                page: PageId::new(table_id, page_no),
                before,
                after,
            })
        }
        KIND_COMMIT => Ok(LogBody::Commit),
        KIND_ABORT => Ok(LogBody::Abort),
        kind => Err(corrupt(&format!("unknown kind {kind}"))),
    }
}
