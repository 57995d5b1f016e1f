#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use granite::{Catalog, Database, EngineConfig, Field, FieldType, HeapFile, TableId, Tuple, TupleDesc};
use tempfile::{tempdir, TempDir};

/// A database over one `(id int, value int)` table in a scratch directory,
/// which is removed when the fixture is dropped.
pub struct TestDb {
    pub db: Database,
    pub table: TableId,
    pub desc: Arc<TupleDesc>,
    pub dir: TempDir,
}

impl TestDb {
    pub fn new(pool_pages: usize) -> Self {
        Self::with_config(EngineConfig::default().with_pool_pages(pool_pages))
    }

    pub fn with_config(config: EngineConfig) -> Self {
        let dir = tempdir().unwrap();
        Self::open_in(dir, config)
    }

    /// Like [`TestDb::new`] with the image log enabled.
    pub fn with_image_log() -> Self {
        let dir = tempdir().unwrap();
        let config = EngineConfig::default()
            .with_pool_pages(10)
            .with_image_log(dir.path().join("images.log"));
        Self::open_in(dir, config)
    }

    /// Closes the engine and opens a new one over the same directory.
    pub fn reopen(self) -> Self {
        let config = self.db.config().clone();
        let TestDb { db, dir, .. } = self;
        drop(db);
        Self::open_in(dir, config)
    }

    /// Opens (or reopens) the fixture's table inside `dir`.
    pub fn open_in(dir: TempDir, config: EngineConfig) -> Self {
        let desc = Arc::new(TupleDesc::new(&[FieldType::Int, FieldType::Int], &["id", "value"]));
        let file = HeapFile::open(dir.path().join("items.dat"), desc.clone()).unwrap();
        let catalog = Catalog::new();
        let table = catalog.add_table(file, "items", Some("id"));
        let db = Database::open(config, catalog).unwrap();
        Self { db, table, desc, dir }
    }

    pub fn log_path(&self) -> PathBuf {
        self.dir.path().join("images.log")
    }

    pub fn row(&self, id: i32, value: i32) -> Tuple {
        Tuple::new(self.desc.clone(), vec![Field::Int(id), Field::Int(value)]).unwrap()
    }

    /// Inserts `rows` in one committed transaction.
    pub fn insert_committed(&self, rows: &[(i32, i32)]) -> Vec<Tuple> {
        let tx = self.db.begin();
        let mut out = Vec::new();
        for (id, value) in rows {
            let mut t = self.row(*id, *value);
            self.db.insert_tuple(tx.id(), self.table, &mut t).unwrap();
            out.push(t);
        }
        tx.commit().unwrap();
        out
    }

    /// `(id, value)` pairs visible to a fresh transaction, in scan order.
    pub fn scan_rows(&self) -> Vec<(i32, i32)> {
        let tx = self.db.begin();
        let rows = self
            .db
            .scan(tx.id(), self.table)
            .unwrap()
            .map(|t| pair(&t.unwrap()))
            .collect();
        tx.commit().unwrap();
        rows
    }

    /// Rows stored on disk, read directly from the heap file.
    pub fn disk_rows(&self) -> Vec<(i32, i32)> {
        let file = self.db.catalog().heap_file(self.table).unwrap();
        let mut rows = Vec::new();
        for page_no in 0..file.num_pages().unwrap() {
            let page = file.read_page(granite::PageId::new(self.table, page_no)).unwrap();
            rows.extend(page.tuples().unwrap().iter().map(pair));
        }
        rows
    }
}

pub fn pair(t: &Tuple) -> (i32, i32) {
    match t.fields() {
        [Field::Int(id), Field::Int(value)] => (*id, *value),
        other => panic!("unexpected row {other:?}"),
    }
}

pub fn wait_until(what: &str, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(2));
    }
}
