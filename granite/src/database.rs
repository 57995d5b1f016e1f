//! One storage engine instance.

use std::sync::Arc;

use tracing::info;

use crate::buffer_pool::{BufferPool, PageGuard};
use crate::catalog::Catalog;
use crate::config::EngineConfig;
use crate::error::DbResult;
use crate::heap_file::HeapFileIterator;
use crate::image_log::ImageLog;
use crate::lock_manager::LockManager;
use crate::transaction::{Transaction, TransactionId, TransactionManager};
use crate::tuple::Tuple;
use crate::{PageId, Permissions, TableId};

/// Owns the catalog, lock manager, transaction manager and buffer pool of
/// one engine. Engines are independent of each other; several can live in
/// one process.
#[derive(Debug)]
pub struct Database {
    config: EngineConfig,
    buffer_pool: Arc<BufferPool>,
}

impl Database {
    /// Opens an engine over the tables in `catalog`. With an image log
    /// configured, transactions interrupted by a crash are rolled back first.
    /// The log is emptied again whenever no transaction is live.
    pub fn open(config: EngineConfig, catalog: Catalog) -> DbResult<Self> {
        config.validate()?;
        let catalog = Arc::new(catalog);

        let image_log = match &config.image_log_path {
            Some(path) => {
                let mut log = ImageLog::open(path)?;
                log.recover(&catalog)?;
                Some(log)
            }
            None => None,
        };
        let lock_manager = Arc::new(LockManager::with_backoff(
            config.lock_backoff_initial,
            config.lock_backoff_max,
        ));
        let buffer_pool = Arc::new(BufferPool::with_parts(
            config.pool_pages,
            catalog,
            lock_manager,
            TransactionManager::new(),
            image_log,
        ));
        info!(
            pool_pages = config.pool_pages,
            tables = buffer_pool.catalog().table_ids().len(),
            image_log = config.image_log_path.is_some(),
            "database opened"
        );
        Ok(Self {
            config,
            buffer_pool,
        })
    }

    /// Opens an engine with no tables and the default configuration.
    pub fn open_empty() -> DbResult<Self> {
        Self::open(EngineConfig::default(), Catalog::new())
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        self.buffer_pool.catalog()
    }

    pub fn buffer_pool(&self) -> &Arc<BufferPool> {
        &self.buffer_pool
    }

    pub fn lock_manager(&self) -> &Arc<LockManager> {
        self.buffer_pool.lock_manager()
    }

    pub fn transactions(&self) -> &TransactionManager {
        self.buffer_pool.transactions()
    }

    /// Starts a transaction that aborts when dropped unfinished.
    pub fn begin(&self) -> Transaction {
        Transaction::begin(self.buffer_pool.clone())
    }

    pub fn get_page(
        &self,
        tid: TransactionId,
        page_id: PageId,
        perm: Permissions,
    ) -> DbResult<PageGuard> {
        self.buffer_pool.get_page(tid, page_id, perm)
    }

    pub fn insert_tuple(
        &self,
        tid: TransactionId,
        table_id: TableId,
        tuple: &mut Tuple,
    ) -> DbResult<Vec<PageId>> {
        self.buffer_pool.insert_tuple(tid, table_id, tuple)
    }

    pub fn delete_tuple(&self, tid: TransactionId, tuple: &Tuple) -> DbResult<PageId> {
        self.buffer_pool.delete_tuple(tid, tuple)
    }

    pub fn commit(&self, tid: TransactionId) -> DbResult<()> {
        self.buffer_pool.transaction_complete(tid, true)
    }

    pub fn abort(&self, tid: TransactionId) -> DbResult<()> {
        self.buffer_pool.transaction_complete(tid, false)
    }

    pub fn transaction_complete(&self, tid: TransactionId, commit: bool) -> DbResult<()> {
        self.buffer_pool.transaction_complete(tid, commit)
    }

    /// An open iterator over table `table_id` under `tid`.
    pub fn scan(&self, tid: TransactionId, table_id: TableId) -> DbResult<HeapFileIterator> {
        let file = self.catalog().heap_file(table_id)?;
        let mut iter = file.iterator(&self.buffer_pool, tid);
        iter.open()?;
        Ok(iter)
    }
}
