//! Database facade: the engine surface consumed by shells and servers.
//!
//! Owns the storage stack end to end: disk manager, buffer pool, WAL,
//! catalog, lock manager, and transaction manager. Opening a database
//! reserves the catalog page, replays the WAL, and loads the catalog;
//! closing saves the catalog and flushes everything.
//!
//! Mutating operations run as single-operation transactions: an
//! exclusive record lock, a Begin record, the data record(s) with
//! document images, and a Commit record that forces the log to disk.

use crate::catalog::{value_to_index_key, Catalog, CollectionInfo};
use crate::executor::{CompareOp, Executor, Filter, IndexScan, Predicate, SeqScan, Tuple};
use crate::recovery::{RecoveryManager, RecoveryStats};
use log::info;
use nimbus_buffer::{BufferPool, BufferPoolConfig};
use nimbus_common::document::Document;
use nimbus_common::page::{PageId, RecordId};
use nimbus_common::types::TxnId;
use nimbus_common::{DbConfig, NimbusError, Result};
use nimbus_storage::DiskManager;
use nimbus_txn::{LockManager, TransactionManager};
use nimbus_wal::{LogRecord, Wal};
use std::sync::Arc;

/// An open NimbusDB instance.
pub struct Database {
    disk: Arc<DiskManager>,
    pool: Arc<BufferPool>,
    wal: Arc<Wal>,
    lock_manager: Arc<LockManager>,
    txn_manager: TransactionManager,
    catalog: Catalog,
    recovery_stats: RecoveryStats,
}

impl Database {
    /// Opens (or creates) a database, running crash recovery before
    /// accepting any work.
    pub fn open(config: DbConfig) -> Result<Self> {
        let disk = Arc::new(DiskManager::open(&config.db_path)?);
        let pool = Arc::new(BufferPool::new(
            disk.clone(),
            BufferPoolConfig {
                num_frames: config.pool_frames,
            },
        ));

        // Page 0 is reserved for the catalog; claim it before any
        // collection can allocate it
        if disk.num_pages() == 0 {
            let (page_id, _frame) = pool.new_page()?;
            debug_assert_eq!(page_id, PageId(0));
            pool.unpin_page(page_id, true);
        }

        let wal = Arc::new(Wal::open(&config.wal_path, config.fsync_enabled)?);

        let recovery = RecoveryManager::new(wal.clone(), pool.clone());
        let recovery_stats = recovery.recover()?;
        if recovery_stats.records_read > 0 {
            // Everything the log protected is on disk now; a replay of
            // the same records on the next open would double-apply them
            pool.flush_all()?;
            wal.truncate()?;
        }

        let mut catalog = Catalog::new(pool.clone(), config.btree_max_keys);
        catalog.load(PageId(disk.num_pages().saturating_sub(1)))?;

        let lock_manager = Arc::new(LockManager::new());
        let txn_manager = TransactionManager::new(lock_manager.clone());

        info!(
            "database open: {} ({} collections)",
            config.db_path.display(),
            catalog.list_collections().len()
        );

        Ok(Self {
            disk,
            pool,
            wal,
            lock_manager,
            txn_manager,
            catalog,
            recovery_stats,
        })
    }

    /// Saves the catalog, flushes the pool, and discards the log.
    ///
    /// After a clean shutdown every effect is in the data file, so the
    /// log starts over.
    pub fn close(&self) -> Result<()> {
        self.catalog.save()?;
        self.pool.flush_all()?;
        self.disk.sync()?;
        self.wal.truncate()?;
        Ok(())
    }

    /// What recovery did while opening this instance.
    pub fn recovery_stats(&self) -> RecoveryStats {
        self.recovery_stats
    }

    /// Returns the buffer pool.
    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    /// Returns the write-ahead log.
    pub fn wal(&self) -> &Arc<Wal> {
        &self.wal
    }

    /// Returns the lock manager.
    pub fn lock_manager(&self) -> &Arc<LockManager> {
        &self.lock_manager
    }

    /// Returns the transaction manager.
    pub fn txn_manager(&self) -> &TransactionManager {
        &self.txn_manager
    }

    /// Returns the catalog.
    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Lists collection names.
    pub fn list_collections(&self) -> Vec<String> {
        self.catalog.list_collections()
    }

    /// Creates a collection and persists the catalog.
    pub fn create_collection(&mut self, name: &str) -> Result<()> {
        self.catalog.create_collection(name)?;
        self.catalog.save()
    }

    /// Drops a collection and persists the catalog. Pages are not
    /// reclaimed.
    pub fn drop_collection(&mut self, name: &str) -> Result<()> {
        self.catalog.drop_collection(name)?;
        self.catalog.save()
    }

    /// Creates an index over a field and persists the catalog.
    pub fn create_index(&mut self, collection: &str, field: &str) -> Result<()> {
        self.catalog.create_index(collection, field)?;
        self.catalog.save()
    }

    fn collection(&self, name: &str) -> Result<&CollectionInfo> {
        self.catalog
            .get(name)
            .ok_or_else(|| NimbusError::CollectionNotFound(name.to_string()))
    }

    /// Inserts a document, maintaining every index whose field the
    /// document carries.
    pub fn insert(&mut self, collection: &str, doc: &Document) -> Result<RecordId> {
        let image = doc.serialize();

        let txn = self.txn_manager.begin();
        self.wal.append(LogRecord::begin(txn))?;

        let result = self.insert_locked(txn, collection, doc, image);
        match result {
            Ok(rid) => {
                self.wal.append(LogRecord::commit(txn))?;
                self.txn_manager.commit(txn)?;
                Ok(rid)
            }
            Err(e) => {
                self.wal.append(LogRecord::abort(txn))?;
                self.txn_manager.abort(txn)?;
                Err(e)
            }
        }
    }

    fn insert_locked(
        &self,
        txn: TxnId,
        collection: &str,
        doc: &Document,
        image: bytes::Bytes,
    ) -> Result<RecordId> {
        let coll = self.collection(collection)?;

        let rid = coll.heap_file.insert(doc)?;
        self.lock_manager.lock_exclusive(txn, rid);
        self.wal
            .append(LogRecord::insert(txn, rid.page_id, rid.slot_id, image))?;

        for idx in &coll.indexes {
            if let Some(value) = doc.get(&idx.field_name) {
                if let Some(key) = value_to_index_key(value) {
                    idx.btree.insert(&key, rid)?;
                }
            }
        }

        Ok(rid)
    }

    /// Builds the scan pipeline for a filter document: a sequential
    /// scan, wrapped in a filter when the document names any fields.
    /// Each filter field becomes an equality predicate; the result
    /// satisfies their conjunction.
    fn scan_pipeline<'a>(
        &self,
        coll: &'a CollectionInfo,
        filter: &Document,
    ) -> Box<dyn Executor + 'a> {
        let scan: Box<dyn Executor + 'a> = Box::new(SeqScan::new(&coll.heap_file));
        if filter.is_empty() {
            return scan;
        }

        let predicates = filter
            .iter()
            .map(|(field, value)| Predicate::new(field.clone(), CompareOp::Eq, value.clone()))
            .collect();
        Box::new(Filter::new(scan, predicates))
    }

    fn matching_tuples(&self, collection: &str, filter: &Document) -> Result<Vec<Tuple>> {
        let coll = self.collection(collection)?;
        let mut exec = self.scan_pipeline(coll, filter);

        exec.init()?;
        let mut tuples = Vec::new();
        while let Some(tuple) = exec.next()? {
            tuples.push(tuple);
        }
        exec.close();
        Ok(tuples)
    }

    /// Returns every document matching the filter (implicit AND of
    /// equality predicates over the filter's fields).
    pub fn find(&self, collection: &str, filter: &Document) -> Result<Vec<Document>> {
        Ok(self
            .matching_tuples(collection, filter)?
            .into_iter()
            .map(|t| t.doc)
            .collect())
    }

    /// Counts the documents in a collection.
    pub fn count(&self, collection: &str) -> Result<usize> {
        Ok(self.matching_tuples(collection, &Document::new())?.len())
    }

    /// Deletes every document matching the filter; returns how many.
    pub fn delete(&mut self, collection: &str, filter: &Document) -> Result<usize> {
        let victims = self.matching_tuples(collection, filter)?;
        if victims.is_empty() {
            return Ok(0);
        }

        let txn = self.txn_manager.begin();
        self.wal.append(LogRecord::begin(txn))?;

        let result = self.delete_locked(txn, collection, &victims);
        match result {
            Ok(deleted) => {
                self.wal.append(LogRecord::commit(txn))?;
                self.txn_manager.commit(txn)?;
                Ok(deleted)
            }
            Err(e) => {
                self.wal.append(LogRecord::abort(txn))?;
                self.txn_manager.abort(txn)?;
                Err(e)
            }
        }
    }

    fn delete_locked(&self, txn: TxnId, collection: &str, victims: &[Tuple]) -> Result<usize> {
        let coll = self.collection(collection)?;
        let mut deleted = 0;

        for tuple in victims {
            self.lock_manager.lock_exclusive(txn, tuple.rid);
            if coll.heap_file.delete(tuple.rid)? {
                self.wal.append(LogRecord::delete(
                    txn,
                    tuple.rid.page_id,
                    tuple.rid.slot_id,
                    tuple.doc.serialize(),
                ))?;
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    /// Merges `fragment` into every document matching the filter,
    /// overwriting named fields and preserving the rest; returns how
    /// many documents changed.
    pub fn update(
        &mut self,
        collection: &str,
        filter: &Document,
        fragment: &Document,
    ) -> Result<usize> {
        let targets = self.matching_tuples(collection, filter)?;
        if targets.is_empty() {
            return Ok(0);
        }

        let txn = self.txn_manager.begin();
        self.wal.append(LogRecord::begin(txn))?;

        let result = self.update_locked(txn, collection, &targets, fragment);
        match result {
            Ok(updated) => {
                self.wal.append(LogRecord::commit(txn))?;
                self.txn_manager.commit(txn)?;
                Ok(updated)
            }
            Err(e) => {
                self.wal.append(LogRecord::abort(txn))?;
                self.txn_manager.abort(txn)?;
                Err(e)
            }
        }
    }

    fn update_locked(
        &self,
        txn: TxnId,
        collection: &str,
        targets: &[Tuple],
        fragment: &Document,
    ) -> Result<usize> {
        let coll = self.collection(collection)?;
        let mut updated = 0;

        for tuple in targets {
            let mut merged = tuple.doc.clone();
            merged.merge(fragment);

            self.lock_manager.lock_exclusive(txn, tuple.rid);
            let new_rid = coll.heap_file.update(tuple.rid, &merged)?;

            if new_rid == tuple.rid {
                self.wal.append(LogRecord::update(
                    txn,
                    tuple.rid.page_id,
                    tuple.rid.slot_id,
                    tuple.doc.serialize(),
                    merged.serialize(),
                ))?;
            } else {
                // The merged document outgrew its slot, so the heap
                // deleted and re-inserted it. An Update record tied to
                // the tombstoned slot would no-op on redo; log the
                // delete and the insert that actually happened, and
                // hold the new location until commit as well.
                self.lock_manager.lock_exclusive(txn, new_rid);
                self.wal.append(LogRecord::delete(
                    txn,
                    tuple.rid.page_id,
                    tuple.rid.slot_id,
                    tuple.doc.serialize(),
                ))?;
                self.wal.append(LogRecord::insert(
                    txn,
                    new_rid.page_id,
                    new_rid.slot_id,
                    merged.serialize(),
                ))?;
            }
            updated += 1;
        }
        Ok(updated)
    }

    /// Scans an index over the inclusive key range `[lo, hi]`,
    /// materializing the matching documents.
    pub fn index_scan(
        &self,
        collection: &str,
        field: &str,
        lo: &str,
        hi: &str,
    ) -> Result<Vec<Document>> {
        let coll = self.collection(collection)?;
        let idx = coll
            .indexes
            .iter()
            .find(|idx| idx.field_name == field)
            .ok_or_else(|| NimbusError::IndexNotFound(field.to_string()))?;

        let mut exec = IndexScan::new(&idx.btree, &coll.heap_file, lo, hi);
        exec.init()?;
        let mut docs = Vec::new();
        while let Some(tuple) = exec.next()? {
            docs.push(tuple.doc);
        }
        exec.close();
        Ok(docs)
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
