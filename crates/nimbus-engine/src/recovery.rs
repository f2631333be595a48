//! ARIES-style three-phase crash recovery.
//!
//! `recover` reads the whole log once, then:
//! - **Analysis** builds the set of transactions with no
//!   commit/abort record and a dirty page table keyed by page id,
//!   keeping the earliest LSN that touched each page.
//! - **Redo** sweeps forward and re-applies after-images of data
//!   records whose LSN is at or past their page's recorded LSN.
//! - **Undo** sweeps backward and reverses the data records of
//!   transactions that never finished.
//!
//! Inserts are re-applied at whatever slot the page offers, so a
//! reconstructed record can land at a different slot than the log
//! names; the log records document bytes, not slots, and index
//! contents are not repaired here.

use log::info;
use nimbus_buffer::BufferPool;
use nimbus_common::page::PageId;
use nimbus_common::types::TxnId;
use nimbus_common::Result;
use nimbus_storage::SlottedPage;
use nimbus_wal::{LogRecord, LogRecordType, Lsn, Wal};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Counters describing what a recovery pass did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryStats {
    /// Log records read.
    pub records_read: usize,
    /// Transactions still active at the end of the log.
    pub active_txns: usize,
    /// Pages in the dirty page table.
    pub dirty_pages: usize,
    /// Operations re-applied in the redo phase.
    pub redone: usize,
    /// Operations reversed in the undo phase.
    pub undone: usize,
}

/// Replays the write-ahead log into the buffer pool.
pub struct RecoveryManager {
    wal: Arc<Wal>,
    pool: Arc<BufferPool>,
}

impl RecoveryManager {
    /// Creates a recovery manager over the given log and pool.
    pub fn new(wal: Arc<Wal>, pool: Arc<BufferPool>) -> Self {
        Self { wal, pool }
    }

    /// Runs all three phases. Pages touched by redo/undo are left
    /// dirty in the pool for the caller to flush.
    pub fn recover(&self) -> Result<RecoveryStats> {
        let records = self.wal.read_all()?;
        if records.is_empty() {
            info!("recovery: no log records, clean start");
            return Ok(RecoveryStats::default());
        }

        let mut stats = RecoveryStats {
            records_read: records.len(),
            ..Default::default()
        };

        let (active_txns, dirty_pages) = Self::analysis(&records);
        stats.active_txns = active_txns.len();
        stats.dirty_pages = dirty_pages.len();

        stats.redone = self.redo(&records, &dirty_pages)?;
        stats.undone = self.undo(&records, &active_txns)?;

        info!(
            "recovery: {} records, {} active txns, {} dirty pages, {} redone, {} undone",
            stats.records_read, stats.active_txns, stats.dirty_pages, stats.redone, stats.undone
        );
        Ok(stats)
    }

    /// Phase 1: active transaction set and dirty page table.
    fn analysis(records: &[LogRecord]) -> (HashSet<TxnId>, HashMap<PageId, Lsn>) {
        let mut active_txns = HashSet::new();
        let mut dirty_pages: HashMap<PageId, Lsn> = HashMap::new();

        for record in records {
            match record.record_type {
                LogRecordType::Begin => {
                    active_txns.insert(record.txn_id);
                }
                LogRecordType::Commit | LogRecordType::Abort => {
                    active_txns.remove(&record.txn_id);
                }
                LogRecordType::Insert | LogRecordType::Delete | LogRecordType::Update => {
                    active_txns.insert(record.txn_id);
                    if record.page_id.is_valid() {
                        // Keep the earliest LSN that dirtied the page
                        dirty_pages.entry(record.page_id).or_insert(record.lsn);
                    }
                }
            }
        }

        (active_txns, dirty_pages)
    }

    /// Phase 2: forward sweep re-applying after-images.
    fn redo(&self, records: &[LogRecord], dirty_pages: &HashMap<PageId, Lsn>) -> Result<usize> {
        let mut redone = 0usize;

        for record in records {
            if !matches!(
                record.record_type,
                LogRecordType::Insert | LogRecordType::Delete | LogRecordType::Update
            ) {
                continue;
            }
            if !record.page_id.is_valid() {
                continue;
            }
            let Some(&rec_lsn) = dirty_pages.get(&record.page_id) else {
                continue;
            };
            if record.lsn < rec_lsn {
                continue;
            }

            let guard = self.pool.write_page(record.page_id)?;
            let mut data = guard.data_mut();

            match record.record_type {
                LogRecordType::Insert => {
                    if !record.after_image.is_empty() {
                        SlottedPage::insert(&mut **data, &record.after_image);
                        redone += 1;
                    }
                }
                LogRecordType::Delete => {
                    SlottedPage::delete(&mut **data, record.slot_id);
                    redone += 1;
                }
                LogRecordType::Update => {
                    if !record.after_image.is_empty() {
                        // Best effort: a slot that cannot take the
                        // after-image is left as the redo found it
                        SlottedPage::update(&mut **data, record.slot_id, &record.after_image);
                        redone += 1;
                    }
                }
                _ => {}
            }

            drop(data);
            guard.set_dirty();
        }

        Ok(redone)
    }

    /// Phase 3: backward sweep reversing unfinished transactions.
    fn undo(&self, records: &[LogRecord], active_txns: &HashSet<TxnId>) -> Result<usize> {
        if active_txns.is_empty() {
            return Ok(0);
        }

        let mut undone = 0usize;

        for record in records.iter().rev() {
            if !active_txns.contains(&record.txn_id) {
                continue;
            }
            if !record.page_id.is_valid() {
                continue;
            }

            let guard = self.pool.write_page(record.page_id)?;
            let mut data = guard.data_mut();

            match record.record_type {
                LogRecordType::Insert => {
                    SlottedPage::delete(&mut **data, record.slot_id);
                    undone += 1;
                }
                LogRecordType::Delete => {
                    if !record.before_image.is_empty() {
                        SlottedPage::insert(&mut **data, &record.before_image);
                        undone += 1;
                    }
                }
                LogRecordType::Update => {
                    if !record.before_image.is_empty() {
                        SlottedPage::update(&mut **data, record.slot_id, &record.before_image);
                        undone += 1;
                    }
                }
                _ => continue,
            }

            drop(data);
            guard.set_dirty();
        }

        Ok(undone)
    }
}
