//! Append-only write-ahead log.
//!
//! Records are buffered in memory and reach the operating system when
//! a COMMIT record is appended (followed by fsync) or on an explicit
//! flush. Reading always goes back to the file, so unflushed records
//! are invisible to `read_all` — exactly what a crash would leave
//! behind.

use crate::record::{LogRecord, LogRecordType, Lsn};
use log::{debug, warn};
use nimbus_common::types::TxnId;
use nimbus_common::{NimbusError, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

struct WalInner {
    file: File,
    /// Serialized records not yet handed to the OS.
    buffer: Vec<u8>,
    next_lsn: i64,
    /// Last LSN appended per transaction, for prev_lsn chaining.
    txn_last_lsn: HashMap<TxnId, Lsn>,
}

/// The write-ahead log over a single append-only file.
pub struct Wal {
    path: PathBuf,
    fsync_enabled: bool,
    inner: Mutex<WalInner>,
}

impl Wal {
    /// Opens the log file, creating it if absent.
    ///
    /// An existing tail is scanned so LSN allocation resumes after the
    /// highest record already on disk.
    pub fn open(path: impl AsRef<Path>, fsync_enabled: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;

        let existing = Self::read_file(&path)?;
        let next_lsn = existing.last().map(|r| r.lsn.0 + 1).unwrap_or(0);
        if next_lsn > 0 {
            debug!("wal: resuming at lsn {}", next_lsn);
        }

        Ok(Self {
            path,
            fsync_enabled,
            inner: Mutex::new(WalInner {
                file,
                buffer: Vec::new(),
                next_lsn,
                txn_last_lsn: HashMap::new(),
            }),
        })
    }

    /// Returns the log file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the next LSN that will be assigned.
    pub fn next_lsn(&self) -> Lsn {
        Lsn(self.inner.lock().next_lsn)
    }

    /// Returns the last LSN appended by a transaction.
    pub fn last_lsn(&self, txn_id: TxnId) -> Lsn {
        self.inner
            .lock()
            .txn_last_lsn
            .get(&txn_id)
            .copied()
            .unwrap_or(Lsn::INVALID)
    }

    /// Appends a record, stamping its `lsn` and `prev_lsn`.
    ///
    /// COMMIT records force the buffer to the OS and fsync before
    /// returning; everything the transaction logged earlier is durable
    /// when this returns.
    pub fn append(&self, mut record: LogRecord) -> Result<Lsn> {
        let mut inner = self.inner.lock();

        record.lsn = Lsn(inner.next_lsn);
        inner.next_lsn += 1;
        record.prev_lsn = inner
            .txn_last_lsn
            .get(&record.txn_id)
            .copied()
            .unwrap_or(Lsn::INVALID);
        inner.txn_last_lsn.insert(record.txn_id, record.lsn);

        let serialized = record.serialize();
        inner.buffer.extend_from_slice(&serialized);

        if record.record_type == LogRecordType::Commit {
            self.flush_locked(&mut inner)?;
        }

        Ok(record.lsn)
    }

    /// Forces all buffered records to stable storage.
    pub fn flush(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        self.flush_locked(&mut inner)
    }

    fn flush_locked(&self, inner: &mut WalInner) -> Result<()> {
        if inner.buffer.is_empty() {
            return Ok(());
        }

        let buffer = std::mem::take(&mut inner.buffer);
        inner.file.write_all(&buffer).map_err(|e| {
            NimbusError::WalWriteFailed(format!("{}: {}", self.path.display(), e))
        })?;
        inner.file.flush()?;
        if self.fsync_enabled {
            inner.file.sync_all()?;
        }
        Ok(())
    }

    /// Reads every record from the log file.
    ///
    /// Decoding stops at the first malformed record; a truncated tail
    /// is tolerated and everything before it is returned.
    pub fn read_all(&self) -> Result<Vec<LogRecord>> {
        Self::read_file(&self.path)
    }

    /// Discards the log: buffered records, per-txn chains, and the
    /// file contents.
    ///
    /// Called once everything the log protects is durably on disk —
    /// after recovery has been applied, or at clean shutdown. Without
    /// this, a later replay would re-apply operations whose effects
    /// are already in the data file.
    pub fn truncate(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.buffer.clear();
        inner.txn_last_lsn.clear();
        inner.next_lsn = 0;
        inner.file.set_len(0)?;
        if self.fsync_enabled {
            inner.file.sync_all()?;
        }
        debug!("wal: truncated");
        Ok(())
    }

    fn read_file(path: &Path) -> Result<Vec<LogRecord>> {
        let data = match std::fs::read(path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut records = Vec::new();
        let mut offset = 0;
        while offset < data.len() {
            match LogRecord::deserialize(&data, &mut offset) {
                Ok(record) => records.push(record),
                Err(_) => {
                    warn!(
                        "wal: stopping replay at byte {} of {} (truncated tail)",
                        offset,
                        data.len()
                    );
                    break;
                }
            }
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use nimbus_common::page::PageId;
    use std::io::Write as _;
    use tempfile::tempdir;

    fn create_test_wal() -> (Wal, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let wal = Wal::open(dir.path().join("test.wal"), true).unwrap();
        (wal, dir)
    }

    #[test]
    fn test_wal_open_empty() {
        let (wal, _dir) = create_test_wal();
        assert_eq!(wal.next_lsn(), Lsn(0));
        assert!(wal.read_all().unwrap().is_empty());
    }

    #[test]
    fn test_wal_append_assigns_lsns() {
        let (wal, _dir) = create_test_wal();

        let l0 = wal.append(LogRecord::begin(1)).unwrap();
        let l1 = wal
            .append(LogRecord::insert(1, PageId(5), 0, Bytes::from_static(b"doc")))
            .unwrap();
        let l2 = wal.append(LogRecord::commit(1)).unwrap();

        assert_eq!(l0, Lsn(0));
        assert_eq!(l1, Lsn(1));
        assert_eq!(l2, Lsn(2));
        assert_eq!(wal.next_lsn(), Lsn(3));
    }

    #[test]
    fn test_wal_prev_lsn_chaining() {
        let (wal, _dir) = create_test_wal();

        wal.append(LogRecord::begin(1)).unwrap();
        wal.append(LogRecord::begin(2)).unwrap();
        wal.append(LogRecord::insert(1, PageId(0), 0, Bytes::new())).unwrap();
        wal.append(LogRecord::insert(2, PageId(1), 0, Bytes::new())).unwrap();
        wal.append(LogRecord::commit(1)).unwrap();
        wal.append(LogRecord::commit(2)).unwrap();

        let records = wal.read_all().unwrap();
        assert_eq!(records.len(), 6);

        // Per-txn chains: each prev_lsn points to the txn's previous
        // record or is invalid
        assert_eq!(records[0].prev_lsn, Lsn::INVALID); // begin 1
        assert_eq!(records[1].prev_lsn, Lsn::INVALID); // begin 2
        assert_eq!(records[2].prev_lsn, records[0].lsn); // insert 1
        assert_eq!(records[3].prev_lsn, records[1].lsn); // insert 2
        assert_eq!(records[4].prev_lsn, records[2].lsn); // commit 1
        assert_eq!(records[5].prev_lsn, records[3].lsn); // commit 2
    }

    #[test]
    fn test_wal_lsns_strictly_increasing() {
        let (wal, _dir) = create_test_wal();

        for txn in 0..5i64 {
            wal.append(LogRecord::begin(txn)).unwrap();
            wal.append(LogRecord::commit(txn)).unwrap();
        }

        let records = wal.read_all().unwrap();
        for w in records.windows(2) {
            assert!(w[0].lsn < w[1].lsn);
        }
    }

    #[test]
    fn test_wal_commit_forces_to_disk() {
        let (wal, _dir) = create_test_wal();

        wal.append(LogRecord::begin(1)).unwrap();
        wal.append(LogRecord::insert(1, PageId(0), 0, Bytes::from_static(b"x")))
            .unwrap();

        // No commit yet: nothing is on disk
        assert!(wal.read_all().unwrap().is_empty());

        wal.append(LogRecord::commit(1)).unwrap();
        assert_eq!(wal.read_all().unwrap().len(), 3);
    }

    #[test]
    fn test_wal_explicit_flush() {
        let (wal, _dir) = create_test_wal();

        wal.append(LogRecord::begin(1)).unwrap();
        assert!(wal.read_all().unwrap().is_empty());

        wal.flush().unwrap();
        assert_eq!(wal.read_all().unwrap().len(), 1);
    }

    #[test]
    fn test_wal_replay_scenario() {
        let (wal, _dir) = create_test_wal();

        wal.append(LogRecord::begin(100)).unwrap();
        wal.append(LogRecord::insert(
            100,
            PageId(5),
            0,
            Bytes::from_static(&[1, 2, 3]),
        ))
        .unwrap();
        wal.append(LogRecord::commit(100)).unwrap();

        let records = wal.read_all().unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].record_type, LogRecordType::Begin);
        assert_eq!(records[1].record_type, LogRecordType::Insert);
        assert_eq!(records[2].record_type, LogRecordType::Commit);
        for r in &records {
            assert_eq!(r.txn_id, 100);
        }
        assert_eq!(records[1].page_id, PageId(5));
        assert_eq!(records[1].slot_id, 0);
        assert_eq!(records[1].after_image, Bytes::from_static(&[1, 2, 3]));
    }

    #[test]
    fn test_wal_truncated_tail_tolerated() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.wal");

        {
            let wal = Wal::open(&path, true).unwrap();
            wal.append(LogRecord::begin(1)).unwrap();
            wal.append(LogRecord::commit(1)).unwrap();
        }

        // Garbage after the last full record
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(&[0xDE, 0xAD, 0xBE]).unwrap();
        }

        let wal = Wal::open(&path, true).unwrap();
        let records = wal.read_all().unwrap();
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn test_wal_reopen_resumes_lsn() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.wal");

        {
            let wal = Wal::open(&path, true).unwrap();
            wal.append(LogRecord::begin(1)).unwrap();
            wal.append(LogRecord::commit(1)).unwrap();
        }

        let wal = Wal::open(&path, true).unwrap();
        assert_eq!(wal.next_lsn(), Lsn(2));

        let lsn = wal.append(LogRecord::begin(2)).unwrap();
        assert_eq!(lsn, Lsn(2));
    }

    #[test]
    fn test_wal_truncate_discards_everything() {
        let (wal, _dir) = create_test_wal();

        wal.append(LogRecord::begin(1)).unwrap();
        wal.append(LogRecord::commit(1)).unwrap();
        assert_eq!(wal.read_all().unwrap().len(), 2);

        wal.truncate().unwrap();
        assert!(wal.read_all().unwrap().is_empty());
        assert_eq!(wal.next_lsn(), Lsn(0));
        assert_eq!(wal.last_lsn(1), Lsn::INVALID);

        // The log is usable again from scratch
        let lsn = wal.append(LogRecord::begin(2)).unwrap();
        assert_eq!(lsn, Lsn(0));
    }

    #[test]
    fn test_wal_last_lsn_per_txn() {
        let (wal, _dir) = create_test_wal();

        assert_eq!(wal.last_lsn(9), Lsn::INVALID);

        wal.append(LogRecord::begin(9)).unwrap();
        let l = wal
            .append(LogRecord::delete(9, PageId(1), 2, Bytes::from_static(b"old")))
            .unwrap();
        assert_eq!(wal.last_lsn(9), l);
    }
}
