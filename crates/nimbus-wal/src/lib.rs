//! Write-ahead log (WAL) for NimbusDB.
//!
//! Provides durability by logging modifications before they reach the
//! data file. Records are buffered in memory and forced to stable
//! storage when a transaction commits; the recovery manager replays
//! the log after a crash.

mod record;
mod wal;

pub use record::{LogRecord, LogRecordType, Lsn};
pub use wal::Wal;
