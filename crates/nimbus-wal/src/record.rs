//! WAL log record format.
//!
//! Record format on disk:
//! ```text
//! total_size (u32) | lsn (i64) | txn_id (i64) | prev_lsn (i64) |
//! type (u8) | page_id (u32) | slot_id (u16) |
//! before_len (u32) | before_bytes | after_len (u32) | after_bytes
//! ```
//! The log is append-only; decoding stops at the first malformed
//! record, which makes a truncated tail harmless.

use bytes::{BufMut, Bytes, BytesMut};
use nimbus_common::page::PageId;
use nimbus_common::types::TxnId;
use nimbus_common::{NimbusError, Result};

/// Log sequence number: a monotonic position in the WAL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Lsn(pub i64);

impl Lsn {
    /// Invalid/uninitialized LSN.
    pub const INVALID: Lsn = Lsn(-1);

    /// Returns true if this is a valid LSN.
    pub fn is_valid(&self) -> bool {
        self.0 >= 0
    }
}

impl std::fmt::Display for Lsn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_valid() {
            write!(f, "{}", self.0)
        } else {
            write!(f, "invalid")
        }
    }
}

/// Types of log records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LogRecordType {
    /// Transaction start.
    Begin = 0,
    /// Transaction committed.
    Commit = 1,
    /// Transaction aborted.
    Abort = 2,
    /// Record inserted (after image).
    Insert = 3,
    /// Record deleted (before image).
    Delete = 4,
    /// Record updated (before + after images).
    Update = 5,
}

impl TryFrom<u8> for LogRecordType {
    type Error = NimbusError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(LogRecordType::Begin),
            1 => Ok(LogRecordType::Commit),
            2 => Ok(LogRecordType::Abort),
            3 => Ok(LogRecordType::Insert),
            4 => Ok(LogRecordType::Delete),
            5 => Ok(LogRecordType::Update),
            _ => Err(NimbusError::WalCorrupted {
                offset: 0,
                reason: format!("invalid record type: {}", value),
            }),
        }
    }
}

/// A single WAL record.
#[derive(Debug, Clone)]
pub struct LogRecord {
    /// LSN of this record (assigned on append).
    pub lsn: Lsn,
    /// Transaction this record belongs to.
    pub txn_id: TxnId,
    /// LSN of the transaction's previous record (assigned on append).
    pub prev_lsn: Lsn,
    /// Record type.
    pub record_type: LogRecordType,
    /// Affected page (invalid for Begin/Commit/Abort).
    pub page_id: PageId,
    /// Affected slot.
    pub slot_id: u16,
    /// Before image (Delete, Update).
    pub before_image: Bytes,
    /// After image (Insert, Update).
    pub after_image: Bytes,
}

/// Fixed part of a serialized record, including the size prefix.
const FIXED_SIZE: usize = 4 + 8 + 8 + 8 + 1 + 4 + 2 + 4 + 4;

impl LogRecord {
    /// Creates a record with unassigned LSNs; `Wal::append` stamps
    /// `lsn` and `prev_lsn`.
    pub fn new(
        txn_id: TxnId,
        record_type: LogRecordType,
        page_id: PageId,
        slot_id: u16,
        before_image: Bytes,
        after_image: Bytes,
    ) -> Self {
        Self {
            lsn: Lsn::INVALID,
            txn_id,
            prev_lsn: Lsn::INVALID,
            record_type,
            page_id,
            slot_id,
            before_image,
            after_image,
        }
    }

    /// Creates a transaction begin record.
    pub fn begin(txn_id: TxnId) -> Self {
        Self::new(
            txn_id,
            LogRecordType::Begin,
            PageId::INVALID,
            0,
            Bytes::new(),
            Bytes::new(),
        )
    }

    /// Creates a transaction commit record.
    pub fn commit(txn_id: TxnId) -> Self {
        Self::new(
            txn_id,
            LogRecordType::Commit,
            PageId::INVALID,
            0,
            Bytes::new(),
            Bytes::new(),
        )
    }

    /// Creates a transaction abort record.
    pub fn abort(txn_id: TxnId) -> Self {
        Self::new(
            txn_id,
            LogRecordType::Abort,
            PageId::INVALID,
            0,
            Bytes::new(),
            Bytes::new(),
        )
    }

    /// Creates an insert record carrying the after image.
    pub fn insert(txn_id: TxnId, page_id: PageId, slot_id: u16, after: Bytes) -> Self {
        Self::new(txn_id, LogRecordType::Insert, page_id, slot_id, Bytes::new(), after)
    }

    /// Creates a delete record carrying the before image.
    pub fn delete(txn_id: TxnId, page_id: PageId, slot_id: u16, before: Bytes) -> Self {
        Self::new(txn_id, LogRecordType::Delete, page_id, slot_id, before, Bytes::new())
    }

    /// Creates an update record carrying both images.
    pub fn update(
        txn_id: TxnId,
        page_id: PageId,
        slot_id: u16,
        before: Bytes,
        after: Bytes,
    ) -> Self {
        Self::new(txn_id, LogRecordType::Update, page_id, slot_id, before, after)
    }

    /// Returns the serialized size of this record.
    pub fn size_on_disk(&self) -> usize {
        FIXED_SIZE + self.before_image.len() + self.after_image.len()
    }

    /// Serializes this record.
    pub fn serialize(&self) -> Bytes {
        let total_size = self.size_on_disk();
        let mut buf = BytesMut::with_capacity(total_size);

        buf.put_u32_le(total_size as u32);
        buf.put_i64_le(self.lsn.0);
        buf.put_i64_le(self.txn_id);
        buf.put_i64_le(self.prev_lsn.0);
        buf.put_u8(self.record_type as u8);
        buf.put_u32_le(self.page_id.0);
        buf.put_u16_le(self.slot_id);
        buf.put_u32_le(self.before_image.len() as u32);
        buf.put_slice(&self.before_image);
        buf.put_u32_le(self.after_image.len() as u32);
        buf.put_slice(&self.after_image);

        buf.freeze()
    }

    /// Deserializes one record from `data` at `*offset`, advancing the
    /// offset past it.
    pub fn deserialize(data: &[u8], offset: &mut usize) -> Result<LogRecord> {
        let start = *offset;
        let fail = |reason: &str| NimbusError::WalCorrupted {
            offset: start,
            reason: reason.to_string(),
        };

        if start + 4 > data.len() {
            return Err(fail("truncated size prefix"));
        }
        let total_size =
            u32::from_le_bytes([data[start], data[start + 1], data[start + 2], data[start + 3]])
                as usize;
        if total_size < FIXED_SIZE || start + total_size > data.len() {
            return Err(fail("record size out of range"));
        }

        let mut pos = start + 4;
        let read_i64 = |pos: &mut usize| {
            let v = i64::from_le_bytes(data[*pos..*pos + 8].try_into().unwrap_or([0u8; 8]));
            *pos += 8;
            v
        };

        let lsn = Lsn(read_i64(&mut pos));
        let txn_id = read_i64(&mut pos);
        let prev_lsn = Lsn(read_i64(&mut pos));

        let record_type = LogRecordType::try_from(data[pos]).map_err(|_| {
            fail("invalid record type")
        })?;
        pos += 1;

        let page_id = PageId(u32::from_le_bytes(
            data[pos..pos + 4].try_into().unwrap_or([0u8; 4]),
        ));
        pos += 4;
        let slot_id = u16::from_le_bytes(data[pos..pos + 2].try_into().unwrap_or([0u8; 2]));
        pos += 2;

        let before_len =
            u32::from_le_bytes(data[pos..pos + 4].try_into().unwrap_or([0u8; 4])) as usize;
        pos += 4;
        if pos + before_len + 4 > start + total_size {
            return Err(fail("before image overruns record"));
        }
        let before_image = Bytes::copy_from_slice(&data[pos..pos + before_len]);
        pos += before_len;

        let after_len =
            u32::from_le_bytes(data[pos..pos + 4].try_into().unwrap_or([0u8; 4])) as usize;
        pos += 4;
        if pos + after_len > start + total_size {
            return Err(fail("after image overruns record"));
        }
        let after_image = Bytes::copy_from_slice(&data[pos..pos + after_len]);
        pos += after_len;

        if pos != start + total_size {
            return Err(fail("record size mismatch"));
        }

        *offset = pos;
        Ok(LogRecord {
            lsn,
            txn_id,
            prev_lsn,
            record_type,
            page_id,
            slot_id,
            before_image,
            after_image,
        })
    }
}
