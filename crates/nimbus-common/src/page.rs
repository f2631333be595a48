//! Page and record identifiers for NimbusDB storage.

use serde::{Deserialize, Serialize};

/// Page size in bytes (4 KB).
///
/// The size is a compile-time constant, not a parameter of on-disk
/// records: every structure in the database file assumes it.
pub const PAGE_SIZE: usize = 4096;

/// Identifier of a page within the database file.
///
/// Pages are numbered densely from 0; `PageId::INVALID` (all bits set,
/// the byte pattern of `-1` as a signed 32-bit integer) marks "no page".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PageId(pub u32);

impl PageId {
    /// Invalid page ID.
    pub const INVALID: PageId = PageId(u32::MAX);

    /// Returns true if this is a valid page ID.
    pub fn is_valid(&self) -> bool {
        *self != Self::INVALID
    }

    /// Byte offset of this page within the database file.
    pub fn file_offset(&self) -> u64 {
        (self.0 as u64) * (PAGE_SIZE as u64)
    }
}

impl std::fmt::Display for PageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_valid() {
            write!(f, "{}", self.0)
        } else {
            write!(f, "invalid")
        }
    }
}

/// Identifier of a record: the page holding it plus its slot index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordId {
    /// Page containing this record.
    pub page_id: PageId,
    /// Slot number within the page.
    pub slot_id: u16,
}

impl RecordId {
    /// Invalid record ID.
    pub const INVALID: RecordId = RecordId {
        page_id: PageId::INVALID,
        slot_id: 0,
    };

    /// Creates a new record ID.
    pub fn new(page_id: PageId, slot_id: u16) -> Self {
        Self { page_id, slot_id }
    }

    /// Returns true if this is a valid record ID.
    pub fn is_valid(&self) -> bool {
        self.page_id.is_valid()
    }
}

impl std::fmt::Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.page_id, self.slot_id)
    }
}
