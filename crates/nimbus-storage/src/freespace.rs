//! Free-space map for heap pages.
//!
//! One byte per heap page records its free space quantized to 16-byte
//! categories (clamped to 255). Byte *i* of FSM page *k* covers the
//! page with id `k * PAGE_SIZE + i`. The map is coarse by design: it
//! may over- or under-report capacity, and insert paths must tolerate a
//! stale entry by falling back to a fresh page.

use nimbus_buffer::BufferPool;
use nimbus_common::page::{PageId, PAGE_SIZE};
use nimbus_common::Result;
use std::sync::Arc;

/// Free-space quantization granularity in bytes.
pub const FSM_GRANULARITY: usize = 16;

/// Heap pages tracked per FSM page (one byte each).
pub const ENTRIES_PER_FSM_PAGE: usize = PAGE_SIZE;

/// Converts free bytes to a category byte.
pub fn bytes_to_category(free_bytes: usize) -> u8 {
    (free_bytes / FSM_GRANULARITY).min(255) as u8
}

/// Converts a requested byte count to the minimum category that is
/// guaranteed to cover it.
pub fn needed_category(needed_bytes: usize) -> u8 {
    (needed_bytes.div_ceil(FSM_GRANULARITY)).min(255) as u8
}

/// Free-space map over the buffer pool.
///
/// Bound to a starting FSM page; consecutive FSM pages extend the
/// mapping for larger heaps.
pub struct FreeSpaceMap {
    pool: Arc<BufferPool>,
    start_page: PageId,
}

impl FreeSpaceMap {
    /// Creates a free-space map rooted at the given FSM page.
    pub fn new(pool: Arc<BufferPool>, start_page: PageId) -> Self {
        Self { pool, start_page }
    }

    /// Returns the first FSM page id.
    pub fn start_page(&self) -> PageId {
        self.start_page
    }

    /// Maps a heap page to its FSM page and byte offset.
    fn location(&self, heap_page: PageId) -> (PageId, usize) {
        let fsm_index = heap_page.0 / ENTRIES_PER_FSM_PAGE as u32;
        let offset = (heap_page.0 % ENTRIES_PER_FSM_PAGE as u32) as usize;
        (PageId(self.start_page.0 + fsm_index), offset)
    }

    /// Finds a heap page with at least `needed_bytes` of free space.
    ///
    /// Linearly scans the first FSM page; the first byte at or above
    /// the needed category (and nonzero) wins. Returns None when no
    /// tracked page qualifies.
    pub fn find_page_with_space(&self, needed_bytes: usize) -> Result<Option<PageId>> {
        let needed_cat = needed_category(needed_bytes);

        let guard = self.pool.read_page(self.start_page)?;
        let data = guard.data();

        for (i, &category) in data.iter().enumerate() {
            if category >= needed_cat && category > 0 {
                return Ok(Some(PageId(i as u32)));
            }
        }
        Ok(None)
    }

    /// Records the free-space category for a heap page.
    pub fn update_free_space(&self, heap_page: PageId, free_bytes: usize) -> Result<()> {
        let (fsm_page, offset) = self.location(heap_page);

        let guard = self.pool.write_page(fsm_page)?;
        guard.data_mut()[offset] = bytes_to_category(free_bytes);
        guard.set_dirty();
        Ok(())
    }

    /// Registers a freshly allocated heap page.
    pub fn register_new_page(&self, heap_page: PageId, free_bytes: usize) -> Result<()> {
        self.update_free_space(heap_page, free_bytes)
    }
}
