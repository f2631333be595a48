//! Buffer pool manager.

use crate::frame::{BufferFrame, FrameId};
use crate::replacer::{LruReplacer, Replacer};
use nimbus_common::page::{PageId, PAGE_SIZE};
use nimbus_common::{NimbusError, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Backing store the pool reads pages from and writes them back to.
///
/// Implemented by the disk manager; tests substitute an in-memory store.
pub trait PageStore: Send + Sync {
    /// Reads a page into `buf`, zero-filling past end of file.
    fn read_page(&self, page_id: PageId, buf: &mut [u8; PAGE_SIZE]) -> Result<()>;

    /// Writes a page at its position.
    fn write_page(&self, page_id: PageId, buf: &[u8; PAGE_SIZE]) -> Result<()>;

    /// Allocates and returns a fresh page id.
    fn allocate_page(&self) -> Result<PageId>;

    /// Forces written data to stable storage.
    fn sync(&self) -> Result<()>;
}

/// Configuration for the buffer pool.
#[derive(Debug, Clone)]
pub struct BufferPoolConfig {
    /// Number of frames in the pool.
    pub num_frames: usize,
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        Self { num_frames: 128 }
    }
}

struct PoolInner {
    /// Page ID to frame ID mapping.
    page_table: HashMap<PageId, FrameId>,
    /// Frames that have never held a page.
    free_list: Vec<FrameId>,
}

/// Buffer pool manager.
///
/// A fixed array of frames fronted by a page table, a free list, and an
/// LRU replacer. All structural operations are serialized by a single
/// pool-level latch; a victim's dirty contents are written back before
/// its frame is rebound.
pub struct BufferPool {
    config: BufferPoolConfig,
    frames: Vec<BufferFrame>,
    inner: Mutex<PoolInner>,
    replacer: LruReplacer,
    store: Arc<dyn PageStore>,
}

impl BufferPool {
    /// Creates a new buffer pool over the given store.
    pub fn new(store: Arc<dyn PageStore>, config: BufferPoolConfig) -> Self {
        let num_frames = config.num_frames;

        let frames: Vec<_> = (0..num_frames)
            .map(|i| BufferFrame::new(FrameId(i as u32)))
            .collect();
        let free_list: Vec<_> = (0..num_frames).rev().map(|i| FrameId(i as u32)).collect();

        Self {
            config,
            frames,
            inner: Mutex::new(PoolInner {
                page_table: HashMap::with_capacity(num_frames),
                free_list,
            }),
            replacer: LruReplacer::new(num_frames),
            store,
        }
    }

    /// Returns the number of frames in the pool.
    pub fn num_frames(&self) -> usize {
        self.config.num_frames
    }

    /// Returns the number of never-used frames.
    pub fn free_count(&self) -> usize {
        self.inner.lock().free_list.len()
    }

    /// Returns the number of pages currently mapped.
    pub fn page_count(&self) -> usize {
        self.inner.lock().page_table.len()
    }

    /// Checks if a page is resident in the pool.
    pub fn contains(&self, page_id: PageId) -> bool {
        self.inner.lock().page_table.contains_key(&page_id)
    }

    /// Selects a frame to rebind: the free list first, then an LRU
    /// victim (writing its contents back if dirty).
    ///
    /// Called with the pool latch held.
    fn allocate_frame(&self, inner: &mut PoolInner) -> Result<FrameId> {
        if let Some(frame_id) = inner.free_list.pop() {
            return Ok(frame_id);
        }

        let victim_id = self.replacer.victim().ok_or(NimbusError::BufferPoolFull)?;
        let frame = &self.frames[victim_id.0 as usize];

        if frame.is_dirty() {
            if let Some(victim_page) = frame.page_id() {
                let data = frame.read_data();
                self.store.write_page(victim_page, &**data)?;
            }
        }

        if let Some(victim_page) = frame.page_id() {
            inner.page_table.remove(&victim_page);
        }

        Ok(victim_id)
    }

    /// Fetches a page, reading it from the store if it is not resident.
    ///
    /// The returned frame is pinned; every successful fetch must be
    /// paired with an `unpin_page` on all exit paths.
    pub fn fetch_page(&self, page_id: PageId) -> Result<&BufferFrame> {
        let mut inner = self.inner.lock();

        if let Some(&frame_id) = inner.page_table.get(&page_id) {
            let frame = &self.frames[frame_id.0 as usize];
            frame.pin();
            self.replacer.pin(frame_id);
            return Ok(frame);
        }

        let frame_id = self.allocate_frame(&mut inner)?;
        let frame = &self.frames[frame_id.0 as usize];
        frame.reset();

        {
            let mut data = frame.write_data();
            if let Err(e) = self.store.read_page(page_id, &mut **data) {
                drop(data);
                inner.free_list.push(frame_id);
                return Err(e);
            }
        }

        frame.set_page_id(Some(page_id));
        frame.pin();
        inner.page_table.insert(page_id, frame_id);

        Ok(frame)
    }

    /// Allocates a fresh page id and binds a zeroed frame to it.
    ///
    /// The returned frame is pinned; the read from disk is skipped.
    pub fn new_page(&self) -> Result<(PageId, &BufferFrame)> {
        let mut inner = self.inner.lock();

        let frame_id = self.allocate_frame(&mut inner)?;
        let page_id = match self.store.allocate_page() {
            Ok(pid) => pid,
            Err(e) => {
                inner.free_list.push(frame_id);
                return Err(e);
            }
        };

        let frame = &self.frames[frame_id.0 as usize];
        frame.reset();
        frame.set_page_id(Some(page_id));
        frame.pin();
        inner.page_table.insert(page_id, frame_id);

        Ok((page_id, frame))
    }

    /// Unpins a page, reporting whether it was dirtied.
    ///
    /// `is_dirty = true` raises the frame's dirty flag; it is never
    /// cleared here. When the pin count reaches zero the frame becomes
    /// a victim candidate.
    pub fn unpin_page(&self, page_id: PageId, is_dirty: bool) -> bool {
        let inner = self.inner.lock();

        if let Some(&frame_id) = inner.page_table.get(&page_id) {
            let frame = &self.frames[frame_id.0 as usize];

            if is_dirty {
                frame.set_dirty(true);
            }

            if frame.unpin() == 0 {
                self.replacer.unpin(frame_id);
            }
            return true;
        }
        false
    }

    /// Writes a resident page to the store and clears its dirty flag.
    ///
    /// Returns true if the page was written.
    pub fn flush_page(&self, page_id: PageId) -> Result<bool> {
        let inner = self.inner.lock();

        if let Some(&frame_id) = inner.page_table.get(&page_id) {
            let frame = &self.frames[frame_id.0 as usize];
            if frame.is_dirty() {
                let data = frame.read_data();
                self.store.write_page(page_id, &**data)?;
                drop(data);
                frame.set_dirty(false);
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Writes every dirty resident page and syncs the store.
    ///
    /// Returns the number of pages written.
    pub fn flush_all(&self) -> Result<usize> {
        let inner = self.inner.lock();
        let mut flushed = 0;

        for (&page_id, &frame_id) in inner.page_table.iter() {
            let frame = &self.frames[frame_id.0 as usize];
            if frame.is_dirty() {
                let data = frame.read_data();
                self.store.write_page(page_id, &**data)?;
                drop(data);
                frame.set_dirty(false);
                flushed += 1;
            }
        }

        self.store.sync()?;
        Ok(flushed)
    }

    /// Drops a page from the pool, returning its frame to the free list.
    ///
    /// Refuses pinned pages.
    pub fn delete_page(&self, page_id: PageId) -> bool {
        let mut inner = self.inner.lock();

        if let Some(&frame_id) = inner.page_table.get(&page_id) {
            let frame = &self.frames[frame_id.0 as usize];
            if frame.is_pinned() {
                return false;
            }

            inner.page_table.remove(&page_id);
            self.replacer.remove(frame_id);
            frame.reset();
            inner.free_list.push(frame_id);
            return true;
        }
        false
    }

    /// Fetches a page behind an RAII read guard that unpins on drop.
    pub fn read_page(&self, page_id: PageId) -> Result<PageReadGuard<'_>> {
        let frame = self.fetch_page(page_id)?;
        Ok(PageReadGuard {
            pool: self,
            page_id,
            frame,
        })
    }

    /// Fetches a page behind an RAII write guard that unpins on drop.
    pub fn write_page(&self, page_id: PageId) -> Result<PageWriteGuard<'_>> {
        let frame = self.fetch_page(page_id)?;
        Ok(PageWriteGuard {
            pool: self,
            page_id,
            frame,
        })
    }
}

/// RAII guard for reading a page.
pub struct PageReadGuard<'a> {
    pool: &'a BufferPool,
    page_id: PageId,
    frame: &'a BufferFrame,
}

impl<'a> PageReadGuard<'a> {
    /// Returns the page ID.
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    /// Returns the page data.
    pub fn data(&self) -> parking_lot::RwLockReadGuard<'_, Box<[u8; PAGE_SIZE]>> {
        self.frame.read_data()
    }
}

impl Drop for PageReadGuard<'_> {
    fn drop(&mut self) {
        self.pool.unpin_page(self.page_id, false);
    }
}

/// RAII guard for writing a page.
pub struct PageWriteGuard<'a> {
    pool: &'a BufferPool,
    page_id: PageId,
    frame: &'a BufferFrame,
}

impl<'a> PageWriteGuard<'a> {
    /// Returns the page ID.
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    /// Returns mutable access to the page data.
    pub fn data_mut(&self) -> parking_lot::RwLockWriteGuard<'_, Box<[u8; PAGE_SIZE]>> {
        self.frame.write_data()
    }

    /// Returns read access to the page data.
    pub fn data(&self) -> parking_lot::RwLockReadGuard<'_, Box<[u8; PAGE_SIZE]>> {
        self.frame.read_data()
    }

    /// Marks the page as dirty.
    pub fn set_dirty(&self) {
        self.frame.set_dirty(true);
    }
}

impl Drop for PageWriteGuard<'_> {
    fn drop(&mut self) {
        self.pool.unpin_page(self.page_id, self.frame.is_dirty());
    }
}
