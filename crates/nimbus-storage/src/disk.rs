//! Disk manager for page-level file I/O.
//!
//! The database is one contiguous file of fixed-size pages. All reads
//! and writes are positional, so concurrent access to distinct pages
//! needs no seek serialization. Page ids are allocated monotonically
//! and never reused.

use nimbus_buffer::PageStore;
use nimbus_common::page::{PageId, PAGE_SIZE};
use nimbus_common::Result;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};

/// Manages reading and writing pages of the database file.
pub struct DiskManager {
    /// The database file.
    file: File,
    /// Path to the file.
    path: PathBuf,
    /// Next page id to hand out.
    next_page_id: AtomicU32,
}

impl DiskManager {
    /// Opens the database file, creating it if absent.
    ///
    /// The next page id is derived from the current file length.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        let file_size = file.metadata()?.len();
        let next_page_id = (file_size / PAGE_SIZE as u64) as u32;

        Ok(Self {
            file,
            path,
            next_page_id: AtomicU32::new(next_page_id),
        })
    }

    /// Returns the path of the database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the next page id that `allocate_page` would hand out.
    pub fn next_page_id(&self) -> PageId {
        PageId(self.next_page_id.load(Ordering::SeqCst))
    }

    /// Returns the number of pages the file currently accounts for.
    pub fn num_pages(&self) -> u32 {
        self.next_page_id.load(Ordering::SeqCst)
    }

    /// Reads a page into `buf`.
    ///
    /// Reads past the end of file yield trailing zeroes rather than an
    /// error, so freshly allocated pages read back as all-zero.
    pub fn read_page(&self, page_id: PageId, buf: &mut [u8; PAGE_SIZE]) -> Result<()> {
        let mut offset = page_id.file_offset();
        let mut filled = 0;

        while filled < PAGE_SIZE {
            let n = self.file.read_at(&mut buf[filled..], offset)?;
            if n == 0 {
                break;
            }
            filled += n;
            offset += n as u64;
        }

        if filled < PAGE_SIZE {
            buf[filled..].fill(0);
        }
        Ok(())
    }

    /// Writes a page at its position.
    pub fn write_page(&self, page_id: PageId, buf: &[u8; PAGE_SIZE]) -> Result<()> {
        self.file.write_all_at(buf, page_id.file_offset())?;

        // Keep the allocator ahead of direct writes past the end
        let mut current = self.next_page_id.load(Ordering::SeqCst);
        while page_id.0 >= current {
            match self.next_page_id.compare_exchange(
                current,
                page_id.0 + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
        Ok(())
    }

    /// Atomically returns and increments the next page id.
    pub fn allocate_page(&self) -> Result<PageId> {
        Ok(PageId(self.next_page_id.fetch_add(1, Ordering::SeqCst)))
    }

    /// Pages are never reused; deallocation is a no-op.
    pub fn deallocate_page(&self, _page_id: PageId) {}

    /// Returns the current file size in bytes.
    pub fn file_size(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    /// Forces kernel buffers to stable storage.
    pub fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

impl PageStore for DiskManager {
    fn read_page(&self, page_id: PageId, buf: &mut [u8; PAGE_SIZE]) -> Result<()> {
        DiskManager::read_page(self, page_id, buf)
    }

    fn write_page(&self, page_id: PageId, buf: &[u8; PAGE_SIZE]) -> Result<()> {
        DiskManager::write_page(self, page_id, buf)
    }

    fn allocate_page(&self) -> Result<PageId> {
        DiskManager::allocate_page(self)
    }

    fn sync(&self) -> Result<()> {
        DiskManager::sync(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn create_test_disk() -> (DiskManager, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let dm = DiskManager::open(dir.path().join("test.db")).unwrap();
        (dm, dir)
    }

    #[test]
    fn test_disk_manager_open_empty() {
        let (dm, _dir) = create_test_disk();
        assert_eq!(dm.next_page_id(), PageId(0));
        assert_eq!(dm.num_pages(), 0);
        assert_eq!(dm.file_size().unwrap(), 0);
    }

    #[test]
    fn test_disk_manager_allocate_monotonic() {
        let (dm, _dir) = create_test_disk();

        assert_eq!(dm.allocate_page().unwrap(), PageId(0));
        assert_eq!(dm.allocate_page().unwrap(), PageId(1));
        assert_eq!(dm.allocate_page().unwrap(), PageId(2));
        assert_eq!(dm.next_page_id(), PageId(3));
    }

    #[test]
    fn test_disk_manager_write_read() {
        let (dm, _dir) = create_test_disk();

        let page_id = dm.allocate_page().unwrap();
        let mut data = [0u8; PAGE_SIZE];
        data[0] = 0xAB;
        data[100] = 0xCD;
        data[PAGE_SIZE - 1] = 0xEF;
        dm.write_page(page_id, &data).unwrap();

        let mut read = [0xFFu8; PAGE_SIZE];
        dm.read_page(page_id, &mut read).unwrap();
        assert_eq!(read[0], 0xAB);
        assert_eq!(read[100], 0xCD);
        assert_eq!(read[PAGE_SIZE - 1], 0xEF);
    }

    #[test]
    fn test_disk_manager_read_past_eof_zero_fills() {
        let (dm, _dir) = create_test_disk();

        let mut buf = [0xFFu8; PAGE_SIZE];
        dm.read_page(PageId(42), &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_disk_manager_next_page_from_file_length() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");

        {
            let dm = DiskManager::open(&path).unwrap();
            let data = [0x11u8; PAGE_SIZE];
            for _ in 0..3 {
                let pid = dm.allocate_page().unwrap();
                dm.write_page(pid, &data).unwrap();
            }
        }

        let dm = DiskManager::open(&path).unwrap();
        assert_eq!(dm.next_page_id(), PageId(3));
        assert_eq!(dm.allocate_page().unwrap(), PageId(3));
    }

    #[test]
    fn test_disk_manager_overwrite_page() {
        let (dm, _dir) = create_test_disk();

        let page_id = dm.allocate_page().unwrap();
        let mut data = [0u8; PAGE_SIZE];
        data[0] = 0xAA;
        dm.write_page(page_id, &data).unwrap();

        data[0] = 0xBB;
        dm.write_page(page_id, &data).unwrap();

        let mut read = [0u8; PAGE_SIZE];
        dm.read_page(page_id, &mut read).unwrap();
        assert_eq!(read[0], 0xBB);
    }

    #[test]
    fn test_disk_manager_write_advances_allocator() {
        let (dm, _dir) = create_test_disk();

        let data = [0u8; PAGE_SIZE];
        dm.write_page(PageId(5), &data).unwrap();
        assert_eq!(dm.allocate_page().unwrap(), PageId(6));
    }

    #[test]
    fn test_disk_manager_deallocate_is_noop() {
        let (dm, _dir) = create_test_disk();

        let pid = dm.allocate_page().unwrap();
        dm.deallocate_page(pid);
        assert_eq!(dm.allocate_page().unwrap(), PageId(1));
    }

    #[test]
    fn test_disk_manager_sync() {
        let (dm, _dir) = create_test_disk();
        let pid = dm.allocate_page().unwrap();
        dm.write_page(pid, &[0u8; PAGE_SIZE]).unwrap();
        dm.sync().unwrap();
    }

    #[test]
    fn test_disk_manager_persistence() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");
        let page_id;

        {
            let dm = DiskManager::open(&path).unwrap();
            page_id = dm.allocate_page().unwrap();
            let mut data = [0u8; PAGE_SIZE];
            data[0] = 0xFF;
            dm.write_page(page_id, &data).unwrap();
            dm.sync().unwrap();
        }

        let dm = DiskManager::open(&path).unwrap();
        let mut read = [0u8; PAGE_SIZE];
        dm.read_page(page_id, &mut read).unwrap();
        assert_eq!(read[0], 0xFF);
    }
}
