//! Heap file: an unordered collection of documents over slotted pages.
//!
//! The heap file coordinates the free-space map (to pick a target
//! page), the buffer pool (to materialize it), and the slotted-page
//! functions (to place or remove the record). Records are reachable
//! only by their record id; there is no secondary directory.

use crate::freespace::FreeSpaceMap;
use crate::heap::page::{SlotEntry, SlottedPage};
use nimbus_buffer::BufferPool;
use nimbus_common::document::Document;
use nimbus_common::page::{PageId, RecordId};
use nimbus_common::{NimbusError, Result};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Heap file bound to a first data page and a free-space map.
pub struct HeapFile {
    pool: Arc<BufferPool>,
    fsm: FreeSpaceMap,
    /// First data page (persisted in the catalog).
    first_page_id: PageId,
    /// Highest page id this heap has seen; raised on allocation, and
    /// by the catalog at load time from the file length.
    max_page_id: AtomicU32,
}

impl HeapFile {
    /// Creates a heap file over existing pages.
    pub fn new(pool: Arc<BufferPool>, fsm: FreeSpaceMap, first_page_id: PageId) -> Self {
        Self {
            pool,
            fsm,
            first_page_id,
            max_page_id: AtomicU32::new(first_page_id.0),
        }
    }

    /// Returns the first data page id.
    pub fn first_page_id(&self) -> PageId {
        self.first_page_id
    }

    /// Returns the highest page id this heap scans to.
    pub fn max_page_id(&self) -> PageId {
        PageId(self.max_page_id.load(Ordering::SeqCst))
    }

    /// Raises the scan bound (used after reopening the database, when
    /// the bound is derived from the file length).
    pub fn set_max_page_id(&self, page_id: PageId) {
        self.max_page_id.store(page_id.0, Ordering::SeqCst);
    }

    /// Returns the free-space map backing this heap.
    pub fn fsm(&self) -> &FreeSpaceMap {
        &self.fsm
    }

    /// Allocates a fresh data page, initializes it as a slotted page,
    /// and registers it with the FSM.
    fn allocate_new_page(&self) -> Result<PageId> {
        let (page_id, frame) = self.pool.new_page()?;

        let free_space = {
            let mut data = frame.write_data();
            SlottedPage::init(&mut **data);
            SlottedPage::free_space(&**data)
        };
        self.pool.unpin_page(page_id, true);

        self.fsm.register_new_page(page_id, free_space)?;

        self.max_page_id.fetch_max(page_id.0, Ordering::SeqCst);
        Ok(page_id)
    }

    /// Inserts a document, returning its record id.
    ///
    /// The FSM nominates a page; if its estimate was stale and the
    /// slotted insert refuses, a fresh page is tried exactly once
    /// before the record is declared too large.
    pub fn insert(&self, doc: &Document) -> Result<RecordId> {
        let record = doc.serialize();
        let total_needed = record.len() + SlotEntry::SIZE;

        let mut target = match self.fsm.find_page_with_space(total_needed)? {
            Some(page_id) => page_id,
            None => self.allocate_new_page()?,
        };

        let mut slot = self.insert_into_page(target, &record)?;
        if slot.is_none() {
            // Stale FSM entry; retry once on a brand-new page
            target = self.allocate_new_page()?;
            slot = self.insert_into_page(target, &record)?;
        }

        match slot {
            Some(slot_id) => Ok(RecordId::new(target, slot_id)),
            None => Err(NimbusError::RecordTooLarge),
        }
    }

    /// Inserts raw record bytes into one page, updating the FSM on
    /// success. Returns the slot, or None if the page was full.
    fn insert_into_page(&self, page_id: PageId, record: &[u8]) -> Result<Option<u16>> {
        let frame = self.pool.fetch_page(page_id)?;

        let (slot, remaining) = {
            let mut data = frame.write_data();
            let slot = SlottedPage::insert(&mut **data, record);
            (slot, SlottedPage::free_space(&**data))
        };

        match slot {
            Some(slot_id) => {
                self.pool.unpin_page(page_id, true);
                self.fsm.update_free_space(page_id, remaining)?;
                Ok(Some(slot_id))
            }
            None => {
                self.pool.unpin_page(page_id, false);
                Ok(None)
            }
        }
    }

    /// Deletes a record. Returns false if it does not exist.
    pub fn delete(&self, rid: RecordId) -> Result<bool> {
        let frame = self.pool.fetch_page(rid.page_id)?;

        let (deleted, remaining) = {
            let mut data = frame.write_data();
            let deleted = SlottedPage::delete(&mut **data, rid.slot_id);
            (deleted, SlottedPage::free_space(&**data))
        };
        self.pool.unpin_page(rid.page_id, deleted);

        if deleted {
            self.fsm.update_free_space(rid.page_id, remaining)?;
        }
        Ok(deleted)
    }

    /// Fetches and deserializes a record. Missing records are a hard
    /// failure.
    pub fn get(&self, rid: RecordId) -> Result<Document> {
        let guard = self.pool.read_page(rid.page_id)?;
        let data = guard.data();

        match SlottedPage::get(&**data, rid.slot_id) {
            Some(bytes) => Document::deserialize(bytes),
            None => Err(NimbusError::RecordNotFound(rid.to_string())),
        }
    }

    /// Updates a record in place when the new serialization fits;
    /// otherwise deletes and re-inserts. The returned record id may
    /// differ from the one passed in.
    pub fn update(&self, rid: RecordId, doc: &Document) -> Result<RecordId> {
        let record = doc.serialize();

        let frame = self.pool.fetch_page(rid.page_id)?;
        let updated = {
            let mut data = frame.write_data();
            SlottedPage::update(&mut **data, rid.slot_id, &record)
        };
        self.pool.unpin_page(rid.page_id, updated);

        if updated {
            return Ok(rid);
        }

        if !self.delete(rid)? {
            return Err(NimbusError::RecordNotFound(rid.to_string()));
        }
        self.insert(doc)
    }

    /// Iterates all live records from the first page through the scan
    /// bound. Every page is unpinned before the iterator advances.
    pub fn iter(&self) -> HeapFileIter<'_> {
        HeapFileIter {
            heap: self,
            current_page: self.first_page_id.0,
            max_page: self.max_page_id.load(Ordering::SeqCst),
            current_slot: 0,
        }
    }
}

/// Sequential iterator over the records of a heap file.
pub struct HeapFileIter<'a> {
    heap: &'a HeapFile,
    current_page: u32,
    max_page: u32,
    current_slot: u16,
}

impl Iterator for HeapFileIter<'_> {
    type Item = (RecordId, Document);

    fn next(&mut self) -> Option<Self::Item> {
        while self.current_page <= self.max_page {
            let page_id = PageId(self.current_page);

            let guard = match self.heap.pool.read_page(page_id) {
                Ok(guard) => guard,
                Err(_) => {
                    self.current_page += 1;
                    self.current_slot = 0;
                    continue;
                }
            };

            {
                let data = guard.data();
                let num_slots = SlottedPage::num_slots(&**data);

                while self.current_slot < num_slots {
                    let slot_id = self.current_slot;
                    self.current_slot += 1;

                    if let Some(bytes) = SlottedPage::get(&**data, slot_id) {
                        // A page that decodes as garbage is skipped
                        if let Ok(doc) = Document::deserialize(bytes) {
                            let rid = RecordId::new(page_id, slot_id);
                            return Some((rid, doc));
                        }
                    }
                }
            }

            self.current_page += 1;
            self.current_slot = 0;
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::DiskManager;
    use nimbus_buffer::BufferPoolConfig;
    use nimbus_common::document::Value;
    use nimbus_common::PAGE_SIZE;
    use tempfile::tempdir;

    fn create_test_heap() -> (HeapFile, Arc<BufferPool>, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let disk = Arc::new(DiskManager::open(dir.path().join("test.db")).unwrap());
        let pool = Arc::new(BufferPool::new(
            disk,
            BufferPoolConfig { num_frames: 64 },
        ));

        // FSM page, then the first heap page
        let (fsm_page, _) = pool.new_page().unwrap();
        pool.unpin_page(fsm_page, true);
        let fsm = FreeSpaceMap::new(pool.clone(), fsm_page);

        let (first_page, frame) = pool.new_page().unwrap();
        {
            let mut data = frame.write_data();
            SlottedPage::init(&mut **data);
        }
        pool.unpin_page(first_page, true);
        fsm.register_new_page(first_page, PAGE_SIZE - 8).unwrap();

        let heap = HeapFile::new(pool.clone(), fsm, first_page);
        (heap, pool, dir)
    }

    fn doc(name: &str, age: i32) -> Document {
        let mut d = Document::new();
        d.insert("name", name);
        d.insert("age", age);
        d
    }

    #[test]
    fn test_heap_insert_and_get() {
        let (heap, _pool, _dir) = create_test_heap();

        let rid = heap.insert(&doc("Alice", 30)).unwrap();
        assert!(rid.is_valid());

        let got = heap.get(rid).unwrap();
        assert_eq!(got.get("name"), Some(&Value::String("Alice".to_string())));
        assert_eq!(got.get("age"), Some(&Value::Int32(30)));
    }

    #[test]
    fn test_heap_get_missing_is_error() {
        let (heap, _pool, _dir) = create_test_heap();

        let rid = RecordId::new(heap.first_page_id(), 12);
        assert!(matches!(
            heap.get(rid),
            Err(NimbusError::RecordNotFound(_))
        ));
    }

    #[test]
    fn test_heap_delete() {
        let (heap, _pool, _dir) = create_test_heap();

        let rid = heap.insert(&doc("Bob", 25)).unwrap();
        assert!(heap.delete(rid).unwrap());
        assert!(heap.get(rid).is_err());

        // Second delete reports absence
        assert!(!heap.delete(rid).unwrap());
    }

    #[test]
    fn test_heap_update_in_place() {
        let (heap, _pool, _dir) = create_test_heap();

        let rid = heap.insert(&doc("Carol", 40)).unwrap();
        let new_rid = heap.update(rid, &doc("Carol", 41)).unwrap();

        // Same size: must stay at the same record id
        assert_eq!(new_rid, rid);
        let got = heap.get(rid).unwrap();
        assert_eq!(got.get("age"), Some(&Value::Int32(41)));
    }

    #[test]
    fn test_heap_update_relocates_when_larger() {
        let (heap, _pool, _dir) = create_test_heap();

        let rid = heap.insert(&doc("Dan", 1)).unwrap();

        let mut bigger = doc("Dan", 1);
        bigger.insert("bio", "x".repeat(200));
        let new_rid = heap.update(rid, &bigger).unwrap();

        assert_ne!(new_rid, rid);
        assert!(heap.get(rid).is_err());
        let got = heap.get(new_rid).unwrap();
        assert_eq!(got.get("bio"), Some(&Value::String("x".repeat(200))));
    }

    #[test]
    fn test_heap_iter_all_records() {
        let (heap, _pool, _dir) = create_test_heap();

        for i in 0..20 {
            heap.insert(&doc(&format!("User_{}", i), 20 + i)).unwrap();
        }

        let records: Vec<_> = heap.iter().collect();
        assert_eq!(records.len(), 20);
    }

    #[test]
    fn test_heap_iter_skips_deleted() {
        let (heap, _pool, _dir) = create_test_heap();

        let mut rids = Vec::new();
        for i in 0..10 {
            rids.push(heap.insert(&doc(&format!("User_{}", i), i)).unwrap());
        }
        heap.delete(rids[0]).unwrap();
        heap.delete(rids[5]).unwrap();

        let records: Vec<_> = heap.iter().collect();
        assert_eq!(records.len(), 8);
        assert!(records.iter().all(|(rid, _)| *rid != rids[0] && *rid != rids[5]));
    }

    #[test]
    fn test_heap_spills_to_new_pages() {
        let (heap, _pool, _dir) = create_test_heap();

        // ~400-byte payloads: roughly 9 per page, so 50 need several pages
        for i in 0..50 {
            let mut d = doc(&format!("User_{}", i), i);
            d.insert("pad", "y".repeat(400));
            heap.insert(&d).unwrap();
        }

        assert!(heap.max_page_id() > heap.first_page_id());
        assert_eq!(heap.iter().count(), 50);
    }

    #[test]
    fn test_heap_reuses_freed_space() {
        let (heap, _pool, _dir) = create_test_heap();

        let rid = heap.insert(&doc("victim", 0)).unwrap();
        heap.delete(rid).unwrap();

        let rid2 = heap.insert(&doc("reuser", 1)).unwrap();
        assert_eq!(rid2.page_id, rid.page_id);
    }

    #[test]
    fn test_heap_record_too_large() {
        let (heap, _pool, _dir) = create_test_heap();

        let mut huge = Document::new();
        huge.insert("blob", "z".repeat(PAGE_SIZE));
        assert!(matches!(
            heap.insert(&huge),
            Err(NimbusError::RecordTooLarge)
        ));
    }

    #[test]
    fn test_heap_set_max_page_id_extends_scan() {
        let (heap, pool, _dir) = create_test_heap();

        heap.insert(&doc("a", 1)).unwrap();

        // Simulate a record written beyond the current bound, as a
        // reopened database would see it
        let (extra_page, frame) = pool.new_page().unwrap();
        {
            let mut data = frame.write_data();
            SlottedPage::init(&mut **data);
            SlottedPage::insert(&mut **data, &doc("b", 2).serialize()).unwrap();
        }
        pool.unpin_page(extra_page, true);

        assert_eq!(heap.iter().count(), 1);
        heap.set_max_page_id(extra_page);
        assert_eq!(heap.iter().count(), 2);
    }
}
