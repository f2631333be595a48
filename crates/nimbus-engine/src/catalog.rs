//! Catalog: collection and index metadata on page 0.
//!
//! Page 0 layout:
//! ```text
//! num_collections (u32)
//! repeat num_collections:
//!   name_len (u32), name_bytes,
//!   fsm_page (u32), first_heap_page (u32),
//!   num_indexes (u32),
//!   repeat num_indexes:
//!     field_len (u32), field_bytes, btree_root (u32)
//! ```
//! The serialized image must stay within one page; crossing the
//! 4,000-byte mark is a hard error rather than a silent truncation.

use log::info;
use nimbus_buffer::BufferPool;
use nimbus_common::document::Value;
use nimbus_common::page::{PageId, PAGE_SIZE};
use nimbus_common::{NimbusError, Result};
use nimbus_storage::{BPlusTree, FreeSpaceMap, HeapFile, SlottedPage};
use std::collections::BTreeMap;
use std::sync::Arc;

/// The page reserved for catalog metadata.
pub const CATALOG_PAGE: PageId = PageId(0);

/// Serialized catalog images beyond this many bytes do not fit the
/// catalog page.
pub const CATALOG_SIZE_LIMIT: usize = 4000;

/// Loads with more collections than this are treated as corrupt.
const MAX_PLAUSIBLE_COLLECTIONS: u32 = 1000;

/// A secondary index over one document field.
pub struct IndexInfo {
    pub field_name: String,
    pub btree: BPlusTree,
}

/// A collection: its heap file, free-space map, and indexes.
pub struct CollectionInfo {
    pub name: String,
    pub fsm_page: PageId,
    pub first_heap_page: PageId,
    pub heap_file: HeapFile,
    pub indexes: Vec<IndexInfo>,
}

/// Collection metadata, persisted on page 0.
pub struct Catalog {
    pool: Arc<BufferPool>,
    btree_max_keys: u16,
    collections: BTreeMap<String, CollectionInfo>,
}

/// Coerces a field value to an index key: strings index as themselves,
/// 32-bit integers as their decimal representation, everything else is
/// not indexed.
pub fn value_to_index_key(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Int32(v) => Some(v.to_string()),
        _ => None,
    }
}

impl Catalog {
    /// Creates an empty catalog.
    pub fn new(pool: Arc<BufferPool>, btree_max_keys: u16) -> Self {
        Self {
            pool,
            btree_max_keys,
            collections: BTreeMap::new(),
        }
    }

    /// Returns the collection names in order.
    pub fn list_collections(&self) -> Vec<String> {
        self.collections.keys().cloned().collect()
    }

    /// Looks up a collection.
    pub fn get(&self, name: &str) -> Option<&CollectionInfo> {
        self.collections.get(name)
    }

    /// Looks up a collection mutably.
    pub fn get_mut(&mut self, name: &str) -> Option<&mut CollectionInfo> {
        self.collections.get_mut(name)
    }

    /// Creates a collection: a zeroed FSM page plus an initialized
    /// first heap page, registered with the FSM.
    pub fn create_collection(&mut self, name: &str) -> Result<()> {
        if self.collections.contains_key(name) {
            return Err(NimbusError::CollectionExists(name.to_string()));
        }

        let (fsm_page, _frame) = self.pool.new_page()?;
        self.pool.unpin_page(fsm_page, true);

        let (heap_page, frame) = self.pool.new_page()?;
        let free_space = {
            let mut data = frame.write_data();
            SlottedPage::init(&mut **data);
            SlottedPage::free_space(&**data)
        };
        self.pool.unpin_page(heap_page, true);

        let fsm = FreeSpaceMap::new(self.pool.clone(), fsm_page);
        fsm.register_new_page(heap_page, free_space)?;

        let heap_file = HeapFile::new(self.pool.clone(), fsm, heap_page);

        self.collections.insert(
            name.to_string(),
            CollectionInfo {
                name: name.to_string(),
                fsm_page,
                first_heap_page: heap_page,
                heap_file,
                indexes: Vec::new(),
            },
        );

        info!(
            "catalog: created collection '{}' (fsm page {}, heap page {})",
            name, fsm_page, heap_page
        );
        Ok(())
    }

    /// Removes a collection from the catalog. Its pages are not
    /// reclaimed.
    pub fn drop_collection(&mut self, name: &str) -> Result<()> {
        if self.collections.remove(name).is_none() {
            return Err(NimbusError::CollectionNotFound(name.to_string()));
        }
        info!("catalog: dropped collection '{}'", name);
        Ok(())
    }

    /// Creates an index on a field, building it from existing records.
    ///
    /// String fields index as themselves and 32-bit integer fields as
    /// decimal strings; records with other types (or without the
    /// field) are skipped.
    pub fn create_index(&mut self, collection: &str, field: &str) -> Result<()> {
        let pool = self.pool.clone();
        let max_keys = self.btree_max_keys;

        let coll = self
            .collections
            .get_mut(collection)
            .ok_or_else(|| NimbusError::CollectionNotFound(collection.to_string()))?;

        if coll.indexes.iter().any(|idx| idx.field_name == field) {
            return Err(NimbusError::IndexExists(field.to_string()));
        }

        let btree = BPlusTree::create(pool, max_keys)?;

        let mut indexed = 0usize;
        for (rid, doc) in coll.heap_file.iter() {
            if let Some(value) = doc.get(field) {
                if let Some(key) = value_to_index_key(value) {
                    btree.insert(&key, rid)?;
                    indexed += 1;
                }
            }
        }

        info!(
            "catalog: created index on '{}.{}' (root page {}, {} entries)",
            collection,
            field,
            btree.root_page_id(),
            indexed
        );

        coll.indexes.push(IndexInfo {
            field_name: field.to_string(),
            btree,
        });
        Ok(())
    }

    /// Serializes the catalog image, enforcing the single-page limit.
    fn serialize(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(256);
        buf.extend_from_slice(&(self.collections.len() as u32).to_le_bytes());

        for (name, info) in &self.collections {
            buf.extend_from_slice(&(name.len() as u32).to_le_bytes());
            buf.extend_from_slice(name.as_bytes());
            buf.extend_from_slice(&info.fsm_page.0.to_le_bytes());
            buf.extend_from_slice(&info.first_heap_page.0.to_le_bytes());
            buf.extend_from_slice(&(info.indexes.len() as u32).to_le_bytes());

            for idx in &info.indexes {
                buf.extend_from_slice(&(idx.field_name.len() as u32).to_le_bytes());
                buf.extend_from_slice(idx.field_name.as_bytes());
                buf.extend_from_slice(&idx.btree.root_page_id().0.to_le_bytes());
            }
        }

        if buf.len() > CATALOG_SIZE_LIMIT {
            return Err(NimbusError::CatalogFull);
        }
        Ok(buf)
    }

    /// Overwrites page 0 with the catalog image and flushes the pool.
    pub fn save(&self) -> Result<()> {
        let image = self.serialize()?;

        {
            let guard = self.pool.write_page(CATALOG_PAGE)?;
            let mut data = guard.data_mut();
            data.fill(0);
            data[..image.len()].copy_from_slice(&image);
            guard.set_dirty();
        }

        self.pool.flush_all()?;
        Ok(())
    }

    /// Rebuilds collection and index objects from page 0.
    ///
    /// Implausible metadata (no collections, or more than 1000) is
    /// treated as an empty catalog. Heap scan bounds are raised to
    /// `max_page_id`, derived by the caller from the file length.
    pub fn load(&mut self, max_page_id: PageId) -> Result<()> {
        let guard = self.pool.read_page(CATALOG_PAGE)?;
        let data = guard.data();

        let mut offset = 0usize;
        let Some(num_collections) = read_u32(&data[..], &mut offset) else {
            return Ok(());
        };
        if num_collections == 0 || num_collections > MAX_PLAUSIBLE_COLLECTIONS {
            return Ok(());
        }

        'collections: for _ in 0..num_collections {
            let Some(name) = read_name(&data[..], &mut offset) else {
                break;
            };
            let Some(fsm_page) = read_u32(&data[..], &mut offset) else {
                break;
            };
            let Some(first_heap_page) = read_u32(&data[..], &mut offset) else {
                break;
            };
            let Some(num_indexes) = read_u32(&data[..], &mut offset) else {
                break;
            };

            let fsm_page = PageId(fsm_page);
            let first_heap_page = PageId(first_heap_page);
            let fsm = FreeSpaceMap::new(self.pool.clone(), fsm_page);
            let heap_file = HeapFile::new(self.pool.clone(), fsm, first_heap_page);
            heap_file.set_max_page_id(max_page_id);

            let mut indexes = Vec::new();
            for _ in 0..num_indexes {
                let Some(field_name) = read_name(&data[..], &mut offset) else {
                    break 'collections;
                };
                let Some(root) = read_u32(&data[..], &mut offset) else {
                    break 'collections;
                };
                indexes.push(IndexInfo {
                    field_name,
                    btree: BPlusTree::new(self.pool.clone(), PageId(root), self.btree_max_keys),
                });
            }

            self.collections.insert(
                name.clone(),
                CollectionInfo {
                    name,
                    fsm_page,
                    first_heap_page,
                    heap_file,
                    indexes,
                },
            );
        }

        if !self.collections.is_empty() {
            info!(
                "catalog: loaded {} collection(s) from disk",
                self.collections.len()
            );
        }
        Ok(())
    }
}

fn read_u32(data: &[u8], offset: &mut usize) -> Option<u32> {
    if *offset + 4 > PAGE_SIZE {
        return None;
    }
    let v = u32::from_le_bytes([
        data[*offset],
        data[*offset + 1],
        data[*offset + 2],
        data[*offset + 3],
    ]);
    *offset += 4;
    Some(v)
}

fn read_name(data: &[u8], offset: &mut usize) -> Option<String> {
    let len = read_u32(data, offset)? as usize;
    if len == 0 || len > 255 || *offset + len > PAGE_SIZE {
        return None;
    }
    let s = std::str::from_utf8(&data[*offset..*offset + len])
        .ok()?
        .to_string();
    *offset += len;
    Some(s)
}
