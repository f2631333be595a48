//! On-disk B+ tree index with variable-length string keys.
//!
//! Each node occupies one page:
//! ```text
//! NodeHeader: is_leaf (u8) | num_keys (u16) | next_leaf (u32)
//! Leaf payload:     [key_len (u16) | key | page_id (u32) | slot (u16)]*
//! Internal payload: child0 (u32) | [key_len (u16) | key | child (u32)]*
//! ```
//! Leaves form a singly-linked chain through `next_leaf`, terminated by
//! the invalid page id. Duplicate keys are permitted and kept in
//! insertion order (new entries land after existing equal keys).
//! Deletion removes the first matching entry and never rebalances.

use bytes::Bytes;
use nimbus_buffer::BufferPool;
use nimbus_common::page::{PageId, RecordId, PAGE_SIZE};
use nimbus_common::{NimbusError, Result};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Size of the node header in bytes.
pub const NODE_HEADER_SIZE: usize = 7;

/// Default fanout bound.
pub const DEFAULT_MAX_KEYS: u16 = 50;

/// Longest accepted key, chosen so a node at `max_keys + 1` entries
/// always fits in one page.
pub const MAX_KEY_SIZE: usize = 64;

/// Header at the front of every tree node.
#[derive(Debug, Clone, Copy)]
struct NodeHeader {
    is_leaf: bool,
    num_keys: u16,
    next_leaf: PageId,
}

impl NodeHeader {
    fn to_bytes(self) -> [u8; NODE_HEADER_SIZE] {
        let mut buf = [0u8; NODE_HEADER_SIZE];
        buf[0] = self.is_leaf as u8;
        buf[1..3].copy_from_slice(&self.num_keys.to_le_bytes());
        buf[3..7].copy_from_slice(&self.next_leaf.0.to_le_bytes());
        buf
    }

    fn from_bytes(buf: &[u8]) -> Self {
        Self {
            is_leaf: buf[0] != 0,
            num_keys: u16::from_le_bytes([buf[1], buf[2]]),
            next_leaf: PageId(u32::from_le_bytes([buf[3], buf[4], buf[5], buf[6]])),
        }
    }
}

fn corrupt(page_id: PageId, what: &str) -> NimbusError {
    NimbusError::BTreeCorrupted(format!("page {}: {}", page_id, what))
}

/// Decodes a leaf node into its entries and next-leaf pointer.
fn read_leaf(page_id: PageId, data: &[u8]) -> Result<(Vec<(Bytes, RecordId)>, PageId)> {
    let header = NodeHeader::from_bytes(data);
    let mut entries = Vec::with_capacity(header.num_keys as usize);
    let mut offset = NODE_HEADER_SIZE;

    for _ in 0..header.num_keys {
        if offset + 2 > PAGE_SIZE {
            return Err(corrupt(page_id, "leaf entry header past page end"));
        }
        let key_len = u16::from_le_bytes([data[offset], data[offset + 1]]) as usize;
        offset += 2;

        if offset + key_len + 6 > PAGE_SIZE {
            return Err(corrupt(page_id, "leaf entry past page end"));
        }
        let key = Bytes::copy_from_slice(&data[offset..offset + key_len]);
        offset += key_len;

        let page = u32::from_le_bytes([
            data[offset],
            data[offset + 1],
            data[offset + 2],
            data[offset + 3],
        ]);
        offset += 4;
        let slot = u16::from_le_bytes([data[offset], data[offset + 1]]);
        offset += 2;

        entries.push((key, RecordId::new(PageId(page), slot)));
    }

    Ok((entries, header.next_leaf))
}

/// Encodes a leaf node over the page buffer.
fn write_leaf(data: &mut [u8], entries: &[(Bytes, RecordId)], next_leaf: PageId) {
    data.fill(0);
    let header = NodeHeader {
        is_leaf: true,
        num_keys: entries.len() as u16,
        next_leaf,
    };
    data[..NODE_HEADER_SIZE].copy_from_slice(&header.to_bytes());

    let mut offset = NODE_HEADER_SIZE;
    for (key, rid) in entries {
        data[offset..offset + 2].copy_from_slice(&(key.len() as u16).to_le_bytes());
        offset += 2;
        data[offset..offset + key.len()].copy_from_slice(key);
        offset += key.len();
        data[offset..offset + 4].copy_from_slice(&rid.page_id.0.to_le_bytes());
        offset += 4;
        data[offset..offset + 2].copy_from_slice(&rid.slot_id.to_le_bytes());
        offset += 2;
    }
}

/// Decodes an internal node into its separator keys and children.
fn read_internal(page_id: PageId, data: &[u8]) -> Result<(Vec<Bytes>, Vec<PageId>)> {
    let header = NodeHeader::from_bytes(data);
    let mut keys = Vec::with_capacity(header.num_keys as usize);
    let mut children = Vec::with_capacity(header.num_keys as usize + 1);
    let mut offset = NODE_HEADER_SIZE;

    if offset + 4 > PAGE_SIZE {
        return Err(corrupt(page_id, "missing leftmost child"));
    }
    children.push(PageId(u32::from_le_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])));
    offset += 4;

    for _ in 0..header.num_keys {
        if offset + 2 > PAGE_SIZE {
            return Err(corrupt(page_id, "internal entry header past page end"));
        }
        let key_len = u16::from_le_bytes([data[offset], data[offset + 1]]) as usize;
        offset += 2;

        if offset + key_len + 4 > PAGE_SIZE {
            return Err(corrupt(page_id, "internal entry past page end"));
        }
        keys.push(Bytes::copy_from_slice(&data[offset..offset + key_len]));
        offset += key_len;

        children.push(PageId(u32::from_le_bytes([
            data[offset],
            data[offset + 1],
            data[offset + 2],
            data[offset + 3],
        ])));
        offset += 4;
    }

    Ok((keys, children))
}

/// Encodes an internal node over the page buffer.
fn write_internal(data: &mut [u8], keys: &[Bytes], children: &[PageId]) {
    data.fill(0);
    let header = NodeHeader {
        is_leaf: false,
        num_keys: keys.len() as u16,
        next_leaf: PageId::INVALID,
    };
    data[..NODE_HEADER_SIZE].copy_from_slice(&header.to_bytes());

    let mut offset = NODE_HEADER_SIZE;
    data[offset..offset + 4].copy_from_slice(&children[0].0.to_le_bytes());
    offset += 4;

    for (i, key) in keys.iter().enumerate() {
        data[offset..offset + 2].copy_from_slice(&(key.len() as u16).to_le_bytes());
        offset += 2;
        data[offset..offset + key.len()].copy_from_slice(key);
        offset += key.len();
        data[offset..offset + 4].copy_from_slice(&children[i + 1].0.to_le_bytes());
        offset += 4;
    }
}

/// Result of a recursive insert: a separator and the new right sibling
/// to hook into the parent, when the child split.
struct SplitResult {
    separator: Bytes,
    new_page_id: PageId,
}

/// B+ tree bound to a root page in the buffer pool.
///
/// The root page id changes when the root splits; the catalog persists
/// the current value.
pub struct BPlusTree {
    pool: Arc<BufferPool>,
    root_page_id: AtomicU32,
    max_keys: u16,
}

impl BPlusTree {
    /// Opens a tree over an existing root page.
    pub fn new(pool: Arc<BufferPool>, root_page_id: PageId, max_keys: u16) -> Self {
        Self {
            pool,
            root_page_id: AtomicU32::new(root_page_id.0),
            max_keys,
        }
    }

    /// Allocates a fresh tree: the root starts as an empty leaf.
    pub fn create(pool: Arc<BufferPool>, max_keys: u16) -> Result<Self> {
        let (root_page_id, frame) = pool.new_page()?;
        {
            let mut data = frame.write_data();
            write_leaf(&mut **data, &[], PageId::INVALID);
        }
        pool.unpin_page(root_page_id, true);

        Ok(Self::new(pool, root_page_id, max_keys))
    }

    /// Returns the current root page id.
    pub fn root_page_id(&self) -> PageId {
        PageId(self.root_page_id.load(Ordering::SeqCst))
    }

    /// Walks from the root to the leaf that covers `key`.
    fn find_leaf(&self, key: &[u8]) -> Result<PageId> {
        let mut current = self.root_page_id();

        loop {
            let guard = self.pool.read_page(current)?;
            let data = guard.data();

            let header = NodeHeader::from_bytes(&**data);
            if header.is_leaf {
                return Ok(current);
            }

            let (keys, children) = read_internal(current, &**data)?;
            let mut idx = 0;
            while idx < keys.len() && key >= keys[idx].as_ref() {
                idx += 1;
            }
            current = children[idx];
        }
    }

    /// Looks up the first entry with an exactly matching key.
    pub fn search(&self, key: &str) -> Result<Option<RecordId>> {
        let leaf = self.find_leaf(key.as_bytes())?;
        let guard = self.pool.read_page(leaf)?;
        let (entries, _) = read_leaf(leaf, &**guard.data())?;

        Ok(entries
            .iter()
            .find(|(k, _)| k.as_ref() == key.as_bytes())
            .map(|(_, rid)| *rid))
    }

    /// Inserts a key/record pair. Duplicates are placed after existing
    /// entries with the same key.
    pub fn insert(&self, key: &str, rid: RecordId) -> Result<()> {
        if key.len() > MAX_KEY_SIZE {
            return Err(NimbusError::KeyTooLarge {
                size: key.len(),
                max: MAX_KEY_SIZE,
            });
        }

        let root = self.root_page_id();
        if let Some(split) = self.insert_recursive(root, key.as_bytes(), rid)? {
            // Root split: grow the tree by one level
            let (new_root, frame) = self.pool.new_page()?;
            {
                let mut data = frame.write_data();
                write_internal(
                    &mut **data,
                    &[split.separator],
                    &[root, split.new_page_id],
                );
            }
            self.pool.unpin_page(new_root, true);
            self.root_page_id.store(new_root.0, Ordering::SeqCst);
        }
        Ok(())
    }

    fn insert_recursive(
        &self,
        page_id: PageId,
        key: &[u8],
        rid: RecordId,
    ) -> Result<Option<SplitResult>> {
        let is_leaf = {
            let guard = self.pool.read_page(page_id)?;
            let data = guard.data();
            NodeHeader::from_bytes(&**data).is_leaf
        };

        if is_leaf {
            self.insert_into_leaf(page_id, key, rid)
        } else {
            self.insert_into_internal(page_id, key, rid)
        }
    }

    fn insert_into_leaf(
        &self,
        page_id: PageId,
        key: &[u8],
        rid: RecordId,
    ) -> Result<Option<SplitResult>> {
        let guard = self.pool.write_page(page_id)?;
        let (mut entries, next_leaf) = read_leaf(page_id, &**guard.data())?;

        // Upper bound: new entries go after existing equal keys
        let pos = entries.partition_point(|(k, _)| k.as_ref() <= key);
        entries.insert(pos, (Bytes::copy_from_slice(key), rid));

        if entries.len() <= self.max_keys as usize {
            write_leaf(&mut **guard.data_mut(), &entries, next_leaf);
            guard.set_dirty();
            return Ok(None);
        }

        // Split: left half keeps [0, mid), right half moves out
        let mid = entries.len() / 2;
        let right: Vec<_> = entries.split_off(mid);
        let separator = right[0].0.clone();

        let (new_page_id, new_frame) = self.pool.new_page()?;
        {
            let mut data = new_frame.write_data();
            write_leaf(&mut **data, &right, next_leaf);
        }
        self.pool.unpin_page(new_page_id, true);

        // The original leaf now chains to its new right sibling
        write_leaf(&mut **guard.data_mut(), &entries, new_page_id);
        guard.set_dirty();

        Ok(Some(SplitResult {
            separator,
            new_page_id,
        }))
    }

    fn insert_into_internal(
        &self,
        page_id: PageId,
        key: &[u8],
        rid: RecordId,
    ) -> Result<Option<SplitResult>> {
        let (mut keys, mut children) = {
            let guard = self.pool.read_page(page_id)?;
            let result = read_internal(page_id, &**guard.data())?;
            result
        };

        let mut idx = 0;
        while idx < keys.len() && key >= keys[idx].as_ref() {
            idx += 1;
        }

        let child_split = self.insert_recursive(children[idx], key, rid)?;
        let Some(split) = child_split else {
            return Ok(None);
        };

        keys.insert(idx, split.separator);
        children.insert(idx + 1, split.new_page_id);

        if keys.len() <= self.max_keys as usize {
            let guard = self.pool.write_page(page_id)?;
            write_internal(&mut **guard.data_mut(), &keys, &children);
            guard.set_dirty();
            return Ok(None);
        }

        // Internal split consumes the median key instead of copying it
        let mid = keys.len() / 2;
        let separator = keys[mid].clone();

        let right_keys: Vec<_> = keys[mid + 1..].to_vec();
        let right_children: Vec<_> = children[mid + 1..].to_vec();
        keys.truncate(mid);
        children.truncate(mid + 1);

        let (new_page_id, new_frame) = self.pool.new_page()?;
        {
            let mut data = new_frame.write_data();
            write_internal(&mut **data, &right_keys, &right_children);
        }
        self.pool.unpin_page(new_page_id, true);

        let guard = self.pool.write_page(page_id)?;
        write_internal(&mut **guard.data_mut(), &keys, &children);
        guard.set_dirty();

        Ok(Some(SplitResult {
            separator,
            new_page_id,
        }))
    }

    /// Removes the first entry matching `key`. Under-full leaves are
    /// tolerated; there is no rebalancing.
    pub fn delete(&self, key: &str) -> Result<bool> {
        let leaf = self.find_leaf(key.as_bytes())?;
        let guard = self.pool.write_page(leaf)?;
        let (mut entries, next_leaf) = read_leaf(leaf, &**guard.data())?;

        let Some(pos) = entries.iter().position(|(k, _)| k.as_ref() == key.as_bytes())
        else {
            return Ok(false);
        };

        entries.remove(pos);
        write_leaf(&mut **guard.data_mut(), &entries, next_leaf);
        guard.set_dirty();
        Ok(true)
    }

    /// Yields all entries with `lo <= key <= hi` in key order by
    /// walking the leaf chain from the leaf covering `lo`.
    pub fn range_scan(&self, lo: &str, hi: &str) -> Result<Vec<(String, RecordId)>> {
        let mut results = Vec::new();
        let lo = lo.as_bytes();
        let hi = hi.as_bytes();

        let mut leaf = self.find_leaf(lo)?;
        while leaf.is_valid() {
            let (entries, next_leaf) = {
                let guard = self.pool.read_page(leaf)?;
                let result = read_leaf(leaf, &**guard.data())?;
                result
            };

            for (key, rid) in entries {
                if key.as_ref() > hi {
                    return Ok(results);
                }
                if key.as_ref() >= lo {
                    results.push((String::from_utf8_lossy(&key).into_owned(), rid));
                }
            }

            leaf = next_leaf;
        }

        Ok(results)
    }
}
