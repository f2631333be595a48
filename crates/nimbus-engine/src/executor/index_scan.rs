//! Index scan executor: B+ tree range scan with heap materialization.

use super::{Executor, Tuple};
use nimbus_common::page::RecordId;
use nimbus_common::Result;
use nimbus_storage::{BPlusTree, HeapFile};

/// Scans an index over `[lo, hi]` and materializes each hit from the
/// heap file.
pub struct IndexScan<'a> {
    index: &'a BPlusTree,
    heap: &'a HeapFile,
    lo: String,
    hi: String,
    results: Vec<(String, RecordId)>,
    position: usize,
}

impl<'a> IndexScan<'a> {
    /// Creates an index scan over the inclusive key range.
    pub fn new(
        index: &'a BPlusTree,
        heap: &'a HeapFile,
        lo: impl Into<String>,
        hi: impl Into<String>,
    ) -> Self {
        Self {
            index,
            heap,
            lo: lo.into(),
            hi: hi.into(),
            results: Vec::new(),
            position: 0,
        }
    }
}

impl Executor for IndexScan<'_> {
    fn init(&mut self) -> Result<()> {
        self.results = self.index.range_scan(&self.lo, &self.hi)?;
        self.position = 0;
        Ok(())
    }

    fn next(&mut self) -> Result<Option<Tuple>> {
        if self.position >= self.results.len() {
            return Ok(None);
        }

        let rid = self.results[self.position].1;
        self.position += 1;
        let doc = self.heap.get(rid)?;
        Ok(Some(Tuple { rid, doc }))
    }

    fn close(&mut self) {
        self.results.clear();
        self.position = 0;
    }
}
