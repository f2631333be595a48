//! Sequential scan over a heap file.

use super::{Executor, Tuple};
use nimbus_common::Result;
use nimbus_storage::{HeapFile, HeapFileIter};

/// Yields every live record of a collection in page/slot order.
pub struct SeqScan<'a> {
    heap: &'a HeapFile,
    iter: Option<HeapFileIter<'a>>,
}

impl<'a> SeqScan<'a> {
    /// Creates a sequential scan over the heap file.
    pub fn new(heap: &'a HeapFile) -> Self {
        Self { heap, iter: None }
    }
}

impl Executor for SeqScan<'_> {
    fn init(&mut self) -> Result<()> {
        self.iter = Some(self.heap.iter());
        Ok(())
    }

    fn next(&mut self) -> Result<Option<Tuple>> {
        let Some(iter) = self.iter.as_mut() else {
            return Ok(None);
        };
        Ok(iter.next().map(|(rid, doc)| Tuple { rid, doc }))
    }

    fn close(&mut self) {
        self.iter = None;
    }
}
