//! Page replacement policies for the buffer pool.

use crate::frame::FrameId;
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};

/// Trait for page replacement algorithms.
pub trait Replacer: Send + Sync {
    /// Selects a victim frame for eviction.
    ///
    /// Returns None if no frames are evictable.
    fn victim(&self) -> Option<FrameId>;

    /// Marks a frame as pinned (removed from the evictable set).
    fn pin(&self, frame_id: FrameId);

    /// Marks a frame as unpinned (added to the evictable set).
    fn unpin(&self, frame_id: FrameId);

    /// Removes a frame from the replacer entirely.
    fn remove(&self, frame_id: FrameId);

    /// Returns the number of evictable frames.
    fn size(&self) -> usize;
}

/// Least-recently-used replacement.
///
/// Unpinned frames enter at the back of the queue; victims come from
/// the front. A frame that is pinned again leaves the queue.
pub struct LruReplacer {
    inner: Mutex<LruInner>,
}

struct LruInner {
    /// Front = least recently used.
    queue: VecDeque<FrameId>,
    /// Membership check; keeps queue entries unique.
    members: HashSet<FrameId>,
}

impl LruReplacer {
    /// Creates a new LRU replacer sized for the given frame count.
    pub fn new(num_frames: usize) -> Self {
        Self {
            inner: Mutex::new(LruInner {
                queue: VecDeque::with_capacity(num_frames),
                members: HashSet::with_capacity(num_frames),
            }),
        }
    }
}

impl Replacer for LruReplacer {
    fn victim(&self) -> Option<FrameId> {
        let mut inner = self.inner.lock();
        let frame_id = inner.queue.pop_front()?;
        inner.members.remove(&frame_id);
        Some(frame_id)
    }

    fn pin(&self, frame_id: FrameId) {
        let mut inner = self.inner.lock();
        if inner.members.remove(&frame_id) {
            inner.queue.retain(|&f| f != frame_id);
        }
    }

    fn unpin(&self, frame_id: FrameId) {
        let mut inner = self.inner.lock();
        if inner.members.insert(frame_id) {
            inner.queue.push_back(frame_id);
        }
    }

    fn remove(&self, frame_id: FrameId) {
        self.pin(frame_id);
    }

    fn size(&self) -> usize {
        self.inner.lock().members.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lru_replacer_new() {
        let replacer = LruReplacer::new(10);
        assert_eq!(replacer.size(), 0);
        assert!(replacer.victim().is_none());
    }

    #[test]
    fn test_lru_replacer_unpin_victim_order() {
        let replacer = LruReplacer::new(10);

        replacer.unpin(FrameId(3));
        replacer.unpin(FrameId(1));
        replacer.unpin(FrameId(7));
        assert_eq!(replacer.size(), 3);

        // Victims come out least-recently-unpinned first
        assert_eq!(replacer.victim(), Some(FrameId(3)));
        assert_eq!(replacer.victim(), Some(FrameId(1)));
        assert_eq!(replacer.victim(), Some(FrameId(7)));
        assert!(replacer.victim().is_none());
    }

    #[test]
    fn test_lru_replacer_pin_removes() {
        let replacer = LruReplacer::new(10);

        replacer.unpin(FrameId(0));
        replacer.unpin(FrameId(1));
        replacer.unpin(FrameId(2));

        replacer.pin(FrameId(1));
        assert_eq!(replacer.size(), 2);

        assert_eq!(replacer.victim(), Some(FrameId(0)));
        assert_eq!(replacer.victim(), Some(FrameId(2)));
        assert!(replacer.victim().is_none());
    }

    #[test]
    fn test_lru_replacer_duplicate_unpin() {
        let replacer = LruReplacer::new(10);

        replacer.unpin(FrameId(5));
        replacer.unpin(FrameId(5));
        assert_eq!(replacer.size(), 1);

        assert_eq!(replacer.victim(), Some(FrameId(5)));
        assert!(replacer.victim().is_none());
    }

    #[test]
    fn test_lru_replacer_repin_moves_to_back() {
        let replacer = LruReplacer::new(10);

        replacer.unpin(FrameId(0));
        replacer.unpin(FrameId(1));

        // Re-access frame 0: pin then unpin puts it behind frame 1
        replacer.pin(FrameId(0));
        replacer.unpin(FrameId(0));

        assert_eq!(replacer.victim(), Some(FrameId(1)));
        assert_eq!(replacer.victim(), Some(FrameId(0)));
    }

    #[test]
    fn test_lru_replacer_remove() {
        let replacer = LruReplacer::new(10);

        replacer.unpin(FrameId(0));
        replacer.unpin(FrameId(1));
        replacer.remove(FrameId(0));

        assert_eq!(replacer.size(), 1);
        assert_eq!(replacer.victim(), Some(FrameId(1)));
    }

    #[test]
    fn test_lru_replacer_pin_absent_is_noop() {
        let replacer = LruReplacer::new(10);
        replacer.pin(FrameId(99));
        assert_eq!(replacer.size(), 0);
    }
}
