//! Buffer pool management for NimbusDB.
//!
//! This crate provides in-memory page caching with:
//! - Fixed-size buffer pool with a configurable frame count
//! - LRU eviction of unpinned frames
//! - Pin counting for concurrent access
//! - Dirty page tracking with write-back on eviction

mod frame;
mod pool;
mod replacer;

pub use frame::{BufferFrame, FrameId};
pub use pool::{BufferPool, BufferPoolConfig, PageReadGuard, PageStore, PageWriteGuard};
pub use replacer::{LruReplacer, Replacer};
