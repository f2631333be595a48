//! Concurrency control for NimbusDB.
//!
//! This crate provides:
//! - Record-granular lock manager with shared/exclusive modes and
//!   FIFO queuing (strict 2PL, no deadlock detection)
//! - Transaction manager coordinating begin/commit/abort

mod lock;
mod transaction;

pub use lock::{LockManager, LockMode};
pub use transaction::{Transaction, TransactionManager, TransactionState};
