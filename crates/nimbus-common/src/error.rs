//! Error types for NimbusDB.

use thiserror::Error;

/// Result type alias using NimbusError.
pub type Result<T> = std::result::Result<T, NimbusError>;

/// Errors that can occur in NimbusDB operations.
#[derive(Debug, Error)]
pub enum NimbusError {
    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Storage errors
    #[error("Buffer pool full, unable to allocate frame")]
    BufferPoolFull,

    #[error("Page full, unable to insert record")]
    PageFull,

    #[error("Record too large for a single page")]
    RecordTooLarge,

    #[error("Record not found: {0}")]
    RecordNotFound(String),

    #[error("Page pinned: {page_id}")]
    PagePinned { page_id: u32 },

    // Document errors
    #[error("Document corrupted: {0}")]
    DocumentCorrupted(String),

    // B+ tree errors
    #[error("Key not found")]
    KeyNotFound,

    #[error("Key too large: {size} bytes (max {max})")]
    KeyTooLarge { size: usize, max: usize },

    #[error("B+ tree corrupted: {0}")]
    BTreeCorrupted(String),

    // WAL errors
    #[error("WAL write failed: {0}")]
    WalWriteFailed(String),

    #[error("WAL corrupted at offset {offset}: {reason}")]
    WalCorrupted { offset: usize, reason: String },

    #[error("Recovery failed: {0}")]
    RecoveryFailed(String),

    // Catalog errors
    #[error("Collection not found: {0}")]
    CollectionNotFound(String),

    #[error("Collection already exists: {0}")]
    CollectionExists(String),

    #[error("Index on field '{0}' already exists")]
    IndexExists(String),

    #[error("Index not found: {0}")]
    IndexNotFound(String),

    #[error("Catalog metadata exceeds the single-page limit")]
    CatalogFull,

    // Transaction errors
    #[error("Transaction not found: {0}")]
    TransactionNotFound(i64),

    #[error("Transaction aborted: {0}")]
    TransactionAborted(String),

    // Configuration errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}
