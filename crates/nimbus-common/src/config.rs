//! Configuration structures for NimbusDB.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Configuration for a NimbusDB instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbConfig {
    /// Path to the database file.
    pub db_path: PathBuf,
    /// Path to the write-ahead log file.
    pub wal_path: PathBuf,
    /// Number of frames in the buffer pool.
    pub pool_frames: usize,
    /// Maximum keys per B+ tree node.
    pub btree_max_keys: u16,
    /// Enable fsync on commit.
    pub fsync_enabled: bool,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./nimbus.db"),
            wal_path: PathBuf::from("./nimbus.wal"),
            pool_frames: 128,
            btree_max_keys: 50,
            fsync_enabled: true,
        }
    }
}

impl DbConfig {
    /// Creates a configuration rooted in the given directory.
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        Self {
            db_path: dir.join("nimbus.db"),
            wal_path: dir.join("nimbus.wal"),
            ..Default::default()
        }
    }
}
