//! Shared scalar types for NimbusDB.

/// Transaction identifier, allocated monotonically from 0.
pub type TxnId = i64;

/// Sentinel for "no transaction".
pub const INVALID_TXN_ID: TxnId = -1;
