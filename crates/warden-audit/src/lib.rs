//! Append-only, hash-chained audit log.
//!
//! Each guarded action becomes one JSON line whose `entry_hash` covers the
//! previous entry's hash, so editing, dropping or reordering any historical
//! line is detected by [`AuditLog::verify_chain`] at that line's index.

pub mod entry;
pub mod log;

pub use entry::{canonical_json, compute_hash, AuditEntry, GENESIS_HASH};
pub use log::{AuditLog, AuditSummary, ChainVerification, TORN_TAIL_ACTION};
