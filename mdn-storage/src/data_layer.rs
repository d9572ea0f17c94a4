//! Durable store interface.
//!
//! The data layer is process-global and thread-safe. Rows are versioned by
//! timestamp; a delete is a tombstone version, so reads below the tombstone
//! still observe older values.

use mdn_common::error::ReturnCode;

/// Answer to one timestamped read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadOutcome {
    /// `Success` or `NotFound`; storage failures surface as
    /// `StorageError`.
    pub rc: ReturnCode,
    /// Timestamp of the version actually observed (0 when not found).
    pub timestamp: u64,
    /// Value bytes of the observed version (empty when not found).
    pub value: Vec<u8>,
}

impl ReadOutcome {
    /// A not-found answer.
    #[must_use]
    pub fn not_found() -> Self {
        Self {
            rc: ReturnCode::NotFound,
            timestamp: 0,
            value: Vec::new(),
        }
    }
}

/// One materialized row version, as enumerated for migration and
/// snapshotting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    /// Table the key lives in.
    pub table: Vec<u8>,
    /// Row key.
    pub key: Vec<u8>,
    /// Version timestamp.
    pub timestamp: u64,
    /// Value bytes; `None` marks a tombstone.
    pub value: Option<Vec<u8>>,
}

/// Versioned key-value store owned by one KVS daemon.
pub trait DataLayer: Send + Sync {
    /// Returns the newest version of `(table, key)` at or below
    /// `ts_upper_bound`.
    fn get(&self, table: &[u8], key: &[u8], ts_upper_bound: u64) -> ReadOutcome;

    /// Stores one version. Writes are content-addressed by
    /// `(table, key, timestamp)` and idempotent.
    fn put(&self, table: &[u8], key: &[u8], timestamp: u64, value: &[u8]) -> ReturnCode;

    /// Stores one tombstone version.
    fn del(&self, table: &[u8], key: &[u8], timestamp: u64) -> ReturnCode;

    /// Enumerates every stored version, tombstones included.
    fn rows(&self) -> Vec<Row>;
}
