//! In-memory versioned data layer.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{PoisonError, RwLock};

use mdn_common::error::{MdnResult, ReturnCode};

use crate::data_layer::{DataLayer, ReadOutcome, Row};
use crate::snapshot;

type TableKey = (Vec<u8>, Vec<u8>);
type Versions = BTreeMap<u64, Option<Vec<u8>>>;

/// Thread-safe in-memory data layer keyed by `(table, key)` with one
/// version chain per row.
#[derive(Debug, Default)]
pub struct MemoryDataLayer {
    rows: RwLock<BTreeMap<TableKey, Versions>>,
}

impl MemoryDataLayer {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads a store from a snapshot file, starting empty when the file
    /// does not exist yet.
    ///
    /// # Errors
    ///
    /// Returns `MdnError::Io` for filesystem failures and
    /// `MdnError::Protocol` for corrupt snapshots.
    pub fn open<P: AsRef<Path>>(path: P) -> MdnResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::new());
        }
        let rows = snapshot::read_snapshot_file(path)?;
        let store = Self::new();
        for row in rows {
            store.apply_row(&row);
        }
        Ok(store)
    }

    /// Persists the full store to a snapshot file.
    ///
    /// # Errors
    ///
    /// Returns `MdnError::Io` for filesystem failures and
    /// `MdnError::Protocol` for encoding failures.
    pub fn persist<P: AsRef<Path>>(&self, path: P) -> MdnResult<()> {
        snapshot::write_snapshot_file(path, &self.rows())
    }

    fn apply_row(&self, row: &Row) {
        let mut rows = self.rows.write().unwrap_or_else(PoisonError::into_inner);
        let versions = rows
            .entry((row.table.clone(), row.key.clone()))
            .or_default();
        let _ = versions.insert(row.timestamp, row.value.clone());
    }

    /// Number of distinct `(table, key)` rows.
    #[must_use]
    pub fn row_count(&self) -> usize {
        self.rows
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl DataLayer for MemoryDataLayer {
    fn get(&self, table: &[u8], key: &[u8], ts_upper_bound: u64) -> ReadOutcome {
        let rows = self.rows.read().unwrap_or_else(PoisonError::into_inner);
        let Some(versions) = rows.get(&(table.to_vec(), key.to_vec())) else {
            return ReadOutcome::not_found();
        };
        let Some((timestamp, value)) = versions.range(..=ts_upper_bound).next_back() else {
            return ReadOutcome::not_found();
        };
        match value {
            Some(value) => ReadOutcome {
                rc: ReturnCode::Success,
                timestamp: *timestamp,
                value: value.clone(),
            },
            None => ReadOutcome::not_found(),
        }
    }

    fn put(&self, table: &[u8], key: &[u8], timestamp: u64, value: &[u8]) -> ReturnCode {
        let mut rows = self.rows.write().unwrap_or_else(PoisonError::into_inner);
        let versions = rows.entry((table.to_vec(), key.to_vec())).or_default();
        let _ = versions.insert(timestamp, Some(value.to_vec()));
        ReturnCode::Success
    }

    fn del(&self, table: &[u8], key: &[u8], timestamp: u64) -> ReturnCode {
        let mut rows = self.rows.write().unwrap_or_else(PoisonError::into_inner);
        let versions = rows.entry((table.to_vec(), key.to_vec())).or_default();
        let _ = versions.insert(timestamp, None);
        ReturnCode::Success
    }

    fn rows(&self) -> Vec<Row> {
        let rows = self.rows.read().unwrap_or_else(PoisonError::into_inner);
        let mut output = Vec::new();
        for ((table, key), versions) in rows.iter() {
            for (timestamp, value) in versions {
                output.push(Row {
                    table: table.clone(),
                    key: key.clone(),
                    timestamp: *timestamp,
                    value: value.clone(),
                });
            }
        }
        output
    }
}
