//! Per-key lock records.
//!
//! A lock record is a CAS cell keyed by `(table, key)` holding the owning
//! transaction id. Acquire succeeds when the cell is free or already owned
//! by the same transaction; release is a no-op for non-owners. Lock kind is
//! carried on the wire for forward compatibility but both kinds are
//! exclusive here.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use mdn_common::error::ReturnCode;
use mdn_common::ids::TransactionId;

type LockKey = (Vec<u8>, Vec<u8>);

/// Thread-safe lock table for one replica.
#[derive(Debug, Default)]
pub struct LockTable {
    locks: Mutex<HashMap<LockKey, TransactionId>>,
}

impl LockTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attempts to take the lock for `txid`.
    pub fn acquire(&self, table: &[u8], key: &[u8], txid: TransactionId) -> ReturnCode {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        let holder = locks
            .entry((table.to_vec(), key.to_vec()))
            .or_insert(txid);
        if *holder == txid {
            ReturnCode::Success
        } else {
            ReturnCode::Aborted
        }
    }

    /// Releases the lock when held by `txid`.
    pub fn release(&self, table: &[u8], key: &[u8], txid: TransactionId) -> ReturnCode {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        let lock_key = (table.to_vec(), key.to_vec());
        if locks.get(&lock_key) == Some(&txid) {
            let _ = locks.remove(&lock_key);
        }
        ReturnCode::Success
    }

    /// Current holder of `(table, key)`, if any.
    #[must_use]
    pub fn holder(&self, table: &[u8], key: &[u8]) -> Option<TransactionId> {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(table.to_vec(), key.to_vec()))
            .copied()
    }

    /// Number of held locks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether no locks are held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
