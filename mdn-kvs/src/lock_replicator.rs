//! Quorum lock coordination.
//!
//! Lock operations reuse the replicated-write fan-out: the coordinator
//! forwards the CAS to every replica of the key's partition and completes
//! once a majority reports success. A single refusal is decisive for
//! acquires, because the refusing replica holds a conflicting owner.

use mdn_common::error::ReturnCode;
use mdn_common::ids::{CommId, TransactionId};
use mdn_wire::{LockAction, LockKind};

#[derive(Debug, Clone)]
struct LockSlot {
    target: CommId,
    rc: Option<ReturnCode>,
}

/// What the daemon should do after feeding one answer in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockStep {
    /// Keep waiting for more answers.
    Wait,
    /// Answer the caller and destroy the replicator.
    Respond {
        /// Final return code.
        rc: ReturnCode,
    },
}

/// Per-RPC coordinator state for one replicated lock operation.
#[derive(Debug)]
pub struct LockReplicator {
    caller: CommId,
    client_nonce: u64,
    table: Vec<u8>,
    key: Vec<u8>,
    txid: TransactionId,
    kind: LockKind,
    action: LockAction,
    slots: Vec<LockSlot>,
    done: bool,
}

impl LockReplicator {
    /// Creates coordinator state over one replica set.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        caller: CommId,
        client_nonce: u64,
        table: Vec<u8>,
        key: Vec<u8>,
        txid: TransactionId,
        kind: LockKind,
        action: LockAction,
        replicas: &[CommId],
    ) -> Self {
        Self {
            caller,
            client_nonce,
            table,
            key,
            txid,
            kind,
            action,
            slots: replicas
                .iter()
                .map(|replica| LockSlot {
                    target: *replica,
                    rc: None,
                })
                .collect(),
            done: false,
        }
    }

    /// The caller awaiting the quorum answer.
    #[must_use]
    pub fn caller(&self) -> CommId {
        self.caller
    }

    /// The caller's request nonce.
    #[must_use]
    pub fn client_nonce(&self) -> u64 {
        self.client_nonce
    }

    /// Table of the lock record.
    #[must_use]
    pub fn table(&self) -> &[u8] {
        &self.table
    }

    /// Key of the lock record.
    #[must_use]
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    /// Transaction attempting the CAS.
    #[must_use]
    pub fn txid(&self) -> TransactionId {
        self.txid
    }

    /// Requested lock strength.
    #[must_use]
    pub fn kind(&self) -> LockKind {
        self.kind
    }

    /// Acquire or release.
    #[must_use]
    pub fn action(&self) -> LockAction {
        self.action
    }

    /// Whether a final answer has been produced.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Replicas the fan-out must reach.
    #[must_use]
    pub fn targets(&self) -> Vec<CommId> {
        self.slots.iter().map(|slot| slot.target).collect()
    }

    fn quorum(&self) -> usize {
        self.slots.len() / 2 + 1
    }

    /// Feeds one replica answer in and decides the next step.
    pub fn record(&mut self, from: CommId, rc: ReturnCode) -> LockStep {
        if self.done {
            return LockStep::Wait;
        }
        let Some(slot) = self
            .slots
            .iter_mut()
            .find(|slot| slot.target == from && slot.rc.is_none())
        else {
            return LockStep::Wait;
        };
        slot.rc = Some(rc);

        // A refused acquire cannot succeed anywhere: the refusing replica
        // holds a conflicting owner for the record.
        if self.action == LockAction::Acquire && rc == ReturnCode::Aborted {
            self.done = true;
            return LockStep::Respond {
                rc: ReturnCode::Aborted,
            };
        }

        let successes = self
            .slots
            .iter()
            .filter(|slot| slot.rc == Some(ReturnCode::Success))
            .count();
        if successes >= self.quorum() {
            self.done = true;
            return LockStep::Respond {
                rc: ReturnCode::Success,
            };
        }

        if self.slots.iter().all(|slot| slot.rc.is_some()) {
            self.done = true;
            let rc = self
                .slots
                .iter()
                .filter_map(|slot| slot.rc)
                .find(|rc| *rc != ReturnCode::Success)
                .unwrap_or(ReturnCode::Disrupted);
            return LockStep::Respond { rc };
        }
        LockStep::Wait
    }
}
