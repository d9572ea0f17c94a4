//! Quorum read coordination.
//!
//! One [`ReadReplicator`] exists per in-flight replicated read. The daemon
//! owns the I/O; the replicator is pure bookkeeping, which keeps the quorum
//! and ownership-handoff rules unit-testable without a cluster.

use mdn_common::error::ReturnCode;
use mdn_common::ids::CommId;

/// Bound on per-replicator ownership-adoption retries.
pub const MAX_REPLICATOR_RETRIES: u8 = 8;

/// One raw-read answer from a replica.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawReadAnswer {
    /// Replica's return code.
    pub rc: ReturnCode,
    /// Timestamp of the observed version.
    pub timestamp: u64,
    /// Observed value bytes.
    pub value: Vec<u8>,
    /// The replica's current view of owner₁ for the partition.
    pub owner: CommId,
}

#[derive(Debug, Clone)]
struct ReadSlot {
    target: CommId,
    answer: Option<RawReadAnswer>,
}

/// What the daemon should do after feeding one answer in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadStep {
    /// Keep waiting for more answers.
    Wait,
    /// Re-issue the raw read to these newly adopted owners.
    Resend(Vec<CommId>),
    /// Answer the caller and destroy the replicator.
    Respond {
        /// Final return code.
        rc: ReturnCode,
        /// Timestamp of the chosen version.
        timestamp: u64,
        /// Chosen value bytes.
        value: Vec<u8>,
    },
}

/// Per-RPC coordinator state for one replicated read.
#[derive(Debug)]
pub struct ReadReplicator {
    caller: CommId,
    client_nonce: u64,
    table: Vec<u8>,
    key: Vec<u8>,
    timestamp: u64,
    slots: Vec<ReadSlot>,
    retries_left: u8,
    done: bool,
}

impl ReadReplicator {
    /// Creates coordinator state over one replica set.
    #[must_use]
    pub fn new(
        caller: CommId,
        client_nonce: u64,
        table: Vec<u8>,
        key: Vec<u8>,
        timestamp: u64,
        replicas: &[CommId],
    ) -> Self {
        Self {
            caller,
            client_nonce,
            table,
            key,
            timestamp,
            slots: replicas
                .iter()
                .map(|replica| ReadSlot {
                    target: *replica,
                    answer: None,
                })
                .collect(),
            retries_left: MAX_REPLICATOR_RETRIES,
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

    /// Table under read.
    #[must_use]
    pub fn table(&self) -> &[u8] {
        &self.table
    }

    /// Key under read.
    #[must_use]
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    /// Upper timestamp bound of the read.
    #[must_use]
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    /// Whether a final answer has been produced.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Replicas the initial fan-out must reach.
    #[must_use]
    pub fn targets(&self) -> Vec<CommId> {
        self.slots.iter().map(|slot| slot.target).collect()
    }

    fn quorum(&self) -> usize {
        self.slots.len() / 2 + 1
    }

    /// Feeds one raw-read answer in and decides the next step.
    pub fn record(&mut self, from: CommId, answer: RawReadAnswer) -> ReadStep {
        if self.done {
            return ReadStep::Wait;
        }
        let Some(slot_index) = self
            .slots
            .iter()
            .position(|slot| slot.target == from && slot.answer.is_none())
        else {
            // A straggler from an already-retargeted or duplicate slot.
            return ReadStep::Wait;
        };

        // A replica naming an owner outside our replica set has a newer
        // ownership view; adopt the owner it names and retry that slot.
        let known_target = self
            .slots
            .iter()
            .any(|slot| slot.target == answer.owner);
        if answer.owner != CommId::default() && !known_target && self.retries_left > 0 {
            self.retries_left -= 1;
            let adopted = answer.owner;
            self.slots[slot_index].target = adopted;
            return ReadStep::Resend(vec![adopted]);
        }

        self.slots[slot_index].answer = Some(answer);
        self.check_quorum()
    }

    fn check_quorum(&mut self) -> ReadStep {
        let answered = self
            .slots
            .iter()
            .filter_map(|slot| slot.answer.as_ref())
            .collect::<Vec<_>>();
        let countable = answered
            .iter()
            .filter(|answer| matches!(answer.rc, ReturnCode::Success | ReturnCode::NotFound))
            .count();

        if countable >= self.quorum() {
            return self.respond_from_answers();
        }
        if answered.len() == self.slots.len() {
            // Every replica has spoken and the quorum cannot be met.
            let rc = answered
                .iter()
                .map(|answer| answer.rc)
                .find(|rc| !matches!(rc, ReturnCode::Success | ReturnCode::NotFound))
                .unwrap_or(ReturnCode::Disrupted);
            self.done = true;
            return ReadStep::Respond {
                rc,
                timestamp: 0,
                value: Vec::new(),
            };
        }
        ReadStep::Wait
    }

    fn respond_from_answers(&mut self) -> ReadStep {
        let mut best: Option<(u64, CommId, &RawReadAnswer)> = None;
        for slot in &self.slots {
            let Some(answer) = slot.answer.as_ref() else {
                continue;
            };
            if answer.rc != ReturnCode::Success || answer.timestamp > self.timestamp {
                continue;
            }
            let candidate = (answer.timestamp, slot.target, answer);
            best = match best {
                None => Some(candidate),
                Some(current) => {
                    // Highest timestamp wins; sender id breaks ties
                    // deterministically.
                    if candidate.0 > current.0 || (candidate.0 == current.0 && candidate.1 < current.1)
                    {
                        Some(candidate)
                    } else {
                        Some(current)
                    }
                }
            };
        }

        self.done = true;
        match best {
            Some((timestamp, _, answer)) => ReadStep::Respond {
                rc: ReturnCode::Success,
                timestamp,
                value: answer.value.clone(),
            },
            None => ReadStep::Respond {
                rc: ReturnCode::NotFound,
                timestamp: 0,
                value: Vec::new(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{RawReadAnswer, ReadReplicator, ReadStep};
    use googletest::prelude::*;
    use mdn_common::error::ReturnCode;
    use mdn_common::ids::CommId;
    use rstest::rstest;

    fn replicator(replicas: &[u64]) -> ReadReplicator {
        let ids = replicas.iter().map(|id| CommId::new(*id)).collect::<Vec<_>>();
        ReadReplicator::new(
            CommId::new(100),
            42,
            b"t".to_vec(),
            b"k".to_vec(),
            1000,
            &ids,
        )
    }

    fn success(timestamp: u64, value: &[u8], owner: u64) -> RawReadAnswer {
        RawReadAnswer {
            rc: ReturnCode::Success,
            timestamp,
            value: value.to_vec(),
            owner: CommId::new(owner),
        }
    }

    fn not_found(owner: u64) -> RawReadAnswer {
        RawReadAnswer {
            rc: ReturnCode::NotFound,
            timestamp: 0,
            value: Vec::new(),
            owner: CommId::new(owner),
        }
    }

    #[rstest]
    fn quorum_of_three_answers_after_two() {
        let mut replicator = replicator(&[1, 2, 3]);
        assert_that!(
            replicator.record(CommId::new(1), success(10, b"old", 1)),
            eq(&ReadStep::Wait)
        );
        let step = replicator.record(CommId::new(2), success(20, b"new", 2));
        assert_that!(
            step,
            eq(&ReadStep::Respond {
                rc: ReturnCode::Success,
                timestamp: 20,
                value: b"new".to_vec(),
            })
        );
        assert_that!(replicator.is_done(), eq(true));
    }

    #[rstest]
    fn all_not_found_answers_not_found() {
        let mut replicator = replicator(&[1, 2, 3]);
        let _ = replicator.record(CommId::new(1), not_found(1));
        let step = replicator.record(CommId::new(2), not_found(2));
        assert_that!(
            step,
            eq(&ReadStep::Respond {
                rc: ReturnCode::NotFound,
                timestamp: 0,
                value: Vec::new(),
            })
        );
    }

    #[rstest]
    fn stale_owner_is_adopted_and_retried() {
        let mut replicator = replicator(&[1, 2, 3, 4, 5]);
        let _ = replicator.record(CommId::new(1), success(10, b"a", 1));
        let _ = replicator.record(CommId::new(2), not_found(2));

        // Replica 5 says node 6 owns the partition now.
        let step = replicator.record(CommId::new(5), not_found(6));
        assert_that!(step, eq(&ReadStep::Resend(vec![CommId::new(6)])));

        // The adopted owner's answer completes the quorum.
        let step = replicator.record(CommId::new(6), success(30, b"fresh", 6));
        assert_that!(
            step,
            eq(&ReadStep::Respond {
                rc: ReturnCode::Success,
                timestamp: 30,
                value: b"fresh".to_vec(),
            })
        );
    }

    #[rstest]
    fn ties_break_by_lower_sender_id() {
        let mut replicator = replicator(&[3, 1, 2]);
        let _ = replicator.record(CommId::new(3), success(10, b"from-three", 3));
        let step = replicator.record(CommId::new(1), success(10, b"from-one", 1));
        assert_that!(
            step,
            eq(&ReadStep::Respond {
                rc: ReturnCode::Success,
                timestamp: 10,
                value: b"from-one".to_vec(),
            })
        );
    }

    #[rstest]
    fn errors_do_not_count_toward_quorum() {
        let mut replicator = replicator(&[1, 2, 3]);
        let error = RawReadAnswer {
            rc: ReturnCode::StorageError,
            timestamp: 0,
            value: Vec::new(),
            owner: CommId::new(1),
        };
        assert_that!(replicator.record(CommId::new(1), error.clone()), eq(&ReadStep::Wait));
        assert_that!(
            replicator.record(CommId::new(2), success(10, b"v", 2)),
            eq(&ReadStep::Wait)
        );
        let step = replicator.record(CommId::new(3), success(12, b"w", 3));
        assert_that!(
            step,
            eq(&ReadStep::Respond {
                rc: ReturnCode::Success,
                timestamp: 12,
                value: b"w".to_vec(),
            })
        );
    }

    #[rstest]
    fn exhausted_replicas_without_quorum_surface_the_error() {
        let mut replicator = replicator(&[1, 2, 3]);
        let error = RawReadAnswer {
            rc: ReturnCode::StorageError,
            timestamp: 0,
            value: Vec::new(),
            owner: CommId::new(0),
        };
        let _ = replicator.record(CommId::new(1), error.clone());
        let _ = replicator.record(CommId::new(2), error.clone());
        let step = replicator.record(CommId::new(3), success(10, b"v", 3));
        assert_that!(
            step,
            eq(&ReadStep::Respond {
                rc: ReturnCode::StorageError,
                timestamp: 0,
                value: Vec::new(),
            })
        );
    }

    #[rstest]
    fn versions_above_the_bound_are_ignored() {
        let mut replicator = ReadReplicator::new(
            CommId::new(100),
            42,
            b"t".to_vec(),
            b"k".to_vec(),
            15,
            &[CommId::new(1), CommId::new(2), CommId::new(3)],
        );
        let _ = replicator.record(CommId::new(1), success(10, b"ok", 1));
        let step = replicator.record(CommId::new(2), success(20, b"too-new", 2));
        assert_that!(
            step,
            eq(&ReadStep::Respond {
                rc: ReturnCode::Success,
                timestamp: 10,
                value: b"ok".to_vec(),
            })
        );
    }
}
