//! Quorum write coordination.
//!
//! A write completes once f+1 replicas report success under the same
//! `(owner₁, owner₂)` pair. Ownership disagreement follows the majority
//! pair; with no majority the fan-out is retried against the refreshed
//! replica set, bounded like the read path.

use mdn_common::error::ReturnCode;
use mdn_common::ids::CommId;

use crate::read_replicator::MAX_REPLICATOR_RETRIES;

/// One raw-write answer from a replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawWriteAnswer {
    /// Replica's return code.
    pub rc: ReturnCode,
    /// Replica's view of owner₁.
    pub owner1: CommId,
    /// Replica's view of owner₂.
    pub owner2: CommId,
}

#[derive(Debug, Clone)]
struct WriteSlot {
    target: CommId,
    answer: Option<RawWriteAnswer>,
}

/// What the daemon should do after feeding one answer in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteStep {
    /// Keep waiting for more answers.
    Wait,
    /// Re-issue the raw write to these targets after a config refresh.
    Refan(Vec<CommId>),
    /// Answer the caller and destroy the replicator.
    Respond {
        /// Final return code.
        rc: ReturnCode,
    },
}

/// Per-RPC coordinator state for one replicated write or tombstone.
#[derive(Debug)]
pub struct WriteReplicator {
    caller: CommId,
    client_nonce: u64,
    flags: u8,
    table: Vec<u8>,
    key: Vec<u8>,
    timestamp: u64,
    value: Vec<u8>,
    slots: Vec<WriteSlot>,
    retries_left: u8,
    done: bool,
}

impl WriteReplicator {
    /// Creates coordinator state over one replica set.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        caller: CommId,
        client_nonce: u64,
        flags: u8,
        table: Vec<u8>,
        key: Vec<u8>,
        timestamp: u64,
        value: Vec<u8>,
        replicas: &[CommId],
    ) -> Self {
        Self {
            caller,
            client_nonce,
            flags,
            table,
            key,
            timestamp,
            value,
            slots: replicas
                .iter()
                .map(|replica| WriteSlot {
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

    /// Write flags (tombstone selection).
    #[must_use]
    pub fn flags(&self) -> u8 {
        self.flags
    }

    /// Table under write.
    #[must_use]
    pub fn table(&self) -> &[u8] {
        &self.table
    }

    /// Key under write.
    #[must_use]
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    /// Version timestamp of the write.
    #[must_use]
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    /// Value bytes of the write.
    #[must_use]
    pub fn value(&self) -> &[u8] {
        &self.value
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

    /// Feeds one raw-write answer in and decides the next step. The
    /// `refreshed_replicas` closure supplies the current replica set when a
    /// re-fan-out becomes necessary.
    pub fn record(
        &mut self,
        from: CommId,
        answer: RawWriteAnswer,
        refreshed_replicas: impl FnOnce() -> Vec<CommId>,
    ) -> WriteStep {
        if self.done {
            return WriteStep::Wait;
        }
        let Some(slot) = self
            .slots
            .iter_mut()
            .find(|slot| slot.target == from && slot.answer.is_none())
        else {
            return WriteStep::Wait;
        };
        slot.answer = Some(answer);

        if let Some(step) = self.try_complete() {
            return step;
        }
        if self.all_answered() {
            return self.refan(refreshed_replicas());
        }
        WriteStep::Wait
    }

    fn all_answered(&self) -> bool {
        self.slots.iter().all(|slot| slot.answer.is_some())
    }

    fn try_complete(&mut self) -> Option<WriteStep> {
        // Group successful answers by the ownership pair they report.
        let mut pairs: Vec<((CommId, CommId), usize)> = Vec::new();
        for slot in &self.slots {
            let Some(answer) = slot.answer else {
                continue;
            };
            if answer.rc != ReturnCode::Success {
                continue;
            }
            let pair = (answer.owner1, answer.owner2);
            match pairs.iter_mut().find(|(existing, _)| *existing == pair) {
                Some((_, count)) => *count += 1,
                None => pairs.push((pair, 1)),
            }
        }

        let quorum = self.quorum();
        if pairs.iter().any(|(_, count)| *count >= quorum) {
            self.done = true;
            return Some(WriteStep::Respond {
                rc: ReturnCode::Success,
            });
        }
        None
    }

    fn refan(&mut self, refreshed: Vec<CommId>) -> WriteStep {
        if self.retries_left == 0 || refreshed.is_empty() {
            self.done = true;
            let rc = self
                .slots
                .iter()
                .filter_map(|slot| slot.answer)
                .map(|answer| answer.rc)
                .find(|rc| *rc != ReturnCode::Success)
                .unwrap_or(ReturnCode::Disrupted);
            return WriteStep::Respond { rc };
        }
        self.retries_left -= 1;

        // Prefer the majority ownership pair's replicas when one exists;
        // otherwise take the refreshed configuration as the new truth.
        let mut next_targets = self.majority_pair_targets();
        if next_targets.is_empty() {
            next_targets = refreshed;
        }
        self.slots = next_targets
            .iter()
            .map(|target| WriteSlot {
                target: *target,
                answer: None,
            })
            .collect();
        WriteStep::Refan(next_targets)
    }

    fn majority_pair_targets(&self) -> Vec<CommId> {
        let answered = self.slots.iter().filter(|slot| slot.answer.is_some()).count();
        if answered == 0 {
            return Vec::new();
        }
        let mut pairs: Vec<((CommId, CommId), usize)> = Vec::new();
        for slot in &self.slots {
            let Some(answer) = slot.answer else {
                continue;
            };
            let pair = (answer.owner1, answer.owner2);
            match pairs.iter_mut().find(|(existing, _)| *existing == pair) {
                Some((_, count)) => *count += 1,
                None => pairs.push((pair, 1)),
            }
        }
        let Some(((owner1, owner2), count)) = pairs
            .into_iter()
            .max_by_key(|(pair, count)| (*count, std::cmp::Reverse(*pair)))
        else {
            return Vec::new();
        };
        if count * 2 <= answered {
            return Vec::new();
        }
        let mut targets = Vec::new();
        if owner1 != CommId::default() {
            targets.push(owner1);
        }
        if owner2 != CommId::default() && owner2 != owner1 {
            targets.push(owner2);
        }
        targets
    }
}

#[cfg(test)]
mod tests {
    use super::{RawWriteAnswer, WriteReplicator, WriteStep};
    use googletest::prelude::*;
    use mdn_common::error::ReturnCode;
    use mdn_common::ids::CommId;
    use rstest::rstest;

    fn replicator(replicas: &[u64]) -> WriteReplicator {
        let ids = replicas.iter().map(|id| CommId::new(*id)).collect::<Vec<_>>();
        WriteReplicator::new(
            CommId::new(100),
            42,
            0,
            b"t".to_vec(),
            b"k".to_vec(),
            500,
            b"v".to_vec(),
            &ids,
        )
    }

    fn success(owner1: u64, owner2: u64) -> RawWriteAnswer {
        RawWriteAnswer {
            rc: ReturnCode::Success,
            owner1: CommId::new(owner1),
            owner2: CommId::new(owner2),
        }
    }

    #[rstest]
    fn five_replica_write_completes_on_three_matching_answers() {
        let mut replicator = replicator(&[1, 2, 3, 4, 5]);
        let no_refresh = Vec::new;
        assert_that!(
            replicator.record(CommId::new(1), success(1, 2), no_refresh),
            eq(&WriteStep::Wait)
        );
        assert_that!(
            replicator.record(CommId::new(4), success(1, 2), no_refresh),
            eq(&WriteStep::Wait)
        );
        let step = replicator.record(CommId::new(5), success(1, 2), no_refresh);
        assert_that!(
            step,
            eq(&WriteStep::Respond {
                rc: ReturnCode::Success,
            })
        );
        assert_that!(replicator.is_done(), eq(true));
    }

    #[rstest]
    fn ownership_disagreement_follows_the_majority_pair() {
        let mut replicator = replicator(&[1, 2, 3]);
        let no_refresh = Vec::new;
        // Two answers agree on (7, 8); one strays. No pair reaches the
        // quorum of two until the stray is re-fanned... the agreeing pair
        // already has two answers, which is the quorum for three replicas.
        let _ = replicator.record(CommId::new(1), success(7, 8), no_refresh);
        let step = replicator.record(CommId::new(2), success(7, 8), no_refresh);
        assert_that!(
            step,
            eq(&WriteStep::Respond {
                rc: ReturnCode::Success,
            })
        );
    }

    #[rstest]
    fn no_majority_refans_with_refreshed_replicas() {
        let mut replicator = replicator(&[1, 2]);
        // Quorum is two but the answers disagree on ownership.
        let _ = replicator.record(CommId::new(1), success(1, 2), Vec::new);
        let step = replicator.record(
            CommId::new(2),
            success(8, 9),
            || vec![CommId::new(8), CommId::new(9)],
        );
        let WriteStep::Refan(targets) = step else {
            panic!("expected a re-fan-out, got {step:?}");
        };
        assert_that!(targets.len(), eq(2_usize));

        // The refreshed replicas agree and complete the write.
        let first = targets[0];
        let second = targets[1];
        let _ = replicator.record(first, success(first.get(), second.get()), Vec::new);
        let step = replicator.record(second, success(first.get(), second.get()), Vec::new);
        assert_that!(
            step,
            eq(&WriteStep::Respond {
                rc: ReturnCode::Success,
            })
        );
    }

    #[rstest]
    fn exhausted_retries_surface_a_failure() {
        let mut replicator = replicator(&[1]);
        let mut last = WriteStep::Wait;
        for _ in 0..16 {
            let answer = RawWriteAnswer {
                rc: ReturnCode::StorageError,
                owner1: CommId::new(1),
                owner2: CommId::default(),
            };
            let target = match &last {
                WriteStep::Refan(targets) => targets[0],
                _ => CommId::new(1),
            };
            last = replicator.record(target, answer, || vec![CommId::new(1)]);
            if matches!(last, WriteStep::Respond { .. }) {
                break;
            }
        }
        assert_that!(
            last,
            eq(&WriteStep::Respond {
                rc: ReturnCode::StorageError,
            })
        );
    }

    #[rstest]
    fn silent_replicas_do_not_block_a_reached_quorum() {
        // Replica set {1..5}; replicas 2 and 3 stay silent.
        let mut replicator = replicator(&[1, 2, 3, 4, 5]);
        let no_refresh = Vec::new;
        let _ = replicator.record(CommId::new(1), success(1, 2), no_refresh);
        let _ = replicator.record(CommId::new(4), success(1, 2), no_refresh);
        let step = replicator.record(CommId::new(5), success(1, 2), no_refresh);
        assert_that!(
            step,
            eq(&WriteStep::Respond {
                rc: ReturnCode::Success,
            })
        );
    }
}
