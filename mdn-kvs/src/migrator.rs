//! Per-partition migration state machine.
//!
//! The migrator offers a partition to each incoming replica with a SYN at
//! the target configuration version. Destinations ack only once their own
//! configuration has caught up; acked destinations get the partition's
//! rows streamed to them. SYN and ACK are idempotent, so the state machine
//! can be re-stepped after a crash or a dropped frame with no harm.

use mdn_common::ids::{CommId, PartitionId, VersionId};

/// One destination replica of a migration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigratorDestination {
    /// Destination replica id.
    pub id: CommId,
    /// Highest config version the destination has acked, when any.
    pub acked: Option<VersionId>,
    /// Whether the partition's rows have been streamed to it.
    pub streamed: bool,
}

impl MigratorDestination {
    fn caught_up(&self, target: VersionId) -> bool {
        self.acked.is_some_and(|acked| acked >= target)
    }
}

/// Actions the daemon must carry out after stepping a migrator.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MigrateActions {
    /// Destinations that still need a SYN at the target version.
    pub syn: Vec<CommId>,
    /// Destinations whose ack arrived and now need the data stream.
    pub stream: Vec<CommId>,
    /// Whether every destination has acked and been streamed.
    pub done: bool,
}

/// Per-partition handoff state.
#[derive(Debug)]
pub struct Migrator {
    partition: PartitionId,
    target_version: VersionId,
    destinations: Vec<MigratorDestination>,
    terminated: bool,
}

impl Migrator {
    /// Creates handoff state toward `destinations` at `target_version`.
    #[must_use]
    pub fn new(
        partition: PartitionId,
        target_version: VersionId,
        destinations: &[CommId],
    ) -> Self {
        Self {
            partition,
            target_version,
            destinations: destinations
                .iter()
                .map(|id| MigratorDestination {
                    id: *id,
                    acked: None,
                    streamed: false,
                })
                .collect(),
            terminated: false,
        }
    }

    /// The partition being handed off.
    #[must_use]
    pub fn partition(&self) -> PartitionId {
        self.partition
    }

    /// The configuration version destinations must reach.
    #[must_use]
    pub fn target_version(&self) -> VersionId {
        self.target_version
    }

    /// Whether the migrator has been idempotently stopped.
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// Stops the migrator; later steps and acks are no-ops.
    pub fn terminate(&mut self) {
        self.terminated = true;
    }

    /// Adopts a newer configuration: raises the target version and
    /// reconciles the destination list. Acks below the new target stay
    /// recorded but no longer count as caught up; targets never decrease.
    pub fn refresh(&mut self, target_version: VersionId, destinations: &[CommId]) {
        if self.terminated {
            return;
        }
        if target_version > self.target_version {
            self.target_version = target_version;
        }
        self.destinations.retain(|dest| destinations.contains(&dest.id));
        for id in destinations {
            if !self.destinations.iter().any(|dest| dest.id == *id) {
                self.destinations.push(MigratorDestination {
                    id: *id,
                    acked: None,
                    streamed: false,
                });
            }
        }
    }

    /// Records one ack from `from` at `version`.
    pub fn ack(&mut self, from: CommId, version: VersionId) {
        if self.terminated {
            return;
        }
        let Some(dest) = self
            .destinations
            .iter_mut()
            .find(|dest| dest.id == from)
        else {
            return;
        };
        if dest.acked.is_none_or(|acked| version > acked) {
            dest.acked = Some(version);
        }
    }

    /// Marks `dest` as having received the full data stream.
    pub fn mark_streamed(&mut self, dest: CommId) {
        if let Some(dest) = self.destinations.iter_mut().find(|d| d.id == dest) {
            dest.streamed = true;
        }
    }

    /// Computes the work outstanding right now.
    #[must_use]
    pub fn step(&self) -> MigrateActions {
        if self.terminated {
            return MigrateActions::default();
        }
        let mut actions = MigrateActions::default();
        for dest in &self.destinations {
            if !dest.caught_up(self.target_version) {
                actions.syn.push(dest.id);
            } else if !dest.streamed {
                actions.stream.push(dest.id);
            }
        }
        actions.done = !self.destinations.is_empty()
            && self
                .destinations
                .iter()
                .all(|dest| dest.caught_up(self.target_version) && dest.streamed);
        actions
    }
}

#[cfg(test)]
mod tests {
    use super::Migrator;
    use googletest::prelude::*;
    use mdn_common::ids::{CommId, PartitionId, VersionId};
    use rstest::rstest;

    fn migrator() -> Migrator {
        Migrator::new(
            PartitionId::new(100),
            VersionId::new(18),
            &[CommId::new(3)],
        )
    }

    #[rstest]
    fn unacked_destination_keeps_receiving_syn() {
        let migrator = migrator();
        let actions = migrator.step();
        assert_that!(&actions.syn, eq(&vec![CommId::new(3)]));
        assert_that!(actions.stream.is_empty(), eq(true));
        assert_that!(actions.done, eq(false));
    }

    #[rstest]
    fn stale_ack_does_not_count() {
        let mut migrator = migrator();
        migrator.ack(CommId::new(3), VersionId::new(17));
        let actions = migrator.step();
        assert_that!(&actions.syn, eq(&vec![CommId::new(3)]));
        assert_that!(actions.done, eq(false));
    }

    #[rstest]
    fn caught_up_ack_moves_to_streaming_then_done() {
        let mut migrator = migrator();
        migrator.ack(CommId::new(3), VersionId::new(18));
        let actions = migrator.step();
        assert_that!(actions.syn.is_empty(), eq(true));
        assert_that!(&actions.stream, eq(&vec![CommId::new(3)]));

        migrator.mark_streamed(CommId::new(3));
        let actions = migrator.step();
        assert_that!(actions.done, eq(true));
    }

    #[rstest]
    fn refresh_never_lowers_the_target() {
        let mut migrator = migrator();
        migrator.ack(CommId::new(3), VersionId::new(18));
        migrator.refresh(VersionId::new(17), &[CommId::new(3)]);
        assert_that!(migrator.target_version(), eq(VersionId::new(18)));

        migrator.refresh(VersionId::new(19), &[CommId::new(3)]);
        assert_that!(migrator.target_version(), eq(VersionId::new(19)));
        // The version-18 ack no longer counts against the raised target.
        let actions = migrator.step();
        assert_that!(&actions.syn, eq(&vec![CommId::new(3)]));
    }

    #[rstest]
    fn refresh_reconciles_destinations() {
        let mut migrator = migrator();
        migrator.refresh(VersionId::new(18), &[CommId::new(4)]);
        let actions = migrator.step();
        assert_that!(&actions.syn, eq(&vec![CommId::new(4)]));
    }

    #[rstest]
    fn terminated_migrator_is_inert() {
        let mut migrator = migrator();
        migrator.terminate();
        migrator.ack(CommId::new(3), VersionId::new(18));
        let actions = migrator.step();
        assert_that!(actions.syn.is_empty(), eq(true));
        assert_that!(actions.done, eq(false));
        // Terminate is idempotent.
        migrator.terminate();
        assert_that!(migrator.is_terminated(), eq(true));
    }
}
