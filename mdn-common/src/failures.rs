//! Peer failure observations.
//!
//! Failure is observed two ways: a `DISRUPTED` delivery from the message
//! bus, or a server-failure notification from the coordinator link. Both
//! land here. The set is contact-based: any later frame from a peer clears
//! its entry, so a recovered node rejoins leader rotation without waiting
//! for a configuration epoch.

use std::sync::{Mutex, MutexGuard, PoisonError};

use hashbrown::HashSet;

use crate::ids::CommId;

/// Thread-safe set of peers currently believed unreachable.
#[derive(Debug, Default)]
pub struct FailureTracker {
    failed: Mutex<HashSet<CommId>>,
}

impl FailureTracker {
    /// Creates an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one failure observation for `id`.
    pub fn record_failure(&self, id: CommId) {
        let _ = self.lock_failed().insert(id);
    }

    /// Clears `id` after a successful contact.
    pub fn record_contact(&self, id: CommId) {
        let _ = self.lock_failed().remove(&id);
    }

    /// Whether `id` is currently believed unreachable.
    #[must_use]
    pub fn contains(&self, id: CommId) -> bool {
        self.lock_failed().contains(&id)
    }

    /// Point-in-time snapshot of the failed set.
    #[must_use]
    pub fn snapshot(&self) -> Vec<CommId> {
        self.lock_failed().iter().copied().collect()
    }

    /// Number of peers currently marked failed.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock_failed().len()
    }

    /// Whether no peer is marked failed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock_failed().is_empty()
    }

    fn lock_failed(&self) -> MutexGuard<'_, HashSet<CommId>> {
        self.failed.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::FailureTracker;
    use crate::ids::CommId;
    use googletest::prelude::*;
    use rstest::rstest;

    #[rstest]
    fn failure_is_recorded_until_contact() {
        let tracker = FailureTracker::new();
        assert_that!(tracker.contains(CommId::new(7)), eq(false));

        tracker.record_failure(CommId::new(7));
        assert_that!(tracker.contains(CommId::new(7)), eq(true));
        assert_that!(tracker.len(), eq(1_usize));

        tracker.record_contact(CommId::new(7));
        assert_that!(tracker.contains(CommId::new(7)), eq(false));
        assert_that!(tracker.is_empty(), eq(true));
    }

    #[rstest]
    fn duplicate_observations_collapse() {
        let tracker = FailureTracker::new();
        tracker.record_failure(CommId::new(7));
        tracker.record_failure(CommId::new(7));
        assert_that!(tracker.len(), eq(1_usize));
    }

    #[rstest]
    fn contact_for_an_unknown_peer_is_a_noop() {
        let tracker = FailureTracker::new();
        tracker.record_contact(CommId::new(9));
        assert_that!(tracker.is_empty(), eq(true));
    }

    #[rstest]
    fn snapshot_reports_all_failed_peers() {
        let tracker = FailureTracker::new();
        tracker.record_failure(CommId::new(1));
        tracker.record_failure(CommId::new(2));
        let mut snapshot = tracker.snapshot();
        snapshot.sort_unstable();
        assert_that!(&snapshot, eq(&vec![CommId::new(1), CommId::new(2)]));
    }
}
