//! Cross-datacenter unanimity vote.
//!
//! One leader per participating datacenter announces its DC's local
//! outcome; the transaction commits iff every datacenter votes commit.
//! Votes are monotone (first vote per DC wins) and the round aborts when
//! its deadline passes with votes still missing.

use std::time::Instant;

use mdn_common::ids::PaxosGroupId;
use mdn_wire::VoteOutcome;

/// Per-transaction global vote state at one datacenter leader.
#[derive(Debug)]
pub struct GlobalVoter {
    dcs: Vec<PaxosGroupId>,
    votes: Vec<(PaxosGroupId, VoteOutcome)>,
    deadline: Option<Instant>,
    expired: bool,
}

impl GlobalVoter {
    /// Creates vote state over the participating datacenters.
    #[must_use]
    pub fn new(dcs: Vec<PaxosGroupId>) -> Self {
        Self {
            dcs,
            votes: Vec::new(),
            deadline: None,
            expired: false,
        }
    }

    /// The participating datacenters.
    #[must_use]
    pub fn dcs(&self) -> &[PaxosGroupId] {
        &self.dcs
    }

    /// Arms the abort deadline; later calls keep the first deadline.
    pub fn arm_deadline(&mut self, deadline: Instant) {
        if self.deadline.is_none() {
            self.deadline = Some(deadline);
        }
    }

    /// Records one datacenter's vote. The first vote per DC wins; votes
    /// from unknown DCs are ignored.
    pub fn record_vote(&mut self, dc: PaxosGroupId, outcome: VoteOutcome) {
        if !self.dcs.contains(&dc) {
            return;
        }
        if self.votes.iter().any(|(voted_dc, _)| *voted_dc == dc) {
            return;
        }
        self.votes.push((dc, outcome));
    }

    /// Votes learned so far, for recovery transfer.
    #[must_use]
    pub fn known_votes(&self) -> Vec<(PaxosGroupId, VoteOutcome)> {
        self.votes.clone()
    }

    /// Folds in votes learned by a peer.
    pub fn merge(&mut self, votes: &[(PaxosGroupId, VoteOutcome)]) {
        for (dc, outcome) in votes {
            self.record_vote(*dc, *outcome);
        }
    }

    /// Marks missing votes as aborts once `now` passes the deadline.
    pub fn expire_if_due(&mut self, now: Instant) {
        if self.expired || self.outcome().is_some() {
            return;
        }
        if self.deadline.is_some_and(|deadline| now >= deadline) {
            self.expired = true;
        }
    }

    /// The round's outcome, once decided: any abort vote or an expired
    /// deadline aborts; unanimity commits.
    #[must_use]
    pub fn outcome(&self) -> Option<VoteOutcome> {
        if self
            .votes
            .iter()
            .any(|(_, outcome)| *outcome == VoteOutcome::Abort)
        {
            return Some(VoteOutcome::Abort);
        }
        if self.votes.len() == self.dcs.len() && !self.dcs.is_empty() {
            return Some(VoteOutcome::Commit);
        }
        if self.expired {
            return Some(VoteOutcome::Abort);
        }
        None
    }
}
