//! Single-decree Paxos on a transaction's local commit outcome.
//!
//! One synod instance runs per transaction among the hosting group's
//! members. Ballot numbers are partitioned by member position so two
//! proposers can never collide on a ballot: ballot `b` belongs to
//! `members[b % n]`. The happy path is the position-0 leader driving
//! 1a → 1b → 2a → 2b and announcing the result with a learn message.

use std::collections::BTreeMap;

use mdn_common::ids::CommId;
use mdn_wire::VoteOutcome;

/// Proposer-side reaction to an incoming synod message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SynodAction {
    /// Nothing to send.
    None,
    /// Broadcast a 2a carrying this ballot and outcome.
    Propose(u64, VoteOutcome),
    /// The outcome is decided; announce it with a learn message.
    Learned(VoteOutcome),
}

/// Synod state held at one group member.
#[derive(Debug)]
pub struct OutcomeSynod {
    members: Vec<CommId>,
    me: CommId,
    // Acceptor state.
    promised: u64,
    accepted: Option<(u64, VoteOutcome)>,
    // Proposer state, populated once `start` runs here.
    my_ballot: Option<u64>,
    preference: Option<VoteOutcome>,
    promises: BTreeMap<CommId, Option<(u64, VoteOutcome)>>,
    proposed: Option<VoteOutcome>,
    accepts: BTreeMap<CommId, u64>,
    learned: Option<VoteOutcome>,
}

impl OutcomeSynod {
    /// Creates synod state for one member of `members`.
    #[must_use]
    pub fn new(me: CommId, members: Vec<CommId>) -> Self {
        Self {
            members,
            me,
            promised: 0,
            accepted: None,
            my_ballot: None,
            preference: None,
            promises: BTreeMap::new(),
            proposed: None,
            accepts: BTreeMap::new(),
            learned: None,
        }
    }

    fn quorum(&self) -> usize {
        self.members.len() / 2 + 1
    }

    fn my_index(&self) -> usize {
        self.members
            .iter()
            .position(|member| *member == self.me)
            .unwrap_or(0)
    }

    /// The decided outcome, once known.
    #[must_use]
    pub fn learned(&self) -> Option<VoteOutcome> {
        self.learned
    }

    /// Whether this member has started proposing.
    #[must_use]
    pub fn proposing(&self) -> bool {
        self.my_ballot.is_some()
    }

    /// Starts (or restarts) a proposal round preferring `preference`.
    ///
    /// Returns the ballot to solicit promises for; the caller broadcasts a
    /// 1a with it. This member's own promise is folded in immediately.
    pub fn start(&mut self, preference: VoteOutcome) -> u64 {
        let n = self.members.len().max(1) as u64;
        let floor = self
            .promised
            .max(self.my_ballot.unwrap_or(0));
        let round = floor / n + 1;
        let ballot = round * n + self.my_index() as u64;

        self.my_ballot = Some(ballot);
        self.preference = Some(preference);
        self.promises.clear();
        self.proposed = None;
        self.accepts.clear();

        // Self-promise without a message round trip.
        if let Some((promise_ballot, accepted)) = self.observe_1a(self.me, ballot) {
            let _ = self.observe_1b(self.me, promise_ballot, accepted);
        }
        ballot
    }

    /// Acceptor: handles a 1a. Returns the promise to send back, as
    /// `(ballot, previously accepted outcome)`.
    pub fn observe_1a(
        &mut self,
        _from: CommId,
        ballot: u64,
    ) -> Option<(u64, Option<(u64, VoteOutcome)>)> {
        if ballot < self.promised {
            return None;
        }
        self.promised = ballot;
        Some((ballot, self.accepted))
    }

    /// Proposer: folds in a promise. Returns `Propose` once a quorum of
    /// promises is in.
    pub fn observe_1b(
        &mut self,
        from: CommId,
        ballot: u64,
        accepted: Option<(u64, VoteOutcome)>,
    ) -> SynodAction {
        if self.my_ballot != Some(ballot) || self.proposed.is_some() {
            return SynodAction::None;
        }
        if !self.members.contains(&from) {
            return SynodAction::None;
        }
        let _ = self.promises.insert(from, accepted);
        if self.promises.len() < self.quorum() {
            return SynodAction::None;
        }

        // A previously accepted outcome binds the new ballot.
        let outcome = self
            .promises
            .values()
            .flatten()
            .max_by_key(|(accepted_ballot, _)| *accepted_ballot)
            .map(|(_, outcome)| *outcome)
            .or(self.preference)
            .unwrap_or(VoteOutcome::Abort);
        self.proposed = Some(outcome);

        // Self-accept without a message round trip.
        if self.observe_2a(self.me, ballot, outcome) {
            if let SynodAction::Learned(learned) = self.observe_2b(self.me, ballot, outcome) {
                return SynodAction::Learned(learned);
            }
        }
        SynodAction::Propose(ballot, outcome)
    }

    /// Acceptor: handles a 2a. Returns whether the value was accepted; the
    /// caller answers the proposer with a 2b when it was.
    pub fn observe_2a(&mut self, _from: CommId, ballot: u64, outcome: VoteOutcome) -> bool {
        if ballot < self.promised {
            return false;
        }
        self.promised = ballot;
        self.accepted = Some((ballot, outcome));
        true
    }

    /// Proposer: folds in a 2b. Returns `Learned` once a quorum accepted.
    pub fn observe_2b(&mut self, from: CommId, ballot: u64, outcome: VoteOutcome) -> SynodAction {
        if self.my_ballot != Some(ballot) || self.proposed != Some(outcome) {
            return SynodAction::None;
        }
        if !self.members.contains(&from) {
            return SynodAction::None;
        }
        let _ = self.accepts.insert(from, ballot);
        if self.accepts.len() >= self.quorum() && self.learned.is_none() {
            self.learned = Some(outcome);
            return SynodAction::Learned(outcome);
        }
        SynodAction::None
    }

    /// Learner: adopts an announced outcome.
    pub fn observe_learn(&mut self, outcome: VoteOutcome) {
        if self.learned.is_none() {
            self.learned = Some(outcome);
        }
    }
}
