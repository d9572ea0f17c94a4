//! Per-transaction replicated state machine.
//!
//! Every group member hosts one [`Transaction`] replica per transaction.
//! Client commands, intra-group Paxos traffic, global-vote traffic, and
//! KVS callbacks all feed the same machine; after every input the work
//! cycle advances through any state whose preconditions hold. The machine
//! is pure: instead of talking to the bus it emits [`TxEffect`] values the
//! daemon carries out, which keeps the protocol rules testable without a
//! cluster.

use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use mdn_cluster::PaxosGroup;
use mdn_common::error::ReturnCode;
use mdn_common::ids::{CommId, PaxosGroupId, TransactionGroup};
use mdn_wire::{LockKind, LogEntry, Message, VoteOutcome};

use crate::global_vote::GlobalVoter;
use crate::synod::{OutcomeSynod, SynodAction};

/// How long a global-vote round may run before missing votes abort it.
pub const GLOBAL_VOTE_TIMEOUT: Duration = Duration::from_secs(60);

/// Minimum spacing between global-vote retransmissions.
const GLOBAL_VOTE_RESEND_INTERVAL: Duration = Duration::from_secs(1);

/// Lifecycle of one transaction replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TxState {
    /// Created but the begin entry has not landed yet.
    Initialized,
    /// Accepting operations into the log.
    Executing,
    /// Running commit-phase KV work and the local outcome synod.
    LocalCommitVote,
    /// Waiting for every datacenter's vote.
    GlobalCommitVote,
    /// Decided: committed.
    Committed,
    /// Decided: aborted.
    Aborted,
    /// Terminal work finished; awaiting collection.
    Terminated,
    /// Garbage-collectable.
    Collected,
}

/// Commit-phase progress of one operation at the group leader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KvPhase {
    Idle,
    LockWait,
    Locked,
    ActionWait,
    Done,
    Failed,
}

/// One slot of the replicated operation log.
#[derive(Debug)]
struct OperationSlot {
    entry: Option<LogEntry>,
    entry_bytes: Option<Vec<u8>>,
    proposed: bool,
    acks: BTreeSet<CommId>,
    force_durable: bool,
    client: Option<(CommId, u64)>,
    responded: bool,
    exec_read_issued: bool,
    read_done: bool,
    read_rc: ReturnCode,
    read_timestamp: u64,
    read_value: Vec<u8>,
    kv: KvPhase,
    lock_taken: bool,
}

impl Default for OperationSlot {
    fn default() -> Self {
        Self {
            entry: None,
            entry_bytes: None,
            proposed: false,
            acks: BTreeSet::new(),
            force_durable: false,
            client: None,
            responded: false,
            exec_read_issued: false,
            read_done: false,
            read_rc: ReturnCode::Garbage,
            read_timestamp: 0,
            read_value: Vec::new(),
            kv: KvPhase::Idle,
            lock_taken: false,
        }
    }
}

/// Side effects the daemon must carry out for the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxEffect {
    /// Send to every group member except this one.
    Broadcast(Message),
    /// Send to one specific node.
    SendTo(CommId, Message),
    /// Send to the leader of another datacenter's group.
    GvSend {
        /// Destination group.
        dc: PaxosGroupId,
        /// Message to deliver to its leader.
        message: Message,
    },
    /// Answer the client behind one request nonce.
    ClientResponse {
        /// Client node.
        to: CommId,
        /// Client request nonce.
        nonce: u64,
        /// Outcome code.
        rc: ReturnCode,
        /// Read timestamp (zero for non-reads).
        timestamp: u64,
        /// Read value (empty for non-reads).
        value: Vec<u8>,
    },
    /// Issue the execution-time read backing one read op.
    ExecRead {
        /// Slot of the read op.
        seqno: u64,
        /// Table under read.
        table: Vec<u8>,
        /// Key under read.
        key: Vec<u8>,
        /// Upper timestamp bound.
        timestamp: u64,
    },
    /// Acquire the per-key lock for one op.
    AcquireLock {
        /// Slot of the op.
        seqno: u64,
        /// Table of the lock record.
        table: Vec<u8>,
        /// Key of the lock record.
        key: Vec<u8>,
        /// Lock strength.
        kind: LockKind,
    },
    /// Release the per-key lock for one op.
    ReleaseLock {
        /// Slot of the op.
        seqno: u64,
        /// Table of the lock record.
        table: Vec<u8>,
        /// Key of the lock record.
        key: Vec<u8>,
        /// Lock strength.
        kind: LockKind,
    },
    /// Perform one committed write at the commit timestamp.
    CommitWrite {
        /// Slot of the write op.
        seqno: u64,
        /// Table under write.
        table: Vec<u8>,
        /// Key under write.
        key: Vec<u8>,
        /// Commit timestamp.
        timestamp: u64,
        /// Value bytes.
        value: Vec<u8>,
    },
    /// Re-read one key at the commit timestamp for verification.
    VerifyRead {
        /// Slot of the read op.
        seqno: u64,
        /// Table under read.
        table: Vec<u8>,
        /// Key under read.
        key: Vec<u8>,
        /// Commit timestamp.
        timestamp: u64,
    },
    /// The replica is garbage-collectable.
    Collected,
}

/// One transaction replica.
pub struct Transaction {
    tg: TransactionGroup,
    me: CommId,
    group: PaxosGroup,
    unreachable: Vec<CommId>,
    state: TxState,
    init_timestamp: u64,
    dcs: Vec<PaxosGroupId>,
    origin: bool,
    prefer_to_commit: bool,
    ops: Vec<OperationSlot>,
    deferred_2b: Vec<(CommId, u64)>,
    synod: OutcomeSynod,
    voter: Option<GlobalVoter>,
    early_votes: Vec<(PaxosGroupId, VoteOutcome)>,
    gv_last_send: Option<Instant>,
    kv_started: bool,
    commit_requester: Option<(CommId, u64)>,
    locks_released: bool,
    commit_record_sent: bool,
    terminal_rc_sent: bool,
}

impl Transaction {
    /// Creates an idle replica hosted by `me` within `group`.
    #[must_use]
    pub fn new(tg: TransactionGroup, me: CommId, group: PaxosGroup) -> Self {
        let synod = OutcomeSynod::new(me, group.members.clone());
        Self {
            tg,
            me,
            group,
            unreachable: Vec::new(),
            state: TxState::Initialized,
            init_timestamp: 0,
            dcs: Vec::new(),
            origin: false,
            prefer_to_commit: true,
            ops: Vec::new(),
            deferred_2b: Vec::new(),
            synod,
            voter: None,
            early_votes: Vec::new(),
            gv_last_send: None,
            kv_started: false,
            commit_requester: None,
            locks_released: false,
            commit_record_sent: false,
            terminal_rc_sent: false,
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> TxState {
        self.state
    }

    /// The replica's identity key.
    #[must_use]
    pub fn tg(&self) -> TransactionGroup {
        self.tg
    }

    /// Ordered members of the hosting group.
    #[must_use]
    pub fn members(&self) -> &[CommId] {
        &self.group.members
    }

    /// Whether this replica is done and collectable.
    #[must_use]
    pub fn finished(&self) -> bool {
        self.state == TxState::Collected
    }

    /// Adopts the daemon's current view of unreachable members. Leadership
    /// follows on the next work cycle: when the previous leader is in the
    /// set, the next reachable member starts issuing 2a and driving the
    /// vote.
    pub fn note_unreachable(&mut self, unreachable: Vec<CommId>) {
        self.unreachable = unreachable;
    }

    fn leader(&self) -> Option<CommId> {
        self.group.leader(&self.unreachable)
    }

    fn is_leader(&self) -> bool {
        self.leader() == Some(self.me)
    }

    fn quorum(&self) -> usize {
        self.group.quorum()
    }

    fn is_durable(&self, seqno: usize) -> bool {
        let Some(slot) = self.ops.get(seqno) else {
            return false;
        };
        slot.entry.is_some()
            && (slot.force_durable
                || (!self.group.members.is_empty() && slot.acks.len() >= self.quorum()))
    }

    fn end_marker(&self) -> Option<(usize, bool)> {
        self.ops.iter().enumerate().find_map(|(index, slot)| {
            match slot.entry {
                Some(LogEntry::Prepare) => Some((index, false)),
                Some(LogEntry::Abort) => Some((index, true)),
                _ => None,
            }
        })
    }

    fn resize_to_hold(&mut self, seqno: u64) -> Option<usize> {
        let index = usize::try_from(seqno).ok()?;
        if index >= 1 << 20 {
            // A log this long is a corrupt or hostile seqno.
            return None;
        }
        while self.ops.len() <= index {
            self.ops.push(OperationSlot::default());
        }
        Some(index)
    }

    /// Stores `entry` at `seqno` honoring the byte-identical rule. Returns
    /// the slot index when the slot now holds the entry.
    fn store_entry(&mut self, seqno: u64, entry: LogEntry, effects: &mut Vec<TxEffect>) -> Option<usize> {
        let bytes = entry.encode().ok()?;
        let index = self.resize_to_hold(seqno)?;
        let slot = &mut self.ops[index];
        match &slot.entry_bytes {
            Some(existing) if *existing == bytes => Some(index),
            Some(_) => {
                // Divergent proposals for one slot are rejected silently;
                // the log entry must be byte-identical across replicas.
                None
            }
            None => {
                slot.entry = Some(entry);
                slot.entry_bytes = Some(bytes);
                let _ = slot.acks.insert(self.me);
                effects.push(TxEffect::Broadcast(Message::Paxos2b {
                    tg: self.tg,
                    seqno,
                }));
                Some(index)
            }
        }
    }

    /// Leader-side: stores an entry and proposes it to the group. The 2a
    /// is ordered ahead of the storing member's own 2b so followers always
    /// learn the slot before acks for it arrive.
    fn propose_entry(&mut self, seqno: u64, entry: LogEntry, effects: &mut Vec<TxEffect>) -> Option<usize> {
        let insert_at = effects.len();
        let index = self.store_entry(seqno, entry, effects)?;
        if self.is_leader() && !self.ops[index].proposed {
            self.ops[index].proposed = true;
            let entry_bytes = self.ops[index]
                .entry_bytes
                .clone()
                .unwrap_or_default();
            effects.insert(
                insert_at,
                TxEffect::Broadcast(Message::Paxos2a {
                    tg: self.tg,
                    seqno,
                    entry: entry_bytes,
                }),
            );
        }
        Some(index)
    }

    // ----- client commands -----

    /// Handles a client begin.
    pub fn begin(
        &mut self,
        from: CommId,
        nonce: u64,
        timestamp: u64,
        dcs: Vec<PaxosGroupId>,
        effects: &mut Vec<TxEffect>,
    ) {
        if !self.is_leader() {
            log::warn!("{}: begin delivered to a non-leader; ignoring", self.tg);
            return;
        }
        let entry = LogEntry::Begin {
            timestamp,
            members: self.group.members.clone(),
            dcs: dcs.clone(),
        };
        if let Some(index) = self.propose_entry(0, entry, effects) {
            self.origin = true;
            if self.ops[index].client.is_none() {
                self.ops[index].client = Some((from, nonce));
            }
        }
        self.work_state_machine(effects);
    }

    /// Handles a client read.
    pub fn read(
        &mut self,
        from: CommId,
        nonce: u64,
        seqno: u64,
        table: Vec<u8>,
        key: Vec<u8>,
        effects: &mut Vec<TxEffect>,
    ) {
        if !self.is_leader() {
            log::warn!("{}: read delivered to a non-leader; ignoring", self.tg);
            return;
        }
        if self.state >= TxState::LocalCommitVote {
            log::warn!("{}: read arrived after the log was frozen; ignoring", self.tg);
            return;
        }
        let entry = LogEntry::Read {
            table,
            key,
            timestamp: self.init_timestamp,
        };
        // Client seqnos count operations from zero; slot zero belongs to
        // the begin entry.
        if let Some(index) = self.propose_entry(seqno + 1, entry, effects) {
            if self.ops[index].client.is_none() {
                self.ops[index].client = Some((from, nonce));
            }
        }
        self.work_state_machine(effects);
    }

    /// Handles a client write.
    #[allow(clippy::too_many_arguments)]
    pub fn write(
        &mut self,
        from: CommId,
        nonce: u64,
        seqno: u64,
        table: Vec<u8>,
        key: Vec<u8>,
        value: Vec<u8>,
        effects: &mut Vec<TxEffect>,
    ) {
        if !self.is_leader() {
            log::warn!("{}: write delivered to a non-leader; ignoring", self.tg);
            return;
        }
        if self.state >= TxState::LocalCommitVote {
            log::warn!("{}: write arrived after the log was frozen; ignoring", self.tg);
            return;
        }
        let entry = LogEntry::Write { table, key, value };
        if let Some(index) = self.propose_entry(seqno + 1, entry, effects) {
            if self.ops[index].client.is_none() {
                self.ops[index].client = Some((from, nonce));
            }
        }
        self.work_state_machine(effects);
    }

    /// Handles a client commit request; `seqno` is the prepare marker.
    pub fn prepare(&mut self, from: CommId, nonce: u64, seqno: u64, effects: &mut Vec<TxEffect>) {
        if !self.is_leader() {
            log::warn!("{}: commit delivered to a non-leader; ignoring", self.tg);
            return;
        }
        if self.commit_requester.is_none() {
            self.commit_requester = Some((from, nonce));
        }
        if self.state <= TxState::Executing {
            let _ = self.propose_entry(seqno + 1, LogEntry::Prepare, effects);
        }
        self.work_state_machine(effects);
    }

    /// Handles a client abort request; idempotent.
    pub fn abort_request(
        &mut self,
        from: CommId,
        nonce: u64,
        seqno: u64,
        effects: &mut Vec<TxEffect>,
    ) {
        if !self.is_leader() {
            log::warn!("{}: abort delivered to a non-leader; ignoring", self.tg);
            return;
        }
        if self.commit_requester.is_none() {
            self.commit_requester = Some((from, nonce));
        }
        if self.state <= TxState::Executing {
            self.prefer_to_commit = false;
            let _ = self.propose_entry(seqno + 1, LogEntry::Abort, effects);
        }
        self.work_state_machine(effects);
    }

    // ----- intra-group paxos -----

    /// Handles a 2a proposal for one slot.
    pub fn paxos_2a(&mut self, _from: CommId, seqno: u64, entry: &[u8], effects: &mut Vec<TxEffect>) {
        match LogEntry::decode(entry) {
            Ok(decoded) => {
                let already_held = usize::try_from(seqno)
                    .ok()
                    .and_then(|index| self.ops.get(index))
                    .is_some_and(|slot| slot.entry_bytes.as_deref() == Some(entry));
                if already_held {
                    // Retransmitted identical proposal (a retry, or a new
                    // leader re-driving the log); re-ack so the proposer
                    // can observe durability.
                    effects.push(TxEffect::Broadcast(Message::Paxos2b {
                        tg: self.tg,
                        seqno,
                    }));
                } else {
                    let _ = self.store_entry(seqno, decoded, effects);
                }
            }
            Err(error) => {
                log::warn!("{}: dropping corrupt 2a for slot {seqno}: {error}", self.tg);
                return;
            }
        }
        self.work_state_machine(effects);
    }

    /// Handles a 2b acknowledgment for one slot.
    pub fn paxos_2b(&mut self, from: CommId, seqno: u64, effects: &mut Vec<TxEffect>) {
        self.apply_2b(from, seqno);
        self.work_state_machine(effects);
    }

    fn apply_2b(&mut self, from: CommId, seqno: u64) {
        let Ok(index) = usize::try_from(seqno) else {
            return;
        };
        if index >= self.ops.len() || self.ops[index].entry.is_none() {
            // The slot is not materialized yet; replay on a later cycle.
            if !self.deferred_2b.contains(&(from, seqno)) {
                self.deferred_2b.push((from, seqno));
            }
            return;
        }
        let _ = self.ops[index].acks.insert(from);
    }

    fn drain_deferred_2b(&mut self) {
        let deferred = std::mem::take(&mut self.deferred_2b);
        for (from, seqno) in deferred {
            self.apply_2b(from, seqno);
        }
    }

    /// Handles a commit record: materializes the full log, marks it
    /// durable, and drives straight to the committed state.
    pub fn commit_record(&mut self, entries: &[Vec<u8>], effects: &mut Vec<TxEffect>) {
        if self.state >= TxState::Committed {
            return;
        }
        for (seqno, bytes) in entries.iter().enumerate() {
            match LogEntry::decode(bytes) {
                Ok(entry) => {
                    let _ = self.store_entry(seqno as u64, entry, effects);
                }
                Err(error) => {
                    log::warn!("{}: dropping corrupt commit record: {error}", self.tg);
                    return;
                }
            }
        }
        for slot in &mut self.ops {
            slot.force_durable = true;
        }
        // The record only exists because the transaction committed; adopt
        // the local outcome, advance, and then force the global round that
        // already concluded elsewhere.
        self.synod.observe_learn(VoteOutcome::Commit);
        self.work_state_machine(effects);
        if self.state == TxState::GlobalCommitVote {
            if let Some(voter) = self.voter.as_mut() {
                let dcs = voter.dcs().to_vec();
                for dc in dcs {
                    voter.record_vote(dc, VoteOutcome::Commit);
                }
            }
            self.work_state_machine(effects);
        }
    }

    /// Adopts a cross-datacenter proposal at a remote group's leader: the
    /// full log is replayed through this group's own Paxos pipeline.
    pub fn adopt_proposal(&mut self, entries: &[Vec<u8>], effects: &mut Vec<TxEffect>) {
        if !self.is_leader() || self.state >= TxState::Committed {
            return;
        }
        for (seqno, bytes) in entries.iter().enumerate() {
            match LogEntry::decode(bytes) {
                Ok(entry) => {
                    let _ = self.propose_entry(seqno as u64, entry, effects);
                }
                Err(error) => {
                    log::warn!("{}: dropping corrupt proposal: {error}", self.tg);
                    return;
                }
            }
        }
        self.work_state_machine(effects);
    }

    // ----- local-vote synod -----

    /// Handles a local-vote 1a.
    pub fn lv_vote_1a(&mut self, from: CommId, ballot: u64, effects: &mut Vec<TxEffect>) {
        if let Some((promised, accepted)) = self.synod.observe_1a(from, ballot) {
            effects.push(TxEffect::SendTo(
                from,
                Message::LvVote1b {
                    tg: self.tg,
                    ballot: promised,
                    accepted_ballot: accepted.map_or(0, |(ballot, _)| ballot),
                    accepted: accepted.map(|(_, outcome)| outcome),
                },
            ));
        }
        self.work_state_machine(effects);
    }

    /// Handles a local-vote 1b promise.
    pub fn lv_vote_1b(
        &mut self,
        from: CommId,
        ballot: u64,
        accepted_ballot: u64,
        accepted: Option<VoteOutcome>,
        effects: &mut Vec<TxEffect>,
    ) {
        let accepted = accepted.map(|outcome| (accepted_ballot, outcome));
        let action = self.synod.observe_1b(from, ballot, accepted);
        self.apply_synod_action(action, effects);
        self.work_state_machine(effects);
    }

    /// Handles a local-vote 2a accept request.
    pub fn lv_vote_2a(
        &mut self,
        from: CommId,
        ballot: u64,
        outcome: VoteOutcome,
        effects: &mut Vec<TxEffect>,
    ) {
        if self.synod.observe_2a(from, ballot, outcome) {
            effects.push(TxEffect::SendTo(
                from,
                Message::LvVote2b {
                    tg: self.tg,
                    ballot,
                    outcome,
                },
            ));
        }
        self.work_state_machine(effects);
    }

    /// Handles a local-vote 2b acceptance.
    pub fn lv_vote_2b(
        &mut self,
        from: CommId,
        ballot: u64,
        outcome: VoteOutcome,
        effects: &mut Vec<TxEffect>,
    ) {
        let action = self.synod.observe_2b(from, ballot, outcome);
        self.apply_synod_action(action, effects);
        self.work_state_machine(effects);
    }

    /// Handles a local-vote outcome announcement.
    pub fn lv_vote_learn(&mut self, outcome: VoteOutcome, effects: &mut Vec<TxEffect>) {
        self.synod.observe_learn(outcome);
        self.work_state_machine(effects);
    }

    fn apply_synod_action(&mut self, action: SynodAction, effects: &mut Vec<TxEffect>) {
        match action {
            SynodAction::None => {}
            SynodAction::Propose(ballot, outcome) => {
                effects.push(TxEffect::Broadcast(Message::LvVote2a {
                    tg: self.tg,
                    ballot,
                    outcome,
                }));
            }
            SynodAction::Learned(outcome) => {
                effects.push(TxEffect::Broadcast(Message::LvVoteLearn {
                    tg: self.tg,
                    outcome,
                }));
            }
        }
    }

    // ----- global vote -----

    /// Handles one datacenter's announced vote.
    pub fn gv_vote_2a(
        &mut self,
        from: CommId,
        dc: PaxosGroupId,
        outcome: VoteOutcome,
        effects: &mut Vec<TxEffect>,
    ) {
        match self.voter.as_mut() {
            Some(voter) => voter.record_vote(dc, outcome),
            // Votes can outrun this replica's own local vote; hold them
            // until the voter exists.
            None => self.early_votes.push((dc, outcome)),
        }
        if self.is_leader() {
            // Acknowledge the sender and relay the vote into the group so
            // every member decides independently.
            if from != self.me {
                effects.push(TxEffect::SendTo(
                    from,
                    Message::GvVote2b {
                        txid: self.tg.txid,
                        dc,
                    },
                ));
            }
            effects.push(TxEffect::Broadcast(Message::GvVote2a {
                txid: self.tg.txid,
                dc,
                outcome,
            }));
        }
        self.work_state_machine(effects);
    }

    /// Handles a peer leader's request for learned votes.
    pub fn gv_vote_1a(&mut self, from: CommId, effects: &mut Vec<TxEffect>) {
        if let Some(voter) = self.voter.as_ref() {
            effects.push(TxEffect::SendTo(
                from,
                Message::GvVote1b {
                    txid: self.tg.txid,
                    votes: voter.known_votes(),
                },
            ));
        }
        self.work_state_machine(effects);
    }

    /// Handles a transfer of learned votes.
    pub fn gv_vote_1b(
        &mut self,
        votes: &[(PaxosGroupId, VoteOutcome)],
        effects: &mut Vec<TxEffect>,
    ) {
        match self.voter.as_mut() {
            Some(voter) => voter.merge(votes),
            None => self.early_votes.extend_from_slice(votes),
        }
        self.work_state_machine(effects);
    }

    // ----- kvs callbacks -----

    /// Completion of an execution-time read.
    pub fn callback_read(
        &mut self,
        seqno: u64,
        rc: ReturnCode,
        timestamp: u64,
        value: Vec<u8>,
        effects: &mut Vec<TxEffect>,
    ) {
        if let Ok(index) = usize::try_from(seqno) {
            if let Some(slot) = self.ops.get_mut(index) {
                slot.read_done = true;
                slot.read_rc = rc;
                slot.read_timestamp = timestamp;
                slot.read_value = value;
                if !matches!(rc, ReturnCode::Success | ReturnCode::NotFound) {
                    self.prefer_to_commit = false;
                }
            }
        }
        self.work_state_machine(effects);
    }

    /// Completion of a commit-phase lock acquire.
    pub fn callback_locked(&mut self, seqno: u64, rc: ReturnCode, effects: &mut Vec<TxEffect>) {
        if let Some(slot) = usize::try_from(seqno).ok().and_then(|i| self.ops.get_mut(i)) {
            if slot.kv == KvPhase::LockWait {
                if rc.is_success() {
                    slot.kv = KvPhase::Locked;
                    slot.lock_taken = true;
                } else {
                    slot.kv = KvPhase::Failed;
                    self.prefer_to_commit = false;
                }
            }
        }
        self.work_state_machine(effects);
    }

    /// Completion of a commit-phase write.
    pub fn callback_write(&mut self, seqno: u64, rc: ReturnCode, effects: &mut Vec<TxEffect>) {
        if let Some(slot) = usize::try_from(seqno).ok().and_then(|i| self.ops.get_mut(i)) {
            if slot.kv == KvPhase::ActionWait {
                if rc.is_success() {
                    slot.kv = KvPhase::Done;
                } else {
                    slot.kv = KvPhase::Failed;
                    self.prefer_to_commit = false;
                }
            }
        }
        self.work_state_machine(effects);
    }

    /// Completion of a commit-phase verify read.
    pub fn callback_verify(
        &mut self,
        seqno: u64,
        rc: ReturnCode,
        timestamp: u64,
        value: Vec<u8>,
        effects: &mut Vec<TxEffect>,
    ) {
        if let Some(slot) = usize::try_from(seqno).ok().and_then(|i| self.ops.get_mut(i)) {
            if slot.kv == KvPhase::ActionWait {
                let stable = rc == slot.read_rc
                    && timestamp == slot.read_timestamp
                    && value == slot.read_value;
                if stable {
                    slot.kv = KvPhase::Done;
                } else {
                    slot.kv = KvPhase::Failed;
                    self.prefer_to_commit = false;
                }
            }
        }
        self.work_state_machine(effects);
    }

    /// Completion of a lock release; failures are logged and ignored.
    pub fn callback_unlocked(&mut self, seqno: u64, rc: ReturnCode, effects: &mut Vec<TxEffect>) {
        if !rc.is_success() {
            log::debug!("{}: lock release for slot {seqno} answered {rc}", self.tg);
        }
        self.work_state_machine(effects);
    }

    /// Periodic tick: drives global-vote expiry and retransmission.
    pub fn tick(&mut self, now: Instant, effects: &mut Vec<TxEffect>) {
        if self.state == TxState::GlobalCommitVote {
            if let Some(voter) = self.voter.as_mut() {
                voter.expire_if_due(now);
            }
            self.maybe_resend_votes(now, effects);
        }
        self.work_state_machine(effects);
    }

    fn maybe_resend_votes(&mut self, now: Instant, effects: &mut Vec<TxEffect>) {
        if !self.is_leader() {
            return;
        }
        let due = self
            .gv_last_send
            .is_none_or(|last| now.duration_since(last) >= GLOBAL_VOTE_RESEND_INTERVAL);
        if !due {
            return;
        }
        let Some(voter) = self.voter.as_ref() else {
            return;
        };
        let Some(own_vote) = self.synod.learned() else {
            return;
        };
        let voted = voter.known_votes();
        let missing = voter
            .dcs()
            .iter()
            .filter(|dc| {
                **dc != self.tg.group && !voted.iter().any(|(voted_dc, _)| voted_dc == *dc)
            })
            .copied()
            .collect::<Vec<_>>();
        for dc in missing {
            effects.push(TxEffect::GvSend {
                dc,
                message: Message::GvVote2a {
                    txid: self.tg.txid,
                    dc: self.tg.group,
                    outcome: own_vote,
                },
            });
            effects.push(TxEffect::GvSend {
                dc,
                message: Message::GvVote1a { txid: self.tg.txid },
            });
        }
        self.gv_last_send = Some(now);
    }

    // ----- work cycle -----

    fn work_state_machine(&mut self, effects: &mut Vec<TxEffect>) {
        loop {
            let before = self.state;
            match self.state {
                TxState::Initialized => self.work_initialized(),
                TxState::Executing => self.work_executing(effects),
                TxState::LocalCommitVote => self.work_local_commit_vote(effects),
                TxState::GlobalCommitVote => self.work_global_commit_vote(),
                TxState::Committed | TxState::Aborted => self.work_terminal(effects),
                TxState::Terminated => {
                    self.state = TxState::Collected;
                    effects.push(TxEffect::Collected);
                }
                TxState::Collected => {}
            }
            self.respond_durable_ops(effects);
            if self.state == before {
                return;
            }
        }
    }

    fn work_initialized(&mut self) {
        let Some(slot) = self.ops.first() else {
            return;
        };
        let Some(LogEntry::Begin {
            timestamp, dcs, ..
        }) = slot.entry.as_ref()
        else {
            return;
        };
        self.init_timestamp = *timestamp;
        self.dcs.clone_from(dcs);
        self.state = TxState::Executing;
    }

    fn work_executing(&mut self, effects: &mut Vec<TxEffect>) {
        self.drain_deferred_2b();
        self.propose_pending_slots(effects);
        self.issue_exec_reads(effects);

        let Some((marker, is_abort)) = self.end_marker() else {
            return;
        };
        let all_durable = (0..=marker).all(|seqno| self.is_durable(seqno));
        if !all_durable || !self.exec_reads_settled(marker) {
            return;
        }
        if is_abort {
            self.prefer_to_commit = false;
        }
        self.state = TxState::LocalCommitVote;
    }

    /// Proposes any slot this member holds but has not yet driven. For the
    /// original leader this is a no-op; a member that inherited leadership
    /// after a failure re-drives the whole log from here.
    fn propose_pending_slots(&mut self, effects: &mut Vec<TxEffect>) {
        if !self.is_leader() {
            return;
        }
        for index in 0..self.ops.len() {
            if self.ops[index].entry.is_none() || self.ops[index].proposed {
                continue;
            }
            self.ops[index].proposed = true;
            let entry_bytes = self.ops[index].entry_bytes.clone().unwrap_or_default();
            effects.push(TxEffect::Broadcast(Message::Paxos2a {
                tg: self.tg,
                seqno: index as u64,
                entry: entry_bytes,
            }));
        }
    }

    fn issue_exec_reads(&mut self, effects: &mut Vec<TxEffect>) {
        if !self.is_leader() {
            return;
        }
        for (index, slot) in self.ops.iter_mut().enumerate() {
            if slot.exec_read_issued || slot.read_done {
                continue;
            }
            let Some(LogEntry::Read { table, key, .. }) = slot.entry.as_ref() else {
                continue;
            };
            slot.exec_read_issued = true;
            effects.push(TxEffect::ExecRead {
                seqno: index as u64,
                table: table.clone(),
                key: key.clone(),
                timestamp: u64::MAX,
            });
        }
    }

    fn exec_reads_settled(&self, marker: usize) -> bool {
        if !self.is_leader() {
            return true;
        }
        self.ops[..=marker].iter().all(|slot| {
            !matches!(slot.entry, Some(LogEntry::Read { .. })) || slot.read_done
        })
    }

    fn work_local_commit_vote(&mut self, effects: &mut Vec<TxEffect>) {
        if self.synod.learned().is_none() && self.is_leader() && !self.synod.proposing() {
            self.drive_kv_phase(effects);
            if let Some(preference) = self.kv_phase_outcome() {
                let ballot = self.synod.start(preference);
                effects.push(TxEffect::Broadcast(Message::LvVote1a {
                    tg: self.tg,
                    ballot,
                }));
                // A single-member group decides on its own promises.
                if let Some(outcome) = self.synod.learned() {
                    effects.push(TxEffect::Broadcast(Message::LvVoteLearn {
                        tg: self.tg,
                        outcome,
                    }));
                }
            }
        }

        let Some(outcome) = self.synod.learned() else {
            return;
        };
        if self.dcs.len() > 1 {
            self.enter_global_vote(outcome, effects);
        } else {
            self.state = match outcome {
                VoteOutcome::Commit => TxState::Committed,
                VoteOutcome::Abort => TxState::Aborted,
            };
        }
    }

    fn drive_kv_phase(&mut self, effects: &mut Vec<TxEffect>) {
        if self.kv_started {
            self.continue_kv_phase(effects);
            return;
        }
        self.kv_started = true;

        if !self.prefer_to_commit {
            // An abort marker or a failed read skips the commit-phase KV
            // work entirely.
            for slot in &mut self.ops {
                slot.kv = KvPhase::Done;
            }
            return;
        }

        for (index, slot) in self.ops.iter_mut().enumerate() {
            match slot.entry.as_ref() {
                Some(LogEntry::Read { table, key, .. }) => {
                    slot.kv = KvPhase::LockWait;
                    effects.push(TxEffect::AcquireLock {
                        seqno: index as u64,
                        table: table.clone(),
                        key: key.clone(),
                        kind: LockKind::Read,
                    });
                }
                Some(LogEntry::Write { table, key, .. }) => {
                    slot.kv = KvPhase::LockWait;
                    effects.push(TxEffect::AcquireLock {
                        seqno: index as u64,
                        table: table.clone(),
                        key: key.clone(),
                        kind: LockKind::Write,
                    });
                }
                _ => slot.kv = KvPhase::Done,
            }
        }
        self.continue_kv_phase(effects);
    }

    fn continue_kv_phase(&mut self, effects: &mut Vec<TxEffect>) {
        // Writes and verifies start only after every lock is held.
        let all_locked = self.ops.iter().all(|slot| {
            matches!(slot.kv, KvPhase::Locked | KvPhase::Done | KvPhase::ActionWait)
        });
        if !all_locked {
            return;
        }
        let commit_timestamp = self.init_timestamp;
        for (index, slot) in self.ops.iter_mut().enumerate() {
            if slot.kv != KvPhase::Locked {
                continue;
            }
            match slot.entry.as_ref() {
                Some(LogEntry::Write { table, key, value }) => {
                    slot.kv = KvPhase::ActionWait;
                    effects.push(TxEffect::CommitWrite {
                        seqno: index as u64,
                        table: table.clone(),
                        key: key.clone(),
                        timestamp: commit_timestamp,
                        value: value.clone(),
                    });
                }
                Some(LogEntry::Read { table, key, .. }) => {
                    slot.kv = KvPhase::ActionWait;
                    effects.push(TxEffect::VerifyRead {
                        seqno: index as u64,
                        table: table.clone(),
                        key: key.clone(),
                        timestamp: commit_timestamp,
                    });
                }
                _ => slot.kv = KvPhase::Done,
            }
        }
    }

    /// The vote preference once commit-phase KV work settles, or `None`
    /// while requests are still in flight.
    fn kv_phase_outcome(&self) -> Option<VoteOutcome> {
        if !self.kv_started {
            return None;
        }
        if self.ops.iter().any(|slot| slot.kv == KvPhase::Failed) {
            return Some(VoteOutcome::Abort);
        }
        if self.ops.iter().all(|slot| slot.kv == KvPhase::Done) {
            return Some(if self.prefer_to_commit {
                VoteOutcome::Commit
            } else {
                VoteOutcome::Abort
            });
        }
        None
    }

    fn enter_global_vote(&mut self, own_vote: VoteOutcome, effects: &mut Vec<TxEffect>) {
        self.state = TxState::GlobalCommitVote;
        let mut voter = GlobalVoter::new(self.dcs.clone());
        voter.arm_deadline(Instant::now() + GLOBAL_VOTE_TIMEOUT);
        voter.record_vote(self.tg.group, own_vote);
        let early = std::mem::take(&mut self.early_votes);
        voter.merge(&early);
        self.voter = Some(voter);

        if !self.is_leader() {
            return;
        }
        let record = self.encoded_record();
        for dc in self.dcs.clone() {
            if dc == self.tg.group {
                continue;
            }
            if self.origin {
                effects.push(TxEffect::GvSend {
                    dc,
                    message: Message::GvPropose {
                        txid: self.tg.txid,
                        dcs: self.dcs.clone(),
                        record: record.clone(),
                    },
                });
            }
            effects.push(TxEffect::GvSend {
                dc,
                message: Message::GvVote2a {
                    txid: self.tg.txid,
                    dc: self.tg.group,
                    outcome: own_vote,
                },
            });
        }
        // Members learn our DC's vote through the same relay path as the
        // remote ones.
        effects.push(TxEffect::Broadcast(Message::GvVote2a {
            txid: self.tg.txid,
            dc: self.tg.group,
            outcome: own_vote,
        }));
        self.gv_last_send = Some(Instant::now());
    }

    fn encoded_record(&self) -> Vec<Vec<u8>> {
        self.ops
            .iter()
            .map(|slot| slot.entry_bytes.clone().unwrap_or_default())
            .collect()
    }

    fn work_global_commit_vote(&mut self) {
        let Some(outcome) = self.voter.as_ref().and_then(GlobalVoter::outcome) else {
            return;
        };
        self.state = match outcome {
            VoteOutcome::Commit => TxState::Committed,
            VoteOutcome::Abort => TxState::Aborted,
        };
    }

    fn work_terminal(&mut self, effects: &mut Vec<TxEffect>) {
        let committed = self.state == TxState::Committed;
        let rc = if committed {
            ReturnCode::Committed
        } else {
            ReturnCode::Aborted
        };

        if !self.terminal_rc_sent {
            self.terminal_rc_sent = true;
            if let Some((to, nonce)) = self.commit_requester.take() {
                effects.push(TxEffect::ClientResponse {
                    to,
                    nonce,
                    rc,
                    timestamp: 0,
                    value: Vec::new(),
                });
            }
            // Ops the client never heard about answer with the terminal
            // outcome.
            for slot in &mut self.ops {
                if slot.responded {
                    continue;
                }
                if let Some((to, nonce)) = slot.client.take() {
                    slot.responded = true;
                    effects.push(TxEffect::ClientResponse {
                        to,
                        nonce,
                        rc: if committed { ReturnCode::Success } else { ReturnCode::Aborted },
                        timestamp: slot.read_timestamp,
                        value: slot.read_value.clone(),
                    });
                }
            }
        }

        if !self.locks_released {
            self.locks_released = true;
            for (index, slot) in self.ops.iter().enumerate() {
                if !slot.lock_taken {
                    continue;
                }
                if let Some(entry) = slot.entry.as_ref() {
                    let (table, key, kind) = match entry {
                        LogEntry::Read { table, key, .. } => (table, key, LockKind::Read),
                        LogEntry::Write { table, key, .. } => (table, key, LockKind::Write),
                        _ => continue,
                    };
                    effects.push(TxEffect::ReleaseLock {
                        seqno: index as u64,
                        table: table.clone(),
                        key: key.clone(),
                        kind,
                    });
                }
            }
        }

        if committed && self.is_leader() && !self.commit_record_sent {
            self.commit_record_sent = true;
            effects.push(TxEffect::Broadcast(Message::CommitRecord {
                tg: self.tg,
                entries: self.encoded_record(),
            }));
        }

        self.state = TxState::Terminated;
    }

    fn respond_durable_ops(&mut self, effects: &mut Vec<TxEffect>) {
        if self.state < TxState::Executing || self.state >= TxState::Committed {
            return;
        }
        for index in 0..self.ops.len() {
            if self.ops[index].responded || self.ops[index].client.is_none() {
                continue;
            }
            if !self.is_durable(index) {
                continue;
            }
            let is_read = matches!(self.ops[index].entry, Some(LogEntry::Read { .. }));
            if is_read && !self.ops[index].read_done {
                continue;
            }
            let slot = &mut self.ops[index];
            let Some((to, nonce)) = slot.client else {
                continue;
            };
            slot.responded = true;
            let (rc, timestamp, value) = if is_read {
                (slot.read_rc, slot.read_timestamp, slot.read_value.clone())
            } else {
                (ReturnCode::Success, 0, Vec::new())
            };
            effects.push(TxEffect::ClientResponse {
                to,
                nonce,
                rc,
                timestamp,
                value,
            });
        }
    }
}
