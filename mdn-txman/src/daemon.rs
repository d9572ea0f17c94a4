//! TxMan daemon composition and message dispatch.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use mdn_bus::{BusEvent, MessageBus};
use mdn_cluster::partition::choose_index;
use mdn_cluster::{ConfigHandle, Configuration, PaxosGroup};
use mdn_common::control::DaemonControl;
use mdn_common::error::ReturnCode;
use mdn_common::failures::FailureTracker;
use mdn_common::ids::{CommId, DataCenterId, PaxosGroupId, TransactionGroup, TransactionId};
use mdn_common::state_map::StateMap;
use mdn_wire::{LockAction, LockKind, Message};

use crate::transaction::{Transaction, TxEffect};

/// Tunables for one TxMan daemon.
#[derive(Debug, Clone, Copy)]
pub struct TxmanOptions {
    /// Worker receive timeout; doubles as the transaction tick.
    pub tick: Duration,
}

impl Default for TxmanOptions {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(100),
        }
    }
}

/// Why one KVS request was issued, so its response routes to the right
/// transaction callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KvPurpose {
    ExecRead,
    Lock,
    Unlock,
    Write,
    Verify,
}

#[derive(Debug, Clone, Copy)]
struct KvPending {
    tg: TransactionGroup,
    seqno: u64,
    purpose: KvPurpose,
    target: CommId,
}

#[derive(Debug, Clone, Copy)]
struct UnsafePending {
    client: CommId,
    client_nonce: u64,
    target: CommId,
}

/// One TxMan daemon instance.
pub struct TxmanDaemon {
    id: CommId,
    control: Arc<DaemonControl>,
    config: Arc<ConfigHandle>,
    bus: Arc<dyn MessageBus>,
    transactions: StateMap<TransactionGroup, Transaction>,
    txid_index: Mutex<HashMap<TransactionId, PaxosGroupId>>,
    pending_kv: Mutex<HashMap<u64, KvPending>>,
    pending_unsafe: Mutex<HashMap<u64, UnsafePending>>,
    failures: FailureTracker,
    next_nonce: AtomicU64,
    options: TxmanOptions,
}

impl TxmanDaemon {
    /// Composes a daemon from its collaborators.
    #[must_use]
    pub fn new(
        id: CommId,
        control: Arc<DaemonControl>,
        config: Arc<ConfigHandle>,
        bus: Arc<dyn MessageBus>,
        options: TxmanOptions,
    ) -> Self {
        Self {
            id,
            control,
            config,
            bus,
            transactions: StateMap::new(),
            txid_index: Mutex::new(HashMap::new()),
            pending_kv: Mutex::new(HashMap::new()),
            pending_unsafe: Mutex::new(HashMap::new()),
            failures: FailureTracker::new(),
            next_nonce: AtomicU64::new(1),
            options,
        }
    }

    /// This daemon's node id.
    #[must_use]
    pub fn id(&self) -> CommId {
        self.id
    }

    /// Number of live transaction replicas.
    #[must_use]
    pub fn transaction_count(&self) -> usize {
        self.transactions.len()
    }

    /// Blocking worker loop; returns on shutdown.
    pub fn worker_loop(&self) {
        loop {
            if self.control.shutdown_requested() {
                return;
            }
            if self.control.take_debug_dump() {
                self.debug_dump();
            }
            match self.bus.recv(self.options.tick) {
                BusEvent::Shutdown => return,
                BusEvent::Timeout => self.tick_transactions(Instant::now()),
                event => {
                    if !self.handle_event(event) {
                        return;
                    }
                }
            }
        }
    }

    /// Drains already-queued events without blocking. Returns the number
    /// of frames processed.
    pub fn pump(&self) -> usize {
        let mut processed = 0_usize;
        loop {
            match self.bus.recv(Duration::ZERO) {
                BusEvent::Timeout | BusEvent::Shutdown => return processed,
                event => {
                    processed += 1;
                    if !self.handle_event(event) {
                        return processed;
                    }
                }
            }
        }
    }

    /// Processes one bus event. Returns false when the worker should exit.
    pub fn handle_event(&self, event: BusEvent) -> bool {
        match event {
            BusEvent::Shutdown => false,
            BusEvent::Timeout => true,
            BusEvent::Disrupted { peer } => {
                log::debug!("connection to {peer} disrupted");
                self.note_peer_failure(peer);
                true
            }
            BusEvent::Message { from, payload } => {
                // Any frame from a peer proves it reachable again.
                self.failures.record_contact(from);
                match Message::decode(&payload) {
                    Ok(message) => self.dispatch(from, message),
                    Err(error) => log::warn!("dropping corrupt message from {from}: {error}"),
                }
                true
            }
        }
    }

    /// Records one peer-failure observation, from the bus or from the
    /// coordinator link, and fails every KVS request still waiting on that
    /// peer so the owning transactions drive toward abort instead of
    /// stalling.
    pub fn note_peer_failure(&self, peer: CommId) {
        self.failures.record_failure(peer);

        let failed_kv = {
            let mut pending = self.lock_pending_kv();
            let nonces = pending
                .iter()
                .filter(|(_, entry)| entry.target == peer)
                .map(|(nonce, _)| *nonce)
                .collect::<Vec<_>>();
            nonces
                .into_iter()
                .filter_map(|nonce| pending.remove(&nonce))
                .collect::<Vec<_>>()
        };
        for entry in failed_kv {
            self.route_kv_callback(entry, ReturnCode::Disrupted, 0, Vec::new());
        }

        let failed_unsafe = {
            let mut pending = self.lock_pending_unsafe();
            let nonces = pending
                .iter()
                .filter(|(_, entry)| entry.target == peer)
                .map(|(nonce, _)| *nonce)
                .collect::<Vec<_>>();
            nonces
                .into_iter()
                .filter_map(|nonce| pending.remove(&nonce))
                .collect::<Vec<_>>()
        };
        for entry in failed_unsafe {
            self.send(
                entry.client,
                &Message::ClientResponse {
                    nonce: entry.client_nonce,
                    rc: ReturnCode::Disrupted,
                    timestamp: 0,
                    value: Vec::new(),
                },
            );
        }
    }

    /// Runs one tick over every live transaction.
    pub fn tick_transactions(&self, now: Instant) {
        for tg in self.transactions.keys() {
            self.with_transaction(&tg, false, |tx, effects| tx.tick(now, effects));
        }
    }

    #[allow(clippy::too_many_lines)]
    fn dispatch(&self, from: CommId, message: Message) {
        match message {
            Message::Nop => {}
            Message::TxBegin {
                tg,
                nonce,
                timestamp,
                members,
                dcs,
            } => {
                self.index_txid(tg);
                self.with_transaction_or_members(&tg, Some(members), |tx, effects| {
                    tx.begin(from, nonce, timestamp, dcs, effects);
                });
            }
            Message::TxRead {
                tg,
                nonce,
                seqno,
                table,
                key,
            } => {
                self.with_transaction(&tg, true, |tx, effects| {
                    tx.read(from, nonce, seqno, table, key, effects);
                });
            }
            Message::TxWrite {
                tg,
                nonce,
                seqno,
                table,
                key,
                value,
            } => {
                self.with_transaction(&tg, true, |tx, effects| {
                    tx.write(from, nonce, seqno, table, key, value, effects);
                });
            }
            Message::TxCommit { tg, nonce, seqno } => {
                self.with_transaction(&tg, true, |tx, effects| {
                    tx.prepare(from, nonce, seqno, effects);
                });
            }
            Message::TxAbort { tg, nonce, seqno } => {
                self.with_transaction(&tg, true, |tx, effects| {
                    tx.abort_request(from, nonce, seqno, effects);
                });
            }
            Message::Paxos2a { tg, seqno, entry } => {
                self.index_txid(tg);
                self.with_transaction(&tg, true, |tx, effects| {
                    tx.paxos_2a(from, seqno, &entry, effects);
                });
            }
            Message::Paxos2b { tg, seqno } => {
                // Transactions come into being on begin/2a/commit-record
                // only; a 2b for an unknown transaction has nothing to ack.
                self.with_transaction(&tg, false, |tx, effects| {
                    tx.paxos_2b(from, seqno, effects);
                });
            }
            Message::LvVote1a { tg, ballot } => {
                self.with_transaction(&tg, false, |tx, effects| {
                    tx.lv_vote_1a(from, ballot, effects);
                });
            }
            Message::LvVote1b {
                tg,
                ballot,
                accepted_ballot,
                accepted,
            } => {
                self.with_transaction(&tg, false, |tx, effects| {
                    tx.lv_vote_1b(from, ballot, accepted_ballot, accepted, effects);
                });
            }
            Message::LvVote2a { tg, ballot, outcome } => {
                self.with_transaction(&tg, false, |tx, effects| {
                    tx.lv_vote_2a(from, ballot, outcome, effects);
                });
            }
            Message::LvVote2b { tg, ballot, outcome } => {
                self.with_transaction(&tg, false, |tx, effects| {
                    tx.lv_vote_2b(from, ballot, outcome, effects);
                });
            }
            Message::LvVoteLearn { tg, outcome } => {
                self.with_transaction(&tg, false, |tx, effects| {
                    tx.lv_vote_learn(outcome, effects);
                });
            }
            Message::CommitRecord { tg, entries } => {
                self.index_txid(tg);
                self.with_transaction(&tg, true, |tx, effects| {
                    tx.commit_record(&entries, effects);
                });
            }
            Message::GvPropose { txid, dcs, record } => {
                self.process_gv_propose(txid, &dcs, &record);
            }
            Message::GvVote1a { txid } => {
                if let Some(tg) = self.lookup_txid(txid) {
                    self.with_transaction(&tg, false, |tx, effects| {
                        tx.gv_vote_1a(from, effects);
                    });
                }
            }
            Message::GvVote1b { txid, votes } => {
                if let Some(tg) = self.lookup_txid(txid) {
                    self.with_transaction(&tg, false, |tx, effects| {
                        tx.gv_vote_1b(&votes, effects);
                    });
                }
            }
            Message::GvVote2a { txid, dc, outcome } => {
                if let Some(tg) = self.lookup_txid(txid) {
                    self.with_transaction(&tg, false, |tx, effects| {
                        tx.gv_vote_2a(from, dc, outcome, effects);
                    });
                }
            }
            Message::GvVote2b { .. } => {
                // A vote acknowledgment; retransmission stops once the
                // vote shows up in the voter state, so nothing to do.
            }
            Message::KvsRepReadResp {
                nonce,
                rc,
                timestamp,
                value,
            } => self.process_kv_read_resp(nonce, rc, timestamp, value),
            Message::KvsRepWriteResp { nonce, rc } => self.process_kv_write_resp(nonce, rc),
            Message::KvsLockOpResp { nonce, rc } => self.process_kv_lock_resp(nonce, rc),
            Message::UnsafeRead {
                nonce,
                table,
                key,
                timestamp,
            } => self.process_unsafe_read(from, nonce, &table, &key, timestamp),
            Message::UnsafeWrite {
                nonce,
                table,
                key,
                timestamp,
                value,
            } => self.process_unsafe_write(from, nonce, &table, &key, timestamp, &value),
            Message::UnsafeLockOp {
                nonce,
                table,
                key,
                txid,
                kind,
                action,
            } => self.process_unsafe_lock(from, nonce, &table, &key, txid, kind, action),
            other => {
                log::info!(
                    "received {:?} message which transaction managers do not process",
                    other.message_type()
                );
            }
        }
    }

    // ----- transaction plumbing -----

    fn group_for(&self, config: &Configuration, group: PaxosGroupId) -> Option<PaxosGroup> {
        config.paxos_group(group).cloned()
    }

    /// Members of `members` this daemon currently considers unreachable:
    /// peers with live failure observations plus members the configuration
    /// no longer reports in steady state.
    fn unreachable_members(&self, config: &Configuration, members: &[CommId]) -> Vec<CommId> {
        members
            .iter()
            .copied()
            .filter(|member| {
                self.failures.contains(*member) || !config.is_steady_state(*member)
            })
            .collect()
    }

    fn index_txid(&self, tg: TransactionGroup) {
        let _ = self
            .txid_index
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(tg.txid, tg.group);
    }

    fn lookup_txid(&self, txid: TransactionId) -> Option<TransactionGroup> {
        self.txid_index
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&txid)
            .map(|group| TransactionGroup::new(txid, *group))
    }

    fn drop_txid(&self, txid: TransactionId) {
        let _ = self
            .txid_index
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&txid);
    }

    fn with_transaction(
        &self,
        tg: &TransactionGroup,
        create: bool,
        f: impl FnOnce(&mut Transaction, &mut Vec<TxEffect>),
    ) {
        if create {
            self.with_transaction_or_members(tg, None, f);
        } else {
            let Some(state_ref) = self.transactions.get(tg) else {
                log::debug!("dropping message for unknown transaction {tg}");
                return;
            };
            let config = self.config.snapshot();
            let mut effects = Vec::new();
            let members = {
                let mut tx = state_ref.lock();
                let unreachable = self.unreachable_members(&config, tx.members());
                tx.note_unreachable(unreachable);
                f(&mut tx, &mut effects);
                tx.members().to_vec()
            };
            self.perform_effects(*tg, &members, effects, &state_ref);
        }
    }

    fn with_transaction_or_members(
        &self,
        tg: &TransactionGroup,
        fallback_members: Option<Vec<CommId>>,
        f: impl FnOnce(&mut Transaction, &mut Vec<TxEffect>),
    ) {
        let config = self.config.snapshot();
        let group = self.group_for(&config, tg.group).or_else(|| {
            fallback_members.map(|members| PaxosGroup {
                id: tg.group,
                dc: DataCenterId::default(),
                members,
            })
        });
        let Some(group) = group.filter(|group| !group.members.is_empty()) else {
            log::warn!("dropping message for {tg}: its group is not configured");
            return;
        };
        let state_ref = self
            .transactions
            .get_or_create(tg, || Transaction::new(*tg, self.id, group.clone()));
        let mut effects = Vec::new();
        let members = {
            let mut tx = state_ref.lock();
            let unreachable = self.unreachable_members(&config, tx.members());
            tx.note_unreachable(unreachable);
            f(&mut tx, &mut effects);
            tx.members().to_vec()
        };
        self.perform_effects(*tg, &members, effects, &state_ref);
    }

    fn perform_effects(
        &self,
        tg: TransactionGroup,
        members: &[CommId],
        effects: Vec<TxEffect>,
        state_ref: &mdn_common::state_map::StateRef<TransactionGroup, Transaction>,
    ) {
        let config = self.config.snapshot();
        let mut failed_kv: Vec<(u64, KvPurpose)> = Vec::new();

        for effect in effects {
            match effect {
                TxEffect::Broadcast(message) => {
                    for member in members {
                        if *member == self.id {
                            continue;
                        }
                        self.send(*member, &message);
                    }
                }
                TxEffect::SendTo(to, message) => self.send(to, &message),
                TxEffect::GvSend { dc, message } => {
                    let Some(group) = config.paxos_group(dc) else {
                        log::warn!("unknown group {dc}; global vote frame dropped");
                        continue;
                    };
                    let unreachable = self.unreachable_members(&config, &group.members);
                    let Some(leader) = group.leader(&unreachable) else {
                        log::warn!("no reachable leader for {dc}; global vote frame dropped");
                        continue;
                    };
                    self.send(leader, &message);
                }
                TxEffect::ClientResponse {
                    to,
                    nonce,
                    rc,
                    timestamp,
                    value,
                } => {
                    self.send(
                        to,
                        &Message::ClientResponse {
                            nonce,
                            rc,
                            timestamp,
                            value,
                        },
                    );
                }
                TxEffect::ExecRead {
                    seqno,
                    table,
                    key,
                    timestamp,
                } => {
                    if !self.issue_kv_read(&config, tg, seqno, KvPurpose::ExecRead, &table, &key, timestamp)
                    {
                        failed_kv.push((seqno, KvPurpose::ExecRead));
                    }
                }
                TxEffect::VerifyRead {
                    seqno,
                    table,
                    key,
                    timestamp,
                } => {
                    if !self.issue_kv_read(&config, tg, seqno, KvPurpose::Verify, &table, &key, timestamp)
                    {
                        failed_kv.push((seqno, KvPurpose::Verify));
                    }
                }
                TxEffect::CommitWrite {
                    seqno,
                    table,
                    key,
                    timestamp,
                    value,
                } => {
                    if !self.issue_kv_write(&config, tg, seqno, &table, &key, timestamp, &value) {
                        failed_kv.push((seqno, KvPurpose::Write));
                    }
                }
                TxEffect::AcquireLock {
                    seqno,
                    table,
                    key,
                    kind,
                } => {
                    if !self.issue_kv_lock(
                        &config,
                        tg,
                        seqno,
                        KvPurpose::Lock,
                        &table,
                        &key,
                        kind,
                        LockAction::Acquire,
                    ) {
                        failed_kv.push((seqno, KvPurpose::Lock));
                    }
                }
                TxEffect::ReleaseLock {
                    seqno,
                    table,
                    key,
                    kind,
                } => {
                    if !self.issue_kv_lock(
                        &config,
                        tg,
                        seqno,
                        KvPurpose::Unlock,
                        &table,
                        &key,
                        kind,
                        LockAction::Release,
                    ) {
                        log::debug!("{tg}: lock release for slot {seqno} had no reachable owner");
                    }
                }
                TxEffect::Collected => {
                    state_ref.terminate();
                    self.drop_txid(tg.txid);
                }
            }
        }

        // KV requests that could not even be issued complete immediately
        // with a transport failure, driving the transaction toward abort.
        for (seqno, purpose) in failed_kv {
            self.route_kv_callback(
                KvPending {
                    tg,
                    seqno,
                    purpose,
                    target: CommId::default(),
                },
                ReturnCode::Disrupted,
                0,
                Vec::new(),
            );
        }
    }

    fn local_dc(&self, config: &Configuration) -> Option<DataCenterId> {
        config.get_data_center(self.id)
    }

    fn kvs_owner(&self, config: &Configuration, table: &[u8], key: &[u8]) -> Option<CommId> {
        let dc = self.local_dc(config)?;
        let (owner1, _) = config.map(dc, choose_index(table, key))?;
        if owner1 == CommId::default() {
            return None;
        }
        Some(owner1)
    }

    fn allocate_nonce(&self) -> u64 {
        self.next_nonce.fetch_add(1, Ordering::AcqRel)
    }

    #[allow(clippy::too_many_arguments)]
    fn issue_kv_read(
        &self,
        config: &Configuration,
        tg: TransactionGroup,
        seqno: u64,
        purpose: KvPurpose,
        table: &[u8],
        key: &[u8],
        timestamp: u64,
    ) -> bool {
        let Some(owner) = self.kvs_owner(config, table, key) else {
            return false;
        };
        let nonce = self.allocate_nonce();
        let _ = self.lock_pending_kv().insert(
            nonce,
            KvPending {
                tg,
                seqno,
                purpose,
                target: owner,
            },
        );
        self.send(
            owner,
            &Message::KvsRepRead {
                nonce,
                table: table.to_vec(),
                key: key.to_vec(),
                timestamp,
            },
        );
        true
    }

    #[allow(clippy::too_many_arguments)]
    fn issue_kv_write(
        &self,
        config: &Configuration,
        tg: TransactionGroup,
        seqno: u64,
        table: &[u8],
        key: &[u8],
        timestamp: u64,
        value: &[u8],
    ) -> bool {
        let Some(owner) = self.kvs_owner(config, table, key) else {
            return false;
        };
        let nonce = self.allocate_nonce();
        let _ = self.lock_pending_kv().insert(
            nonce,
            KvPending {
                tg,
                seqno,
                purpose: KvPurpose::Write,
                target: owner,
            },
        );
        self.send(
            owner,
            &Message::KvsRepWrite {
                nonce,
                flags: 0,
                table: table.to_vec(),
                key: key.to_vec(),
                timestamp,
                value: value.to_vec(),
            },
        );
        true
    }

    #[allow(clippy::too_many_arguments)]
    fn issue_kv_lock(
        &self,
        config: &Configuration,
        tg: TransactionGroup,
        seqno: u64,
        purpose: KvPurpose,
        table: &[u8],
        key: &[u8],
        kind: LockKind,
        action: LockAction,
    ) -> bool {
        let Some(owner) = self.kvs_owner(config, table, key) else {
            return false;
        };
        let nonce = self.allocate_nonce();
        let _ = self.lock_pending_kv().insert(
            nonce,
            KvPending {
                tg,
                seqno,
                purpose,
                target: owner,
            },
        );
        self.send(
            owner,
            &Message::KvsLockOp {
                nonce,
                table: table.to_vec(),
                key: key.to_vec(),
                txid: tg.txid,
                kind,
                action,
            },
        );
        true
    }

    fn lock_pending_kv(&self) -> MutexGuard<'_, HashMap<u64, KvPending>> {
        self.pending_kv
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_pending_unsafe(&self) -> MutexGuard<'_, HashMap<u64, UnsafePending>> {
        self.pending_unsafe
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn process_kv_read_resp(&self, nonce: u64, rc: ReturnCode, timestamp: u64, value: Vec<u8>) {
        if let Some(pending) = self.lock_pending_kv().remove(&nonce) {
            self.route_kv_callback(pending, rc, timestamp, value);
            return;
        }
        if let Some(pending) = self.lock_pending_unsafe().remove(&nonce) {
            self.send(
                pending.client,
                &Message::ClientResponse {
                    nonce: pending.client_nonce,
                    rc,
                    timestamp,
                    value,
                },
            );
            return;
        }
        log::debug!("dropped kvs read response nonce={nonce}");
    }

    fn process_kv_write_resp(&self, nonce: u64, rc: ReturnCode) {
        if let Some(pending) = self.lock_pending_kv().remove(&nonce) {
            self.route_kv_callback(pending, rc, 0, Vec::new());
            return;
        }
        if let Some(pending) = self.lock_pending_unsafe().remove(&nonce) {
            self.send(
                pending.client,
                &Message::ClientResponse {
                    nonce: pending.client_nonce,
                    rc,
                    timestamp: 0,
                    value: Vec::new(),
                },
            );
            return;
        }
        log::debug!("dropped kvs write response nonce={nonce}");
    }

    fn process_kv_lock_resp(&self, nonce: u64, rc: ReturnCode) {
        if let Some(pending) = self.lock_pending_kv().remove(&nonce) {
            self.route_kv_callback(pending, rc, 0, Vec::new());
            return;
        }
        if let Some(pending) = self.lock_pending_unsafe().remove(&nonce) {
            self.send(
                pending.client,
                &Message::ClientResponse {
                    nonce: pending.client_nonce,
                    rc,
                    timestamp: 0,
                    value: Vec::new(),
                },
            );
            return;
        }
        log::debug!("dropped kvs lock response nonce={nonce}");
    }

    fn route_kv_callback(&self, pending: KvPending, rc: ReturnCode, timestamp: u64, value: Vec<u8>) {
        self.with_transaction(&pending.tg, false, |tx, effects| match pending.purpose {
            KvPurpose::ExecRead => tx.callback_read(pending.seqno, rc, timestamp, value, effects),
            KvPurpose::Verify => tx.callback_verify(pending.seqno, rc, timestamp, value, effects),
            KvPurpose::Lock => tx.callback_locked(pending.seqno, rc, effects),
            KvPurpose::Unlock => tx.callback_unlocked(pending.seqno, rc, effects),
            KvPurpose::Write => tx.callback_write(pending.seqno, rc, effects),
        });
    }

    // ----- unsafe (non-transactional) client ops -----

    fn process_unsafe_read(
        &self,
        from: CommId,
        client_nonce: u64,
        table: &[u8],
        key: &[u8],
        timestamp: u64,
    ) {
        let config = self.config.snapshot();
        let Some(owner) = self.kvs_owner(&config, table, key) else {
            self.respond_unsafe_failure(from, client_nonce);
            return;
        };
        let nonce = self.allocate_nonce();
        let _ = self.lock_pending_unsafe().insert(
            nonce,
            UnsafePending {
                client: from,
                client_nonce,
                target: owner,
            },
        );
        self.send(
            owner,
            &Message::KvsRepRead {
                nonce,
                table: table.to_vec(),
                key: key.to_vec(),
                timestamp,
            },
        );
    }

    #[allow(clippy::too_many_arguments)]
    fn process_unsafe_write(
        &self,
        from: CommId,
        client_nonce: u64,
        table: &[u8],
        key: &[u8],
        timestamp: u64,
        value: &[u8],
    ) {
        let config = self.config.snapshot();
        let Some(owner) = self.kvs_owner(&config, table, key) else {
            self.respond_unsafe_failure(from, client_nonce);
            return;
        };
        let nonce = self.allocate_nonce();
        let _ = self.lock_pending_unsafe().insert(
            nonce,
            UnsafePending {
                client: from,
                client_nonce,
                target: owner,
            },
        );
        self.send(
            owner,
            &Message::KvsRepWrite {
                nonce,
                flags: 0,
                table: table.to_vec(),
                key: key.to_vec(),
                timestamp,
                value: value.to_vec(),
            },
        );
    }

    #[allow(clippy::too_many_arguments)]
    fn process_unsafe_lock(
        &self,
        from: CommId,
        client_nonce: u64,
        table: &[u8],
        key: &[u8],
        txid: TransactionId,
        kind: LockKind,
        action: LockAction,
    ) {
        let config = self.config.snapshot();
        let Some(owner) = self.kvs_owner(&config, table, key) else {
            self.respond_unsafe_failure(from, client_nonce);
            return;
        };
        let nonce = self.allocate_nonce();
        let _ = self.lock_pending_unsafe().insert(
            nonce,
            UnsafePending {
                client: from,
                client_nonce,
                target: owner,
            },
        );
        self.send(
            owner,
            &Message::KvsLockOp {
                nonce,
                table: table.to_vec(),
                key: key.to_vec(),
                txid,
                kind,
                action,
            },
        );
    }

    fn respond_unsafe_failure(&self, to: CommId, nonce: u64) {
        self.send(
            to,
            &Message::ClientResponse {
                nonce,
                rc: ReturnCode::Disrupted,
                timestamp: 0,
                value: Vec::new(),
            },
        );
    }

    // ----- cross-dc -----

    fn process_gv_propose(&self, txid: TransactionId, dcs: &[PaxosGroupId], record: &[Vec<u8>]) {
        let config = self.config.snapshot();
        // Find the participating group in this datacenter that includes
        // this node; its leader hosts the remote replica.
        let Some(group) = dcs.iter().find(|dc| {
            config
                .paxos_group(**dc)
                .is_some_and(|group| group.contains(self.id))
        }) else {
            log::warn!("global-vote proposal for {txid} names no group with this node");
            return;
        };
        let tg = TransactionGroup::new(txid, *group);
        self.index_txid(tg);
        self.with_transaction(&tg, true, |tx, effects| {
            tx.adopt_proposal(record, effects);
        });
    }

    fn send(&self, to: CommId, message: &Message) {
        let payload = match message.encode() {
            Ok(payload) => payload,
            Err(error) => {
                log::error!("failed to encode outgoing message: {error}");
                return;
            }
        };
        if let Err(error) = self.bus.send(to, payload) {
            log::debug!("send to {to} failed: {error}");
            self.failures.record_failure(to);
        }
    }

    fn debug_dump(&self) {
        let config = self.config.snapshot();
        log::info!("=== begin debug dump of txman {} ===", self.id);
        for line in config.dump().lines() {
            log::info!("{line}");
        }
        log::info!(
            "transactions={} pending_kv={} pending_unsafe={} failed_peers={}",
            self.transactions.len(),
            self.lock_pending_kv().len(),
            self.lock_pending_unsafe().len(),
            self.failures.len()
        );
        log::info!("===  end debug dump of txman {}  ===", self.id);
    }
}
