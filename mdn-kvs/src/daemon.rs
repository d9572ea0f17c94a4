//! KVS daemon composition and message dispatch.

use std::sync::Arc;
use std::time::Duration;

use mdn_bus::{BusEvent, MessageBus};
use mdn_cluster::partition::choose_index;
use mdn_cluster::{ConfigHandle, Configuration};
use mdn_common::control::DaemonControl;
use mdn_common::error::ReturnCode;
use mdn_common::ids::{CommId, DataCenterId, PartitionId, TransactionId, VersionId};
use mdn_common::state_map::StateMap;
use mdn_storage::DataLayer;
use mdn_wire::{LockAction, LockKind, Message, WRITE_TOMBSTONE};
use rand::RngCore;

use crate::lock_replicator::{LockReplicator, LockStep};
use crate::lock_table::LockTable;
use crate::migrator::Migrator;
use crate::read_replicator::{RawReadAnswer, ReadReplicator, ReadStep};
use crate::write_replicator::{RawWriteAnswer, WriteReplicator, WriteStep};

/// Tunables for one KVS daemon.
#[derive(Debug, Clone, Copy)]
pub struct KvsOptions {
    /// Worker receive timeout; doubles as the idle tick.
    pub tick: Duration,
}

impl Default for KvsOptions {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(100),
        }
    }
}

/// One KVS daemon instance.
pub struct KvsDaemon {
    id: CommId,
    control: Arc<DaemonControl>,
    config: Arc<ConfigHandle>,
    bus: Arc<dyn MessageBus>,
    data: Arc<dyn DataLayer>,
    locks: LockTable,
    read_replicators: StateMap<u64, ReadReplicator>,
    write_replicators: StateMap<u64, WriteReplicator>,
    lock_replicators: StateMap<u64, LockReplicator>,
    migrations: StateMap<PartitionId, Migrator>,
    options: KvsOptions,
}

impl KvsDaemon {
    /// Composes a daemon from its collaborators.
    #[must_use]
    pub fn new(
        id: CommId,
        control: Arc<DaemonControl>,
        config: Arc<ConfigHandle>,
        bus: Arc<dyn MessageBus>,
        data: Arc<dyn DataLayer>,
        options: KvsOptions,
    ) -> Self {
        Self {
            id,
            control,
            config,
            bus,
            data,
            locks: LockTable::new(),
            read_replicators: StateMap::new(),
            write_replicators: StateMap::new(),
            lock_replicators: StateMap::new(),
            migrations: StateMap::new(),
            options,
        }
    }

    /// This daemon's node id.
    #[must_use]
    pub fn id(&self) -> CommId {
        self.id
    }

    /// The local lock table (exposed for tests and the debug dump).
    #[must_use]
    pub fn locks(&self) -> &LockTable {
        &self.locks
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
            if !self.handle_event(self.bus.recv(self.options.tick)) {
                return;
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
                match Message::decode(&payload) {
                    Ok(message) => self.dispatch(from, message),
                    Err(error) => log::warn!("dropping corrupt message from {from}: {error}"),
                }
                true
            }
        }
    }

    /// Records one peer-failure observation, from the bus or from the
    /// coordinator link. Every replicator still waiting on the peer is fed
    /// a transport failure so quorum ops re-fan or answer instead of
    /// stalling; no per-RPC timer exists to do it for them.
    pub fn note_peer_failure(&self, peer: CommId) {
        for nonce in self.read_replicators.keys() {
            self.feed_read_answer(
                nonce,
                peer,
                RawReadAnswer {
                    rc: ReturnCode::Disrupted,
                    timestamp: 0,
                    value: Vec::new(),
                    owner: CommId::default(),
                },
            );
        }
        for nonce in self.write_replicators.keys() {
            self.feed_write_answer(
                nonce,
                peer,
                RawWriteAnswer {
                    rc: ReturnCode::Disrupted,
                    owner1: CommId::default(),
                    owner2: CommId::default(),
                },
            );
        }
        for nonce in self.lock_replicators.keys() {
            self.feed_lock_answer(nonce, peer, ReturnCode::Disrupted);
        }
    }

    fn dispatch(&self, from: CommId, message: Message) {
        match message {
            Message::Nop => {}
            Message::KvsRepRead {
                nonce,
                table,
                key,
                timestamp,
            } => self.process_rep_rd(from, nonce, table, key, timestamp),
            Message::KvsRepWrite {
                nonce,
                flags,
                table,
                key,
                timestamp,
                value,
            } => self.process_rep_wr(from, nonce, flags, table, key, timestamp, value),
            Message::KvsRawRead {
                nonce,
                table,
                key,
                timestamp,
            } => self.process_raw_rd(from, nonce, &table, &key, timestamp),
            Message::KvsRawReadResp {
                nonce,
                rc,
                timestamp,
                value,
                owner,
            } => self.process_raw_rd_resp(from, nonce, rc, timestamp, value, owner),
            Message::KvsRawWrite {
                nonce,
                flags,
                table,
                key,
                timestamp,
                value,
            } => self.process_raw_wr(from, nonce, flags, &table, &key, timestamp, &value),
            Message::KvsRawWriteResp {
                nonce,
                rc,
                owner1,
                owner2,
            } => self.process_raw_wr_resp(from, nonce, rc, owner1, owner2),
            Message::KvsLockOp {
                nonce,
                table,
                key,
                txid,
                kind,
                action,
            } => self.process_lock_op(from, nonce, table, key, txid, kind, action),
            Message::KvsLockOpResp { nonce, rc } => self.process_lock_op_resp(from, nonce, rc),
            Message::KvsMigrateSyn { partition, version } => {
                self.process_migrate_syn(from, partition, version);
            }
            Message::KvsMigrateAck { partition, version } => {
                self.process_migrate_ack(from, partition, version);
            }
            other => {
                log::info!(
                    "received {:?} message which key-value stores do not process",
                    other.message_type()
                );
            }
        }
    }

    fn local_dc(&self, config: &Configuration) -> Option<DataCenterId> {
        config.get_data_center(self.id)
    }

    fn generate_id(&self) -> u64 {
        rand::thread_rng().next_u64()
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
        }
    }

    fn replica_set(&self, table: &[u8], key: &[u8]) -> Option<Vec<CommId>> {
        let config = self.config.snapshot();
        let dc = self.local_dc(&config)?;
        let index = choose_index(table, key);
        let replicas = config.hash(dc, index)?;
        if replicas.is_empty() {
            return None;
        }
        Some(replicas.to_vec())
    }

    fn process_rep_rd(&self, from: CommId, nonce: u64, table: Vec<u8>, key: Vec<u8>, timestamp: u64) {
        if self.control.debug_mode() {
            log::info!(
                "replicated read({}, {})",
                String::from_utf8_lossy(&table),
                String::from_utf8_lossy(&key)
            );
        }
        let Some(replicas) = self.replica_set(&table, &key) else {
            log::warn!("dropping replicated read for an unmapped partition");
            return;
        };

        loop {
            let rid = self.generate_id();
            let replicator =
                ReadReplicator::new(from, nonce, table.clone(), key.clone(), timestamp, &replicas);
            let Some(state_ref) = self.read_replicators.create(&rid, replicator) else {
                continue;
            };
            let targets = state_ref.lock().targets();
            for target in targets {
                self.send(
                    target,
                    &Message::KvsRawRead {
                        nonce: rid,
                        table: table.clone(),
                        key: key.clone(),
                        timestamp,
                    },
                );
            }
            return;
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn process_rep_wr(
        &self,
        from: CommId,
        nonce: u64,
        flags: u8,
        table: Vec<u8>,
        key: Vec<u8>,
        timestamp: u64,
        value: Vec<u8>,
    ) {
        if self.control.debug_mode() {
            log::info!(
                "replicated write({}, {}@{timestamp})",
                String::from_utf8_lossy(&table),
                String::from_utf8_lossy(&key)
            );
        }
        let Some(replicas) = self.replica_set(&table, &key) else {
            log::warn!("dropping replicated write for an unmapped partition");
            return;
        };

        loop {
            let rid = self.generate_id();
            let replicator = WriteReplicator::new(
                from,
                nonce,
                flags,
                table.clone(),
                key.clone(),
                timestamp,
                value.clone(),
                &replicas,
            );
            let Some(state_ref) = self.write_replicators.create(&rid, replicator) else {
                continue;
            };
            let targets = state_ref.lock().targets();
            for target in targets {
                self.send(
                    target,
                    &Message::KvsRawWrite {
                        nonce: rid,
                        flags,
                        table: table.clone(),
                        key: key.clone(),
                        timestamp,
                        value: value.clone(),
                    },
                );
            }
            return;
        }
    }

    fn process_raw_rd(&self, from: CommId, nonce: u64, table: &[u8], key: &[u8], timestamp: u64) {
        let outcome = self.data.get(table, key, timestamp);
        let config = self.config.snapshot();
        let owner = self
            .local_dc(&config)
            .and_then(|dc| config.map(dc, choose_index(table, key)))
            .map_or_else(CommId::default, |(owner1, _)| owner1);
        self.send(
            from,
            &Message::KvsRawReadResp {
                nonce,
                rc: outcome.rc,
                timestamp: outcome.timestamp,
                value: outcome.value,
                owner,
            },
        );
    }

    fn process_raw_rd_resp(
        &self,
        from: CommId,
        nonce: u64,
        rc: ReturnCode,
        timestamp: u64,
        value: Vec<u8>,
        owner: CommId,
    ) {
        if self.read_replicators.get(&nonce).is_none() {
            log::debug!("dropped raw read response nonce={nonce} from {from}");
            return;
        }
        self.feed_read_answer(
            nonce,
            from,
            RawReadAnswer {
                rc,
                timestamp,
                value,
                owner,
            },
        );
    }

    fn feed_read_answer(&self, nonce: u64, from: CommId, answer: RawReadAnswer) {
        let Some(state_ref) = self.read_replicators.get(&nonce) else {
            return;
        };
        let mut replicator = state_ref.lock();
        let step = replicator.record(from, answer);
        match step {
            ReadStep::Wait => {}
            ReadStep::Resend(targets) => {
                let table = replicator.table().to_vec();
                let key = replicator.key().to_vec();
                let bound = replicator.timestamp();
                drop(replicator);
                for target in targets {
                    self.send(
                        target,
                        &Message::KvsRawRead {
                            nonce,
                            table: table.clone(),
                            key: key.clone(),
                            timestamp: bound,
                        },
                    );
                }
            }
            ReadStep::Respond {
                rc,
                timestamp,
                value,
            } => {
                let caller = replicator.caller();
                let client_nonce = replicator.client_nonce();
                drop(replicator);
                self.send(
                    caller,
                    &Message::KvsRepReadResp {
                        nonce: client_nonce,
                        rc,
                        timestamp,
                        value,
                    },
                );
                state_ref.terminate();
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn process_raw_wr(
        &self,
        from: CommId,
        nonce: u64,
        flags: u8,
        table: &[u8],
        key: &[u8],
        timestamp: u64,
        value: &[u8],
    ) {
        let rc = if flags & WRITE_TOMBSTONE != 0 {
            self.data.del(table, key, timestamp)
        } else {
            self.data.put(table, key, timestamp, value)
        };
        let config = self.config.snapshot();
        let (owner1, owner2) = self
            .local_dc(&config)
            .and_then(|dc| config.map(dc, choose_index(table, key)))
            .unwrap_or_default();
        self.send(
            from,
            &Message::KvsRawWriteResp {
                nonce,
                rc,
                owner1,
                owner2,
            },
        );
    }

    fn process_raw_wr_resp(
        &self,
        from: CommId,
        nonce: u64,
        rc: ReturnCode,
        owner1: CommId,
        owner2: CommId,
    ) {
        if self.write_replicators.get(&nonce).is_none() {
            // Migration streams reuse raw writes with unregistered nonces.
            log::debug!("dropped raw write response nonce={nonce} from {from}");
            return;
        }
        self.feed_write_answer(nonce, from, RawWriteAnswer { rc, owner1, owner2 });
    }

    fn feed_write_answer(&self, nonce: u64, from: CommId, answer: RawWriteAnswer) {
        let Some(state_ref) = self.write_replicators.get(&nonce) else {
            return;
        };
        let mut replicator = state_ref.lock();
        let refresh_table = replicator.table().to_vec();
        let refresh_key = replicator.key().to_vec();
        let step = replicator.record(from, answer, || {
            self.replica_set(&refresh_table, &refresh_key)
                .unwrap_or_default()
        });
        match step {
            WriteStep::Wait => {}
            WriteStep::Refan(targets) => {
                let flags = replicator.flags();
                let table = replicator.table().to_vec();
                let key = replicator.key().to_vec();
                let timestamp = replicator.timestamp();
                let value = replicator.value().to_vec();
                drop(replicator);
                for target in targets {
                    self.send(
                        target,
                        &Message::KvsRawWrite {
                            nonce,
                            flags,
                            table: table.clone(),
                            key: key.clone(),
                            timestamp,
                            value: value.clone(),
                        },
                    );
                }
            }
            WriteStep::Respond { rc } => {
                let caller = replicator.caller();
                let client_nonce = replicator.client_nonce();
                drop(replicator);
                self.send(
                    caller,
                    &Message::KvsRepWriteResp {
                        nonce: client_nonce,
                        rc,
                    },
                );
                state_ref.terminate();
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn process_lock_op(
        &self,
        from: CommId,
        nonce: u64,
        table: Vec<u8>,
        key: Vec<u8>,
        txid: TransactionId,
        kind: LockKind,
        action: LockAction,
    ) {
        let Some(replicas) = self.replica_set(&table, &key) else {
            log::warn!("dropping lock op for an unmapped partition");
            return;
        };

        if replicas.contains(&from) {
            // Peer leg: a fellow replica coordinates this op; apply the CAS
            // locally and answer.
            let rc = match action {
                LockAction::Acquire => self.locks.acquire(&table, &key, txid),
                LockAction::Release => self.locks.release(&table, &key, txid),
            };
            if self.control.debug_mode() {
                log::info!(
                    "{kind:?} {action:?}({}, {}) by {txid} -> {rc}",
                    String::from_utf8_lossy(&table),
                    String::from_utf8_lossy(&key)
                );
            }
            self.send(from, &Message::KvsLockOpResp { nonce, rc });
            return;
        }

        // Coordinator leg: fan the CAS out to every replica, ourselves
        // included.
        loop {
            let rid = self.generate_id();
            let replicator = LockReplicator::new(
                from,
                nonce,
                table.clone(),
                key.clone(),
                txid,
                kind,
                action,
                &replicas,
            );
            let Some(state_ref) = self.lock_replicators.create(&rid, replicator) else {
                continue;
            };
            let targets = state_ref.lock().targets();
            for target in targets {
                self.send(
                    target,
                    &Message::KvsLockOp {
                        nonce: rid,
                        table: table.clone(),
                        key: key.clone(),
                        txid,
                        kind,
                        action,
                    },
                );
            }
            return;
        }
    }

    fn process_lock_op_resp(&self, from: CommId, nonce: u64, rc: ReturnCode) {
        if self.lock_replicators.get(&nonce).is_none() {
            log::debug!("dropped lock op response nonce={nonce} from {from}");
            return;
        }
        self.feed_lock_answer(nonce, from, rc);
    }

    fn feed_lock_answer(&self, nonce: u64, from: CommId, rc: ReturnCode) {
        let Some(state_ref) = self.lock_replicators.get(&nonce) else {
            return;
        };
        let mut replicator = state_ref.lock();
        match replicator.record(from, rc) {
            LockStep::Wait => {}
            LockStep::Respond { rc } => {
                let caller = replicator.caller();
                let client_nonce = replicator.client_nonce();
                drop(replicator);
                self.send(
                    caller,
                    &Message::KvsLockOpResp {
                        nonce: client_nonce,
                        rc,
                    },
                );
                state_ref.terminate();
            }
        }
    }

    fn process_migrate_syn(
        &self,
        from: CommId,
        partition: PartitionId,
        version: VersionId,
    ) {
        let config = self.config.snapshot();
        if config.version() >= version {
            if self.control.debug_mode() {
                log::info!("received migration SYN for {partition}/{version}");
            }
            self.send(
                from,
                &Message::KvsMigrateAck {
                    partition,
                    version: config.version(),
                },
            );
        } else if self.control.debug_mode() {
            log::info!("dropping migration SYN for {partition}/{version}");
        }
    }

    fn process_migrate_ack(
        &self,
        from: CommId,
        partition: PartitionId,
        version: VersionId,
    ) {
        let Some(state_ref) = self.migrations.get(&partition) else {
            return;
        };
        let mut migrator = state_ref.lock();
        migrator.ack(from, version);
        self.drive_migrator(&mut migrator);
        if migrator.is_terminated() {
            drop(migrator);
            state_ref.terminate();
        }
    }

    /// Runs one migration pass: creates or refreshes migrators for every
    /// partition this node must hand off, and terminates migrators whose
    /// partition left the migratable set.
    pub fn step_migrations(&self) {
        let config = self.config.snapshot();
        let Some(dc) = self.local_dc(&config) else {
            return;
        };
        let parts = config.migratable_partitions(self.id);

        for part in &parts {
            let Some(record) = config.partition(dc, *part) else {
                continue;
            };
            let incoming = record.incoming.clone();
            let state_ref = self
                .migrations
                .get_or_create(part, || Migrator::new(*part, config.version(), &incoming));
            let mut migrator = state_ref.lock();
            migrator.refresh(config.version(), &incoming);
            self.drive_migrator(&mut migrator);
            if migrator.is_terminated() {
                drop(migrator);
                state_ref.terminate();
            }
        }

        for key in self.migrations.keys() {
            if parts.contains(&key) {
                continue;
            }
            if let Some(state_ref) = self.migrations.get(&key) {
                state_ref.lock().terminate();
                state_ref.terminate();
            }
        }
    }

    fn drive_migrator(&self, migrator: &mut Migrator) {
        if migrator.is_terminated() {
            return;
        }
        let actions = migrator.step();
        for dest in actions.syn {
            self.send(
                dest,
                &Message::KvsMigrateSyn {
                    partition: migrator.partition(),
                    version: migrator.target_version(),
                },
            );
        }
        for dest in actions.stream {
            self.stream_partition(dest, migrator.partition());
            migrator.mark_streamed(dest);
        }
        if migrator.step().done {
            migrator.terminate();
        }
    }

    fn stream_partition(&self, dest: CommId, partition: PartitionId) {
        let config = self.config.snapshot();
        let Some(dc) = self.local_dc(&config) else {
            return;
        };
        let Some(record) = config.partition(dc, partition) else {
            return;
        };
        let index = record.index;

        let mut streamed = 0_usize;
        for row in self.data.rows() {
            if choose_index(&row.table, &row.key) != index {
                continue;
            }
            let (flags, value) = match row.value {
                Some(value) => (0, value),
                None => (WRITE_TOMBSTONE, Vec::new()),
            };
            self.send(
                dest,
                &Message::KvsRawWrite {
                    nonce: self.generate_id(),
                    flags,
                    table: row.table,
                    key: row.key,
                    timestamp: row.timestamp,
                    value,
                },
            );
            streamed += 1;
        }
        log::info!("streamed {streamed} versions of {partition} to {dest}");
    }

    fn debug_dump(&self) {
        let config = self.config.snapshot();
        log::info!("=== begin debug dump of kvs {} ===", self.id);
        for line in config.dump().lines() {
            log::info!("{line}");
        }
        log::info!(
            "read_replicators={} write_replicators={} lock_replicators={} migrations={} locks={}",
            self.read_replicators.len(),
            self.write_replicators.len(),
            self.lock_replicators.len(),
            self.migrations.len(),
            self.locks.len()
        );
        log::info!("===  end debug dump of kvs {}  ===", self.id);
    }
}
