//! Full-stack client scenarios: real daemons on worker threads, a real
//! client blocking on responses.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use googletest::prelude::*;
use mdn_bus::{LoopbackNetwork, MessageBus};
use mdn_cluster::config::{MemberKind, MemberRecord, NodeState, PartitionRecord, PaxosGroup};
use mdn_cluster::{ConfigHandle, Configuration};
use mdn_common::control::DaemonControl;
use mdn_common::error::ReturnCode;
use mdn_common::ids::{
    CommId, DataCenterId, PartitionId, PaxosGroupId, TransactionId, VersionId,
};
use mdn_kvs::{KvsDaemon, KvsOptions};
use mdn_storage::{DataLayer, MemoryDataLayer};
use mdn_txman::{TxmanDaemon, TxmanOptions};
use mdn_wire::{LockAction, LockKind};
use rstest::rstest;

use crate::{Client, ClientOptions};

const TXMAN: CommId = CommId::new(1);
const KVS: CommId = CommId::new(11);
const CLIENT: CommId = CommId::new(100);
const GROUP: PaxosGroupId = PaxosGroupId::new(10);
const KEY_INDEX: u16 = 0x6b00;

struct RunningCluster {
    network: LoopbackNetwork,
    controls: Vec<Arc<DaemonControl>>,
    workers: Vec<JoinHandle<()>>,
}

impl RunningCluster {
    fn shutdown(&mut self) {
        for control in &self.controls {
            control.request_shutdown();
        }
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

impl Drop for RunningCluster {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn test_config() -> Arc<Configuration> {
    Arc::new(
        Configuration::new(
            VersionId::new(1),
            vec![
                MemberRecord {
                    id: TXMAN,
                    dc: DataCenterId::new(1),
                    kind: MemberKind::TxMan,
                    state: NodeState::Online,
                    address: "127.0.0.1:24001".to_owned(),
                },
                MemberRecord {
                    id: KVS,
                    dc: DataCenterId::new(1),
                    kind: MemberKind::Kvs,
                    state: NodeState::Online,
                    address: "127.0.0.1:24011".to_owned(),
                },
            ],
            vec![PaxosGroup {
                id: GROUP,
                dc: DataCenterId::new(1),
                members: vec![TXMAN],
            }],
            vec![PartitionRecord {
                id: PartitionId::new(1),
                dc: DataCenterId::new(1),
                index: KEY_INDEX,
                replicas: vec![KVS],
                incoming: Vec::new(),
            }],
        )
        .expect("test config must be valid"),
    )
}

fn start_cluster() -> RunningCluster {
    let network = LoopbackNetwork::new();
    let config = test_config();
    let mut controls = Vec::new();
    let mut workers = Vec::new();

    let txman_control = DaemonControl::new();
    let txman_handle = Arc::new(ConfigHandle::new());
    assert_that!(txman_handle.install(Arc::clone(&config)), eq(true));
    let txman_bus = Arc::new(network.register(TXMAN));
    let txman = Arc::new(TxmanDaemon::new(
        TXMAN,
        Arc::clone(&txman_control),
        txman_handle,
        txman_bus as Arc<dyn MessageBus>,
        TxmanOptions {
            tick: Duration::from_millis(20),
        },
    ));
    controls.push(txman_control);
    workers.push(
        std::thread::Builder::new()
            .name("test-txman".to_owned())
            .spawn(move || txman.worker_loop())
            .expect("worker must spawn"),
    );

    let kvs_control = DaemonControl::new();
    let kvs_handle = Arc::new(ConfigHandle::new());
    assert_that!(kvs_handle.install(Arc::clone(&config)), eq(true));
    let kvs_bus = Arc::new(network.register(KVS));
    let kvs = Arc::new(KvsDaemon::new(
        KVS,
        Arc::clone(&kvs_control),
        kvs_handle,
        kvs_bus as Arc<dyn MessageBus>,
        Arc::new(MemoryDataLayer::new()) as Arc<dyn DataLayer>,
        KvsOptions {
            tick: Duration::from_millis(20),
        },
    ));
    controls.push(kvs_control);
    workers.push(
        std::thread::Builder::new()
            .name("test-kvs".to_owned())
            .spawn(move || kvs.worker_loop())
            .expect("worker must spawn"),
    );

    RunningCluster {
        network,
        controls,
        workers,
    }
}

fn client_for(cluster: &RunningCluster, servers: Vec<CommId>) -> Client {
    let bus = Arc::new(cluster.network.register(CLIENT));
    Client::new(
        bus as Arc<dyn MessageBus>,
        servers,
        ClientOptions {
            attempt_timeout: Duration::from_millis(500),
            max_attempts: 8,
        },
    )
}

#[rstest]
fn client_commits_a_transaction_end_to_end() {
    let mut cluster = start_cluster();
    let client = client_for(&cluster, vec![TXMAN]);

    let mut tx = client
        .begin_transaction(100, GROUP, vec![GROUP])
        .expect("begin must succeed");
    assert_that!(
        tx.write(b"t", b"k", b"v").expect("write must be accepted"),
        eq(ReturnCode::Success)
    );
    assert_that!(
        tx.commit().expect("commit must be answered"),
        eq(ReturnCode::Committed)
    );

    let answer = client
        .unsafe_read(b"t", b"k", u64::MAX)
        .expect("read must be answered");
    assert_that!(answer.rc, eq(ReturnCode::Success));
    assert_that!(answer.timestamp, eq(100_u64));
    assert_that!(&answer.value, eq(&b"v".to_vec()));

    cluster.shutdown();
}

#[rstest]
fn client_observes_an_abort_verdict() {
    let mut cluster = start_cluster();
    let client = client_for(&cluster, vec![TXMAN]);

    let _ = client
        .unsafe_write(b"t", b"k", 50, b"a")
        .expect("seed write must succeed");

    let mut tx = client
        .begin_transaction(100, GROUP, vec![GROUP])
        .expect("begin must succeed");
    let read = tx.read(b"t", b"k").expect("read must be answered");
    assert_that!(&read.value, eq(&b"a".to_vec()));

    // A conflicting write below the commit timestamp invalidates the read.
    let _ = client
        .unsafe_write(b"t", b"k", 75, b"b")
        .expect("conflicting write must succeed");
    assert_that!(
        tx.commit().expect("commit must be answered"),
        eq(ReturnCode::Aborted)
    );

    cluster.shutdown();
}

#[rstest]
fn client_fails_over_to_a_live_server() {
    let mut cluster = start_cluster();
    // The first server does not exist; the selector must rotate to the
    // live one.
    let client = client_for(&cluster, vec![CommId::new(9), TXMAN]);

    let rc = client
        .unsafe_write(b"t", b"k", 10, b"x")
        .expect("write must succeed after failover");
    assert_that!(rc, eq(ReturnCode::Success));

    cluster.shutdown();
}

#[rstest]
fn client_lock_ops_round_trip() {
    let mut cluster = start_cluster();
    let client = client_for(&cluster, vec![TXMAN]);

    assert_that!(
        client
            .unsafe_lock_op(
                b"t",
                b"k",
                TransactionId::new(7),
                LockKind::Write,
                LockAction::Acquire,
            )
            .expect("acquire must be answered"),
        eq(ReturnCode::Success)
    );
    assert_that!(
        client
            .unsafe_lock_op(
                b"t",
                b"k",
                TransactionId::new(8),
                LockKind::Write,
                LockAction::Acquire,
            )
            .expect("conflicting acquire must be answered"),
        eq(ReturnCode::Aborted)
    );
    assert_that!(
        client
            .unsafe_lock_op(
                b"t",
                b"k",
                TransactionId::new(7),
                LockKind::Write,
                LockAction::Release,
            )
            .expect("release must be answered"),
        eq(ReturnCode::Success)
    );

    cluster.shutdown();
}
