//! End-to-end transaction scenarios over the loopback bus.
//!
//! Each test wires TxMan groups and KVS replica sets onto one in-process
//! network and pumps every daemon in rounds until quiescent, so full
//! commit protocols run deterministically inside one test body.

use std::sync::Arc;
use std::time::Duration;

use googletest::prelude::*;
use mdn_bus::{BusEvent, LoopbackBus, LoopbackNetwork, MessageBus};
use mdn_cluster::config::{MemberKind, MemberRecord, NodeState, PartitionRecord, PaxosGroup};
use mdn_cluster::{ConfigHandle, Configuration};
use mdn_common::control::DaemonControl;
use mdn_common::error::ReturnCode;
use mdn_common::ids::{
    CommId, DataCenterId, PartitionId, PaxosGroupId, TransactionGroup, TransactionId, VersionId,
};
use mdn_kvs::{KvsDaemon, KvsOptions};
use mdn_storage::{DataLayer, MemoryDataLayer};
use mdn_wire::{LockAction, LockKind, Message};
use rstest::rstest;

use crate::daemon::{TxmanDaemon, TxmanOptions};

const CLIENT: CommId = CommId::new(100);
const KEY_INDEX: u16 = 0x6b00;

enum Node {
    Txman {
        daemon: Arc<TxmanDaemon>,
        bus: Arc<LoopbackBus>,
    },
    Kvs {
        daemon: Arc<KvsDaemon>,
    },
}

struct TestCluster {
    network: LoopbackNetwork,
    nodes: Vec<Node>,
    client: LoopbackBus,
}

struct DcSpec {
    dc: u64,
    group: u64,
    txman_ids: Vec<u64>,
    kvs_ids: Vec<u64>,
    offline: Vec<u64>,
}

fn build_config(specs: &[DcSpec]) -> Arc<Configuration> {
    let mut members = Vec::new();
    let mut groups = Vec::new();
    let mut partitions = Vec::new();
    for spec in specs {
        for id in &spec.txman_ids {
            let state = if spec.offline.contains(id) {
                NodeState::Offline
            } else {
                NodeState::Online
            };
            members.push(MemberRecord {
                id: CommId::new(*id),
                dc: DataCenterId::new(spec.dc),
                kind: MemberKind::TxMan,
                state,
                address: format!("127.0.0.1:{}", 24000 + id),
            });
        }
        for id in &spec.kvs_ids {
            members.push(MemberRecord {
                id: CommId::new(*id),
                dc: DataCenterId::new(spec.dc),
                kind: MemberKind::Kvs,
                state: NodeState::Online,
                address: format!("127.0.0.1:{}", 24000 + id),
            });
        }
        groups.push(PaxosGroup {
            id: PaxosGroupId::new(spec.group),
            dc: DataCenterId::new(spec.dc),
            members: spec.txman_ids.iter().map(|id| CommId::new(*id)).collect(),
        });
        partitions.push(PartitionRecord {
            id: PartitionId::new(spec.dc),
            dc: DataCenterId::new(spec.dc),
            index: KEY_INDEX,
            replicas: spec.kvs_ids.iter().map(|id| CommId::new(*id)).collect(),
            incoming: Vec::new(),
        });
    }
    Arc::new(
        Configuration::new(VersionId::new(1), members, groups, partitions)
            .expect("test config must be valid"),
    )
}

fn build_cluster(specs: &[DcSpec]) -> TestCluster {
    let network = LoopbackNetwork::new();
    let client = network.register(CLIENT);
    let config = build_config(specs);
    let mut nodes = Vec::new();
    for spec in specs {
        for id in &spec.txman_ids {
            let node_id = CommId::new(*id);
            let bus = Arc::new(network.register(node_id));
            let handle = Arc::new(ConfigHandle::new());
            assert_that!(handle.install(Arc::clone(&config)), eq(true));
            nodes.push(Node::Txman {
                daemon: Arc::new(TxmanDaemon::new(
                    node_id,
                    DaemonControl::new(),
                    handle,
                    Arc::clone(&bus) as Arc<dyn MessageBus>,
                    TxmanOptions::default(),
                )),
                bus,
            });
        }
        for id in &spec.kvs_ids {
            let node_id = CommId::new(*id);
            let bus = Arc::new(network.register(node_id));
            let handle = Arc::new(ConfigHandle::new());
            assert_that!(handle.install(Arc::clone(&config)), eq(true));
            nodes.push(Node::Kvs {
                daemon: Arc::new(KvsDaemon::new(
                    node_id,
                    DaemonControl::new(),
                    handle,
                    bus as Arc<dyn MessageBus>,
                    Arc::new(MemoryDataLayer::new()) as Arc<dyn DataLayer>,
                    KvsOptions::default(),
                )),
            });
        }
    }
    TestCluster {
        network,
        nodes,
        client,
    }
}

impl TestCluster {
    fn pump_until_quiescent(&self) {
        for _ in 0..256 {
            let processed: usize = self
                .nodes
                .iter()
                .map(|node| match node {
                    Node::Txman { daemon, .. } => daemon.pump(),
                    Node::Kvs { daemon } => daemon.pump(),
                })
                .sum();
            if processed == 0 {
                return;
            }
        }
        panic!("cluster did not quiesce within the round budget");
    }

    fn send_to(&self, node: u64, message: &Message) {
        let payload = message.encode().expect("test message must encode");
        self.client
            .send(CommId::new(node), payload)
            .expect("loopback send must succeed");
    }

    fn client_response(&self) -> (u64, ReturnCode, u64, Vec<u8>) {
        match self.client.recv(Duration::from_millis(100)) {
            BusEvent::Message { payload, .. } => {
                match Message::decode(&payload).expect("response must decode") {
                    Message::ClientResponse {
                        nonce,
                        rc,
                        timestamp,
                        value,
                    } => (nonce, rc, timestamp, value),
                    other => panic!("expected a client response, got {other:?}"),
                }
            }
            other => panic!("expected a client response, got {other:?}"),
        }
    }

    fn request(&self, node: u64, message: &Message) -> (u64, ReturnCode, u64, Vec<u8>) {
        self.send_to(node, message);
        self.pump_until_quiescent();
        self.client_response()
    }

    fn txman_transaction_counts(&self) -> Vec<usize> {
        self.nodes
            .iter()
            .filter_map(|node| match node {
                Node::Txman { daemon, .. } => Some(daemon.transaction_count()),
                Node::Kvs { .. } => None,
            })
            .collect()
    }

    fn txman_bus(&self, id: u64) -> Arc<LoopbackBus> {
        self.nodes
            .iter()
            .find_map(|node| match node {
                Node::Txman { daemon, bus } if daemon.id() == CommId::new(id) => {
                    Some(Arc::clone(bus))
                }
                _ => None,
            })
            .expect("txman bus must exist")
    }
}

fn single_dc() -> TestCluster {
    build_cluster(&[DcSpec {
        dc: 1,
        group: 10,
        txman_ids: vec![1, 2, 3],
        kvs_ids: vec![11, 12, 13],
        offline: Vec::new(),
    }])
}

fn tg(txid: u64, group: u64) -> TransactionGroup {
    TransactionGroup::new(TransactionId::new(txid), PaxosGroupId::new(group))
}

fn begin_message(txid: u64, group: u64, nonce: u64, timestamp: u64, dcs: &[u64]) -> Message {
    Message::TxBegin {
        tg: tg(txid, group),
        nonce,
        timestamp,
        members: Vec::new(),
        dcs: dcs.iter().map(|dc| PaxosGroupId::new(*dc)).collect(),
    }
}

#[rstest]
fn single_dc_transaction_commits_and_is_readable() {
    let cluster = single_dc();

    let (nonce, rc, _, _) = cluster.request(1, &begin_message(7, 10, 1, 100, &[10]));
    assert_that!((nonce, rc), eq((1, ReturnCode::Success)));

    let (nonce, rc, _, _) = cluster.request(
        1,
        &Message::TxWrite {
            tg: tg(7, 10),
            nonce: 2,
            seqno: 0,
            table: b"t".to_vec(),
            key: b"k".to_vec(),
            value: b"v".to_vec(),
        },
    );
    assert_that!((nonce, rc), eq((2, ReturnCode::Success)));

    let (nonce, rc, _, _) = cluster.request(
        1,
        &Message::TxCommit {
            tg: tg(7, 10),
            nonce: 3,
            seqno: 1,
        },
    );
    assert_that!((nonce, rc), eq((3, ReturnCode::Committed)));

    // Every replica reached a terminal state and was collected.
    assert_that!(&cluster.txman_transaction_counts(), eq(&vec![0, 0, 0]));

    // The committed value is visible at and above its commit timestamp.
    let (nonce, rc, timestamp, value) = cluster.request(
        2,
        &Message::UnsafeRead {
            nonce: 4,
            table: b"t".to_vec(),
            key: b"k".to_vec(),
            timestamp: u64::MAX,
        },
    );
    assert_that!((nonce, rc), eq((4, ReturnCode::Success)));
    assert_that!(timestamp, eq(100_u64));
    assert_that!(&value, eq(&b"v".to_vec()));
}

#[rstest]
fn transactional_read_observes_committed_state() {
    let cluster = single_dc();

    // Seed a value outside any transaction.
    let (_, rc, _, _) = cluster.request(
        1,
        &Message::UnsafeWrite {
            nonce: 1,
            table: b"t".to_vec(),
            key: b"k".to_vec(),
            timestamp: 50,
            value: b"a".to_vec(),
        },
    );
    assert_that!(rc, eq(ReturnCode::Success));

    let (_, rc, _, _) = cluster.request(1, &begin_message(8, 10, 2, 100, &[10]));
    assert_that!(rc, eq(ReturnCode::Success));

    let (nonce, rc, timestamp, value) = cluster.request(
        1,
        &Message::TxRead {
            tg: tg(8, 10),
            nonce: 3,
            seqno: 0,
            table: b"t".to_vec(),
            key: b"k".to_vec(),
        },
    );
    assert_that!((nonce, rc), eq((3, ReturnCode::Success)));
    assert_that!(timestamp, eq(50_u64));
    assert_that!(&value, eq(&b"a".to_vec()));

    let (nonce, rc, _, _) = cluster.request(
        1,
        &Message::TxCommit {
            tg: tg(8, 10),
            nonce: 4,
            seqno: 1,
        },
    );
    assert_that!((nonce, rc), eq((4, ReturnCode::Committed)));
}

#[rstest]
fn conflicting_write_between_read_and_commit_aborts() {
    let cluster = single_dc();

    let (_, rc, _, _) = cluster.request(
        1,
        &Message::UnsafeWrite {
            nonce: 1,
            table: b"t".to_vec(),
            key: b"k".to_vec(),
            timestamp: 50,
            value: b"a".to_vec(),
        },
    );
    assert_that!(rc, eq(ReturnCode::Success));

    let (_, rc, _, _) = cluster.request(1, &begin_message(9, 10, 2, 100, &[10]));
    assert_that!(rc, eq(ReturnCode::Success));

    let (_, rc, _, value) = cluster.request(
        1,
        &Message::TxRead {
            tg: tg(9, 10),
            nonce: 3,
            seqno: 0,
            table: b"t".to_vec(),
            key: b"k".to_vec(),
        },
    );
    assert_that!(rc, eq(ReturnCode::Success));
    assert_that!(&value, eq(&b"a".to_vec()));

    // A concurrent writer lands a newer version below the commit
    // timestamp.
    let (_, rc, _, _) = cluster.request(
        1,
        &Message::UnsafeWrite {
            nonce: 4,
            table: b"t".to_vec(),
            key: b"k".to_vec(),
            timestamp: 75,
            value: b"b".to_vec(),
        },
    );
    assert_that!(rc, eq(ReturnCode::Success));

    let (nonce, rc, _, _) = cluster.request(
        1,
        &Message::TxCommit {
            tg: tg(9, 10),
            nonce: 5,
            seqno: 1,
        },
    );
    assert_that!((nonce, rc), eq((5, ReturnCode::Aborted)));

    // The abort released its locks: a fresh transaction can lock the key.
    let (nonce, rc, _, _) = cluster.request(
        1,
        &Message::UnsafeLockOp {
            nonce: 6,
            table: b"t".to_vec(),
            key: b"k".to_vec(),
            txid: TransactionId::new(999),
            kind: LockKind::Write,
            action: LockAction::Acquire,
        },
    );
    assert_that!((nonce, rc), eq((6, ReturnCode::Success)));
}

#[rstest]
fn client_abort_discards_buffered_writes() {
    let cluster = single_dc();

    let (_, rc, _, _) = cluster.request(1, &begin_message(12, 10, 1, 100, &[10]));
    assert_that!(rc, eq(ReturnCode::Success));
    let (_, rc, _, _) = cluster.request(
        1,
        &Message::TxWrite {
            tg: tg(12, 10),
            nonce: 2,
            seqno: 0,
            table: b"t".to_vec(),
            key: b"k".to_vec(),
            value: b"junk".to_vec(),
        },
    );
    assert_that!(rc, eq(ReturnCode::Success));

    let (nonce, rc, _, _) = cluster.request(
        1,
        &Message::TxAbort {
            tg: tg(12, 10),
            nonce: 3,
            seqno: 1,
        },
    );
    assert_that!((nonce, rc), eq((3, ReturnCode::Aborted)));

    // The aborted write never reached storage.
    let (_, rc, _, _) = cluster.request(
        2,
        &Message::UnsafeRead {
            nonce: 4,
            table: b"t".to_vec(),
            key: b"k".to_vec(),
            timestamp: u64::MAX,
        },
    );
    assert_that!(rc, eq(ReturnCode::NotFound));
}

#[rstest]
fn cross_dc_transaction_commits_in_both_datacenters() {
    let cluster = build_cluster(&[
        DcSpec {
            dc: 1,
            group: 10,
            txman_ids: vec![1],
            kvs_ids: vec![11],
            offline: Vec::new(),
        },
        DcSpec {
            dc: 2,
            group: 20,
            txman_ids: vec![2],
            kvs_ids: vec![21],
            offline: Vec::new(),
        },
    ]);

    let (_, rc, _, _) = cluster.request(1, &begin_message(7, 10, 1, 100, &[10, 20]));
    assert_that!(rc, eq(ReturnCode::Success));
    let (_, rc, _, _) = cluster.request(
        1,
        &Message::TxWrite {
            tg: tg(7, 10),
            nonce: 2,
            seqno: 0,
            table: b"t".to_vec(),
            key: b"k".to_vec(),
            value: b"geo".to_vec(),
        },
    );
    assert_that!(rc, eq(ReturnCode::Success));

    let (nonce, rc, _, _) = cluster.request(
        1,
        &Message::TxCommit {
            tg: tg(7, 10),
            nonce: 3,
            seqno: 1,
        },
    );
    assert_that!((nonce, rc), eq((3, ReturnCode::Committed)));

    // The write is readable in both datacenters: each DC leader applied it
    // against its own replica set.
    for txman in [1_u64, 2] {
        let (_, rc, timestamp, value) = cluster.request(
            txman,
            &Message::UnsafeRead {
                nonce: 10 + txman,
                table: b"t".to_vec(),
                key: b"k".to_vec(),
                timestamp: u64::MAX,
            },
        );
        assert_that!(rc, eq(ReturnCode::Success));
        assert_that!(timestamp, eq(100_u64));
        assert_that!(&value, eq(&b"geo".to_vec()));
    }
}

#[rstest]
fn redelivered_operations_do_not_disturb_the_log() {
    let cluster = single_dc();

    let (_, rc, _, _) = cluster.request(1, &begin_message(13, 10, 1, 100, &[10]));
    assert_that!(rc, eq(ReturnCode::Success));

    let write = Message::TxWrite {
        tg: tg(13, 10),
        nonce: 2,
        seqno: 0,
        table: b"t".to_vec(),
        key: b"k".to_vec(),
        value: b"v".to_vec(),
    };
    let (_, rc, _, _) = cluster.request(1, &write);
    assert_that!(rc, eq(ReturnCode::Success));

    // Redelivery with identical payload is tolerated; the transaction
    // still commits exactly once.
    cluster.send_to(1, &write);
    cluster.pump_until_quiescent();

    let (nonce, rc, _, _) = cluster.request(
        1,
        &Message::TxCommit {
            tg: tg(13, 10),
            nonce: 3,
            seqno: 1,
        },
    );
    assert_that!((nonce, rc), eq((3, ReturnCode::Committed)));
}

#[rstest]
fn group_fails_over_when_the_leader_goes_silent() {
    let cluster = single_dc();

    // Node 1, the configured leader, goes dark: it hears nothing more,
    // and its peers observe the disruption on their bus.
    cluster.network.silence(CommId::new(1));
    cluster.txman_bus(2).inject_disruption(CommId::new(1));
    cluster.txman_bus(3).inject_disruption(CommId::new(1));
    cluster.pump_until_quiescent();

    // The client fails over to node 2, which now leads the group and
    // drives a full commit with the surviving quorum.
    let (nonce, rc, _, _) = cluster.request(2, &begin_message(21, 10, 1, 100, &[10]));
    assert_that!((nonce, rc), eq((1, ReturnCode::Success)));

    let (_, rc, _, _) = cluster.request(
        2,
        &Message::TxWrite {
            tg: tg(21, 10),
            nonce: 2,
            seqno: 0,
            table: b"t".to_vec(),
            key: b"k".to_vec(),
            value: b"survivor".to_vec(),
        },
    );
    assert_that!(rc, eq(ReturnCode::Success));

    let (nonce, rc, _, _) = cluster.request(
        2,
        &Message::TxCommit {
            tg: tg(21, 10),
            nonce: 3,
            seqno: 1,
        },
    );
    assert_that!((nonce, rc), eq((3, ReturnCode::Committed)));

    let (_, rc, timestamp, value) = cluster.request(
        3,
        &Message::UnsafeRead {
            nonce: 4,
            table: b"t".to_vec(),
            key: b"k".to_vec(),
            timestamp: u64::MAX,
        },
    );
    assert_that!(rc, eq(ReturnCode::Success));
    assert_that!(timestamp, eq(100_u64));
    assert_that!(&value, eq(&b"survivor".to_vec()));
}

#[rstest]
fn offline_leader_is_skipped_via_configuration() {
    // The coordinator already demoted node 1 to offline in the epoch every
    // daemon runs; no bus-level disruption is needed for its peers to
    // route leadership past it.
    let cluster = build_cluster(&[DcSpec {
        dc: 1,
        group: 10,
        txman_ids: vec![1, 2, 3],
        kvs_ids: vec![11, 12, 13],
        offline: vec![1],
    }]);
    cluster.network.silence(CommId::new(1));

    let (nonce, rc, _, _) = cluster.request(2, &begin_message(22, 10, 1, 100, &[10]));
    assert_that!((nonce, rc), eq((1, ReturnCode::Success)));

    let (nonce, rc, _, _) = cluster.request(
        2,
        &Message::TxCommit {
            tg: tg(22, 10),
            nonce: 2,
            seqno: 0,
        },
    );
    assert_that!((nonce, rc), eq((2, ReturnCode::Committed)));
}
