//! Versioned cluster snapshot and its mapping queries.

use std::fmt::Write as _;

use mdn_common::error::{MdnError, MdnResult};
use mdn_common::ids::{
    CommId, DataCenterId, PartitionId, PaxosGroupId, VersionId, MAX_REPLICATION_FACTOR,
};
use mdn_wire::codec::{put_slice, put_u16, put_u32, put_u64, put_u8, WireCursor};

/// Lifecycle state of one cluster member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// Known to the coordinator but not yet serving.
    Registered,
    /// Serving traffic.
    Online,
    /// Removed from steady-state rotation.
    Offline,
}

impl NodeState {
    const fn to_wire(self) -> u8 {
        match self {
            Self::Registered => 1,
            Self::Online => 2,
            Self::Offline => 3,
        }
    }

    const fn from_wire(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(Self::Registered),
            2 => Some(Self::Online),
            3 => Some(Self::Offline),
            _ => None,
        }
    }
}

/// Which daemon a member runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberKind {
    /// Transaction manager.
    TxMan,
    /// Key-value store.
    Kvs,
}

impl MemberKind {
    const fn to_wire(self) -> u8 {
        match self {
            Self::TxMan => 1,
            Self::Kvs => 2,
        }
    }

    const fn from_wire(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(Self::TxMan),
            2 => Some(Self::Kvs),
            _ => None,
        }
    }
}

/// One cluster member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberRecord {
    /// Node identity.
    pub id: CommId,
    /// Datacenter the node lives in.
    pub dc: DataCenterId,
    /// Daemon kind.
    pub kind: MemberKind,
    /// Lifecycle state.
    pub state: NodeState,
    /// Listener endpoint as `host:port`.
    pub address: String,
}

/// Members of one Paxos quorum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaxosGroup {
    /// Group identity.
    pub id: PaxosGroupId,
    /// Datacenter the group serves.
    pub dc: DataCenterId,
    /// Ordered member list; position 0 is the preferred leader.
    pub members: Vec<CommId>,
}

impl PaxosGroup {
    /// Number of acknowledgments forming a simple majority.
    #[must_use]
    pub fn quorum(&self) -> usize {
        self.members.len() / 2 + 1
    }

    /// Preferred leader, skipping members in `unreachable`.
    #[must_use]
    pub fn leader(&self, unreachable: &[CommId]) -> Option<CommId> {
        self.members
            .iter()
            .copied()
            .find(|member| !unreachable.contains(member))
    }

    /// Whether `id` is a member.
    #[must_use]
    pub fn contains(&self, id: CommId) -> bool {
        self.members.contains(&id)
    }
}

/// Ownership of one partition within one datacenter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionRecord {
    /// Partition identity.
    pub id: PartitionId,
    /// Datacenter this ownership row applies to.
    pub dc: DataCenterId,
    /// Partition index covered by this record.
    pub index: u16,
    /// Ordered replica set; `replicas[0]` is owner₁, `replicas[1]` owner₂.
    pub replicas: Vec<CommId>,
    /// Replicas that joined at this version and still need the partition's
    /// data streamed to them.
    pub incoming: Vec<CommId>,
}

impl PartitionRecord {
    /// Designated migration source: the first replica that already holds
    /// the data, i.e. is not itself incoming.
    #[must_use]
    pub fn source(&self) -> Option<CommId> {
        self.replicas
            .iter()
            .copied()
            .find(|replica| !self.incoming.contains(replica))
    }
}

/// Immutable, versioned snapshot of the whole cluster.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Configuration {
    version: VersionId,
    members: Vec<MemberRecord>,
    groups: Vec<PaxosGroup>,
    partitions: Vec<PartitionRecord>,
}

impl Configuration {
    /// Assembles a snapshot from its parts, validating internal references.
    ///
    /// # Errors
    ///
    /// Returns `MdnError::InvalidConfig` when a group or partition names an
    /// unknown member, a replica set exceeds the replication bound, or a
    /// partition's incoming list is not a subset of its replicas.
    pub fn new(
        version: VersionId,
        members: Vec<MemberRecord>,
        groups: Vec<PaxosGroup>,
        partitions: Vec<PartitionRecord>,
    ) -> MdnResult<Self> {
        let config = Self {
            version,
            members,
            groups,
            partitions,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> MdnResult<()> {
        for group in &self.groups {
            if group.members.is_empty() {
                return Err(MdnError::InvalidConfig("paxos group has no members"));
            }
            if group.members.len() > MAX_REPLICATION_FACTOR {
                return Err(MdnError::InvalidConfig(
                    "paxos group exceeds the replication bound",
                ));
            }
            for member in &group.members {
                if !self.exists(*member) {
                    return Err(MdnError::InvalidConfig(
                        "paxos group references an unknown member",
                    ));
                }
            }
        }
        for partition in &self.partitions {
            if partition.replicas.is_empty() {
                return Err(MdnError::InvalidConfig("partition has no replicas"));
            }
            if partition.replicas.len() > MAX_REPLICATION_FACTOR {
                return Err(MdnError::InvalidConfig(
                    "partition replica set exceeds the replication bound",
                ));
            }
            for replica in &partition.replicas {
                if !self.exists(*replica) {
                    return Err(MdnError::InvalidConfig(
                        "partition references an unknown replica",
                    ));
                }
            }
            for incoming in &partition.incoming {
                if !partition.replicas.contains(incoming) {
                    return Err(MdnError::InvalidConfig(
                        "partition incoming list is not a subset of its replicas",
                    ));
                }
            }
        }
        Ok(())
    }

    /// Snapshot epoch.
    #[must_use]
    pub fn version(&self) -> VersionId {
        self.version
    }

    /// Whether `id` is a known member.
    #[must_use]
    pub fn exists(&self, id: CommId) -> bool {
        self.members.iter().any(|member| member.id == id)
    }

    /// Listener endpoint for `id`.
    #[must_use]
    pub fn get_address(&self, id: CommId) -> Option<&str> {
        self.members
            .iter()
            .find(|member| member.id == id)
            .map(|member| member.address.as_str())
    }

    /// Lifecycle state for `id`.
    #[must_use]
    pub fn get_state(&self, id: CommId) -> Option<NodeState> {
        self.members
            .iter()
            .find(|member| member.id == id)
            .map(|member| member.state)
    }

    /// Whether `id` is serving traffic.
    #[must_use]
    pub fn is_steady_state(&self, id: CommId) -> bool {
        self.get_state(id) == Some(NodeState::Online)
    }

    /// Datacenter of `id`.
    #[must_use]
    pub fn get_data_center(&self, id: CommId) -> Option<DataCenterId> {
        self.members
            .iter()
            .find(|member| member.id == id)
            .map(|member| member.dc)
    }

    /// First two owners for `(dc, partition index)`. Owner₂ is the unset
    /// sentinel when the replica set has a single member.
    #[must_use]
    pub fn map(&self, dc: DataCenterId, index: u16) -> Option<(CommId, CommId)> {
        let record = self.partition_at(dc, index)?;
        let owner1 = record.replicas.first().copied()?;
        let owner2 = record.replicas.get(1).copied().unwrap_or_default();
        Some((owner1, owner2))
    }

    /// Full replica set for `(dc, partition index)`.
    #[must_use]
    pub fn hash(&self, dc: DataCenterId, index: u16) -> Option<&[CommId]> {
        self.partition_at(dc, index)
            .map(|record| record.replicas.as_slice())
    }

    /// Ownership record for `(dc, partition index)`.
    #[must_use]
    pub fn partition_at(&self, dc: DataCenterId, index: u16) -> Option<&PartitionRecord> {
        self.partitions
            .iter()
            .find(|record| record.dc == dc && record.index == index)
    }

    /// Ownership record by partition id within one datacenter.
    #[must_use]
    pub fn partition(&self, dc: DataCenterId, id: PartitionId) -> Option<&PartitionRecord> {
        self.partitions
            .iter()
            .find(|record| record.dc == dc && record.id == id)
    }

    /// Partitions `self_id` must migrate: it is the designated source and
    /// at least one replica still needs the data.
    #[must_use]
    pub fn migratable_partitions(&self, self_id: CommId) -> Vec<PartitionId> {
        self.partitions
            .iter()
            .filter(|record| !record.incoming.is_empty() && record.source() == Some(self_id))
            .map(|record| record.id)
            .collect()
    }

    /// Paxos group by id.
    #[must_use]
    pub fn paxos_group(&self, id: PaxosGroupId) -> Option<&PaxosGroup> {
        self.groups.iter().find(|group| group.id == id)
    }

    /// All paxos groups serving `dc`.
    #[must_use]
    pub fn groups_in(&self, dc: DataCenterId) -> Vec<&PaxosGroup> {
        self.groups.iter().filter(|group| group.dc == dc).collect()
    }

    /// All members in `dc`.
    #[must_use]
    pub fn members_in(&self, dc: DataCenterId) -> Vec<&MemberRecord> {
        self.members
            .iter()
            .filter(|member| member.dc == dc)
            .collect()
    }

    /// Members of one kind in `dc`.
    #[must_use]
    pub fn members_of_kind(&self, dc: DataCenterId, kind: MemberKind) -> Vec<&MemberRecord> {
        self.members
            .iter()
            .filter(|member| member.dc == dc && member.kind == kind)
            .collect()
    }

    /// One-line-per-entity debug rendering for the SIGUSR1 dump path.
    #[must_use]
    pub fn dump(&self) -> String {
        let mut output = String::new();
        let _ = writeln!(output, "configuration {}", self.version.get());
        for member in &self.members {
            let _ = writeln!(
                output,
                "member {} dc={} kind={:?} state={:?} address={}",
                member.id.get(),
                member.dc.get(),
                member.kind,
                member.state,
                member.address
            );
        }
        for group in &self.groups {
            let ids = group
                .members
                .iter()
                .map(|member| member.get().to_string())
                .collect::<Vec<_>>()
                .join(",");
            let _ = writeln!(
                output,
                "group {} dc={} members=[{ids}]",
                group.id.get(),
                group.dc.get()
            );
        }
        for partition in &self.partitions {
            let replicas = partition
                .replicas
                .iter()
                .map(|replica| replica.get().to_string())
                .collect::<Vec<_>>()
                .join(",");
            let incoming = partition
                .incoming
                .iter()
                .map(|replica| replica.get().to_string())
                .collect::<Vec<_>>()
                .join(",");
            let _ = writeln!(
                output,
                "partition {} dc={} index={} replicas=[{replicas}] incoming=[{incoming}]",
                partition.id.get(),
                partition.dc.get(),
                partition.index
            );
        }
        output
    }

    /// Encodes this snapshot as a coordinator blob.
    ///
    /// # Errors
    ///
    /// Returns `MdnError::Protocol` when a field exceeds format limits.
    pub fn encode(&self) -> MdnResult<Vec<u8>> {
        let mut output = Vec::new();
        put_u64(&mut output, self.version.get());

        put_u32(&mut output, list_len(self.members.len(), "member count")?);
        for member in &self.members {
            put_u64(&mut output, member.id.get());
            put_u64(&mut output, member.dc.get());
            put_u8(&mut output, member.kind.to_wire());
            put_u8(&mut output, member.state.to_wire());
            put_slice(&mut output, member.address.as_bytes())?;
        }

        put_u32(&mut output, list_len(self.groups.len(), "group count")?);
        for group in &self.groups {
            put_u64(&mut output, group.id.get());
            put_u64(&mut output, group.dc.get());
            put_u8(
                &mut output,
                u8::try_from(group.members.len())
                    .map_err(|_| config_error("group member count exceeds u8::MAX"))?,
            );
            for member in &group.members {
                put_u64(&mut output, member.get());
            }
        }

        put_u32(
            &mut output,
            list_len(self.partitions.len(), "partition count")?,
        );
        for partition in &self.partitions {
            put_u64(&mut output, partition.id.get());
            put_u64(&mut output, partition.dc.get());
            put_u16(&mut output, partition.index);
            put_u8(
                &mut output,
                u8::try_from(partition.replicas.len())
                    .map_err(|_| config_error("replica count exceeds u8::MAX"))?,
            );
            for replica in &partition.replicas {
                put_u64(&mut output, replica.get());
            }
            put_u8(
                &mut output,
                u8::try_from(partition.incoming.len())
                    .map_err(|_| config_error("incoming count exceeds u8::MAX"))?,
            );
            for replica in &partition.incoming {
                put_u64(&mut output, replica.get());
            }
        }

        Ok(output)
    }

    /// Decodes a coordinator blob into a validated snapshot.
    ///
    /// # Errors
    ///
    /// Returns `MdnError::Protocol` on malformed payloads and
    /// `MdnError::InvalidConfig` when the decoded snapshot violates its own
    /// invariants.
    pub fn decode(payload: &[u8]) -> MdnResult<Self> {
        let mut cursor = WireCursor::new(payload);
        let version = VersionId::new(cursor.read_u64()?);

        let member_count = read_count(&mut cursor)?;
        let mut members = Vec::with_capacity(member_count);
        for _ in 0..member_count {
            let id = CommId::new(cursor.read_u64()?);
            let dc = DataCenterId::new(cursor.read_u64()?);
            let kind_tag = cursor.read_u8()?;
            let kind = MemberKind::from_wire(kind_tag)
                .ok_or_else(|| MdnError::Protocol(format!("unknown member kind {kind_tag}")))?;
            let state_tag = cursor.read_u8()?;
            let state = NodeState::from_wire(state_tag)
                .ok_or_else(|| MdnError::Protocol(format!("unknown node state {state_tag}")))?;
            let address_bytes = cursor.read_vec()?;
            let address = String::from_utf8(address_bytes)
                .map_err(|_| MdnError::Protocol("member address is not UTF-8".to_owned()))?;
            members.push(MemberRecord {
                id,
                dc,
                kind,
                state,
                address,
            });
        }

        let group_count = read_count(&mut cursor)?;
        let mut groups = Vec::with_capacity(group_count);
        for _ in 0..group_count {
            let id = PaxosGroupId::new(cursor.read_u64()?);
            let dc = DataCenterId::new(cursor.read_u64()?);
            let member_count = usize::from(cursor.read_u8()?);
            let mut group_members = Vec::with_capacity(member_count);
            for _ in 0..member_count {
                group_members.push(CommId::new(cursor.read_u64()?));
            }
            groups.push(PaxosGroup {
                id,
                dc,
                members: group_members,
            });
        }

        let partition_count = read_count(&mut cursor)?;
        let mut partitions = Vec::with_capacity(partition_count);
        for _ in 0..partition_count {
            let id = PartitionId::new(cursor.read_u64()?);
            let dc = DataCenterId::new(cursor.read_u64()?);
            let index = cursor.read_u16()?;
            let replica_count = usize::from(cursor.read_u8()?);
            let mut replicas = Vec::with_capacity(replica_count);
            for _ in 0..replica_count {
                replicas.push(CommId::new(cursor.read_u64()?));
            }
            let incoming_count = usize::from(cursor.read_u8()?);
            let mut incoming = Vec::with_capacity(incoming_count);
            for _ in 0..incoming_count {
                incoming.push(CommId::new(cursor.read_u64()?));
            }
            partitions.push(PartitionRecord {
                id,
                dc,
                index,
                replicas,
                incoming,
            });
        }

        cursor.ensure_fully_consumed()?;
        Self::new(version, members, groups, partitions)
    }
}

fn list_len(len: usize, field: &'static str) -> MdnResult<u32> {
    u32::try_from(len).map_err(|_| MdnError::Protocol(format!("{field} exceeds u32::MAX")))
}

fn read_count(cursor: &mut WireCursor<'_>) -> MdnResult<usize> {
    usize::try_from(cursor.read_u32()?)
        .map_err(|_| MdnError::Protocol("count exceeds platform limits".to_owned()))
}

fn config_error(message: &'static str) -> MdnError {
    MdnError::Protocol(message.to_owned())
}

#[cfg(test)]
mod tests {
    use super::{Configuration, MemberKind, MemberRecord, NodeState, PartitionRecord, PaxosGroup};
    use googletest::prelude::*;
    use mdn_common::ids::{CommId, DataCenterId, PartitionId, PaxosGroupId, VersionId};
    use rstest::rstest;

    fn member(id: u64, dc: u64) -> MemberRecord {
        MemberRecord {
            id: CommId::new(id),
            dc: DataCenterId::new(dc),
            kind: MemberKind::Kvs,
            state: NodeState::Online,
            address: format!("127.0.0.1:{}", 2000 + id),
        }
    }

    fn sample_config() -> Configuration {
        Configuration::new(
            VersionId::new(17),
            vec![member(1, 1), member(2, 1), member(3, 1), member(4, 2)],
            vec![
                PaxosGroup {
                    id: PaxosGroupId::new(10),
                    dc: DataCenterId::new(1),
                    members: vec![CommId::new(1), CommId::new(2), CommId::new(3)],
                },
                PaxosGroup {
                    id: PaxosGroupId::new(20),
                    dc: DataCenterId::new(2),
                    members: vec![CommId::new(4)],
                },
            ],
            vec![PartitionRecord {
                id: PartitionId::new(100),
                dc: DataCenterId::new(1),
                index: 0x6b00,
                replicas: vec![CommId::new(1), CommId::new(2)],
                incoming: vec![CommId::new(2)],
            }],
        )
        .expect("sample config must be valid")
    }

    #[rstest]
    fn encode_decode_round_trips() {
        let config = sample_config();
        let blob = config.encode().expect("encoding should succeed");
        let decoded = Configuration::decode(&blob).expect("decoding should succeed");
        assert_that!(&decoded, eq(&config));
    }

    #[rstest]
    fn membership_queries_answer_from_snapshot() {
        let config = sample_config();
        assert_that!(config.exists(CommId::new(1)), eq(true));
        assert_that!(config.exists(CommId::new(99)), eq(false));
        assert_that!(
            config.get_address(CommId::new(2)),
            eq(Some("127.0.0.1:2002"))
        );
        assert_that!(
            config.get_data_center(CommId::new(4)),
            eq(Some(DataCenterId::new(2)))
        );
        assert_that!(config.is_steady_state(CommId::new(3)), eq(true));
    }

    #[rstest]
    fn map_returns_first_two_owners() {
        let config = sample_config();
        let (owner1, owner2) = config
            .map(DataCenterId::new(1), 0x6b00)
            .expect("partition must be mapped");
        assert_that!(owner1, eq(CommId::new(1)));
        assert_that!(owner2, eq(CommId::new(2)));
        assert_that!(config.map(DataCenterId::new(1), 0x1234), eq(None));
    }

    #[rstest]
    fn migratable_partitions_names_the_source() {
        let config = sample_config();
        // Node 1 holds the data; node 2 is incoming.
        assert_that!(
            &config.migratable_partitions(CommId::new(1)),
            eq(&vec![PartitionId::new(100)])
        );
        assert_that!(config.migratable_partitions(CommId::new(2)).is_empty(), eq(true));
    }

    #[rstest]
    fn group_leader_skips_unreachable_members() {
        let config = sample_config();
        let group = config
            .paxos_group(PaxosGroupId::new(10))
            .expect("group must exist");
        assert_that!(group.leader(&[]), eq(Some(CommId::new(1))));
        assert_that!(group.leader(&[CommId::new(1)]), eq(Some(CommId::new(2))));
        assert_that!(group.quorum(), eq(2_usize));
    }

    #[rstest]
    fn unknown_replica_is_rejected() {
        let result = Configuration::new(
            VersionId::new(1),
            vec![member(1, 1)],
            Vec::new(),
            vec![PartitionRecord {
                id: PartitionId::new(5),
                dc: DataCenterId::new(1),
                index: 0,
                replicas: vec![CommId::new(9)],
                incoming: Vec::new(),
            }],
        );
        assert_that!(result.is_err(), eq(true));
    }

    #[rstest]
    fn corrupt_blob_is_rejected() {
        let config = sample_config();
        let mut blob = config.encode().expect("encoding should succeed");
        let _ = blob.pop();
        assert_that!(Configuration::decode(&blob).is_err(), eq(true));
    }
}
