//! Message model for all daemon-to-daemon and client-to-daemon traffic.
//!
//! A tagged enum with a single dispatch point per daemon. Unknown or
//! short payloads decode to an error and are dropped by the caller.

use mdn_common::error::{MdnResult, ReturnCode};
use mdn_common::ids::{
    CommId, PartitionId, PaxosGroupId, TransactionGroup, TransactionId, VersionId,
};

use crate::codec::{put_slice, put_u16, put_u32, put_u64, put_u8, wire_error, WireCursor};
use crate::log_entry::VoteOutcome;

/// Write flag selecting tombstone deletion over value insertion.
pub const WRITE_TOMBSTONE: u8 = 1;

/// Lock strength requested by a lock operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockKind {
    /// Shared read intent.
    Read,
    /// Exclusive write intent.
    Write,
}

impl LockKind {
    const fn to_wire(self) -> u8 {
        match self {
            Self::Read => 1,
            Self::Write => 2,
        }
    }

    const fn from_wire(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(Self::Read),
            2 => Some(Self::Write),
            _ => None,
        }
    }
}

/// Acquire/release selector for a lock operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockAction {
    /// Take or re-take the lock.
    Acquire,
    /// Drop the lock when held by the same transaction.
    Release,
}

impl LockAction {
    const fn to_wire(self) -> u8 {
        match self {
            Self::Acquire => 1,
            Self::Release => 2,
        }
    }

    const fn from_wire(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(Self::Acquire),
            2 => Some(Self::Release),
            _ => None,
        }
    }
}

/// Message type tags.
///
/// Tags are part of the wire contract; append, never renumber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum MessageType {
    /// Ignored keepalive.
    Nop = 0,
    /// Client: begin a transaction.
    TxBegin = 1,
    /// Client: append a read op.
    TxRead = 2,
    /// Client: append a write op.
    TxWrite = 3,
    /// Client: request commit.
    TxCommit = 4,
    /// Client: request abort.
    TxAbort = 5,
    /// Daemon-to-client outcome.
    ClientResponse = 6,
    /// Client: read outside any transaction.
    UnsafeRead = 7,
    /// Client: write outside any transaction.
    UnsafeWrite = 8,
    /// Client: lock op outside any transaction.
    UnsafeLockOp = 9,
    /// Intra-DC Paxos proposal for one log slot.
    Paxos2a = 16,
    /// Intra-DC Paxos acknowledgment for one log slot.
    Paxos2b = 17,
    /// Local-vote synod phase 1a.
    LvVote1a = 18,
    /// Local-vote synod phase 1b.
    LvVote1b = 19,
    /// Local-vote synod phase 2a.
    LvVote2a = 20,
    /// Local-vote synod phase 2b.
    LvVote2b = 21,
    /// Local-vote outcome announcement.
    LvVoteLearn = 22,
    /// Full transaction log shipped to a lagging replica.
    CommitRecord = 23,
    /// Global vote: open the round.
    GvPropose = 32,
    /// Global vote: ask a peer for learned votes.
    GvVote1a = 33,
    /// Global vote: transfer learned votes.
    GvVote1b = 34,
    /// Global vote: announce one DC's vote.
    GvVote2a = 35,
    /// Global vote: acknowledge one DC's vote.
    GvVote2b = 36,
    /// Replicated read request.
    KvsRepRead = 48,
    /// Replicated read response.
    KvsRepReadResp = 49,
    /// Replicated write request.
    KvsRepWrite = 50,
    /// Replicated write response.
    KvsRepWriteResp = 51,
    /// Raw single-replica read.
    KvsRawRead = 52,
    /// Raw single-replica read response.
    KvsRawReadResp = 53,
    /// Raw single-replica write.
    KvsRawWrite = 54,
    /// Raw single-replica write response.
    KvsRawWriteResp = 55,
    /// Replicated lock operation.
    KvsLockOp = 56,
    /// Replicated lock operation response.
    KvsLockOpResp = 57,
    /// Migration offer for one partition.
    KvsMigrateSyn = 58,
    /// Migration acceptance for one partition.
    KvsMigrateAck = 59,
}

impl MessageType {
    /// Stable wire tag.
    #[must_use]
    pub const fn to_wire(self) -> u16 {
        self as u16
    }

    /// Decodes a wire tag.
    #[must_use]
    pub const fn from_wire(tag: u16) -> Option<Self> {
        match tag {
            0 => Some(Self::Nop),
            1 => Some(Self::TxBegin),
            2 => Some(Self::TxRead),
            3 => Some(Self::TxWrite),
            4 => Some(Self::TxCommit),
            5 => Some(Self::TxAbort),
            6 => Some(Self::ClientResponse),
            7 => Some(Self::UnsafeRead),
            8 => Some(Self::UnsafeWrite),
            9 => Some(Self::UnsafeLockOp),
            16 => Some(Self::Paxos2a),
            17 => Some(Self::Paxos2b),
            18 => Some(Self::LvVote1a),
            19 => Some(Self::LvVote1b),
            20 => Some(Self::LvVote2a),
            21 => Some(Self::LvVote2b),
            22 => Some(Self::LvVoteLearn),
            23 => Some(Self::CommitRecord),
            32 => Some(Self::GvPropose),
            33 => Some(Self::GvVote1a),
            34 => Some(Self::GvVote1b),
            35 => Some(Self::GvVote2a),
            36 => Some(Self::GvVote2b),
            48 => Some(Self::KvsRepRead),
            49 => Some(Self::KvsRepReadResp),
            50 => Some(Self::KvsRepWrite),
            51 => Some(Self::KvsRepWriteResp),
            52 => Some(Self::KvsRawRead),
            53 => Some(Self::KvsRawReadResp),
            54 => Some(Self::KvsRawWrite),
            55 => Some(Self::KvsRawWriteResp),
            56 => Some(Self::KvsLockOp),
            57 => Some(Self::KvsLockOpResp),
            58 => Some(Self::KvsMigrateSyn),
            59 => Some(Self::KvsMigrateAck),
            _ => None,
        }
    }
}

/// One decoded message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Ignored keepalive.
    Nop,
    /// Begin a transaction with a commit-timestamp candidate, the hosting
    /// group's members, and the global-vote quorum.
    TxBegin {
        tg: TransactionGroup,
        nonce: u64,
        timestamp: u64,
        members: Vec<CommId>,
        dcs: Vec<PaxosGroupId>,
    },
    /// Append a read op at `seqno`.
    TxRead {
        tg: TransactionGroup,
        nonce: u64,
        seqno: u64,
        table: Vec<u8>,
        key: Vec<u8>,
    },
    /// Append a write op at `seqno`.
    TxWrite {
        tg: TransactionGroup,
        nonce: u64,
        seqno: u64,
        table: Vec<u8>,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    /// Request commit with `seqno` as the prepare marker.
    TxCommit {
        tg: TransactionGroup,
        nonce: u64,
        seqno: u64,
    },
    /// Request abort with `seqno` as the abort marker.
    TxAbort {
        tg: TransactionGroup,
        nonce: u64,
        seqno: u64,
    },
    /// Outcome for one client request. `timestamp`/`value` are meaningful
    /// for reads and zero/empty otherwise.
    ClientResponse {
        nonce: u64,
        rc: ReturnCode,
        timestamp: u64,
        value: Vec<u8>,
    },
    /// Read outside any transaction.
    UnsafeRead {
        nonce: u64,
        table: Vec<u8>,
        key: Vec<u8>,
        timestamp: u64,
    },
    /// Write outside any transaction.
    UnsafeWrite {
        nonce: u64,
        table: Vec<u8>,
        key: Vec<u8>,
        timestamp: u64,
        value: Vec<u8>,
    },
    /// Lock op outside any transaction.
    UnsafeLockOp {
        nonce: u64,
        table: Vec<u8>,
        key: Vec<u8>,
        txid: TransactionId,
        kind: LockKind,
        action: LockAction,
    },
    /// Propose canonical entry bytes for one log slot.
    Paxos2a {
        tg: TransactionGroup,
        seqno: u64,
        entry: Vec<u8>,
    },
    /// Acknowledge one log slot.
    Paxos2b { tg: TransactionGroup, seqno: u64 },
    /// Local-vote synod: ballot solicitation.
    LvVote1a { tg: TransactionGroup, ballot: u64 },
    /// Local-vote synod: promise carrying any previously accepted outcome.
    LvVote1b {
        tg: TransactionGroup,
        ballot: u64,
        accepted_ballot: u64,
        accepted: Option<VoteOutcome>,
    },
    /// Local-vote synod: accept request.
    LvVote2a {
        tg: TransactionGroup,
        ballot: u64,
        outcome: VoteOutcome,
    },
    /// Local-vote synod: accepted acknowledgment.
    LvVote2b {
        tg: TransactionGroup,
        ballot: u64,
        outcome: VoteOutcome,
    },
    /// Local-vote outcome announcement to the group.
    LvVoteLearn {
        tg: TransactionGroup,
        outcome: VoteOutcome,
    },
    /// Full transaction log for a lagging replica: encoded entries in slot
    /// order.
    CommitRecord {
        tg: TransactionGroup,
        entries: Vec<Vec<u8>>,
    },
    /// Open a global-vote round among DC leaders. Carries the encoded
    /// transaction log so a remote datacenter can materialize its replica.
    GvPropose {
        txid: TransactionId,
        dcs: Vec<PaxosGroupId>,
        record: Vec<Vec<u8>>,
    },
    /// Ask a peer leader for the votes it has learned.
    GvVote1a { txid: TransactionId },
    /// Transfer learned votes to a recovering peer.
    GvVote1b {
        txid: TransactionId,
        votes: Vec<(PaxosGroupId, VoteOutcome)>,
    },
    /// Announce one DC's vote.
    GvVote2a {
        txid: TransactionId,
        dc: PaxosGroupId,
        outcome: VoteOutcome,
    },
    /// Acknowledge receipt of one DC's vote.
    GvVote2b { txid: TransactionId, dc: PaxosGroupId },
    /// Quorum read request to a KVS coordinator.
    KvsRepRead {
        nonce: u64,
        table: Vec<u8>,
        key: Vec<u8>,
        timestamp: u64,
    },
    /// Quorum read answer.
    KvsRepReadResp {
        nonce: u64,
        rc: ReturnCode,
        timestamp: u64,
        value: Vec<u8>,
    },
    /// Quorum write request to a KVS coordinator.
    KvsRepWrite {
        nonce: u64,
        flags: u8,
        table: Vec<u8>,
        key: Vec<u8>,
        timestamp: u64,
        value: Vec<u8>,
    },
    /// Quorum write answer.
    KvsRepWriteResp { nonce: u64, rc: ReturnCode },
    /// Single-replica read.
    KvsRawRead {
        nonce: u64,
        table: Vec<u8>,
        key: Vec<u8>,
        timestamp: u64,
    },
    /// Single-replica read answer; `owner` exposes the replica's current
    /// first owner so the coordinator can detect stale ownership.
    KvsRawReadResp {
        nonce: u64,
        rc: ReturnCode,
        timestamp: u64,
        value: Vec<u8>,
        owner: CommId,
    },
    /// Single-replica write.
    KvsRawWrite {
        nonce: u64,
        flags: u8,
        table: Vec<u8>,
        key: Vec<u8>,
        timestamp: u64,
        value: Vec<u8>,
    },
    /// Single-replica write answer with the replica's ownership view.
    KvsRawWriteResp {
        nonce: u64,
        rc: ReturnCode,
        owner1: CommId,
        owner2: CommId,
    },
    /// Replicated per-key lock CAS.
    KvsLockOp {
        nonce: u64,
        table: Vec<u8>,
        key: Vec<u8>,
        txid: TransactionId,
        kind: LockKind,
        action: LockAction,
    },
    /// Lock CAS answer.
    KvsLockOpResp { nonce: u64, rc: ReturnCode },
    /// Offer migration of one partition at a target config version.
    KvsMigrateSyn {
        partition: PartitionId,
        version: VersionId,
    },
    /// Accept migration at the destination's config version.
    KvsMigrateAck {
        partition: PartitionId,
        version: VersionId,
    },
}

fn put_tg(output: &mut Vec<u8>, tg: TransactionGroup) {
    put_u64(output, tg.txid.get());
    put_u64(output, tg.group.get());
}

fn read_tg(cursor: &mut WireCursor<'_>) -> MdnResult<TransactionGroup> {
    let txid = TransactionId::new(cursor.read_u64()?);
    let group = PaxosGroupId::new(cursor.read_u64()?);
    Ok(TransactionGroup::new(txid, group))
}

fn read_rc(cursor: &mut WireCursor<'_>) -> MdnResult<ReturnCode> {
    let tag = cursor.read_u16()?;
    ReturnCode::from_wire(tag).ok_or_else(|| wire_error(format!("unknown return code {tag}")))
}

fn read_outcome(cursor: &mut WireCursor<'_>) -> MdnResult<VoteOutcome> {
    let tag = cursor.read_u8()?;
    VoteOutcome::from_wire(tag).ok_or_else(|| wire_error(format!("unknown vote outcome {tag}")))
}

impl Message {
    /// Wire tag of this message.
    #[must_use]
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Nop => MessageType::Nop,
            Self::TxBegin { .. } => MessageType::TxBegin,
            Self::TxRead { .. } => MessageType::TxRead,
            Self::TxWrite { .. } => MessageType::TxWrite,
            Self::TxCommit { .. } => MessageType::TxCommit,
            Self::TxAbort { .. } => MessageType::TxAbort,
            Self::ClientResponse { .. } => MessageType::ClientResponse,
            Self::UnsafeRead { .. } => MessageType::UnsafeRead,
            Self::UnsafeWrite { .. } => MessageType::UnsafeWrite,
            Self::UnsafeLockOp { .. } => MessageType::UnsafeLockOp,
            Self::Paxos2a { .. } => MessageType::Paxos2a,
            Self::Paxos2b { .. } => MessageType::Paxos2b,
            Self::LvVote1a { .. } => MessageType::LvVote1a,
            Self::LvVote1b { .. } => MessageType::LvVote1b,
            Self::LvVote2a { .. } => MessageType::LvVote2a,
            Self::LvVote2b { .. } => MessageType::LvVote2b,
            Self::LvVoteLearn { .. } => MessageType::LvVoteLearn,
            Self::CommitRecord { .. } => MessageType::CommitRecord,
            Self::GvPropose { .. } => MessageType::GvPropose,
            Self::GvVote1a { .. } => MessageType::GvVote1a,
            Self::GvVote1b { .. } => MessageType::GvVote1b,
            Self::GvVote2a { .. } => MessageType::GvVote2a,
            Self::GvVote2b { .. } => MessageType::GvVote2b,
            Self::KvsRepRead { .. } => MessageType::KvsRepRead,
            Self::KvsRepReadResp { .. } => MessageType::KvsRepReadResp,
            Self::KvsRepWrite { .. } => MessageType::KvsRepWrite,
            Self::KvsRepWriteResp { .. } => MessageType::KvsRepWriteResp,
            Self::KvsRawRead { .. } => MessageType::KvsRawRead,
            Self::KvsRawReadResp { .. } => MessageType::KvsRawReadResp,
            Self::KvsRawWrite { .. } => MessageType::KvsRawWrite,
            Self::KvsRawWriteResp { .. } => MessageType::KvsRawWriteResp,
            Self::KvsLockOp { .. } => MessageType::KvsLockOp,
            Self::KvsLockOpResp { .. } => MessageType::KvsLockOpResp,
            Self::KvsMigrateSyn { .. } => MessageType::KvsMigrateSyn,
            Self::KvsMigrateAck { .. } => MessageType::KvsMigrateAck,
        }
    }

    /// Encodes this message as `[u16 type | payload]`.
    ///
    /// # Errors
    ///
    /// Returns `MdnError::Protocol` when a slice field exceeds format
    /// limits.
    pub fn encode(&self) -> MdnResult<Vec<u8>> {
        let mut output = Vec::new();
        put_u16(&mut output, self.message_type().to_wire());
        match self {
            Self::Nop => {}
            Self::TxBegin {
                tg,
                nonce,
                timestamp,
                members,
                dcs,
            } => {
                put_tg(&mut output, *tg);
                put_u64(&mut output, *nonce);
                put_u64(&mut output, *timestamp);
                put_u8(
                    &mut output,
                    u8::try_from(members.len())
                        .map_err(|_| wire_error("member list exceeds u8::MAX"))?,
                );
                for member in members {
                    put_u64(&mut output, member.get());
                }
                put_u8(
                    &mut output,
                    u8::try_from(dcs.len()).map_err(|_| wire_error("dc list exceeds u8::MAX"))?,
                );
                for dc in dcs {
                    put_u64(&mut output, dc.get());
                }
            }
            Self::TxRead {
                tg,
                nonce,
                seqno,
                table,
                key,
            } => {
                put_tg(&mut output, *tg);
                put_u64(&mut output, *nonce);
                put_u64(&mut output, *seqno);
                put_slice(&mut output, table)?;
                put_slice(&mut output, key)?;
            }
            Self::TxWrite {
                tg,
                nonce,
                seqno,
                table,
                key,
                value,
            } => {
                put_tg(&mut output, *tg);
                put_u64(&mut output, *nonce);
                put_u64(&mut output, *seqno);
                put_slice(&mut output, table)?;
                put_slice(&mut output, key)?;
                put_slice(&mut output, value)?;
            }
            Self::TxCommit { tg, nonce, seqno } | Self::TxAbort { tg, nonce, seqno } => {
                put_tg(&mut output, *tg);
                put_u64(&mut output, *nonce);
                put_u64(&mut output, *seqno);
            }
            Self::ClientResponse {
                nonce,
                rc,
                timestamp,
                value,
            } => {
                put_u64(&mut output, *nonce);
                put_u16(&mut output, rc.to_wire());
                put_u64(&mut output, *timestamp);
                put_slice(&mut output, value)?;
            }
            Self::UnsafeRead {
                nonce,
                table,
                key,
                timestamp,
            } => {
                put_u64(&mut output, *nonce);
                put_slice(&mut output, table)?;
                put_slice(&mut output, key)?;
                put_u64(&mut output, *timestamp);
            }
            Self::UnsafeWrite {
                nonce,
                table,
                key,
                timestamp,
                value,
            } => {
                put_u64(&mut output, *nonce);
                put_slice(&mut output, table)?;
                put_slice(&mut output, key)?;
                put_u64(&mut output, *timestamp);
                put_slice(&mut output, value)?;
            }
            Self::UnsafeLockOp {
                nonce,
                table,
                key,
                txid,
                kind,
                action,
            }
            | Self::KvsLockOp {
                nonce,
                table,
                key,
                txid,
                kind,
                action,
            } => {
                put_u64(&mut output, *nonce);
                put_slice(&mut output, table)?;
                put_slice(&mut output, key)?;
                put_u64(&mut output, txid.get());
                put_u8(&mut output, kind.to_wire());
                put_u8(&mut output, action.to_wire());
            }
            Self::Paxos2a { tg, seqno, entry } => {
                put_tg(&mut output, *tg);
                put_u64(&mut output, *seqno);
                put_slice(&mut output, entry)?;
            }
            Self::Paxos2b { tg, seqno } => {
                put_tg(&mut output, *tg);
                put_u64(&mut output, *seqno);
            }
            Self::LvVote1a { tg, ballot } => {
                put_tg(&mut output, *tg);
                put_u64(&mut output, *ballot);
            }
            Self::LvVote1b {
                tg,
                ballot,
                accepted_ballot,
                accepted,
            } => {
                put_tg(&mut output, *tg);
                put_u64(&mut output, *ballot);
                put_u64(&mut output, *accepted_ballot);
                match accepted {
                    Some(outcome) => put_u8(&mut output, outcome.to_wire()),
                    None => put_u8(&mut output, 0),
                }
            }
            Self::LvVote2a {
                tg,
                ballot,
                outcome,
            }
            | Self::LvVote2b {
                tg,
                ballot,
                outcome,
            } => {
                put_tg(&mut output, *tg);
                put_u64(&mut output, *ballot);
                put_u8(&mut output, outcome.to_wire());
            }
            Self::LvVoteLearn { tg, outcome } => {
                put_tg(&mut output, *tg);
                put_u8(&mut output, outcome.to_wire());
            }
            Self::CommitRecord { tg, entries } => {
                put_tg(&mut output, *tg);
                put_u32(
                    &mut output,
                    u32::try_from(entries.len())
                        .map_err(|_| wire_error("commit record entry count exceeds u32::MAX"))?,
                );
                for entry in entries {
                    put_slice(&mut output, entry)?;
                }
            }
            Self::GvPropose { txid, dcs, record } => {
                put_u64(&mut output, txid.get());
                put_u8(
                    &mut output,
                    u8::try_from(dcs.len()).map_err(|_| wire_error("dc list exceeds u8::MAX"))?,
                );
                for dc in dcs {
                    put_u64(&mut output, dc.get());
                }
                put_u32(
                    &mut output,
                    u32::try_from(record.len())
                        .map_err(|_| wire_error("record entry count exceeds u32::MAX"))?,
                );
                for entry in record {
                    put_slice(&mut output, entry)?;
                }
            }
            Self::GvVote1a { txid } => {
                put_u64(&mut output, txid.get());
            }
            Self::GvVote1b { txid, votes } => {
                put_u64(&mut output, txid.get());
                put_u8(
                    &mut output,
                    u8::try_from(votes.len()).map_err(|_| wire_error("vote list exceeds u8::MAX"))?,
                );
                for (dc, outcome) in votes {
                    put_u64(&mut output, dc.get());
                    put_u8(&mut output, outcome.to_wire());
                }
            }
            Self::GvVote2a { txid, dc, outcome } => {
                put_u64(&mut output, txid.get());
                put_u64(&mut output, dc.get());
                put_u8(&mut output, outcome.to_wire());
            }
            Self::GvVote2b { txid, dc } => {
                put_u64(&mut output, txid.get());
                put_u64(&mut output, dc.get());
            }
            Self::KvsRepRead {
                nonce,
                table,
                key,
                timestamp,
            }
            | Self::KvsRawRead {
                nonce,
                table,
                key,
                timestamp,
            } => {
                put_u64(&mut output, *nonce);
                put_slice(&mut output, table)?;
                put_slice(&mut output, key)?;
                put_u64(&mut output, *timestamp);
            }
            Self::KvsRepReadResp {
                nonce,
                rc,
                timestamp,
                value,
            } => {
                put_u64(&mut output, *nonce);
                put_u16(&mut output, rc.to_wire());
                put_u64(&mut output, *timestamp);
                put_slice(&mut output, value)?;
            }
            Self::KvsRepWrite {
                nonce,
                flags,
                table,
                key,
                timestamp,
                value,
            }
            | Self::KvsRawWrite {
                nonce,
                flags,
                table,
                key,
                timestamp,
                value,
            } => {
                put_u64(&mut output, *nonce);
                put_u8(&mut output, *flags);
                put_slice(&mut output, table)?;
                put_slice(&mut output, key)?;
                put_u64(&mut output, *timestamp);
                put_slice(&mut output, value)?;
            }
            Self::KvsRepWriteResp { nonce, rc } | Self::KvsLockOpResp { nonce, rc } => {
                put_u64(&mut output, *nonce);
                put_u16(&mut output, rc.to_wire());
            }
            Self::KvsRawReadResp {
                nonce,
                rc,
                timestamp,
                value,
                owner,
            } => {
                put_u64(&mut output, *nonce);
                put_u16(&mut output, rc.to_wire());
                put_u64(&mut output, *timestamp);
                put_slice(&mut output, value)?;
                put_u64(&mut output, owner.get());
            }
            Self::KvsRawWriteResp {
                nonce,
                rc,
                owner1,
                owner2,
            } => {
                put_u64(&mut output, *nonce);
                put_u16(&mut output, rc.to_wire());
                put_u64(&mut output, owner1.get());
                put_u64(&mut output, owner2.get());
            }
            Self::KvsMigrateSyn { partition, version } | Self::KvsMigrateAck { partition, version } => {
                put_u64(&mut output, partition.get());
                put_u64(&mut output, version.get());
            }
        }
        Ok(output)
    }

    /// Decodes one `[u16 type | payload]` buffer.
    ///
    /// # Errors
    ///
    /// Returns `MdnError::Protocol` on unknown types, truncation, or
    /// trailing bytes.
    pub fn decode(payload: &[u8]) -> MdnResult<Self> {
        let mut cursor = WireCursor::new(payload);
        let tag = cursor.read_u16()?;
        let message_type = MessageType::from_wire(tag)
            .ok_or_else(|| wire_error(format!("unknown message type {tag}")))?;
        let message = Self::decode_body(message_type, &mut cursor)?;
        cursor.ensure_fully_consumed()?;
        Ok(message)
    }

    #[allow(clippy::too_many_lines)]
    fn decode_body(message_type: MessageType, cursor: &mut WireCursor<'_>) -> MdnResult<Self> {
        match message_type {
            MessageType::Nop => Ok(Self::Nop),
            MessageType::TxBegin => {
                let tg = read_tg(cursor)?;
                let nonce = cursor.read_u64()?;
                let timestamp = cursor.read_u64()?;
                let member_count = usize::from(cursor.read_u8()?);
                let mut members = Vec::with_capacity(member_count);
                for _ in 0..member_count {
                    members.push(CommId::new(cursor.read_u64()?));
                }
                let dc_count = usize::from(cursor.read_u8()?);
                let mut dcs = Vec::with_capacity(dc_count);
                for _ in 0..dc_count {
                    dcs.push(PaxosGroupId::new(cursor.read_u64()?));
                }
                Ok(Self::TxBegin {
                    tg,
                    nonce,
                    timestamp,
                    members,
                    dcs,
                })
            }
            MessageType::TxRead => Ok(Self::TxRead {
                tg: read_tg(cursor)?,
                nonce: cursor.read_u64()?,
                seqno: cursor.read_u64()?,
                table: cursor.read_vec()?,
                key: cursor.read_vec()?,
            }),
            MessageType::TxWrite => Ok(Self::TxWrite {
                tg: read_tg(cursor)?,
                nonce: cursor.read_u64()?,
                seqno: cursor.read_u64()?,
                table: cursor.read_vec()?,
                key: cursor.read_vec()?,
                value: cursor.read_vec()?,
            }),
            MessageType::TxCommit => Ok(Self::TxCommit {
                tg: read_tg(cursor)?,
                nonce: cursor.read_u64()?,
                seqno: cursor.read_u64()?,
            }),
            MessageType::TxAbort => Ok(Self::TxAbort {
                tg: read_tg(cursor)?,
                nonce: cursor.read_u64()?,
                seqno: cursor.read_u64()?,
            }),
            MessageType::ClientResponse => Ok(Self::ClientResponse {
                nonce: cursor.read_u64()?,
                rc: read_rc(cursor)?,
                timestamp: cursor.read_u64()?,
                value: cursor.read_vec()?,
            }),
            MessageType::UnsafeRead => Ok(Self::UnsafeRead {
                nonce: cursor.read_u64()?,
                table: cursor.read_vec()?,
                key: cursor.read_vec()?,
                timestamp: cursor.read_u64()?,
            }),
            MessageType::UnsafeWrite => Ok(Self::UnsafeWrite {
                nonce: cursor.read_u64()?,
                table: cursor.read_vec()?,
                key: cursor.read_vec()?,
                timestamp: cursor.read_u64()?,
                value: cursor.read_vec()?,
            }),
            MessageType::UnsafeLockOp | MessageType::KvsLockOp => {
                let nonce = cursor.read_u64()?;
                let table = cursor.read_vec()?;
                let key = cursor.read_vec()?;
                let txid = TransactionId::new(cursor.read_u64()?);
                let kind_tag = cursor.read_u8()?;
                let kind = LockKind::from_wire(kind_tag)
                    .ok_or_else(|| wire_error(format!("unknown lock kind {kind_tag}")))?;
                let action_tag = cursor.read_u8()?;
                let action = LockAction::from_wire(action_tag)
                    .ok_or_else(|| wire_error(format!("unknown lock action {action_tag}")))?;
                if message_type == MessageType::UnsafeLockOp {
                    Ok(Self::UnsafeLockOp {
                        nonce,
                        table,
                        key,
                        txid,
                        kind,
                        action,
                    })
                } else {
                    Ok(Self::KvsLockOp {
                        nonce,
                        table,
                        key,
                        txid,
                        kind,
                        action,
                    })
                }
            }
            MessageType::Paxos2a => Ok(Self::Paxos2a {
                tg: read_tg(cursor)?,
                seqno: cursor.read_u64()?,
                entry: cursor.read_vec()?,
            }),
            MessageType::Paxos2b => Ok(Self::Paxos2b {
                tg: read_tg(cursor)?,
                seqno: cursor.read_u64()?,
            }),
            MessageType::LvVote1a => Ok(Self::LvVote1a {
                tg: read_tg(cursor)?,
                ballot: cursor.read_u64()?,
            }),
            MessageType::LvVote1b => {
                let tg = read_tg(cursor)?;
                let ballot = cursor.read_u64()?;
                let accepted_ballot = cursor.read_u64()?;
                let accepted_tag = cursor.read_u8()?;
                let accepted = if accepted_tag == 0 {
                    None
                } else {
                    Some(VoteOutcome::from_wire(accepted_tag).ok_or_else(|| {
                        wire_error(format!("unknown accepted outcome {accepted_tag}"))
                    })?)
                };
                Ok(Self::LvVote1b {
                    tg,
                    ballot,
                    accepted_ballot,
                    accepted,
                })
            }
            MessageType::LvVote2a => Ok(Self::LvVote2a {
                tg: read_tg(cursor)?,
                ballot: cursor.read_u64()?,
                outcome: read_outcome(cursor)?,
            }),
            MessageType::LvVote2b => Ok(Self::LvVote2b {
                tg: read_tg(cursor)?,
                ballot: cursor.read_u64()?,
                outcome: read_outcome(cursor)?,
            }),
            MessageType::LvVoteLearn => Ok(Self::LvVoteLearn {
                tg: read_tg(cursor)?,
                outcome: read_outcome(cursor)?,
            }),
            MessageType::CommitRecord => {
                let tg = read_tg(cursor)?;
                let entry_count = usize::try_from(cursor.read_u32()?)
                    .map_err(|_| wire_error("entry count exceeds platform limits"))?;
                let mut entries = Vec::with_capacity(entry_count);
                for _ in 0..entry_count {
                    entries.push(cursor.read_vec()?);
                }
                Ok(Self::CommitRecord { tg, entries })
            }
            MessageType::GvPropose => {
                let txid = TransactionId::new(cursor.read_u64()?);
                let dc_count = usize::from(cursor.read_u8()?);
                let mut dcs = Vec::with_capacity(dc_count);
                for _ in 0..dc_count {
                    dcs.push(PaxosGroupId::new(cursor.read_u64()?));
                }
                let entry_count = usize::try_from(cursor.read_u32()?)
                    .map_err(|_| wire_error("record entry count exceeds platform limits"))?;
                let mut record = Vec::with_capacity(entry_count);
                for _ in 0..entry_count {
                    record.push(cursor.read_vec()?);
                }
                Ok(Self::GvPropose { txid, dcs, record })
            }
            MessageType::GvVote1a => Ok(Self::GvVote1a {
                txid: TransactionId::new(cursor.read_u64()?),
            }),
            MessageType::GvVote1b => {
                let txid = TransactionId::new(cursor.read_u64()?);
                let vote_count = usize::from(cursor.read_u8()?);
                let mut votes = Vec::with_capacity(vote_count);
                for _ in 0..vote_count {
                    let dc = PaxosGroupId::new(cursor.read_u64()?);
                    votes.push((dc, read_outcome(cursor)?));
                }
                Ok(Self::GvVote1b { txid, votes })
            }
            MessageType::GvVote2a => Ok(Self::GvVote2a {
                txid: TransactionId::new(cursor.read_u64()?),
                dc: PaxosGroupId::new(cursor.read_u64()?),
                outcome: read_outcome(cursor)?,
            }),
            MessageType::GvVote2b => Ok(Self::GvVote2b {
                txid: TransactionId::new(cursor.read_u64()?),
                dc: PaxosGroupId::new(cursor.read_u64()?),
            }),
            MessageType::KvsRepRead => Ok(Self::KvsRepRead {
                nonce: cursor.read_u64()?,
                table: cursor.read_vec()?,
                key: cursor.read_vec()?,
                timestamp: cursor.read_u64()?,
            }),
            MessageType::KvsRepReadResp => Ok(Self::KvsRepReadResp {
                nonce: cursor.read_u64()?,
                rc: read_rc(cursor)?,
                timestamp: cursor.read_u64()?,
                value: cursor.read_vec()?,
            }),
            MessageType::KvsRepWrite => Ok(Self::KvsRepWrite {
                nonce: cursor.read_u64()?,
                flags: cursor.read_u8()?,
                table: cursor.read_vec()?,
                key: cursor.read_vec()?,
                timestamp: cursor.read_u64()?,
                value: cursor.read_vec()?,
            }),
            MessageType::KvsRepWriteResp => Ok(Self::KvsRepWriteResp {
                nonce: cursor.read_u64()?,
                rc: read_rc(cursor)?,
            }),
            MessageType::KvsRawRead => Ok(Self::KvsRawRead {
                nonce: cursor.read_u64()?,
                table: cursor.read_vec()?,
                key: cursor.read_vec()?,
                timestamp: cursor.read_u64()?,
            }),
            MessageType::KvsRawReadResp => Ok(Self::KvsRawReadResp {
                nonce: cursor.read_u64()?,
                rc: read_rc(cursor)?,
                timestamp: cursor.read_u64()?,
                value: cursor.read_vec()?,
                owner: CommId::new(cursor.read_u64()?),
            }),
            MessageType::KvsRawWrite => Ok(Self::KvsRawWrite {
                nonce: cursor.read_u64()?,
                flags: cursor.read_u8()?,
                table: cursor.read_vec()?,
                key: cursor.read_vec()?,
                timestamp: cursor.read_u64()?,
                value: cursor.read_vec()?,
            }),
            MessageType::KvsRawWriteResp => Ok(Self::KvsRawWriteResp {
                nonce: cursor.read_u64()?,
                rc: read_rc(cursor)?,
                owner1: CommId::new(cursor.read_u64()?),
                owner2: CommId::new(cursor.read_u64()?),
            }),
            MessageType::KvsLockOpResp => Ok(Self::KvsLockOpResp {
                nonce: cursor.read_u64()?,
                rc: read_rc(cursor)?,
            }),
            MessageType::KvsMigrateSyn => Ok(Self::KvsMigrateSyn {
                partition: PartitionId::new(cursor.read_u64()?),
                version: VersionId::new(cursor.read_u64()?),
            }),
            MessageType::KvsMigrateAck => Ok(Self::KvsMigrateAck {
                partition: PartitionId::new(cursor.read_u64()?),
                version: VersionId::new(cursor.read_u64()?),
            }),
        }
    }
}
