//! Transaction log entries.
//!
//! One log entry occupies one Paxos slot. The 2a proposal carries the
//! encoded entry bytes, and replicas require byte-identical proposals per
//! slot, so the encoding here is the canonical form compared across the
//! group.

use mdn_common::error::MdnResult;
use mdn_common::ids::{CommId, PaxosGroupId};

use crate::codec::{put_slice, put_u64, put_u8, wire_error, WireCursor};

const TAG_BEGIN: u8 = 1;
const TAG_READ: u8 = 2;
const TAG_WRITE: u8 = 3;
const TAG_PREPARE: u8 = 4;
const TAG_ABORT: u8 = 5;

/// Outcome of a local or global commit vote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VoteOutcome {
    /// The voter wants the transaction committed.
    Commit,
    /// The voter wants the transaction aborted.
    Abort,
}

impl VoteOutcome {
    /// Stable wire tag.
    #[must_use]
    pub const fn to_wire(self) -> u8 {
        match self {
            Self::Commit => 1,
            Self::Abort => 2,
        }
    }

    /// Decodes a wire tag.
    #[must_use]
    pub const fn from_wire(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(Self::Commit),
            2 => Some(Self::Abort),
            _ => None,
        }
    }
}

/// One entry in a transaction's replicated operation log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogEntry {
    /// Slot 0: transaction metadata.
    Begin {
        /// Client-chosen commit timestamp candidate.
        timestamp: u64,
        /// Ordered members of the hosting paxos group.
        members: Vec<CommId>,
        /// One paxos group per datacenter in the global-vote quorum.
        dcs: Vec<PaxosGroupId>,
    },
    /// Read of `(table, key)` observed at `timestamp`.
    Read {
        /// Table the key lives in.
        table: Vec<u8>,
        /// Row key.
        key: Vec<u8>,
        /// Timestamp the read observed (0 until the KVS answers).
        timestamp: u64,
    },
    /// Write of `(table, key) = value` at the commit timestamp.
    Write {
        /// Table the key lives in.
        table: Vec<u8>,
        /// Row key.
        key: Vec<u8>,
        /// Value bytes.
        value: Vec<u8>,
    },
    /// Prepare marker ending the log.
    Prepare,
    /// Abort marker ending the log.
    Abort,
}

impl LogEntry {
    /// Whether this entry ends the operation log.
    #[must_use]
    pub fn is_end_of_log(&self) -> bool {
        matches!(self, Self::Prepare | Self::Abort)
    }

    /// Canonical byte encoding compared across replicas.
    ///
    /// # Errors
    ///
    /// Returns `MdnError::Protocol` when a slice field exceeds format
    /// limits.
    pub fn encode(&self) -> MdnResult<Vec<u8>> {
        let mut output = Vec::new();
        match self {
            Self::Begin {
                timestamp,
                members,
                dcs,
            } => {
                put_u8(&mut output, TAG_BEGIN);
                put_u64(&mut output, *timestamp);
                put_u8(
                    &mut output,
                    u8::try_from(members.len())
                        .map_err(|_| wire_error("begin member list exceeds u8::MAX"))?,
                );
                for member in members {
                    put_u64(&mut output, member.get());
                }
                put_u8(
                    &mut output,
                    u8::try_from(dcs.len())
                        .map_err(|_| wire_error("begin dc list exceeds u8::MAX"))?,
                );
                for dc in dcs {
                    put_u64(&mut output, dc.get());
                }
            }
            Self::Read {
                table,
                key,
                timestamp,
            } => {
                put_u8(&mut output, TAG_READ);
                put_slice(&mut output, table)?;
                put_slice(&mut output, key)?;
                put_u64(&mut output, *timestamp);
            }
            Self::Write { table, key, value } => {
                put_u8(&mut output, TAG_WRITE);
                put_slice(&mut output, table)?;
                put_slice(&mut output, key)?;
                put_slice(&mut output, value)?;
            }
            Self::Prepare => put_u8(&mut output, TAG_PREPARE),
            Self::Abort => put_u8(&mut output, TAG_ABORT),
        }
        Ok(output)
    }

    /// Decodes one entry from its canonical bytes.
    ///
    /// # Errors
    ///
    /// Returns `MdnError::Protocol` on truncation, trailing bytes, or an
    /// unknown tag.
    pub fn decode(payload: &[u8]) -> MdnResult<Self> {
        let mut cursor = WireCursor::new(payload);
        let entry = Self::decode_from(&mut cursor)?;
        cursor.ensure_fully_consumed()?;
        Ok(entry)
    }

    /// Decodes one entry from a cursor positioned at its tag.
    ///
    /// # Errors
    ///
    /// Returns `MdnError::Protocol` on truncation or an unknown tag.
    pub fn decode_from(cursor: &mut WireCursor<'_>) -> MdnResult<Self> {
        let tag = cursor.read_u8()?;
        match tag {
            TAG_BEGIN => {
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
                Ok(Self::Begin {
                    timestamp,
                    members,
                    dcs,
                })
            }
            TAG_READ => Ok(Self::Read {
                table: cursor.read_vec()?,
                key: cursor.read_vec()?,
                timestamp: cursor.read_u64()?,
            }),
            TAG_WRITE => Ok(Self::Write {
                table: cursor.read_vec()?,
                key: cursor.read_vec()?,
                value: cursor.read_vec()?,
            }),
            TAG_PREPARE => Ok(Self::Prepare),
            TAG_ABORT => Ok(Self::Abort),
            _ => Err(wire_error(format!("unknown log entry tag {tag}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{LogEntry, VoteOutcome};
    use googletest::prelude::*;
    use mdn_common::ids::{CommId, PaxosGroupId};
    use rstest::rstest;

    fn sample_entries() -> Vec<LogEntry> {
        vec![
            LogEntry::Begin {
                timestamp: 100,
                members: vec![CommId::new(1), CommId::new(2), CommId::new(3)],
                dcs: vec![PaxosGroupId::new(9)],
            },
            LogEntry::Read {
                table: b"t".to_vec(),
                key: b"k".to_vec(),
                timestamp: 50,
            },
            LogEntry::Write {
                table: b"t".to_vec(),
                key: b"k".to_vec(),
                value: b"v".to_vec(),
            },
            LogEntry::Prepare,
            LogEntry::Abort,
        ]
    }

    #[rstest]
    fn every_entry_kind_round_trips() {
        for entry in sample_entries() {
            let encoded = entry.encode().expect("encoding should succeed");
            let decoded = LogEntry::decode(&encoded).expect("decoding should succeed");
            assert_that!(&decoded, eq(&entry));
        }
    }

    #[rstest]
    fn encoding_is_deterministic() {
        let entry = LogEntry::Write {
            table: b"accounts".to_vec(),
            key: b"alice".to_vec(),
            value: b"100".to_vec(),
        };
        assert_that!(
            entry.encode().expect("encode"),
            eq(&entry.encode().expect("encode"))
        );
    }

    #[rstest]
    fn unknown_tag_is_rejected() {
        assert_that!(LogEntry::decode(&[99]).is_err(), eq(true));
    }

    #[rstest]
    fn only_prepare_and_abort_end_the_log() {
        assert_that!(LogEntry::Prepare.is_end_of_log(), eq(true));
        assert_that!(LogEntry::Abort.is_end_of_log(), eq(true));
        assert_that!(
            LogEntry::Read {
                table: Vec::new(),
                key: Vec::new(),
                timestamp: 0,
            }
            .is_end_of_log(),
            eq(false)
        );
    }

    #[rstest]
    #[case(VoteOutcome::Commit)]
    #[case(VoteOutcome::Abort)]
    fn vote_outcome_wire_round_trip(#[case] outcome: VoteOutcome) {
        assert_that!(VoteOutcome::from_wire(outcome.to_wire()), eq(Some(outcome)));
    }
}
