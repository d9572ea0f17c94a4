//! Canonical identifier types used across transaction, storage, and
//! migration pathways.
//!
//! Every handle is a distinct 64-bit newtype so a partition id can never be
//! passed where a paxos group id is expected. All of them are assigned by
//! the coordinator except [`TransactionId`], which the client chooses.

use std::fmt;

/// Upper bound on replica-set size for one partition and on the number of
/// datacenters participating in one global vote.
pub const MAX_REPLICATION_FACTOR: usize = 5;

/// Number of partition indices in the keyspace mapping.
pub const KVS_PARTITIONS: usize = 1 << 16;

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident, $display:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
        pub struct $name(u64);

        impl $name {
            /// Wraps a raw 64-bit handle.
            #[must_use]
            pub const fn new(value: u64) -> Self {
                Self(value)
            }

            /// Returns the raw 64-bit handle.
            #[must_use]
            pub const fn get(self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($display, "({})"), self.0)
            }
        }
    };
}

id_type!(
    /// Opaque node identity, unique per process across the cluster lifetime.
    CommId,
    "comm"
);
id_type!(
    /// Datacenter handle.
    DataCenterId,
    "dc"
);
id_type!(
    /// Partition handle.
    PartitionId,
    "partition"
);
id_type!(
    /// Paxos group handle (one group per datacenter per replica layout).
    PaxosGroupId,
    "group"
);
id_type!(
    /// Configuration epoch handle.
    VersionId,
    "version"
);
id_type!(
    /// Client-chosen transaction identity.
    TransactionId,
    "tx"
);

/// Composite identity of a TM-hosted transaction replica.
///
/// A transaction is addressed by the pair of its client-chosen id and the
/// paxos group hosting it, so two groups can host unrelated transactions
/// under the same client id without colliding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct TransactionGroup {
    /// Client-chosen transaction id.
    pub txid: TransactionId,
    /// Paxos group hosting this replica.
    pub group: PaxosGroupId,
}

impl TransactionGroup {
    /// Builds a transaction-group key.
    #[must_use]
    pub const fn new(txid: TransactionId, group: PaxosGroupId) -> Self {
        Self { txid, group }
    }
}

impl fmt::Display for TransactionGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tg({}, {})", self.txid.get(), self.group.get())
    }
}
