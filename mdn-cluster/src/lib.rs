//! Cluster configuration model.
//!
//! A [`config::Configuration`] is an immutable, versioned snapshot of the
//! whole cluster: membership, paxos groups, and partition ownership. The
//! coordinator service produces encoded snapshots; daemons decode and
//! publish them atomically through a [`handle::ConfigHandle`].

pub mod config;
pub mod handle;
pub mod partition;
pub mod source;

pub use config::{Configuration, MemberKind, MemberRecord, NodeState, PartitionRecord, PaxosGroup};
pub use handle::{ConfigEndpointMapper, ConfigHandle};
pub use partition::choose_index;
pub use source::{ConfigSource, StaticConfigSource, TcpConfigSource};
