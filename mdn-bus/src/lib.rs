//! Message bus transport.
//!
//! Delivery is best-effort and at-most-once per connection: a frame either
//! arrives intact or the connection is reported disrupted. Senders identify
//! themselves with a hello frame when a connection opens, so receivers
//! always know the peer id behind a delivery.

pub mod loopback;
pub mod tcp;

use std::time::Duration;

use mdn_common::error::MdnResult;
use mdn_common::ids::CommId;

pub use loopback::{LoopbackBus, LoopbackNetwork};
pub use tcp::TcpBus;

/// One receive-side event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusEvent {
    /// A complete frame from `from`.
    Message {
        /// Sending node.
        from: CommId,
        /// Frame payload (message type + body).
        payload: Vec<u8>,
    },
    /// The connection to `peer` was reset; in-flight frames may be lost.
    Disrupted {
        /// The peer whose connection dropped.
        peer: CommId,
    },
    /// No event arrived within the requested timeout.
    Timeout,
    /// The bus has shut down; the worker should exit.
    Shutdown,
}

/// Resolves node ids to dialable endpoints.
///
/// Daemons answer from their current configuration snapshot, so a config
/// refresh transparently redirects reconnections.
pub trait EndpointMapper: Send + Sync {
    /// Returns the `host:port` endpoint for `id`, when known.
    fn lookup(&self, id: CommId) -> Option<String>;
}

/// Bidirectional message transport between cluster nodes.
pub trait MessageBus: Send + Sync {
    /// Queues one frame for delivery to `to`.
    ///
    /// # Errors
    ///
    /// Returns `MdnError::Disrupted` when the peer is unknown or its
    /// connection cannot be established; the caller recovers via a config
    /// refresh, not by retrying blindly.
    fn send(&self, to: CommId, payload: Vec<u8>) -> MdnResult<()>;

    /// Waits up to `timeout` for the next event.
    fn recv(&self, timeout: Duration) -> BusEvent;

    /// Shuts the bus down and unblocks every receiver.
    fn shutdown(&self);
}
