//! Server selection with failover.

use mdn_common::ids::CommId;

/// Rotates through the known transaction managers, advancing on failure so
/// retries land on a different server.
#[derive(Debug, Clone)]
pub struct ServerSelector {
    servers: Vec<CommId>,
    cursor: usize,
}

impl ServerSelector {
    /// Creates a selector over `servers`.
    #[must_use]
    pub fn new(servers: Vec<CommId>) -> Self {
        Self {
            servers,
            cursor: 0,
        }
    }

    /// The server requests currently target.
    #[must_use]
    pub fn current(&self) -> Option<CommId> {
        self.servers.get(self.cursor % self.servers.len().max(1)).copied()
    }

    /// Rotates to the next server after a failure or disruption.
    pub fn advance(&mut self) {
        if !self.servers.is_empty() {
            self.cursor = (self.cursor + 1) % self.servers.len();
        }
    }

    /// Number of known servers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.servers.len()
    }

    /// Whether no servers are known.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }
}
