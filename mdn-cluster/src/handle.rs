//! Atomic configuration publication.

use std::sync::{Arc, PoisonError, RwLock};

use mdn_bus::EndpointMapper;
use mdn_common::ids::{CommId, VersionId};

use crate::config::Configuration;

/// Shared handle through which one daemon publishes and reads the current
/// configuration snapshot.
///
/// Readers clone the inner `Arc` and keep it for the duration of a single
/// operation; the snapshot itself is immutable. Installation is monotone:
/// a snapshot whose version is not newer than the current one is ignored.
#[derive(Debug, Default)]
pub struct ConfigHandle {
    current: RwLock<Arc<Configuration>>,
}

impl ConfigHandle {
    /// Creates a handle holding the empty, version-zero snapshot.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the current snapshot.
    #[must_use]
    pub fn snapshot(&self) -> Arc<Configuration> {
        Arc::clone(
            &self
                .current
                .read()
                .unwrap_or_else(PoisonError::into_inner),
        )
    }

    /// Current snapshot version.
    #[must_use]
    pub fn version(&self) -> VersionId {
        self.snapshot().version()
    }

    /// Installs a newer snapshot. Returns whether the snapshot was adopted.
    pub fn install(&self, next: Arc<Configuration>) -> bool {
        let mut current = self
            .current
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if next.version() <= current.version() {
            return false;
        }
        *current = next;
        true
    }
}

/// Endpoint mapper answering from the current configuration snapshot.
///
/// Because lookups happen at (re)connection time, installing a new
/// configuration transparently redirects the next dial for a moved node.
#[derive(Debug, Clone)]
pub struct ConfigEndpointMapper {
    handle: Arc<ConfigHandle>,
}

impl ConfigEndpointMapper {
    /// Wraps one shared configuration handle.
    #[must_use]
    pub fn new(handle: Arc<ConfigHandle>) -> Self {
        Self { handle }
    }
}

impl EndpointMapper for ConfigEndpointMapper {
    fn lookup(&self, id: CommId) -> Option<String> {
        self.handle
            .snapshot()
            .get_address(id)
            .map(str::to_owned)
    }
}
