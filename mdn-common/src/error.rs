//! Shared error model for cross-crate APIs.

use thiserror::Error;

/// Unified result type used by all public interfaces in `meridian`.
pub type MdnResult<T> = Result<T, MdnError>;

/// High-level error categories shared across the workspace.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MdnError {
    /// Configuration is invalid for the requested operation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    /// Runtime state does not allow this operation.
    #[error("invalid runtime state: {0}")]
    InvalidState(&'static str),

    /// Wire payload is malformed or semantically invalid.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Peer connection was reset or dropped mid-stream.
    #[error("communication disrupted: {0}")]
    Disrupted(String),

    /// Filesystem or socket I/O failed.
    #[error("io error: {0}")]
    Io(String),
}

/// Protocol-visible outcome of one operation.
///
/// Return codes travel on the wire as `u16` and must stay stable across
/// releases; new codes are appended, never renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReturnCode {
    /// Operation applied.
    Success,
    /// No value at or below the requested timestamp.
    NotFound,
    /// Transaction reached the aborted state.
    Aborted,
    /// Transaction reached the committed state.
    Committed,
    /// Uninitialized sentinel; never a valid final answer.
    Garbage,
    /// Transport-level disruption while the operation was in flight.
    Disrupted,
    /// Daemon is shutting down.
    Shutdown,
    /// Payload failed to decode.
    Corrupt,
    /// Local data layer reported a failure.
    StorageError,
}

impl ReturnCode {
    /// Stable wire tag for this code.
    #[must_use]
    pub const fn to_wire(self) -> u16 {
        match self {
            Self::Success => 0,
            Self::NotFound => 1,
            Self::Aborted => 2,
            Self::Committed => 3,
            Self::Garbage => 4,
            Self::Disrupted => 5,
            Self::Shutdown => 6,
            Self::Corrupt => 7,
            Self::StorageError => 8,
        }
    }

    /// Decodes a wire tag.
    #[must_use]
    pub const fn from_wire(tag: u16) -> Option<Self> {
        match tag {
            0 => Some(Self::Success),
            1 => Some(Self::NotFound),
            2 => Some(Self::Aborted),
            3 => Some(Self::Committed),
            4 => Some(Self::Garbage),
            5 => Some(Self::Disrupted),
            6 => Some(Self::Shutdown),
            7 => Some(Self::Corrupt),
            8 => Some(Self::StorageError),
            _ => None,
        }
    }

    /// Whether this code reports a completed, applied operation.
    #[must_use]
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }
}

impl std::fmt::Display for ReturnCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Success => "SUCCESS",
            Self::NotFound => "NOT_FOUND",
            Self::Aborted => "ABORTED",
            Self::Committed => "COMMITTED",
            Self::Garbage => "GARBAGE",
            Self::Disrupted => "DISRUPTED",
            Self::Shutdown => "SHUTDOWN",
            Self::Corrupt => "CORRUPT",
            Self::StorageError => "STORAGE_ERROR",
        };
        f.write_str(label)
    }
}

#[cfg(test)]
mod tests {
    use super::ReturnCode;
    use googletest::prelude::*;
    use rstest::rstest;

    #[rstest]
    #[case(ReturnCode::Success)]
    #[case(ReturnCode::NotFound)]
    #[case(ReturnCode::Aborted)]
    #[case(ReturnCode::Committed)]
    #[case(ReturnCode::Garbage)]
    #[case(ReturnCode::Disrupted)]
    #[case(ReturnCode::Shutdown)]
    #[case(ReturnCode::Corrupt)]
    #[case(ReturnCode::StorageError)]
    fn return_code_wire_round_trip(#[case] code: ReturnCode) {
        assert_that!(ReturnCode::from_wire(code.to_wire()), eq(Some(code)));
    }

    #[rstest]
    fn unknown_wire_tag_is_rejected() {
        assert_that!(ReturnCode::from_wire(999), eq(None));
    }
}
