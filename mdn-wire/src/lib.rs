//! Wire protocol for the meridian fabric.
//!
//! Every message is `[u16 message type | payload]` inside a length-prefixed
//! bus frame. Integers are fixed-width big-endian; byte slices are
//! `u32 length | bytes`; identifiers travel as single u64 values.

pub mod codec;
pub mod log_entry;
pub mod message;

pub use codec::WireCursor;
pub use log_entry::{LogEntry, VoteOutcome};
pub use message::{LockAction, LockKind, Message, MessageType, WRITE_TOMBSTONE};
