//! Pending client operations.
//!
//! One pending op owns a request frame and its nonce and survives server
//! failover: a disruption or attempt timeout re-targets the request at the
//! next server from the selector.

use mdn_common::error::ReturnCode;
use mdn_wire::Message;

/// Answer extracted from a `CLIENT_RESPONSE`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpAnswer {
    /// Outcome code.
    pub rc: ReturnCode,
    /// Read timestamp (zero for non-reads).
    pub timestamp: u64,
    /// Read value (empty for non-reads).
    pub value: Vec<u8>,
}

/// One in-flight client operation.
#[derive(Debug, Clone)]
pub struct PendingOp {
    nonce: u64,
    request: Message,
    description: &'static str,
}

impl PendingOp {
    /// Wraps one request frame under its nonce.
    #[must_use]
    pub fn new(nonce: u64, request: Message, description: &'static str) -> Self {
        Self {
            nonce,
            request,
            description,
        }
    }

    /// The request nonce responses must echo.
    #[must_use]
    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    /// The request frame, re-sent verbatim on failover.
    #[must_use]
    pub fn request(&self) -> &Message {
        &self.request
    }

    /// Human-readable label for logging.
    #[must_use]
    pub fn describe(&self) -> &'static str {
        self.description
    }

    /// Matches a decoded response against this op. Returns the answer when
    /// the nonce matches.
    #[must_use]
    pub fn match_response(&self, message: &Message) -> Option<OpAnswer> {
        let Message::ClientResponse {
            nonce,
            rc,
            timestamp,
            value,
        } = message
        else {
            return None;
        };
        if *nonce != self.nonce {
            return None;
        }
        Some(OpAnswer {
            rc: *rc,
            timestamp: *timestamp,
            value: value.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::PendingOp;
    use googletest::prelude::*;
    use mdn_common::error::ReturnCode;
    use mdn_wire::Message;
    use rstest::rstest;

    fn pending() -> PendingOp {
        PendingOp::new(
            42,
            Message::UnsafeRead {
                nonce: 42,
                table: b"t".to_vec(),
                key: b"k".to_vec(),
                timestamp: u64::MAX,
            },
            "unsafe_read",
        )
    }

    #[rstest]
    fn matching_nonce_yields_the_answer() {
        let op = pending();
        let answer = op.match_response(&Message::ClientResponse {
            nonce: 42,
            rc: ReturnCode::Success,
            timestamp: 7,
            value: b"x".to_vec(),
        });
        let answer = answer.expect("nonce must match");
        assert_that!(answer.rc, eq(ReturnCode::Success));
        assert_that!(answer.timestamp, eq(7_u64));
        assert_that!(&answer.value, eq(&b"x".to_vec()));
    }

    #[rstest]
    fn foreign_nonce_is_ignored() {
        let op = pending();
        assert_that!(
            op.match_response(&Message::ClientResponse {
                nonce: 43,
                rc: ReturnCode::Success,
                timestamp: 0,
                value: Vec::new(),
            })
            .is_none(),
            eq(true)
        );
    }

    #[rstest]
    fn non_response_frames_are_ignored() {
        let op = pending();
        assert_that!(op.match_response(&Message::Nop).is_none(), eq(true));
    }
}
