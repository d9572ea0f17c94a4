//! Client-side transaction handle.

use mdn_common::error::{MdnResult, ReturnCode};
use mdn_common::ids::TransactionGroup;
use mdn_wire::Message;

use crate::pending::OpAnswer;
use crate::Client;

/// Handle to one open transaction.
///
/// Operation seqnos are assigned densely from zero; commit and abort use
/// the next seqno as the end-of-log marker, matching the server's log
/// layout.
pub struct TxHandle<'a> {
    client: &'a Client,
    tg: TransactionGroup,
    next_seqno: u64,
    finished: bool,
}

impl<'a> TxHandle<'a> {
    pub(crate) fn new(client: &'a Client, tg: TransactionGroup) -> Self {
        Self {
            client,
            tg,
            next_seqno: 0,
            finished: false,
        }
    }

    /// The transaction's identity.
    #[must_use]
    pub fn tg(&self) -> TransactionGroup {
        self.tg
    }

    /// Reads `(table, key)` within the transaction.
    ///
    /// # Errors
    ///
    /// Returns `MdnError::Disrupted` when no server answers within the
    /// attempt budget.
    pub fn read(&mut self, table: &[u8], key: &[u8]) -> MdnResult<OpAnswer> {
        let tg = self.tg;
        let seqno = self.take_seqno();
        let table = table.to_vec();
        let key = key.to_vec();
        self.client.run_transaction_op(
            move |nonce| Message::TxRead {
                tg,
                nonce,
                seqno,
                table: table.clone(),
                key: key.clone(),
            },
            "tx_read",
        )
    }

    /// Writes `(table, key) = value` within the transaction.
    ///
    /// # Errors
    ///
    /// Returns `MdnError::Disrupted` when no server answers within the
    /// attempt budget.
    pub fn write(&mut self, table: &[u8], key: &[u8], value: &[u8]) -> MdnResult<ReturnCode> {
        let tg = self.tg;
        let seqno = self.take_seqno();
        let table = table.to_vec();
        let key = key.to_vec();
        let value = value.to_vec();
        self.client
            .run_transaction_op(
                move |nonce| Message::TxWrite {
                    tg,
                    nonce,
                    seqno,
                    table: table.clone(),
                    key: key.clone(),
                    value: value.clone(),
                },
                "tx_write",
            )
            .map(|answer| answer.rc)
    }

    /// Requests commit. `Committed` or `Aborted` is the cluster's verdict.
    ///
    /// # Errors
    ///
    /// Returns `MdnError::Disrupted` when no server answers within the
    /// attempt budget.
    pub fn commit(mut self) -> MdnResult<ReturnCode> {
        self.finished = true;
        let tg = self.tg;
        let seqno = self.next_seqno;
        self.client
            .run_transaction_op(
                move |nonce| Message::TxCommit { tg, nonce, seqno },
                "tx_commit",
            )
            .map(|answer| answer.rc)
    }

    /// Requests abort; idempotent on the server side.
    ///
    /// # Errors
    ///
    /// Returns `MdnError::Disrupted` when no server answers within the
    /// attempt budget.
    pub fn abort(mut self) -> MdnResult<ReturnCode> {
        self.finished = true;
        let tg = self.tg;
        let seqno = self.next_seqno;
        self.client
            .run_transaction_op(
                move |nonce| Message::TxAbort { tg, nonce, seqno },
                "tx_abort",
            )
            .map(|answer| answer.rc)
    }

    fn take_seqno(&mut self) -> u64 {
        let seqno = self.next_seqno;
        self.next_seqno += 1;
        seqno
    }
}

impl Drop for TxHandle<'_> {
    fn drop(&mut self) {
        if !self.finished {
            log::debug!("transaction {} dropped without commit or abort", self.tg);
        }
    }
}
