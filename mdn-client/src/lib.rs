//! Client library.
//!
//! A [`Client`] talks to the transaction-manager fleet over a message bus.
//! Requests are pending operations that retry against the next server from
//! the selector on disruption or timeout; transactional work goes through
//! a [`transaction::TxHandle`].

pub mod pending;
pub mod selector;
pub mod transaction;

#[cfg(test)]
mod client_tests;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use mdn_bus::{BusEvent, MessageBus};
use mdn_common::error::{MdnError, MdnResult, ReturnCode};
use mdn_common::ids::{CommId, PaxosGroupId, TransactionGroup, TransactionId};
use mdn_wire::{LockAction, LockKind, Message};
use rand::RngCore;

use pending::{OpAnswer, PendingOp};
use selector::ServerSelector;
use transaction::TxHandle;

/// Client tunables.
#[derive(Debug, Clone, Copy)]
pub struct ClientOptions {
    /// How long to wait on one server before failing over.
    pub attempt_timeout: Duration,
    /// Total attempts across servers before giving up.
    pub max_attempts: usize,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            attempt_timeout: Duration::from_secs(1),
            max_attempts: 8,
        }
    }
}

/// One client endpoint on the fabric.
pub struct Client {
    bus: Arc<dyn MessageBus>,
    selector: Mutex<ServerSelector>,
    next_nonce: AtomicU64,
    options: ClientOptions,
}

impl Client {
    /// Creates a client over `bus` targeting the given transaction
    /// managers.
    #[must_use]
    pub fn new(bus: Arc<dyn MessageBus>, servers: Vec<CommId>, options: ClientOptions) -> Self {
        Self {
            bus,
            selector: Mutex::new(ServerSelector::new(servers)),
            next_nonce: AtomicU64::new(1),
            options,
        }
    }

    fn allocate_nonce(&self) -> u64 {
        self.next_nonce.fetch_add(1, Ordering::AcqRel)
    }

    /// Reads outside any transaction: the newest committed version at or
    /// below `timestamp`.
    ///
    /// # Errors
    ///
    /// Returns `MdnError::Disrupted` when no server answers within the
    /// attempt budget.
    pub fn unsafe_read(
        &self,
        table: &[u8],
        key: &[u8],
        timestamp: u64,
    ) -> MdnResult<OpAnswer> {
        let nonce = self.allocate_nonce();
        self.run_pending(PendingOp::new(
            nonce,
            Message::UnsafeRead {
                nonce,
                table: table.to_vec(),
                key: key.to_vec(),
                timestamp,
            },
            "unsafe_read",
        ))
    }

    /// Writes outside any transaction at `timestamp`.
    ///
    /// # Errors
    ///
    /// Returns `MdnError::Disrupted` when no server answers within the
    /// attempt budget.
    pub fn unsafe_write(
        &self,
        table: &[u8],
        key: &[u8],
        timestamp: u64,
        value: &[u8],
    ) -> MdnResult<ReturnCode> {
        let nonce = self.allocate_nonce();
        self.run_pending(PendingOp::new(
            nonce,
            Message::UnsafeWrite {
                nonce,
                table: table.to_vec(),
                key: key.to_vec(),
                timestamp,
                value: value.to_vec(),
            },
            "unsafe_write",
        ))
        .map(|answer| answer.rc)
    }

    /// Lock CAS outside any transaction.
    ///
    /// # Errors
    ///
    /// Returns `MdnError::Disrupted` when no server answers within the
    /// attempt budget.
    pub fn unsafe_lock_op(
        &self,
        table: &[u8],
        key: &[u8],
        txid: TransactionId,
        kind: LockKind,
        action: LockAction,
    ) -> MdnResult<ReturnCode> {
        let nonce = self.allocate_nonce();
        self.run_pending(PendingOp::new(
            nonce,
            Message::UnsafeLockOp {
                nonce,
                table: table.to_vec(),
                key: key.to_vec(),
                txid,
                kind,
                action,
            },
            "unsafe_lock_op",
        ))
        .map(|answer| answer.rc)
    }

    /// Starts a transaction hosted by `group`, with `timestamp` as the
    /// commit-timestamp candidate and `dcs` as the global-vote quorum.
    ///
    /// # Errors
    ///
    /// Returns `MdnError::Disrupted` when the begin goes unanswered and
    /// `MdnError::InvalidState` when a server refuses it.
    pub fn begin_transaction(
        &self,
        timestamp: u64,
        group: PaxosGroupId,
        dcs: Vec<PaxosGroupId>,
    ) -> MdnResult<TxHandle<'_>> {
        let txid = TransactionId::new(rand::thread_rng().next_u64());
        let tg = TransactionGroup::new(txid, group);
        let nonce = self.allocate_nonce();
        let answer = self.run_pending(PendingOp::new(
            nonce,
            Message::TxBegin {
                tg,
                nonce,
                timestamp,
                members: Vec::new(),
                dcs,
            },
            "begin",
        ))?;
        if !answer.rc.is_success() {
            return Err(MdnError::InvalidState("transaction begin was refused"));
        }
        Ok(TxHandle::new(self, tg))
    }

    pub(crate) fn run_transaction_op(&self, build: impl Fn(u64) -> Message, label: &'static str) -> MdnResult<OpAnswer> {
        let nonce = self.allocate_nonce();
        self.run_pending(PendingOp::new(nonce, build(nonce), label))
    }

    fn run_pending(&self, pending: PendingOp) -> MdnResult<OpAnswer> {
        let mut attempts = 0_usize;
        loop {
            if attempts >= self.options.max_attempts {
                return Err(MdnError::Disrupted(format!(
                    "{} exhausted its retry budget",
                    pending.describe()
                )));
            }
            attempts += 1;

            let Some(server) = self
                .selector
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .current()
            else {
                return Err(MdnError::InvalidState("no transaction managers are known"));
            };
            let payload = pending.request().encode()?;
            if let Err(error) = self.bus.send(server, payload) {
                log::debug!("{}: send to {server} failed: {error}", pending.describe());
                self.fail_over();
                continue;
            }

            match self.await_answer(&pending, server) {
                Some(answer) => return Ok(answer),
                None => self.fail_over(),
            }
        }
    }

    fn fail_over(&self) {
        self.selector
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .advance();
    }

    /// Waits out one attempt window for a matching response. `None` means
    /// the attempt failed and the caller should fail over.
    fn await_answer(&self, pending: &PendingOp, server: CommId) -> Option<OpAnswer> {
        let deadline = Instant::now() + self.options.attempt_timeout;
        loop {
            let now = Instant::now();
            if now >= deadline {
                log::debug!("{}: attempt against {server} timed out", pending.describe());
                return None;
            }
            match self.bus.recv(deadline - now) {
                BusEvent::Timeout => {}
                BusEvent::Shutdown => return None,
                BusEvent::Disrupted { peer } => {
                    if peer == server {
                        log::debug!("{}: server {server} disrupted", pending.describe());
                        return None;
                    }
                }
                BusEvent::Message { payload, .. } => match Message::decode(&payload) {
                    Ok(message) => {
                        if let Some(answer) = pending.match_response(&message) {
                            return Some(answer);
                        }
                        log::debug!("{}: ignoring unrelated frame", pending.describe());
                    }
                    Err(error) => log::warn!("dropping corrupt response: {error}"),
                },
            }
        }
    }
}
