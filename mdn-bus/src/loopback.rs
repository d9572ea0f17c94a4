//! In-process bus for multi-daemon tests.
//!
//! A [`LoopbackNetwork`] is a hub of per-node queues. Every registered node
//! gets a [`LoopbackBus`] endpoint whose `send` enqueues directly into the
//! destination's queue. Nodes can be silenced to model crashed or
//! partitioned replicas.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use mdn_common::error::{MdnError, MdnResult};
use mdn_common::ids::CommId;

use crate::{BusEvent, MessageBus};

#[derive(Debug, Default)]
struct HubState {
    queues: HashMap<CommId, Sender<BusEvent>>,
    silenced: HashSet<CommId>,
}

/// Hub connecting every in-process endpoint.
#[derive(Debug, Clone, Default)]
pub struct LoopbackNetwork {
    state: Arc<Mutex<HubState>>,
}

impl LoopbackNetwork {
    /// Creates an empty hub.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers one node and returns its endpoint.
    #[must_use]
    pub fn register(&self, id: CommId) -> LoopbackBus {
        let (sender, receiver) = unbounded();
        let mut state = self.lock_state();
        let _ = state.queues.insert(id, sender);
        drop(state);
        LoopbackBus {
            id,
            network: self.clone(),
            receiver,
        }
    }

    /// Silences a node: frames addressed to it vanish, modeling a crashed
    /// or partitioned replica.
    pub fn silence(&self, id: CommId) {
        let _ = self.lock_state().silenced.insert(id);
    }

    /// Lifts a silence.
    pub fn unsilence(&self, id: CommId) {
        let _ = self.lock_state().silenced.remove(&id);
    }

    fn deliver(&self, from: CommId, to: CommId, payload: Vec<u8>) -> MdnResult<()> {
        let state = self.lock_state();
        if state.silenced.contains(&to) {
            // Silently dropped, like an unacknowledged datagram to a dead
            // host; the sender learns nothing until a later disruption.
            return Ok(());
        }
        let Some(queue) = state.queues.get(&to) else {
            return Err(MdnError::Disrupted(format!("unknown peer {to}")));
        };
        queue
            .send(BusEvent::Message { from, payload })
            .map_err(|_| MdnError::Disrupted(format!("peer {to} has shut down")))
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, HubState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// One node's endpoint on a [`LoopbackNetwork`].
#[derive(Debug)]
pub struct LoopbackBus {
    id: CommId,
    network: LoopbackNetwork,
    receiver: Receiver<BusEvent>,
}

impl LoopbackBus {
    /// This endpoint's node id.
    #[must_use]
    pub fn id(&self) -> CommId {
        self.id
    }

    /// Injects a disruption notice for `peer` into this endpoint's queue.
    pub fn inject_disruption(&self, peer: CommId) {
        let state = self.network.lock_state();
        if let Some(queue) = state.queues.get(&self.id) {
            let _ = queue.send(BusEvent::Disrupted { peer });
        }
    }
}

impl MessageBus for LoopbackBus {
    fn send(&self, to: CommId, payload: Vec<u8>) -> MdnResult<()> {
        self.network.deliver(self.id, to, payload)
    }

    fn recv(&self, timeout: Duration) -> BusEvent {
        match self.receiver.recv_timeout(timeout) {
            Ok(event) => event,
            Err(RecvTimeoutError::Timeout) => BusEvent::Timeout,
            Err(RecvTimeoutError::Disconnected) => BusEvent::Shutdown,
        }
    }

    fn shutdown(&self) {
        let mut state = self.network.lock_state();
        let _ = state.queues.remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::LoopbackNetwork;
    use crate::{BusEvent, MessageBus};
    use googletest::prelude::*;
    use mdn_common::ids::CommId;
    use rstest::rstest;
    use std::time::Duration;

    const TICK: Duration = Duration::from_millis(50);

    #[rstest]
    fn frames_arrive_with_sender_identity() {
        let network = LoopbackNetwork::new();
        let alpha = network.register(CommId::new(1));
        let beta = network.register(CommId::new(2));

        alpha
            .send(CommId::new(2), b"ping".to_vec())
            .expect("send should succeed");
        let event = beta.recv(TICK);
        assert_that!(
            event,
            eq(&BusEvent::Message {
                from: CommId::new(1),
                payload: b"ping".to_vec(),
            })
        );
    }

    #[rstest]
    fn unknown_peer_is_a_disruption() {
        let network = LoopbackNetwork::new();
        let alpha = network.register(CommId::new(1));
        assert_that!(alpha.send(CommId::new(9), Vec::new()).is_err(), eq(true));
    }

    #[rstest]
    fn silenced_peer_swallows_frames() {
        let network = LoopbackNetwork::new();
        let alpha = network.register(CommId::new(1));
        let beta = network.register(CommId::new(2));

        network.silence(CommId::new(2));
        alpha
            .send(CommId::new(2), b"lost".to_vec())
            .expect("send should succeed silently");
        assert_that!(beta.recv(TICK), eq(&BusEvent::Timeout));

        network.unsilence(CommId::new(2));
        alpha
            .send(CommId::new(2), b"found".to_vec())
            .expect("send should succeed");
        assert_that!(
            beta.recv(TICK),
            eq(&BusEvent::Message {
                from: CommId::new(1),
                payload: b"found".to_vec(),
            })
        );
    }

    #[rstest]
    fn shutdown_unblocks_receivers() {
        let network = LoopbackNetwork::new();
        let alpha = network.register(CommId::new(1));
        alpha.shutdown();
        assert_that!(alpha.recv(TICK), eq(&BusEvent::Shutdown));
    }
}
