//! Abstract coordinator link.
//!
//! The coordinator service itself is an external collaborator; daemons only
//! need a way to pull the next configuration blob and to learn about server
//! failures. [`StaticConfigSource`] serves pre-baked blobs for tests and
//! single-box bring-up.

use std::collections::VecDeque;
use std::io::Read;
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use mdn_common::error::MdnResult;
use mdn_common::ids::CommId;

/// Pull-based source of configuration blobs and failure notifications.
pub trait ConfigSource: Send {
    /// Returns the next configuration blob when one is available.
    ///
    /// # Errors
    ///
    /// Returns `MdnError::Disrupted` when the coordinator link is lost and
    /// should be re-established.
    fn poll(&mut self) -> MdnResult<Option<Vec<u8>>>;

    /// Drains server-failure notifications observed since the last call.
    /// The daemon's coordinator loop feeds these into its failure tracker
    /// so unreachable members drop out of leader rotation.
    fn take_failures(&mut self) -> Vec<CommId> {
        Vec::new()
    }
}

/// Config source answering from a fixed queue of blobs, with injectable
/// failure notifications.
#[derive(Debug, Default)]
pub struct StaticConfigSource {
    blobs: Mutex<VecDeque<Vec<u8>>>,
    failures: Mutex<Vec<CommId>>,
}

impl StaticConfigSource {
    /// Creates an empty source.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a source pre-loaded with blobs served in order.
    #[must_use]
    pub fn with_blobs(blobs: Vec<Vec<u8>>) -> Self {
        Self {
            blobs: Mutex::new(blobs.into()),
            failures: Mutex::new(Vec::new()),
        }
    }

    /// Queues one more blob.
    pub fn push(&self, blob: Vec<u8>) {
        self.blobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(blob);
    }

    /// Queues one server-failure notification.
    pub fn push_failure(&self, id: CommId) {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(id);
    }
}

impl ConfigSource for StaticConfigSource {
    fn poll(&mut self) -> MdnResult<Option<Vec<u8>>> {
        Ok(self
            .blobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front())
    }

    fn take_failures(&mut self) -> Vec<CommId> {
        std::mem::take(
            &mut *self
                .failures
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        )
    }
}

const COORDINATOR_READ_TIMEOUT: Duration = Duration::from_millis(250);
const MAX_CONFIG_BLOB_BYTES: usize = 16 * 1024 * 1024;

/// Frame kind for a configuration blob.
const FRAME_CONFIGURATION: u8 = 1;
/// Frame kind for a server-failure notification.
const FRAME_SERVER_FAILURE: u8 = 2;

/// Config source pulling kind-tagged frames from a coordinator endpoint.
///
/// The coordinator pushes `u32 length | u8 kind | body` frames down a
/// plain TCP stream: kind 1 carries a configuration blob, kind 2 an eight
/// byte server-failure notification. A lost connection is re-dialed on the
/// next poll; a daemon keeps its current snapshot in the meantime.
#[derive(Debug)]
pub struct TcpConfigSource {
    rendezvous: String,
    stream: Option<TcpStream>,
    pending: Vec<u8>,
    failures: Vec<CommId>,
}

impl TcpConfigSource {
    /// Creates a source dialing `rendezvous` (`host:port`).
    #[must_use]
    pub fn new(rendezvous: String) -> Self {
        Self {
            rendezvous,
            stream: None,
            pending: Vec::new(),
            failures: Vec::new(),
        }
    }

    fn ensure_connected(&mut self) -> Option<&mut TcpStream> {
        if self.stream.is_none() {
            let addr = self
                .rendezvous
                .to_socket_addrs()
                .ok()
                .and_then(|mut addrs| addrs.next())?;
            let stream = TcpStream::connect_timeout(&addr, COORDINATOR_READ_TIMEOUT).ok()?;
            let _ = stream.set_read_timeout(Some(COORDINATOR_READ_TIMEOUT));
            self.pending.clear();
            self.stream = Some(stream);
            log::info!("connected to coordinator at {}", self.rendezvous);
        }
        self.stream.as_mut()
    }

    /// Consumes complete frames from the receive buffer. Failure frames
    /// are absorbed into the failure queue; the first configuration blob
    /// is returned.
    fn take_complete_blob(&mut self) -> Option<Vec<u8>> {
        loop {
            if self.pending.len() < 4 {
                return None;
            }
            let mut len_bytes = [0_u8; 4];
            len_bytes.copy_from_slice(&self.pending[..4]);
            let frame_len = usize::try_from(u32::from_be_bytes(len_bytes)).ok()?;
            if frame_len == 0 || frame_len > MAX_CONFIG_BLOB_BYTES {
                log::warn!("coordinator sent a malformed frame; dropping the link");
                self.stream = None;
                self.pending.clear();
                return None;
            }
            if self.pending.len() < 4 + frame_len {
                return None;
            }
            let frame = self.pending[4..4 + frame_len].to_vec();
            let _ = self.pending.drain(..4 + frame_len);

            match frame[0] {
                FRAME_CONFIGURATION => return Some(frame[1..].to_vec()),
                FRAME_SERVER_FAILURE => {
                    if frame.len() == 9 {
                        let mut id_bytes = [0_u8; 8];
                        id_bytes.copy_from_slice(&frame[1..9]);
                        self.failures.push(CommId::new(u64::from_be_bytes(id_bytes)));
                    } else {
                        log::warn!("dropping malformed server-failure frame");
                    }
                }
                kind => {
                    log::warn!("dropping coordinator frame with unknown kind {kind}");
                }
            }
        }
    }
}

impl ConfigSource for TcpConfigSource {
    fn poll(&mut self) -> MdnResult<Option<Vec<u8>>> {
        if let Some(blob) = self.take_complete_blob() {
            return Ok(Some(blob));
        }
        let Some(stream) = self.ensure_connected() else {
            return Ok(None);
        };

        let mut chunk = [0_u8; 4096];
        match stream.read(&mut chunk) {
            Ok(0) => {
                self.stream = None;
                Ok(None)
            }
            Ok(read_len) => {
                self.pending.extend_from_slice(&chunk[..read_len]);
                Ok(self.take_complete_blob())
            }
            Err(error)
                if error.kind() == std::io::ErrorKind::WouldBlock
                    || error.kind() == std::io::ErrorKind::TimedOut =>
            {
                Ok(None)
            }
            Err(error) => {
                log::warn!("coordinator link failed: {error}; will re-dial");
                self.stream = None;
                Ok(None)
            }
        }
    }

    fn take_failures(&mut self) -> Vec<CommId> {
        std::mem::take(&mut self.failures)
    }
}

#[cfg(test)]
mod tests {
    use super::{ConfigSource, StaticConfigSource, TcpConfigSource};
    use googletest::prelude::*;
    use mdn_common::ids::CommId;
    use rstest::rstest;
    use std::io::Write;

    #[rstest]
    fn static_source_serves_blobs_in_order() {
        let mut source =
            StaticConfigSource::with_blobs(vec![b"first".to_vec(), b"second".to_vec()]);
        assert_that!(
            source.poll().expect("poll should succeed"),
            eq(&Some(b"first".to_vec()))
        );
        assert_that!(
            source.poll().expect("poll should succeed"),
            eq(&Some(b"second".to_vec()))
        );
        assert_that!(source.poll().expect("poll should succeed"), eq(&None));
    }

    #[rstest]
    fn static_source_drains_injected_failures() {
        let mut source = StaticConfigSource::new();
        source.push_failure(CommId::new(7));
        source.push_failure(CommId::new(8));

        assert_that!(
            &source.take_failures(),
            eq(&vec![CommId::new(7), CommId::new(8)])
        );
        assert_that!(source.take_failures().is_empty(), eq(true));
    }

    fn frame(kind: u8, body: &[u8]) -> Vec<u8> {
        let mut output = Vec::new();
        let len = u32::try_from(body.len() + 1).expect("test frame must fit");
        output.extend_from_slice(&len.to_be_bytes());
        output.push(kind);
        output.extend_from_slice(body);
        output
    }

    #[rstest]
    fn tcp_source_separates_configs_from_failure_notices() {
        let listener =
            std::net::TcpListener::bind("127.0.0.1:0").expect("listener should bind");
        let addr = listener.local_addr().expect("listener must have an address");

        let writer = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().expect("coordinator accept");
            let mut payload = frame(super::FRAME_SERVER_FAILURE, &9_u64.to_be_bytes());
            payload.extend_from_slice(&frame(super::FRAME_CONFIGURATION, b"config-blob"));
            stream.write_all(&payload).expect("coordinator write");
        });

        let mut source = TcpConfigSource::new(addr.to_string());
        let mut blob = None;
        for _ in 0..50 {
            blob = source.poll().expect("poll should succeed");
            if blob.is_some() {
                break;
            }
        }
        writer.join().expect("coordinator thread must finish");

        assert_that!(blob, eq(&Some(b"config-blob".to_vec())));
        assert_that!(&source.take_failures(), eq(&vec![CommId::new(9)]));
    }
}
