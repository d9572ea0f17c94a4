//! TCP message bus.
//!
//! One I/O thread owns the poller, the listener, and every connection;
//! worker threads talk to it through a command channel and a waker. Frames
//! are `u32 length | body`. The first frame on any connection is a hello
//! carrying the sender's node id, so inbound deliveries always resolve to a
//! peer identity.

use std::collections::HashMap;
use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use mdn_common::error::{MdnError, MdnResult};
use mdn_common::ids::CommId;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};

use crate::{BusEvent, EndpointMapper, MessageBus};

const LISTENER_TOKEN: Token = Token(0);
const WAKER_TOKEN: Token = Token(1);
const CONNECTION_TOKEN_START: usize = 2;
const READ_CHUNK_BYTES: usize = 8192;
const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;
const IO_POLL_TIMEOUT: Duration = Duration::from_millis(50);

/// Endpoint mapper answering from a fixed table.
#[derive(Debug, Default)]
pub struct StaticEndpointMapper {
    endpoints: Mutex<HashMap<CommId, String>>,
}

impl StaticEndpointMapper {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces one mapping.
    pub fn insert(&self, id: CommId, endpoint: String) {
        let _ = self
            .endpoints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, endpoint);
    }
}

impl EndpointMapper for StaticEndpointMapper {
    fn lookup(&self, id: CommId) -> Option<String> {
        self.endpoints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }
}

#[derive(Debug)]
enum BusCommand {
    Send { to: CommId, payload: Vec<u8> },
    Shutdown,
}

/// TCP implementation of [`MessageBus`].
pub struct TcpBus {
    local_id: CommId,
    local_addr: SocketAddr,
    commands: Sender<BusCommand>,
    events: Receiver<BusEvent>,
    waker: Arc<Waker>,
    shut_down: Arc<AtomicBool>,
    io_thread: Mutex<Option<JoinHandle<()>>>,
}

impl TcpBus {
    /// Binds a listener and starts the I/O thread.
    ///
    /// # Errors
    ///
    /// Returns `MdnError::Io` when the bind, poller setup, or thread spawn
    /// fails.
    pub fn bind(
        local_id: CommId,
        listen: &str,
        mapper: Arc<dyn EndpointMapper>,
    ) -> MdnResult<Self> {
        let addr = resolve_endpoint(listen)?;
        let mut listener = TcpListener::bind(addr)
            .map_err(|error| MdnError::Io(format!("bind bus listener failed: {error}")))?;
        let local_addr = listener
            .local_addr()
            .map_err(|error| MdnError::Io(format!("query bus listener address failed: {error}")))?;

        let poll =
            Poll::new().map_err(|error| MdnError::Io(format!("create poll failed: {error}")))?;
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)
            .map_err(|error| MdnError::Io(format!("register bus listener failed: {error}")))?;
        let waker = Arc::new(
            Waker::new(poll.registry(), WAKER_TOKEN)
                .map_err(|error| MdnError::Io(format!("create bus waker failed: {error}")))?,
        );

        let (command_sender, command_receiver) = unbounded::<BusCommand>();
        let (event_sender, event_receiver) = unbounded::<BusEvent>();
        let shut_down = Arc::new(AtomicBool::new(false));

        let io_shut_down = Arc::clone(&shut_down);
        let io_thread = thread::Builder::new()
            .name("mdn-bus-io".to_owned())
            .spawn(move || {
                let mut io = BusIo {
                    local_id,
                    poll,
                    listener,
                    mapper,
                    commands: command_receiver,
                    events: event_sender,
                    connections: HashMap::new(),
                    peers: HashMap::new(),
                    next_token: CONNECTION_TOKEN_START,
                    shut_down: io_shut_down,
                };
                io.run();
            })
            .map_err(|error| MdnError::Io(format!("spawn bus io thread failed: {error}")))?;

        Ok(Self {
            local_id,
            local_addr,
            commands: command_sender,
            events: event_receiver,
            waker,
            shut_down,
            io_thread: Mutex::new(Some(io_thread)),
        })
    }

    /// This node's identity.
    #[must_use]
    pub fn local_id(&self) -> CommId {
        self.local_id
    }

    /// The bound listener address.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn wake_io(&self) {
        if let Err(error) = self.waker.wake() {
            log::warn!("bus waker failed: {error}");
        }
    }
}

impl MessageBus for TcpBus {
    fn send(&self, to: CommId, payload: Vec<u8>) -> MdnResult<()> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(MdnError::Disrupted("bus has shut down".to_owned()));
        }
        self.commands
            .send(BusCommand::Send { to, payload })
            .map_err(|_| MdnError::Disrupted("bus io thread has exited".to_owned()))?;
        self.wake_io();
        Ok(())
    }

    fn recv(&self, timeout: Duration) -> BusEvent {
        match self.events.recv_timeout(timeout) {
            Ok(event) => event,
            Err(RecvTimeoutError::Timeout) => BusEvent::Timeout,
            Err(RecvTimeoutError::Disconnected) => BusEvent::Shutdown,
        }
    }

    fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.commands.send(BusCommand::Shutdown);
        self.wake_io();
        let handle = self
            .io_thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

impl Drop for TcpBus {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn resolve_endpoint(endpoint: &str) -> MdnResult<SocketAddr> {
    endpoint
        .to_socket_addrs()
        .map_err(|error| MdnError::Io(format!("resolve endpoint {endpoint} failed: {error}")))?
        .next()
        .ok_or_else(|| MdnError::Io(format!("endpoint {endpoint} resolves to no address")))
}

struct Connection {
    socket: TcpStream,
    peer: Option<CommId>,
    read_buffer: Vec<u8>,
    write_buffer: Vec<u8>,
    interest: Interest,
    closed: bool,
}

impl Connection {
    fn new(socket: TcpStream) -> Self {
        Self {
            socket,
            peer: None,
            read_buffer: Vec::new(),
            write_buffer: Vec::new(),
            interest: Interest::READABLE,
            closed: false,
        }
    }

    fn queue_frame(&mut self, body: &[u8]) {
        let len = u32::try_from(body.len()).unwrap_or(u32::MAX);
        self.write_buffer.extend_from_slice(&len.to_be_bytes());
        self.write_buffer.extend_from_slice(body);
    }
}

struct BusIo {
    local_id: CommId,
    poll: Poll,
    listener: TcpListener,
    mapper: Arc<dyn EndpointMapper>,
    commands: Receiver<BusCommand>,
    events: Sender<BusEvent>,
    connections: HashMap<Token, Connection>,
    peers: HashMap<CommId, Token>,
    next_token: usize,
    shut_down: Arc<AtomicBool>,
}

impl BusIo {
    fn run(&mut self) {
        let mut poll_events = Events::with_capacity(256);
        loop {
            if let Err(error) = self.poll.poll(&mut poll_events, Some(IO_POLL_TIMEOUT)) {
                if error.kind() == ErrorKind::Interrupted {
                    continue;
                }
                // A failing poller is a structural invariant violation.
                log::error!("bus poll failed: {error}; exiting io thread");
                return;
            }

            let tokens = poll_events
                .iter()
                .map(|event| {
                    (
                        event.token(),
                        event.is_readable(),
                        event.is_writable(),
                        event.is_read_closed() || event.is_write_closed() || event.is_error(),
                    )
                })
                .collect::<Vec<_>>();

            for (token, readable, writable, closed) in tokens {
                match token {
                    LISTENER_TOKEN => self.accept_new_connections(),
                    WAKER_TOKEN => {}
                    _ => self.handle_connection_event(token, readable, writable, closed),
                }
            }

            if self.drain_commands() {
                return;
            }
        }
    }

    /// Returns true when the io thread should exit.
    fn drain_commands(&mut self) -> bool {
        loop {
            match self.commands.try_recv() {
                Ok(BusCommand::Send { to, payload }) => self.queue_send(to, &payload),
                Ok(BusCommand::Shutdown) | Err(TryRecvError::Disconnected) => {
                    self.shut_down.store(true, Ordering::Release);
                    return true;
                }
                Err(TryRecvError::Empty) => return false,
            }
        }
    }

    fn accept_new_connections(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((socket, _peer)) => {
                    let _ = socket.set_nodelay(true);
                    let token = self.allocate_token();
                    let mut connection = Connection::new(socket);
                    if self
                        .poll
                        .registry()
                        .register(&mut connection.socket, token, Interest::READABLE)
                        .is_err()
                    {
                        continue;
                    }
                    let _ = self.connections.insert(token, connection);
                }
                Err(error) if error.kind() == ErrorKind::WouldBlock => return,
                Err(error) => {
                    log::warn!("bus accept failed: {error}");
                    return;
                }
            }
        }
    }

    fn queue_send(&mut self, to: CommId, payload: &[u8]) {
        if payload.len() > MAX_FRAME_BYTES {
            log::warn!("dropping oversized frame for {to}");
            return;
        }

        let token = match self.peers.get(&to) {
            Some(token) => *token,
            None => match self.connect_to(to) {
                Some(token) => token,
                None => {
                    let _ = self.events.send(BusEvent::Disrupted { peer: to });
                    return;
                }
            },
        };

        let Some(connection) = self.connections.get_mut(&token) else {
            let _ = self.peers.remove(&to);
            let _ = self.events.send(BusEvent::Disrupted { peer: to });
            return;
        };
        connection.queue_frame(payload);
        self.flush_connection(token);
        self.refresh_interest(token);
    }

    fn connect_to(&mut self, to: CommId) -> Option<Token> {
        let endpoint = self.mapper.lookup(to)?;
        let addr = resolve_endpoint(&endpoint).ok()?;
        let socket = TcpStream::connect(addr).ok()?;
        let _ = socket.set_nodelay(true);

        let token = self.allocate_token();
        let mut connection = Connection::new(socket);
        connection.peer = Some(to);
        // The hello frame always leads so the acceptor can attribute every
        // later frame to this node.
        connection.queue_frame(&self.local_id.get().to_be_bytes());
        if self
            .poll
            .registry()
            .register(
                &mut connection.socket,
                token,
                Interest::READABLE | Interest::WRITABLE,
            )
            .is_err()
        {
            return None;
        }
        connection.interest = Interest::READABLE | Interest::WRITABLE;
        let _ = self.connections.insert(token, connection);
        let _ = self.peers.insert(to, token);
        Some(token)
    }

    fn handle_connection_event(
        &mut self,
        token: Token,
        readable: bool,
        writable: bool,
        closed: bool,
    ) {
        if closed {
            if let Some(connection) = self.connections.get_mut(&token) {
                connection.closed = true;
            }
        }
        if readable {
            self.read_connection(token);
        }
        if writable {
            self.flush_connection(token);
        }

        let should_close = self
            .connections
            .get(&token)
            .is_some_and(|connection| connection.closed);
        if should_close {
            self.close_connection(token);
        } else {
            self.refresh_interest(token);
        }
    }

    fn read_connection(&mut self, token: Token) {
        let mut chunk = [0_u8; READ_CHUNK_BYTES];
        loop {
            let Some(connection) = self.connections.get_mut(&token) else {
                return;
            };
            match connection.socket.read(&mut chunk) {
                Ok(0) => {
                    connection.closed = true;
                    break;
                }
                Ok(read_len) => {
                    connection.read_buffer.extend_from_slice(&chunk[..read_len]);
                }
                Err(error) if error.kind() == ErrorKind::WouldBlock => break,
                Err(error) if error.kind() == ErrorKind::Interrupted => {}
                Err(_error) => {
                    connection.closed = true;
                    break;
                }
            }
        }
        self.extract_frames(token);
    }

    fn extract_frames(&mut self, token: Token) {
        loop {
            let Some(connection) = self.connections.get_mut(&token) else {
                return;
            };
            if connection.read_buffer.len() < 4 {
                return;
            }
            let mut len_bytes = [0_u8; 4];
            len_bytes.copy_from_slice(&connection.read_buffer[..4]);
            let frame_len = usize::try_from(u32::from_be_bytes(len_bytes)).unwrap_or(usize::MAX);
            if frame_len > MAX_FRAME_BYTES {
                log::warn!("dropping connection with oversized frame");
                connection.closed = true;
                self.close_connection(token);
                return;
            }
            if connection.read_buffer.len() < 4 + frame_len {
                return;
            }
            let body = connection.read_buffer[4..4 + frame_len].to_vec();
            let _ = connection.read_buffer.drain(..4 + frame_len);

            match connection.peer {
                None => {
                    // Hello frame: eight bytes of sender identity.
                    if body.len() != 8 {
                        log::warn!("dropping connection with malformed hello frame");
                        connection.closed = true;
                        self.close_connection(token);
                        return;
                    }
                    let mut id_bytes = [0_u8; 8];
                    id_bytes.copy_from_slice(&body);
                    let peer = CommId::new(u64::from_be_bytes(id_bytes));
                    connection.peer = Some(peer);
                    let _ = self.peers.insert(peer, token);
                }
                Some(peer) => {
                    let _ = self.events.send(BusEvent::Message {
                        from: peer,
                        payload: body,
                    });
                }
            }
        }
    }

    fn flush_connection(&mut self, token: Token) {
        let Some(connection) = self.connections.get_mut(&token) else {
            return;
        };
        while !connection.write_buffer.is_empty() {
            match connection.socket.write(connection.write_buffer.as_slice()) {
                Ok(0) => {
                    connection.closed = true;
                    return;
                }
                Ok(written) => {
                    let _ = connection.write_buffer.drain(..written);
                }
                Err(error)
                    if error.kind() == ErrorKind::WouldBlock
                        || error.kind() == ErrorKind::NotConnected =>
                {
                    return;
                }
                Err(error) if error.kind() == ErrorKind::Interrupted => {}
                Err(_error) => {
                    connection.closed = true;
                    return;
                }
            }
        }
    }

    fn refresh_interest(&mut self, token: Token) {
        let Some(connection) = self.connections.get_mut(&token) else {
            return;
        };
        let next_interest = if connection.write_buffer.is_empty() {
            Interest::READABLE
        } else {
            Interest::READABLE | Interest::WRITABLE
        };
        if next_interest == connection.interest {
            return;
        }
        if self
            .poll
            .registry()
            .reregister(&mut connection.socket, token, next_interest)
            .is_ok()
        {
            connection.interest = next_interest;
        }
    }

    fn close_connection(&mut self, token: Token) {
        let Some(mut connection) = self.connections.remove(&token) else {
            return;
        };
        let _ = self.poll.registry().deregister(&mut connection.socket);
        if let Some(peer) = connection.peer {
            if self.peers.get(&peer) == Some(&token) {
                let _ = self.peers.remove(&peer);
            }
            let _ = self.events.send(BusEvent::Disrupted { peer });
        }
    }

    fn allocate_token(&mut self) -> Token {
        let token = Token(self.next_token);
        self.next_token = self.next_token.saturating_add(1);
        token
    }
}

#[cfg(test)]
mod tests {
    use super::{StaticEndpointMapper, TcpBus};
    use crate::{BusEvent, EndpointMapper, MessageBus};
    use googletest::prelude::*;
    use mdn_common::ids::CommId;
    use rstest::rstest;
    use std::sync::Arc;
    use std::time::Duration;

    const RECV_WAIT: Duration = Duration::from_secs(5);

    fn bind_pair() -> (TcpBus, TcpBus) {
        let mapper = Arc::new(StaticEndpointMapper::new());
        let alpha = TcpBus::bind(CommId::new(1), "127.0.0.1:0", Arc::clone(&mapper) as _)
            .expect("alpha should bind");
        let beta = TcpBus::bind(CommId::new(2), "127.0.0.1:0", Arc::clone(&mapper) as _)
            .expect("beta should bind");
        mapper.insert(CommId::new(1), alpha.local_addr().to_string());
        mapper.insert(CommId::new(2), beta.local_addr().to_string());
        (alpha, beta)
    }

    fn recv_message(bus: &TcpBus) -> (CommId, Vec<u8>) {
        let deadline = std::time::Instant::now() + RECV_WAIT;
        while std::time::Instant::now() < deadline {
            match bus.recv(Duration::from_millis(100)) {
                BusEvent::Message { from, payload } => return (from, payload),
                BusEvent::Timeout | BusEvent::Disrupted { .. } => {}
                BusEvent::Shutdown => panic!("bus shut down while waiting for a message"),
            }
        }
        panic!("no message arrived within the wait budget");
    }

    #[rstest]
    fn frames_travel_between_two_buses() {
        let (alpha, beta) = bind_pair();
        alpha
            .send(CommId::new(2), b"hello-beta".to_vec())
            .expect("send should succeed");

        let (from, payload) = recv_message(&beta);
        assert_that!(from, eq(CommId::new(1)));
        assert_that!(&payload, eq(&b"hello-beta".to_vec()));
    }

    #[rstest]
    fn replies_reuse_the_learned_identity() {
        let (alpha, beta) = bind_pair();
        alpha
            .send(CommId::new(2), b"ping".to_vec())
            .expect("send should succeed");
        let (from, _) = recv_message(&beta);
        beta.send(from, b"pong".to_vec()).expect("reply should succeed");

        let (reply_from, reply) = recv_message(&alpha);
        assert_that!(reply_from, eq(CommId::new(2)));
        assert_that!(&reply, eq(&b"pong".to_vec()));
    }

    #[rstest]
    fn unknown_peer_surfaces_a_disruption_event() {
        let mapper = Arc::new(StaticEndpointMapper::new());
        let alpha = TcpBus::bind(CommId::new(1), "127.0.0.1:0", mapper as Arc<dyn EndpointMapper>)
            .expect("alpha should bind");
        alpha
            .send(CommId::new(9), b"void".to_vec())
            .expect("send queues even for unknown peers");

        let deadline = std::time::Instant::now() + RECV_WAIT;
        loop {
            match alpha.recv(Duration::from_millis(100)) {
                BusEvent::Disrupted { peer } => {
                    assert_that!(peer, eq(CommId::new(9)));
                    break;
                }
                BusEvent::Timeout => {
                    assert_that!(std::time::Instant::now() < deadline, eq(true));
                }
                other => panic!("unexpected event {other:?}"),
            }
        }
    }

    #[rstest]
    fn shutdown_unblocks_receivers() {
        let (alpha, _beta) = bind_pair();
        alpha.shutdown();
        assert_that!(alpha.recv(Duration::from_millis(100)), eq(&BusEvent::Shutdown));
    }
}
