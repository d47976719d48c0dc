//! Transport capability set
//!
//! A transport family is a [`Transport`] implementation naming four
//! collaborating types. [`NetEngine`](super::NetEngine) is generic over it, so
//! a new family plugs in without touching the engine.

use std::cell::Ref;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};

use mio::Token;

use super::dispatcher::Handler;
use crate::config::EngineConfig;
use crate::error::{NetError, Result};
use crate::protocol::{Message, MessageFactory};
use crate::reactor::{EventHandler, Reactor};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique connection identifier. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// Outcome reported to a connect callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectStatus {
    Success,
    Timeout,
    ConnectError,
    Canceled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorState {
    Idle,
    Connecting,
    Connected,
    Canceling,
    Canceled,
    Error,
}

impl ConnectorState {
    /// `Connected`, `Canceled` and `Error` end an attempt.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ConnectorState::Connected | ConnectorState::Canceled | ConnectorState::Error
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Closed through the engine
    Local,
    /// Orderly shutdown by the peer
    Peer,
    /// I/O, framing or message factory fault
    Fault,
}

pub type ConnectCallback<C> = Box<dyn FnOnce(Option<Rc<C>>, ConnectStatus)>;
pub type AcceptCallback<C> = Box<dyn FnMut(Rc<C>)>;

/// Lifecycle and routing event delivered by a dispatcher.
pub enum NetEvent<C> {
    Connected(Rc<C>),
    Message(Rc<C>, Box<dyn Message>),
    Closed(Rc<C>, CloseReason),
    Error(Rc<C>, NetError),
}

impl<C> NetEvent<C> {
    pub fn connection(&self) -> &Rc<C> {
        match self {
            NetEvent::Connected(conn)
            | NetEvent::Message(conn, _)
            | NetEvent::Closed(conn, _)
            | NetEvent::Error(conn, _) => conn,
        }
    }
}

/// One established endpoint with its own receive and send buffers.
///
/// Shared between the engine registry and at most one session, so every
/// operation takes `&self`.
pub trait Connection: 'static {
    fn id(&self) -> ConnectionId;

    fn peer_addr(&self) -> SocketAddr;

    fn register(&self, reactor: &Reactor, handler: Weak<dyn EventHandler>) -> io::Result<Token>;

    /// Remove the connection from the reactor. Idempotent.
    fn deregister(&self, reactor: &Reactor) -> io::Result<()>;

    /// Read once into the receive buffer.
    ///
    /// Returns the number of new bytes; `Ok(0)` when the socket has nothing
    /// more or the buffer is full. A peer shutdown is reported as
    /// `ErrorKind::UnexpectedEof`.
    fn fill_read_buffer(&self) -> io::Result<usize>;

    /// Bytes received but not consumed yet
    fn readable(&self) -> Ref<'_, [u8]>;

    /// Size of the receive buffer
    fn read_capacity(&self) -> usize;

    fn consume(&self, n: usize);

    fn queue_write(&self, data: &[u8]) -> io::Result<()>;

    /// Write as much buffered data as the socket accepts.
    fn flush_write_buffer(&self) -> io::Result<()>;

    fn write_pending(&self) -> usize;

    /// Pending socket error, if any
    fn take_error(&self) -> io::Result<Option<io::Error>>;

    /// Sequence number for the next outgoing frame
    fn next_sequence(&self) -> u64;

    fn close(&self);

    fn is_closed(&self) -> bool;
}

/// Drives one outbound connection attempt.
pub trait Connector: 'static {
    type Connection: Connection;

    fn create(config: &EngineConfig) -> Rc<Self>;

    /// Start an attempt. Returns `false`, changing nothing, unless the
    /// connector is idle. The callback runs exactly once, always from the
    /// reactor, never from inside this call.
    fn connect(
        &self,
        reactor: &Rc<Reactor>,
        address: SocketAddr,
        callback: ConnectCallback<Self::Connection>,
    ) -> bool;

    /// Request teardown of an attempt in progress. Completes on a later pass.
    fn cancel(&self);

    fn state(&self) -> ConnectorState;
}

/// Listens for inbound connections.
pub trait Acceptor: 'static {
    type Connection: Connection;

    fn create(config: &EngineConfig) -> Rc<Self>;

    fn listen(
        &self,
        reactor: &Rc<Reactor>,
        address: SocketAddr,
        callback: AcceptCallback<Self::Connection>,
    ) -> Result<SocketAddr>;

    /// Stop listening. No callback fires once this returns. Idempotent.
    fn stop(&self);

    fn local_addr(&self) -> Option<SocketAddr>;

    fn is_listening(&self) -> bool;
}

/// Routes events for connections of type `C` to handlers.
pub trait Dispatch<C: Connection>: 'static {
    fn create(factory: Rc<dyn MessageFactory>) -> Self;

    fn factory(&self) -> &Rc<dyn MessageFactory>;

    fn dispatch(&self, event: NetEvent<C>);

    /// Send every event of connection `id` to `handler` first.
    fn route(&self, id: ConnectionId, handler: Rc<dyn Handler<C>>);

    fn unroute(&self, id: ConnectionId) -> bool;

    /// Observe lifecycle events of every connection.
    fn add_handler(&self, handler: Rc<dyn Handler<C>>);

    /// Handle messages of `msg_type` on connections without a route.
    fn on_message<F>(&self, msg_type: i32, handler: F)
    where
        F: Fn(&Rc<C>, &dyn Message) + 'static;
}

/// Transport family: the types one engine instantiation is built from.
pub trait Transport: 'static {
    type Connection: Connection;
    type Connector: Connector<Connection = Self::Connection>;
    type Acceptor: Acceptor<Connection = Self::Connection>;
    type Dispatcher: Dispatch<Self::Connection>;
}
