//! Network layer: transport-pluggable connection handling on mio
//!
//! Features:
//! - Non-blocking I/O over epoll/kqueue through one reactor per engine
//! - Outbound connects as an explicit state machine with timeout and cancel
//! - Framed messages routed per connection, in arrival order
//!
//! The TCP family ([`Tcp`]) is the only transport shipped; [`NetEngine`] is
//! generic over [`Transport`] so others can be added alongside it.

mod acceptor;
mod completion;
mod connection;
mod connector;
mod dispatcher;
mod engine;
mod session;
mod transport;

pub use acceptor::TcpAcceptor;
pub use completion::{CompletionHandler, LifecycleOwner};
pub use connection::TcpConnection;
pub use connector::TcpConnector;
pub use dispatcher::{Dispatcher, Handler};
pub use engine::{EngineHandle, NetEngine, WeakEngine};
pub use session::{Protocol, Session, SessionManager};
pub use transport::{
    AcceptCallback, Acceptor, CloseReason, ConnectCallback, ConnectStatus, Connection,
    ConnectionId, Connector, ConnectorState, Dispatch, NetEvent, Transport,
};

/// TCP transport family
pub struct Tcp;

impl Transport for Tcp {
    type Connection = TcpConnection;
    type Connector = TcpConnector;
    type Acceptor = TcpAcceptor;
    type Dispatcher = Dispatcher<TcpConnection>;
}

pub type TcpNetEngine = NetEngine<Tcp>;
