//! Outbound connection establishment
//!
//! ```text
//!   Idle ──connect()──> Connecting ──writable, clean──> Connected
//!                          │   └──writable, error / timeout──> Error
//!                          └──cancel()──> Canceling ──next pass──> Canceled
//! ```
//!
//! The reactor only sees the connector through weak references, both for the
//! socket watcher and for the timeout timer. Dropping the last strong
//! reference mid-flight turns any later firing into a no-op.

use std::cell::{Cell, RefCell};
use std::io;
use std::net::SocketAddr;
use std::rc::{Rc, Weak};

use mio::net::TcpStream;
use mio::{Interest, Token};
use tracing::{debug, info, trace, warn};

use super::connection::TcpConnection;
use super::transport::{ConnectCallback, ConnectStatus, Connection, Connector, ConnectorState};
use crate::config::EngineConfig;
use crate::reactor::{EventHandler, Readiness, Reactor, TimerHandler, TimerId, TimerMode};

/// Everything one `connect()` call holds on to while it is in flight.
struct ConnectAttempt {
    stream: TcpStream,
    token: Option<Token>,
    timer: Option<TimerId>,
    address: SocketAddr,
    reactor: Weak<Reactor>,
}

impl ConnectAttempt {
    /// Drop the watcher and the timer, handing back the socket.
    fn release(mut self) -> TcpStream {
        if let Some(reactor) = self.reactor.upgrade() {
            if let Some(token) = self.token.take() {
                if let Err(err) = reactor.deregister(&mut self.stream, token) {
                    trace!(?err, address = %self.address, "deregister failed");
                }
            }
            if let Some(timer) = self.timer.take() {
                reactor.cancel_timer(timer);
            }
        }
        self.stream
    }
}

pub struct TcpConnector {
    weak_self: Weak<TcpConnector>,
    config: EngineConfig,
    state: Cell<ConnectorState>,
    attempt: RefCell<Option<ConnectAttempt>>,
    callback: RefCell<Option<ConnectCallback<TcpConnection>>>,
}

impl TcpConnector {
    pub fn new(config: &EngineConfig) -> Rc<Self> {
        Rc::new_cyclic(|weak_self| Self {
            weak_self: weak_self.clone(),
            config: config.clone(),
            state: Cell::new(ConnectorState::Idle),
            attempt: RefCell::new(None),
            callback: RefCell::new(None),
        })
    }

    /// Target of the attempt in flight
    pub fn address(&self) -> Option<SocketAddr> {
        self.attempt.borrow().as_ref().map(|attempt| attempt.address)
    }

    fn start(&self, reactor: &Rc<Reactor>, address: SocketAddr) -> io::Result<()> {
        let mut stream = TcpStream::connect(address)?;

        let watcher: Weak<dyn EventHandler> = self.weak_self.clone();
        let token = reactor.register(&mut stream, Interest::WRITABLE, watcher)?;

        let timeout: Weak<dyn TimerHandler> = self.weak_self.clone();
        let timer = reactor.schedule(self.config.connect_timeout, TimerMode::OneShot, timeout);

        *self.attempt.borrow_mut() = Some(ConnectAttempt {
            stream,
            token: Some(token),
            timer: Some(timer),
            address,
            reactor: Rc::downgrade(reactor),
        });
        Ok(())
    }

    fn complete(&self, state: ConnectorState, connection: Option<Rc<TcpConnection>>, status: ConnectStatus) {
        self.state.set(state);
        let callback = self.callback.borrow_mut().take();
        match callback {
            Some(callback) => callback(connection, status),
            None => debug!(?status, "connect finished without a callback"),
        }
    }

    fn fail(&self, status: ConnectStatus) {
        let attempt = self.attempt.borrow_mut().take();
        if let Some(attempt) = attempt {
            debug!(address = %attempt.address, ?status, "connect failed");
            drop(attempt.release());
        }
        self.complete(ConnectorState::Error, None, status);
    }

    fn established(&self, peer_addr: SocketAddr) {
        let attempt = self.attempt.borrow_mut().take();
        let Some(attempt) = attempt else {
            return;
        };
        let stream = attempt.release();

        match TcpConnection::new(stream, peer_addr, &self.config) {
            Ok(connection) => {
                info!(%peer_addr, id = %connection.id(), "connected");
                self.complete(
                    ConnectorState::Connected,
                    Some(Rc::new(connection)),
                    ConnectStatus::Success,
                );
            }
            Err(err) => {
                warn!(%peer_addr, ?err, "failed to set up connection");
                self.complete(ConnectorState::Error, None, ConnectStatus::ConnectError);
            }
        }
    }
}

impl Connector for TcpConnector {
    type Connection = TcpConnection;

    fn create(config: &EngineConfig) -> Rc<Self> {
        Self::new(config)
    }

    fn connect(
        &self,
        reactor: &Rc<Reactor>,
        address: SocketAddr,
        callback: ConnectCallback<TcpConnection>,
    ) -> bool {
        if self.state.get() != ConnectorState::Idle {
            debug!(state = ?self.state.get(), %address, "connect rejected, connector busy");
            return false;
        }
        *self.callback.borrow_mut() = Some(callback);

        match self.start(reactor, address) {
            Ok(()) => {
                self.state.set(ConnectorState::Connecting);
                debug!(%address, "connecting");
            }
            Err(err) => {
                // The callback still has to come from the loop.
                warn!(%address, ?err, "connect could not be started");
                self.attempt.borrow_mut().take();
                self.state.set(ConnectorState::Error);
                let weak = self.weak_self.clone();
                reactor.defer(move || {
                    if let Some(this) = weak.upgrade() {
                        this.complete(ConnectorState::Error, None, ConnectStatus::ConnectError);
                    }
                });
            }
        }
        true
    }

    fn cancel(&self) {
        if self.state.get() != ConnectorState::Connecting {
            return;
        }
        self.state.set(ConnectorState::Canceling);

        let attempt = self.attempt.borrow_mut().take();
        let Some(attempt) = attempt else {
            return;
        };
        let reactor = attempt.reactor.upgrade();
        debug!(address = %attempt.address, "canceling connect");
        drop(attempt.release());

        match reactor {
            Some(reactor) => {
                let weak = self.weak_self.clone();
                reactor.defer(move || {
                    if let Some(this) = weak.upgrade() {
                        if this.state.get() == ConnectorState::Canceling {
                            this.complete(ConnectorState::Canceled, None, ConnectStatus::Canceled);
                        }
                    }
                });
            }
            None => {
                // No loop left to report through.
                self.state.set(ConnectorState::Canceled);
                self.callback.borrow_mut().take();
            }
        }
    }

    fn state(&self) -> ConnectorState {
        self.state.get()
    }
}

impl EventHandler for TcpConnector {
    fn handle_event(&self, readiness: &Readiness) {
        if self.state.get() != ConnectorState::Connecting {
            return;
        }

        let outcome = {
            let attempt = self.attempt.borrow();
            let Some(attempt) = attempt.as_ref() else {
                return;
            };
            match attempt.stream.take_error() {
                Ok(Some(err)) | Err(err) => Err(err),
                Ok(None) => attempt.stream.peer_addr(),
            }
        };

        match outcome {
            Ok(peer_addr) => self.established(peer_addr),
            Err(err)
                if !readiness.is_error()
                    && matches!(
                        err.kind(),
                        io::ErrorKind::NotConnected | io::ErrorKind::WouldBlock
                    ) =>
            {
                trace!(?err, "spurious writable event while connecting");
            }
            Err(err) => {
                debug!(?err, "connect error");
                self.fail(ConnectStatus::ConnectError);
            }
        }
    }
}

impl TimerHandler for TcpConnector {
    fn handle_timeout(&self, timer: TimerId) {
        if self.state.get() != ConnectorState::Connecting {
            return;
        }
        {
            let mut attempt = self.attempt.borrow_mut();
            match attempt.as_mut() {
                Some(attempt) if attempt.timer == Some(timer) => attempt.timer = None,
                _ => return,
            }
        }
        self.fail(ConnectStatus::Timeout);
    }
}

impl Drop for TcpConnector {
    fn drop(&mut self) {
        if let Some(attempt) = self.attempt.get_mut().take() {
            trace!(address = %attempt.address, "connector dropped mid-flight");
            drop(attempt.release());
        }
    }
}
