//! Net engine: composition root of one transport family
//!
//! ```text
//!                ┌──────────── NetEngine<T> ────────────┐
//!   listen() ──> │ T::Acceptor ──┐                      │
//!   connect() ─> │ T::Connector ─┴─> registry ──> CompletionHandler
//!                │                      │             │
//!                │                      └──> T::Dispatcher ──> handlers
//!                └── Reactor (one thread) ── ContextHub ┘
//! ```
//!
//! Every connection is put in the registry, and registered with the reactor,
//! before any event involving it is dispatched. It leaves the registry exactly
//! once; a second close is reported as [`NetError::NotRegistered`].

use std::cell::{Cell, Ref, RefCell, RefMut};
use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::rc::{Rc, Weak};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::completion::{CompletionHandler, LifecycleOwner};
use super::transport::{
    Acceptor, CloseReason, ConnectCallback, ConnectStatus, Connection, ConnectionId, Connector,
    Dispatch, NetEvent, Transport,
};
use crate::config::EngineConfig;
use crate::core::ContextHub;
use crate::error::{NetError, Result};
use crate::protocol::{Encoder, Message, MessageFactory};
use crate::reactor::{EventHandler, Reactor, Remote};

type Task<T> = Box<dyn FnOnce(&NetEngine<T>) + Send>;

struct Registration<T: Transport> {
    connection: Rc<T::Connection>,
    // Keeps the reactor's weak reference alive.
    _completion: Rc<CompletionHandler<T::Connection, T::Dispatcher>>,
}

struct InFlight<T: Transport> {
    connector: Rc<T::Connector>,
}

pub(crate) struct EngineInner<T: Transport> {
    weak_self: Weak<EngineInner<T>>,
    config: EngineConfig,
    reactor: Rc<Reactor>,
    dispatcher: Rc<T::Dispatcher>,
    acceptor: RefCell<Option<Rc<T::Acceptor>>>,
    connectors: RefCell<Vec<InFlight<T>>>,
    registry: RefCell<HashMap<ConnectionId, Registration<T>>>,
    encoder: RefCell<Encoder>,
    context: RefCell<ContextHub>,
    tasks: Receiver<Task<T>>,
    sender: Sender<Task<T>>,
    resolves: RefCell<HashMap<u64, ConnectCallback<T::Connection>>>,
    next_resolve: Cell<u64>,
}

/// Transport engine. Cheap to clone; all clones drive the same loop.
pub struct NetEngine<T: Transport> {
    inner: Rc<EngineInner<T>>,
}

impl<T: Transport> Clone for NetEngine<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

/// Non-owning reference to an engine, for objects the engine itself keeps
/// alive.
pub struct WeakEngine<T: Transport> {
    inner: Weak<EngineInner<T>>,
}

impl<T: Transport> Clone for WeakEngine<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Transport> WeakEngine<T> {
    pub fn upgrade(&self) -> Option<NetEngine<T>> {
        self.inner.upgrade().map(|inner| NetEngine { inner })
    }
}

/// Thread-safe submission queue into an engine's reactor thread.
pub struct EngineHandle<T: Transport> {
    sender: Sender<Task<T>>,
    remote: Remote,
}

impl<T: Transport> Clone for EngineHandle<T> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            remote: self.remote.clone(),
        }
    }
}

impl<T: Transport> EngineHandle<T> {
    /// Run `task` on the reactor thread after the current pass.
    pub fn submit<F>(&self, task: F) -> Result<()>
    where
        F: FnOnce(&NetEngine<T>) + Send + 'static,
    {
        self.sender
            .send(Box::new(task))
            .map_err(|_| NetError::EngineGone)?;
        self.remote.wake()?;
        Ok(())
    }

    pub fn stop(&self) {
        self.remote.stop();
    }
}

impl<T: Transport> NetEngine<T> {
    /// Fails with [`NetError::Configuration`] for a config the builder would
    /// have rejected.
    pub fn new(config: EngineConfig, factory: Rc<dyn MessageFactory>) -> Result<Self> {
        config.validate()?;
        let reactor = Rc::new(Reactor::with_config(&config)?);
        let dispatcher = Rc::new(T::Dispatcher::create(factory));
        let encoder = Encoder::new(config.write_buffer_size, config.max_payload_size);
        let (sender, tasks) = mpsc::channel();

        let inner = Rc::new_cyclic(|weak_self| EngineInner {
            weak_self: weak_self.clone(),
            config,
            reactor,
            dispatcher,
            acceptor: RefCell::new(None),
            connectors: RefCell::new(Vec::new()),
            registry: RefCell::new(HashMap::new()),
            encoder: RefCell::new(encoder),
            context: RefCell::new(ContextHub::new()),
            tasks,
            sender,
            resolves: RefCell::new(HashMap::new()),
            next_resolve: Cell::new(0),
        });
        Ok(Self { inner })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn reactor(&self) -> &Rc<Reactor> {
        &self.inner.reactor
    }

    pub fn dispatcher(&self) -> &Rc<T::Dispatcher> {
        &self.inner.dispatcher
    }

    /// Engine-wide extension state
    pub fn context(&self) -> Ref<'_, ContextHub> {
        self.inner.context.borrow()
    }

    pub fn context_mut(&self) -> RefMut<'_, ContextHub> {
        self.inner.context.borrow_mut()
    }

    pub fn downgrade(&self) -> WeakEngine<T> {
        WeakEngine {
            inner: Rc::downgrade(&self.inner),
        }
    }

    pub fn handle(&self) -> EngineHandle<T> {
        EngineHandle {
            sender: self.inner.sender.clone(),
            remote: self.inner.reactor.remote(),
        }
    }

    /// Start accepting connections on `address`. Returns the bound address.
    pub fn listen(&self, address: SocketAddr) -> Result<SocketAddr> {
        if let Some(local_addr) = self.local_addr() {
            return Err(NetError::AlreadyListening(local_addr));
        }

        let acceptor = T::Acceptor::create(&self.inner.config);
        let weak = self.inner.weak_self.clone();
        let local_addr = acceptor.listen(
            &self.inner.reactor,
            address,
            Box::new(move |connection| {
                if let Some(inner) = weak.upgrade() {
                    inner.accept(connection);
                }
            }),
        )?;
        *self.inner.acceptor.borrow_mut() = Some(acceptor);
        Ok(local_addr)
    }

    pub fn stop_listening(&self) {
        let acceptor = self.inner.acceptor.borrow_mut().take();
        if let Some(acceptor) = acceptor {
            acceptor.stop();
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner
            .acceptor
            .borrow()
            .as_ref()
            .filter(|acceptor| acceptor.is_listening())
            .and_then(|acceptor| acceptor.local_addr())
    }

    /// Start an outbound attempt on a fresh connector.
    ///
    /// On success the connection is registered, and `Connected` dispatched,
    /// before `callback` runs. The engine keeps the connector until the
    /// callback has run; the returned reference can be used to cancel.
    pub fn connect<F>(&self, address: SocketAddr, callback: F) -> Rc<T::Connector>
    where
        F: FnOnce(Option<Rc<T::Connection>>, ConnectStatus) + 'static,
    {
        let inner = &self.inner;
        let connector = T::Connector::create(&inner.config);
        let weak_engine = inner.weak_self.clone();
        let weak_connector = Rc::downgrade(&connector);

        let started = connector.connect(
            &inner.reactor,
            address,
            Box::new(move |connection, status| match weak_engine.upgrade() {
                Some(inner) => {
                    inner.release_connector(&weak_connector);
                    inner.finish_connect(connection, status, callback);
                }
                None => callback(None, ConnectStatus::Canceled),
            }),
        );
        if started {
            inner.connectors.borrow_mut().push(InFlight {
                connector: connector.clone(),
            });
        }
        connector
    }

    /// Resolve `host` on a worker thread, then connect from the reactor
    /// thread. A failed lookup reports [`ConnectStatus::ConnectError`].
    pub fn connect_host<F>(&self, host: impl Into<String>, port: u16, callback: F) -> Result<()>
    where
        F: FnOnce(Option<Rc<T::Connection>>, ConnectStatus) + 'static,
    {
        let request = self.inner.next_resolve.get();
        self.inner.next_resolve.set(request + 1);
        self.inner
            .resolves
            .borrow_mut()
            .insert(request, Box::new(callback));

        let host = host.into();
        let handle = self.handle();
        let spawned = thread::Builder::new()
            .name("netcore-resolve".into())
            .spawn(move || {
                let resolved = resolve(&host, port);
                let submitted =
                    handle.submit(move |engine| engine.finish_resolve(request, resolved));
                if submitted.is_err() {
                    debug!(%host, "engine gone before lookup finished");
                }
            });

        if let Err(err) = spawned {
            self.inner.resolves.borrow_mut().remove(&request);
            return Err(err.into());
        }
        Ok(())
    }

    /// Frame `message` with the connection's next sequence number and send it.
    /// Bytes the socket does not take now are flushed on writable events.
    pub fn send(&self, id: ConnectionId, message: &dyn Message) -> Result<()> {
        let connection = self.connection(id).ok_or(NetError::NotRegistered(id))?;
        if connection.is_closed() {
            return Err(NetError::ConnectionClosed(id));
        }

        let sequence = connection.next_sequence();
        let mut encoder = self.inner.encoder.borrow_mut();
        encoder.reset();
        let frame = encoder.encode_with(message.message_type(), sequence, |out| message.encode(out))?;
        connection.queue_write(frame)?;
        connection.flush_write_buffer()?;
        Ok(())
    }

    /// Close a connection locally. `Closed(Local)` is dispatched once.
    pub fn close(&self, id: ConnectionId) -> Result<()> {
        self.inner.close_connection(id, CloseReason::Local)
    }

    pub fn connection(&self, id: ConnectionId) -> Option<Rc<T::Connection>> {
        self.inner.connection(id)
    }

    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        self.inner.registry.borrow().keys().copied().collect()
    }

    pub fn connection_count(&self) -> usize {
        self.inner.registry.borrow().len()
    }

    /// Connect attempts whose callback has not run yet
    pub fn connector_count(&self) -> usize {
        self.inner.connectors.borrow().len()
    }

    /// Register a connection produced outside the engine's own connectors
    /// and acceptor.
    pub fn register(&self, connection: Rc<T::Connection>) -> Result<()> {
        self.inner.register(connection)
    }

    /// One reactor pass followed by the submitted tasks.
    pub fn run_once(&self, timeout: Option<Duration>) -> Result<usize> {
        let handled = self.inner.reactor.turn(timeout)?;
        self.drain_tasks();
        Ok(handled)
    }

    /// Run until [`NetEngine::stop`] or [`EngineHandle::stop`].
    pub fn run(&self) -> Result<()> {
        info!(connections = self.connection_count(), "engine running");
        self.inner.reactor.run_with(|| self.drain_tasks())?;
        info!("engine stopped");
        Ok(())
    }

    pub fn stop(&self) {
        self.inner.reactor.stop();
    }

    /// Stop listening, cancel pending connects and close every connection.
    pub fn shutdown(&self) {
        self.stop_listening();

        let connectors: Vec<_> = self
            .inner
            .connectors
            .borrow()
            .iter()
            .map(|in_flight| in_flight.connector.clone())
            .collect();
        for connector in connectors {
            connector.cancel();
        }

        for id in self.connection_ids() {
            if let Err(err) = self.close(id) {
                debug!(%id, ?err, "already closed during shutdown");
            }
        }
    }

    fn drain_tasks(&self) {
        while let Ok(task) = self.inner.tasks.try_recv() {
            task(self);
        }
    }

    fn finish_resolve(&self, request: u64, resolved: io::Result<SocketAddr>) {
        let callback = self.inner.resolves.borrow_mut().remove(&request);
        let Some(callback) = callback else {
            return;
        };
        match resolved {
            Ok(address) => {
                self.connect(address, callback);
            }
            Err(err) => {
                warn!(?err, "host lookup failed");
                callback(None, ConnectStatus::ConnectError);
            }
        }
    }
}

fn resolve(host: &str, port: u16) -> io::Result<SocketAddr> {
    (host, port).to_socket_addrs()?.next().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::NotFound,
            format!("no address found for {host}:{port}"),
        )
    })
}

impl<T: Transport> EngineInner<T> {
    fn connection(&self, id: ConnectionId) -> Option<Rc<T::Connection>> {
        self.registry
            .borrow()
            .get(&id)
            .map(|registration| registration.connection.clone())
    }

    fn register(&self, connection: Rc<T::Connection>) -> Result<()> {
        let id = connection.id();
        if connection.is_closed() {
            return Err(NetError::ConnectionClosed(id));
        }
        if self.registry.borrow().contains_key(&id) {
            return Err(NetError::AlreadyRegistered(id));
        }

        let owner: Weak<dyn LifecycleOwner> = self.weak_self.clone();
        let completion = Rc::new(CompletionHandler::new(
            connection.clone(),
            self.dispatcher.clone(),
            owner,
            self.config.max_payload_size,
        ));
        let handler: Weak<CompletionHandler<T::Connection, T::Dispatcher>> =
            Rc::downgrade(&completion);
        let handler: Weak<dyn EventHandler> = handler;
        connection.register(&self.reactor, handler)?;

        self.registry.borrow_mut().insert(
            id,
            Registration {
                connection: connection.clone(),
                _completion: completion,
            },
        );
        info!(%id, peer = %connection.peer_addr(), "connection registered");

        self.dispatcher.dispatch(NetEvent::Connected(connection));
        Ok(())
    }

    fn accept(&self, connection: Rc<T::Connection>) {
        if let Some(max) = self.config.max_connections {
            if self.registry.borrow().len() >= max {
                let err = NetError::MaxConnectionsReached(connection.peer_addr());
                warn!(max, %err, "rejecting connection");
                connection.close();
                return;
            }
        }

        if let Err(err) = self.register(connection.clone()) {
            warn!(id = %connection.id(), ?err, "failed to register accepted connection");
            connection.close();
        }
    }

    fn release_connector(&self, connector: &Weak<T::Connector>) {
        self.connectors
            .borrow_mut()
            .retain(|in_flight| !Weak::ptr_eq(&Rc::downgrade(&in_flight.connector), connector));
    }

    fn finish_connect<F>(&self, connection: Option<Rc<T::Connection>>, status: ConnectStatus, callback: F)
    where
        F: FnOnce(Option<Rc<T::Connection>>, ConnectStatus),
    {
        match (connection, status) {
            (Some(connection), ConnectStatus::Success) => match self.register(connection.clone()) {
                Ok(()) => callback(Some(connection), ConnectStatus::Success),
                Err(err) => {
                    warn!(id = %connection.id(), ?err, "failed to register connection");
                    connection.close();
                    callback(None, ConnectStatus::ConnectError);
                }
            },
            (_, status) => callback(None, status),
        }
    }

    fn close_connection(&self, id: ConnectionId, reason: CloseReason) -> Result<()> {
        let registration = self
            .registry
            .borrow_mut()
            .remove(&id)
            .ok_or(NetError::NotRegistered(id))?;
        let connection = registration.connection.clone();

        if let Err(err) = connection.deregister(&self.reactor) {
            debug!(%id, ?err, "deregister failed");
        }
        connection.close();
        info!(%id, ?reason, "connection closed");

        self.dispatcher
            .dispatch(NetEvent::Closed(connection, reason));
        Ok(())
    }
}

impl<T: Transport> LifecycleOwner for EngineInner<T> {
    fn connection_closed(&self, id: ConnectionId, reason: CloseReason) {
        if let Err(err) = self.close_connection(id, reason) {
            debug!(%id, ?err, "close reported for unregistered connection");
        }
    }

    fn connection_fault(&self, id: ConnectionId, error: NetError) {
        let Some(connection) = self.connection(id) else {
            debug!(%id, %error, "fault reported for unregistered connection");
            return;
        };
        warn!(%id, %error, "connection fault");
        self.dispatcher.dispatch(NetEvent::Error(connection, error));
        if let Err(err) = self.close_connection(id, CloseReason::Fault) {
            debug!(%id, ?err, "connection already closed by error handler");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{Tcp, TcpNetEngine};
    use crate::protocol::RawMessageFactory;

    fn engine() -> TcpNetEngine {
        NetEngine::<Tcp>::new(EngineConfig::default(), Rc::new(RawMessageFactory::new())).unwrap()
    }

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[test]
    fn test_listen_twice_rejected() {
        let engine = engine();
        let addr = engine.listen(loopback()).unwrap();
        assert_eq!(engine.local_addr(), Some(addr));
        assert!(matches!(
            engine.listen(loopback()),
            Err(NetError::AlreadyListening(_))
        ));

        engine.stop_listening();
        assert!(engine.local_addr().is_none());
    }

    #[test]
    fn test_new_rejects_unvalidated_config() {
        let config = EngineConfig {
            read_buffer_size: 64,
            ..EngineConfig::default()
        };
        let result = NetEngine::<Tcp>::new(config, Rc::new(RawMessageFactory::new()));
        assert!(matches!(result, Err(NetError::Configuration { .. })));
    }

    #[test]
    fn test_unknown_connection_operations() {
        let engine = engine();
        let id = ConnectionId::next();
        assert!(matches!(engine.close(id), Err(NetError::NotRegistered(_))));

        let message = crate::protocol::RawMessage::new(1, b"x".to_vec());
        assert!(matches!(
            engine.send(id, &message),
            Err(NetError::NotRegistered(_))
        ));
    }

    #[test]
    fn test_submitted_task_runs_on_next_pass() {
        let engine = engine();
        let handle = engine.handle();

        thread::spawn(move || {
            handle
                .submit(|engine| {
                    engine.context_mut().set(7u32).unwrap();
                })
                .unwrap();
        })
        .join()
        .unwrap();

        engine.run_once(Some(Duration::from_millis(100))).unwrap();
        assert_eq!(engine.context().get::<u32>(), Some(&7));
    }

    #[test]
    fn test_handle_reports_dropped_engine() {
        let engine = engine();
        let handle = engine.handle();
        drop(engine);
        assert!(matches!(handle.submit(|_| {}), Err(NetError::EngineGone)));
    }

    #[test]
    fn test_stop_from_handle() {
        let engine = engine();
        let handle = engine.handle();
        let stopper = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            handle.stop();
        });
        engine.run().unwrap();
        stopper.join().unwrap();
    }

    #[test]
    fn test_failed_lookup_reports_connect_error() {
        let engine = engine();
        let status = Rc::new(Cell::new(None));
        let sink = status.clone();
        engine
            .connect_host("host.invalid", 80, move |conn, s| {
                assert!(conn.is_none());
                sink.set(Some(s));
            })
            .unwrap();

        for _ in 0..500 {
            if status.get().is_some() {
                break;
            }
            engine.run_once(Some(Duration::from_millis(20))).unwrap();
        }
        assert_eq!(status.get(), Some(ConnectStatus::ConnectError));
    }
}
