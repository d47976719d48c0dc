//! Sessions: protocol state attached to one live connection
//!
//! [`SessionManager::install`] observes an engine's dispatcher. When a
//! connection is established it builds a protocol instance, wraps it in a
//! [`Session`] and routes the connection's events to it; when the connection
//! closes the session is dropped.

use std::cell::{Cell, Ref, RefCell, RefMut};
use std::collections::HashMap;
use std::rc::Rc;

use tracing::{debug, trace};

use super::dispatcher::Handler;
use super::engine::{NetEngine, WeakEngine};
use super::transport::{CloseReason, Connection, ConnectionId, Dispatch, Transport};
use crate::core::ContextHub;
use crate::error::{NetError, Result};
use crate::protocol::Message;

/// Protocol-specific behavior of a session.
pub trait Protocol<T: Transport>: Sized + 'static {
    fn open(&mut self, _session: &Session<T, Self>) {}

    fn on_message(&mut self, session: &Session<T, Self>, message: &dyn Message);

    fn on_close(&mut self, _session: &Session<T, Self>, _reason: CloseReason) {}
}

pub struct Session<T: Transport, P> {
    connection: Rc<T::Connection>,
    engine: WeakEngine<T>,
    protocol: RefCell<P>,
    context: RefCell<ContextHub>,
    received: Cell<u64>,
}

impl<T: Transport, P: Protocol<T>> Session<T, P> {
    fn new(connection: Rc<T::Connection>, engine: WeakEngine<T>, protocol: P) -> Self {
        Self {
            connection,
            engine,
            protocol: RefCell::new(protocol),
            context: RefCell::new(ContextHub::new()),
            received: Cell::new(0),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.connection.id()
    }

    pub fn connection(&self) -> &Rc<T::Connection> {
        &self.connection
    }

    /// Messages delivered to this session so far
    pub fn received(&self) -> u64 {
        self.received.get()
    }

    pub fn send(&self, message: &dyn Message) -> Result<()> {
        self.engine()?.send(self.id(), message)
    }

    pub fn close(&self) -> Result<()> {
        self.engine()?.close(self.id())
    }

    /// Per-session extension state, independent of the engine's hub
    pub fn context(&self) -> Ref<'_, ContextHub> {
        self.context.borrow()
    }

    pub fn context_mut(&self) -> RefMut<'_, ContextHub> {
        self.context.borrow_mut()
    }

    /// Inspect the protocol state. Must not be called from inside a
    /// [`Protocol`] callback of the same session.
    pub fn with_protocol<R>(&self, f: impl FnOnce(&P) -> R) -> R {
        f(&self.protocol.borrow())
    }

    fn engine(&self) -> Result<NetEngine<T>> {
        self.engine.upgrade().ok_or(NetError::EngineGone)
    }
}

impl<T: Transport, P: Protocol<T>> Handler<T::Connection> for Session<T, P> {
    fn on_message(&self, _connection: &Rc<T::Connection>, message: &dyn Message) {
        self.received.set(self.received.get() + 1);
        self.protocol.borrow_mut().on_message(self, message);
    }

    fn on_closed(&self, _connection: &Rc<T::Connection>, reason: CloseReason) {
        self.protocol.borrow_mut().on_close(self, reason);
    }

    fn on_error(&self, _connection: &Rc<T::Connection>, error: &NetError) {
        debug!(id = %self.id(), %error, "session error");
    }
}

type MakeProtocol<T, P> = Box<dyn Fn(&Rc<<T as Transport>::Connection>) -> P>;

pub struct SessionManager<T: Transport, P> {
    engine: WeakEngine<T>,
    sessions: RefCell<HashMap<ConnectionId, Rc<Session<T, P>>>>,
    make: MakeProtocol<T, P>,
}

impl<T: Transport, P: Protocol<T>> SessionManager<T, P> {
    /// Create a session for every connection `engine` establishes from now on.
    pub fn install<F>(engine: &NetEngine<T>, make: F) -> Rc<Self>
    where
        F: Fn(&Rc<T::Connection>) -> P + 'static,
    {
        let manager = Rc::new(Self {
            engine: engine.downgrade(),
            sessions: RefCell::new(HashMap::new()),
            make: Box::new(make),
        });
        engine.dispatcher().add_handler(manager.clone());
        manager
    }

    pub fn session(&self, id: ConnectionId) -> Option<Rc<Session<T, P>>> {
        self.sessions.borrow().get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.sessions.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.borrow().is_empty()
    }
}

impl<T: Transport, P: Protocol<T>> Handler<T::Connection> for SessionManager<T, P> {
    fn on_connected(&self, connection: &Rc<T::Connection>) {
        let Some(engine) = self.engine.upgrade() else {
            return;
        };
        let id = connection.id();
        let protocol = (self.make)(connection);
        let session = Rc::new(Session::new(connection.clone(), self.engine.clone(), protocol));

        self.sessions.borrow_mut().insert(id, session.clone());
        engine.dispatcher().route(id, session.clone());
        trace!(%id, "session opened");

        session.protocol.borrow_mut().open(&session);
    }

    fn on_message(&self, connection: &Rc<T::Connection>, message: &dyn Message) {
        // Routed connections never get here.
        debug!(id = %connection.id(), msg_type = message.message_type(), "message without session");
    }

    fn on_closed(&self, connection: &Rc<T::Connection>, _reason: CloseReason) {
        if self.sessions.borrow_mut().remove(&connection.id()).is_some() {
            trace!(id = %connection.id(), "session closed");
        }
    }
}
