//! Event dispatcher
//!
//! Every event goes through one FIFO queue. Events raised by a handler while
//! another event is being delivered are appended and delivered afterwards,
//! so a connection's events always arrive in the order they were raised.
//!
//! Delivery order for one event:
//! - a route registered for the event's connection sees it first
//! - messages without a route go to the handler for their type, and to the
//!   observers only if no type handler exists
//! - lifecycle events (connected, closed, error) reach every observer

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

use tracing::{debug, trace, warn};

use super::transport::{CloseReason, Connection, ConnectionId, Dispatch, NetEvent};
use crate::error::NetError;
use crate::protocol::{Message, MessageFactory};

/// Receives events for one connection (as a route) or for all of them (as an
/// observer).
pub trait Handler<C> {
    fn on_connected(&self, _connection: &Rc<C>) {}

    fn on_message(&self, connection: &Rc<C>, message: &dyn Message);

    fn on_closed(&self, _connection: &Rc<C>, _reason: CloseReason) {}

    fn on_error(&self, _connection: &Rc<C>, _error: &NetError) {}
}

type MessageFn<C> = Rc<dyn Fn(&Rc<C>, &dyn Message)>;

pub struct Dispatcher<C: Connection> {
    factory: Rc<dyn MessageFactory>,
    routes: RefCell<HashMap<ConnectionId, Rc<dyn Handler<C>>>>,
    message_handlers: RefCell<HashMap<i32, MessageFn<C>>>,
    observers: RefCell<Vec<Rc<dyn Handler<C>>>>,
    queue: RefCell<VecDeque<NetEvent<C>>>,
    dispatching: Cell<bool>,
}

impl<C: Connection> Dispatcher<C> {
    pub fn new(factory: Rc<dyn MessageFactory>) -> Self {
        Self {
            factory,
            routes: RefCell::new(HashMap::new()),
            message_handlers: RefCell::new(HashMap::new()),
            observers: RefCell::new(Vec::new()),
            queue: RefCell::new(VecDeque::new()),
            dispatching: Cell::new(false),
        }
    }

    pub fn route_count(&self) -> usize {
        self.routes.borrow().len()
    }

    pub fn remove_message_handler(&self, msg_type: i32) -> bool {
        self.message_handlers.borrow_mut().remove(&msg_type).is_some()
    }

    fn route_for(&self, id: ConnectionId) -> Option<Rc<dyn Handler<C>>> {
        self.routes.borrow().get(&id).cloned()
    }

    fn observers(&self) -> Vec<Rc<dyn Handler<C>>> {
        self.observers.borrow().clone()
    }

    fn deliver(&self, event: NetEvent<C>) {
        match event {
            NetEvent::Connected(conn) => {
                if let Some(route) = self.route_for(conn.id()) {
                    route.on_connected(&conn);
                }
                for observer in self.observers() {
                    observer.on_connected(&conn);
                }
            }
            NetEvent::Message(conn, message) => {
                let msg_type = message.message_type();
                self.deliver_message(&conn, message.as_ref());
                if let Err(err) = self.factory.destroy(msg_type, message) {
                    warn!(id = %conn.id(), msg_type, ?err, "message factory refused destroy");
                }
            }
            NetEvent::Closed(conn, reason) => {
                if let Some(route) = self.route_for(conn.id()) {
                    route.on_closed(&conn, reason);
                }
                for observer in self.observers() {
                    observer.on_closed(&conn, reason);
                }
                self.routes.borrow_mut().remove(&conn.id());
            }
            NetEvent::Error(conn, error) => {
                if let Some(route) = self.route_for(conn.id()) {
                    route.on_error(&conn, &error);
                }
                for observer in self.observers() {
                    observer.on_error(&conn, &error);
                }
            }
        }
    }

    fn deliver_message(&self, conn: &Rc<C>, message: &dyn Message) {
        if let Some(route) = self.route_for(conn.id()) {
            route.on_message(conn, message);
            return;
        }

        let typed = self
            .message_handlers
            .borrow()
            .get(&message.message_type())
            .cloned();
        if let Some(handler) = typed {
            handler(conn, message);
            return;
        }

        let observers = self.observers();
        if observers.is_empty() {
            debug!(id = %conn.id(), msg_type = message.message_type(), "no handler for message");
            return;
        }
        for observer in observers {
            observer.on_message(conn, message);
        }
    }
}

impl<C: Connection> Dispatch<C> for Dispatcher<C> {
    fn create(factory: Rc<dyn MessageFactory>) -> Self {
        Self::new(factory)
    }

    fn factory(&self) -> &Rc<dyn MessageFactory> {
        &self.factory
    }

    fn dispatch(&self, event: NetEvent<C>) {
        self.queue.borrow_mut().push_back(event);
        if self.dispatching.replace(true) {
            trace!("dispatch in progress, event queued");
            return;
        }

        loop {
            let next = self.queue.borrow_mut().pop_front();
            let Some(event) = next else {
                break;
            };
            self.deliver(event);
        }
        self.dispatching.set(false);
    }

    fn route(&self, id: ConnectionId, handler: Rc<dyn Handler<C>>) {
        self.routes.borrow_mut().insert(id, handler);
    }

    fn unroute(&self, id: ConnectionId) -> bool {
        self.routes.borrow_mut().remove(&id).is_some()
    }

    fn add_handler(&self, handler: Rc<dyn Handler<C>>) {
        self.observers.borrow_mut().push(handler);
    }

    fn on_message<F>(&self, msg_type: i32, handler: F)
    where
        F: Fn(&Rc<C>, &dyn Message) + 'static,
    {
        self.message_handlers
            .borrow_mut()
            .insert(msg_type, Rc::new(handler));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::TcpConnection;
    use crate::protocol::{RawMessage, RawMessageFactory};
    use crate::EngineConfig;

    fn connection() -> (Rc<TcpConnection>, std::net::TcpStream) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let client = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, peer) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();
        let conn = TcpConnection::new(
            mio::net::TcpStream::from_std(server),
            peer,
            &EngineConfig::default(),
        )
        .unwrap();
        (Rc::new(conn), client)
    }

    fn dispatcher() -> (Rc<RawMessageFactory>, Dispatcher<TcpConnection>) {
        let factory = Rc::new(RawMessageFactory::new());
        let dispatcher = Dispatcher::new(factory.clone());
        (factory, dispatcher)
    }

    fn message(msg_type: i32, payload: &[u8]) -> Box<dyn Message> {
        Box::new(RawMessage::new(msg_type, payload.to_vec()))
    }

    #[derive(Default)]
    struct Recorder {
        log: RefCell<Vec<String>>,
    }

    impl Handler<TcpConnection> for Recorder {
        fn on_connected(&self, _connection: &Rc<TcpConnection>) {
            self.log.borrow_mut().push("connected".into());
        }

        fn on_message(&self, _connection: &Rc<TcpConnection>, message: &dyn Message) {
            let raw = message.downcast_ref::<RawMessage>().unwrap();
            self.log
                .borrow_mut()
                .push(String::from_utf8_lossy(raw.payload()).into_owned());
        }

        fn on_closed(&self, _connection: &Rc<TcpConnection>, reason: CloseReason) {
            self.log.borrow_mut().push(format!("closed:{reason:?}"));
        }
    }

    #[test]
    fn test_route_takes_precedence() {
        let (_factory, dispatcher) = dispatcher();
        let (conn, _client) = connection();
        let route = Rc::new(Recorder::default());
        let typed = Rc::new(Cell::new(0));

        let typed_hits = typed.clone();
        dispatcher.on_message(1, move |_, _| typed_hits.set(typed_hits.get() + 1));
        dispatcher.route(conn.id(), route.clone());

        dispatcher.dispatch(NetEvent::Message(conn.clone(), message(1, b"routed")));
        assert_eq!(*route.log.borrow(), vec!["routed"]);
        assert_eq!(typed.get(), 0);

        assert!(dispatcher.unroute(conn.id()));
        dispatcher.dispatch(NetEvent::Message(conn, message(1, b"typed")));
        assert_eq!(typed.get(), 1);
    }

    #[test]
    fn test_observers_see_lifecycle_and_route_dropped_on_close() {
        let (_factory, dispatcher) = dispatcher();
        let (conn, _client) = connection();
        let observer = Rc::new(Recorder::default());
        let route = Rc::new(Recorder::default());
        dispatcher.add_handler(observer.clone());
        dispatcher.route(conn.id(), route.clone());

        dispatcher.dispatch(NetEvent::Connected(conn.clone()));
        dispatcher.dispatch(NetEvent::Closed(conn, CloseReason::Peer));

        assert_eq!(*observer.log.borrow(), vec!["connected", "closed:Peer"]);
        assert_eq!(*route.log.borrow(), vec!["connected", "closed:Peer"]);
        assert_eq!(dispatcher.route_count(), 0);
    }

    #[test]
    fn test_messages_returned_to_factory() {
        let (factory, dispatcher) = dispatcher();
        let (conn, _client) = connection();
        dispatcher.on_message(2, |_, _| {});

        dispatcher.dispatch(NetEvent::Message(conn, message(2, b"x")));
        assert_eq!(factory.pooled(), 1);
    }

    /// Relies on the default lifecycle methods
    #[derive(Default)]
    struct MessagesOnly {
        seen: Cell<usize>,
    }

    impl Handler<TcpConnection> for MessagesOnly {
        fn on_message(&self, _connection: &Rc<TcpConnection>, _message: &dyn Message) {
            self.seen.set(self.seen.get() + 1);
        }
    }

    #[test]
    fn test_default_lifecycle_methods_are_noops() {
        let (_factory, dispatcher) = dispatcher();
        let (conn, _client) = connection();
        let route = Rc::new(MessagesOnly::default());
        dispatcher.route(conn.id(), route.clone());

        dispatcher.dispatch(NetEvent::Connected(conn.clone()));
        dispatcher.dispatch(NetEvent::Message(conn.clone(), message(1, b"one")));
        let reset = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        dispatcher.dispatch(NetEvent::Error(conn.clone(), reset.into()));
        assert_eq!(dispatcher.route_count(), 1);

        dispatcher.dispatch(NetEvent::Closed(conn, CloseReason::Fault));
        assert_eq!(route.seen.get(), 1);
        assert_eq!(dispatcher.route_count(), 0);
    }

    struct Reentrant {
        dispatcher: RefCell<Option<Rc<Dispatcher<TcpConnection>>>>,
        log: Rc<RefCell<Vec<String>>>,
    }

    impl Handler<TcpConnection> for Reentrant {
        fn on_message(&self, connection: &Rc<TcpConnection>, message: &dyn Message) {
            let raw = message.downcast_ref::<RawMessage>().unwrap();
            self.log
                .borrow_mut()
                .push(format!("start:{}", String::from_utf8_lossy(raw.payload())));
            if raw.payload() == b"first" {
                if let Some(dispatcher) = self.dispatcher.borrow().as_ref() {
                    dispatcher.dispatch(NetEvent::Message(connection.clone(), message_of(b"second")));
                }
            }
            self.log
                .borrow_mut()
                .push(format!("end:{}", String::from_utf8_lossy(raw.payload())));
        }
    }

    fn message_of(payload: &[u8]) -> Box<dyn Message> {
        message(1, payload)
    }

    #[test]
    fn test_nested_dispatch_is_queued_in_order() {
        let (_factory, dispatcher) = dispatcher();
        let dispatcher = Rc::new(dispatcher);
        let (conn, _client) = connection();
        let log = Rc::new(RefCell::new(Vec::new()));
        let handler = Rc::new(Reentrant {
            dispatcher: RefCell::new(Some(dispatcher.clone())),
            log: log.clone(),
        });
        dispatcher.route(conn.id(), handler.clone());

        dispatcher.dispatch(NetEvent::Message(conn, message_of(b"first")));
        assert_eq!(
            *log.borrow(),
            vec!["start:first", "end:first", "start:second", "end:second"]
        );

        handler.dispatcher.borrow_mut().take();
    }
}
