#![allow(dead_code)]

use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::{Duration, Instant};

use netcore::network::{
    CloseReason, Connection, ConnectionId, Dispatch, Handler, TcpConnection, TcpNetEngine,
};
use netcore::protocol::{Message, RawMessage, RawMessageFactory};
use netcore::EngineConfig;
use tracing_subscriber::EnvFilter;

pub const DEADLINE: Duration = Duration::from_secs(5);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_test_writer()
        .try_init();
}

pub fn loopback() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

pub fn engine() -> TcpNetEngine {
    engine_with(EngineConfig::default())
}

pub fn engine_with(config: EngineConfig) -> TcpNetEngine {
    TcpNetEngine::new(config, Rc::new(RawMessageFactory::new())).unwrap()
}

/// Address nothing listens on: bound once, then released.
pub fn dead_address() -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap()
}

/// Drive every engine until `done` holds. Returns false on deadline.
pub fn pump_until(engines: &[&TcpNetEngine], mut done: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < DEADLINE {
        if done() {
            return true;
        }
        for engine in engines {
            engine.run_once(Some(Duration::from_millis(5))).unwrap();
        }
    }
    done()
}

/// A few extra passes, for asserting that nothing else shows up.
pub fn settle(engines: &[&TcpNetEngine]) {
    for _ in 0..20 {
        for engine in engines {
            engine.run_once(Some(Duration::from_millis(2))).unwrap();
        }
    }
}

/// Observer that records everything the dispatcher hands it.
#[derive(Default)]
pub struct Recorder {
    pub connected: RefCell<Vec<ConnectionId>>,
    pub messages: RefCell<Vec<(ConnectionId, i32, Vec<u8>)>>,
    pub closed: RefCell<Vec<(ConnectionId, CloseReason)>>,
    pub errors: RefCell<Vec<(ConnectionId, String)>>,
}

impl Recorder {
    pub fn install(engine: &TcpNetEngine) -> Rc<Self> {
        let recorder = Rc::new(Self::default());
        engine.dispatcher().add_handler(recorder.clone());
        recorder
    }

    pub fn connected_count(&self) -> usize {
        self.connected.borrow().len()
    }

    pub fn message_count(&self) -> usize {
        self.messages.borrow().len()
    }

    pub fn closed_count(&self) -> usize {
        self.closed.borrow().len()
    }
}

impl Handler<TcpConnection> for Recorder {
    fn on_connected(&self, connection: &Rc<TcpConnection>) {
        self.connected.borrow_mut().push(connection.id());
    }

    fn on_message(&self, connection: &Rc<TcpConnection>, message: &dyn Message) {
        let payload = message
            .downcast_ref::<RawMessage>()
            .map(|raw| raw.payload().to_vec())
            .unwrap_or_default();
        self.messages
            .borrow_mut()
            .push((connection.id(), message.message_type(), payload));
    }

    fn on_closed(&self, connection: &Rc<TcpConnection>, reason: CloseReason) {
        self.closed.borrow_mut().push((connection.id(), reason));
    }

    fn on_error(&self, connection: &Rc<TcpConnection>, error: &netcore::NetError) {
        self.errors
            .borrow_mut()
            .push((connection.id(), error.to_string()));
    }
}
