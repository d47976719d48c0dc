//! Echo server and client over netcore
//!
//! Modes:
//! - `server`: listen and echo every message back on the same session
//! - `client`: connect, send pings, report round-trip times
//! - `local` (default): both ends in one process, one thread
//!
//! Usage:
//!   cargo run --release --example echo -- [server|client|local] [OPTIONS]

use std::cell::{Cell, RefCell};
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::{Duration, Instant};

use netcore::network::{
    CloseReason, ConnectStatus, Connection, Dispatch, Protocol, Session, SessionManager, Tcp, TcpNetEngine,
};
use netcore::protocol::{Message, RawMessage, RawMessageFactory};
use netcore::{EngineConfig, NetError};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const PING: i32 = 1;

#[derive(Clone, Copy, PartialEq)]
enum Mode {
    Server,
    Client,
    Local,
}

struct EchoConfig {
    mode: Mode,
    addr: SocketAddr,
    count: usize,
    payload: usize,
}

impl Default for EchoConfig {
    fn default() -> Self {
        Self {
            mode: Mode::Local,
            addr: SocketAddr::from(([127, 0, 0, 1], 9999)),
            count: 1000,
            payload: 64,
        }
    }
}

/// Server side: echo and count
struct Echo {
    echoed: u64,
}

impl Protocol<Tcp> for Echo {
    fn open(&mut self, session: &Session<Tcp, Self>) {
        info!(id = %session.id(), peer = %session.connection().peer_addr(), "session opened");
    }

    fn on_message(&mut self, session: &Session<Tcp, Self>, message: &dyn Message) {
        let Some(raw) = message.downcast_ref::<RawMessage>() else {
            return;
        };
        self.echoed += 1;
        if let Err(err) = session.send(&RawMessage::new(raw.message_type(), raw.payload())) {
            warn!(id = %session.id(), %err, "echo failed");
        }
    }

    fn on_close(&mut self, session: &Session<Tcp, Self>, reason: CloseReason) {
        info!(id = %session.id(), ?reason, echoed = self.echoed, "session closed");
    }
}

fn new_engine() -> Result<TcpNetEngine, NetError> {
    let config = EngineConfig::builder()
        .poll_timeout(Duration::from_millis(1))
        .build()?;
    TcpNetEngine::new(config, Rc::new(RawMessageFactory::new()))
}

type Server = (TcpNetEngine, Rc<SessionManager<Tcp, Echo>>, SocketAddr);

fn start_server(addr: SocketAddr) -> Result<Server, NetError> {
    let engine = new_engine()?;
    let sessions = SessionManager::install(&engine, |_| Echo { echoed: 0 });
    let bound = engine.listen(addr)?;
    info!(addr = %bound, "echo server listening");
    Ok((engine, sessions, bound))
}

/// Client side state shared between the connect callback and the handler
struct Pinger {
    sent_at: RefCell<Vec<Instant>>,
    rtts: RefCell<Vec<Duration>>,
    done: Cell<bool>,
}

fn start_client(
    addr: SocketAddr,
    count: usize,
    payload: usize,
) -> Result<(TcpNetEngine, Rc<Pinger>), NetError> {
    let engine = new_engine()?;
    let pinger = Rc::new(Pinger {
        sent_at: RefCell::new(Vec::with_capacity(count)),
        rtts: RefCell::new(Vec::with_capacity(count)),
        done: Cell::new(false),
    });

    let body = vec![0x42u8; payload];
    let weak = engine.downgrade();
    let state = pinger.clone();
    engine.dispatcher().on_message(PING, move |connection, _| {
        let index = state.rtts.borrow().len();
        if let Some(sent) = state.sent_at.borrow().get(index) {
            state.rtts.borrow_mut().push(sent.elapsed());
        }
        if state.rtts.borrow().len() >= count {
            state.done.set(true);
            return;
        }
        let Some(engine) = weak.upgrade() else {
            return;
        };
        state.sent_at.borrow_mut().push(Instant::now());
        if let Err(err) = engine.send(connection.id(), &RawMessage::new(PING, body.clone())) {
            warn!(%err, "ping failed");
            state.done.set(true);
        }
    });

    let first = RawMessage::new(PING, vec![0x42u8; payload]);
    let weak = engine.downgrade();
    let state = pinger.clone();
    engine.connect(addr, move |connection, status| {
        let (Some(connection), ConnectStatus::Success) = (connection, status) else {
            warn!(?status, %addr, "connect failed");
            state.done.set(true);
            return;
        };
        info!(id = %connection.id(), %addr, "connected");
        let Some(engine) = weak.upgrade() else {
            return;
        };
        state.sent_at.borrow_mut().push(Instant::now());
        if let Err(err) = engine.send(connection.id(), &first) {
            warn!(%err, "first ping failed");
            state.done.set(true);
        }
    });

    Ok((engine, pinger))
}

/// The client still has a connect pending or a live connection
fn in_flight(client: &TcpNetEngine) -> bool {
    client.connector_count() > 0 || client.connection_count() > 0
}

fn report(pinger: &Pinger, elapsed: Duration) {
    let mut rtts = pinger.rtts.borrow().clone();
    if rtts.is_empty() {
        println!("no replies received");
        return;
    }
    rtts.sort();
    let percentile = |p: f64| rtts[((rtts.len() as f64 - 1.0) * p) as usize];

    println!();
    println!("══════════════════════════════════════");
    println!("  round trips : {}", rtts.len());
    println!("  elapsed     : {:.2?}", elapsed);
    println!(
        "  rate        : {:.0} msg/s",
        rtts.len() as f64 / elapsed.as_secs_f64()
    );
    println!("  p50         : {:.2?}", percentile(0.50));
    println!("  p99         : {:.2?}", percentile(0.99));
    println!("  max         : {:.2?}", percentile(1.0));
    println!("══════════════════════════════════════");
}

fn run(config: EchoConfig) -> Result<(), NetError> {
    match config.mode {
        Mode::Server => {
            let (server, _sessions, _) = start_server(config.addr)?;
            server.run()
        }
        Mode::Client => {
            let (client, pinger) = start_client(config.addr, config.count, config.payload)?;
            let start = Instant::now();
            while !pinger.done.get() && in_flight(&client) {
                client.run_once(Some(Duration::from_millis(1)))?;
            }
            report(&pinger, start.elapsed());
            client.shutdown();
            Ok(())
        }
        Mode::Local => {
            let (server, sessions, addr) = start_server(SocketAddr::from(([127, 0, 0, 1], 0)))?;
            let (client, pinger) = start_client(addr, config.count, config.payload)?;

            let start = Instant::now();
            while !pinger.done.get() && in_flight(&client) {
                client.run_once(Some(Duration::ZERO))?;
                server.run_once(Some(Duration::ZERO))?;
            }
            report(&pinger, start.elapsed());
            info!(sessions = sessions.len(), "shutting down");
            client.shutdown();
            server.shutdown();
            Ok(())
        }
    }
}

fn parse_args() -> EchoConfig {
    let args: Vec<String> = std::env::args().collect();
    let mut config = EchoConfig::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "server" => config.mode = Mode::Server,
            "client" => config.mode = Mode::Client,
            "local" => config.mode = Mode::Local,
            "--addr" | "-a" => {
                if i + 1 < args.len() {
                    config.addr = args[i + 1].parse().unwrap_or(config.addr);
                    i += 1;
                }
            }
            "--count" | "-n" => {
                if i + 1 < args.len() {
                    config.count = args[i + 1].parse().unwrap_or(1000);
                    i += 1;
                }
            }
            "--payload" | "-p" => {
                if i + 1 < args.len() {
                    config.payload = args[i + 1].parse().unwrap_or(64);
                    i += 1;
                }
            }
            "--help" | "-h" => {
                println!("netcore echo demo\n");
                println!("Usage: echo [server|client|local] [OPTIONS]\n");
                println!("Options:");
                println!("  -a, --addr <ADDR>      Server address (default: 127.0.0.1:9999)");
                println!("  -n, --count <N>        Round trips for the client (default: 1000)");
                println!("  -p, --payload <BYTES>  Payload size (default: 64)");
                println!("  -h, --help             Show this help");
                std::process::exit(0);
            }
            _ => {}
        }
        i += 1;
    }

    config
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = parse_args();
    if config.mode != Mode::Server && config.count == 0 {
        return;
    }

    if let Err(e) = run(config) {
        eprintln!("echo error: {}", e);
        std::process::exit(1);
    }
}
