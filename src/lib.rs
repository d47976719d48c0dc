//! netcore - asynchronous transport engine
//!
//! Architecture:
//! - Reactor: single-threaded mio event loop, weak handler registrations
//! - Connector / Acceptor: outbound and inbound connection establishment
//! - Completion handler + dispatcher: bytes to framed messages to handlers
//! - Context hub: type-indexed extension state for engines and sessions
//!
//! ```no_run
//! use std::rc::Rc;
//! use netcore::network::{Connection, Dispatch, TcpNetEngine};
//! use netcore::protocol::RawMessageFactory;
//! use netcore::EngineConfig;
//!
//! # fn main() -> netcore::Result<()> {
//! let engine = TcpNetEngine::new(EngineConfig::default(), Rc::new(RawMessageFactory::new()))?;
//! engine.dispatcher().on_message(1, |conn, message| {
//!     println!("{} sent type {}", conn.id(), message.message_type());
//! });
//! engine.listen("127.0.0.1:7000".parse().unwrap())?;
//! engine.run()?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod network;
pub mod protocol;
pub mod reactor;

pub use config::{EngineConfig, EngineConfigBuilder};
pub use error::{NetError, Result};
pub use network::{NetEngine, Tcp, TcpNetEngine};
