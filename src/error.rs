//! Error types for the transport engine

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

use crate::core::HubError;
use crate::network::ConnectionId;
use crate::protocol::{FactoryError, FrameError};

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, NetError>;

#[derive(Error, Debug)]
pub enum NetError {
    /// I/O related errors
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Malformed or oversized frame on the wire
    #[error("framing error: {0}")]
    Frame(#[from] FrameError),

    /// Message factory refused to create, decode or destroy a message
    #[error("message factory error: {0}")]
    Factory(#[from] FactoryError),

    #[error("context hub error: {0}")]
    Hub(#[from] HubError),

    #[error("connection {0} is already registered")]
    AlreadyRegistered(ConnectionId),

    #[error("connection {0} is not registered")]
    NotRegistered(ConnectionId),

    #[error("connection {0} is closed")]
    ConnectionClosed(ConnectionId),

    #[error("acceptor is already listening on {0}")]
    AlreadyListening(SocketAddr),

    #[error("max connections reached, rejecting {0}")]
    MaxConnectionsReached(SocketAddr),

    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// The engine behind a handle has been dropped
    #[error("engine is gone")]
    EngineGone,
}

impl NetError {
    pub(crate) fn config(message: impl Into<String>) -> Self {
        NetError::Configuration {
            message: message.into(),
        }
    }
}
