//! Engine configuration.

use std::time::Duration;

use crate::error::{NetError, Result};
use crate::protocol::{DEFAULT_MAX_PAYLOAD_SIZE, HEADER_SIZE};

pub const DEFAULT_EVENTS_CAPACITY: usize = 1024;
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(100);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_WRITE_BUFFER_SIZE: usize = 64 * 1024;

/// Configuration shared by the reactor, connectors, acceptors and connections
/// of one engine.
///
/// Use [`EngineConfig::builder()`] to override individual fields; everything
/// not set falls back to [`EngineConfig::default()`].
///
/// ## Socket options
///
/// - `no_delay`: disables Nagle's algorithm (default on)
/// - `socket_buffer_size`: SO_SNDBUF / SO_RCVBUF, left to the OS when `None`
///
/// ## Limits
///
/// - `max_payload_size`: frames announcing a larger payload are a framing fault
/// - `read_buffer_size`: must hold at least one full frame
/// - `max_connections`: accepted connections beyond the limit are closed
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Events drained per poll
    pub events_capacity: usize,
    /// Upper bound on a single poll when no timer is due sooner
    pub poll_timeout: Duration,
    /// One-shot timeout for each outbound connect attempt
    pub connect_timeout: Duration,
    pub read_buffer_size: usize,
    pub write_buffer_size: usize,
    pub max_payload_size: usize,
    /// Enable TCP_NODELAY
    pub no_delay: bool,
    pub socket_buffer_size: Option<usize>,
    pub max_connections: Option<usize>,
}

impl EngineConfig {
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::new()
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.events_capacity == 0 {
            return Err(NetError::config("events_capacity must be non-zero"));
        }
        if self.max_payload_size == 0 || self.max_payload_size > u32::MAX as usize {
            return Err(NetError::config("max_payload_size out of range"));
        }
        if self.read_buffer_size < HEADER_SIZE + self.max_payload_size {
            return Err(NetError::config(format!(
                "read_buffer_size {} cannot hold a {} byte frame",
                self.read_buffer_size,
                HEADER_SIZE + self.max_payload_size
            )));
        }
        if self.write_buffer_size == 0 {
            return Err(NetError::config("write_buffer_size must be non-zero"));
        }
        if self.max_connections == Some(0) {
            return Err(NetError::config("max_connections must be non-zero"));
        }
        Ok(())
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            events_capacity: DEFAULT_EVENTS_CAPACITY,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            read_buffer_size: HEADER_SIZE + DEFAULT_MAX_PAYLOAD_SIZE,
            write_buffer_size: DEFAULT_WRITE_BUFFER_SIZE,
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            no_delay: true,
            socket_buffer_size: None,
            max_connections: None,
        }
    }
}

/// Builder for [`EngineConfig`].
#[derive(Debug, Default)]
pub struct EngineConfigBuilder {
    events_capacity: Option<usize>,
    poll_timeout: Option<Duration>,
    connect_timeout: Option<Duration>,
    read_buffer_size: Option<usize>,
    write_buffer_size: Option<usize>,
    max_payload_size: Option<usize>,
    no_delay: Option<bool>,
    socket_buffer_size: Option<usize>,
    max_connections: Option<usize>,
}

impl EngineConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events_capacity(mut self, capacity: usize) -> Self {
        self.events_capacity = Some(capacity);
        self
    }

    pub fn poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = Some(timeout);
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    pub fn read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = Some(size);
        self
    }

    pub fn write_buffer_size(mut self, size: usize) -> Self {
        self.write_buffer_size = Some(size);
        self
    }

    /// Also grows the read buffer when it would be too small for the new limit.
    pub fn max_payload_size(mut self, size: usize) -> Self {
        self.max_payload_size = Some(size);
        self
    }

    pub fn no_delay(mut self, enabled: bool) -> Self {
        self.no_delay = Some(enabled);
        self
    }

    pub fn socket_buffer_size(mut self, size: usize) -> Self {
        self.socket_buffer_size = Some(size);
        self
    }

    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = Some(max);
        self
    }

    pub fn build(self) -> Result<EngineConfig> {
        let default = EngineConfig::default();
        let max_payload_size = self.max_payload_size.unwrap_or(default.max_payload_size);
        let read_buffer_size = self
            .read_buffer_size
            .unwrap_or_else(|| default.read_buffer_size.max(HEADER_SIZE + max_payload_size));

        let config = EngineConfig {
            events_capacity: self.events_capacity.unwrap_or(default.events_capacity),
            poll_timeout: self.poll_timeout.unwrap_or(default.poll_timeout),
            connect_timeout: self.connect_timeout.unwrap_or(default.connect_timeout),
            read_buffer_size,
            write_buffer_size: self.write_buffer_size.unwrap_or(default.write_buffer_size),
            max_payload_size,
            no_delay: self.no_delay.unwrap_or(default.no_delay),
            socket_buffer_size: self.socket_buffer_size.or(default.socket_buffer_size),
            max_connections: self.max_connections.or(default.max_connections),
        };
        config.validate()?;
        Ok(config)
    }
}
