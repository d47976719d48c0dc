use mio::{event::Event, Token};
use std::fmt;

use super::TimerId;

/// Platform-neutral copy of a readiness event, detached from the poller's
/// event buffer so handlers can run while the buffer is reused.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Readiness {
    token: Token,
    is_readable: bool,
    is_writable: bool,
    is_error: bool,
    is_read_closed: bool,
    is_write_closed: bool,
}

impl fmt::Debug for Readiness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Readiness")
            .field("token", &self.token)
            .field("is_readable", &self.is_readable)
            .field("is_writable", &self.is_writable)
            .field("is_error", &self.is_error)
            .finish()
    }
}

impl Readiness {
    pub fn new(token: Token, is_readable: bool, is_writable: bool) -> Self {
        Self {
            token,
            is_readable,
            is_writable,
            is_error: false,
            is_read_closed: false,
            is_write_closed: false,
        }
    }

    pub fn token(&self) -> Token {
        self.token
    }

    pub fn is_readable(&self) -> bool {
        self.is_readable
    }

    pub fn is_writable(&self) -> bool {
        self.is_writable
    }

    pub fn is_error(&self) -> bool {
        self.is_error
    }

    pub fn is_read_closed(&self) -> bool {
        self.is_read_closed
    }

    pub fn is_write_closed(&self) -> bool {
        self.is_write_closed
    }
}

impl From<&Event> for Readiness {
    fn from(event: &Event) -> Self {
        Self {
            token: event.token(),
            is_readable: event.is_readable(),
            is_writable: event.is_writable(),
            is_error: event.is_error(),
            is_read_closed: event.is_read_closed(),
            is_write_closed: event.is_write_closed(),
        }
    }
}

/// Receives readiness events for a registered source.
///
/// The reactor only keeps a weak reference to the handler; whoever registers
/// it keeps it alive.
pub trait EventHandler {
    fn handle_event(&self, readiness: &Readiness);
}

/// Receives expirations of a scheduled timer.
pub trait TimerHandler {
    fn handle_timeout(&self, timer: TimerId);
}
