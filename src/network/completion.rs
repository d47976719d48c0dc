//! Completion handler: connection readiness to framed messages
//!
//! One handler per registered connection. Bytes are pulled into the
//! connection's receive buffer until the socket runs dry; only complete frames
//! are turned into messages, a partial frame waits for the next event.

use std::io;
use std::rc::{Rc, Weak};

use tracing::{debug, trace};

use super::transport::{CloseReason, Connection, ConnectionId, Dispatch, NetEvent};
use crate::error::NetError;
use crate::protocol::{FrameDecoder, FrameError, Message};
use crate::reactor::{EventHandler, Readiness};

/// Whoever owns the connection's lifecycle. The completion handler reports
/// faults and closes to it and never tears the connection down itself.
pub trait LifecycleOwner {
    fn connection_closed(&self, id: ConnectionId, reason: CloseReason);

    fn connection_fault(&self, id: ConnectionId, error: NetError);
}

pub struct CompletionHandler<C: Connection, D: Dispatch<C>> {
    connection: Rc<C>,
    dispatcher: Rc<D>,
    owner: Weak<dyn LifecycleOwner>,
    max_payload: usize,
}

impl<C: Connection, D: Dispatch<C>> CompletionHandler<C, D> {
    pub fn new(
        connection: Rc<C>,
        dispatcher: Rc<D>,
        owner: Weak<dyn LifecycleOwner>,
        max_payload: usize,
    ) -> Self {
        Self {
            connection,
            dispatcher,
            owner,
            max_payload,
        }
    }

    pub fn connection(&self) -> &Rc<C> {
        &self.connection
    }

    fn notify_closed(&self, reason: CloseReason) {
        if let Some(owner) = self.owner.upgrade() {
            owner.connection_closed(self.connection.id(), reason);
        }
    }

    fn notify_fault(&self, error: NetError) {
        if let Some(owner) = self.owner.upgrade() {
            owner.connection_fault(self.connection.id(), error);
        }
    }

    fn on_readable(&self) {
        loop {
            if self.connection.is_closed() {
                return;
            }

            let (read, peer_closed) = match self.connection.fill_read_buffer() {
                Ok(n) => (n, false),
                Err(ref e) if e.kind() == io::ErrorKind::UnexpectedEof => (0, true),
                Err(e) => {
                    self.notify_fault(e.into());
                    return;
                }
            };

            let consumed = match self.drain_frames() {
                Ok(consumed) => consumed,
                Err(err) => {
                    self.notify_fault(err);
                    return;
                }
            };

            if peer_closed {
                if !self.connection.is_closed() {
                    debug!(id = %self.connection.id(), "peer closed connection");
                    self.notify_closed(CloseReason::Peer);
                }
                return;
            }
            if read == 0 && consumed == 0 {
                let capacity = self.connection.read_capacity();
                if self.connection.readable().len() >= capacity {
                    self.notify_fault(FrameError::ExceedsBuffer { capacity }.into());
                }
                return;
            }
        }
    }

    /// Decode and dispatch every complete frame in the receive buffer.
    ///
    /// Frames before a bad one are still delivered, in order.
    fn drain_frames(&self) -> Result<usize, NetError> {
        let factory = self.dispatcher.factory().clone();
        let mut messages: Vec<Box<dyn Message>> = Vec::new();

        let (consumed, outcome) = {
            let buffer = self.connection.readable();
            let mut decoder = FrameDecoder::new(&buffer, self.max_payload);
            let outcome = loop {
                match decoder.next() {
                    Ok(Some((header, payload))) => {
                        trace!(
                            id = %self.connection.id(),
                            msg_type = header.msg_type,
                            sequence = header.sequence,
                            len = payload.len(),
                            "frame"
                        );
                        let decoded = factory.create(header.msg_type).and_then(|mut message| {
                            message.decode(payload)?;
                            Ok(message)
                        });
                        match decoded {
                            Ok(message) => messages.push(message),
                            Err(err) => break Err(NetError::from(err)),
                        }
                    }
                    Ok(None) => break Ok(()),
                    Err(err) => break Err(NetError::from(err)),
                }
            };
            (decoder.consumed(), outcome)
        };
        self.connection.consume(consumed);

        for message in messages {
            if self.connection.is_closed() {
                let msg_type = message.message_type();
                if let Err(err) = factory.destroy(msg_type, message) {
                    debug!(?err, "message factory refused destroy");
                }
                continue;
            }
            self.dispatcher
                .dispatch(NetEvent::Message(self.connection.clone(), message));
        }

        outcome.map(|()| consumed)
    }
}

impl<C: Connection, D: Dispatch<C>> EventHandler for CompletionHandler<C, D> {
    fn handle_event(&self, readiness: &Readiness) {
        if readiness.is_readable() || readiness.is_read_closed() {
            self.on_readable();
        }
        if self.connection.is_closed() {
            return;
        }

        if readiness.is_writable() && self.connection.write_pending() > 0 {
            if let Err(err) = self.connection.flush_write_buffer() {
                self.notify_fault(err.into());
                return;
            }
        }

        if readiness.is_error() {
            let error = match self.connection.take_error() {
                Ok(Some(err)) | Err(err) => err,
                Ok(None) => io::Error::new(io::ErrorKind::Other, "socket error"),
            };
            self.notify_fault(error.into());
        }
    }
}
