//! Inbound connection acceptor
//!
//! Accepts exactly one pending connection per readiness event and then re-arms
//! the listener, so a burst of connections is spread over several loop passes
//! instead of starving the other sockets. A failed accept parks the listener
//! behind a short one-shot timer rather than re-arming it straight away.

use std::cell::{Cell, RefCell};
use std::io;
use std::net::SocketAddr;
use std::rc::{Rc, Weak};
use std::time::Duration;

use mio::net::TcpListener;
use mio::{Interest, Token};
use tracing::{debug, info, trace, warn};

use super::connection::TcpConnection;
use super::transport::{AcceptCallback, Acceptor, Connection};
use crate::config::EngineConfig;
use crate::error::{NetError, Result};
use crate::reactor::{EventHandler, Readiness, Reactor, TimerHandler, TimerId, TimerMode};

/// Pause before re-arming a listener whose last accept failed
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(10);

struct Listening {
    listener: TcpListener,
    token: Token,
    local_addr: SocketAddr,
    reactor: Weak<Reactor>,
    retry: Option<TimerId>,
}

impl Listening {
    fn release(&mut self) -> io::Result<()> {
        let Some(reactor) = self.reactor.upgrade() else {
            return Ok(());
        };
        if let Some(timer) = self.retry.take() {
            reactor.cancel_timer(timer);
        }
        reactor.deregister(&mut self.listener, self.token)
    }
}

pub struct TcpAcceptor {
    weak_self: Weak<TcpAcceptor>,
    config: EngineConfig,
    listening: RefCell<Option<Listening>>,
    callback: RefCell<Option<AcceptCallback<TcpConnection>>>,
    stopped: Cell<bool>,
    accepted: Cell<u64>,
}

impl TcpAcceptor {
    pub fn new(config: &EngineConfig) -> Rc<Self> {
        Rc::new_cyclic(|weak_self| Self {
            weak_self: weak_self.clone(),
            config: config.clone(),
            listening: RefCell::new(None),
            callback: RefCell::new(None),
            stopped: Cell::new(false),
            accepted: Cell::new(0),
        })
    }

    /// Connections handed to the callback so far
    pub fn accepted(&self) -> u64 {
        self.accepted.get()
    }

    fn accept_one(&self) -> io::Result<Option<TcpConnection>> {
        let accepted = {
            let listening = self.listening.borrow();
            let Some(listening) = listening.as_ref() else {
                return Ok(None);
            };
            listening.listener.accept()
        };

        match accepted {
            Ok((stream, peer_addr)) => TcpConnection::new(stream, peer_addr, &self.config).map(Some),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn rearm(&self) {
        let mut listening = self.listening.borrow_mut();
        let Some(listening) = listening.as_mut() else {
            return;
        };
        let Some(reactor) = listening.reactor.upgrade() else {
            return;
        };
        if let Err(err) = reactor.reregister(&mut listening.listener, listening.token, Interest::READABLE) {
            warn!(?err, addr = %listening.local_addr, "failed to re-arm listener");
        }
    }

    /// Leave the listener disarmed until the retry timer fires
    fn backoff(&self) {
        let mut listening = self.listening.borrow_mut();
        let Some(listening) = listening.as_mut() else {
            return;
        };
        if listening.retry.is_some() {
            return;
        }
        let Some(reactor) = listening.reactor.upgrade() else {
            return;
        };
        let handler: Weak<dyn TimerHandler> = self.weak_self.clone();
        listening.retry = Some(reactor.schedule(ACCEPT_RETRY_DELAY, TimerMode::OneShot, handler));
    }

    fn deliver(&self, connection: TcpConnection) {
        // Taken out for the call so the callback may stop the acceptor.
        let callback = self.callback.borrow_mut().take();
        let Some(mut callback) = callback else {
            return;
        };
        self.accepted.set(self.accepted.get() + 1);
        callback(Rc::new(connection));

        if !self.stopped.get() {
            let mut slot = self.callback.borrow_mut();
            if slot.is_none() {
                *slot = Some(callback);
            }
        }
    }
}

impl Acceptor for TcpAcceptor {
    type Connection = TcpConnection;

    fn create(config: &EngineConfig) -> Rc<Self> {
        Self::new(config)
    }

    fn listen(
        &self,
        reactor: &Rc<Reactor>,
        address: SocketAddr,
        callback: AcceptCallback<TcpConnection>,
    ) -> Result<SocketAddr> {
        if let Some(listening) = self.listening.borrow().as_ref() {
            return Err(NetError::AlreadyListening(listening.local_addr));
        }

        let mut listener = TcpListener::bind(address)?;
        let local_addr = listener.local_addr()?;
        let handler: Weak<dyn EventHandler> = self.weak_self.clone();
        let token = reactor.register(&mut listener, Interest::READABLE, handler)?;

        *self.listening.borrow_mut() = Some(Listening {
            listener,
            token,
            local_addr,
            reactor: Rc::downgrade(reactor),
            retry: None,
        });
        *self.callback.borrow_mut() = Some(callback);
        self.stopped.set(false);

        info!(addr = %local_addr, "listening");
        Ok(local_addr)
    }

    fn stop(&self) {
        if self.stopped.replace(true) {
            return;
        }
        self.callback.borrow_mut().take();

        let listening = self.listening.borrow_mut().take();
        if let Some(mut listening) = listening {
            if let Err(err) = listening.release() {
                debug!(?err, "failed to deregister listener");
            }
            info!(addr = %listening.local_addr, accepted = self.accepted.get(), "acceptor stopped");
        }
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.listening.borrow().as_ref().map(|listening| listening.local_addr)
    }

    fn is_listening(&self) -> bool {
        !self.stopped.get() && self.listening.borrow().is_some()
    }
}

impl EventHandler for TcpAcceptor {
    fn handle_event(&self, _readiness: &Readiness) {
        if self.stopped.get() {
            return;
        }

        match self.accept_one() {
            Ok(Some(connection)) => {
                if self.stopped.get() {
                    trace!("acceptor stopped, dropping accepted connection");
                    return;
                }
                debug!(peer = %connection.peer_addr(), id = %connection.id(), "accepted");
                self.deliver(connection);
            }
            Ok(None) => {}
            Err(err) => {
                // Aborted handshakes and fd exhaustion leave the listener
                // usable, but retrying at once would spin on the same error.
                warn!(?err, delay = ?ACCEPT_RETRY_DELAY, "accept failed, backing off");
                self.backoff();
                return;
            }
        }

        self.rearm();
    }
}

impl TimerHandler for TcpAcceptor {
    fn handle_timeout(&self, timer: TimerId) {
        {
            let mut listening = self.listening.borrow_mut();
            let Some(listening) = listening.as_mut() else {
                return;
            };
            if listening.retry != Some(timer) {
                return;
            }
            listening.retry = None;
        }
        if self.stopped.get() {
            return;
        }
        trace!(%timer, "accept retry");
        self.rearm();
    }
}

impl Drop for TcpAcceptor {
    fn drop(&mut self) {
        if let Some(mut listening) = self.listening.get_mut().take() {
            if let Err(err) = listening.release() {
                debug!(?err, addr = %listening.local_addr, "failed to deregister listener on drop");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn reactor() -> Rc<Reactor> {
        Rc::new(Reactor::new(64, Duration::from_millis(10)).unwrap())
    }

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[test]
    fn test_listen_reports_bound_address() {
        let reactor = reactor();
        let acceptor = TcpAcceptor::new(&EngineConfig::default());
        let addr = acceptor.listen(&reactor, loopback(), Box::new(|_| {})).unwrap();

        assert_ne!(addr.port(), 0);
        assert_eq!(acceptor.local_addr(), Some(addr));
        assert!(acceptor.is_listening());
    }

    #[test]
    fn test_listen_twice_rejected() {
        let reactor = reactor();
        let acceptor = TcpAcceptor::new(&EngineConfig::default());
        acceptor.listen(&reactor, loopback(), Box::new(|_| {})).unwrap();

        let result = acceptor.listen(&reactor, loopback(), Box::new(|_| {}));
        assert!(matches!(result, Err(NetError::AlreadyListening(_))));
    }

    #[test]
    fn test_accepts_one_per_event() {
        let reactor = reactor();
        let acceptor = TcpAcceptor::new(&EngineConfig::default());
        let seen = Rc::new(Cell::new(0));
        let sink = seen.clone();
        let addr = acceptor
            .listen(&reactor, loopback(), Box::new(move |_| sink.set(sink.get() + 1)))
            .unwrap();

        let _a = std::net::TcpStream::connect(addr).unwrap();
        let _b = std::net::TcpStream::connect(addr).unwrap();

        for _ in 0..100 {
            if seen.get() == 2 {
                break;
            }
            reactor.turn(Some(Duration::from_millis(10))).unwrap();
        }
        assert_eq!(seen.get(), 2);
        assert_eq!(acceptor.accepted(), 2);
    }

    #[test]
    fn test_backoff_rearms_on_timer() {
        let reactor = reactor();
        let acceptor = TcpAcceptor::new(&EngineConfig::default());
        let addr = acceptor.listen(&reactor, loopback(), Box::new(|_| {})).unwrap();

        acceptor.backoff();
        acceptor.backoff();
        assert_eq!(reactor.timer_count(), 1);

        let _client = std::net::TcpStream::connect(addr).unwrap();
        for _ in 0..100 {
            if acceptor.accepted() == 1 && reactor.timer_count() == 0 {
                break;
            }
            reactor.turn(Some(Duration::from_millis(10))).unwrap();
        }
        assert_eq!(acceptor.accepted(), 1);
        assert_eq!(reactor.timer_count(), 0);
        assert!(acceptor.listening.borrow().as_ref().unwrap().retry.is_none());
    }

    #[test]
    fn test_stop_cancels_accept_retry() {
        let reactor = reactor();
        let acceptor = TcpAcceptor::new(&EngineConfig::default());
        acceptor.listen(&reactor, loopback(), Box::new(|_| {})).unwrap();

        acceptor.backoff();
        assert_eq!(reactor.timer_count(), 1);

        acceptor.stop();
        assert_eq!(reactor.timer_count(), 0);
    }

    #[test]
    fn test_drop_cancels_accept_retry() {
        let reactor = reactor();
        let acceptor = TcpAcceptor::new(&EngineConfig::default());
        acceptor.listen(&reactor, loopback(), Box::new(|_| {})).unwrap();

        acceptor.backoff();
        drop(acceptor);
        assert_eq!(reactor.timer_count(), 0);
    }

    #[test]
    fn test_stop_inside_callback() {
        let reactor = reactor();
        let acceptor = TcpAcceptor::new(&EngineConfig::default());
        let weak = Rc::downgrade(&acceptor);
        let addr = acceptor
            .listen(
                &reactor,
                loopback(),
                Box::new(move |_| {
                    if let Some(acceptor) = weak.upgrade() {
                        acceptor.stop();
                    }
                }),
            )
            .unwrap();

        let _a = std::net::TcpStream::connect(addr).unwrap();
        for _ in 0..100 {
            if acceptor.accepted() == 1 {
                break;
            }
            reactor.turn(Some(Duration::from_millis(10))).unwrap();
        }
        assert_eq!(acceptor.accepted(), 1);
        assert!(!acceptor.is_listening());
        assert!(acceptor.local_addr().is_none());
    }
}
