//! Reactor: single-threaded event loop over `mio::Poll`
//!
//! One pass of the loop ([`Reactor::turn`]):
//!
//! ```text
//!   poll(timeout) ──> readiness events ──> EventHandler::handle_event
//!        │                                   (weak, skipped if dropped)
//!        ├──> due timers ─────────────────> TimerHandler::handle_timeout
//!        └──> deferred callbacks queued before this pass
//! ```
//!
//! Handlers are held weakly. An owner that goes away without deregistering
//! simply stops receiving events; the stale entry is purged the next time it
//! would have fired.

mod event;
mod timer;

pub use event::{EventHandler, Readiness, TimerHandler};
pub use timer::{TimerId, TimerMode};

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::io;
use std::rc::Weak;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::event::Source;
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use tracing::{debug, trace};

use crate::config::EngineConfig;
use timer::TimerQueue;

const WAKER_TOKEN: Token = Token(0);

type Deferred = Box<dyn FnOnce()>;

pub struct Reactor {
    poll: RefCell<Poll>,
    registry: Registry,
    events: RefCell<Events>,
    ready: RefCell<Vec<Readiness>>,
    handlers: RefCell<HashMap<Token, Weak<dyn EventHandler>>>,
    next_token: Cell<usize>,
    timers: RefCell<TimerQueue>,
    deferred: RefCell<VecDeque<Deferred>>,
    remote: Remote,
    poll_timeout: Duration,
}

/// Thread-safe handle that can wake a blocked reactor or ask it to stop.
#[derive(Clone)]
pub struct Remote {
    waker: Arc<Waker>,
    stop_requested: Arc<AtomicBool>,
}

impl Remote {
    pub fn wake(&self) -> io::Result<()> {
        self.waker.wake()
    }

    /// Ask [`Reactor::run`] to return after the current pass.
    pub fn stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
        if let Err(err) = self.waker.wake() {
            debug!(?err, "failed to wake reactor for stop");
        }
    }

    pub fn is_stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }
}

impl Reactor {
    pub fn new(events_capacity: usize, poll_timeout: Duration) -> io::Result<Self> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;

        Ok(Self {
            poll: RefCell::new(poll),
            registry,
            events: RefCell::new(Events::with_capacity(events_capacity)),
            ready: RefCell::new(Vec::with_capacity(events_capacity)),
            handlers: RefCell::new(HashMap::new()),
            next_token: Cell::new(WAKER_TOKEN.0 + 1),
            timers: RefCell::new(TimerQueue::default()),
            deferred: RefCell::new(VecDeque::new()),
            remote: Remote {
                waker: Arc::new(waker),
                stop_requested: Arc::new(AtomicBool::new(false)),
            },
            poll_timeout,
        })
    }

    pub fn with_config(config: &EngineConfig) -> io::Result<Self> {
        Self::new(config.events_capacity, config.poll_timeout)
    }

    pub fn remote(&self) -> Remote {
        self.remote.clone()
    }

    /// Register `source` for `interest` and route its events to `handler`.
    pub fn register<S>(
        &self,
        source: &mut S,
        interest: Interest,
        handler: Weak<dyn EventHandler>,
    ) -> io::Result<Token>
    where
        S: Source + ?Sized,
    {
        let token = self.allocate_token();
        self.registry.register(source, token, interest)?;
        self.handlers.borrow_mut().insert(token, handler);
        trace!(token = token.0, ?interest, "registered source");
        Ok(token)
    }

    pub fn reregister<S>(&self, source: &mut S, token: Token, interest: Interest) -> io::Result<()>
    where
        S: Source + ?Sized,
    {
        self.registry.reregister(source, token, interest)
    }

    /// Remove `source` from the poller and drop its handler entry. Events
    /// already polled for `token` in the current pass are discarded.
    pub fn deregister<S>(&self, source: &mut S, token: Token) -> io::Result<()>
    where
        S: Source + ?Sized,
    {
        self.forget(token);
        self.registry.deregister(source)
    }

    /// Drop the handler entry for `token` without touching the source.
    pub fn forget(&self, token: Token) -> bool {
        self.handlers.borrow_mut().remove(&token).is_some()
    }

    pub fn is_registered(&self, token: Token) -> bool {
        self.handlers.borrow().contains_key(&token)
    }

    pub fn schedule(
        &self,
        after: Duration,
        mode: TimerMode,
        handler: Weak<dyn TimerHandler>,
    ) -> TimerId {
        let id = self
            .timers
            .borrow_mut()
            .schedule(Instant::now(), after, mode, handler);
        trace!(%id, ?after, ?mode, "scheduled timer");
        id
    }

    pub fn cancel_timer(&self, id: TimerId) -> bool {
        self.timers.borrow_mut().cancel(id)
    }

    pub fn timer_count(&self) -> usize {
        self.timers.borrow().len()
    }

    /// Run `task` on the next pass of the loop, never from inside this call.
    pub fn defer(&self, task: impl FnOnce() + 'static) {
        self.deferred.borrow_mut().push_back(Box::new(task));
    }

    pub fn has_deferred(&self) -> bool {
        !self.deferred.borrow().is_empty()
    }

    /// One pass of the loop. Returns the number of readiness events handled.
    pub fn turn(&self, timeout: Option<Duration>) -> io::Result<usize> {
        let deferred_before = self.deferred.borrow().len();
        let timeout = self.effective_timeout(timeout, deferred_before > 0);

        let mut ready = std::mem::take(&mut *self.ready.borrow_mut());
        {
            let mut poll = self.poll.borrow_mut();
            let mut events = self.events.borrow_mut();
            match poll.poll(&mut events, timeout) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => {
                    *self.ready.borrow_mut() = ready;
                    return Err(err);
                }
            }
            ready.extend(
                events
                    .iter()
                    .filter(|event| event.token() != WAKER_TOKEN)
                    .map(Readiness::from),
            );
        }

        let handled = ready.len();
        for readiness in ready.drain(..) {
            self.dispatch(&readiness);
        }
        *self.ready.borrow_mut() = ready;

        self.fire_timers(Instant::now());
        self.run_deferred(deferred_before);

        Ok(handled)
    }

    /// Loop until [`Remote::stop`] (or [`Reactor::stop`]) is called.
    pub fn run(&self) -> io::Result<()> {
        self.run_with(|| {})
    }

    /// Like [`Reactor::run`], calling `after_turn` once after every pass.
    pub fn run_with<F>(&self, mut after_turn: F) -> io::Result<()>
    where
        F: FnMut(),
    {
        while !self.remote.is_stop_requested() {
            self.turn(Some(self.poll_timeout))?;
            after_turn();
        }
        self.remote.stop_requested.store(false, Ordering::SeqCst);
        Ok(())
    }

    pub fn stop(&self) {
        self.remote.stop();
    }

    pub fn poll_timeout(&self) -> Duration {
        self.poll_timeout
    }

    fn allocate_token(&self) -> Token {
        let handlers = self.handlers.borrow();
        loop {
            let candidate = self.next_token.get();
            self.next_token.set(candidate.wrapping_add(1));
            if candidate != WAKER_TOKEN.0 && !handlers.contains_key(&Token(candidate)) {
                return Token(candidate);
            }
        }
    }

    fn effective_timeout(&self, requested: Option<Duration>, has_deferred: bool) -> Option<Duration> {
        if has_deferred {
            return Some(Duration::ZERO);
        }
        match self.timers.borrow_mut().next_deadline() {
            Some(deadline) => {
                let until = deadline.saturating_duration_since(Instant::now());
                Some(requested.map_or(until, |requested| requested.min(until)))
            }
            None => requested,
        }
    }

    fn dispatch(&self, readiness: &Readiness) {
        let token = readiness.token();
        let Some(weak) = self.handlers.borrow().get(&token).cloned() else {
            trace!(token = token.0, "event for deregistered token");
            return;
        };

        match weak.upgrade() {
            Some(handler) => handler.handle_event(readiness),
            None => {
                self.handlers.borrow_mut().remove(&token);
                debug!(token = token.0, "handler dropped, event skipped");
            }
        }
    }

    fn fire_timers(&self, now: Instant) {
        loop {
            let due = self.timers.borrow_mut().pop_due(now);
            let Some((id, weak)) = due else {
                break;
            };
            match weak.upgrade() {
                Some(handler) => handler.handle_timeout(id),
                None => {
                    self.timers.borrow_mut().cancel(id);
                    debug!(%id, "timer handler dropped, expiration skipped");
                }
            }
        }
    }

    fn run_deferred(&self, count: usize) {
        for _ in 0..count {
            let task = self.deferred.borrow_mut().pop_front();
            match task {
                Some(task) => task(),
                None => break,
            }
        }
    }
}
