//! Readiness notification for non-blocking sockets.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::{Duration, Instant};

use mio::{Events, Interest, Poll, Registry, Token};
use tracing::{debug, trace};

use super::socket::Udp;

/// How often [MioReactor::run] ticks [Selectable::on_health_check].
pub const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(1);

const EVENTS_CAPACITY: usize = 128;

/// Receiver of readiness notifications for one registered socket.
pub trait Selectable: Send + Sync {
    fn on_readable(&self);
    fn on_writable(&self);
    /// Periodic tick, delivered whether or not the socket is ready.
    fn on_health_check(&self, now: Instant);
}

/// Registers sockets and routes their readiness events to a [Selectable].
///
/// Handlers are held weakly, a dropped handler simply stops receiving events.
pub trait Reactor: Send + Sync {
    /// Register `socket` with read interest.
    fn register(&self, socket: &dyn Udp, handler: Weak<dyn Selectable>) -> io::Result<Token>;
    fn set_interest(&self, socket: &dyn Udp, token: Token, interest: Interest) -> io::Result<()>;
    fn deregister(&self, socket: &dyn Udp, token: Token) -> io::Result<()>;
}

/// A [Reactor] over [mio::Poll].
///
/// Events are dispatched on whichever thread calls [Self::poll_once] or
/// [Self::run], which is then "the reactor thread".
pub struct MioReactor {
    poll: Mutex<Poll>,
    registry: Registry,
    handlers: Mutex<HashMap<Token, Weak<dyn Selectable>>>,
    next_token: AtomicUsize,
}

impl MioReactor {
    pub fn new() -> io::Result<Self> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;

        Ok(Self {
            poll: Mutex::new(poll),
            registry,
            handlers: Mutex::new(HashMap::new()),
            next_token: AtomicUsize::new(0),
        })
    }

    /// Wait up to `timeout` for readiness events and dispatch them.
    ///
    /// Returns the number of events dispatched.
    pub fn poll_once(&self, timeout: Option<Duration>) -> io::Result<usize> {
        let ready: Vec<(Token, bool, bool)> = {
            let mut poll = self.poll.lock().unwrap_or_else(PoisonError::into_inner);
            let mut events = Events::with_capacity(EVENTS_CAPACITY);

            match poll.poll(&mut events, timeout) {
                Ok(()) => {}
                Err(error) if error.kind() == io::ErrorKind::Interrupted => return Ok(0),
                Err(error) => return Err(error),
            }

            events
                .iter()
                .map(|event| (event.token(), event.is_readable(), event.is_writable()))
                .collect()
        };

        let mut dispatched = 0;

        for (token, readable, writable) in ready {
            let Some(handler) = self.handler(token) else {
                trace!(context = "reactor", ?token, "Event for unknown handler");
                continue;
            };

            if writable {
                handler.on_writable();
            }
            if readable {
                handler.on_readable();
            }

            dispatched += 1;
        }

        Ok(dispatched)
    }

    /// Tick every live handler, forgetting the dropped ones.
    pub fn health_check(&self, now: Instant) {
        let handlers: Vec<Arc<dyn Selectable>> = {
            let mut handlers = self.handlers.lock().unwrap_or_else(PoisonError::into_inner);
            handlers.retain(|_, handler| handler.strong_count() > 0);
            handlers.values().filter_map(Weak::upgrade).collect()
        };

        for handler in handlers {
            handler.on_health_check(now);
        }
    }

    /// Poll and tick health checks until `shutdown` is set.
    pub fn run(&self, shutdown: &AtomicBool) -> io::Result<()> {
        let mut last_health_check = Instant::now();

        while !shutdown.load(Ordering::Acquire) {
            let until_health_check =
                HEALTH_CHECK_INTERVAL.saturating_sub(last_health_check.elapsed());

            self.poll_once(Some(until_health_check))?;

            let now = Instant::now();
            if now.duration_since(last_health_check) >= HEALTH_CHECK_INTERVAL {
                last_health_check = now;
                self.health_check(now);
            }
        }

        debug!(context = "reactor", "Reactor shutting down");

        Ok(())
    }

    pub fn len(&self) -> usize {
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn handler(&self, token: Token) -> Option<Arc<dyn Selectable>> {
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&token)
            .and_then(Weak::upgrade)
    }
}

impl Reactor for MioReactor {
    fn register(&self, socket: &dyn Udp, handler: Weak<dyn Selectable>) -> io::Result<Token> {
        let token = Token(self.next_token.fetch_add(1, Ordering::Relaxed));

        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(token, handler);

        if let Err(error) = socket.register(&self.registry, token, Interest::READABLE) {
            self.handlers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&token);
            return Err(error);
        }

        Ok(token)
    }

    fn set_interest(&self, socket: &dyn Udp, token: Token, interest: Interest) -> io::Result<()> {
        socket.reregister(&self.registry, token, interest)
    }

    fn deregister(&self, socket: &dyn Udp, token: Token) -> io::Result<()> {
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&token);

        socket.deregister(&self.registry)
    }
}

impl std::fmt::Debug for MioReactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MioReactor")
            .field("handlers", &self.len())
            .finish()
    }
}
