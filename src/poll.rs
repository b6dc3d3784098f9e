//! Per-backend wait/wake drivers used by [`Runloop`](crate::runloop::Runloop).
//!
//! A driver blocks the runloop thread until there is something to do and can be
//! woken from any thread. The `mio` driver additionally owns the OS poller and the
//! handler registry for sockets; the `park` driver is a plain condvar.

use std::{
    collections::HashMap,
    io,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Condvar, Mutex, MutexGuard,
    },
    time::{Duration, Instant},
};

use mio::{event::Source, Events, Interest, Poll, Registry, Token, Waker};
use tracing::trace;

use crate::{
    config::{BackendKind, RunloopConfig},
    error::Result,
    event::Readiness,
    handler::{EventHandler, HandlerEntry},
};

const WAKE_TOKEN: Token = Token(0);

pub(crate) enum Driver {
    Mio(MioDriver),
    Park(ParkDriver),
}

impl Driver {
    pub fn new(config: &RunloopConfig) -> Result<Self> {
        Ok(match config.backend {
            BackendKind::Mio => Driver::Mio(MioDriver::new(config.events_capacity)?),
            BackendKind::Park => Driver::Park(ParkDriver::new()),
        })
    }

    pub fn kind(&self) -> BackendKind {
        match self {
            Driver::Mio(_) => BackendKind::Mio,
            Driver::Park(_) => BackendKind::Park,
        }
    }

    pub fn wake(&self) -> io::Result<()> {
        match self {
            Driver::Mio(driver) => driver.wake(),
            Driver::Park(driver) => {
                driver.wake();
                Ok(())
            }
        }
    }

    /// Blocks for at most `timeout` (forever on `None`) and dispatches I/O readiness.
    pub fn poll(&self, timeout: Option<Duration>) -> Result<()> {
        match self {
            Driver::Mio(driver) => driver.poll(timeout),
            Driver::Park(driver) => {
                driver.park(timeout);
                Ok(())
            }
        }
    }

    pub fn as_mio(&self) -> Option<&MioDriver> {
        match self {
            Driver::Mio(driver) => Some(driver),
            Driver::Park(_) => None,
        }
    }
}

/// mio poller, waker and the token -> handler registry.
pub struct MioDriver {
    poller: Mutex<(Poll, Events)>,
    registry: Registry,
    waker: Waker,
    handlers: Mutex<HashMap<Token, HandlerEntry>>,
    next_token: AtomicUsize,
}

impl MioDriver {
    fn new(events_capacity: usize) -> Result<Self> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Waker::new(poll.registry(), WAKE_TOKEN)?;
        Ok(Self {
            poller: Mutex::new((poll, Events::with_capacity(events_capacity))),
            registry,
            waker,
            handlers: Mutex::new(HashMap::new()),
            next_token: AtomicUsize::new(WAKE_TOKEN.0 + 1),
        })
    }

    /// Registers `source` and routes its readiness to `handler`. Callable from any
    /// thread; the handler runs on the runloop thread.
    pub fn register<H, S>(&self, source: &mut S, interest: Interest, handler: H) -> io::Result<Token>
    where
        H: EventHandler + 'static,
        S: Source + ?Sized,
    {
        let token = Token(self.next_token.fetch_add(1, Ordering::Relaxed));
        // Insert the handler first so an event racing the registration finds it.
        lock(&self.handlers).insert(token, HandlerEntry::new(handler, interest));
        if let Err(err) = source.register(&self.registry, token, interest) {
            lock(&self.handlers).remove(&token);
            return Err(err);
        }
        trace!(token = token.0, "registered source");
        Ok(token)
    }

    pub fn deregister<S>(&self, source: &mut S, token: Token) -> io::Result<()>
    where
        S: Source + ?Sized,
    {
        lock(&self.handlers).remove(&token);
        source.deregister(&self.registry)?;
        trace!(token = token.0, "deregistered source");
        Ok(())
    }

    #[cfg(test)]
    pub fn registered(&self) -> usize {
        lock(&self.handlers).len()
    }

    fn wake(&self) -> io::Result<()> {
        self.waker.wake()
    }

    fn poll(&self, timeout: Option<Duration>) -> Result<()> {
        let ready: Vec<Readiness> = {
            let mut guard = lock(&self.poller);
            let (poll, events) = &mut *guard;
            match poll.poll(events, timeout) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::Interrupted => return Ok(()),
                Err(err) => return Err(err.into()),
            }
            events
                .iter()
                .filter(|event| event.token() != WAKE_TOKEN)
                .map(Readiness::from)
                .collect()
        };

        for event in ready {
            // Handlers may register or deregister sources, so never call one
            // while holding the registry lock.
            let handler = lock(&self.handlers)
                .get(&event.token())
                .filter(|entry| entry.wants(&event))
                .map(|entry| entry.handler.clone());
            if let Some(handler) = handler {
                handler.handle_event(&event);
            }
        }
        Ok(())
    }
}

/// Condvar-based driver for runloops that never wait on sockets.
pub struct ParkDriver {
    notified: Mutex<bool>,
    condvar: Condvar,
}

impl ParkDriver {
    fn new() -> Self {
        Self {
            notified: Mutex::new(false),
            condvar: Condvar::new(),
        }
    }

    fn wake(&self) {
        let mut notified = lock(&self.notified);
        *notified = true;
        self.condvar.notify_one();
    }

    fn park(&self, timeout: Option<Duration>) {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let mut notified = lock(&self.notified);
        while !*notified {
            match deadline {
                None => {
                    notified = self
                        .condvar
                        .wait(notified)
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        break;
                    }
                    notified = self
                        .condvar
                        .wait_timeout(notified, deadline - now)
                        .unwrap_or_else(|poisoned| poisoned.into_inner())
                        .0;
                }
            }
        }
        *notified = false;
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{sync::Arc, thread};

    #[test]
    fn test_poll_times_out() {
        let driver = Driver::new(&RunloopConfig::default()).unwrap();
        let start = Instant::now();
        driver.poll(Some(Duration::from_millis(20))).unwrap();
        assert!(start.elapsed() >= Duration::from_millis(15));
    }

    #[test]
    fn test_wake_interrupts_poll() {
        for backend in [BackendKind::Mio, BackendKind::Park] {
            let config = RunloopConfig::builder().backend(backend).build();
            let driver = Arc::new(Driver::new(&config).unwrap());
            assert_eq!(driver.kind(), backend);

            let waker = driver.clone();
            let handle = thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                waker.wake().unwrap();
            });

            let start = Instant::now();
            driver.poll(Some(Duration::from_secs(5))).unwrap();
            assert!(start.elapsed() < Duration::from_secs(5));
            handle.join().unwrap();
        }
    }

    #[test]
    fn test_wake_before_poll_is_not_lost() {
        let config = RunloopConfig::builder().backend(BackendKind::Park).build();
        let driver = Driver::new(&config).unwrap();
        driver.wake().unwrap();
        let start = Instant::now();
        driver.poll(None).unwrap();
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_register_dispatches_readiness() {
        struct Flag(Arc<AtomicUsize>);
        impl EventHandler for Flag {
            fn handle_event(&self, event: &Readiness) {
                if event.is_readable() {
                    self.0.fetch_add(1, Ordering::SeqCst);
                }
            }
        }

        let driver = Driver::new(&RunloopConfig::default()).unwrap();
        let mio = driver.as_mio().unwrap();
        let mut listener = mio::net::TcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let token = mio
            .register(&mut listener, Interest::READABLE, Flag(hits.clone()))
            .unwrap();
        assert_eq!(mio.registered(), 1);

        let _client = std::net::TcpStream::connect(addr).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while hits.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            driver.poll(Some(Duration::from_millis(50))).unwrap();
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        mio.deregister(&mut listener, token).unwrap();
        assert_eq!(mio.registered(), 0);
    }
}
