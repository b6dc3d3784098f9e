//! In-process transport.
//!
//! Listeners live in a lock-free registry keyed by `host:port`, shared by every
//! transport created from the same [`MemNetwork`]. Connecting creates a pair of
//! endpoints wired to each other; bytes sent on one end are buffered in the other's
//! inbox and handed to its reader by a task on the reader's runloop.
//!
//! ```text
//!  client runloop                               listener runloop
//!  ──────────────                               ────────────────
//!  connect(uri) ── lookup ──▶ Registry[host:port] ── post ──▶ accept(server end)
//!       │
//!       └── post ──▶ on_connected(client end)
//!
//!  client.send(b) ──▶ server.inbox ── post flush ──▶ on_read(Data(b))
//! ```
//!
//! Either runloop backend works. An endpoint is its own migration descriptor: adopting
//! it rebinds future deliveries to the new runloop, and bumping its generation voids
//! any flush still queued on the old one.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering},
        Arc, Mutex, OnceLock, Weak,
    },
};

use lock_freedom::map::Map;
use tracing::{debug, trace};

use crate::{
    poll::lock,
    runloop::{Runloop, WeakRunloop},
};

use super::{
    AcceptCallback, CloseCallback, ConnectCallback, Descriptor, NetResult, NetworkError,
    ReadCallback, ReadEvent, Stream, Transport, TransportFactory, Uri,
};

pub const DEFAULT_SCHEME: &str = "mem";

const FIRST_EPHEMERAL_PORT: u16 = 49152;

static NEXT_ENDPOINT_ID: AtomicU64 = AtomicU64::new(1);

struct Registry {
    listeners: Map<String, Arc<Listener>>,
    // Serializes check-then-insert on bind; lookups stay lock-free.
    bind: Mutex<()>,
    next_port: AtomicU16,
}

impl Registry {
    fn new() -> Self {
        Self {
            listeners: Map::new(),
            bind: Mutex::new(()),
            next_port: AtomicU16::new(FIRST_EPHEMERAL_PORT),
        }
    }

    fn lookup(&self, authority: &str) -> Option<Arc<Listener>> {
        self.listeners.get(authority).map(|entry| entry.val().clone())
    }

    fn bind<F>(&self, uri: &Uri, listener: F) -> NetResult<Arc<Listener>>
    where
        F: FnOnce(Uri) -> Arc<Listener>,
    {
        let _guard = lock(&self.bind);
        let uri = if uri.port() == 0 {
            loop {
                let port = self.next_port.fetch_add(1, Ordering::Relaxed);
                let candidate = uri.with_port(port.max(FIRST_EPHEMERAL_PORT));
                if self.lookup(&candidate.authority()).is_none() {
                    break candidate;
                }
            }
        } else {
            uri.clone()
        };

        let authority = uri.authority();
        if self.lookup(&authority).is_some() {
            return Err(NetworkError::AddrInUse(uri.to_string()));
        }
        let listener = listener(uri);
        self.listeners.insert(authority, listener.clone());
        Ok(listener)
    }

    fn unbind(&self, listener: &Arc<Listener>) {
        let _guard = lock(&self.bind);
        let authority = listener.uri.authority();
        if let Some(current) = self.lookup(&authority) {
            if Arc::ptr_eq(&current, listener) {
                self.listeners.remove(&authority);
            }
        }
    }
}

/// Factory for in-process transports.
#[derive(Clone)]
pub struct MemNetwork {
    scheme: String,
    registry: Arc<Registry>,
}

impl Default for MemNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl MemNetwork {
    pub fn new() -> Self {
        Self::with_scheme(DEFAULT_SCHEME)
    }

    /// A separate in-process network answering to `scheme`.
    pub fn with_scheme(scheme: impl Into<String>) -> Self {
        Self {
            scheme: scheme.into(),
            registry: Arc::new(Registry::new()),
        }
    }

    /// Number of bound listeners.
    pub fn listeners(&self) -> usize {
        self.registry.listeners.iter().count()
    }
}

impl TransportFactory for MemNetwork {
    fn scheme(&self) -> &str {
        &self.scheme
    }

    fn transport(&self, runloop: &Runloop) -> NetResult<Arc<dyn Transport>> {
        Ok(Arc::new(MemTransport {
            inner: Arc::new(TransportInner {
                scheme: self.scheme.clone(),
                registry: self.registry.clone(),
                runloop: runloop.clone(),
                state: Mutex::new(TransportState::default()),
            }),
        }))
    }

    fn adopt(&self, runloop: &Runloop, descriptor: Descriptor) -> NetResult<Arc<dyn Stream>> {
        if descriptor.scheme() != self.scheme {
            return Err(NetworkError::ForeignDescriptor(
                descriptor.scheme().to_string(),
            ));
        }
        let MemDescriptor(endpoint) = descriptor.downcast::<MemDescriptor>()?;
        endpoint.rebind(runloop);
        trace!(endpoint = endpoint.id, runloop = runloop.name(), "mem stream adopted");
        Ok(Arc::new(MemStream::new(&self.scheme, runloop, endpoint)))
    }
}

struct Listener {
    uri: Uri,
    runloop: WeakRunloop,
    on_accept: Mutex<Option<AcceptCallback>>,
    closed: AtomicBool,
}

impl Listener {
    fn accept(&self, scheme: &str, runloop: &Runloop, endpoint: Arc<Endpoint>) {
        if self.closed.load(Ordering::Acquire) {
            endpoint.shutdown();
            return;
        }
        let callback = lock(&self.on_accept).take();
        let Some(mut callback) = callback else {
            endpoint.shutdown();
            return;
        };
        debug!(uri = %self.uri, endpoint = endpoint.id, "mem connection accepted");
        callback(Arc::new(MemStream::new(scheme, runloop, endpoint)));

        let discard = {
            let mut slot = lock(&self.on_accept);
            if slot.is_none() && !self.closed.load(Ordering::Acquire) {
                *slot = Some(callback);
                None
            } else {
                Some(callback)
            }
        };
        drop(discard);
    }
}

#[derive(Default)]
struct TransportState {
    listener: Option<Arc<Listener>>,
    pending: Option<ConnectCallback>,
    closed: bool,
}

struct TransportInner {
    scheme: String,
    registry: Arc<Registry>,
    runloop: Runloop,
    state: Mutex<TransportState>,
}

impl TransportInner {
    fn complete_connect(&self, result: NetResult<Arc<Endpoint>>) {
        let pending = lock(&self.state).pending.take();
        match (pending, result) {
            (Some(on_connected), result) => on_connected(result.map(|endpoint| {
                Arc::new(MemStream::new(&self.scheme, &self.runloop, endpoint)) as Arc<dyn Stream>
            })),
            // Aborted by close: the peer sees the orphaned end hang up.
            (None, Ok(endpoint)) => endpoint.shutdown(),
            (None, Err(_)) => {}
        }
    }
}

/// An in-process listener or connector.
pub struct MemTransport {
    inner: Arc<TransportInner>,
}

impl Transport for MemTransport {
    fn scheme(&self) -> &str {
        &self.inner.scheme
    }

    fn runloop(&self) -> Runloop {
        self.inner.runloop.clone()
    }

    fn listen(&self, uri: &Uri, on_accept: AcceptCallback) -> NetResult<()> {
        let mut state = lock(&self.inner.state);
        if state.closed {
            return Err(NetworkError::Closed);
        }
        if state.listener.is_some() {
            return Err(NetworkError::InProgress);
        }
        let runloop = self.inner.runloop.downgrade();
        let listener = self.inner.registry.bind(uri, |uri| {
            Arc::new(Listener {
                uri,
                runloop,
                on_accept: Mutex::new(Some(on_accept)),
                closed: AtomicBool::new(false),
            })
        })?;
        debug!(uri = %listener.uri, "mem listener bound");
        state.listener = Some(listener);
        Ok(())
    }

    fn connect(&self, uri: &Uri, on_connected: ConnectCallback) -> NetResult<()> {
        {
            let mut state = lock(&self.inner.state);
            if state.closed {
                return Err(NetworkError::Closed);
            }
            if state.pending.is_some() {
                return Err(NetworkError::InProgress);
            }
            state.pending = Some(on_connected);
        }

        let target = self
            .inner
            .registry
            .lookup(&uri.authority())
            .and_then(|listener| listener.runloop.upgrade().map(|runloop| (listener, runloop)));

        let result = match target {
            Some((listener, listener_loop)) => {
                let (client, server) = Endpoint::pair(
                    &self.inner.runloop,
                    &listener_loop,
                    format!("{}#client", listener.uri),
                    format!("{}#server", listener.uri),
                );
                let scheme = self.inner.scheme.clone();
                let accept_loop = listener_loop.clone();
                match listener_loop.post_task(move || listener.accept(&scheme, &accept_loop, server)) {
                    Ok(()) => Ok(client),
                    Err(_) => Err(NetworkError::Unreachable(uri.to_string())),
                }
            }
            None => Err(NetworkError::Unreachable(uri.to_string())),
        };

        trace!(%uri, reachable = result.is_ok(), "mem connect dispatched");
        let inner = self.inner.clone();
        self.inner
            .runloop
            .schedule(Box::new(move || inner.complete_connect(result)));
        Ok(())
    }

    fn local_uri(&self) -> Option<Uri> {
        lock(&self.inner.state)
            .listener
            .as_ref()
            .map(|listener| listener.uri.clone())
    }

    fn close(&self, on_closed: CloseCallback) {
        let (listener, pending) = {
            let mut state = lock(&self.inner.state);
            state.closed = true;
            (state.listener.take(), state.pending.take())
        };
        if let Some(listener) = listener {
            listener.closed.store(true, Ordering::Release);
            let callback = lock(&listener.on_accept).take();
            drop(callback);
            self.inner.registry.unbind(&listener);
            debug!(uri = %listener.uri, "mem listener closed");
        }
        self.inner.runloop.defer(Box::new(move || {
            if let Some(on_connected) = pending {
                on_connected(Err(NetworkError::Aborted));
            }
            on_closed();
        }));
    }
}

#[derive(Default)]
struct EndpointState {
    inbox: VecDeque<Vec<u8>>,
    reader: Option<ReadCallback>,
    reading: bool,
    flush_scheduled: bool,
    peer_closed: bool,
    eof_delivered: bool,
    closed: bool,
}

enum Delivery {
    Data(Vec<u8>),
    Eof,
}

struct Endpoint {
    id: u64,
    name: String,
    runloop: Mutex<WeakRunloop>,
    generation: AtomicU64,
    peer: OnceLock<Weak<Endpoint>>,
    state: Mutex<EndpointState>,
}

impl Endpoint {
    fn new(runloop: &Runloop, name: String) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_ENDPOINT_ID.fetch_add(1, Ordering::Relaxed),
            name,
            runloop: Mutex::new(runloop.downgrade()),
            generation: AtomicU64::new(0),
            peer: OnceLock::new(),
            state: Mutex::new(EndpointState::default()),
        })
    }

    fn pair(
        a_loop: &Runloop,
        b_loop: &Runloop,
        a_name: String,
        b_name: String,
    ) -> (Arc<Self>, Arc<Self>) {
        let a = Self::new(a_loop, a_name);
        let b = Self::new(b_loop, b_name);
        let _ = a.peer.set(Arc::downgrade(&b));
        let _ = b.peer.set(Arc::downgrade(&a));
        (a, b)
    }

    fn peer(&self) -> Option<Arc<Endpoint>> {
        self.peer.get().and_then(Weak::upgrade)
    }

    fn rebind(&self, runloop: &Runloop) {
        *lock(&self.runloop) = runloop.downgrade();
    }

    fn deliver(self: &Arc<Self>, bytes: Vec<u8>) -> NetResult<()> {
        let mut state = lock(&self.state);
        if state.closed {
            return Err(NetworkError::Closed);
        }
        state.inbox.push_back(bytes);
        if state.reading {
            self.schedule_flush(&mut state);
        }
        Ok(())
    }

    fn on_peer_closed(self: &Arc<Self>) {
        let mut state = lock(&self.state);
        if state.closed || state.peer_closed {
            return;
        }
        state.peer_closed = true;
        if state.reading {
            self.schedule_flush(&mut state);
        }
    }

    fn schedule_flush(self: &Arc<Self>, state: &mut EndpointState) {
        if state.flush_scheduled {
            return;
        }
        let Some(runloop) = lock(&self.runloop).upgrade() else {
            return;
        };
        state.flush_scheduled = true;
        let generation = self.generation.load(Ordering::Acquire);
        let this = self.clone();
        runloop.schedule(Box::new(move || this.flush(generation)));
    }

    fn flush(&self, generation: u64) {
        let current = || self.generation.load(Ordering::Acquire) == generation;
        let mut reader = {
            let mut state = lock(&self.state);
            if !current() {
                return;
            }
            state.flush_scheduled = false;
            if !state.reading {
                return;
            }
            match state.reader.take() {
                Some(reader) => reader,
                None => return,
            }
        };

        loop {
            let delivery = {
                let mut state = lock(&self.state);
                // Stop as soon as the reader stopped, closed, was replaced or the
                // endpoint moved to another runloop.
                if !state.reading || state.closed || state.reader.is_some() || !current() {
                    break;
                }
                if let Some(chunk) = state.inbox.pop_front() {
                    Delivery::Data(chunk)
                } else if state.peer_closed && !state.eof_delivered {
                    state.eof_delivered = true;
                    Delivery::Eof
                } else {
                    break;
                }
            };
            match delivery {
                Delivery::Data(chunk) => reader(ReadEvent::Data(&chunk)),
                Delivery::Eof => reader(ReadEvent::Eof),
            }
        }

        let discard = {
            let mut state = lock(&self.state);
            if state.reading && state.reader.is_none() && !state.closed && current() {
                state.reader = Some(reader);
                None
            } else {
                Some(reader)
            }
        };
        drop(discard);
    }

    fn start_read(self: &Arc<Self>, on_read: ReadCallback) -> NetResult<()> {
        let previous = {
            let mut state = lock(&self.state);
            if state.closed {
                return Err(NetworkError::Closed);
            }
            let previous = state.reader.replace(on_read);
            state.reading = true;
            if !state.inbox.is_empty() || (state.peer_closed && !state.eof_delivered) {
                self.schedule_flush(&mut state);
            }
            previous
        };
        drop(previous);
        Ok(())
    }

    fn stop_read(&self) {
        let reader = {
            let mut state = lock(&self.state);
            state.reading = false;
            state.reader.take()
        };
        drop(reader);
    }

    fn detach(&self) -> NetResult<()> {
        let mut state = lock(&self.state);
        if state.closed {
            return Err(NetworkError::Closed);
        }
        if state.reading {
            return Err(NetworkError::Reading);
        }
        self.generation.fetch_add(1, Ordering::AcqRel);
        state.flush_scheduled = false;
        Ok(())
    }

    fn shutdown(&self) {
        let reader = {
            let mut state = lock(&self.state);
            if state.closed {
                return;
            }
            state.closed = true;
            state.reading = false;
            state.inbox.clear();
            state.reader.take()
        };
        drop(reader);
        trace!(endpoint = self.id, name = %self.name, "mem endpoint shut down");
        if let Some(peer) = self.peer() {
            peer.on_peer_closed();
        }
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        let closed = lock(&self.state).closed;
        if !closed {
            if let Some(peer) = self.peer() {
                peer.on_peer_closed();
            }
        }
    }
}

struct MemDescriptor(Arc<Endpoint>);

/// One end of an in-process connection.
pub struct MemStream {
    scheme: String,
    runloop: Runloop,
    endpoint: Arc<Endpoint>,
    detached: AtomicBool,
}

impl MemStream {
    fn new(scheme: &str, runloop: &Runloop, endpoint: Arc<Endpoint>) -> Self {
        Self {
            scheme: scheme.to_string(),
            runloop: runloop.clone(),
            endpoint,
            detached: AtomicBool::new(false),
        }
    }

    fn attached(&self) -> NetResult<&Arc<Endpoint>> {
        if self.detached.load(Ordering::Acquire) {
            return Err(NetworkError::Detached);
        }
        Ok(&self.endpoint)
    }
}

impl Stream for MemStream {
    fn scheme(&self) -> &str {
        &self.scheme
    }

    fn runloop(&self) -> Runloop {
        self.runloop.clone()
    }

    fn peer(&self) -> Option<String> {
        self.endpoint.peer().map(|peer| peer.name.clone())
    }

    fn start_read(&self, on_read: ReadCallback) -> NetResult<()> {
        self.attached()?.start_read(on_read)
    }

    fn stop_read(&self) -> NetResult<()> {
        self.attached()?.stop_read();
        Ok(())
    }

    fn send(&self, bytes: Vec<u8>) -> NetResult<()> {
        let endpoint = self.attached()?;
        if lock(&endpoint.state).closed {
            return Err(NetworkError::Closed);
        }
        if bytes.is_empty() {
            return Ok(());
        }
        let peer = endpoint.peer().ok_or(NetworkError::Closed)?;
        peer.deliver(bytes)
    }

    fn close(&self, on_closed: CloseCallback) {
        if let Ok(endpoint) = self.attached() {
            endpoint.shutdown();
        }
        self.runloop.defer(on_closed);
    }

    fn detach(&self) -> NetResult<Descriptor> {
        let endpoint = self.attached()?;
        endpoint.detach()?;
        self.detached.store(true, Ordering::Release);
        trace!(endpoint = endpoint.id, runloop = self.runloop.name(), "mem stream detached");
        Ok(Descriptor::new(
            self.scheme.clone(),
            MemDescriptor(endpoint.clone()),
        ))
    }
}
