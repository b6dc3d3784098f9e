//! Non-blocking TCP transport on the `mio` runloop backend.
//!
//! Listeners and streams register with the poller of the runloop they are bound to,
//! and every readiness event is handled on that runloop's thread.
//!
//! ## Event Handling Pipeline
//!
//! ```text
//! 1. Listener readable ──> ListenerHandler::handle_event()
//!        - accept() until WouldBlock
//!        - register each stream with READABLE | WRITABLE
//!        - call on_accept(stream)
//!
//! 2. Outbound connect:
//!    TcpStream::connect() ──> register ──> first writable event
//!        - take_error() / peer_addr() decide success or failure
//!        - call on_connected(result)
//!
//! 3. Stream events ──> StreamHandler::handle_event()
//!        readable ──> read into a pooled buffer until WouldBlock ──> on_read(Data | Eof | Failed)
//!        writable ──> flush the pending write buffer
//!
//! 4. Migration:
//!    detach() ──> deregister, hand over socket + unsent bytes
//!    adopt()  ──> register on the new runloop, flush unsent bytes
//! ```

pub mod config;

use std::{
    io::{self, ErrorKind, Read, Write},
    net::{SocketAddr, ToSocketAddrs},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, Weak,
    },
};

use mio::{
    net::{TcpListener, TcpStream},
    Interest, Token,
};
use tracing::{debug, trace, warn};

use crate::{
    event::Readiness,
    handler::EventHandler,
    object_pool::ObjectPool,
    poll::lock,
    runloop::Runloop,
};

use super::{
    AcceptCallback, CloseCallback, ConnectCallback, Descriptor, NetResult, NetworkError,
    ReadCallback, ReadEvent, Stream, Transport, TransportFactory, Uri,
};

pub use config::TcpConfig;

pub const SCHEME: &str = "tcp";

static NEXT_STREAM_ID: AtomicU64 = AtomicU64::new(1);

fn require_mio(runloop: &Runloop) -> NetResult<()> {
    if runloop.mio().is_none() {
        return Err(NetworkError::BackendUnsupported(runloop.backend()));
    }
    Ok(())
}

fn resolve(uri: &Uri) -> NetResult<SocketAddr> {
    (uri.host(), uri.port())
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| NetworkError::InvalidUri {
            uri: uri.to_string(),
            reason: "host did not resolve".to_string(),
        })
}

fn deregister(runloop: &Runloop, source: &mut impl mio::event::Source, token: Token) {
    if let Some(mio) = runloop.mio() {
        if let Err(err) = mio.deregister(source, token) {
            warn!(token = token.0, %err, "failed to deregister socket");
        }
    }
}

/// Factory for TCP transports. Every transport and adopted stream shares one pool
/// of read buffers.
#[derive(Clone, Debug)]
pub struct TcpNetwork {
    config: TcpConfig,
    buffers: ObjectPool<Vec<u8>>,
}

impl Default for TcpNetwork {
    fn default() -> Self {
        Self::new(TcpConfig::default())
    }
}

impl TcpNetwork {
    pub fn new(config: TcpConfig) -> Self {
        let buffers = ObjectPool::buffers(config.pool_size, config.buffer_size);
        Self { config, buffers }
    }

    pub fn config(&self) -> &TcpConfig {
        &self.config
    }
}

impl TransportFactory for TcpNetwork {
    fn scheme(&self) -> &str {
        SCHEME
    }

    fn transport(&self, runloop: &Runloop) -> NetResult<Arc<dyn Transport>> {
        require_mio(runloop)?;
        Ok(Arc::new(TcpTransport {
            inner: Arc::new(TransportInner {
                runloop: runloop.clone(),
                config: self.config.clone(),
                buffers: self.buffers.clone(),
                state: Mutex::new(TransportState::default()),
                on_accept: Mutex::new(None),
            }),
        }))
    }

    fn adopt(&self, runloop: &Runloop, descriptor: Descriptor) -> NetResult<Arc<dyn Stream>> {
        require_mio(runloop)?;
        let TcpDescriptor {
            socket,
            peer,
            unsent,
        } = descriptor.downcast::<TcpDescriptor>()?;
        let inner = StreamInner::register(
            runloop,
            socket,
            peer,
            Phase::Open,
            unsent,
            self.buffers.clone(),
        )?;
        inner.flush_outbox()?;
        trace!(stream = inner.id, runloop = runloop.name(), %peer, "tcp stream adopted");
        Ok(Arc::new(TcpConnection { inner }))
    }
}

struct TcpDescriptor {
    socket: TcpStream,
    peer: SocketAddr,
    unsent: Vec<u8>,
}

struct BoundListener {
    socket: TcpListener,
    token: Token,
    local: SocketAddr,
}

#[derive(Default)]
struct TransportState {
    listener: Option<BoundListener>,
    connecting: Option<Arc<StreamInner>>,
    closed: bool,
}

struct TransportInner {
    runloop: Runloop,
    config: TcpConfig,
    buffers: ObjectPool<Vec<u8>>,
    state: Mutex<TransportState>,
    on_accept: Mutex<Option<AcceptCallback>>,
}

/// Handler for accepting new connections
struct ListenerHandler {
    transport: Weak<TransportInner>,
}

impl EventHandler for ListenerHandler {
    fn handle_event(&self, event: &Readiness) {
        if !event.is_readable() {
            return;
        }
        if let Some(transport) = self.transport.upgrade() {
            transport.accept_ready();
        }
    }
}

impl TransportInner {
    fn accept_ready(&self) {
        let mut accepted = Vec::new();
        loop {
            let result = {
                let state = lock(&self.state);
                match state.listener.as_ref() {
                    Some(listener) => listener.socket.accept(),
                    None => return,
                }
            };
            match result {
                Ok((socket, peer)) => {
                    if let Err(err) = socket.set_nodelay(self.config.no_delay) {
                        warn!(%peer, %err, "failed to set TCP_NODELAY");
                    }
                    match StreamInner::register(
                        &self.runloop,
                        socket,
                        peer,
                        Phase::Open,
                        Vec::new(),
                        self.buffers.clone(),
                    ) {
                        Ok(inner) => {
                            debug!(stream = inner.id, %peer, "tcp connection accepted");
                            accepted.push(inner);
                        }
                        Err(err) => warn!(%peer, %err, "failed to register accepted connection"),
                    }
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => {
                    warn!(err = %NetworkError::Accept(err), "tcp accept failed");
                    break;
                }
            }
        }

        if accepted.is_empty() {
            return;
        }
        let Some(mut on_accept) = lock(&self.on_accept).take() else {
            return;
        };
        for inner in accepted {
            on_accept(Arc::new(TcpConnection { inner }));
        }
        let closed = lock(&self.state).closed;
        let discard = {
            let mut slot = lock(&self.on_accept);
            if slot.is_none() && !closed {
                *slot = Some(on_accept);
                None
            } else {
                Some(on_accept)
            }
        };
        drop(discard);
    }
}

/// A TCP listener or connector bound to a `mio` runloop.
pub struct TcpTransport {
    inner: Arc<TransportInner>,
}

impl Transport for TcpTransport {
    fn scheme(&self) -> &str {
        SCHEME
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
        let mio = self
            .inner
            .runloop
            .mio()
            .ok_or(NetworkError::BackendUnsupported(self.inner.runloop.backend()))?;

        let addr = resolve(uri)?;
        let mut socket = TcpListener::bind(addr).map_err(|err| match err.kind() {
            ErrorKind::AddrInUse => NetworkError::AddrInUse(uri.to_string()),
            _ => NetworkError::Io(err),
        })?;
        let local = socket.local_addr()?;
        *lock(&self.inner.on_accept) = Some(on_accept);
        let token = mio.register(
            &mut socket,
            Interest::READABLE,
            ListenerHandler {
                transport: Arc::downgrade(&self.inner),
            },
        )?;
        debug!(%local, token = token.0, "tcp listener bound");
        state.listener = Some(BoundListener {
            socket,
            token,
            local,
        });
        Ok(())
    }

    fn connect(&self, uri: &Uri, on_connected: ConnectCallback) -> NetResult<()> {
        let mut state = lock(&self.inner.state);
        if state.closed {
            return Err(NetworkError::Closed);
        }
        if state
            .connecting
            .as_ref()
            .is_some_and(|inner| inner.is_connecting())
        {
            return Err(NetworkError::InProgress);
        }

        let addr = resolve(uri)?;
        let connect_error = |source: io::Error| NetworkError::Connect {
            uri: uri.to_string(),
            source,
        };
        let socket = TcpStream::connect(addr).map_err(connect_error)?;
        if let Err(err) = socket.set_nodelay(self.inner.config.no_delay) {
            warn!(%addr, %err, "failed to set TCP_NODELAY");
        }
        let inner = StreamInner::register(
            &self.inner.runloop,
            socket,
            addr,
            Phase::Connecting(on_connected),
            Vec::new(),
            self.inner.buffers.clone(),
        )?;
        debug!(stream = inner.id, %addr, "tcp connect started");
        state.connecting = Some(inner);
        Ok(())
    }

    fn local_uri(&self) -> Option<Uri> {
        let state = lock(&self.inner.state);
        let local = state.listener.as_ref()?.local;
        Uri::parse(&format!("{SCHEME}://{local}")).ok()
    }

    fn close(&self, on_closed: CloseCallback) {
        let (listener, connecting) = {
            let mut state = lock(&self.inner.state);
            state.closed = true;
            (state.listener.take(), state.connecting.take())
        };
        let on_accept = lock(&self.inner.on_accept).take();
        drop(on_accept);

        if let Some(mut listener) = listener {
            deregister(&self.inner.runloop, &mut listener.socket, listener.token);
            debug!(local = %listener.local, "tcp listener closed");
        }
        let pending = connecting.and_then(|inner| inner.abort_connect());
        self.inner.runloop.defer(Box::new(move || {
            if let Some(on_connected) = pending {
                on_connected(Err(NetworkError::Aborted));
            }
            on_closed();
        }));
    }
}

enum Phase {
    Connecting(ConnectCallback),
    Open,
    Detached,
    Closed,
}

struct StreamState {
    socket: Option<TcpStream>,
    token: Option<Token>,
    phase: Phase,
    reader: Option<ReadCallback>,
    reading: bool,
    read_scheduled: bool,
    eof: bool,
    outbox: Vec<u8>,
}

enum ConnectOutcome {
    Pending,
    Connected,
    Failed(io::Error),
}

struct StreamInner {
    id: u64,
    runloop: Runloop,
    peer: SocketAddr,
    buffers: ObjectPool<Vec<u8>>,
    state: Mutex<StreamState>,
    me: Weak<StreamInner>,
}

/// Handler for individual TCP connections
struct StreamHandler {
    stream: Weak<StreamInner>,
}

impl EventHandler for StreamHandler {
    fn handle_event(&self, event: &Readiness) {
        if let Some(stream) = self.stream.upgrade() {
            stream.handle_event(event);
        }
    }
}

impl StreamInner {
    fn register(
        runloop: &Runloop,
        mut socket: TcpStream,
        peer: SocketAddr,
        phase: Phase,
        outbox: Vec<u8>,
        buffers: ObjectPool<Vec<u8>>,
    ) -> NetResult<Arc<Self>> {
        let mio = runloop
            .mio()
            .ok_or(NetworkError::BackendUnsupported(runloop.backend()))?;
        let inner = Arc::new_cyclic(|me: &Weak<StreamInner>| StreamInner {
            id: NEXT_STREAM_ID.fetch_add(1, Ordering::Relaxed),
            runloop: runloop.clone(),
            peer,
            buffers,
            state: Mutex::new(StreamState {
                socket: None,
                token: None,
                phase: Phase::Closed,
                reader: None,
                reading: false,
                read_scheduled: false,
                eof: false,
                outbox: Vec::new(),
            }),
            me: me.clone(),
        });
        // Registered under the state lock so an early event sees the final state.
        let mut state = lock(&inner.state);
        let token = mio.register(
            &mut socket,
            Interest::READABLE | Interest::WRITABLE,
            StreamHandler {
                stream: Arc::downgrade(&inner),
            },
        )?;
        state.socket = Some(socket);
        state.token = Some(token);
        state.phase = phase;
        state.outbox = outbox;
        drop(state);
        Ok(inner)
    }

    fn handle(&self) -> Option<Arc<dyn Stream>> {
        self.me
            .upgrade()
            .map(|inner| Arc::new(TcpConnection { inner }) as Arc<dyn Stream>)
    }

    fn is_connecting(&self) -> bool {
        matches!(lock(&self.state).phase, Phase::Connecting(_))
    }

    fn handle_event(&self, event: &Readiness) {
        if self.is_connecting() {
            if event.is_writable() || event.is_error() || event.is_closed() {
                self.finish_connect();
            }
            return;
        }
        if event.is_writable() {
            if let Err(err) = self.flush_outbox() {
                self.fail(err);
                return;
            }
        }
        if event.is_readable() || event.is_closed() || event.is_error() {
            self.read_ready();
        }
    }

    fn finish_connect(&self) {
        let outcome = {
            let state = lock(&self.state);
            let Some(socket) = state.socket.as_ref() else {
                return;
            };
            match socket.take_error() {
                Ok(Some(err)) | Err(err) => ConnectOutcome::Failed(err),
                Ok(None) => match socket.peer_addr() {
                    Ok(_) => ConnectOutcome::Connected,
                    Err(err) if err.kind() == ErrorKind::NotConnected => ConnectOutcome::Pending,
                    Err(err) => ConnectOutcome::Failed(err),
                },
            }
        };

        match outcome {
            ConnectOutcome::Pending => {}
            ConnectOutcome::Connected => {
                let on_connected = {
                    let mut state = lock(&self.state);
                    match std::mem::replace(&mut state.phase, Phase::Open) {
                        Phase::Connecting(on_connected) => on_connected,
                        other => {
                            state.phase = other;
                            return;
                        }
                    }
                };
                debug!(stream = self.id, peer = %self.peer, "tcp connection established");
                match self.handle() {
                    Some(stream) => on_connected(Ok(stream)),
                    None => on_connected(Err(NetworkError::Closed)),
                }
            }
            ConnectOutcome::Failed(source) => {
                debug!(stream = self.id, peer = %self.peer, %source, "tcp connect failed");
                if let Some(on_connected) = self.abort_connect() {
                    on_connected(Err(NetworkError::Connect {
                        uri: format!("{SCHEME}://{}", self.peer),
                        source,
                    }));
                }
            }
        }
    }

    /// Tears down a connect still in flight and hands back its callback.
    fn abort_connect(&self) -> Option<ConnectCallback> {
        let (socket, on_connected) = {
            let mut state = lock(&self.state);
            if !matches!(state.phase, Phase::Connecting(_)) {
                return None;
            }
            let Phase::Connecting(on_connected) =
                std::mem::replace(&mut state.phase, Phase::Closed)
            else {
                return None;
            };
            (state.socket.take().zip(state.token.take()), on_connected)
        };
        if let Some((mut socket, token)) = socket {
            deregister(&self.runloop, &mut socket, token);
        }
        Some(on_connected)
    }

    fn read_ready(&self) {
        let mut reader = {
            let mut state = lock(&self.state);
            if !state.reading || state.eof || !matches!(state.phase, Phase::Open) {
                return;
            }
            match state.reader.take() {
                Some(reader) => reader,
                None => return,
            }
        };

        loop {
            let mut buffer = self.buffers.acquire();
            let result = {
                let mut state = lock(&self.state);
                if !state.reading || state.reader.is_some() || !matches!(state.phase, Phase::Open) {
                    break;
                }
                match state.socket.as_mut() {
                    Some(socket) => socket.read(&mut buffer[..]),
                    None => break,
                }
            };
            match result {
                Ok(0) => {
                    trace!(stream = self.id, peer = %self.peer, "tcp peer closed");
                    lock(&self.state).eof = true;
                    reader(ReadEvent::Eof);
                    break;
                }
                Ok(len) => {
                    trace!(stream = self.id, len, "read data from socket");
                    reader(ReadEvent::Data(&buffer[..len]));
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => {
                    warn!(stream = self.id, peer = %self.peer, %err, "tcp read failed");
                    lock(&self.state).eof = true;
                    reader(ReadEvent::Failed(err.into()));
                    break;
                }
            }
        }

        let discard = {
            let mut state = lock(&self.state);
            if state.reading && state.reader.is_none() && matches!(state.phase, Phase::Open) {
                state.reader = Some(reader);
                None
            } else {
                Some(reader)
            }
        };
        drop(discard);
    }

    fn schedule_read(&self, state: &mut StreamState) {
        if state.read_scheduled {
            return;
        }
        let Some(this) = self.me.upgrade() else {
            return;
        };
        state.read_scheduled = true;
        self.runloop.schedule(Box::new(move || {
            lock(&this.state).read_scheduled = false;
            this.read_ready();
        }));
    }

    fn flush_outbox(&self) -> NetResult<()> {
        let mut state = lock(&self.state);
        let StreamState { socket, outbox, .. } = &mut *state;
        let Some(socket) = socket.as_mut() else {
            return Ok(());
        };
        let mut written = 0;
        let result = loop {
            if written == outbox.len() {
                break Ok(());
            }
            match socket.write(&outbox[written..]) {
                Ok(0) => break Err(io::Error::from(ErrorKind::WriteZero).into()),
                Ok(len) => written += len,
                Err(err) if err.kind() == ErrorKind::WouldBlock => break Ok(()),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => break Err(err.into()),
            }
        };
        outbox.drain(..written);
        if written > 0 {
            trace!(stream = self.id, len = written, remaining = outbox.len(), "wrote to socket");
        }
        result
    }

    fn fail(&self, err: NetworkError) {
        warn!(stream = self.id, peer = %self.peer, %err, "tcp write failed");
        let reader = {
            let mut state = lock(&self.state);
            state.eof = true;
            state.reader.take()
        };
        if let Some(mut reader) = reader {
            reader(ReadEvent::Failed(err));
        }
    }

    fn open_state(&self) -> NetResult<std::sync::MutexGuard<'_, StreamState>> {
        let state = lock(&self.state);
        let err = match state.phase {
            Phase::Open => None,
            Phase::Detached => Some(NetworkError::Detached),
            Phase::Connecting(_) => Some(NetworkError::InProgress),
            Phase::Closed => Some(NetworkError::Closed),
        };
        match err {
            None => Ok(state),
            Some(err) => Err(err),
        }
    }
}

impl Drop for StreamInner {
    fn drop(&mut self) {
        let state = match self.state.get_mut() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let (Some(mut socket), Some(token)) = (state.socket.take(), state.token.take()) {
            deregister(&self.runloop, &mut socket, token);
        }
    }
}

/// One TCP connection bound to a `mio` runloop.
pub struct TcpConnection {
    inner: Arc<StreamInner>,
}

impl Stream for TcpConnection {
    fn scheme(&self) -> &str {
        SCHEME
    }

    fn runloop(&self) -> Runloop {
        self.inner.runloop.clone()
    }

    fn peer(&self) -> Option<String> {
        Some(format!("{SCHEME}://{}", self.inner.peer))
    }

    fn start_read(&self, on_read: ReadCallback) -> NetResult<()> {
        let previous = {
            let mut state = self.inner.open_state()?;
            let previous = state.reader.replace(on_read);
            state.reading = true;
            // Edge-triggered readiness may already have fired; look once more.
            self.inner.schedule_read(&mut state);
            previous
        };
        drop(previous);
        Ok(())
    }

    fn stop_read(&self) -> NetResult<()> {
        let reader = {
            let mut state = self.inner.open_state()?;
            state.reading = false;
            state.reader.take()
        };
        drop(reader);
        Ok(())
    }

    fn send(&self, bytes: Vec<u8>) -> NetResult<()> {
        {
            let mut state = self.inner.open_state()?;
            state.outbox.extend_from_slice(&bytes);
        }
        self.inner.flush_outbox()
    }

    fn close(&self, on_closed: CloseCallback) {
        let pending = self.inner.abort_connect();
        let (socket, reader) = {
            let mut state = lock(&self.inner.state);
            if matches!(state.phase, Phase::Open) {
                state.phase = Phase::Closed;
            }
            state.reading = false;
            (
                state.socket.take().zip(state.token.take()),
                state.reader.take(),
            )
        };
        drop(reader);
        if let Some((mut socket, token)) = socket {
            deregister(&self.inner.runloop, &mut socket, token);
            debug!(stream = self.inner.id, peer = %self.inner.peer, "tcp connection closed");
        }
        self.inner.runloop.defer(Box::new(move || {
            if let Some(on_connected) = pending {
                on_connected(Err(NetworkError::Aborted));
            }
            on_closed();
        }));
    }

    fn detach(&self) -> NetResult<Descriptor> {
        let (mut socket, token, unsent) = {
            let mut state = self.inner.open_state()?;
            if state.reading {
                return Err(NetworkError::Reading);
            }
            let (Some(socket), Some(token)) = (state.socket.take(), state.token.take()) else {
                return Err(NetworkError::Closed);
            };
            state.phase = Phase::Detached;
            (socket, token, std::mem::take(&mut state.outbox))
        };
        deregister(&self.inner.runloop, &mut socket, token);
        trace!(stream = self.inner.id, unsent = unsent.len(), "tcp stream detached");
        Ok(Descriptor::new(
            SCHEME,
            TcpDescriptor {
                socket,
                peer: self.inner.peer,
                unsent,
            },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackendKind, RunloopConfig};
    use std::{
        sync::atomic::AtomicBool,
        time::{Duration, Instant},
    };

    fn mio_loop(name: &str) -> Runloop {
        Runloop::new(&RunloopConfig::builder().name(name).build()).unwrap()
    }

    fn drive(runloops: &[&Runloop], mut done: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !done() {
            assert!(Instant::now() < deadline, "tcp transport did not converge");
            for runloop in runloops {
                runloop.run_once(Some(Duration::from_millis(1))).unwrap();
            }
        }
    }

    type Slot<T> = Arc<Mutex<Option<T>>>;

    fn collect(stream: &Arc<dyn Stream>) -> (Arc<Mutex<Vec<u8>>>, Arc<AtomicBool>) {
        let data = Arc::new(Mutex::new(Vec::new()));
        let eof = Arc::new(AtomicBool::new(false));
        let (data_clone, eof_clone) = (data.clone(), eof.clone());
        stream
            .start_read(Box::new(move |event| match event {
                ReadEvent::Data(bytes) => data_clone.lock().unwrap().extend_from_slice(bytes),
                ReadEvent::Eof | ReadEvent::Failed(_) => eof_clone.store(true, Ordering::SeqCst),
            }))
            .unwrap();
        (data, eof)
    }

    fn connected_pair(
        network: &TcpNetwork,
        runloop: &Runloop,
    ) -> (Arc<dyn Transport>, Arc<dyn Stream>, Arc<dyn Stream>) {
        let listener = network.transport(runloop).unwrap();
        let accepted: Slot<Arc<dyn Stream>> = Arc::new(Mutex::new(None));
        let slot = accepted.clone();
        listener
            .listen(
                &Uri::parse("tcp://127.0.0.1:0").unwrap(),
                Box::new(move |stream| *slot.lock().unwrap() = Some(stream)),
            )
            .unwrap();
        let uri = listener.local_uri().unwrap();
        assert_ne!(uri.port(), 0);

        let connector = network.transport(runloop).unwrap();
        let connected: Slot<NetResult<Arc<dyn Stream>>> = Arc::new(Mutex::new(None));
        let slot = connected.clone();
        connector
            .connect(&uri, Box::new(move |result| *slot.lock().unwrap() = Some(result)))
            .unwrap();
        drive(&[runloop], || {
            accepted.lock().unwrap().is_some() && connected.lock().unwrap().is_some()
        });
        let client = connected.lock().unwrap().take().unwrap().unwrap();
        let server = accepted.lock().unwrap().take().unwrap();
        (listener, client, server)
    }

    #[test]
    fn test_requires_mio_backend() {
        let runloop =
            Runloop::new(&RunloopConfig::builder().backend(BackendKind::Park).build()).unwrap();
        assert!(matches!(
            TcpNetwork::default().transport(&runloop),
            Err(NetworkError::BackendUnsupported(BackendKind::Park))
        ));
    }

    #[test]
    fn test_echo_and_eof() {
        let network = TcpNetwork::new(TcpConfig::builder().buffer_size(4).build());
        let runloop = mio_loop("tcp");
        let (_listener, client, server) = connected_pair(&network, &runloop);
        assert!(client.peer().unwrap().starts_with("tcp://127.0.0.1:"));

        let (server_data, server_eof) = collect(&server);
        client.send(b"hello over tcp".to_vec()).unwrap();
        drive(&[&runloop], || server_data.lock().unwrap().len() == 14);
        assert_eq!(&*server_data.lock().unwrap(), b"hello over tcp");

        let (client_data, _) = collect(&client);
        server.send(b"pong".to_vec()).unwrap();
        drive(&[&runloop], || client_data.lock().unwrap().len() == 4);

        let closed = Arc::new(AtomicBool::new(false));
        let closed_clone = closed.clone();
        client.close(Box::new(move || closed_clone.store(true, Ordering::SeqCst)));
        drive(&[&runloop], || {
            closed.load(Ordering::SeqCst) && server_eof.load(Ordering::SeqCst)
        });
        assert!(matches!(client.send(vec![1]), Err(NetworkError::Closed)));
    }

    #[test]
    fn test_connect_refused() {
        let port = {
            let free = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            free.local_addr().unwrap().port()
        };
        let runloop = mio_loop("tcp");
        let transport = TcpNetwork::default().transport(&runloop).unwrap();
        let uri = Uri::parse(&format!("tcp://127.0.0.1:{port}")).unwrap();
        let result: Slot<NetResult<Arc<dyn Stream>>> = Arc::new(Mutex::new(None));
        let slot = result.clone();
        match transport.connect(&uri, Box::new(move |r| *slot.lock().unwrap() = Some(r))) {
            Err(err) => assert!(err.is_unreachable(), "{err}"),
            Ok(()) => {
                drive(&[&runloop], || result.lock().unwrap().is_some());
                let err = result.lock().unwrap().take().unwrap().err().unwrap();
                assert!(err.is_unreachable(), "{err}");
            }
        }
    }

    #[test]
    fn test_listen_addr_in_use() {
        let runloop = mio_loop("tcp");
        let network = TcpNetwork::default();
        let first = network.transport(&runloop).unwrap();
        first
            .listen(&Uri::parse("tcp://127.0.0.1:0").unwrap(), Box::new(|_| {}))
            .unwrap();
        let uri = first.local_uri().unwrap();
        let second = network.transport(&runloop).unwrap();
        assert!(matches!(
            second.listen(&uri, Box::new(|_| {})),
            Err(NetworkError::AddrInUse(_))
        ));
    }

    #[test]
    fn test_detach_to_another_runloop() {
        let network = TcpNetwork::default();
        let source = mio_loop("source");
        let target = mio_loop("target");
        let (_listener, client, server) = connected_pair(&network, &source);

        let descriptor = server.detach().unwrap();
        client.send(b"moved".to_vec()).unwrap();
        let moved = network.adopt(&target, descriptor).unwrap();
        assert_eq!(moved.runloop(), target);

        let (data, _) = collect(&moved);
        drive(&[&source, &target], || data.lock().unwrap().len() == 5);
        assert_eq!(&*data.lock().unwrap(), b"moved");
        assert!(matches!(server.send(vec![1]), Err(NetworkError::Detached)));
    }
}
