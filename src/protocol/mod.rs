//! Connection state machine on top of the transport surface.
//!
//! A [`Protocol`] is either a listener or one end of a connection. It owns exactly one
//! [`Facility`]: the listening [`Transport`] or the communication [`Stream`]. Bytes
//! read from the stream are parsed by the protocol's [`Codec`] and handed to its
//! [`ProtocolHandler`]; messages passed to [`Protocol::send`] are queued, serialized
//! in batches and written on the protocol's runloop.
//!
//! ## Lifecycle
//!
//! ```text
//!  new ──listen──▶ Listening ──accept──▶ new Protocol (Inbound*) ──▶ on_client_accepted
//!   │
//!   └──connect_to──▶ Outbound* ──(retry.rs)──▶ on_connected(bool)
//!
//!  close(): ACTIVE ──CAS──▶ CLOSING ──every resource confirmed──▶ CLOSED ──▶ on_closed
//! ```
//!
//! Closing is two-phase. `close` flips `closing` once and asks every owned resource
//! (facility, in-flight connect transport, retry timer) to close; the last
//! confirmation marks the protocol closed and notifies the handler. Read and write
//! errors close the protocol on a later turn, never on the stack that detected them.
//!
//! A connected protocol can move to another runloop with [`Protocol::migrate`]. While
//! it moves, inbound messages are frozen and outbound messages are held; both resume
//! in order on the destination thread.

mod codec;
pub mod migration;
mod retry;

use std::{
    collections::VecDeque,
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex,
    },
};

use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::{
    config::RetryPolicy,
    error::{Error, Result},
    net::{Network, ReadCallback, ReadEvent, Stream, Transport, Uri},
    poll::lock,
    refcount::RefCounted,
    runloop::Runloop,
};

pub use codec::{Codec, JsonCodec, LineCodec};
pub use migration::MigrationHandle;
pub use retry::{ConnectState, ConnectedCallback};

use retry::Connector;

static NEXT_PROTOCOL_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Invalid,
    Listening,
    InboundInternal,
    InboundExternal,
    OutboundInternal,
    OutboundExternal,
}

impl Role {
    pub fn is_inbound(self) -> bool {
        matches!(self, Role::InboundInternal | Role::InboundExternal)
    }

    pub fn is_outbound(self) -> bool {
        matches!(self, Role::OutboundInternal | Role::OutboundExternal)
    }
}

/// Whether peers belong to the same deployment. Selects the internal or external
/// variant of the inbound and outbound roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Internal,
    #[default]
    External,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    pub retry: RetryPolicy,
    pub scope: Scope,
}

/// The one resource a protocol communicates through.
#[derive(Clone)]
pub enum Facility {
    Listening(Arc<dyn Transport>),
    Communication(Arc<dyn Stream>),
}

impl Facility {
    fn close<F>(&self, on_closed: F)
    where
        F: FnOnce() + Send + 'static,
    {
        match self {
            Facility::Listening(transport) => transport.close(Box::new(on_closed)),
            Facility::Communication(stream) => stream.close(Box::new(on_closed)),
        }
    }
}

/// Receives a protocol's messages and lifecycle notifications, on the runloop the
/// protocol is bound to at the time.
pub trait ProtocolHandler<C: Codec>: Send + Sync + 'static {
    fn on_message(&self, protocol: &Protocol<C>, message: C::Message);

    /// A listener accepted `client`, already attached and reading. The client keeps
    /// itself alive until it is closed.
    fn on_client_accepted(&self, listener: &Protocol<C>, client: Protocol<C>) {
        let _ = (listener, client);
    }

    /// Every resource confirmed closure. Runs exactly once.
    fn on_closed(&self, protocol: &Protocol<C>) {
        let _ = protocol;
    }
}

struct Outbound<M> {
    queue: Vec<M>,
    drain_scheduled: bool,
}

struct Inbound<M> {
    frozen: bool,
    queue: VecDeque<M>,
}

#[derive(Default)]
struct Lifecycle {
    migrating: bool,
    close_deferred: bool,
}

struct ProtocolInner<C: Codec> {
    id: u64,
    network: Network,
    config: ProtocolConfig,
    handler: Arc<dyn ProtocolHandler<C>>,
    role: Mutex<Role>,
    runloop: Mutex<Runloop>,
    closing: AtomicBool,
    closed: AtomicBool,
    facility: Mutex<Option<Facility>>,
    connector: Mutex<Option<Connector<C>>>,
    outbound: Mutex<Outbound<C::Message>>,
    inbound: Mutex<Inbound<C::Message>>,
    codec: Mutex<C>,
    lifecycle: Mutex<Lifecycle>,
}

pub struct Protocol<C: Codec> {
    inner: Arc<ProtocolInner<C>>,
}

impl<C: Codec> Clone for Protocol<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: Codec> PartialEq for Protocol<C> {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<C: Codec> fmt::Debug for Protocol<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Protocol")
            .field("id", &self.inner.id)
            .field("role", &self.role())
            .field("closing", &self.is_closing())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl<C: Codec> Protocol<C> {
    pub fn new<H>(
        runloop: &Runloop,
        network: Network,
        codec: C,
        handler: H,
        config: ProtocolConfig,
    ) -> Self
    where
        H: ProtocolHandler<C>,
    {
        Self::build(runloop, network, codec, Arc::new(handler), config, Role::Invalid)
    }

    fn build(
        runloop: &Runloop,
        network: Network,
        codec: C,
        handler: Arc<dyn ProtocolHandler<C>>,
        config: ProtocolConfig,
        role: Role,
    ) -> Self {
        let id = NEXT_PROTOCOL_ID.fetch_add(1, Ordering::Relaxed);
        trace!(protocol = id, runloop = runloop.name(), ?role, "protocol created");
        Self {
            inner: Arc::new(ProtocolInner {
                id,
                network,
                config,
                handler,
                role: Mutex::new(role),
                runloop: Mutex::new(runloop.clone()),
                closing: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                facility: Mutex::new(None),
                connector: Mutex::new(None),
                outbound: Mutex::new(Outbound {
                    queue: Vec::new(),
                    drain_scheduled: false,
                }),
                inbound: Mutex::new(Inbound {
                    frozen: false,
                    queue: VecDeque::new(),
                }),
                codec: Mutex::new(codec),
                lifecycle: Mutex::new(Lifecycle::default()),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn role(&self) -> Role {
        *lock(&self.inner.role)
    }

    pub fn config(&self) -> &ProtocolConfig {
        &self.inner.config
    }

    /// The runloop this protocol currently runs on. Changes after a migration.
    pub fn runloop(&self) -> Runloop {
        lock(&self.inner.runloop).clone()
    }

    pub fn is_closing(&self) -> bool {
        self.inner.closing.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub fn is_migrating(&self) -> bool {
        lock(&self.inner.lifecycle).migrating
    }

    /// The bound address of a listening protocol.
    pub fn local_uri(&self) -> Option<Uri> {
        match lock(&self.inner.facility).as_ref()? {
            Facility::Listening(transport) => transport.local_uri(),
            Facility::Communication(_) => None,
        }
    }

    /// The remote address of a connected protocol.
    pub fn peer(&self) -> Option<String> {
        match lock(&self.inner.facility).as_ref()? {
            Facility::Communication(stream) => stream.peer(),
            Facility::Listening(_) => None,
        }
    }

    /// Starts listening on `uri`. Bind failures are returned here. Must be called on
    /// the runloop thread.
    pub fn listen(&self, uri: &Uri) -> Result<()> {
        let runloop = self.runloop();
        runloop.check_thread()?;
        if self.is_closing() {
            return Err(Error::Closing);
        }
        let role = self.role();
        if role != Role::Invalid {
            return Err(Error::InvalidRole(role));
        }

        let transport = self.inner.network.transport(&runloop, uri)?;
        let listener = self.clone();
        transport.listen(
            uri,
            Box::new(move |stream| listener.accept(stream)),
        )?;
        debug!(protocol = self.id(), uri = ?transport.local_uri(), "listening");
        *lock(&self.inner.role) = Role::Listening;
        *lock(&self.inner.facility) = Some(Facility::Listening(transport));
        Ok(())
    }

    fn accept(&self, stream: Arc<dyn Stream>) {
        if self.is_closing() {
            stream.close(Box::new(|| {}));
            return;
        }
        let role = match self.inner.config.scope {
            Scope::Internal => Role::InboundInternal,
            Scope::External => Role::InboundExternal,
        };
        let client = Self::build(
            &stream.runloop(),
            self.inner.network.clone(),
            C::default(),
            self.inner.handler.clone(),
            self.inner.config,
            role,
        );
        debug!(listener = self.id(), protocol = client.id(), peer = ?stream.peer(), "client accepted");
        if let Err(err) = client.attach(Facility::Communication(stream)) {
            warn!(protocol = client.id(), %err, "failed to start reading");
            client.close();
            return;
        }
        self.inner.handler.on_client_accepted(self, client);
    }

    /// Installs the facility and, for streams, starts reading.
    fn attach(&self, facility: Facility) -> Result<()> {
        if let Facility::Communication(stream) = &facility {
            stream.start_read(self.reader())?;
        }
        *lock(&self.inner.facility) = Some(facility);
        Ok(())
    }

    fn reader(&self) -> ReadCallback {
        let protocol = self.clone();
        Box::new(move |event| protocol.on_read(event))
    }

    fn on_read(&self, event: ReadEvent<'_>) {
        match event {
            ReadEvent::Data(bytes) => {
                let parsed = lock(&self.inner.codec).parse(bytes);
                let messages = match parsed {
                    Ok(messages) => messages,
                    Err(err) => {
                        warn!(protocol = self.id(), %err, "failed to parse inbound bytes");
                        self.close();
                        return;
                    }
                };
                if messages.is_empty() {
                    return;
                }
                let ready = {
                    let mut inbound = lock(&self.inner.inbound);
                    if inbound.frozen {
                        trace!(protocol = self.id(), count = messages.len(), "inbound frozen");
                        inbound.queue.extend(messages);
                        None
                    } else {
                        Some(messages)
                    }
                };
                for message in ready.into_iter().flatten() {
                    self.inner.handler.on_message(self, message);
                }
            }
            ReadEvent::Eof => {
                debug!(protocol = self.id(), "peer closed");
                self.close();
            }
            ReadEvent::Failed(err) => {
                warn!(protocol = self.id(), %err, "read failed");
                self.close();
            }
        }
    }

    /// Queues `message` for the peer. Callable from any thread; messages are written
    /// in call order on the protocol's runloop. A message the codec cannot frame is
    /// rejected here and leaves the connection untouched.
    pub fn send(&self, message: C::Message) -> Result<()> {
        if self.is_closing() {
            return Err(Error::Closing);
        }
        lock(&self.inner.codec).validate(&message)?;
        lock(&self.inner.outbound).queue.push(message);
        self.request_drain();
        Ok(())
    }

    fn request_drain(&self) {
        {
            let mut outbound = lock(&self.inner.outbound);
            if outbound.drain_scheduled || outbound.queue.is_empty() {
                return;
            }
            outbound.drain_scheduled = true;
        }
        let this = self.clone();
        if let Err(err) = self.runloop().post_task(move || this.drain()) {
            debug!(protocol = self.id(), %err, "outbound drain not scheduled");
            lock(&self.inner.outbound).drain_scheduled = false;
        }
    }

    fn drain(&self) {
        if !self.runloop().is_current() {
            // Migrated since this drain was queued.
            lock(&self.inner.outbound).drain_scheduled = false;
            self.request_drain();
            return;
        }

        let (stream, messages) = {
            let lifecycle = lock(&self.inner.lifecycle);
            let facility = lock(&self.inner.facility);
            let mut outbound = lock(&self.inner.outbound);
            outbound.drain_scheduled = false;
            match facility.as_ref() {
                // Held until the stream is attached on the runloop it will stay on.
                Some(Facility::Communication(stream)) if !lifecycle.migrating => {
                    (stream.clone(), std::mem::take(&mut outbound.queue))
                }
                _ => return,
            }
        };
        if messages.is_empty() {
            return;
        }

        let count = messages.len();
        let serialized = lock(&self.inner.codec).serialize(messages);
        let written = serialized.and_then(|bytes| stream.send(bytes).map_err(Error::from));
        match written {
            Ok(()) => trace!(protocol = self.id(), count, "outbound drained"),
            Err(err) => {
                warn!(protocol = self.id(), %err, "write failed");
                self.close();
            }
        }
    }

    /// Requests closure. Only the first call has an effect; later calls, from any
    /// thread, are no-ops. [`ProtocolHandler::on_closed`] runs once every owned
    /// resource has confirmed.
    pub fn close(&self) {
        if self
            .inner
            .closing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        debug!(protocol = self.id(), role = ?self.role(), "closing");
        {
            let mut lifecycle = lock(&self.inner.lifecycle);
            if lifecycle.migrating {
                lifecycle.close_deferred = true;
                return;
            }
        }
        self.post_close();
    }

    fn post_close(&self) {
        let this = self.clone();
        self.runloop()
            .schedule(Box::new(move || this.close_resources()));
    }

    fn close_resources(&self) {
        let facility = lock(&self.inner.facility).take();
        let (transport, timer) = match lock(&self.inner.connector).as_mut() {
            Some(connector) => (connector.transport.take(), connector.timer.take()),
            None => (None, None),
        };

        let this = self.clone();
        let pending = RefCounted::new((), move |()| this.finish_close());
        let confirm = |pending: &RefCounted<()>| {
            let pending = pending.clone();
            move || {
                let _ = pending.dec();
            }
        };

        if let Some(facility) = facility {
            let _ = pending.inc();
            facility.close(confirm(&pending));
        }
        if let Some(transport) = transport {
            let _ = pending.inc();
            transport.close(Box::new(confirm(&pending)));
        }
        if let Some(timer) = timer {
            let _ = pending.inc();
            let this = self.clone();
            let done = confirm(&pending);
            let closing = timer.close(move || {
                this.finish_connect(ConnectState::Aborted);
                done();
            });
            if let Err(err) = closing {
                debug!(protocol = self.id(), %err, "retry timer already closed");
                self.finish_connect(ConnectState::Aborted);
                let _ = pending.dec();
            }
        }
        let _ = pending.dec();
    }

    fn finish_close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.finish_connect(ConnectState::Aborted);
        let outbound = std::mem::take(&mut lock(&self.inner.outbound).queue);
        let inbound = std::mem::take(&mut lock(&self.inner.inbound).queue);
        if !outbound.is_empty() || !inbound.is_empty() {
            debug!(
                protocol = self.id(),
                outbound = outbound.len(),
                inbound = inbound.len(),
                "dropping queued messages"
            );
        }
        debug!(protocol = self.id(), "closed");
        self.inner.handler.on_closed(self);
    }

    /// Moves a connected protocol to `to`, a runloop of the same backend. Callable
    /// from any thread. Inbound messages are frozen and outbound messages held until
    /// the stream is reading on `to`; then both resume in order and `on_migrated`
    /// runs there. If the handshake fails, `on_migrated` receives the error and the
    /// protocol closes.
    pub fn migrate<F>(&self, to: &Runloop, on_migrated: F) -> Result<()>
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        if self.is_closing() {
            return Err(Error::Closing);
        }
        let role = self.role();
        if !role.is_inbound() && !role.is_outbound() {
            return Err(Error::InvalidRole(role));
        }
        let from = self.runloop();
        if from == *to {
            return Err(Error::Migration("already on that runloop".to_string()));
        }
        if from.backend() != to.backend() {
            return Err(Error::BackendMismatch {
                expected: from.backend(),
                found: to.backend(),
            });
        }
        {
            let mut lifecycle = lock(&self.inner.lifecycle);
            // close() reads `migrating` under this lock; a close that got in first
            // has already posted its resource teardown.
            if self.is_closing() {
                return Err(Error::Closing);
            }
            if lifecycle.migrating {
                return Err(Error::Migration("already migrating".to_string()));
            }
            if !matches!(
                lock(&self.inner.facility).as_ref(),
                Some(Facility::Communication(_))
            ) {
                return Err(Error::Migration("no stream attached".to_string()));
            }
            lifecycle.migrating = true;
            lock(&self.inner.inbound).frozen = true;
        }
        debug!(protocol = self.id(), from = from.name(), to = to.name(), "migration requested");

        let this = self.clone();
        let to = to.clone();
        let posted = from.post_task(move || this.begin_migration(to, Box::new(on_migrated)));
        if let Err(err) = posted {
            let mut lifecycle = lock(&self.inner.lifecycle);
            lifecycle.migrating = false;
            lock(&self.inner.inbound).frozen = false;
            return Err(err);
        }
        Ok(())
    }

    fn begin_migration(&self, to: Runloop, on_migrated: Box<dyn FnOnce(Result<()>) + Send>) {
        let stream = match lock(&self.inner.facility).as_ref() {
            Some(Facility::Communication(stream)) => Some(stream.clone()),
            _ => None,
        };
        let Some(stream) = stream else {
            return self.complete_migration(
                Err(Error::Migration("stream was released".to_string())),
                on_migrated,
            );
        };
        if let Err(err) = stream.stop_read() {
            return self.complete_migration(Err(err.into()), on_migrated);
        }

        let this = self.clone();
        let on_migrated = Arc::new(Mutex::new(Some(on_migrated)));
        let on_done = on_migrated.clone();
        let started = migration::migrate_stream(&self.inner.network, stream, &to, move |result| {
            if let Some(on_migrated) = lock(&on_done).take() {
                this.complete_migration(result, on_migrated);
            }
        });
        if let Err(err) = started {
            if let Some(on_migrated) = lock(&on_migrated).take() {
                self.complete_migration(Err(err), on_migrated);
            }
        }
    }

    fn complete_migration(
        &self,
        result: Result<Arc<dyn Stream>>,
        on_migrated: Box<dyn FnOnce(Result<()>) + Send>,
    ) {
        let stream = match result {
            Ok(stream) => stream,
            Err(err) => return self.abort_migration(err, on_migrated),
        };

        *lock(&self.inner.runloop) = stream.runloop();
        *lock(&self.inner.facility) = Some(Facility::Communication(stream.clone()));
        self.replay_frozen();
        if let Err(err) = stream.start_read(self.reader()) {
            return self.abort_migration(err.into(), on_migrated);
        }

        let close_deferred = {
            let mut lifecycle = lock(&self.inner.lifecycle);
            lifecycle.migrating = false;
            std::mem::take(&mut lifecycle.close_deferred)
        };
        debug!(protocol = self.id(), runloop = stream.runloop().name(), "migrated");
        on_migrated(Ok(()));
        if close_deferred {
            self.close_resources();
        } else {
            self.request_drain();
        }
    }

    fn replay_frozen(&self) {
        loop {
            let batch = {
                let mut inbound = lock(&self.inner.inbound);
                if inbound.queue.is_empty() {
                    inbound.frozen = false;
                    return;
                }
                std::mem::take(&mut inbound.queue)
            };
            trace!(protocol = self.id(), count = batch.len(), "replaying frozen messages");
            for message in batch {
                self.inner.handler.on_message(self, message);
            }
        }
    }

    fn abort_migration(&self, err: Error, on_migrated: Box<dyn FnOnce(Result<()>) + Send>) {
        warn!(protocol = self.id(), %err, "migration failed");
        let dropped = {
            let mut inbound = lock(&self.inner.inbound);
            inbound.frozen = false;
            std::mem::take(&mut inbound.queue)
        };
        drop(dropped);
        let close_deferred = {
            let mut lifecycle = lock(&self.inner.lifecycle);
            lifecycle.migrating = false;
            std::mem::take(&mut lifecycle.close_deferred)
        };
        on_migrated(Err(err));
        if close_deferred {
            self.post_close();
        } else {
            self.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{BackendKind, RunloopConfig},
        net::{mem::MemNetwork, NetworkError},
    };
    use std::{
        sync::atomic::AtomicUsize,
        time::{Duration, Instant},
    };

    #[derive(Default)]
    struct Recorder {
        messages: Mutex<Vec<String>>,
        accepted: Mutex<Vec<Protocol<LineCodec>>>,
        closed: AtomicUsize,
    }

    impl ProtocolHandler<LineCodec> for Arc<Recorder> {
        fn on_message(&self, _: &Protocol<LineCodec>, message: String) {
            self.messages.lock().unwrap().push(message);
        }

        fn on_client_accepted(&self, _: &Protocol<LineCodec>, client: Protocol<LineCodec>) {
            self.accepted.lock().unwrap().push(client);
        }

        fn on_closed(&self, _: &Protocol<LineCodec>) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn park(name: &str) -> Runloop {
        Runloop::new(
            &RunloopConfig::builder()
                .name(name)
                .backend(BackendKind::Park)
                .build(),
        )
        .unwrap()
    }

    fn network() -> Network {
        let network = Network::new();
        network.register(MemNetwork::with_scheme("proto"));
        network
    }

    fn drive(runloop: &Runloop, mut done: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done() {
            assert!(Instant::now() < deadline, "protocol did not converge");
            runloop.run_once(Some(Duration::from_millis(5))).unwrap();
        }
    }

    fn protocol(runloop: &Runloop, network: &Network, recorder: &Arc<Recorder>) -> Protocol<LineCodec> {
        Protocol::new(
            runloop,
            network.clone(),
            LineCodec::default(),
            recorder.clone(),
            ProtocolConfig::default(),
        )
    }

    #[test]
    fn test_listen_accept_send_and_close() {
        let runloop = park("proto");
        let network = network();
        let server = Arc::new(Recorder::default());
        let client = Arc::new(Recorder::default());
        let uri = Uri::parse("proto://host:9000").unwrap();

        let listener = protocol(&runloop, &network, &server);
        listener.listen(&uri).unwrap();
        assert_eq!(listener.role(), Role::Listening);
        assert_eq!(listener.local_uri(), Some(uri.clone()));

        let outbound = protocol(&runloop, &network, &client);
        let connected = Arc::new(Mutex::new(Vec::new()));
        let sink = connected.clone();
        outbound
            .connect_to(&uri, move |_, ok| sink.lock().unwrap().push(ok))
            .unwrap();
        for line in ["one", "two", "three"] {
            outbound.send(line.to_string()).unwrap();
        }
        drive(&runloop, || server.messages.lock().unwrap().len() == 3);
        assert_eq!(*connected.lock().unwrap(), vec![true]);
        assert_eq!(outbound.connect_state(), Some(ConnectState::Connected));
        assert_eq!(*server.messages.lock().unwrap(), vec!["one", "two", "three"]);

        let accepted = server.accepted.lock().unwrap().clone();
        assert_eq!(accepted.len(), 1);
        assert_eq!(accepted[0].role(), Role::InboundExternal);
        assert!(!accepted[0].is_closing());

        accepted[0].send("reply".to_string()).unwrap();
        drive(&runloop, || client.messages.lock().unwrap().len() == 1);

        outbound.close();
        outbound.close();
        drive(&runloop, || {
            client.closed.load(Ordering::SeqCst) == 1 && server.closed.load(Ordering::SeqCst) == 1
        });
        assert!(outbound.is_closed());
        assert!(accepted[0].is_closed());
        assert!(matches!(outbound.send("late".into()), Err(Error::Closing)));

        listener.close();
        drive(&runloop, || server.closed.load(Ordering::SeqCst) == 2);
        assert_eq!(client.closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_close_without_resources() {
        let runloop = park("idle");
        let recorder = Arc::new(Recorder::default());
        let idle = protocol(&runloop, &network(), &recorder);
        idle.close();
        assert!(idle.is_closing());
        drive(&runloop, || idle.is_closed());
        assert_eq!(recorder.closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_close_from_stop_completes() {
        let runloop = park("shutdown");
        let network = network();
        let server = Arc::new(Recorder::default());
        let client = Arc::new(Recorder::default());
        let uri = Uri::parse("proto://host:9002").unwrap();

        let listener = protocol(&runloop, &network, &server);
        listener.listen(&uri).unwrap();
        let outbound = protocol(&runloop, &network, &client);
        outbound.connect_to(&uri, |_, _| {}).unwrap();
        drive(&runloop, || server.accepted.lock().unwrap().len() == 1);

        let closing = (listener.clone(), outbound.clone());
        runloop
            .stop_with(move || {
                closing.0.close();
                closing.1.close();
            })
            .unwrap();
        runloop.run().unwrap();

        assert!(outbound.is_closed());
        assert!(listener.is_closed());
        assert_eq!(client.closed.load(Ordering::SeqCst), 1);
        assert!(server.closed.load(Ordering::SeqCst) >= 1);
        server.accepted.lock().unwrap().clear();
    }

    #[test]
    fn test_unframeable_send_is_rejected_alone() {
        let runloop = park("framing");
        let network = network();
        let server = Arc::new(Recorder::default());
        let client = Arc::new(Recorder::default());
        let uri = Uri::parse("proto://host:9003").unwrap();

        let listener = protocol(&runloop, &network, &server);
        listener.listen(&uri).unwrap();
        let outbound = protocol(&runloop, &network, &client);
        outbound.connect_to(&uri, |_, _| {}).unwrap();

        outbound.send("before".to_string()).unwrap();
        assert!(matches!(
            outbound.send("two\nlines".to_string()),
            Err(Error::Codec(_))
        ));
        outbound.send("after".to_string()).unwrap();
        drive(&runloop, || server.messages.lock().unwrap().len() == 2);

        assert_eq!(*server.messages.lock().unwrap(), vec!["before", "after"]);
        assert!(!outbound.is_closing());
        assert_eq!(client.closed.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_listen_errors() {
        let runloop = park("listen");
        let network = network();
        let recorder = Arc::new(Recorder::default());
        let uri = Uri::parse("proto://host:9000").unwrap();

        let first = protocol(&runloop, &network, &recorder);
        first.listen(&uri).unwrap();
        assert!(matches!(first.listen(&uri), Err(Error::InvalidRole(Role::Listening))));

        let second = protocol(&runloop, &network, &recorder);
        assert!(matches!(
            second.listen(&uri),
            Err(Error::Network(NetworkError::AddrInUse(_)))
        ));
        assert_eq!(second.role(), Role::Invalid);
    }

    #[test]
    fn test_migrate_rejects_misuse() {
        let runloop = park("from");
        let recorder = Arc::new(Recorder::default());
        let idle = protocol(&runloop, &network(), &recorder);
        assert!(matches!(
            idle.migrate(&park("to"), |_| {}),
            Err(Error::InvalidRole(Role::Invalid))
        ));

        *lock(&idle.inner.role) = Role::OutboundExternal;
        assert!(matches!(
            idle.migrate(&runloop, |_| {}),
            Err(Error::Migration(_))
        ));
        let mio = Runloop::new(&RunloopConfig::default()).unwrap();
        assert!(matches!(
            idle.migrate(&mio, |_| {}),
            Err(Error::BackendMismatch { .. })
        ));
        assert!(matches!(
            idle.migrate(&park("to"), |_| {}),
            Err(Error::Migration(_))
        ));
        assert!(!idle.is_migrating());
    }

    #[test]
    fn test_codec_error_closes() {
        let runloop = park("codec");
        let network = network();
        let server = Arc::new(Recorder::default());
        let uri = Uri::parse("proto://host:9001").unwrap();
        let listener = protocol(&runloop, &network, &server);
        listener.listen(&uri).unwrap();

        let stream = Arc::new(Mutex::new(None));
        let slot = stream.clone();
        network
            .transport(&runloop, &uri)
            .unwrap()
            .connect(&uri, Box::new(move |result| *slot.lock().unwrap() = Some(result)))
            .unwrap();
        drive(&runloop, || stream.lock().unwrap().is_some());
        let raw = stream.lock().unwrap().take().unwrap().unwrap();
        raw.send(vec![0xff, b'\n']).unwrap();

        drive(&runloop, || server.closed.load(Ordering::SeqCst) == 1);
        assert!(server.messages.lock().unwrap().is_empty());
    }
}
