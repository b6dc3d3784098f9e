//! The transport surface protocols are built on.
//!
//! A backend plugs in through three traits:
//!
//! ```text
//!  Network ── scheme ──▶ TransportFactory ──transport()──▶ Transport ──listen / connect──▶ Stream
//!                                         ──adopt(desc)──────────────────────────────────▶ Stream
//! ```
//!
//! Every [`Transport`] and [`Stream`] is bound to one runloop and every method on
//! them must be called on that runloop's thread; callbacks are invoked there too.
//! Closing is always asynchronous: `close` returns immediately and the close callback
//! runs on a later turn. A transport with a connect still in flight completes that
//! connect (with [`NetworkError::Aborted`]) before its close callback runs.
//!
//! Streams can move between runloops of the same backend: [`Stream::detach`] turns a
//! stream with stopped reads into a [`Descriptor`] and
//! [`TransportFactory::adopt`] rebuilds a stream from it on another runloop.
//!
//! Two backends ship with the crate: [`mem`] (in-process, any runloop backend) and
//! [`tcp`] (non-blocking sockets, `mio` runloops only).

pub mod errors;
pub mod mem;
pub mod tcp;

use std::{
    any::Any,
    collections::HashMap,
    fmt,
    str::FromStr,
    sync::{Arc, RwLock},
};

use url::Url;

use crate::runloop::Runloop;

pub use errors::NetworkError;

pub type NetResult<T> = std::result::Result<T, NetworkError>;

/// What a read callback is told about its stream.
#[derive(Debug)]
pub enum ReadEvent<'a> {
    Data(&'a [u8]),
    /// The peer closed its side. No more data follows.
    Eof,
    Failed(NetworkError),
}

pub type ReadCallback = Box<dyn FnMut(ReadEvent<'_>) + Send + 'static>;
pub type CloseCallback = Box<dyn FnOnce() + Send + 'static>;
pub type AcceptCallback = Box<dyn FnMut(Arc<dyn Stream>) + Send + 'static>;
pub type ConnectCallback = Box<dyn FnOnce(NetResult<Arc<dyn Stream>>) + Send + 'static>;

/// One established, bidirectional byte channel.
pub trait Stream: Send + Sync {
    fn scheme(&self) -> &str;

    /// The runloop this stream is bound to.
    fn runloop(&self) -> Runloop;

    fn peer(&self) -> Option<String>;

    /// Starts delivering inbound bytes. Replaces any previous callback.
    fn start_read(&self, on_read: ReadCallback) -> NetResult<()>;

    fn stop_read(&self) -> NetResult<()>;

    /// Queues `bytes` for writing. Writes are delivered in call order.
    fn send(&self, bytes: Vec<u8>) -> NetResult<()>;

    fn close(&self, on_closed: CloseCallback);

    /// Unbinds the stream from its runloop for migration. Reads must be stopped.
    /// After a successful detach this handle is inert: operations fail with
    /// [`NetworkError::Detached`] and `close` only confirms.
    fn detach(&self) -> NetResult<Descriptor>;
}

/// A listening or connecting endpoint that produces [`Stream`]s.
pub trait Transport: Send + Sync {
    fn scheme(&self) -> &str;

    fn runloop(&self) -> Runloop;

    /// Binds and starts accepting. Bind failures are returned here.
    fn listen(&self, uri: &Uri, on_accept: AcceptCallback) -> NetResult<()>;

    /// Starts connecting. `on_connected` is always invoked exactly once, on a later
    /// turn, unless this call itself returns an error.
    fn connect(&self, uri: &Uri, on_connected: ConnectCallback) -> NetResult<()>;

    /// The bound address once listening.
    fn local_uri(&self) -> Option<Uri>;

    /// Stops listening and aborts a pending connect. Streams already produced are
    /// not affected.
    fn close(&self, on_closed: CloseCallback);
}

/// Creates the transports and adopted streams of one scheme.
pub trait TransportFactory: Send + Sync {
    fn scheme(&self) -> &str;

    fn transport(&self, runloop: &Runloop) -> NetResult<Arc<dyn Transport>>;

    /// Rebuilds a detached stream on `runloop`.
    fn adopt(&self, runloop: &Runloop, descriptor: Descriptor) -> NetResult<Arc<dyn Stream>>;
}

/// A detached stream in flight between two runloops.
pub struct Descriptor {
    scheme: String,
    inner: Box<dyn Any + Send>,
}

impl Descriptor {
    pub fn new<T: Any + Send>(scheme: impl Into<String>, inner: T) -> Self {
        Self {
            scheme: scheme.into(),
            inner: Box::new(inner),
        }
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn downcast<T: Any>(self) -> NetResult<T> {
        let scheme = self.scheme;
        self.inner
            .downcast::<T>()
            .map(|inner| *inner)
            .map_err(|_| NetworkError::ForeignDescriptor(scheme))
    }
}

impl fmt::Debug for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Descriptor")
            .field("scheme", &self.scheme)
            .finish_non_exhaustive()
    }
}

/// A transport address: `scheme://host:port`.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Uri {
    url: Url,
}

impl Uri {
    pub fn parse(input: &str) -> NetResult<Self> {
        let invalid = |reason: &str| NetworkError::InvalidUri {
            uri: input.to_string(),
            reason: reason.to_string(),
        };
        let url = Url::parse(input).map_err(|err| invalid(&err.to_string()))?;
        if url.host_str().map_or(true, str::is_empty) {
            return Err(invalid("missing host"));
        }
        if url.port().is_none() {
            return Err(invalid("missing port"));
        }
        Ok(Self { url })
    }

    pub fn scheme(&self) -> &str {
        self.url.scheme()
    }

    pub fn host(&self) -> &str {
        self.url.host_str().unwrap_or_default()
    }

    pub fn port(&self) -> u16 {
        self.url.port().unwrap_or_default()
    }

    /// `host:port`, the key transports bind and connect by.
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host(), self.port())
    }

    pub fn with_port(&self, port: u16) -> Self {
        let mut url = self.url.clone();
        let _ = url.set_port(Some(port));
        Self { url }
    }
}

impl FromStr for Uri {
    type Err = NetworkError;

    fn from_str(s: &str) -> NetResult<Self> {
        Uri::parse(s)
    }
}

impl fmt::Display for Uri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme(), self.authority())
    }
}

impl fmt::Debug for Uri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Uri({self})")
    }
}

/// Scheme registry shared by every protocol of an application.
#[derive(Clone, Default)]
pub struct Network {
    factories: Arc<RwLock<HashMap<String, Arc<dyn TransportFactory>>>>,
}

impl fmt::Debug for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let factories = self
            .factories
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f.debug_struct("Network")
            .field("schemes", &factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Network {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the `mem` and `tcp` backends under their default schemes.
    pub fn with_defaults() -> Self {
        let network = Self::new();
        network.register(mem::MemNetwork::new());
        network.register(tcp::TcpNetwork::default());
        network
    }

    /// Registers `factory` under its scheme, replacing any previous one.
    pub fn register<F>(&self, factory: F)
    where
        F: TransportFactory + 'static,
    {
        let factory: Arc<dyn TransportFactory> = Arc::new(factory);
        self.factories
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(factory.scheme().to_string(), factory);
    }

    pub fn factory(&self, scheme: &str) -> NetResult<Arc<dyn TransportFactory>> {
        self.factories
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(scheme)
            .cloned()
            .ok_or_else(|| NetworkError::UnsupportedScheme(scheme.to_string()))
    }

    pub fn transport(&self, runloop: &Runloop, uri: &Uri) -> NetResult<Arc<dyn Transport>> {
        self.factory(uri.scheme())?.transport(runloop)
    }

    pub fn adopt(&self, runloop: &Runloop, descriptor: Descriptor) -> NetResult<Arc<dyn Stream>> {
        self.factory(descriptor.scheme())?.adopt(runloop, descriptor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uri_parse() {
        let uri = Uri::parse("proto://host:9000").unwrap();
        assert_eq!(uri.scheme(), "proto");
        assert_eq!(uri.host(), "host");
        assert_eq!(uri.port(), 9000);
        assert_eq!(uri.authority(), "host:9000");
        assert_eq!(uri.to_string(), "proto://host:9000");
        assert_eq!(uri.with_port(9001).authority(), "host:9001");

        let tcp: Uri = "tcp://127.0.0.1:0".parse().unwrap();
        assert_eq!(tcp.host(), "127.0.0.1");
        assert_eq!(tcp.port(), 0);
    }

    #[test]
    fn test_uri_rejects_incomplete() {
        for input in ["proto://host", "not a uri", "proto:///path"] {
            assert!(
                matches!(Uri::parse(input), Err(NetworkError::InvalidUri { .. })),
                "{input}"
            );
        }
    }

    #[test]
    fn test_descriptor_downcast() {
        let descriptor = Descriptor::new("mem", 42u32);
        assert_eq!(descriptor.scheme(), "mem");
        assert_eq!(descriptor.downcast::<u32>().unwrap(), 42);

        let descriptor = Descriptor::new("mem", 42u32);
        assert!(matches!(
            descriptor.downcast::<String>(),
            Err(NetworkError::ForeignDescriptor(scheme)) if scheme == "mem"
        ));
    }

    #[test]
    fn test_network_registry() {
        let network = Network::with_defaults();
        assert!(network.factory("mem").is_ok());
        assert!(network.factory("tcp").is_ok());
        assert!(matches!(
            network.factory("pipe"),
            Err(NetworkError::UnsupportedScheme(scheme)) if scheme == "pipe"
        ));

        network.register(mem::MemNetwork::with_scheme("proto"));
        assert_eq!(network.factory("proto").unwrap().scheme(), "proto");
    }
}
