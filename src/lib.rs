//! # Ferry
//! Thread-pinned runloops and a connection state machine that can move live streams
//! between threads.
//!
//! Ferry is built on [`mio`] and plain OS threads, without an async runtime. Each
//! [`Runloop`] is one thread's dispatch engine: a FIFO task queue any thread can post
//! to, timers, cross-thread [`Signal`]s and, on the `mio` backend, socket readiness.
//! On top of that, a [`Protocol`] drives one listener or connection: connect with
//! bounded retries, codec-framed messages, a two-phase close and a four-stage
//! migration handshake that hands a live stream from one runloop thread to another.
//!
//! ## Architecture Overview
//! ```text
//! ┌────────────┐    ┌──────────────┐    ┌──────────────────┐
//! │  Protocol  │───▶│  Transport / │───▶│ mem | tcp backend│
//! │ (codec,    │    │    Stream    │    └──────────────────┘
//! │  retry,    │    └──────────────┘             │
//! │  migrate)  │                                 ▼
//! └────────────┘───────────────────────▶┌──────────────────┐
//!                                       │ Runloop (thread) │──▶ Driver (mio | park)
//!                                       │ tasks · timers · │
//!                                       │ signals          │
//!                                       └──────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use ferry::prelude::*;
//!
//! struct Echo;
//!
//! impl ProtocolHandler<LineCodec> for Echo {
//!     fn on_message(&self, protocol: &Protocol<LineCodec>, line: String) {
//!         let _ = protocol.send(line);
//!     }
//! }
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let thread = RunloopThread::spawn(RunloopConfig::builder().name("echo").build())?;
//!     let runloop = thread.runloop().clone();
//!     let network = Network::with_defaults();
//!
//!     let listener = runloop.clone();
//!     runloop.post_task(move || {
//!         let protocol = Protocol::new(
//!             &listener,
//!             network,
//!             LineCodec::default(),
//!             Echo,
//!             ProtocolConfig::default(),
//!         );
//!         if let Ok(uri) = Uri::parse("tcp://127.0.0.1:7000") {
//!             let _ = protocol.listen(&uri);
//!         }
//!     })?;
//!
//!     std::thread::park();
//!     Ok(())
//! }
//! ```
//!
//! - [`runloop`]: runloops, timers and the [`RunloopThread`] helper
//! - [`signal`]: coalescing cross-thread signals
//! - [`refcount`]: checked reference counting with an end-of-life callback
//! - [`net`]: the transport surface and the `mem` and `tcp` backends
//! - [`protocol`]: the connection state machine, codecs and migration
//! - [`config`] and [`error`]: configuration and error types

pub mod config;
pub mod error;
mod event;
mod handler;
pub mod net;
pub mod object_pool;
mod poll;
pub mod protocol;
pub mod refcount;
pub mod runloop;
pub mod signal;

pub use config::{BackendKind, RetryPolicy, RunloopConfig};
pub use error::{Error, Result};
pub use net::{Network, NetworkError, Uri};
pub use object_pool::{ObjectPool, PooledObject};
pub use protocol::{Protocol, ProtocolConfig, ProtocolHandler, Role};
pub use refcount::RefCounted;
pub use runloop::{Runloop, RunloopThread, Timer};
pub use signal::Signal;

/// A convenient prelude module that re-exports commonly used types and traits.
///
/// ```rust
/// use ferry::prelude::*;
/// ```
pub mod prelude {
    pub use crate::config::{BackendKind, RetryPolicy, RunloopConfig};
    pub use crate::net::{Network, NetworkError, ReadEvent, Stream, Transport, Uri};
    pub use crate::protocol::{
        Codec, ConnectState, JsonCodec, LineCodec, Protocol, ProtocolConfig, ProtocolHandler,
        Role, Scope,
    };
    pub use crate::refcount::RefCounted;
    pub use crate::runloop::{Repeat, Runloop, RunloopThread, Timer};
    pub use crate::signal::Signal;
}
