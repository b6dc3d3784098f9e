#![allow(dead_code)]

use std::{
    sync::{
        mpsc::{self, Receiver, Sender},
        Arc, Mutex,
    },
    thread,
    time::{Duration, Instant},
};

use ferry::{
    protocol::LineCodec, BackendKind, Protocol, ProtocolHandler, Runloop, RunloopConfig,
    RunloopThread,
};
use tracing_subscriber::EnvFilter;

pub const TIMEOUT: Duration = Duration::from_secs(10);

/// Installs a test-writer subscriber once; `RUST_LOG=ferry=trace` shows the loops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn spawn(name: &str, backend: BackendKind) -> RunloopThread {
    RunloopThread::spawn(RunloopConfig::builder().name(name).backend(backend).build())
        .expect("spawn runloop thread")
}

/// Runs `f` on `runloop`'s thread and returns its result.
pub fn on_loop<T, F>(runloop: &Runloop, f: F) -> T
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let (sender, receiver) = mpsc::channel();
    runloop
        .post_task(move || {
            let _ = sender.send(f());
        })
        .expect("post task");
    receiver.recv_timeout(TIMEOUT).expect("task did not run")
}

pub fn wait_until(what: &str, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + TIMEOUT;
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(1));
    }
}

pub fn current_thread() -> Option<String> {
    thread::current().name().map(str::to_owned)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub protocol: u64,
    pub message: String,
    pub thread: Option<String>,
}

/// What every protocol sharing one [`Recorder`] reported.
pub struct Events {
    pub deliveries: Mutex<Vec<Delivery>>,
    pub closed: Mutex<Vec<u64>>,
    accepted: Mutex<Sender<Protocol<LineCodec>>>,
}

impl Events {
    pub fn new() -> (Arc<Self>, Receiver<Protocol<LineCodec>>) {
        let (sender, receiver) = mpsc::channel();
        let events = Arc::new(Self {
            deliveries: Mutex::new(Vec::new()),
            closed: Mutex::new(Vec::new()),
            accepted: Mutex::new(sender),
        });
        (events, receiver)
    }

    /// Removes and returns the deliveries of `protocol`.
    pub fn take(&self, protocol: u64) -> Vec<Delivery> {
        let mut deliveries = self.deliveries.lock().unwrap();
        let (taken, rest) = deliveries
            .drain(..)
            .partition(|delivery| delivery.protocol == protocol);
        *deliveries = rest;
        taken
    }

    pub fn delivered(&self, protocol: u64) -> usize {
        self.deliveries
            .lock()
            .unwrap()
            .iter()
            .filter(|delivery| delivery.protocol == protocol)
            .count()
    }

    pub fn closed_count(&self, protocol: u64) -> usize {
        self.closed
            .lock()
            .unwrap()
            .iter()
            .filter(|id| **id == protocol)
            .count()
    }
}

pub struct Recorder {
    events: Arc<Events>,
}

impl Recorder {
    pub fn new(events: &Arc<Events>) -> Self {
        Self {
            events: events.clone(),
        }
    }
}

impl ProtocolHandler<LineCodec> for Recorder {
    fn on_message(&self, protocol: &Protocol<LineCodec>, message: String) {
        self.events.deliveries.lock().unwrap().push(Delivery {
            protocol: protocol.id(),
            message,
            thread: current_thread(),
        });
    }

    fn on_client_accepted(&self, _listener: &Protocol<LineCodec>, client: Protocol<LineCodec>) {
        let _ = self.events.accepted.lock().unwrap().send(client);
    }

    fn on_closed(&self, protocol: &Protocol<LineCodec>) {
        self.events.closed.lock().unwrap().push(protocol.id());
    }
}
