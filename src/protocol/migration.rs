//! Moving a live stream from one runloop thread to another.
//!
//! The handshake runs in four stages across the two threads, each stage triggered by
//! a [`Signal`] owned by the runloop it runs on:
//!
//! ```text
//!   from thread                                   to thread
//!   ───────────                                   ─────────
//!   1. src_prepare: open the source end
//!        └── post ─────────────────────────────▶  create dst signals
//!                                                 2. dst_prepare: open the destination end
//!        ┌───────────────────────── fire ───────────┘
//!   3. src_migration: detach, hand the descriptor over
//!        └───────────────────────── fire ─────────▶ 4. dst_migration: adopt, report
//! ```
//!
//! The stream descriptor is only ever touched by the thread running the current
//! stage. After stage 4 (or the first failure) the four signals and both transfer
//! ends are closed; the context stays alive until all six have confirmed.

use std::sync::{Arc, Mutex, OnceLock, Weak};

use tracing::{debug, trace, warn};

use crate::{
    error::{Error, Result},
    net::{Descriptor, NetResult, Network, Stream},
    poll::lock,
    refcount::RefCounted,
    runloop::Runloop,
    signal::Signal,
};

/// Signals plus transfer ends that must confirm closure before a context is freed.
pub const FINALIZE_COUNT: usize = 6;

pub type MigratedCallback = Box<dyn FnOnce(Result<Arc<dyn Stream>>) + Send + 'static>;

type Slot = Arc<Mutex<Option<NetResult<Descriptor>>>>;

/// One side of the private channel the descriptor crosses.
struct TransferEnd {
    runloop: Runloop,
    slot: Slot,
}

impl TransferEnd {
    fn put(&self, descriptor: NetResult<Descriptor>) {
        *lock(&self.slot) = Some(descriptor);
    }

    fn take(&self) -> Option<NetResult<Descriptor>> {
        lock(&self.slot).take()
    }

    fn close<F>(self, on_closed: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let TransferEnd { runloop, slot } = self;
        runloop.defer(Box::new(move || {
            // A descriptor nobody adopted is dropped here, with its stream.
            drop(lock(&slot).take());
            on_closed();
        }));
    }
}

struct Context {
    network: Network,
    from: Runloop,
    to: Runloop,
    stream: Mutex<Option<Arc<dyn Stream>>>,
    slot: Slot,
    src_prepare: OnceLock<Signal>,
    src_migration: OnceLock<Signal>,
    dst_prepare: OnceLock<Signal>,
    dst_migration: OnceLock<Signal>,
    src_end: Mutex<Option<TransferEnd>>,
    dst_end: Mutex<Option<TransferEnd>>,
    on_done: Mutex<Option<MigratedCallback>>,
    keepalive: Mutex<Option<Arc<Context>>>,
}

/// Observes a migration in flight.
#[derive(Clone, Debug)]
pub struct MigrationHandle {
    context: Weak<Context>,
}

impl MigrationHandle {
    /// Whether every signal and transfer end has confirmed closure and the context
    /// has been released.
    pub fn is_finished(&self) -> bool {
        self.context.strong_count() == 0
    }
}

/// Moves `stream` from its runloop to `to`. Must be called on the stream's runloop
/// with reads stopped. `on_done` receives the adopted stream on `to`, or the error
/// on whichever thread the handshake failed.
pub fn migrate_stream<F>(
    network: &Network,
    stream: Arc<dyn Stream>,
    to: &Runloop,
    on_done: F,
) -> Result<MigrationHandle>
where
    F: FnOnce(Result<Arc<dyn Stream>>) + Send + 'static,
{
    let from = stream.runloop();
    from.check_thread()?;
    if from == *to {
        return Err(Error::Migration("stream is already on that runloop".to_string()));
    }
    if from.backend() != to.backend() {
        return Err(Error::BackendMismatch {
            expected: from.backend(),
            found: to.backend(),
        });
    }

    let context = Arc::new(Context {
        network: network.clone(),
        from: from.clone(),
        to: to.clone(),
        stream: Mutex::new(Some(stream)),
        slot: Arc::new(Mutex::new(None)),
        src_prepare: OnceLock::new(),
        src_migration: OnceLock::new(),
        dst_prepare: OnceLock::new(),
        dst_migration: OnceLock::new(),
        src_end: Mutex::new(None),
        dst_end: Mutex::new(None),
        on_done: Mutex::new(Some(Box::new(on_done))),
        keepalive: Mutex::new(None),
    });

    let weak = Arc::downgrade(&context);
    let src_prepare = Signal::new(&from, stage(&weak, Context::src_prepare))?;
    let src_migration = Signal::new(&from, stage(&weak, Context::src_migration))?;
    let _ = context.src_prepare.set(src_prepare.clone());
    let _ = context.src_migration.set(src_migration);
    *lock(&context.keepalive) = Some(context.clone());

    debug!(from = from.name(), to = to.name(), "migration started");
    src_prepare.fire();
    Ok(MigrationHandle { context: weak })
}

fn stage(weak: &Weak<Context>, run: fn(&Arc<Context>)) -> impl FnMut() + Send + 'static {
    let weak = weak.clone();
    move || {
        if let Some(context) = weak.upgrade() {
            run(&context);
        }
    }
}

impl Context {
    fn src_prepare(self: &Arc<Self>) {
        trace!(from = self.from.name(), "migration src_prepare");
        *lock(&self.src_end) = Some(TransferEnd {
            runloop: self.from.clone(),
            slot: self.slot.clone(),
        });

        let context = self.clone();
        let posted = self.to.post_task(move || {
            let weak = Arc::downgrade(&context);
            let signals = Signal::new(&context.to, stage(&weak, Context::dst_prepare)).and_then(
                |prepare| {
                    Signal::new(&context.to, stage(&weak, Context::dst_migration))
                        .map(|migration| (prepare, migration))
                },
            );
            match signals {
                Ok((prepare, migration)) => {
                    let _ = context.dst_prepare.set(prepare.clone());
                    let _ = context.dst_migration.set(migration);
                    prepare.fire();
                }
                Err(err) => context.fail(err),
            }
        });
        if let Err(err) = posted {
            self.fail(err);
        }
    }

    fn dst_prepare(self: &Arc<Self>) {
        trace!(to = self.to.name(), "migration dst_prepare");
        *lock(&self.dst_end) = Some(TransferEnd {
            runloop: self.to.clone(),
            slot: self.slot.clone(),
        });
        match self.src_migration.get() {
            Some(signal) if signal.fire() => {}
            _ => self.fail(Error::Migration("source side closed".to_string())),
        }
    }

    fn src_migration(self: &Arc<Self>) {
        trace!(from = self.from.name(), "migration src_migration");
        let stream = lock(&self.stream).take();
        let descriptor = match stream {
            Some(stream) => stream.detach(),
            None => return,
        };
        if let Some(end) = lock(&self.src_end).as_ref() {
            end.put(descriptor);
        }
        match self.dst_migration.get() {
            Some(signal) if signal.fire() => {}
            _ => self.fail(Error::Migration("destination side closed".to_string())),
        }
    }

    fn dst_migration(self: &Arc<Self>) {
        trace!(to = self.to.name(), "migration dst_migration");
        let received = lock(&self.dst_end).as_ref().and_then(TransferEnd::take);
        let result = match received {
            Some(Ok(descriptor)) => self
                .network
                .adopt(&self.to, descriptor)
                .map_err(|err| Error::Migration(format!("adopt failed: {err}"))),
            Some(Err(err)) => Err(Error::Migration(format!("detach failed: {err}"))),
            None => Err(Error::Migration("no descriptor was handed over".to_string())),
        };
        match result {
            Ok(stream) => {
                debug!(from = self.from.name(), to = self.to.name(), "migration complete");
                self.complete(Ok(stream));
            }
            Err(err) => self.fail(err),
        }
    }

    fn fail(self: &Arc<Self>, err: Error) {
        warn!(from = self.from.name(), to = self.to.name(), %err, "migration failed");
        self.complete(Err(err));
    }

    fn complete(self: &Arc<Self>, result: Result<Arc<dyn Stream>>) {
        let on_done = lock(&self.on_done).take();
        if let Some(on_done) = on_done {
            on_done(result);
            self.finalize();
        }
    }

    fn finalize(self: &Arc<Self>) {
        let context = self.clone();
        let counter = RefCounted::new((), move |()| {
            let released = lock(&context.keepalive).take();
            trace!("migration context released");
            drop(released);
        });
        for _ in 1..FINALIZE_COUNT {
            let _ = counter.inc();
        }

        let signals = [
            &self.src_prepare,
            &self.dst_prepare,
            &self.src_migration,
            &self.dst_migration,
        ];
        for signal in signals {
            let confirm = counter.clone();
            let closing = signal
                .get()
                .is_some_and(|signal| signal.close(move || release(&confirm)));
            if !closing {
                release(&counter);
            }
        }

        for end in [lock(&self.src_end).take(), lock(&self.dst_end).take()] {
            match end {
                Some(end) => {
                    let confirm = counter.clone();
                    end.close(move || release(&confirm));
                }
                None => release(&counter),
            }
        }
    }
}

fn release(counter: &RefCounted<()>) {
    if let Err(err) = counter.dec() {
        warn!(%err, "migration finalize overran");
    }
}
