//! Cross-thread signals.
//!
//! A [`Signal`] interrupts one specific runloop from any thread. Fires coalesce:
//! however many times `fire` is called before the callback gets to run, it runs
//! once. Each signal is backed by two async handles, one for firing and one used
//! only for its own close, so a close never races a fire that is still in flight
//! from another thread:
//!
//! ```text
//! close() ──▶ closer.send() ──(loop)──▶ fire handle closed ──▶ closer closed ──▶ on_closed()
//! ```

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, Weak,
    },
};

use tracing::warn;

use crate::{
    error::Result,
    poll::lock,
    runloop::{AsyncHandle, Runloop, Task},
};

#[derive(Clone)]
pub struct Signal {
    shared: Arc<SignalShared>,
}

struct SignalShared {
    fire: AsyncHandle,
    closer: AsyncHandle,
    closing: AtomicBool,
    on_closed: Mutex<Option<Task>>,
}

impl fmt::Debug for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signal")
            .field("closing", &self.is_closing())
            .finish()
    }
}

impl Signal {
    /// Creates a signal whose callback runs on `runloop`. Must be called on the
    /// runloop thread.
    pub fn new<F>(runloop: &Runloop, on_fire: F) -> Result<Self>
    where
        F: FnMut() + Send + 'static,
    {
        runloop.check_thread()?;
        let shared = Arc::new_cyclic(|weak: &Weak<SignalShared>| {
            let weak = weak.clone();
            SignalShared {
                fire: AsyncHandle::new(runloop, on_fire),
                closer: AsyncHandle::new(runloop, move || {
                    if let Some(shared) = weak.upgrade() {
                        shared.begin_close();
                    }
                }),
                closing: AtomicBool::new(false),
                on_closed: Mutex::new(None),
            }
        });
        Ok(Self { shared })
    }

    /// Schedules the callback. Returns `false` once closing has begun.
    pub fn fire(&self) -> bool {
        if self.shared.closing.load(Ordering::Acquire) {
            return false;
        }
        self.shared.fire.send()
    }

    /// Starts the close handshake from any thread. Only the first call has an
    /// effect and returns `true`; `on_closed` then runs on the owning runloop.
    pub fn close<F>(&self, on_closed: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        if self
            .shared
            .closing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        *lock(&self.shared.on_closed) = Some(Box::new(on_closed));
        if !self.shared.closer.send() {
            warn!("signal closed after its runloop went away");
            if let Some(on_closed) = lock(&self.shared.on_closed).take() {
                on_closed();
            }
        }
        true
    }

    pub fn is_closing(&self) -> bool {
        self.shared.closing.load(Ordering::Acquire)
    }
}

impl SignalShared {
    fn begin_close(self: Arc<Self>) {
        let this = Arc::clone(&self);
        self.fire.close(Box::new(move || {
            let last = Arc::clone(&this);
            this.closer.close(Box::new(move || {
                let on_closed = lock(&last.on_closed).take();
                if let Some(on_closed) = on_closed {
                    on_closed();
                }
            }));
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{BackendKind, RunloopConfig},
        error::Error,
        runloop::RunloopThread,
    };
    use std::{
        sync::{atomic::AtomicUsize, mpsc},
        thread,
        time::{Duration, Instant},
    };

    fn drive_until(runloop: &Runloop, mut done: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done() {
            assert!(Instant::now() < deadline, "signal did not converge");
            runloop.run_once(Some(Duration::from_millis(5))).unwrap();
        }
    }

    #[test]
    fn test_fires_coalesce() {
        let runloop = Runloop::new(&RunloopConfig::default()).unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = hits.clone();
        let signal = Signal::new(&runloop, move || {
            hits_clone.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        for _ in 0..10 {
            assert!(signal.fire());
        }
        runloop.run_once(Some(Duration::from_millis(10))).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        signal.fire();
        runloop.run_once(Some(Duration::from_millis(10))).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_fire_from_other_threads() {
        let worker = RunloopThread::spawn(
            RunloopConfig::builder().backend(BackendKind::Park).build(),
        )
        .unwrap();
        let (tx, rx) = mpsc::channel();
        let (signal_tx, signal_rx) = mpsc::channel();
        let runloop = worker.runloop().clone();
        worker
            .runloop()
            .post_task(move || {
                let tx = tx.clone();
                let checked = runloop.clone();
                let signal = Signal::new(&runloop, move || {
                    tx.send(checked.is_current()).unwrap();
                })
                .unwrap();
                signal_tx.send(signal).unwrap();
            })
            .unwrap();
        let signal = signal_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        let firing = signal.clone();
        thread::spawn(move || firing.fire()).join().unwrap();
        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
        worker.stop().unwrap();
    }

    #[test]
    fn test_close_is_idempotent() {
        let runloop = Runloop::new(&RunloopConfig::default()).unwrap();
        let closed = Arc::new(AtomicUsize::new(0));
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = fired.clone();
        let signal = Signal::new(&runloop, move || {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        for _ in 0..3 {
            let closed = closed.clone();
            signal.close(move || {
                closed.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert!(!signal.fire());
        drive_until(&runloop, || closed.load(Ordering::SeqCst) == 1);

        runloop.run_once(Some(Duration::from_millis(10))).unwrap();
        assert_eq!(closed.load(Ordering::SeqCst), 1);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_pending_fire_runs_before_close() {
        let runloop = Runloop::new(&RunloopConfig::default()).unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = fired.clone();
        let signal = Signal::new(&runloop, move || {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        let closed = Arc::new(AtomicUsize::new(0));
        let closed_clone = closed.clone();
        assert!(signal.fire());
        assert!(signal.close(move || {
            closed_clone.fetch_add(1, Ordering::SeqCst);
        }));
        drive_until(&runloop, || closed.load(Ordering::SeqCst) == 1);
        // The fire was queued before close began, so it still ran exactly once.
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_create_off_thread_fails() {
        let runloop = Runloop::new(&RunloopConfig::default()).unwrap();
        runloop.run_once(Some(Duration::ZERO)).unwrap();
        let other = runloop.clone();
        let result = thread::spawn(move || Signal::new(&other, || {}).map(|_| ()))
            .join()
            .unwrap();
        assert!(matches!(result, Err(Error::WrongThread)));
    }
}
