//! Runloop timers.
//!
//! A [`Timer`] is created for a backend, then started on a runloop of that backend
//! with a callback. It fires every `timeout` until its repeat budget is spent
//! ([`Repeat::Times`]) or forever ([`Repeat::Infinite`]) until stopped. `start`,
//! `stop` and `close` must be called on the runloop thread; stop and close
//! completions are delivered on a later turn.

use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

use tracing::trace;

use crate::{
    config::BackendKind,
    error::{Error, Result},
    poll::lock,
};

use super::{Runloop, WeakRunloop};

pub(crate) type TimerKey = (Instant, u64);

type Callback = Box<dyn FnMut(&Timer) + Send + 'static>;

static NEXT_TIMER_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Repeat {
    Infinite,
    Times(u32),
}

#[derive(Clone)]
pub struct Timer {
    shared: Arc<TimerShared>,
}

struct TimerShared {
    id: u64,
    backend: BackendKind,
    timeout: Duration,
    repeat: Repeat,
    state: Mutex<TimerState>,
}

#[derive(Default)]
struct TimerState {
    runloop: Option<WeakRunloop>,
    key: Option<TimerKey>,
    remaining: Option<u32>,
    callback: Option<Callback>,
    closed: bool,
    fired: u64,
}

impl fmt::Debug for Timer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Timer")
            .field("id", &self.shared.id)
            .field("backend", &self.shared.backend)
            .field("timeout", &self.shared.timeout)
            .field("repeat", &self.shared.repeat)
            .finish()
    }
}

impl Timer {
    pub fn new(backend: BackendKind, timeout: Duration, repeat: Repeat) -> Self {
        Self {
            shared: Arc::new(TimerShared {
                id: NEXT_TIMER_ID.fetch_add(1, Ordering::Relaxed),
                backend,
                timeout,
                repeat,
                state: Mutex::new(TimerState::default()),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn timeout(&self) -> Duration {
        self.shared.timeout
    }

    /// Arms the timer with a fresh repeat budget. Starting an armed timer re-arms it
    /// and replaces its callback.
    pub fn start<F>(&self, runloop: &Runloop, callback: F) -> Result<()>
    where
        F: FnMut(&Timer) + Send + 'static,
    {
        if runloop.backend() != self.shared.backend {
            return Err(Error::BackendMismatch {
                expected: self.shared.backend,
                found: runloop.backend(),
            });
        }
        runloop.check_thread()?;

        let previous = {
            let mut state = lock(&self.shared.state);
            if state.closed {
                return Err(Error::TimerClosed);
            }
            if let Some(bound) = state.runloop.as_ref().and_then(WeakRunloop::upgrade) {
                if bound != *runloop {
                    return Err(Error::TimerBound);
                }
            }
            if let Some(key) = state.key.take() {
                runloop.cancel_timer(key);
            }
            state.runloop = Some(runloop.downgrade());
            let previous = state.callback.replace(Box::new(callback));
            state.remaining = match self.shared.repeat {
                Repeat::Infinite => None,
                Repeat::Times(times) => Some(times),
            };
            if state.remaining != Some(0) {
                let deadline = Instant::now() + self.shared.timeout;
                state.key = Some(runloop.schedule_timer(deadline, self.clone()));
            }
            previous
        };
        drop(previous);
        trace!(timer = self.shared.id, runloop = runloop.name(), "timer started");
        Ok(())
    }

    /// Disarms the timer; `on_stopped` runs on a later turn of its runloop.
    pub fn stop<F>(&self, on_stopped: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let Some(runloop) = self.runloop() else {
            on_stopped();
            return Ok(());
        };
        runloop.check_thread()?;
        let key = lock(&self.shared.state).key.take();
        if let Some(key) = key {
            runloop.cancel_timer(key);
        }
        runloop.defer(Box::new(on_stopped));
        Ok(())
    }

    /// Disarms the timer for good and drops its callback; `on_closed` runs on a later
    /// turn of its runloop. A timer that was never started closes immediately.
    pub fn close<F>(&self, on_closed: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let runloop = self.runloop();
        if let Some(runloop) = &runloop {
            runloop.check_thread()?;
        }
        let callback = {
            let mut state = lock(&self.shared.state);
            if state.closed {
                return Err(Error::TimerClosed);
            }
            state.closed = true;
            if let (Some(key), Some(runloop)) = (state.key.take(), &runloop) {
                runloop.cancel_timer(key);
            }
            state.callback.take()
        };
        drop(callback);
        trace!(timer = self.shared.id, "timer closed");
        match runloop {
            Some(runloop) => runloop.defer(Box::new(on_closed)),
            None => on_closed(),
        }
        Ok(())
    }

    /// Releases a timer that is closed or was never armed.
    pub fn destroy(self) -> Result<()> {
        let state = lock(&self.shared.state);
        if state.key.is_some() && !state.closed {
            return Err(Error::TimerActive);
        }
        Ok(())
    }

    pub fn is_active(&self) -> bool {
        lock(&self.shared.state).key.is_some()
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.shared.state).closed
    }

    /// How many times the callback has fired.
    pub fn fired(&self) -> u64 {
        lock(&self.shared.state).fired
    }

    fn runloop(&self) -> Option<Runloop> {
        lock(&self.shared.state)
            .runloop
            .as_ref()
            .and_then(WeakRunloop::upgrade)
    }

    pub(crate) fn fire(&self, runloop: &Runloop, key: TimerKey) {
        let mut callback = {
            let mut state = lock(&self.shared.state);
            if state.key != Some(key) || state.closed {
                return;
            }
            state.key = None;
            state.fired += 1;
            let again = match state.remaining {
                None => true,
                Some(remaining) => {
                    let remaining = remaining.saturating_sub(1);
                    state.remaining = Some(remaining);
                    remaining > 0
                }
            };
            if again {
                let deadline = Instant::now() + self.shared.timeout;
                state.key = Some(runloop.schedule_timer(deadline, self.clone()));
            }
            state.callback.take()
        };

        if let Some(callback) = callback.as_mut() {
            callback(self);
        }

        let discard = {
            let mut state = lock(&self.shared.state);
            if state.callback.is_none() && !state.closed {
                state.callback = callback;
                None
            } else {
                callback
            }
        };
        drop(discard);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RunloopConfig;
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    fn runloop(backend: BackendKind) -> Runloop {
        Runloop::new(&RunloopConfig::builder().backend(backend).build()).unwrap()
    }

    fn drive_until(runloop: &Runloop, mut done: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done() {
            assert!(Instant::now() < deadline, "timer did not converge");
            runloop.run_once(Some(Duration::from_millis(5))).unwrap();
        }
    }

    #[test]
    fn test_finite_timer_self_disables() {
        let runloop = runloop(BackendKind::Park);
        let timer = Timer::new(BackendKind::Park, Duration::from_millis(5), Repeat::Times(3));
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = hits.clone();
        timer
            .start(&runloop, move |_| {
                hits_clone.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        assert_eq!(runloop.active_timers(), 1);

        drive_until(&runloop, || hits.load(Ordering::SeqCst) == 3);
        assert!(!timer.is_active());
        assert_eq!(runloop.active_timers(), 0);

        runloop.run_once(Some(Duration::from_millis(20))).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 3);
        assert_eq!(timer.fired(), 3);
        timer.destroy().unwrap();
    }

    #[test]
    fn test_infinite_timer_until_stopped() {
        let runloop = runloop(BackendKind::Mio);
        let timer = Timer::new(BackendKind::Mio, Duration::from_millis(1), Repeat::Infinite);
        timer.start(&runloop, |_| {}).unwrap();
        drive_until(&runloop, || timer.fired() >= 5);

        let stopped = Arc::new(AtomicBool::new(false));
        let stopped_clone = stopped.clone();
        timer
            .stop(move || stopped_clone.store(true, Ordering::SeqCst))
            .unwrap();
        assert!(!timer.is_active());
        drive_until(&runloop, || stopped.load(Ordering::SeqCst));

        let fired = timer.fired();
        runloop.run_once(Some(Duration::from_millis(10))).unwrap();
        assert_eq!(timer.fired(), fired);
    }

    #[test]
    fn test_backend_mismatch() {
        let runloop = runloop(BackendKind::Mio);
        let timer = Timer::new(BackendKind::Park, Duration::from_millis(1), Repeat::Times(1));
        let result = timer.start(&runloop, |_| {});
        assert!(matches!(
            result,
            Err(Error::BackendMismatch {
                expected: BackendKind::Park,
                found: BackendKind::Mio
            })
        ));
        assert_eq!(runloop.active_timers(), 0);
    }

    #[test]
    fn test_close_and_destroy() {
        let runloop = runloop(BackendKind::Park);
        let timer = Timer::new(BackendKind::Park, Duration::from_secs(60), Repeat::Times(1));
        timer.start(&runloop, |_| {}).unwrap();
        assert!(matches!(timer.clone().destroy(), Err(Error::TimerActive)));

        let closed = Arc::new(AtomicBool::new(false));
        let closed_clone = closed.clone();
        timer
            .close(move || closed_clone.store(true, Ordering::SeqCst))
            .unwrap();
        assert!(matches!(timer.close(|| {}), Err(Error::TimerClosed)));
        assert!(matches!(
            timer.start(&runloop, |_| {}),
            Err(Error::TimerClosed)
        ));
        assert!(!closed.load(Ordering::SeqCst));
        drive_until(&runloop, || closed.load(Ordering::SeqCst));
        assert_eq!(runloop.active_timers(), 0);
        timer.destroy().unwrap();
    }

    #[test]
    fn test_restart_from_callback() {
        let runloop = runloop(BackendKind::Park);
        let timer = Timer::new(BackendKind::Park, Duration::from_millis(2), Repeat::Times(1));
        let hits = Arc::new(AtomicUsize::new(0));

        fn arm(timer: &Timer, runloop: &Runloop, hits: Arc<AtomicUsize>) {
            let again = runloop.clone();
            timer
                .start(runloop, move |timer| {
                    if hits.fetch_add(1, Ordering::SeqCst) < 2 {
                        arm(timer, &again, hits.clone());
                    }
                })
                .unwrap();
        }
        arm(&timer, &runloop, hits.clone());

        drive_until(&runloop, || hits.load(Ordering::SeqCst) == 3);
        assert!(!timer.is_active());
    }
}
