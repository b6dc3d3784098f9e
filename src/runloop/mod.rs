//! Thread-pinned event loops.
//!
//! A [`Runloop`] is one thread's dispatch engine. It owns a FIFO task queue that any
//! thread may post to, the timers started on it, the [`Signal`]s created on it and,
//! for the `mio` backend, the OS poller that drives socket readiness.
//!
//! ```text
//!  any thread                         runloop thread
//!  ──────────                         ──────────────
//!  post_task(f) ──▶ tasks (mutex) ─┐
//!                                  ├─ wake signal ──▶ turn():
//!  Signal::fire ──▶ ready list ────┘                   1. driver.poll(timeout)  (I/O handlers)
//!                                                      2. due timers
//!                                                      3. ready handles       (signals, task drain)
//!                                                      4. deferred closes
//! ```
//!
//! Runloops come in two modes. An *owned* runloop is driven by [`Runloop::run`],
//! which blocks until [`Runloop::stop`] completes. An *attached* runloop wraps a loop
//! that some host drives: the host calls [`Runloop::run_once`] from its own loop,
//! `run` is a no-op and stopping never stops the host.
//!
//! Everything that is not explicitly thread-safe (`run`, timers, creating signals)
//! must happen on the runloop's thread, which is fixed the first time the runloop
//! runs. Those operations return [`Error::WrongThread`] elsewhere.

mod handle;
pub mod thread;
pub mod timer;

use std::{
    collections::{BTreeMap, VecDeque},
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering},
        Arc, Mutex, OnceLock, Weak,
    },
    thread::ThreadId,
    time::{Duration, Instant},
};

use tracing::{debug, trace, warn};

use crate::{
    config::{BackendKind, RunloopConfig},
    error::{Error, Result},
    poll::{lock, Driver, MioDriver},
    signal::Signal,
};

pub(crate) use handle::AsyncHandle;
use handle::HandleShared;
pub use thread::RunloopThread;
pub use timer::{Repeat, Timer};
use timer::TimerKey;

pub type Task = Box<dyn FnOnce() + Send + 'static>;

static NEXT_RUNLOOP_ID: AtomicU64 = AtomicU64::new(1);

/// Where a posted task is inserted in the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskPosition {
    Front,
    Back,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum RunloopState {
    Created = 0,
    Running = 1,
    Stopping = 2,
    Stopped = 3,
}

impl RunloopState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => RunloopState::Created,
            1 => RunloopState::Running,
            2 => RunloopState::Stopping,
            _ => RunloopState::Stopped,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// The runloop drives its own loop in [`Runloop::run`].
    Owned,
    /// A host drives the loop through [`Runloop::run_once`].
    Attached,
}

struct Inner {
    id: u64,
    name: String,
    mode: Mode,
    driver: Driver,
    state: AtomicU8,
    owner: OnceLock<ThreadId>,
    tasks: Mutex<VecDeque<Task>>,
    task_signal: OnceLock<Signal>,
    ready: Mutex<VecDeque<Arc<HandleShared>>>,
    deferred: Mutex<VecDeque<Task>>,
    timers: Mutex<BTreeMap<TimerKey, Timer>>,
    timer_seq: AtomicU64,
    on_stopped: Mutex<Option<Task>>,
    quit: AtomicBool,
}

/// Handle to a runloop. Cheap to clone and safe to share across threads.
#[derive(Clone)]
pub struct Runloop {
    inner: Arc<Inner>,
}

/// Non-owning reference to a [`Runloop`].
#[derive(Clone)]
pub struct WeakRunloop {
    inner: Weak<Inner>,
}

impl WeakRunloop {
    pub fn upgrade(&self) -> Option<Runloop> {
        self.inner.upgrade().map(|inner| Runloop { inner })
    }
}

impl PartialEq for Runloop {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Runloop {}

impl fmt::Debug for Runloop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runloop")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("backend", &self.backend())
            .field("mode", &self.inner.mode)
            .field("state", &self.state())
            .finish()
    }
}

impl Runloop {
    /// Creates an owned runloop.
    pub fn new(config: &RunloopConfig) -> Result<Self> {
        Self::create(config, Mode::Owned)
    }

    /// Wraps a loop that the host drives by calling [`run_once`](Self::run_once).
    pub fn attach(config: &RunloopConfig) -> Result<Self> {
        Self::create(config, Mode::Attached)
    }

    fn create(config: &RunloopConfig, mode: Mode) -> Result<Self> {
        let driver = Driver::new(config)?;
        let runloop = Runloop {
            inner: Arc::new(Inner {
                id: NEXT_RUNLOOP_ID.fetch_add(1, Ordering::Relaxed),
                name: config.name.clone(),
                mode,
                driver,
                state: AtomicU8::new(RunloopState::Created as u8),
                owner: OnceLock::new(),
                tasks: Mutex::new(VecDeque::new()),
                task_signal: OnceLock::new(),
                ready: Mutex::new(VecDeque::new()),
                deferred: Mutex::new(VecDeque::new()),
                timers: Mutex::new(BTreeMap::new()),
                timer_seq: AtomicU64::new(0),
                on_stopped: Mutex::new(None),
                quit: AtomicBool::new(false),
            }),
        };

        let weak = runloop.downgrade();
        let task_signal = Signal::new(&runloop, move || {
            if let Some(runloop) = weak.upgrade() {
                runloop.drain_tasks();
            }
        })?;
        let _ = runloop.inner.task_signal.set(task_signal);

        debug!(
            runloop = %runloop.inner.name,
            id = runloop.inner.id,
            backend = %config.backend,
            ?mode,
            "runloop created"
        );
        Ok(runloop)
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn mode(&self) -> Mode {
        self.inner.mode
    }

    pub fn backend(&self) -> BackendKind {
        self.inner.driver.kind()
    }

    pub fn state(&self) -> RunloopState {
        RunloopState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    pub fn downgrade(&self) -> WeakRunloop {
        WeakRunloop {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Whether the calling thread is the one this runloop runs on.
    pub fn is_current(&self) -> bool {
        self.inner.owner.get() == Some(&std::thread::current().id())
    }

    /// Fails with [`Error::WrongThread`] when called off the runloop thread. A runloop
    /// that has not run yet is not pinned and accepts any thread.
    pub fn check_thread(&self) -> Result<()> {
        match self.inner.owner.get() {
            Some(owner) if *owner != std::thread::current().id() => Err(Error::WrongThread),
            _ => Ok(()),
        }
    }

    /// Number of armed timers.
    pub fn active_timers(&self) -> usize {
        lock(&self.inner.timers).len()
    }

    pub fn pending_tasks(&self) -> usize {
        lock(&self.inner.tasks).len()
    }

    /// Queues `task` at the back of the task queue. Callable from any thread.
    pub fn post_task<F>(&self, task: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.post(Box::new(task), TaskPosition::Back)
    }

    /// Queues `task` ahead of everything not yet taken for execution.
    pub fn post_task_front<F>(&self, task: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.post(Box::new(task), TaskPosition::Front)
    }

    /// Tasks posted once [`stop`](Self::stop) has begun are rejected with
    /// [`Error::RunloopStopping`].
    pub fn post(&self, task: Task, position: TaskPosition) -> Result<()> {
        let was_empty = {
            let mut tasks = lock(&self.inner.tasks);
            // Read under the queue lock: stop() flips the state under the same lock,
            // so nothing can slip in behind the final drain.
            if self.state() >= RunloopState::Stopping {
                return Err(Error::RunloopStopping);
            }
            let was_empty = tasks.is_empty();
            match position {
                TaskPosition::Front => tasks.push_front(task),
                TaskPosition::Back => tasks.push_back(task),
            }
            was_empty
        };

        if was_empty {
            if let Some(signal) = self.inner.task_signal.get() {
                signal.fire();
            }
        }
        Ok(())
    }

    /// Blocks until [`stop`](Self::stop) completes and every close callback queued
    /// during the stop has run. A no-op for attached runloops.
    pub fn run(&self) -> Result<()> {
        if self.inner.mode == Mode::Attached {
            return Ok(());
        }
        self.enter()?;
        debug!(runloop = %self.inner.name, "runloop running");
        while !self.inner.quit.load(Ordering::Acquire) || self.has_queued_work() {
            self.turn(None)?;
        }
        debug!(runloop = %self.inner.name, "runloop exited");
        Ok(())
    }

    /// Runs one iteration, waiting at most `max_wait` for work (`None` waits until
    /// something arrives). This is how a host drives an attached runloop.
    pub fn run_once(&self, max_wait: Option<Duration>) -> Result<()> {
        self.enter()?;
        self.turn(max_wait)
    }

    /// Stops the runloop. See [`stop_with`](Self::stop_with).
    pub fn stop(&self) -> Result<()> {
        self.stop_with(|| {})
    }

    /// Begins stopping: new tasks are rejected, the wake signal is closed, and once
    /// that close completes every task still queued runs, then `on_stopped`, then an
    /// owned runloop leaves [`run`](Self::run). Callable from any thread.
    pub fn stop_with<F>(&self, on_stopped: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let _tasks = lock(&self.inner.tasks);
            if self.state() >= RunloopState::Stopping {
                return Err(Error::RunloopStopping);
            }
            self.set_state(RunloopState::Stopping);
        }
        *lock(&self.inner.on_stopped) = Some(Box::new(on_stopped));
        debug!(runloop = %self.inner.name, "runloop stopping");

        let weak = self.downgrade();
        let finish = move || {
            if let Some(runloop) = weak.upgrade() {
                runloop.finish_stop();
            }
        };
        match self.inner.task_signal.get() {
            Some(signal) => {
                signal.close(finish);
            }
            None => finish(),
        }
        Ok(())
    }

    /// Queues `task` like [`post_task`](Self::post_task), except that a stopping
    /// runloop still runs it on a later turn. Used for completions that must not be
    /// lost during shutdown.
    pub(crate) fn schedule(&self, task: Task) {
        let was_empty = {
            let mut tasks = lock(&self.inner.tasks);
            if self.state() >= RunloopState::Stopping {
                drop(tasks);
                self.defer(task);
                return;
            }
            let was_empty = tasks.is_empty();
            tasks.push_back(task);
            was_empty
        };
        if was_empty {
            if let Some(signal) = self.inner.task_signal.get() {
                signal.fire();
            }
        }
    }

    pub(crate) fn mio(&self) -> Option<&MioDriver> {
        self.inner.driver.as_mio()
    }

    /// Runs `task` on a later turn of this runloop regardless of its state. Used for
    /// close completions, which must still fire while the runloop is stopping.
    pub(crate) fn defer(&self, task: Task) {
        lock(&self.inner.deferred).push_back(task);
        self.wake();
    }

    pub(crate) fn enqueue_ready(&self, handle: Arc<HandleShared>) {
        lock(&self.inner.ready).push_back(handle);
        self.wake();
    }

    pub(crate) fn schedule_timer(&self, deadline: Instant, timer: Timer) -> TimerKey {
        let key = (
            deadline,
            self.inner.timer_seq.fetch_add(1, Ordering::Relaxed),
        );
        lock(&self.inner.timers).insert(key, timer);
        // Only the loop thread schedules timers and it recomputes its timeout
        // before polling again, so no wake is needed.
        key
    }

    pub(crate) fn cancel_timer(&self, key: TimerKey) {
        let removed = lock(&self.inner.timers).remove(&key);
        drop(removed);
    }

    fn wake(&self) {
        if let Err(err) = self.inner.driver.wake() {
            warn!(runloop = %self.inner.name, %err, "failed to wake runloop");
        }
    }

    fn set_state(&self, state: RunloopState) {
        self.inner.state.store(state as u8, Ordering::Release);
    }

    fn enter(&self) -> Result<()> {
        let current = std::thread::current().id();
        if *self.inner.owner.get_or_init(|| current) != current {
            return Err(Error::WrongThread);
        }
        let _ = self.inner.state.compare_exchange(
            RunloopState::Created as u8,
            RunloopState::Running as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        Ok(())
    }

    fn turn(&self, max_wait: Option<Duration>) -> Result<()> {
        let timeout = if self.has_immediate_work() {
            Some(Duration::ZERO)
        } else {
            let next_timer = lock(&self.inner.timers)
                .keys()
                .next()
                .map(|(deadline, _)| deadline.saturating_duration_since(Instant::now()));
            match (next_timer, max_wait) {
                (Some(timer), Some(max_wait)) => Some(timer.min(max_wait)),
                (timer, max_wait) => timer.or(max_wait),
            }
        };

        self.inner.driver.poll(timeout)?;
        self.run_timers();
        self.run_ready();
        self.run_deferred();
        Ok(())
    }

    fn has_immediate_work(&self) -> bool {
        self.inner.quit.load(Ordering::Acquire) || self.has_queued_work()
    }

    fn has_queued_work(&self) -> bool {
        !lock(&self.inner.ready).is_empty() || !lock(&self.inner.deferred).is_empty()
    }

    fn run_timers(&self) {
        let now = Instant::now();
        let due: Vec<(TimerKey, Timer)> = {
            let mut timers = lock(&self.inner.timers);
            let mut due = Vec::new();
            while let Some(entry) = timers.first_entry() {
                if entry.key().0 > now {
                    break;
                }
                let key = *entry.key();
                due.push((key, entry.remove()));
            }
            due
        };
        for (key, timer) in due {
            timer.fire(self, key);
        }
    }

    fn run_ready(&self) {
        let ready = std::mem::take(&mut *lock(&self.inner.ready));
        for handle in ready {
            handle.dispatch();
        }
    }

    fn run_deferred(&self) {
        let deferred = std::mem::take(&mut *lock(&self.inner.deferred));
        for task in deferred {
            task();
        }
    }

    fn drain_tasks(&self) {
        loop {
            let batch = std::mem::take(&mut *lock(&self.inner.tasks));
            if batch.is_empty() {
                break;
            }
            trace!(runloop = %self.inner.name, tasks = batch.len(), "draining tasks");
            for task in batch {
                task();
            }
        }
    }

    fn finish_stop(&self) {
        self.drain_tasks();
        if let Some(on_stopped) = lock(&self.inner.on_stopped).take() {
            on_stopped();
        }
        self.set_state(RunloopState::Stopped);
        debug!(runloop = %self.inner.name, "runloop stopped");
        if self.inner.mode == Mode::Owned {
            self.inner.quit.store(true, Ordering::Release);
            self.wake();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        sync::{atomic::AtomicUsize, mpsc},
        thread,
    };

    fn park_config(name: &str) -> RunloopConfig {
        RunloopConfig::builder()
            .name(name)
            .backend(BackendKind::Park)
            .build()
    }

    fn drive_until(runloop: &Runloop, mut done: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done() {
            assert!(Instant::now() < deadline, "runloop did not converge");
            runloop.run_once(Some(Duration::from_millis(10))).unwrap();
        }
    }

    #[test]
    fn test_runloop_creation() {
        for backend in [BackendKind::Mio, BackendKind::Park] {
            let config = RunloopConfig::builder().backend(backend).build();
            let runloop = Runloop::new(&config).unwrap();
            assert_eq!(runloop.backend(), backend);
            assert_eq!(runloop.state(), RunloopState::Created);
            assert_eq!(runloop.mode(), Mode::Owned);
        }
    }

    #[test]
    fn test_tasks_run_in_post_order() {
        let runloop = Runloop::new(&park_config("fifo")).unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..10 {
            let order = order.clone();
            runloop.post_task(move || order.lock().unwrap().push(i)).unwrap();
        }
        drive_until(&runloop, || order.lock().unwrap().len() == 10);
        assert_eq!(*order.lock().unwrap(), (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_post_task_front() {
        let runloop = Runloop::new(&park_config("front")).unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let order = order.clone();
            runloop.post_task(move || order.lock().unwrap().push(i)).unwrap();
        }
        let order_clone = order.clone();
        runloop
            .post_task_front(move || order_clone.lock().unwrap().push(99))
            .unwrap();
        drive_until(&runloop, || order.lock().unwrap().len() == 4);
        assert_eq!(*order.lock().unwrap(), vec![99, 0, 1, 2]);
    }

    #[test]
    fn test_stop_drains_and_rejects() {
        let runloop = Runloop::new(&park_config("stop")).unwrap();
        let ran = Arc::new(AtomicUsize::new(0));
        for _ in 0..5 {
            let ran = ran.clone();
            runloop
                .post_task(move || {
                    ran.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
        }

        let (tx, rx) = mpsc::channel();
        let ran_at_stop = ran.clone();
        runloop
            .stop_with(move || {
                tx.send(ran_at_stop.load(Ordering::SeqCst)).unwrap();
            })
            .unwrap();
        assert!(matches!(
            runloop.post_task(|| {}),
            Err(Error::RunloopStopping)
        ));
        assert!(matches!(runloop.stop(), Err(Error::RunloopStopping)));

        runloop.run().unwrap();
        assert_eq!(rx.recv().unwrap(), 5);
        assert_eq!(runloop.state(), RunloopState::Stopped);
    }

    #[test]
    fn test_run_finishes_closes_started_while_stopping() {
        let runloop = Runloop::new(&park_config("closing")).unwrap();
        let closed = Arc::new(AtomicUsize::new(0));

        let stopping = runloop.clone();
        let counted = closed.clone();
        runloop
            .stop_with(move || {
                let again = stopping.clone();
                let counted_later = counted.clone();
                stopping.defer(Box::new(move || {
                    counted.fetch_add(1, Ordering::SeqCst);
                    again.defer(Box::new(move || {
                        counted_later.fetch_add(1, Ordering::SeqCst);
                    }));
                }));
            })
            .unwrap();

        runloop.run().unwrap();
        assert_eq!(closed.load(Ordering::SeqCst), 2);
        assert_eq!(runloop.state(), RunloopState::Stopped);
    }

    #[test]
    fn test_stop_from_another_thread() {
        let runloop = Runloop::new(&RunloopConfig::default()).unwrap();
        let runner = runloop.clone();
        let handle = thread::spawn(move || runner.run());

        thread::sleep(Duration::from_millis(20));
        runloop.stop().unwrap();
        handle.join().unwrap().unwrap();
        assert_eq!(runloop.state(), RunloopState::Stopped);
    }

    #[test]
    fn test_wrong_thread_is_rejected() {
        let runloop = Runloop::new(&park_config("pinned")).unwrap();
        runloop.run_once(Some(Duration::ZERO)).unwrap();
        assert!(runloop.is_current());

        let other = runloop.clone();
        let result = thread::spawn(move || {
            (
                other.run_once(Some(Duration::ZERO)),
                other.check_thread(),
                other.post_task(|| {}),
            )
        })
        .join()
        .unwrap();
        assert!(matches!(result.0, Err(Error::WrongThread)));
        assert!(matches!(result.1, Err(Error::WrongThread)));
        assert!(result.2.is_ok());
    }

    #[test]
    fn test_attached_runloop() {
        let runloop = Runloop::attach(&park_config("host")).unwrap();
        assert_eq!(runloop.mode(), Mode::Attached);
        runloop.run().unwrap();

        let ran = Arc::new(AtomicUsize::new(0));
        let ran_clone = ran.clone();
        runloop
            .post_task(move || {
                ran_clone.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        drive_until(&runloop, || ran.load(Ordering::SeqCst) == 1);

        let stopped = Arc::new(AtomicBool::new(false));
        let stopped_clone = stopped.clone();
        runloop
            .stop_with(move || stopped_clone.store(true, Ordering::SeqCst))
            .unwrap();
        drive_until(&runloop, || stopped.load(Ordering::SeqCst));
        assert_eq!(runloop.state(), RunloopState::Stopped);
        // The host keeps driving; an attached runloop never sets its own quit flag.
        runloop.run_once(Some(Duration::ZERO)).unwrap();
    }
}
