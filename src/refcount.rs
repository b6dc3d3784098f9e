//! Atomic ownership counting with an end-of-life callback.
//!
//! [`RefCounted`] is the primitive used wherever several asynchronous participants
//! must all confirm before something is released: the two-phase close of a protocol
//! and the finalize countdown of a migration both run on it.
//!
//! The counter starts at one. Every [`inc`](RefCounted::inc) must be balanced by a
//! [`dec`](RefCounted::dec); the `dec` that observes the 1 -> 0 transition runs the
//! end-of-life closure synchronously on the calling thread. Once the counter is zero
//! the object is dead: both `inc` and `dec` return [`Error::RefCountExhausted`]
//! instead of resurrecting it.

use std::{
    fmt,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use tracing::error;

use crate::{
    error::{Error, Result},
    poll::lock,
};

type OnZero<T> = Box<dyn FnOnce(T) + Send + 'static>;

struct Shared<T> {
    count: AtomicUsize,
    value: Mutex<Option<T>>,
    on_zero: Mutex<Option<OnZero<T>>>,
}

/// A value guarded by an explicit, checked reference count.
///
/// Cloning a `RefCounted` clones the *handle* and leaves the count untouched, so the
/// handle can be moved into callbacks that will later call `dec`.
pub struct RefCounted<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for RefCounted<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> fmt::Debug for RefCounted<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefCounted")
            .field("count", &self.shared.count.load(Ordering::Acquire))
            .finish()
    }
}

impl<T: Send + 'static> RefCounted<T> {
    pub fn new<F>(value: T, on_zero: F) -> Self
    where
        F: FnOnce(T) + Send + 'static,
    {
        Self {
            shared: Arc::new(Shared {
                count: AtomicUsize::new(1),
                value: Mutex::new(Some(value)),
                on_zero: Mutex::new(Some(Box::new(on_zero))),
            }),
        }
    }

    /// Takes one more reference. Returns the new count.
    pub fn inc(&self) -> Result<usize> {
        let mut current = self.shared.count.load(Ordering::Acquire);
        loop {
            if current == 0 {
                error!("inc on a reference count that already reached zero");
                return Err(Error::RefCountExhausted);
            }
            match self.shared.count.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(current + 1),
                Err(actual) => current = actual,
            }
        }
    }

    /// Releases one reference. Returns the new count; at zero the end-of-life
    /// closure has already run when this returns.
    pub fn dec(&self) -> Result<usize> {
        let mut current = self.shared.count.load(Ordering::Acquire);
        loop {
            if current == 0 {
                error!("dec on a reference count that already reached zero");
                return Err(Error::RefCountExhausted);
            }
            match self.shared.count.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        if current == 1 {
            self.release();
        }
        Ok(current - 1)
    }

    pub fn count(&self) -> usize {
        self.shared.count.load(Ordering::Acquire)
    }

    pub fn is_alive(&self) -> bool {
        self.count() > 0
    }

    /// Runs `f` against the value while it is still alive.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        let value = lock(&self.shared.value);
        value.as_ref().map(f)
    }

    fn release(&self) {
        let value = lock(&self.shared.value).take();
        let on_zero = lock(&self.shared.on_zero).take();
        if let (Some(value), Some(on_zero)) = (value, on_zero) {
            on_zero(value);
        }
    }
}
