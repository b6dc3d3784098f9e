//! The coalescing wake primitive every cross-thread notification is built from.
//!
//! An `AsyncHandle` is owned by one runloop. `send` may be called from any thread:
//! it marks the handle pending and queues it on the runloop; any further sends
//! before the callback runs collapse into that one pending dispatch. Closing is
//! loop-thread only and always completes through a deferred callback.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};

use crate::poll::lock;

use super::{Runloop, Task, WeakRunloop};

type Callback = Box<dyn FnMut() + Send + 'static>;

#[derive(Clone)]
pub(crate) struct AsyncHandle {
    shared: Arc<HandleShared>,
}

pub(crate) struct HandleShared {
    runloop: WeakRunloop,
    pending: AtomicBool,
    closed: AtomicBool,
    callback: Mutex<Option<Callback>>,
}

impl AsyncHandle {
    /// Callers check the runloop thread before creating handles.
    pub fn new<F>(runloop: &Runloop, callback: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        Self {
            shared: Arc::new(HandleShared {
                runloop: runloop.downgrade(),
                pending: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                callback: Mutex::new(Some(Box::new(callback))),
            }),
        }
    }

    /// Returns `false` once the handle is closed or its runloop is gone.
    pub fn send(&self) -> bool {
        if self.shared.closed.load(Ordering::Acquire) {
            return false;
        }
        if self.shared.pending.swap(true, Ordering::AcqRel) {
            return true;
        }
        match self.shared.runloop.upgrade() {
            Some(runloop) => {
                runloop.enqueue_ready(Arc::clone(&self.shared));
                true
            }
            None => {
                self.shared.pending.store(false, Ordering::Release);
                false
            }
        }
    }

    /// Stops dispatching and runs `on_closed` on a later turn of the owning runloop.
    pub fn close(&self, on_closed: Task) {
        self.shared.closed.store(true, Ordering::Release);
        let callback = lock(&self.shared.callback).take();
        drop(callback);
        match self.shared.runloop.upgrade() {
            Some(runloop) => runloop.defer(on_closed),
            None => on_closed(),
        }
    }
}

impl HandleShared {
    pub fn dispatch(&self) {
        self.pending.store(false, Ordering::Release);
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        // Taken out for the call so the callback may send or close this handle.
        let callback = lock(&self.callback).take();
        if let Some(mut callback) = callback {
            callback();
            let discard = {
                let mut slot = lock(&self.callback);
                if slot.is_none() && !self.closed.load(Ordering::Acquire) {
                    *slot = Some(callback);
                    None
                } else {
                    Some(callback)
                }
            };
            drop(discard);
        }
    }
}
