use std::{
    fmt,
    ops::{Deref, DerefMut},
    sync::{mpsc as channel, Arc, Mutex},
};

use crate::poll::lock;

type Reset<T> = Arc<dyn Fn(&mut T) + Send + Sync>;

/// A pool of reusable objects. Objects return to the pool when their
/// [`PooledObject`] guard drops; an empty pool creates a fresh one on demand.
#[derive(Clone)]
pub struct ObjectPool<T> {
    sender: channel::Sender<T>,
    receiver: Arc<Mutex<channel::Receiver<T>>>,
    create_fn: Arc<dyn Fn() -> T + Send + Sync>,
    reset_fn: Option<Reset<T>>,
}

impl<T> fmt::Debug for ObjectPool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectPool").finish_non_exhaustive()
    }
}

impl<T: Send + Default + 'static> ObjectPool<T> {
    pub fn new<F>(initial_size: usize, create_fn: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        let (sender, receiver) = channel::channel();

        for _ in 0..initial_size {
            // The receiver is held below, so this cannot fail.
            let _ = sender.send(create_fn());
        }

        Self {
            sender,
            receiver: Arc::new(Mutex::new(receiver)),
            create_fn: Arc::new(create_fn),
            reset_fn: None,
        }
    }

    /// Runs `reset` on every object handed out by [`acquire`](Self::acquire).
    pub fn with_reset<F>(mut self, reset: F) -> Self
    where
        F: Fn(&mut T) + Send + Sync + 'static,
    {
        self.reset_fn = Some(Arc::new(reset));
        self
    }

    pub fn acquire(&self) -> PooledObject<T> {
        let recycled = lock(&self.receiver).try_recv().ok();
        let mut object = recycled.unwrap_or_else(|| (self.create_fn)());
        if let Some(reset) = &self.reset_fn {
            reset(&mut object);
        }

        PooledObject {
            object,
            pool_sender: self.sender.clone(),
        }
    }
}

impl ObjectPool<Vec<u8>> {
    /// A pool of zeroed byte buffers of `size` bytes.
    pub fn buffers(initial_size: usize, size: usize) -> Self {
        Self::new(initial_size, move || vec![0; size]).with_reset(move |buffer| {
            buffer.clear();
            buffer.resize(size, 0);
        })
    }
}

pub struct PooledObject<T: Default> {
    object: T,
    pool_sender: channel::Sender<T>,
}

impl<T: Default> Deref for PooledObject<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.object
    }
}

impl<T: Default> DerefMut for PooledObject<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.object
    }
}

impl<T: Default> Drop for PooledObject<T> {
    fn drop(&mut self) {
        let object = std::mem::take(&mut self.object);
        let _ = self.pool_sender.send(object);
    }
}
