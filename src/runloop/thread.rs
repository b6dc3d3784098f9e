use std::{
    sync::mpsc,
    thread::{Builder, JoinHandle},
};

use tracing::{error, warn};

use crate::{
    config::RunloopConfig,
    error::{Error, Result},
};

use super::Runloop;

/// An owned runloop running on its own named OS thread.
///
/// `spawn` returns once the runloop exists and is about to run, so tasks can be
/// posted immediately. Dropping the handle stops the runloop and joins the thread.
pub struct RunloopThread {
    runloop: Runloop,
    thread: Option<JoinHandle<Result<()>>>,
}

impl RunloopThread {
    pub fn spawn(config: RunloopConfig) -> Result<Self> {
        let (sender, receiver) = mpsc::channel::<Result<Runloop>>();
        let thread = Builder::new()
            .name(format!("runloop-{}", config.name))
            .spawn(move || {
                let runloop = match Runloop::new(&config) {
                    Ok(runloop) => runloop,
                    Err(err) => {
                        let _ = sender.send(Err(err));
                        return Ok(());
                    }
                };
                if sender.send(Ok(runloop.clone())).is_err() {
                    return Ok(());
                }
                let result = runloop.run();
                if let Err(err) = &result {
                    error!(runloop = runloop.name(), %err, "runloop failed");
                }
                result
            })?;

        let runloop = receiver.recv().map_err(|_| Error::ThreadGone)??;
        Ok(Self {
            runloop,
            thread: Some(thread),
        })
    }

    pub fn runloop(&self) -> &Runloop {
        &self.runloop
    }

    /// Stops the runloop and waits for its thread to exit.
    pub fn stop(mut self) -> Result<()> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<()> {
        match self.runloop.stop() {
            Ok(()) | Err(Error::RunloopStopping) => {}
            Err(err) => return Err(err),
        }
        if let Some(thread) = self.thread.take() {
            thread.join().map_err(|_| Error::ThreadGone)??;
        }
        Ok(())
    }
}

impl Drop for RunloopThread {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            warn!(runloop = self.runloop.name(), %err, "runloop thread shutdown failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendKind;
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        thread,
        time::Duration,
    };

    #[test]
    fn test_spawn_runs_on_named_thread() {
        let worker = RunloopThread::spawn(RunloopConfig::builder().name("alpha").build()).unwrap();
        let (tx, rx) = mpsc::channel();
        let runloop = worker.runloop().clone();
        worker
            .runloop()
            .post_task(move || {
                tx.send((
                    thread::current().name().map(str::to_string),
                    runloop.is_current(),
                ))
                .unwrap();
            })
            .unwrap();
        let (name, current) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(name.as_deref(), Some("runloop-alpha"));
        assert!(current);
        worker.stop().unwrap();
    }

    #[test]
    fn test_drop_stops_and_joins() {
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let worker = RunloopThread::spawn(
                RunloopConfig::builder().backend(BackendKind::Park).build(),
            )
            .unwrap();
            for _ in 0..10 {
                let counter = counter.clone();
                worker
                    .runloop()
                    .post_task(move || {
                        thread::sleep(Duration::from_millis(1));
                        counter.fetch_add(1, Ordering::SeqCst);
                    })
                    .unwrap();
            }
        }
        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn test_tasks_from_many_threads_keep_per_thread_order() {
        let worker = RunloopThread::spawn(RunloopConfig::default()).unwrap();
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));

        let posters: Vec<_> = (0..4)
            .map(|poster| {
                let runloop = worker.runloop().clone();
                let seen = seen.clone();
                thread::spawn(move || {
                    for i in 0..100 {
                        let seen = seen.clone();
                        runloop
                            .post_task(move || seen.lock().unwrap().push((poster, i)))
                            .unwrap();
                    }
                })
            })
            .collect();
        for poster in posters {
            poster.join().unwrap();
        }
        worker.stop().unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 400);
        for poster in 0..4 {
            let order: Vec<_> = seen.iter().filter(|(p, _)| *p == poster).map(|(_, i)| *i).collect();
            assert_eq!(order, (0..100).collect::<Vec<_>>());
        }
    }
}
