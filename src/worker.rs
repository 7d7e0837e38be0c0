//! Background tasks on a location.
//!
//! Every task locks its location for its whole run, so a location never has
//! two writers. Tasks poll a shared abort flag between steps and report
//! their result through a channel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver, TryRecvError};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;

use anyhow::{anyhow, Result};
use tracing::{debug, warn};

use crate::location::Location;

/// Shared handle on a location.
#[derive(Debug, Clone)]
pub struct LocationHandle(Arc<Mutex<Location>>);

impl LocationHandle {
    pub fn new(location: Location) -> Self {
        Self(Arc::new(Mutex::new(location)))
    }

    /// Lock the location. A poisoned lock means an earlier task panicked
    /// while writing and is reported as an error.
    pub fn lock(&self) -> Result<MutexGuard<'_, Location>> {
        self.0
            .lock()
            .map_err(|_| anyhow!("Location is unusable after a failed task"))
    }

    /// Run `f` with the location locked.
    pub fn with<R>(&self, f: impl FnOnce(&mut Location) -> R) -> Result<R> {
        let mut guard = self.lock()?;
        Ok(f(&mut guard))
    }
}

/// A running background task.
pub struct Task<T> {
    abort: Arc<AtomicBool>,
    result: Receiver<Result<T>>,
    thread: Option<JoinHandle<()>>,
}

impl<T> Task<T> {
    /// Ask the task to stop at its next check.
    pub fn abort(&self) {
        self.abort.store(true, Ordering::Relaxed);
    }

    pub fn is_aborted(&self) -> bool {
        self.abort.load(Ordering::Relaxed)
    }

    /// Block until the task finishes.
    pub fn wait(mut self) -> Result<T> {
        let result = self
            .result
            .recv()
            .unwrap_or_else(|_| Err(anyhow!("Task ended without a result")));
        self.join();
        result
    }

    /// The result if the task has finished, `None` while it is running.
    pub fn try_result(&mut self) -> Option<Result<T>> {
        match self.result.try_recv() {
            Ok(result) => {
                self.join();
                Some(result)
            }
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => {
                self.join();
                Some(Err(anyhow!("Task ended without a result")))
            }
        }
    }

    fn join(&mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("Background task panicked");
            }
        }
    }
}

/// Run `task` on its own thread with `handle` locked.
pub fn spawn<T, F>(handle: LocationHandle, abort: Arc<AtomicBool>, task: F) -> Task<T>
where
    T: Send + 'static,
    F: FnOnce(&mut Location, &AtomicBool) -> Result<T> + Send + 'static,
{
    let (tx, rx) = channel();
    let flag = Arc::clone(&abort);
    let thread = std::thread::spawn(move || {
        let result = match handle.lock() {
            Ok(mut location) => {
                debug!("Task started on '{}'", location.title());
                task(&mut location, &flag)
            }
            Err(e) => Err(e),
        };
        // The receiver may already be gone.
        let _ = tx.send(result);
    });

    Task {
        abort,
        result: rx,
        thread: Some(thread),
    }
}
