//! Dedicated worker threads
//!
//! Every live context owns one [`Worker`]: a named OS thread draining a FIFO queue. Jobs
//! posted to the same worker run serially in submission order, so components of one context
//! never need their own locking.

use super::errors::RuntimeError;
use super::lock;
use log::{debug, error, warn};
use std::cell::RefCell;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Mutex;
use std::thread::{self, JoinHandle, ThreadId};
use tokio::sync::{mpsc, oneshot};

pub type Job = Box<dyn FnOnce() + Send + 'static>;

thread_local! {
    // Name of the context bound to the worker running on this thread.
    static CURRENT_CONTEXT: RefCell<Option<String>> = const { RefCell::new(None) };
}

/// Name of the context whose worker is executing the calling code.
pub fn current_context() -> Option<String> {
    CURRENT_CONTEXT.with(|current| current.borrow().clone())
}

/// Named worker thread with an unbounded FIFO queue.
#[derive(Debug)]
pub struct Worker {
    name: String,
    thread_id: ThreadId,
    sender: Mutex<Option<mpsc::UnboundedSender<Job>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Worker {
    /// Starts a worker bound to `context`. The OS thread carries the same name.
    pub fn spawn(context: &str) -> Result<Self, RuntimeError> {
        let (sender, mut receiver) = mpsc::unbounded_channel::<Job>();
        let bound = context.to_string();
        let handle = thread::Builder::new()
            .name(context.to_string())
            .spawn(move || {
                CURRENT_CONTEXT.with(|current| *current.borrow_mut() = Some(bound.clone()));
                while let Some(job) = receiver.blocking_recv() {
                    if catch_unwind(AssertUnwindSafe(job)).is_err() {
                        error!("A job panicked on worker {}; continuing with the next job", bound);
                    }
                }
                debug!("Worker {} drained its queue and exited", bound);
            })
            .map_err(|source| RuntimeError::WorkerSpawn {
                name: context.to_string(),
                source,
            })?;

        debug!("Spawned worker thread {}", context);
        Ok(Self {
            name: context.to_string(),
            thread_id: handle.thread().id(),
            sender: Mutex::new(Some(sender)),
            handle: Mutex::new(Some(handle)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// True when called from this worker's own thread.
    pub fn is_current(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    /// Whether the worker still accepts jobs.
    pub fn is_alive(&self) -> bool {
        lock(&self.sender)
            .as_ref()
            .is_some_and(|sender| !sender.is_closed())
    }

    /// Queues `job` behind everything already posted.
    pub fn post(&self, job: impl FnOnce() + Send + 'static) -> Result<(), RuntimeError> {
        let sender = lock(&self.sender);
        let Some(sender) = sender.as_ref() else {
            return Err(RuntimeError::WorkerClosed(self.name.clone()));
        };
        sender
            .send(Box::new(job))
            .map_err(|_| RuntimeError::WorkerClosed(self.name.clone()))
    }

    /// Queues `job` and blocks until it has run, returning its result.
    ///
    /// Called from the worker itself the job runs inline, since waiting on our own queue
    /// would never finish. Must not be called from inside an async runtime.
    pub fn post_and_wait<R: Send + 'static>(
        &self,
        job: impl FnOnce() -> R + Send + 'static,
    ) -> Result<R, RuntimeError> {
        if self.is_current() {
            return Ok(job());
        }
        let (tx, rx) = oneshot::channel();
        self.post(move || {
            let _ = tx.send(job());
        })?;
        rx.blocking_recv()
            .map_err(|_| RuntimeError::WorkerClosed(self.name.clone()))
    }

    /// Blocks until every job posted so far has run.
    pub fn flush(&self) -> Result<(), RuntimeError> {
        self.post_and_wait(|| ())
    }

    /// Stops accepting jobs. Jobs already queued still run, then the thread exits.
    pub fn shutdown(&self) {
        if lock(&self.sender).take().is_some() {
            debug!("Worker {} shutting down", self.name);
        }
    }

    /// Shuts the worker down and waits for its thread to exit.
    ///
    /// Joining from the worker's own thread is skipped.
    pub fn join(&self) {
        self.shutdown();
        if self.is_current() {
            warn!("Worker {} asked to join itself; skipping", self.name);
            return;
        }
        if let Some(handle) = lock(&self.handle).take() {
            if handle.join().is_err() {
                error!("Worker {} terminated abnormally", self.name);
            }
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.shutdown();
    }
}
