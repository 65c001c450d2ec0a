//! Bounded worker pool and operation handles.

use crate::error::{Result, StoreError};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::thread::{self, JoinHandle};
use std::time::Duration;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Fixed set of named worker threads fed from a bounded queue.
///
/// Submitting to a full queue blocks the submitter. Dropping the pool runs
/// whatever is already queued, then joins the workers.
pub struct WorkerPool {
    sender: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(max_workers: usize, queue_capacity: usize) -> Result<Self> {
        let (sender, receiver) = bounded::<Job>(queue_capacity);

        let mut workers = Vec::with_capacity(max_workers);
        for n in 0..max_workers {
            let receiver = receiver.clone();
            let worker = thread::Builder::new()
                .name(format!("flatshard-worker-{}", n))
                .spawn(move || {
                    while let Ok(job) = receiver.recv() {
                        job();
                    }
                })?;
            workers.push(worker);
        }

        tracing::debug!(max_workers, queue_capacity, "worker pool started");
        Ok(Self {
            sender: Some(sender),
            workers,
        })
    }

    /// Number of worker threads.
    pub fn width(&self) -> usize {
        self.workers.len()
    }

    /// Queue `task` and return a handle to its result.
    pub fn submit<T, F>(&self, task: F) -> Result<OpHandle<T>>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let sender = self.sender.as_ref().ok_or(StoreError::PoolShutdown)?;
        let (tx, rx) = bounded(1);

        let job: Job = Box::new(move || {
            let outcome = catch_unwind(AssertUnwindSafe(task))
                .unwrap_or_else(|payload| Err(StoreError::WorkerPanic(panic_message(&*payload))));
            // The caller may have dropped its handle.
            let _ = tx.send(outcome);
        });

        sender.send(job).map_err(|_| StoreError::PoolShutdown)?;
        Ok(OpHandle { receiver: rx })
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.sender.take();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                tracing::error!("worker thread exited abnormally");
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "worker panicked".to_string()
    }
}

/// Handle to a submitted operation.
///
/// The result can be taken once, by waiting or polling.
#[must_use = "an operation's result is only observed through its handle"]
pub struct OpHandle<T> {
    receiver: Receiver<Result<T>>,
}

impl<T> OpHandle<T> {
    /// Block until the operation finishes.
    pub fn wait(self) -> Result<T> {
        self.receiver
            .recv()
            .unwrap_or(Err(StoreError::PoolShutdown))
    }

    /// Block for at most `timeout`. `None` if the operation is still running.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<T>> {
        match self.receiver.recv_timeout(timeout) {
            Ok(outcome) => Some(outcome),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(Err(StoreError::PoolShutdown)),
        }
    }

    /// Non-blocking poll.
    pub fn try_take(&self) -> Option<Result<T>> {
        match self.receiver.try_recv() {
            Ok(outcome) => Some(outcome),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(StoreError::PoolShutdown)),
        }
    }

    /// Whether a result is waiting to be taken.
    pub fn is_ready(&self) -> bool {
        !self.receiver.is_empty()
    }
}
