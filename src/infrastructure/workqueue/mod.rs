// WorkQueue - closeable blocking FIFO, and the worker thread pool that
// drains one of them.

use crate::types::{CacheError, CacheResult};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::thread;

struct WorkQueueState<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// A FIFO queue of asynchronous work with blocking dequeue.
///
/// Closing the queue is the sole cancellation primitive: enqueued items are
/// still drained, but once the queue is both closed and empty every blocked
/// or subsequent `dequeue` fails with `CacheError::Canceled`.
pub struct WorkQueue<T> {
    state: Mutex<WorkQueueState<T>>,
    cond: Condvar,
}

impl<T> WorkQueue<T> {
    /// Creates an empty, open queue
    pub fn new() -> Self {
        WorkQueue {
            state: Mutex::new(WorkQueueState {
                items: VecDeque::new(),
                closed: false,
            }),
            cond: Condvar::new(),
        }
    }

    /// Appends an item and wakes one waiting consumer.
    ///
    /// Fails with `Canceled` if the queue has been closed.
    pub fn enqueue(&self, item: T) -> CacheResult<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(CacheError::Canceled);
        }
        state.items.push_back(item);
        self.cond.notify_one();
        Ok(())
    }

    /// Removes the oldest item, blocking while the queue is empty.
    ///
    /// Fails with `Canceled` once the queue is closed and drained.
    pub fn dequeue(&self) -> CacheResult<T> {
        let mut state = self.state.lock();
        loop {
            if let Some(item) = state.items.pop_front() {
                return Ok(item);
            }
            if state.closed {
                return Err(CacheError::Canceled);
            }
            self.cond.wait(&mut state);
        }
    }

    /// Marks the queue closed and wakes every blocked consumer
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        self.cond.notify_all();
    }

    /// Returns the number of queued items
    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    /// Returns true if no items are queued
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for WorkQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// A queued job: a boxed closure run once on a worker thread
pub type Job = Box<dyn FnOnce() + Send>;

/// Fixed set of worker threads draining one job queue.
///
/// Workers loop dequeue-and-run until the queue is closed; in-flight jobs
/// run to completion.
pub struct ThreadPool {
    queue: Arc<WorkQueue<Job>>,
    handles: Vec<thread::JoinHandle<()>>,
}

impl ThreadPool {
    /// Starts `n_threads` workers draining `queue`
    pub fn new(n_threads: usize, queue: Arc<WorkQueue<Job>>) -> Self {
        let mut handles = Vec::with_capacity(n_threads);
        for i in 0..n_threads {
            let queue = Arc::clone(&queue);
            let handle = thread::Builder::new()
                .name(format!("cachestore-worker-{}", i))
                .spawn(move || {
                    while let Ok(job) = queue.dequeue() {
                        job();
                    }
                })
                .expect("failed to spawn worker thread");
            handles.push(handle);
        }
        ThreadPool { queue, handles }
    }

    /// Default worker count: `workers_per_core` per logical CPU
    pub fn default_threads(workers_per_core: usize) -> usize {
        let cores = thread::available_parallelism().map_or(1, |n| n.get());
        workers_per_core.max(1) * cores
    }

    /// Returns the number of worker threads
    pub fn n_threads(&self) -> usize {
        self.handles.len()
    }

    /// Closes the queue, waking every blocked worker, and joins all of them
    pub fn shutdown(&mut self) {
        self.queue.close();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    include!("tests.rs");
}
