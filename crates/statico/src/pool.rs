//! Worker pool: fixed worker threads over a bounded FIFO queue.
//!
//! The reactor pushes tasks into a lock-free `ArrayQueue`; idle workers
//! park on a condvar and are woken per push. Submission never blocks: a
//! full queue hands the task back to the caller, who decides what a
//! rejection means.
//!
//! No dynamic scaling, no priorities.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread;

use crossbeam_queue::ArrayQueue;
use tracing::{debug, error};

use crate::error::{Error as StaticoError, Result};

/// Rejected submission; carries the task back.
pub struct QueueFull<T>(pub T);

impl<T> fmt::Debug for QueueFull<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("QueueFull(..)")
    }
}

impl<T> fmt::Display for QueueFull<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("worker pool queue is full")
    }
}

impl<T> std::error::Error for QueueFull<T> {}

impl<T> QueueFull<T> {
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> From<QueueFull<T>> for StaticoError {
    fn from(_: QueueFull<T>) -> Self {
        StaticoError::QueueFull
    }
}

/// Shared state between the submitting thread and workers.
struct PoolInner<T> {
    queue: ArrayQueue<T>,
    shutdown: AtomicBool,
    /// Accepted tasks that have not finished executing.
    pending: AtomicUsize,
    /// Parking lot for idle workers.
    park: Mutex<()>,
    available: Condvar,
    /// Signalled when `pending` drops to zero.
    done: Mutex<()>,
    drained: Condvar,
}

impl<T> PoolInner<T> {
    fn wake_one(&self) {
        drop(self.park.lock().unwrap_or_else(PoisonError::into_inner));
        self.available.notify_one();
    }

    fn wake_all(&self) {
        drop(self.park.lock().unwrap_or_else(PoisonError::into_inner));
        self.available.notify_all();
    }

    fn finish(&self, n: usize) {
        if n > 0 && self.pending.fetch_sub(n, Ordering::AcqRel) == n {
            drop(self.done.lock().unwrap_or_else(PoisonError::into_inner));
            self.drained.notify_all();
        }
    }
}

pub struct WorkerPool<T: Send + 'static> {
    inner: Arc<PoolInner<T>>,
    handles: Mutex<Vec<thread::JoinHandle<()>>>,
    workers: usize,
}

impl<T: Send + 'static> WorkerPool<T> {
    /// Spawn `workers` threads running `handler` for every task.
    ///
    /// `max_queue`: max pending tasks before `append_task` fails.
    pub fn start<F>(workers: usize, max_queue: usize, handler: F) -> Result<Self>
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        let workers = workers.max(1);
        let inner = Arc::new(PoolInner {
            queue: ArrayQueue::new(max_queue.max(1)),
            shutdown: AtomicBool::new(false),
            pending: AtomicUsize::new(0),
            park: Mutex::new(()),
            available: Condvar::new(),
            done: Mutex::new(()),
            drained: Condvar::new(),
        });
        let handler = Arc::new(handler);

        let pool = WorkerPool {
            inner: Arc::clone(&inner),
            handles: Mutex::new(Vec::with_capacity(workers)),
            workers,
        };
        for worker_id in 0..workers {
            let inner = Arc::clone(&inner);
            let handler = Arc::clone(&handler);
            let handle = thread::Builder::new()
                .name(format!("statico-worker-{worker_id}"))
                .spawn(move || worker_loop(inner, handler.as_ref()))
                .map_err(|e| StaticoError::io("spawn worker thread", e))?;
            pool.handles
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(handle);
        }
        debug!(workers, max_queue, "worker pool started");
        Ok(pool)
    }

    /// Enqueue without blocking. Fails when the queue is at capacity or the
    /// pool is stopped.
    pub fn append_task(&self, task: T) -> std::result::Result<(), QueueFull<T>> {
        if self.inner.shutdown.load(Ordering::Acquire) {
            return Err(QueueFull(task));
        }
        self.inner.pending.fetch_add(1, Ordering::AcqRel);
        match self.inner.queue.push(task) {
            Ok(()) => {
                self.inner.wake_one();
                Ok(())
            }
            Err(task) => {
                self.inner.finish(1);
                Err(QueueFull(task))
            }
        }
    }

    /// Block until every accepted task has finished executing.
    pub fn wait(&self) {
        let mut guard = self.inner.done.lock().unwrap_or_else(PoisonError::into_inner);
        while self.inner.pending.load(Ordering::Acquire) > 0 {
            guard = self
                .inner
                .drained
                .wait(guard)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Reject further tasks, wake and join every worker, drop queued tasks.
    ///
    /// Workers finish the task they are running. Idempotent.
    pub fn stop(&self) {
        self.inner.shutdown.store(true, Ordering::Release);
        self.inner.wake_all();

        let handles: Vec<_> = self
            .handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        if handles.is_empty() {
            return;
        }
        for handle in handles {
            if handle.join().is_err() {
                error!("worker thread panicked");
            }
        }

        let mut dropped = 0;
        while self.inner.queue.pop().is_some() {
            dropped += 1;
        }
        self.inner.finish(dropped);
        debug!(dropped, "worker pool stopped");
    }

    /// Tasks queued but not yet claimed.
    pub fn queue_len(&self) -> usize {
        self.inner.queue.len()
    }

    pub fn capacity(&self) -> usize {
        self.inner.queue.capacity()
    }

    pub fn workers(&self) -> usize {
        self.workers
    }
}

impl<T: Send + 'static> Drop for WorkerPool<T> {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Worker thread main loop.
fn worker_loop<T, F>(inner: Arc<PoolInner<T>>, handler: &F)
where
    F: Fn(T),
{
    loop {
        if inner.shutdown.load(Ordering::Acquire) {
            break;
        }

        if let Some(task) = inner.queue.pop() {
            if panic::catch_unwind(AssertUnwindSafe(|| handler(task))).is_err() {
                error!("task handler panicked");
            }
            inner.finish(1);
            continue;
        }

        let guard = inner.park.lock().unwrap_or_else(PoisonError::into_inner);
        if inner.shutdown.load(Ordering::Acquire) || !inner.queue.is_empty() {
            continue;
        }
        drop(inner.available.wait(guard).unwrap_or_else(PoisonError::into_inner));
    }
}
