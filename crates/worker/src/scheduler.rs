//! Build job scheduler
//!
//! A bounded FIFO intake queue drained by a fixed pool of executor threads.
//! The pool size is the node's build parallelism; it is the only admission
//! control. Jobs beyond the pool wait in the queue, and jobs beyond the queue
//! capacity are rejected with [`CoordError::QueueFull`].

use idxcoord_core::{CoordError, Result};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::error;

/// Scheduler metrics snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Jobs waiting in the intake queue
    pub queued: usize,
    /// Jobs being executed
    pub active: usize,
    /// Jobs finished since creation, panicked ones included
    pub completed: u64,
    /// Executor threads
    pub parallelism: usize,
}

type Job = Box<dyn FnOnce() + Send>;

struct SchedulerInner {
    queue: Mutex<VecDeque<Job>>,
    work_ready: Condvar,
    idle: Condvar,
    shutdown: AtomicBool,
    queued: AtomicUsize,
    active: AtomicUsize,
    completed: AtomicU64,
    max_queue_len: usize,
}

/// Fixed-parallelism FIFO job scheduler
pub struct JobScheduler {
    inner: Arc<SchedulerInner>,
    executors: Mutex<Vec<JoinHandle<()>>>,
    parallelism: usize,
}

impl JobScheduler {
    /// Spawn `parallelism` executors (`idxcoord-build-{i}`) behind a queue of
    /// at most `max_queue_len` waiting jobs
    pub fn new(parallelism: usize, max_queue_len: usize) -> Result<Self> {
        let inner = Arc::new(SchedulerInner {
            queue: Mutex::new(VecDeque::new()),
            work_ready: Condvar::new(),
            idle: Condvar::new(),
            shutdown: AtomicBool::new(false),
            queued: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            completed: AtomicU64::new(0),
            max_queue_len,
        });

        let mut executors = Vec::with_capacity(parallelism);
        for i in 0..parallelism {
            let inner = Arc::clone(&inner);
            let handle = std::thread::Builder::new()
                .name(format!("idxcoord-build-{}", i))
                .spawn(move || executor_loop(&inner))?;
            executors.push(handle);
        }

        Ok(Self {
            inner,
            executors: Mutex::new(executors),
            parallelism,
        })
    }

    /// Enqueue a job.
    ///
    /// Fails with `QueueFull` when the queue is at capacity, and with
    /// `NotHealthy` after shutdown.
    pub fn submit(&self, job: impl FnOnce() + Send + 'static) -> Result<()> {
        if self.inner.shutdown.load(Ordering::Acquire) {
            return Err(CoordError::NotHealthy("job scheduler".into()));
        }
        {
            let mut queue = self.inner.queue.lock();
            if queue.len() >= self.inner.max_queue_len {
                return Err(CoordError::QueueFull);
            }
            queue.push_back(Box::new(job));
            self.inner.queued.fetch_add(1, Ordering::Release);
        }
        self.inner.work_ready.notify_one();
        Ok(())
    }

    /// Block until the queue is empty and no job is running
    pub fn drain(&self) {
        let mut queue = self.inner.queue.lock();
        while !queue.is_empty() || self.inner.active.load(Ordering::Acquire) > 0 {
            self.inner.idle.wait(&mut queue);
        }
    }

    /// Stop accepting jobs, run what is queued, and join the executors
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::Release);
        {
            let _queue = self.inner.queue.lock();
            self.inner.work_ready.notify_all();
        }
        let mut executors = self.executors.lock();
        for handle in executors.drain(..) {
            let _ = handle.join();
        }
    }

    /// Current counts
    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            queued: self.inner.queued.load(Ordering::Relaxed),
            active: self.inner.active.load(Ordering::Relaxed),
            completed: self.inner.completed.load(Ordering::Relaxed),
            parallelism: self.parallelism,
        }
    }

    /// Configured executor count
    pub fn parallelism(&self) -> usize {
        self.parallelism
    }
}

impl Drop for JobScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Decrements `active` even if the job panics
struct ActiveJobGuard<'a> {
    inner: &'a SchedulerInner,
}

impl Drop for ActiveJobGuard<'_> {
    fn drop(&mut self) {
        let prev = self.inner.active.fetch_sub(1, Ordering::Release);
        self.inner.completed.fetch_add(1, Ordering::Relaxed);
        if prev == 1 {
            let queue = self.inner.queue.lock();
            if queue.is_empty() {
                self.inner.idle.notify_all();
            }
        }
    }
}

fn executor_loop(inner: &SchedulerInner) {
    loop {
        let job = {
            let mut queue = inner.queue.lock();
            loop {
                if let Some(job) = queue.pop_front() {
                    inner.queued.fetch_sub(1, Ordering::Release);
                    inner.active.fetch_add(1, Ordering::Release);
                    break job;
                }
                if inner.shutdown.load(Ordering::Acquire) {
                    return;
                }
                inner.work_ready.wait(&mut queue);
            }
        };

        let _guard = ActiveJobGuard { inner };
        if let Err(e) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(job)) {
            error!(
                target: "idxcoord::worker",
                "build job panicked: {}",
                e.downcast_ref::<&str>().copied().unwrap_or("(non-string panic)")
            );
        }
    }
}
