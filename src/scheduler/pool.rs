//! Priority worker pool.
//!
//! A fixed set of tokio tasks pulls jobs from one shared priority queue.
//! Higher-priority jobs are served first and jobs of equal priority in
//! submission order. The worker count can change at runtime: extra workers
//! are spawned immediately, surplus workers retire once they are idle.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;
use tracing::debug;

use super::job::{Job, JobId, JobPriority};

struct Queued {
    priority: JobPriority,
    sequence: u64,
    job: Job,
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.sequence == other.sequence
    }
}

impl Eq for Queued {}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Queued {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Higher priority first, then lower sequence (older) first
        match self.priority.cmp(&other.priority) {
            CmpOrdering::Equal => other.sequence.cmp(&self.sequence),
            ordering => ordering,
        }
    }
}

#[derive(Default)]
struct JobQueue {
    heap: BinaryHeap<Queued>,
    sequence: u64,
}

struct PoolInner {
    name: &'static str,
    queue: Mutex<JobQueue>,
    notify: Notify,
    target: AtomicUsize,
    live: AtomicUsize,
    closed: AtomicBool,
}

impl PoolInner {
    fn lock_queue(&self) -> MutexGuard<'_, JobQueue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn pop(&self) -> Option<Job> {
        self.lock_queue().heap.pop().map(|queued| queued.job)
    }

    /// Claim one retirement slot if more workers are live than wanted.
    fn try_retire(&self) -> bool {
        let mut live = self.live.load(Ordering::Acquire);
        loop {
            if live <= self.target.load(Ordering::Acquire) {
                return false;
            }
            match self
                .live
                .compare_exchange(live, live - 1, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return true,
                Err(actual) => live = actual,
            }
        }
    }
}

/// Handle to a worker pool. Dropping it does not stop the workers; call
/// [`close`](Self::close).
pub(crate) struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    /// Spawn `workers` tasks on the current tokio runtime.
    pub(crate) fn new(name: &'static str, workers: usize) -> Self {
        let pool = Self {
            inner: Arc::new(PoolInner {
                name,
                queue: Mutex::new(JobQueue::default()),
                notify: Notify::new(),
                target: AtomicUsize::new(0),
                live: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
            }),
        };
        pool.resize(workers);
        pool
    }

    /// Queue a job. Returns `false` (dropping the job) once the pool is closed.
    pub(crate) fn submit(&self, job: Job) -> bool {
        {
            let mut queue = self.inner.lock_queue();
            if self.inner.closed.load(Ordering::Acquire) {
                return false;
            }
            let sequence = queue.sequence;
            queue.sequence += 1;
            queue.heap.push(Queued {
                priority: job.priority(),
                sequence,
                job,
            });
        }
        self.inner.notify.notify_one();
        true
    }

    /// Remove a job that has not started. Returns whether it was still queued.
    pub(crate) fn cancel(&self, id: JobId) -> bool {
        let mut queue = self.inner.lock_queue();
        let before = queue.heap.len();
        queue.heap.retain(|queued| queued.job.id() != id);
        queue.heap.len() != before
    }

    /// Number of jobs waiting for a worker.
    pub(crate) fn queued(&self) -> usize {
        self.inner.lock_queue().heap.len()
    }

    /// Requested number of workers.
    pub(crate) fn workers(&self) -> usize {
        self.inner.target.load(Ordering::Acquire)
    }

    pub(crate) fn resize(&self, workers: usize) {
        if self.is_closed() {
            return;
        }

        self.inner.target.store(workers, Ordering::Release);

        let live = self.inner.live.load(Ordering::Acquire);
        for _ in live..workers {
            self.inner.live.fetch_add(1, Ordering::AcqRel);
            tokio::spawn(run_worker(Arc::clone(&self.inner)));
        }

        // Wake idle workers so surplus ones can retire
        if live > workers {
            self.inner.notify.notify_waiters();
        }

        debug!("{} pool resized to {} worker(s)", self.inner.name, workers);
    }

    /// Stop accepting jobs and drop everything still queued.
    ///
    /// Running jobs finish normally; workers exit once idle.
    pub(crate) fn close(&self) {
        let dropped = {
            let mut queue = self.inner.lock_queue();
            self.inner.closed.store(true, Ordering::Release);
            std::mem::take(&mut queue.heap)
        };
        self.inner.notify.notify_waiters();

        if !dropped.is_empty() {
            debug!(
                "{} pool closed with {} queued job(s) dropped",
                self.inner.name,
                dropped.len()
            );
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

async fn run_worker(inner: Arc<PoolInner>) {
    loop {
        // Register interest before checking state so no wakeup is missed
        let notified = inner.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if inner.closed.load(Ordering::Acquire) {
            inner.live.fetch_sub(1, Ordering::AcqRel);
            break;
        }
        if inner.try_retire() {
            break;
        }

        match inner.pop() {
            Some(job) => job.execute().await,
            None => notified.await,
        }
    }
}
