// src/pool.rs
//! Bounded FIFO work queue drained by a fixed set of worker threads.
//!
//! Producers never block: [`ThreadPool::append`] either enqueues under the
//! queue lock and posts the semaphore once, or hands the task back. Workers
//! sleep on the semaphore so each accepted task wakes exactly one of them.

use std::collections::VecDeque;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{debug, error, info, warn};

use crate::error::{EtudeError, EtudeResult};
use crate::sync::{Locker, Semaphore};

pub const DEFAULT_WORKERS: usize = 8;
pub const DEFAULT_MAX_REQUESTS: usize = 10_000;

/// A unit of work executed on a worker thread, outside the queue lock.
pub trait Task: Send + 'static {
    fn process(self);
}

/// Returned by [`ThreadPool::append`] when the task was not accepted.
pub struct Rejected<T> {
    pub task: T,
    pub reason: RejectReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// The queue already holds `max_requests` tasks.
    Full,
    /// The pool is shutting down.
    Stopped,
}

impl<T> fmt::Debug for Rejected<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rejected").field("reason", &self.reason).finish()
    }
}

impl<T> Rejected<T> {
    pub fn into_task(self) -> T {
        self.task
    }
}

struct Queue<T> {
    tasks: VecDeque<T>,
    stopping: bool,
}

struct Shared<T> {
    queue: Locker<Queue<T>>,
    queue_stat: Semaphore,
    max_requests: usize,
}

pub struct ThreadPool<T: Task> {
    shared: Arc<Shared<T>>,
    workers: Vec<JoinHandle<()>>,
}

impl<T: Task> ThreadPool<T> {
    /// Starts `workers` threads sharing a queue bounded to `max_requests`.
    pub fn new(workers: usize, max_requests: usize) -> EtudeResult<Self> {
        Self::spawn(workers, max_requests, false)
    }

    /// Like [`ThreadPool::new`], pinning workers round-robin to CPU cores.
    pub fn new_pinned(workers: usize, max_requests: usize) -> EtudeResult<Self> {
        Self::spawn(workers, max_requests, true)
    }

    fn spawn(workers: usize, max_requests: usize, pin: bool) -> EtudeResult<Self> {
        if workers == 0 {
            return Err(EtudeError::config("worker count must be positive"));
        }
        if max_requests == 0 {
            return Err(EtudeError::config("max_requests must be positive"));
        }

        let shared = Arc::new(Shared {
            queue: Locker::new(Queue {
                tasks: VecDeque::with_capacity(max_requests.min(1024)),
                stopping: false,
            }),
            queue_stat: Semaphore::new(0),
            max_requests,
        });

        let core_ids = if pin {
            core_affinity::get_core_ids().unwrap_or_default()
        } else {
            Vec::new()
        };

        let mut pool = ThreadPool {
            shared,
            workers: Vec::with_capacity(workers),
        };

        for i in 0..workers {
            let core_id = if core_ids.is_empty() {
                None
            } else {
                Some(core_ids[i % core_ids.len()])
            };
            let shared = pool.shared.clone();

            let spawned = thread::Builder::new()
                .name(format!("etude-worker-{}", i))
                .spawn(move || {
                    if let Some(id) = core_id {
                        if core_affinity::set_for_current(id) {
                            debug!(worker = i, cpu = id.id, "worker pinned");
                        } else {
                            warn!(worker = i, cpu = id.id, "failed to pin worker");
                        }
                    }
                    run(i, &shared);
                });

            match spawned {
                Ok(handle) => pool.workers.push(handle),
                Err(e) => {
                    error!(worker = i, error = %e, "failed to start worker thread");
                    pool.shutdown();
                    return Err(e.into());
                }
            }
        }

        info!(workers, max_requests, "thread pool started");
        Ok(pool)
    }

    /// Enqueues a task without blocking. Hands the task back when the queue
    /// is full or the pool is stopping.
    pub fn append(&self, task: T) -> Result<(), Rejected<T>> {
        {
            let mut queue = self.shared.queue.lock();
            if queue.stopping {
                return Err(Rejected {
                    task,
                    reason: RejectReason::Stopped,
                });
            }
            if queue.tasks.len() >= self.shared.max_requests {
                return Err(Rejected {
                    task,
                    reason: RejectReason::Full,
                });
            }
            queue.tasks.push_back(task);
        }
        self.shared.queue_stat.post();
        Ok(())
    }

    /// Number of tasks waiting for a worker.
    pub fn len(&self) -> usize {
        self.shared.queue.lock().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn max_requests(&self) -> usize {
        self.shared.max_requests
    }

    /// Number of worker threads still attached to the pool.
    pub fn workers(&self) -> usize {
        self.workers.len()
    }

    /// Stops accepting work, lets workers drain what was already accepted and
    /// joins every one of them. Safe to call more than once.
    pub fn shutdown(&mut self) {
        if self.workers.is_empty() {
            return;
        }

        self.shared.queue.lock().stopping = true;
        for _ in 0..self.workers.len() {
            self.shared.queue_stat.post();
        }

        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                error!("worker thread panicked during shutdown");
            }
        }
        info!("thread pool stopped");
    }
}

impl<T: Task> Drop for ThreadPool<T> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run<T: Task>(id: usize, shared: &Shared<T>) {
    debug!(worker = id, "worker entering main loop");
    loop {
        shared.queue_stat.wait();

        let task = {
            let mut queue = shared.queue.lock();
            match queue.tasks.pop_front() {
                Some(task) => task,
                None if queue.stopping => break,
                None => continue,
            }
        };

        if panic::catch_unwind(AssertUnwindSafe(|| task.process())).is_err() {
            error!(worker = id, "task panicked");
        }
    }
    debug!(worker = id, "worker exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::time::Duration;

    struct Record {
        id: usize,
        seen: Arc<Mutex<Vec<usize>>>,
    }

    impl Task for Record {
        fn process(self) {
            self.seen.lock().unwrap().push(self.id);
        }
    }

    /// Blocks its worker until the gate opens, so the queue can be filled.
    struct Gate {
        open: Arc<AtomicBool>,
        started: mpsc::Sender<()>,
    }

    impl Task for Gate {
        fn process(self) {
            let _ = self.started.send(());
            while !self.open.load(Ordering::Acquire) {
                thread::sleep(Duration::from_millis(1));
            }
        }
    }

    enum Job {
        Gate(Gate),
        Count(Arc<AtomicUsize>),
    }

    impl Task for Job {
        fn process(self) {
            match self {
                Job::Gate(g) => g.process(),
                Job::Count(c) => {
                    c.fetch_add(1, Ordering::SeqCst);
                }
            }
        }
    }

    #[test]
    fn rejects_invalid_sizes() {
        assert!(matches!(
            ThreadPool::<Record>::new(0, 10),
            Err(EtudeError::Config(_))
        ));
        assert!(matches!(
            ThreadPool::<Record>::new(2, 0),
            Err(EtudeError::Config(_))
        ));
    }

    #[test]
    fn every_accepted_task_runs_exactly_once() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut pool = ThreadPool::new(4, 10_000).unwrap();

        for id in 0..2000 {
            pool.append(Record {
                id,
                seen: seen.clone(),
            })
            .unwrap();
        }
        pool.shutdown();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2000);
        let unique: HashSet<_> = seen.iter().copied().collect();
        assert_eq!(unique.len(), 2000);
    }

    #[test]
    fn single_worker_preserves_fifo_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut pool = ThreadPool::new(1, 100).unwrap();
        for id in 0..50 {
            pool.append(Record {
                id,
                seen: seen.clone(),
            })
            .unwrap();
        }
        pool.shutdown();
        assert_eq!(*seen.lock().unwrap(), (0..50).collect::<Vec<_>>());
    }

    #[test]
    fn append_rejects_when_full_without_blocking() {
        let open = Arc::new(AtomicBool::new(false));
        let counter = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = mpsc::channel();
        let mut pool = ThreadPool::new(1, 3).unwrap();

        // Occupy the only worker so queued tasks stay queued.
        pool.append(Job::Gate(Gate {
            open: open.clone(),
            started: tx,
        }))
        .unwrap();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();

        for _ in 0..3 {
            pool.append(Job::Count(counter.clone())).unwrap();
        }
        assert_eq!(pool.len(), 3);

        let rejected = pool.append(Job::Count(counter.clone())).unwrap_err();
        assert_eq!(rejected.reason, RejectReason::Full);

        open.store(true, Ordering::Release);
        pool.shutdown();
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn shutdown_joins_workers_and_refuses_new_work() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut pool = ThreadPool::new(3, 16).unwrap();
        assert_eq!(pool.workers(), 3);

        pool.shutdown();
        assert_eq!(pool.workers(), 0);

        let rejected = pool
            .append(Record {
                id: 1,
                seen: seen.clone(),
            })
            .unwrap_err();
        assert_eq!(rejected.reason, RejectReason::Stopped);
        assert_eq!(rejected.into_task().id, 1);

        // Second shutdown is a no-op.
        pool.shutdown();
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn drop_drains_pending_tasks() {
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let pool = ThreadPool::new(2, 64).unwrap();
            for _ in 0..64 {
                pool.append(Job::Count(counter.clone())).unwrap();
            }
        }
        assert_eq!(counter.load(Ordering::SeqCst), 64);
    }

    #[test]
    fn panicking_task_does_not_kill_worker() {
        struct Boom;
        impl Task for Boom {
            fn process(self) {
                panic!("boom");
            }
        }

        enum Mixed {
            Boom(Boom),
            Count(Arc<AtomicUsize>),
        }
        impl Task for Mixed {
            fn process(self) {
                match self {
                    Mixed::Boom(b) => b.process(),
                    Mixed::Count(c) => {
                        c.fetch_add(1, Ordering::SeqCst);
                    }
                }
            }
        }

        let counter = Arc::new(AtomicUsize::new(0));
        let mut pool = ThreadPool::new(1, 8).unwrap();
        pool.append(Mixed::Boom(Boom)).unwrap();
        pool.append(Mixed::Count(counter.clone())).unwrap();
        pool.shutdown();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
