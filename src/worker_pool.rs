//! Priority worker pool.
//!
//! A bounded set of workers draining a max-heap keyed on integer priority,
//! with `submit`/`submit_priority` returning a future-backed handle. A plain
//! binary heap does not preserve submission order among equal-priority
//! tasks, and ties among same-priority work need to stay FIFO, so this
//! rendition breaks ties on a monotonically increasing sequence number.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{oneshot, Notify};

use crate::errors::RiskError;

type BoxedJob = Box<dyn FnOnce() -> Result<(), RiskError> + Send + 'static>;

struct QueuedTask {
    priority: i32,
    sequence: u64,
    job: BoxedJob,
}

impl PartialEq for QueuedTask {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.sequence == other.sequence
    }
}
impl Eq for QueuedTask {}

impl Ord for QueuedTask {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Higher priority first; among equal priorities, earlier sequence
        // (lower number) first -- a max-heap naturally orders descending,
        // so sequence comparison is reversed to keep FIFO semantics.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}
impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

/// Handle returned by `submit`/`submit_priority`; resolves to the task's
/// result once a worker has run it.
pub struct TaskHandle<T> {
    rx: oneshot::Receiver<Result<T, RiskError>>,
}

impl<T> TaskHandle<T> {
    pub async fn wait(self) -> Result<T, RiskError> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(RiskError::invariant("task dropped before completion")),
        }
    }
}

struct Shared {
    heap: Mutex<BinaryHeap<QueuedTask>>,
    notify: Notify,
    shutting_down: AtomicBool,
    sequence: AtomicU64,
    active: AtomicU64,
    idle_notify: Notify,
}

impl Shared {
    fn is_drained(&self) -> bool {
        self.heap.lock().is_empty() && self.active.load(Ordering::SeqCst) == 0
    }
}

/// Bounded priority worker pool. Workers run until shutdown is signaled and
/// the heap is drained; shutdown never cancels in-flight tasks.
pub struct PriorityPool {
    shared: Arc<Shared>,
    workers: Vec<tokio::task::JoinHandle<()>>,
}

impl PriorityPool {
    pub fn new(num_workers: usize) -> Self {
        let shared = Arc::new(Shared {
            heap: Mutex::new(BinaryHeap::new()),
            notify: Notify::new(),
            shutting_down: AtomicBool::new(false),
            sequence: AtomicU64::new(0),
            active: AtomicU64::new(0),
            idle_notify: Notify::new(),
        });

        let workers = (0..num_workers.max(1))
            .map(|_| {
                let shared = shared.clone();
                tokio::spawn(Self::worker_loop(shared))
            })
            .collect();

        Self { shared, workers }
    }

    async fn worker_loop(shared: Arc<Shared>) {
        loop {
            let task = {
                let mut heap = shared.heap.lock();
                heap.pop()
            };
            let Some(task) = task else {
                if shared.shutting_down.load(Ordering::SeqCst) {
                    return;
                }
                shared.notify.notified().await;
                continue;
            };

            shared.active.fetch_add(1, Ordering::SeqCst);
            // A panicking job must not crash the worker; catch_unwind keeps
            // the pool alive and surfaces the failure on the handle instead.
            let job = task.job;
            let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(job))
                .unwrap_or_else(|_| Err(RiskError::invariant("task panicked")));
            let _ = outcome;
            shared.active.fetch_sub(1, Ordering::SeqCst);

            if shared.is_drained() {
                shared.idle_notify.notify_waiters();
            }
        }
    }

    /// Submits a task at default (zero) priority.
    pub fn submit<F, T>(&self, f: F) -> Result<TaskHandle<T>, RiskError>
    where
        F: FnOnce() -> Result<T, RiskError> + Send + 'static,
        T: Send + 'static,
    {
        self.submit_priority(0, f)
    }

    /// Submits a task with an explicit priority; higher runs first. Rejected
    /// if the pool is shutting down.
    pub fn submit_priority<F, T>(&self, priority: i32, f: F) -> Result<TaskHandle<T>, RiskError>
    where
        F: FnOnce() -> Result<T, RiskError> + Send + 'static,
        T: Send + 'static,
    {
        if self.shared.shutting_down.load(Ordering::SeqCst) {
            return Err(RiskError::validation("pool is shutting down"));
        }

        let (tx, rx) = oneshot::channel();
        let sequence = self.shared.sequence.fetch_add(1, Ordering::SeqCst);
        let job: BoxedJob = Box::new(move || {
            let result = f();
            let _ = tx.send(result);
            Ok(())
        });

        self.shared
            .heap
            .lock()
            .push(QueuedTask { priority, sequence, job });
        self.shared.notify.notify_one();

        Ok(TaskHandle { rx })
    }

    /// Stops accepting new submissions. In-flight and already-queued tasks
    /// continue to run to completion.
    pub fn shutdown(&self) {
        self.shared.shutting_down.store(true, Ordering::SeqCst);
        self.shared.notify.notify_waiters();
    }

    /// Blocks until the heap is empty and no task is executing.
    pub async fn wait_idle(&self) {
        loop {
            if self.shared.is_drained() {
                return;
            }
            self.shared.idle_notify.notified().await;
        }
    }

    pub fn pending_tasks(&self) -> usize {
        self.shared.heap.lock().len()
    }

    pub async fn join(self) {
        for worker in self.workers {
            let _ = worker.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn runs_higher_priority_first() {
        // A pool with no workers yet would race; instead build the pool
        // after queuing isn't possible (workers spawn in `new`), so submit
        // all three tasks back-to-back before yielding -- cooperative
        // scheduling guarantees the worker task hasn't run yet, so the heap
        // holds all three in priority order before the first pop.
        let pool = PriorityPool::new(1);
        let order = Arc::new(Mutex::new(Vec::new()));

        let o1 = order.clone();
        pool.submit_priority(0, move || {
            o1.lock().push("low");
            Ok::<_, RiskError>(())
        })
        .unwrap();
        let o2 = order.clone();
        let h_high = pool
            .submit_priority(10, move || {
                o2.lock().push("high");
                Ok::<_, RiskError>(())
            })
            .unwrap();
        let o3 = order.clone();
        let h_mid = pool
            .submit_priority(5, move || {
                o3.lock().push("mid");
                Ok::<_, RiskError>(())
            })
            .unwrap();

        h_high.wait().await.unwrap();
        h_mid.wait().await.unwrap();
        pool.wait_idle().await;

        let seen = order.lock().clone();
        assert_eq!(seen, vec!["high", "mid", "low"]);
    }

    #[tokio::test]
    async fn equal_priority_is_fifo() {
        let pool = PriorityPool::new(1);
        let counter = Arc::new(AtomicUsize::new(0));
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for i in 0..5 {
            let order = order.clone();
            let counter = counter.clone();
            handles.push(
                pool.submit_priority(1, move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    order.lock().push(i);
                    Ok::<_, RiskError>(())
                })
                .unwrap(),
            );
        }
        for h in handles {
            h.wait().await.unwrap();
        }
        assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn failed_task_does_not_crash_worker() {
        let pool = PriorityPool::new(1);
        let h1 = pool
            .submit(|| Err::<(), _>(RiskError::invariant("boom")))
            .unwrap();
        let h2 = pool.submit(|| Ok::<_, RiskError>(42)).unwrap();

        assert!(h1.wait().await.is_err());
        assert_eq!(h2.wait().await.unwrap(), 42);
    }

    #[tokio::test]
    async fn rejects_submission_after_shutdown() {
        let pool = PriorityPool::new(1);
        pool.shutdown();
        let result = pool.submit(|| Ok::<_, RiskError>(()));
        assert!(result.is_err());
    }
}
