//! Fixed-size worker pool with admission-controlled scheduling.
//!
//! A manager thread repeatedly pairs the head of an idle-worker queue with
//! the head of a pending-task queue and hands the task over by direct
//! assignment plus a wake signal. A worker therefore holds at most one task
//! at a time and re-enters the idle queue only after finishing it.
//!
//! Tasks declare how many pool threads they permanently reserve. The
//! event-loop task reserves one for the lifetime of the process; hash tasks
//! are opportunistic and reserve none. Reservations are a one-way ledger:
//! capacity is never returned when a reserving task finishes.

use crate::sync::BlockingQueue;
use std::io;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use tracing::{debug, error};

/// A unit of schedulable work.
pub trait Task: Send {
    /// Number of pool threads this task permanently reserves.
    /// Zero means opportunistic: run on whatever capacity remains.
    fn threads_needed(&self) -> usize {
        0
    }

    /// Execute the task to completion on a pool worker.
    fn run(self: Box<Self>);
}

/// A submitted task tagged with a queue identity.
///
/// The pending-task queue rejects duplicates by equality; tagging each
/// submission with a fresh id makes every submission distinct.
struct QueuedTask {
    id: u64,
    task: Box<dyn Task>,
}

impl PartialEq for QueuedTask {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

/// Hand-off slot for one worker thread.
///
/// The manager deposits a task under the mutex and signals the condvar; the
/// worker wakes, takes the task, and runs it. Identity (`id`) backs the
/// idle queue's uniqueness check so one worker can never be queued twice.
struct WorkerSlot {
    id: usize,
    job: Mutex<Option<QueuedTask>>,
    signal: Condvar,
}

impl WorkerSlot {
    fn new(id: usize) -> Self {
        Self {
            id,
            job: Mutex::new(None),
            signal: Condvar::new(),
        }
    }

    /// Called by the manager to give this worker a task.
    fn assign(&self, task: QueuedTask) {
        let mut job = self.job.lock().unwrap();
        *job = Some(task);
        self.signal.notify_one();
    }

    /// Called by the worker; blocks until the manager assigns a task.
    fn wait_for_work(&self) -> QueuedTask {
        let mut job = self.job.lock().unwrap();
        loop {
            match job.take() {
                Some(task) => return task,
                None => job = self.signal.wait(job).unwrap(),
            }
        }
    }
}

impl PartialEq for WorkerSlot {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

struct PoolInner {
    pool_size: usize,
    tasks: BlockingQueue<QueuedTask>,
    idle: BlockingQueue<Arc<WorkerSlot>>,
    admission: Mutex<Admission>,
}

struct Admission {
    /// Pool capacity not yet claimed by reserving tasks. Only ever shrinks.
    unreserved: usize,
    next_task_id: u64,
}

/// A fixed-size pool of worker threads plus the manager that feeds them.
///
/// Clones share the same pool; the event-loop task holds one so it can
/// submit hash tasks from inside the pool.
#[derive(Clone)]
pub struct ThreadPool {
    inner: Arc<PoolInner>,
}

impl ThreadPool {
    pub fn new(pool_size: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                pool_size,
                tasks: BlockingQueue::new(),
                idle: BlockingQueue::new(),
                admission: Mutex::new(Admission {
                    unreserved: pool_size,
                    next_task_id: 0,
                }),
            }),
        }
    }

    /// Submit a batch of tasks for execution.
    ///
    /// Admission control runs over the whole batch first: if any task's
    /// thread requirement exceeds the capacity left after the tasks before
    /// it, the entire batch is rejected and nothing is enqueued. On success
    /// every requirement is subtracted from unreserved capacity permanently.
    ///
    /// Rejection is non-fatal: it is logged and reported through the return
    /// value, and the pool keeps running its existing work.
    pub fn submit(&self, batch: Vec<Box<dyn Task>>) -> bool {
        let mut admission = self.inner.admission.lock().unwrap();

        let mut remaining = admission.unreserved;
        for task in &batch {
            let needed = task.threads_needed();
            if needed > remaining {
                error!(
                    needed,
                    unreserved = remaining,
                    "Not enough unreserved threads for the requested task"
                );
                return false;
            }
            remaining -= needed;
        }

        admission.unreserved = remaining;
        for task in batch {
            let id = admission.next_task_id;
            admission.next_task_id += 1;
            self.inner.tasks.add(QueuedTask { id, task });
        }
        true
    }

    /// Spawn all worker threads and the manager thread.
    ///
    /// Every worker registers itself in the idle queue before it starts
    /// waiting; the manager then pairs idle workers with queued tasks until
    /// process exit.
    pub fn start(&self) -> io::Result<()> {
        for worker_id in 0..self.inner.pool_size {
            let slot = Arc::new(WorkerSlot::new(worker_id));
            self.inner.idle.add(Arc::clone(&slot));

            let inner = Arc::clone(&self.inner);
            thread::Builder::new()
                .name(format!("worker-{worker_id}"))
                .spawn(move || worker_loop(slot, inner))?;
        }

        let inner = Arc::clone(&self.inner);
        thread::Builder::new()
            .name("pool-manager".to_string())
            .spawn(move || manager_loop(inner))?;

        debug!(pool_size = self.inner.pool_size, "Thread pool started");
        Ok(())
    }

    /// Pool capacity not yet claimed by reserving tasks.
    pub fn unreserved_threads(&self) -> usize {
        self.inner.admission.lock().unwrap().unreserved
    }

    #[cfg(test)]
    fn queued_tasks(&self) -> usize {
        self.inner.tasks.len()
    }
}

/// Pair idle workers with pending tasks, blocking when either queue is empty.
fn manager_loop(inner: Arc<PoolInner>) {
    loop {
        let worker = inner.idle.take();
        let task = inner.tasks.take();
        worker.assign(task);
    }
}

/// Wait for assignments and run them to completion, one at a time.
///
/// If a task panics the unwind tears this thread down and it never re-enters
/// the idle queue; the pool shrinks by one. That best-effort behavior is
/// deliberate (the manager hands work only to workers that queued themselves,
/// so a dead worker is simply never scheduled again).
fn worker_loop(slot: Arc<WorkerSlot>, inner: Arc<PoolInner>) {
    loop {
        let queued = slot.wait_for_work();
        debug!(worker = slot.id, task = queued.id, "Running task");
        queued.task.run();
        inner.idle.add(Arc::clone(&slot));
    }
}
