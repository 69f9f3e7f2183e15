//! offload.rs
//! Background worker pool for CPU-side work (file decoding).
//!
//! Architecture:
//! - Fixed set of named OS threads, spawned up front.
//! - Priority queue: higher [`Priority`] runs first, FIFO within a priority.
//! - Idle tracking: [`WorkerPool::wait_idle`] blocks until nothing is queued or running.
//! - Shutdown stops intake, lets workers drain the queue, then joins them.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fmt;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};

// ============================================================================
// PRIORITY
// ============================================================================

/// Scheduling priority. Higher values are dequeued first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Priority(pub i32);

impl Priority {
    /// Background / loading screen.
    pub const LOW: Priority = Priority(-10);
    pub const NORMAL: Priority = Priority(0);
    /// Needed within the next few frames.
    pub const HIGH: Priority = Priority(10);
    /// Visible right now.
    pub const CRITICAL: Priority = Priority(100);
}

impl From<i32> for Priority {
    fn from(value: i32) -> Self {
        Priority(value)
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// QUEUE
// ============================================================================

type Job = Box<dyn FnOnce() + Send + 'static>;

struct QueuedTask {
    priority: Priority,
    seq: u64,
    job: Job,
}

impl Ord for QueuedTask {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: higher priority first, then lower sequence number first.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for QueuedTask {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for QueuedTask {}

#[derive(Default)]
struct PoolQueue {
    heap: BinaryHeap<QueuedTask>,
    in_flight: usize,
    next_seq: u64,
    shutting_down: bool,
}

impl PoolQueue {
    fn is_idle(&self) -> bool {
        self.heap.is_empty() && self.in_flight == 0
    }
}

#[derive(Default)]
struct PoolShared {
    queue: Mutex<PoolQueue>,
    work_ready: Condvar,
    idle: Condvar,
}

// ============================================================================
// WORKER POOL
// ============================================================================

pub struct WorkerPool {
    shared: Arc<PoolShared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    thread_count: usize,
}

impl WorkerPool {
    /// Spawns `threads` workers (at least one) named `"{name}-{i}"`.
    pub fn new(threads: usize, name: &str) -> io::Result<Self> {
        let pool = Self {
            shared: Arc::new(PoolShared::default()),
            threads: Mutex::new(Vec::new()),
            thread_count: threads.max(1),
        };

        for i in 0..pool.thread_count {
            let shared = Arc::clone(&pool.shared);
            let spawned = thread::Builder::new()
                .name(format!("{name}-{i}"))
                .spawn(move || worker_loop(&shared));
            match spawned {
                Ok(handle) => pool.threads.lock().push(handle),
                Err(err) => {
                    log::error!("Failed to spawn worker {name}-{i}: {err}");
                    pool.shutdown();
                    return Err(err);
                }
            }
        }

        log::debug!("Worker pool '{name}' started with {} threads", pool.thread_count);
        Ok(pool)
    }

    /// Queues `job`. Returns false once shutdown has begun; the job is dropped.
    pub fn submit<F>(&self, priority: Priority, job: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut queue = self.shared.queue.lock();
            if queue.shutting_down {
                return false;
            }
            let seq = queue.next_seq;
            queue.next_seq += 1;
            queue.heap.push(QueuedTask {
                priority,
                seq,
                job: Box::new(job),
            });
        }
        self.shared.work_ready.notify_one();
        true
    }

    /// Blocks until no job is queued or running. Must not be called from a job.
    pub fn wait_idle(&self) {
        let mut queue = self.shared.queue.lock();
        while !queue.is_idle() {
            self.shared.idle.wait(&mut queue);
        }
    }

    pub fn queued_len(&self) -> usize {
        self.shared.queue.lock().heap.len()
    }

    pub fn in_flight(&self) -> usize {
        self.shared.queue.lock().in_flight
    }

    pub fn thread_count(&self) -> usize {
        self.thread_count
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shared.queue.lock().shutting_down
    }

    /// Stops intake, runs everything already queued, joins the workers.
    /// Idempotent.
    pub fn shutdown(&self) {
        self.shared.queue.lock().shutting_down = true;
        self.shared.work_ready.notify_all();

        let threads: Vec<_> = self.threads.lock().drain(..).collect();
        for handle in threads {
            if handle.join().is_err() {
                log::error!("Worker thread exited with a panic");
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(shared: &PoolShared) {
    loop {
        let task = {
            let mut queue = shared.queue.lock();
            loop {
                if let Some(task) = queue.heap.pop() {
                    queue.in_flight += 1;
                    break task;
                }
                if queue.shutting_down {
                    return;
                }
                shared.work_ready.wait(&mut queue);
            }
        };

        if panic::catch_unwind(AssertUnwindSafe(task.job)).is_err() {
            log::error!("Offloaded job panicked (priority {})", task.priority);
        }

        let mut queue = shared.queue.lock();
        queue.in_flight -= 1;
        if queue.is_idle() {
            shared.idle.notify_all();
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
