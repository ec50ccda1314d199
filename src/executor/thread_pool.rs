//! Fixed-size worker pool with a timer thread for delayed tasks.
//!
//! Workers share one FIFO queue so tasks start in submission order. Delayed
//! tasks wait in a deadline heap owned by the timer thread and join the back of
//! the queue when due.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use super::{Executor, ExecutorError, Task};

/// Configuration for the thread pool.
#[derive(Debug, Clone)]
pub struct ThreadPoolConfig {
    /// Number of worker threads (0 = auto-detect).
    pub num_threads: usize,
    /// Thread stack size in bytes (0 = default).
    pub stack_size: usize,
    /// Thread name prefix.
    pub thread_name_prefix: String,
}

impl Default for ThreadPoolConfig {
    fn default() -> Self {
        Self {
            num_threads: 0,
            stack_size: 0,
            thread_name_prefix: "imgpipe-worker".to_string(),
        }
    }
}

impl ThreadPoolConfig {
    /// Few threads for latency-sensitive work such as decoding.
    pub fn decode() -> Self {
        Self {
            num_threads: num_cpus::get().max(1),
            thread_name_prefix: "imgpipe-decode".to_string(),
            ..Self::default()
        }
    }

    /// Small fixed pool for disk and network I/O.
    pub fn io() -> Self {
        Self {
            num_threads: 2,
            thread_name_prefix: "imgpipe-io".to_string(),
            ..Self::default()
        }
    }
}

/// Counters for thread pool activity.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ThreadPoolStats {
    pub tasks_executed: u64,
    pub tasks_panicked: u64,
    pub tasks_delayed: u64,
    pub queued: usize,
    pub threads: usize,
}

struct Delayed {
    due: Instant,
    sequence: u64,
    task: Task,
}

impl PartialEq for Delayed {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.sequence == other.sequence
    }
}

impl Eq for Delayed {}

impl PartialOrd for Delayed {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Delayed {
    // Reversed so the max-heap yields the earliest deadline first.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

struct Shared {
    queue: Mutex<VecDeque<Task>>,
    available: Condvar,
    delayed: Mutex<BinaryHeap<Delayed>>,
    timer: Condvar,
    shutdown: AtomicBool,
    executed: AtomicU64,
    panicked: AtomicU64,
    delayed_total: AtomicU64,
    sequence: AtomicU64,
}

impl Shared {
    fn push(&self, task: Task) {
        self.queue.lock().push_back(task);
        self.available.notify_one();
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}

/// Worker pool implementing [`Executor`].
pub struct ThreadPool {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
    timer: Option<JoinHandle<()>>,
}

impl ThreadPool {
    /// Create a new thread pool with the given configuration.
    pub fn new(config: ThreadPoolConfig) -> Result<Self, ExecutorError> {
        let num_threads = if config.num_threads == 0 {
            num_cpus::get().max(1)
        } else {
            config.num_threads
        };

        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
            delayed: Mutex::new(BinaryHeap::new()),
            timer: Condvar::new(),
            shutdown: AtomicBool::new(false),
            executed: AtomicU64::new(0),
            panicked: AtomicU64::new(0),
            delayed_total: AtomicU64::new(0),
            sequence: AtomicU64::new(0),
        });

        let mut pool = Self {
            shared: shared.clone(),
            workers: Vec::with_capacity(num_threads),
            timer: None,
        };

        for id in 0..num_threads {
            let shared = shared.clone();
            let handle = Self::builder(&config, format!("{}-{}", config.thread_name_prefix, id))
                .spawn(move || Self::worker_loop(&shared))
                .map_err(|e| ExecutorError::ThreadSpawnFailed(e.to_string()))?;
            pool.workers.push(handle);
        }

        let timer_shared = shared;
        let timer = Self::builder(&config, format!("{}-timer", config.thread_name_prefix))
            .spawn(move || Self::timer_loop(&timer_shared))
            .map_err(|e| ExecutorError::ThreadSpawnFailed(e.to_string()))?;
        pool.timer = Some(timer);

        tracing::debug!(threads = num_threads, prefix = %config.thread_name_prefix, "thread pool started");
        Ok(pool)
    }

    fn builder(config: &ThreadPoolConfig, name: String) -> thread::Builder {
        let builder = thread::Builder::new().name(name);
        if config.stack_size > 0 {
            builder.stack_size(config.stack_size)
        } else {
            builder
        }
    }

    fn worker_loop(shared: &Shared) {
        loop {
            let task = {
                let mut queue = shared.queue.lock();
                loop {
                    if let Some(task) = queue.pop_front() {
                        break Some(task);
                    }
                    if shared.shutdown.load(Ordering::SeqCst) {
                        break None;
                    }
                    shared.available.wait(&mut queue);
                }
            };

            match task {
                Some(task) => {
                    // A panicking task must not take its worker down with it.
                    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(task)) {
                        shared.panicked.fetch_add(1, Ordering::Relaxed);
                        let current = thread::current();
                        tracing::error!(
                            thread = current.name().unwrap_or("unnamed"),
                            panic = panic_message(payload.as_ref()),
                            "task panicked"
                        );
                    }
                    shared.executed.fetch_add(1, Ordering::Relaxed);
                }
                None => return,
            }
        }
    }

    fn timer_loop(shared: &Shared) {
        let mut delayed = shared.delayed.lock();
        loop {
            if shared.shutdown.load(Ordering::SeqCst) {
                return;
            }
            let now = Instant::now();
            match delayed.peek().map(|d| d.due) {
                Some(due) if due <= now => {
                    if let Some(entry) = delayed.pop() {
                        shared.push(entry.task);
                    }
                }
                Some(due) => {
                    shared.timer.wait_until(&mut delayed, due);
                }
                None => {
                    shared.timer.wait(&mut delayed);
                }
            }
        }
    }

    pub fn num_threads(&self) -> usize {
        self.workers.len()
    }

    pub fn stats(&self) -> ThreadPoolStats {
        ThreadPoolStats {
            tasks_executed: self.shared.executed.load(Ordering::Relaxed),
            tasks_panicked: self.shared.panicked.load(Ordering::Relaxed),
            tasks_delayed: self.shared.delayed_total.load(Ordering::Relaxed),
            queued: self.shared.queue.lock().len(),
            threads: self.workers.len(),
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.shutdown.load(Ordering::SeqCst)
    }

    /// Stop accepting work. Queued tasks still run; pending delayed tasks are dropped.
    pub fn signal_shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        {
            let _queue = self.shared.queue.lock();
            self.shared.available.notify_all();
        }
        {
            let _delayed = self.shared.delayed.lock();
            self.shared.timer.notify_all();
        }
    }
}

impl Executor for ThreadPool {
    fn execute(&self, task: Task) {
        if self.is_shutdown() {
            tracing::warn!("task submitted to a stopped thread pool was dropped");
            return;
        }
        self.shared.push(task);
    }

    fn schedule_after(&self, task: Task, delay: Duration) {
        if delay.is_zero() {
            self.execute(task);
            return;
        }
        if self.is_shutdown() {
            tracing::warn!("delayed task submitted to a stopped thread pool was dropped");
            return;
        }
        let entry = Delayed {
            due: Instant::now() + delay,
            sequence: self.shared.sequence.fetch_add(1, Ordering::Relaxed),
            task,
        };
        self.shared.delayed.lock().push(entry);
        self.shared.delayed_total.fetch_add(1, Ordering::Relaxed);
        self.shared.timer.notify_one();
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.signal_shutdown();

        // The last handle may be dropped by one of our own tasks.
        let current = thread::current().id();
        for handle in self.workers.drain(..).chain(self.timer.take()) {
            if handle.thread().id() != current {
                let _ = handle.join();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;

    fn single_thread() -> ThreadPool {
        ThreadPool::new(ThreadPoolConfig {
            num_threads: 1,
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_thread_pool_basic() {
        let pool = ThreadPool::new(ThreadPoolConfig::default()).unwrap();
        assert!(pool.num_threads() > 0);

        let (tx, rx) = mpsc::channel();
        pool.execute(Box::new(move || {
            tx.send(42).unwrap();
        }));
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 42);
    }

    #[test]
    fn test_worker_survives_panicking_task() {
        let pool = single_thread();
        let (tx, rx) = mpsc::channel();
        pool.execute(Box::new(|| panic!("decode blew up")));
        pool.execute(Box::new(move || {
            tx.send("still running").unwrap();
        }));

        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "still running");
        let stats = pool.stats();
        assert_eq!(stats.tasks_panicked, 1);
        assert_eq!(stats.threads, 1);
    }

    #[test]
    fn test_single_worker_preserves_fifo() {
        let pool = single_thread();
        let (tx, rx) = mpsc::channel();
        for i in 0..20 {
            let tx = tx.clone();
            pool.execute(Box::new(move || {
                tx.send(i).unwrap();
            }));
        }
        let order: Vec<i32> = (0..20)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        assert_eq!(order, (0..20).collect::<Vec<_>>());
    }

    #[test]
    fn test_delayed_task_waits() {
        let pool = single_thread();
        let (tx, rx) = mpsc::channel();
        let start = Instant::now();
        pool.schedule_after(
            Box::new(move || {
                tx.send(Instant::now()).unwrap();
            }),
            Duration::from_millis(50),
        );
        let ran_at = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(ran_at - start >= Duration::from_millis(50));
        assert_eq!(pool.stats().tasks_delayed, 1);
    }

    #[test]
    fn test_delayed_tasks_run_in_deadline_order() {
        let pool = single_thread();
        let (tx, rx) = mpsc::channel();
        for (label, delay) in [("late", 80u64), ("early", 20)] {
            let tx = tx.clone();
            pool.schedule_after(
                Box::new(move || {
                    tx.send(label).unwrap();
                }),
                Duration::from_millis(delay),
            );
        }
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "early");
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "late");
    }

    #[test]
    fn test_drop_drains_queued_tasks() {
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let pool = single_thread();
            for _ in 0..10 {
                let counter = counter.clone();
                pool.execute(Box::new(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                }));
            }
        }
        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn test_execute_after_shutdown_is_dropped() {
        let pool = single_thread();
        pool.signal_shutdown();
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        pool.execute(Box::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        drop(pool);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }
}
