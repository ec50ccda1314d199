//! Task executors for pipeline work.
//!
//! Every executor runs immediate tasks in submission order and supports delayed
//! execution without blocking the caller.

mod manual;
mod runtime;
mod thread_pool;

use std::time::Duration;

pub use manual::ManualExecutor;
pub use runtime::TokioExecutor;
pub use thread_pool::{ThreadPool, ThreadPoolConfig, ThreadPoolStats};

/// A unit of work handed to an executor.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Runs tasks, immediately or after a delay.
pub trait Executor: Send + Sync {
    /// Queue `task` behind every task submitted before it.
    fn execute(&self, task: Task);

    /// Queue `task` once `delay` has elapsed.
    fn schedule_after(&self, task: Task, delay: Duration);
}

/// Errors for executor construction.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("Failed to spawn thread: {0}")]
    ThreadSpawnFailed(String),

    #[error("No tokio runtime available: {0}")]
    NoRuntime(String),
}
