//! Executor backed by a tokio runtime.

use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::mpsc;

use super::{Executor, ExecutorError, Task};

/// Runs tasks one at a time, in submission order, on a tokio runtime.
///
/// Tasks run inside the runtime and must not block.
#[derive(Clone)]
pub struct TokioExecutor {
    handle: Handle,
    sender: mpsc::UnboundedSender<Task>,
}

impl TokioExecutor {
    pub fn new(handle: Handle) -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel::<Task>();
        handle.spawn(async move {
            while let Some(task) = receiver.recv().await {
                task();
            }
        });
        Self { handle, sender }
    }

    /// Executor on the runtime the caller is running in.
    pub fn current() -> Result<Self, ExecutorError> {
        let handle = Handle::try_current().map_err(|e| ExecutorError::NoRuntime(e.to_string()))?;
        Ok(Self::new(handle))
    }
}

impl Executor for TokioExecutor {
    fn execute(&self, task: Task) {
        if self.sender.send(task).is_err() {
            tracing::warn!("task submitted after the tokio executor stopped was dropped");
        }
    }

    fn schedule_after(&self, task: Task, delay: Duration) {
        let sender = self.sender.clone();
        self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            if sender.send(task).is_err() {
                tracing::warn!("delayed task dropped: tokio executor stopped");
            }
        });
    }
}
