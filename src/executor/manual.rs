//! Deterministic executor driven by a [`ManualClock`].

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::{Executor, Task};
use crate::clock::{Clock, ManualClock};

#[derive(Default)]
struct Queues {
    ready: VecDeque<Task>,
    delayed: Vec<(Instant, u64, Task)>,
    sequence: u64,
}

/// Holds tasks until the owner runs them.
///
/// `execute` only queues. [`run_pending`](Self::run_pending) runs ready tasks
/// on the calling thread and [`advance`](Self::advance) moves the clock,
/// releasing delayed tasks whose deadline has passed.
pub struct ManualExecutor {
    clock: Arc<ManualClock>,
    queues: Mutex<Queues>,
}

impl ManualExecutor {
    pub fn new(clock: Arc<ManualClock>) -> Self {
        Self {
            clock,
            queues: Mutex::new(Queues::default()),
        }
    }

    pub fn clock(&self) -> &Arc<ManualClock> {
        &self.clock
    }

    pub fn ready_len(&self) -> usize {
        self.queues.lock().ready.len()
    }

    pub fn delayed_len(&self) -> usize {
        self.queues.lock().delayed.len()
    }

    /// Run ready tasks, including those queued by the tasks themselves, until
    /// none remain. Returns how many ran.
    pub fn run_pending(&self) -> usize {
        let mut ran = 0;
        loop {
            let task = self.queues.lock().ready.pop_front();
            match task {
                Some(task) => {
                    task();
                    ran += 1;
                }
                None => return ran,
            }
        }
    }

    /// Advance the clock, release due delayed tasks and run everything ready.
    pub fn advance(&self, by: Duration) -> usize {
        self.clock.advance(by);
        self.release_due();
        self.run_pending()
    }

    fn release_due(&self) {
        let now = self.clock.now();
        let mut queues = self.queues.lock();
        let mut due = Vec::new();
        let mut index = 0;
        while index < queues.delayed.len() {
            if queues.delayed[index].0 <= now {
                due.push(queues.delayed.swap_remove(index));
            } else {
                index += 1;
            }
        }
        due.sort_by_key(|(when, sequence, _)| (*when, *sequence));
        queues.ready.extend(due.into_iter().map(|(_, _, task)| task));
    }
}

impl Executor for ManualExecutor {
    fn execute(&self, task: Task) {
        self.queues.lock().ready.push_back(task);
    }

    fn schedule_after(&self, task: Task, delay: Duration) {
        let when = self.clock.now() + delay;
        let mut queues = self.queues.lock();
        let sequence = queues.sequence;
        queues.sequence += 1;
        queues.delayed.push((when, sequence, task));
    }
}
