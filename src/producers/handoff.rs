//! Pausable hand-off of work to an executor.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::consumer::{Consumer, Producer};
use crate::context::{FnCallbacks, RequestContext};
use crate::executor::{Executor, Task};

/// Identifies a task submitted to a [`HandoffQueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandoffTicket(u64);

struct HandoffState {
    queueing: bool,
    pending: VecDeque<(HandoffTicket, Task)>,
}

/// Forwards tasks to an executor, or holds them in FIFO order while paused.
///
/// Dispatch happens under the queue lock so tasks reach the executor in
/// submission order. The executor must therefore only enqueue, never run a
/// task inline.
pub struct HandoffQueue {
    executor: Arc<dyn Executor>,
    state: Mutex<HandoffState>,
    next_ticket: AtomicU64,
}

impl HandoffQueue {
    pub fn new(executor: Arc<dyn Executor>) -> Self {
        Self {
            executor,
            state: Mutex::new(HandoffState {
                queueing: false,
                pending: VecDeque::new(),
            }),
            next_ticket: AtomicU64::new(0),
        }
    }

    pub fn submit(&self, task: Task) -> HandoffTicket {
        let ticket = HandoffTicket(self.next_ticket.fetch_add(1, Ordering::Relaxed));
        let mut state = self.state.lock();
        if state.queueing {
            state.pending.push_back((ticket, task));
        } else {
            self.executor.execute(task);
        }
        ticket
    }

    pub fn pause(&self) {
        self.state.lock().queueing = true;
    }

    /// Stop queueing and dispatch everything held, oldest first.
    pub fn resume(&self) {
        let mut state = self.state.lock();
        state.queueing = false;
        let drained = state.pending.len();
        while let Some((_, task)) = state.pending.pop_front() {
            self.executor.execute(task);
        }
        if drained > 0 {
            tracing::debug!(tasks = drained, "handoff queue resumed");
        }
    }

    /// Remove a task that has not been dispatched yet.
    pub fn cancel(&self, ticket: HandoffTicket) -> bool {
        let mut state = self.state.lock();
        match state.pending.iter().position(|(t, _)| *t == ticket) {
            Some(index) => {
                state.pending.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn is_queueing(&self) -> bool {
        self.state.lock().queueing
    }

    pub fn pending_len(&self) -> usize {
        self.state.lock().pending.len()
    }
}

/// Starts its input producer through a [`HandoffQueue`].
///
/// A request cancelled before its start is dispatched is withdrawn from the
/// queue and its consumer notified.
pub struct HandoffProducer<T> {
    input: Arc<dyn Producer<T>>,
    queue: Arc<HandoffQueue>,
}

impl<T> HandoffProducer<T> {
    pub fn new(input: Arc<dyn Producer<T>>, queue: Arc<HandoffQueue>) -> Self {
        Self { input, queue }
    }
}

impl<T: 'static> Producer<T> for HandoffProducer<T> {
    fn produce(&self, consumer: Arc<dyn Consumer<T>>, context: Arc<RequestContext>) {
        let input = self.input.clone();
        let start_consumer = consumer.clone();
        let start_context = context.clone();
        let ticket = self.queue.submit(Box::new(move || {
            input.produce(start_consumer, start_context);
        }));

        let queue = self.queue.clone();
        context.add_callbacks(
            FnCallbacks::new()
                .on_cancellation(move || {
                    if queue.cancel(ticket) {
                        consumer.on_cancellation();
                    }
                })
                .into_arc(),
        );
    }
}
