//! Rate-limited "process the latest input" job.
//!
//! Inputs replace each other until the job runs. The job body never runs
//! concurrently with itself, and two runs start at least `min_interval` apart.
//! An input submitted while the job is running is picked up by a follow-up run
//! scheduled when the current one finishes.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::clock::Clock;
use crate::executor::Executor;

/// Input accepted by a [`JobScheduler`].
pub trait JobInput: Send + 'static {
    /// Structurally valid inputs may be processed even when not last.
    fn is_valid(&self) -> bool {
        true
    }
}

/// Encoded image bytes: empty buffers carry nothing to decode.
impl JobInput for Vec<u8> {
    fn is_valid(&self) -> bool {
        !self.is_empty()
    }
}

impl<T: JobInput + Sync> JobInput for Arc<T> {
    fn is_valid(&self) -> bool {
        (**self).is_valid()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Idle,
    Queued,
    Running,
    RunningAndPending,
}

type JobFn<I> = dyn Fn(Option<I>, bool) + Send + Sync;

struct JobState<I> {
    input: Option<I>,
    is_last: bool,
    status: JobStatus,
    submit_time: Option<Instant>,
    start_time: Option<Instant>,
}

struct Inner<I> {
    executor: Arc<dyn Executor>,
    clock: Arc<dyn Clock>,
    job: Box<JobFn<I>>,
    min_interval: Duration,
    state: Mutex<JobState<I>>,
}

fn should_process<I: JobInput>(input: Option<&I>, is_last: bool) -> bool {
    is_last || input.is_some_and(|input| input.is_valid())
}

/// Schedules a job body over the most recent input.
pub struct JobScheduler<I: JobInput> {
    inner: Arc<Inner<I>>,
}

impl<I: JobInput> Clone for JobScheduler<I> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<I: JobInput> JobScheduler<I> {
    pub fn new(
        executor: Arc<dyn Executor>,
        clock: Arc<dyn Clock>,
        min_interval: Duration,
        job: impl Fn(Option<I>, bool) + Send + Sync + 'static,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                executor,
                clock,
                job: Box::new(job),
                min_interval,
                state: Mutex::new(JobState {
                    input: None,
                    is_last: false,
                    status: JobStatus::Idle,
                    submit_time: None,
                    start_time: None,
                }),
            }),
        }
    }

    /// Drop the pending input without running it.
    pub fn clear_job(&self) {
        let mut state = self.inner.state.lock();
        state.input = None;
        state.is_last = false;
    }

    /// Replace the pending input. Returns false (and keeps the old input) if
    /// the new one is neither last nor valid.
    pub fn update_job(&self, input: Option<I>, is_last: bool) -> bool {
        if !should_process(input.as_ref(), is_last) {
            return false;
        }
        let previous = {
            let mut state = self.inner.state.lock();
            state.is_last = is_last;
            std::mem::replace(&mut state.input, input)
        };
        drop(previous);
        true
    }

    /// Request a run over the pending input. Returns false if there is nothing
    /// to process.
    pub fn schedule_job(&self) -> bool {
        Inner::schedule(&self.inner)
    }

    pub fn status(&self) -> JobStatus {
        self.inner.state.lock().status
    }

    /// How long the most recent run waited between submission and start.
    pub fn queued_time(&self) -> Duration {
        let state = self.inner.state.lock();
        match (state.submit_time, state.start_time) {
            (Some(submit), Some(start)) => start.saturating_duration_since(submit),
            _ => Duration::ZERO,
        }
    }
}

impl<I: JobInput> Inner<I> {
    fn schedule(this: &Arc<Self>) -> bool {
        let now = this.clock.now();
        let delay = {
            let mut state = this.state.lock();
            if !should_process(state.input.as_ref(), state.is_last) {
                return false;
            }
            match state.status {
                JobStatus::Idle => {
                    state.status = JobStatus::Queued;
                    state.submit_time = Some(now);
                    Some(this.delay_locked(&state, now))
                }
                JobStatus::Running => {
                    state.status = JobStatus::RunningAndPending;
                    None
                }
                JobStatus::Queued | JobStatus::RunningAndPending => None,
            }
        };
        if let Some(delay) = delay {
            Self::enqueue(this, delay);
        }
        true
    }

    /// Time left until `min_interval` has passed since the last start.
    fn delay_locked(&self, state: &JobState<I>, now: Instant) -> Duration {
        match state.start_time {
            Some(start) => (start + self.min_interval).saturating_duration_since(now),
            None => Duration::ZERO,
        }
    }

    fn enqueue(this: &Arc<Self>, delay: Duration) {
        let job = this.clone();
        let task = Box::new(move || Self::run(&job));
        if delay.is_zero() {
            this.executor.execute(task);
        } else {
            tracing::trace!(delay_ms = delay.as_millis() as u64, "job delayed by rate limit");
            this.executor.schedule_after(task, delay);
        }
    }

    fn run(this: &Arc<Self>) {
        let now = this.clock.now();
        let (input, is_last) = {
            let mut state = this.state.lock();
            state.status = JobStatus::Running;
            state.start_time = Some(now);
            let is_last = std::mem::replace(&mut state.is_last, false);
            (state.input.take(), is_last)
        };

        let _finished = FinishGuard { inner: this };
        if should_process(input.as_ref(), is_last) {
            (this.job)(input, is_last);
        }
    }

    fn on_finished(this: &Arc<Self>) {
        let now = this.clock.now();
        let delay = {
            let mut state = this.state.lock();
            if state.status == JobStatus::RunningAndPending {
                state.status = JobStatus::Queued;
                state.submit_time = Some(now);
                Some(this.delay_locked(&state, now))
            } else {
                state.status = JobStatus::Idle;
                None
            }
        };
        if let Some(delay) = delay {
            Self::enqueue(this, delay);
        }
    }
}

/// Completes the run even if the job body panics.
struct FinishGuard<'a, I: JobInput> {
    inner: &'a Arc<Inner<I>>,
}

impl<I: JobInput> Drop for FinishGuard<'_, I> {
    fn drop(&mut self) {
        Inner::on_finished(self.inner);
    }
}
