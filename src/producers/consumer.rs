//! Producer and consumer contracts, plus small composable consumers.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::context::RequestContext;
use crate::error::PipelineError;

/// Receives the events of one computation.
///
/// A computation ends with exactly one of: a result with `is_last == true`,
/// `on_failure`, or `on_cancellation`.
pub trait Consumer<T>: Send + Sync {
    fn on_new_result(&self, result: &T, is_last: bool);
    fn on_failure(&self, error: &PipelineError);
    fn on_cancellation(&self);
    fn on_progress_update(&self, _progress: f32) {}
}

/// A pipeline stage.
pub trait Producer<T>: Send + Sync {
    fn produce(&self, consumer: Arc<dyn Consumer<T>>, context: Arc<RequestContext>);
}

/// Drops every event after the first terminal one.
pub struct FinishOnceConsumer<T> {
    inner: Arc<dyn Consumer<T>>,
    finished: AtomicBool,
}

impl<T: 'static> FinishOnceConsumer<T> {
    pub fn wrap(inner: Arc<dyn Consumer<T>>) -> Arc<dyn Consumer<T>> {
        Arc::new(Self {
            inner,
            finished: AtomicBool::new(false),
        })
    }
}

impl<T> FinishOnceConsumer<T> {
    fn finish(&self) -> bool {
        !self.finished.swap(true, Ordering::AcqRel)
    }

    fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }
}

impl<T> Consumer<T> for FinishOnceConsumer<T> {
    fn on_new_result(&self, result: &T, is_last: bool) {
        if is_last {
            if self.finish() {
                self.inner.on_new_result(result, true);
            }
        } else if !self.is_finished() {
            self.inner.on_new_result(result, false);
        }
    }

    fn on_failure(&self, error: &PipelineError) {
        if self.finish() {
            self.inner.on_failure(error);
        }
    }

    fn on_cancellation(&self) {
        if self.finish() {
            self.inner.on_cancellation();
        }
    }

    fn on_progress_update(&self, progress: f32) {
        if !self.is_finished() {
            self.inner.on_progress_update(progress);
        }
    }
}

/// Applies a function to every result before forwarding it.
pub struct MapConsumer<T, U, F> {
    inner: Arc<dyn Consumer<U>>,
    map: F,
    _marker: PhantomData<fn(&T)>,
}

impl<T, U, F> MapConsumer<T, U, F>
where
    T: 'static,
    U: 'static,
    F: Fn(&T) -> U + Send + Sync + 'static,
{
    pub fn wrap(inner: Arc<dyn Consumer<U>>, map: F) -> Arc<dyn Consumer<T>> {
        Arc::new(Self {
            inner,
            map,
            _marker: PhantomData,
        })
    }
}

impl<T, U, F> Consumer<T> for MapConsumer<T, U, F>
where
    F: Fn(&T) -> U + Send + Sync,
{
    fn on_new_result(&self, result: &T, is_last: bool) {
        self.inner.on_new_result(&(self.map)(result), is_last);
    }

    fn on_failure(&self, error: &PipelineError) {
        self.inner.on_failure(error);
    }

    fn on_cancellation(&self) {
        self.inner.on_cancellation();
    }

    fn on_progress_update(&self, progress: f32) {
        self.inner.on_progress_update(progress);
    }
}

/// An event observed by a [`ChannelConsumer`].
#[derive(Debug, Clone, PartialEq)]
pub enum ConsumerEvent<T> {
    Result { value: T, is_last: bool },
    Progress(f32),
    Failure(PipelineError),
    Cancellation,
}

impl<T> ConsumerEvent<T> {
    pub fn is_terminal(&self) -> bool {
        match self {
            Self::Result { is_last, .. } => *is_last,
            Self::Progress(_) => false,
            Self::Failure(_) | Self::Cancellation => true,
        }
    }
}

/// Forwards events into a tokio channel so async callers can await them.
pub struct ChannelConsumer<T> {
    sender: mpsc::UnboundedSender<ConsumerEvent<T>>,
}

impl<T: Clone + Send + 'static> ChannelConsumer<T> {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ConsumerEvent<T>>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Arc::new(Self { sender }), receiver)
    }

    fn send(&self, event: ConsumerEvent<T>) {
        // Receiver gone means the caller stopped listening.
        let _ = self.sender.send(event);
    }
}

impl<T: Clone + Send + 'static> Consumer<T> for ChannelConsumer<T> {
    fn on_new_result(&self, result: &T, is_last: bool) {
        self.send(ConsumerEvent::Result {
            value: result.clone(),
            is_last,
        });
    }

    fn on_failure(&self, error: &PipelineError) {
        self.send(ConsumerEvent::Failure(error.clone()));
    }

    fn on_cancellation(&self) {
        self.send(ConsumerEvent::Cancellation);
    }

    fn on_progress_update(&self, progress: f32) {
        self.send(ConsumerEvent::Progress(progress));
    }
}
