//! Keyed request deduplication.
//!
//! Concurrent requests that map to the same key share one computation of the
//! input producer. Results, progress, failure and cancellation fan out to every
//! attached consumer. The shared computation runs with a context whose flags
//! aggregate the attached consumers: prefetch only if all are prefetch,
//! intermediate results if any wants them, and the highest priority.
//!
//! Each entry has one structural lock guarding the consumer list and cached
//! state; it is never held while calling out. Every attached consumer has its
//! own re-entrant delivery gate so it sees events in the order the computation
//! produced them. No entry-wide lock is held across a consumer callback, so a
//! consumer may synchronously request other keys of the same multiplexer.

use std::fmt::Debug;
use std::hash::Hash;
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use parking_lot::{Mutex, ReentrantMutex};

use super::consumer::{Consumer, Producer};
use crate::context::{
    CacheKey, ContextCallbacks, PendingCallbacks, Priority, RequestContext, RequestLevel,
};
use crate::error::PipelineError;
use crate::telemetry::RequestSpan;

/// Maps a request to its multiplexing key and duplicates retained results.
pub trait KeyStrategy<T>: Send + Sync {
    type Key: Eq + Hash + Clone + Debug + Send + Sync;

    fn key(&self, context: &RequestContext) -> Self::Key;

    /// Cheap duplicate of a result for a late-joining consumer, or `None` if
    /// the result cannot be shared.
    fn clone_or_none(&self, result: &T) -> Option<T>;
}

/// Keys decoded-image requests by source, resize options and request level.
#[derive(Debug, Default, Clone, Copy)]
pub struct BitmapCacheKeyStrategy;

impl<T: Clone> KeyStrategy<T> for BitmapCacheKeyStrategy {
    type Key = (CacheKey, RequestLevel);

    fn key(&self, context: &RequestContext) -> Self::Key {
        (
            CacheKey::bitmap(context.image_request()),
            context.lowest_permitted_request_level(),
        )
    }

    fn clone_or_none(&self, result: &T) -> Option<T> {
        Some(result.clone())
    }
}

/// Keys encoded-bytes requests by source and request level.
#[derive(Debug, Default, Clone, Copy)]
pub struct EncodedCacheKeyStrategy;

impl<T: Clone> KeyStrategy<T> for EncodedCacheKeyStrategy {
    type Key = (CacheKey, RequestLevel);

    fn key(&self, context: &RequestContext) -> Self::Key {
        (
            CacheKey::encoded(context.image_request()),
            context.lowest_permitted_request_level(),
        )
    }

    fn clone_or_none(&self, result: &T) -> Option<T> {
        Some(result.clone())
    }
}

struct Shared<T, S: KeyStrategy<T>> {
    name: String,
    input: Arc<dyn Producer<T>>,
    strategy: S,
    entries: DashMap<S::Key, Arc<Entry<T, S>>>,
}

/// Serialises delivery to one attached consumer.
type Gate = Arc<ReentrantMutex<()>>;

/// A consumer snapshot taken under the structural lock.
struct Target<T> {
    consumer: Arc<dyn Consumer<T>>,
    gate: Gate,
}

impl<T> Target<T> {
    fn deliver(&self, event: impl FnOnce(&dyn Consumer<T>)) {
        let _gate = self.gate.lock();
        event(self.consumer.as_ref());
    }
}

struct Attached<T> {
    id: u64,
    consumer: Arc<dyn Consumer<T>>,
    gate: Gate,
    context: Arc<RequestContext>,
    /// Sequence number of the newest intermediate result delivered.
    delivered: u64,
}

impl<T> Attached<T> {
    fn target(&self) -> Target<T> {
        Target {
            consumer: self.consumer.clone(),
            gate: self.gate.clone(),
        }
    }
}

struct EntryState<T> {
    consumers: Vec<Attached<T>>,
    last_intermediate: Option<(T, u64)>,
    last_progress: f32,
    delegate: Option<Arc<RequestContext>>,
    /// Generation of the running computation; 0 when none is running.
    generation: u64,
    next_generation: u64,
    result_sequence: u64,
    next_consumer_id: u64,
    closed: bool,
}

struct Entry<T, S: KeyStrategy<T>> {
    key: S::Key,
    shared: Weak<Shared<T, S>>,
    state: Mutex<EntryState<T>>,
}

struct Aggregates {
    is_prefetch: bool,
    is_intermediate_result_expected: bool,
    priority: Priority,
}

fn aggregate<T>(consumers: &[Attached<T>]) -> Aggregates {
    let mut aggregates = Aggregates {
        is_prefetch: true,
        is_intermediate_result_expected: false,
        priority: Priority::Low,
    };
    for attached in consumers {
        aggregates.is_prefetch &= attached.context.is_prefetch();
        aggregates.is_intermediate_result_expected |=
            attached.context.is_intermediate_result_expected();
        aggregates.priority = Priority::higher(aggregates.priority, attached.context.priority());
    }
    aggregates
}

/// Delegate-context notifications collected under the structural lock.
#[derive(Default)]
struct DelegateUpdates {
    prefetch: PendingCallbacks,
    intermediate: PendingCallbacks,
    priority: PendingCallbacks,
}

impl DelegateUpdates {
    fn collect(delegate: Option<&Arc<RequestContext>>, aggregates: &Aggregates) -> Self {
        match delegate {
            Some(delegate) => Self {
                prefetch: delegate.set_is_prefetch_no_callbacks(aggregates.is_prefetch),
                intermediate: delegate.set_is_intermediate_result_expected_no_callbacks(
                    aggregates.is_intermediate_result_expected,
                ),
                priority: delegate.set_priority_no_callbacks(aggregates.priority),
            },
            None => Self::default(),
        }
    }

    fn fire(self) {
        RequestContext::call_on_is_prefetch_changed(self.prefetch);
        RequestContext::call_on_is_intermediate_result_expected_changed(self.intermediate);
        RequestContext::call_on_priority_changed(self.priority);
    }
}

/// A computation to launch once the structural lock is released.
struct Start {
    generation: u64,
    delegate: Arc<RequestContext>,
}

enum AttachOutcome<T> {
    Closed,
    Attached {
        id: u64,
        start: Option<Start>,
        cached: Option<(T, u64, f32)>,
        updates: DelegateUpdates,
    },
}

impl<T, S> Entry<T, S>
where
    T: Send + Sync + 'static,
    S: KeyStrategy<T> + 'static,
{
    fn new(key: S::Key, shared: Weak<Shared<T, S>>) -> Self {
        Self {
            key,
            shared,
            state: Mutex::new(EntryState {
                consumers: Vec::new(),
                last_intermediate: None,
                last_progress: 0.0,
                delegate: None,
                generation: 0,
                next_generation: 1,
                result_sequence: 0,
                next_consumer_id: 0,
                closed: false,
            }),
        }
    }

    /// Begin a computation under the structural lock. Caller runs it afterwards.
    fn begin_locked(state: &mut EntryState<T>, template: &RequestContext) -> Start {
        let aggregates = aggregate(&state.consumers);
        let delegate = Arc::new(RequestContext::new(
            template.id(),
            template.image_request().clone(),
            template.caller_context().cloned(),
            template.lowest_permitted_request_level(),
            aggregates.is_prefetch,
            aggregates.is_intermediate_result_expected,
            aggregates.priority,
        ));
        let generation = state.next_generation;
        state.next_generation += 1;
        state.generation = generation;
        state.delegate = Some(delegate.clone());
        Start {
            generation,
            delegate,
        }
    }

    fn attach(
        &self,
        strategy: &S,
        consumer: Arc<dyn Consumer<T>>,
        context: Arc<RequestContext>,
    ) -> AttachOutcome<T> {
        let mut state = self.state.lock();
        if state.closed {
            return AttachOutcome::Closed;
        }

        let id = state.next_consumer_id;
        state.next_consumer_id += 1;
        state.consumers.push(Attached {
            id,
            consumer,
            gate: Arc::new(ReentrantMutex::new(())),
            context: context.clone(),
            delivered: 0,
        });

        let (start, updates) = if state.generation == 0 {
            (Some(Self::begin_locked(&mut state, &context)), DelegateUpdates::default())
        } else {
            let aggregates = aggregate(&state.consumers);
            (None, DelegateUpdates::collect(state.delegate.as_ref(), &aggregates))
        };

        let progress = state.last_progress;
        let cached = state
            .last_intermediate
            .as_ref()
            .and_then(|(value, sequence)| {
                strategy
                    .clone_or_none(value)
                    .map(|copy| (copy, *sequence, progress))
            });

        AttachOutcome::Attached {
            id,
            start,
            cached,
            updates,
        }
    }

    /// Start the input producer, unless the entry closed or moved on to a
    /// newer generation since `start` was taken.
    fn run(self: &Arc<Self>, start: Start) {
        {
            let state = self.state.lock();
            if state.closed || state.generation != start.generation {
                tracing::trace!(key = ?self.key, "skipping start, no consumers waiting");
                return;
            }
        }
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        let span = RequestSpan::new(
            start.delegate.id(),
            &format!("{:?}", self.key),
            start.generation,
        );
        let _enter = span.enter();
        tracing::debug!(multiplexer = %shared.name, "starting shared computation");
        let forwarding: Arc<dyn Consumer<T>> = Arc::new(ForwardingConsumer {
            entry: Arc::downgrade(self),
            generation: start.generation,
        });
        shared.input.produce(forwarding, start.delegate);
    }

    /// Hand a retained intermediate result to a consumer that just attached,
    /// unless a newer result already reached it.
    fn deliver_cached(&self, id: u64, value: T, sequence: u64, progress: f32) {
        let gate = self
            .state
            .lock()
            .consumers
            .iter()
            .find(|a| a.id == id)
            .map(|a| a.gate.clone());
        let Some(gate) = gate else {
            return;
        };

        let _gate = gate.lock();
        let consumer = {
            let mut state = self.state.lock();
            match state.consumers.iter_mut().find(|a| a.id == id) {
                Some(attached) if attached.delivered < sequence => {
                    attached.delivered = sequence;
                    Some(attached.consumer.clone())
                }
                _ => None,
            }
        };
        if let Some(consumer) = consumer {
            consumer.on_progress_update(progress);
            consumer.on_new_result(&value, false);
        }
    }

    /// Mark the entry closed and drop it from the key map.
    fn close_locked(state: &mut EntryState<T>) -> (Vec<Attached<T>>, Option<Arc<RequestContext>>) {
        state.closed = true;
        state.generation = 0;
        state.last_intermediate = None;
        (std::mem::take(&mut state.consumers), state.delegate.take())
    }

    fn remove_from_map(self: &Arc<Self>) {
        if let Some(shared) = self.shared.upgrade() {
            shared
                .entries
                .remove_if(&self.key, |_, entry| Arc::ptr_eq(entry, self));
        }
    }

    fn detach(self: &Arc<Self>, id: u64) {
        let (removed, updates, closed_delegate) = {
            let mut state = self.state.lock();
            let Some(index) = state.consumers.iter().position(|a| a.id == id) else {
                return;
            };
            let removed = state.consumers.remove(index);
            if state.consumers.is_empty() {
                let (_, delegate) = Self::close_locked(&mut state);
                (removed, DelegateUpdates::default(), delegate)
            } else {
                let aggregates = aggregate(&state.consumers);
                let updates = DelegateUpdates::collect(state.delegate.as_ref(), &aggregates);
                (removed, updates, None)
            }
        };

        if let Some(delegate) = closed_delegate {
            self.remove_from_map();
            tracing::debug!(key = ?self.key, "last consumer detached, cancelling computation");
            delegate.cancel();
        }
        updates.fire();
        removed.target().deliver(|c| c.on_cancellation());
    }

    fn update_aggregates(&self) {
        let updates = {
            let state = self.state.lock();
            if state.closed {
                return;
            }
            let aggregates = aggregate(&state.consumers);
            DelegateUpdates::collect(state.delegate.as_ref(), &aggregates)
        };
        updates.fire();
    }

    fn on_result(self: &Arc<Self>, generation: u64, result: &T, is_last: bool) {
        let targets: Vec<Target<T>> = {
            let mut state = self.state.lock();
            if state.generation != generation {
                return;
            }
            if is_last {
                let (closed, _) = Self::close_locked(&mut state);
                closed.iter().map(Attached::target).collect()
            } else {
                let Some(shared) = self.shared.upgrade() else {
                    return;
                };
                state.result_sequence += 1;
                let sequence = state.result_sequence;
                state.last_intermediate = shared
                    .strategy
                    .clone_or_none(result)
                    .map(|copy| (copy, sequence));
                state
                    .consumers
                    .iter_mut()
                    .map(|attached| {
                        attached.delivered = sequence;
                        attached.target()
                    })
                    .collect()
            }
        };

        if is_last {
            self.remove_from_map();
        }
        for target in targets {
            target.deliver(|c| c.on_new_result(result, is_last));
        }
    }

    fn on_failure(self: &Arc<Self>, generation: u64, error: &PipelineError) {
        let targets = {
            let mut state = self.state.lock();
            if state.generation != generation {
                return;
            }
            Self::close_locked(&mut state).0
        };
        self.remove_from_map();
        tracing::debug!(key = ?self.key, error = %error, consumers = targets.len(), "shared computation failed");
        for attached in targets {
            attached.target().deliver(|c| c.on_failure(error));
        }
    }

    fn on_progress(&self, generation: u64, progress: f32) {
        let targets: Vec<Target<T>> = {
            let mut state = self.state.lock();
            if state.generation != generation {
                return;
            }
            state.last_progress = progress;
            state.consumers.iter().map(Attached::target).collect()
        };
        for target in targets {
            target.deliver(|c| c.on_progress_update(progress));
        }
    }

    /// The computation was cancelled underneath us. Restart it if anyone is
    /// still waiting.
    fn on_cancelled(self: &Arc<Self>, generation: u64) {
        let start = {
            let mut state = self.state.lock();
            if state.generation != generation {
                return;
            }
            state.generation = 0;
            state.delegate = None;
            state.last_intermediate = None;
            match state.consumers.first().map(|a| a.context.clone()) {
                Some(template) => Some(Self::begin_locked(&mut state, &template)),
                None => {
                    Self::close_locked(&mut state);
                    None
                }
            }
        };

        match start {
            Some(start) => {
                tracing::debug!(key = ?self.key, "shared computation cancelled, restarting");
                self.run(start);
            }
            None => self.remove_from_map(),
        }
    }
}

/// The consumer handed to the input producer for one generation.
struct ForwardingConsumer<T, S: KeyStrategy<T>> {
    entry: Weak<Entry<T, S>>,
    generation: u64,
}

impl<T, S> Consumer<T> for ForwardingConsumer<T, S>
where
    T: Send + Sync + 'static,
    S: KeyStrategy<T> + 'static,
{
    fn on_new_result(&self, result: &T, is_last: bool) {
        if let Some(entry) = self.entry.upgrade() {
            entry.on_result(self.generation, result, is_last);
        }
    }

    fn on_failure(&self, error: &PipelineError) {
        if let Some(entry) = self.entry.upgrade() {
            entry.on_failure(self.generation, error);
        }
    }

    fn on_cancellation(&self) {
        if let Some(entry) = self.entry.upgrade() {
            entry.on_cancelled(self.generation);
        }
    }

    fn on_progress_update(&self, progress: f32) {
        if let Some(entry) = self.entry.upgrade() {
            entry.on_progress(self.generation, progress);
        }
    }
}

/// Registered on each attached consumer's context.
struct AttachmentCallbacks<T, S: KeyStrategy<T>> {
    entry: Weak<Entry<T, S>>,
    id: u64,
}

impl<T, S> ContextCallbacks for AttachmentCallbacks<T, S>
where
    T: Send + Sync + 'static,
    S: KeyStrategy<T> + 'static,
{
    fn on_cancellation_requested(&self) {
        if let Some(entry) = self.entry.upgrade() {
            entry.detach(self.id);
        }
    }

    fn on_is_prefetch_changed(&self) {
        if let Some(entry) = self.entry.upgrade() {
            entry.update_aggregates();
        }
    }

    fn on_is_intermediate_result_expected_changed(&self) {
        if let Some(entry) = self.entry.upgrade() {
            entry.update_aggregates();
        }
    }

    fn on_priority_changed(&self) {
        if let Some(entry) = self.entry.upgrade() {
            entry.update_aggregates();
        }
    }
}

/// Producer that collapses concurrent same-key requests into one computation.
pub struct Multiplexer<T, S: KeyStrategy<T>> {
    shared: Arc<Shared<T, S>>,
}

impl<T, S> Multiplexer<T, S>
where
    T: Send + Sync + 'static,
    S: KeyStrategy<T> + 'static,
{
    pub fn new(name: impl Into<String>, input: Arc<dyn Producer<T>>, strategy: S) -> Self {
        Self {
            shared: Arc::new(Shared {
                name: name.into(),
                input,
                strategy,
                entries: DashMap::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Number of keys with a live computation.
    pub fn in_flight(&self) -> usize {
        self.shared.entries.len()
    }

    pub fn is_in_flight(&self, key: &S::Key) -> bool {
        self.shared.entries.contains_key(key)
    }

    /// Consumers attached to `key`, or 0 if none.
    pub fn consumer_count(&self, key: &S::Key) -> usize {
        let entry = self.shared.entries.get(key).map(|e| e.value().clone());
        entry.map_or(0, |e| e.state.lock().consumers.len())
    }
}

impl<T, S> Producer<T> for Multiplexer<T, S>
where
    T: Send + Sync + 'static,
    S: KeyStrategy<T> + 'static,
{
    fn produce(&self, consumer: Arc<dyn Consumer<T>>, context: Arc<RequestContext>) {
        let key = self.shared.strategy.key(&context);

        let (entry, id, start, cached, updates) = loop {
            let entry = self
                .shared
                .entries
                .entry(key.clone())
                .or_insert_with(|| {
                    Arc::new(Entry::new(key.clone(), Arc::downgrade(&self.shared)))
                })
                .value()
                .clone();

            match entry.attach(&self.shared.strategy, consumer.clone(), context.clone()) {
                AttachOutcome::Attached {
                    id,
                    start,
                    cached,
                    updates,
                } => break (entry, id, start, cached, updates),
                AttachOutcome::Closed => {
                    // Raced with teardown; make sure the stale entry is gone and retry.
                    entry.remove_from_map();
                }
            }
        };

        updates.fire();
        context.add_callbacks(Arc::new(AttachmentCallbacks {
            entry: Arc::downgrade(&entry),
            id,
        }));
        if let Some((value, sequence, progress)) = cached {
            entry.deliver_cached(id, value, sequence, progress);
        }
        if let Some(start) = start {
            entry.run(start);
        }
    }
}
