//! Mutable per-request state shared by every stage a request passes through.
//!
//! Setters never invoke callbacks themselves. Each `*_no_callbacks` setter
//! changes state under the lock and hands back the callbacks to notify, which
//! the caller invokes after the lock is gone through the matching `call_on_*`
//! helper. The plain setters do both steps.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use super::priority::Priority;
use super::request::{ImageRequest, RequestLevel};

/// Opaque value supplied by the caller and carried alongside the request.
pub type CallerContext = Arc<dyn Any + Send + Sync>;

/// Callbacks returned by a setter whose value changed.
pub type PendingCallbacks = Option<Vec<Arc<dyn ContextCallbacks>>>;

/// Receives context transitions. Every method defaults to a no-op.
pub trait ContextCallbacks: Send + Sync {
    fn on_cancellation_requested(&self) {}
    fn on_is_prefetch_changed(&self) {}
    fn on_is_intermediate_result_expected_changed(&self) {}
    fn on_priority_changed(&self) {}
}

type Hook = Box<dyn Fn() + Send + Sync>;

/// [`ContextCallbacks`] assembled from closures.
#[derive(Default)]
pub struct FnCallbacks {
    on_cancellation: Option<Hook>,
    on_prefetch: Option<Hook>,
    on_intermediate: Option<Hook>,
    on_priority: Option<Hook>,
}

impl FnCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_cancellation(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_cancellation = Some(Box::new(f));
        self
    }

    pub fn on_prefetch_changed(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_prefetch = Some(Box::new(f));
        self
    }

    pub fn on_intermediate_changed(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_intermediate = Some(Box::new(f));
        self
    }

    pub fn on_priority_changed(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_priority = Some(Box::new(f));
        self
    }

    pub fn into_arc(self) -> Arc<dyn ContextCallbacks> {
        Arc::new(self)
    }
}

impl ContextCallbacks for FnCallbacks {
    fn on_cancellation_requested(&self) {
        if let Some(f) = &self.on_cancellation {
            f();
        }
    }

    fn on_is_prefetch_changed(&self) {
        if let Some(f) = &self.on_prefetch {
            f();
        }
    }

    fn on_is_intermediate_result_expected_changed(&self) {
        if let Some(f) = &self.on_intermediate {
            f();
        }
    }

    fn on_priority_changed(&self) {
        if let Some(f) = &self.on_priority {
            f();
        }
    }
}

struct ContextState {
    is_cancelled: bool,
    priority: Priority,
    is_prefetch: bool,
    is_intermediate_result_expected: bool,
    callbacks: Vec<Arc<dyn ContextCallbacks>>,
}

/// Cancellation flag, priority and hints for one logical request.
///
/// Cancellation is monotonic. A callback added after cancellation is notified
/// before `add_callbacks` returns.
pub struct RequestContext {
    id: String,
    image_request: Arc<ImageRequest>,
    caller_context: Option<CallerContext>,
    lowest_permitted_request_level: RequestLevel,
    state: Mutex<ContextState>,
}

impl RequestContext {
    pub fn new(
        id: impl Into<String>,
        image_request: Arc<ImageRequest>,
        caller_context: Option<CallerContext>,
        lowest_permitted_request_level: RequestLevel,
        is_prefetch: bool,
        is_intermediate_result_expected: bool,
        priority: Priority,
    ) -> Self {
        Self {
            id: id.into(),
            image_request,
            caller_context,
            lowest_permitted_request_level,
            state: Mutex::new(ContextState {
                is_cancelled: false,
                priority,
                is_prefetch,
                is_intermediate_result_expected,
                callbacks: Vec::new(),
            }),
        }
    }

    /// Context for a foreground request with a fresh UUID v4 id.
    pub fn for_request(image_request: ImageRequest) -> Self {
        let level = image_request.lowest_permitted_request_level;
        let progressive = image_request.progressive_rendering_enabled;
        Self::new(
            uuid::Uuid::new_v4().to_string(),
            Arc::new(image_request),
            None,
            level,
            false,
            progressive,
            Priority::Medium,
        )
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn image_request(&self) -> &Arc<ImageRequest> {
        &self.image_request
    }

    pub fn caller_context(&self) -> Option<&CallerContext> {
        self.caller_context.as_ref()
    }

    pub fn lowest_permitted_request_level(&self) -> RequestLevel {
        self.lowest_permitted_request_level
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.lock().is_cancelled
    }

    pub fn priority(&self) -> Priority {
        self.state.lock().priority
    }

    pub fn is_prefetch(&self) -> bool {
        self.state.lock().is_prefetch
    }

    pub fn is_intermediate_result_expected(&self) -> bool {
        self.state.lock().is_intermediate_result_expected
    }

    pub fn add_callbacks(&self, callbacks: Arc<dyn ContextCallbacks>) {
        let cancelled = {
            let mut state = self.state.lock();
            if !state.is_cancelled {
                state.callbacks.push(callbacks.clone());
            }
            state.is_cancelled
        };
        if cancelled {
            callbacks.on_cancellation_requested();
        }
    }

    pub fn cancel(&self) {
        Self::call_on_cancellation_requested(self.cancel_no_callbacks());
    }

    pub fn cancel_no_callbacks(&self) -> PendingCallbacks {
        let mut state = self.state.lock();
        if state.is_cancelled {
            return None;
        }
        state.is_cancelled = true;
        Some(state.callbacks.clone())
    }

    pub fn set_is_prefetch(&self, is_prefetch: bool) {
        Self::call_on_is_prefetch_changed(self.set_is_prefetch_no_callbacks(is_prefetch));
    }

    pub fn set_is_prefetch_no_callbacks(&self, is_prefetch: bool) -> PendingCallbacks {
        let mut state = self.state.lock();
        if state.is_prefetch == is_prefetch {
            return None;
        }
        state.is_prefetch = is_prefetch;
        Some(state.callbacks.clone())
    }

    pub fn set_priority(&self, priority: Priority) {
        Self::call_on_priority_changed(self.set_priority_no_callbacks(priority));
    }

    pub fn set_priority_no_callbacks(&self, priority: Priority) -> PendingCallbacks {
        let mut state = self.state.lock();
        if state.priority == priority {
            return None;
        }
        state.priority = priority;
        Some(state.callbacks.clone())
    }

    pub fn set_is_intermediate_result_expected(&self, expected: bool) {
        Self::call_on_is_intermediate_result_expected_changed(
            self.set_is_intermediate_result_expected_no_callbacks(expected),
        );
    }

    pub fn set_is_intermediate_result_expected_no_callbacks(
        &self,
        expected: bool,
    ) -> PendingCallbacks {
        let mut state = self.state.lock();
        if state.is_intermediate_result_expected == expected {
            return None;
        }
        state.is_intermediate_result_expected = expected;
        Some(state.callbacks.clone())
    }

    pub fn call_on_cancellation_requested(callbacks: PendingCallbacks) {
        for cb in callbacks.iter().flatten() {
            cb.on_cancellation_requested();
        }
    }

    pub fn call_on_is_prefetch_changed(callbacks: PendingCallbacks) {
        for cb in callbacks.iter().flatten() {
            cb.on_is_prefetch_changed();
        }
    }

    pub fn call_on_is_intermediate_result_expected_changed(callbacks: PendingCallbacks) {
        for cb in callbacks.iter().flatten() {
            cb.on_is_intermediate_result_expected_changed();
        }
    }

    pub fn call_on_priority_changed(callbacks: PendingCallbacks) {
        for cb in callbacks.iter().flatten() {
            cb.on_priority_changed();
        }
    }
}

impl fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("RequestContext")
            .field("id", &self.id)
            .field("source", &self.image_request.source)
            .field("is_cancelled", &state.is_cancelled)
            .field("priority", &state.priority)
            .field("is_prefetch", &state.is_prefetch)
            .field(
                "is_intermediate_result_expected",
                &state.is_intermediate_result_expected,
            )
            .finish()
    }
}
