//! Request descriptors and the mutable context shared across pipeline stages.

mod priority;
mod request;
mod request_context;

pub use priority::Priority;
pub use request::{CacheKey, ImageRequest, RequestLevel, ResizeOptions};
pub use request_context::{
    CallerContext, ContextCallbacks, FnCallbacks, PendingCallbacks, RequestContext,
};
