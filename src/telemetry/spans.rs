//! Span utilities for pipeline tracing.

use tracing::{info_span, Span};

/// Factory for per-request spans.
pub struct RequestSpan;

impl RequestSpan {
    /// Span for one run of a shared computation.
    ///
    /// Fields:
    /// - `request_id`: id of the context the computation runs under
    /// - `key`: multiplexing key
    /// - `generation`: restart counter of the computation for this key
    pub fn new(request_id: &str, key: &str, generation: u64) -> Span {
        info_span!(
            "pipeline_request",
            request_id = %request_id,
            key = %key,
            generation,
        )
    }
}
