//! Telemetry for the pipeline core.
//!
//! Provides structured logging setup and request spans. Pool metrics go
//! through the `metrics` facade via `memory::MetricsPoolStatsTracker`.

mod logging;
mod spans;

pub use logging::{init_logging, LogConfig, LogError, LogFormat};
pub use spans::RequestSpan;
