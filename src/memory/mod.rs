//! Memory management for the image pipeline.
//!
//! Provides the bucketed pool, its byte-array backend, pool presets, event
//! tracking, pooled byte streams and the memory-pressure registry.

mod bucket;
mod byte_array;
mod params;
mod pool;
mod stats;
mod streams;
mod trim;

pub use bucket::SizeBucket;
pub use byte_array::{ByteArrayBackend, ByteArrayPool};
pub use params::{PoolParams, DEFAULT_IO_BUFFER_SIZE};
pub use pool::{BucketStats, BucketedPool, Counter, PoolBackend, PoolStats, PooledValue};
pub use stats::{MetricsPoolStatsTracker, NoOpPoolStatsTracker, PoolStatsTracker};
pub use streams::{PooledByteBuffer, PooledByteStreams, PooledOutputBuffer};
pub use trim::{MemoryTrimType, MemoryTrimmable, TrimRegistration, TrimmableRegistry};
