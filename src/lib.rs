//! imgpipe core
//!
//! Resource pooling and request coordination for an image-loading pipeline.
//! Decoding, caching and networking live outside this crate and plug in through
//! the [`producers::Producer`] and [`memory::PoolBackend`] traits.
//!
//! # Building blocks
//!
//! - **memory**: bucketed pools of reusable buffers with soft and hard caps
//! - **producers**: keyed request multiplexing, the rate-limited job scheduler
//!   and the pausable hand-off queue
//! - **context**: per-request mutable state with change callbacks
//! - **executor**: thread pool, tokio and manually driven task executors
//!
//! There is no process-wide state. A [`Pipeline`] owns the shared pools,
//! executors and trim registry, and embedders pass it where it is needed.

pub mod clock;
pub mod config;
pub mod context;
pub mod error;
pub mod executor;
pub mod memory;
pub mod producers;
pub mod telemetry;

use std::sync::Arc;

use clock::SystemClock;
use config::PipelineConfig;
use executor::{Executor, ExecutorError, ThreadPool, ThreadPoolConfig};
use memory::{
    BucketedPool, ByteArrayBackend, ByteArrayPool, MemoryTrimType, MemoryTrimmable,
    MetricsPoolStatsTracker, PoolParams, PooledByteStreams, PooledOutputBuffer, TrimRegistration,
    TrimmableRegistry,
};
use producers::{HandoffProducer, HandoffQueue, JobInput, JobScheduler, Producer};

pub use context::{Priority, RequestContext};
pub use error::{PipelineError, PoolError};

/// Name of the small I/O buffer pool.
pub const IO_POOL_NAME: &str = "io_buffers";
/// Name of the native chunk pool.
pub const CHUNK_POOL_NAME: &str = "native_chunks";

/// Shared resources of one image pipeline.
pub struct Pipeline {
    config: PipelineConfig,
    trim_registry: TrimmableRegistry,
    io_pool: Arc<ByteArrayPool>,
    io_pool_metrics: Arc<MetricsPoolStatsTracker>,
    chunk_pool: Arc<ByteArrayPool>,
    chunk_pool_metrics: Arc<MetricsPoolStatsTracker>,
    background: Arc<ThreadPool>,
    io: Arc<ThreadPool>,
    handoff: Arc<HandoffQueue>,
    registrations: Vec<TrimRegistration>,
}

fn metered_pool(
    name: &str,
    params: PoolParams,
) -> (Arc<ByteArrayPool>, Arc<MetricsPoolStatsTracker>) {
    let metrics = Arc::new(MetricsPoolStatsTracker::new(name));
    let backend = ByteArrayBackend::new(&params);
    let pool = BucketedPool::with_tracker(name, backend, params, metrics.clone());
    (Arc::new(pool), metrics)
}

impl Pipeline {
    /// Create the pools and executors described by `config`.
    pub fn new(config: PipelineConfig) -> Result<Self, ExecutorError> {
        let (io_pool, io_pool_metrics) = metered_pool(IO_POOL_NAME, config.io_pool.clone());
        let (chunk_pool, chunk_pool_metrics) = metered_pool(CHUNK_POOL_NAME, config.chunk_pool());

        let background = Arc::new(ThreadPool::new(ThreadPoolConfig {
            num_threads: config.worker_threads,
            ..ThreadPoolConfig::decode()
        })?);
        let io = Arc::new(ThreadPool::new(ThreadPoolConfig::io())?);
        let handoff = Arc::new(HandoffQueue::new(background.clone()));

        let trim_registry = TrimmableRegistry::new();
        let registrations = [io_pool.clone(), chunk_pool.clone()]
            .into_iter()
            .map(|pool| {
                let trimmable: Arc<dyn MemoryTrimmable> = pool;
                trim_registry.register(&trimmable)
            })
            .collect();

        tracing::info!(
            io_hard_cap = config.io_pool.max_size_hard_cap,
            chunk_hard_cap = chunk_pool.params().max_size_hard_cap,
            workers = background.num_threads(),
            "pipeline created"
        );

        Ok(Self {
            config,
            trim_registry,
            io_pool,
            io_pool_metrics,
            chunk_pool,
            chunk_pool_metrics,
            background,
            io,
            handoff,
            registrations,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Pool of 16 KiB buffers for fetch and cache I/O.
    pub fn io_pool(&self) -> &Arc<ByteArrayPool> {
        &self.io_pool
    }

    /// Pool of power-of-two chunks backing encoded image bytes.
    pub fn chunk_pool(&self) -> &Arc<ByteArrayPool> {
        &self.chunk_pool
    }

    pub fn trim_registry(&self) -> &TrimmableRegistry {
        &self.trim_registry
    }

    /// Executor for decode and transform work.
    pub fn background_executor(&self) -> Arc<dyn Executor> {
        self.background.clone()
    }

    /// Executor for disk and network I/O.
    pub fn io_executor(&self) -> Arc<dyn Executor> {
        self.io.clone()
    }

    pub fn handoff_queue(&self) -> &Arc<HandoffQueue> {
        &self.handoff
    }

    /// Stream copier borrowing scratch buffers from the I/O pool.
    pub fn byte_streams(&self) -> PooledByteStreams {
        PooledByteStreams::new(self.io_pool.clone())
    }

    /// Growable output buffer built from native chunks, for encoded bytes.
    pub fn output_buffer(&self) -> Result<PooledOutputBuffer, PoolError> {
        PooledOutputBuffer::new(self.chunk_pool.clone())
    }

    /// Route `input` through the pipeline's hand-off queue.
    pub fn handoff<T: 'static>(&self, input: Arc<dyn Producer<T>>) -> HandoffProducer<T> {
        HandoffProducer::new(input, self.handoff.clone())
    }

    /// A job scheduler on the background executor using the configured interval.
    pub fn job_scheduler<I: JobInput>(
        &self,
        job: impl Fn(Option<I>, bool) + Send + Sync + 'static,
    ) -> JobScheduler<I> {
        JobScheduler::new(
            self.background.clone(),
            Arc::new(SystemClock),
            self.config.job_min_interval,
            job,
        )
    }

    /// Forward a memory-pressure signal to every registered pool.
    pub fn trim(&self, trim_type: MemoryTrimType) -> usize {
        let trimmed = self.trim_registry.trim(trim_type);
        self.publish_pool_metrics();
        trimmed
    }

    /// Publish current pool byte totals as gauges.
    pub fn publish_pool_metrics(&self) {
        self.io_pool_metrics.record_totals(
            self.io_pool.used().num_bytes,
            self.io_pool.free().num_bytes,
        );
        self.chunk_pool_metrics.record_totals(
            self.chunk_pool.used().num_bytes,
            self.chunk_pool.free().num_bytes,
        );
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        for registration in self.registrations.drain(..) {
            self.trim_registry.unregister(registration);
        }
        self.handoff.resume();
        self.background.signal_shutdown();
        self.io.signal_shutdown();
    }
}
