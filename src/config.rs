//! Runtime configuration loading from environment variables.
//!
//! All configuration values are loaded from `IMGPIPE_*` environment variables
//! with sensible defaults. Invalid values fall back to defaults without crashing.
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |---|---|---|
//! | `IMGPIPE_IO_POOL_SOFT_CAP` | 81920 | I/O buffer pool soft cap (bytes) |
//! | `IMGPIPE_IO_POOL_HARD_CAP` | 1048576 | I/O buffer pool hard cap (bytes) |
//! | `IMGPIPE_CHUNK_POOL_MAX_MEMORY` | 67108864 | Memory budget the chunk pool caps derive from (bytes) |
//! | `IMGPIPE_WORKER_THREADS` | 0 | Background worker threads (0 = auto) |
//! | `IMGPIPE_JOB_MIN_INTERVAL_MS` | 100 | Minimum gap between two job runs (ms) |
//! | `IMGPIPE_LOG_LEVEL` | info | Log filter directive |
//! | `IMGPIPE_LOG_FORMAT` | json | `json` or `pretty` |
//! | `IMGPIPE_LOG_FILE` | unset | Log to this file instead of stderr |

use std::path::PathBuf;
use std::time::Duration;

use crate::memory::{PoolParams, DEFAULT_IO_BUFFER_SIZE};
use crate::telemetry::{LogConfig, LogFormat};

const MB: usize = 1024 * 1024;

/// Everything a [`Pipeline`](crate::Pipeline) is built from.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Params of the small I/O buffer pool.
    pub io_pool: PoolParams,
    /// Memory budget for the native chunk pool.
    pub chunk_pool_max_memory: usize,
    /// Background worker threads (0 = one per CPU).
    pub worker_threads: usize,
    /// Minimum gap between two runs of a scheduled job.
    pub job_min_interval: Duration,
    pub log: LogConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            io_pool: PoolParams::small_byte_array(),
            chunk_pool_max_memory: 64 * MB,
            worker_threads: 0,
            job_min_interval: Duration::from_millis(100),
            log: LogConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Params of the native chunk pool.
    pub fn chunk_pool(&self) -> PoolParams {
        PoolParams::native_chunk(self.chunk_pool_max_memory)
    }
}

/// Parse a `usize` env var, returning `default` on missing or invalid.
fn parse_usize(key: &str, default: usize) -> usize {
    match std::env::var(key) {
        Ok(val) => val.parse::<usize>().unwrap_or(default),
        Err(_) => default,
    }
}

/// Parse a `u64` env var, returning `default` on missing or invalid.
fn parse_u64(key: &str, default: u64) -> u64 {
    match std::env::var(key) {
        Ok(val) => val.parse::<u64>().unwrap_or(default),
        Err(_) => default,
    }
}

/// Load I/O pool params from environment.
fn load_io_pool() -> PoolParams {
    let defaults = PoolParams::small_byte_array();
    let soft = parse_usize("IMGPIPE_IO_POOL_SOFT_CAP", defaults.max_size_soft_cap);
    let hard = parse_usize("IMGPIPE_IO_POOL_HARD_CAP", defaults.max_size_hard_cap);
    let hard = hard.max(DEFAULT_IO_BUFFER_SIZE); // floor: one buffer
    let soft = soft.min(hard);
    PoolParams {
        max_size_soft_cap: soft,
        max_size_hard_cap: hard,
        ..defaults
    }
}

/// Load logging configuration from environment.
fn load_log_config() -> LogConfig {
    let level = std::env::var("IMGPIPE_LOG_LEVEL")
        .ok()
        .filter(|level| !level.trim().is_empty())
        .unwrap_or_else(|| "info".to_string());
    let format = std::env::var("IMGPIPE_LOG_FORMAT")
        .ok()
        .and_then(|format| format.parse::<LogFormat>().ok())
        .unwrap_or_default();
    let output_path = std::env::var_os("IMGPIPE_LOG_FILE")
        .filter(|path| !path.is_empty())
        .map(PathBuf::from);
    LogConfig {
        format,
        level,
        output_path,
    }
}

/// Load all configuration from environment variables.
///
/// Missing or invalid values fall back to safe defaults without panicking.
pub fn load() -> PipelineConfig {
    let defaults = PipelineConfig::default();
    let chunk_pool_max_memory =
        parse_usize("IMGPIPE_CHUNK_POOL_MAX_MEMORY", defaults.chunk_pool_max_memory);
    let chunk_pool_max_memory = chunk_pool_max_memory.max(4 * MB); // floor: 4MB
    let worker_threads = parse_usize("IMGPIPE_WORKER_THREADS", defaults.worker_threads);
    let worker_threads = worker_threads.min(256);
    let interval_ms = parse_u64("IMGPIPE_JOB_MIN_INTERVAL_MS", 100);

    PipelineConfig {
        io_pool: load_io_pool(),
        chunk_pool_max_memory,
        worker_threads,
        job_min_interval: Duration::from_millis(interval_ms),
        log: load_log_config(),
    }
}
