//! Pool event tracking.
//!
//! Trackers receive every allocation, reuse, release and free the pool performs.
//! The metrics-backed tracker exports them through the `metrics` facade labelled
//! by pool name; no recorder is installed here.

use metrics::{counter, gauge};

/// Receiver of pool events. Implementations must not call back into the pool.
pub trait PoolStatsTracker: Send + Sync {
    fn on_value_reuse(&self, bucketed_size: usize);
    fn on_soft_cap_reached(&self);
    fn on_hard_cap_reached(&self);
    fn on_alloc(&self, bucketed_size: usize);
    fn on_free(&self, bucketed_size: usize);
    fn on_value_release(&self, bucketed_size: usize);
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpPoolStatsTracker;

impl PoolStatsTracker for NoOpPoolStatsTracker {
    fn on_value_reuse(&self, _bucketed_size: usize) {}
    fn on_soft_cap_reached(&self) {}
    fn on_hard_cap_reached(&self) {}
    fn on_alloc(&self, _bucketed_size: usize) {}
    fn on_free(&self, _bucketed_size: usize) {}
    fn on_value_release(&self, _bucketed_size: usize) {}
}

/// Exports pool events as `imgpipe_pool_*` counters.
#[derive(Debug, Clone)]
pub struct MetricsPoolStatsTracker {
    pool: String,
}

impl MetricsPoolStatsTracker {
    pub fn new(pool: impl Into<String>) -> Self {
        Self { pool: pool.into() }
    }

    /// Publish the pool's current byte totals as gauges.
    pub fn record_totals(&self, used_bytes: usize, free_bytes: usize) {
        gauge!("imgpipe_pool_used_bytes", "pool" => self.pool.clone()).set(used_bytes as f64);
        gauge!("imgpipe_pool_free_bytes", "pool" => self.pool.clone()).set(free_bytes as f64);
    }
}

impl PoolStatsTracker for MetricsPoolStatsTracker {
    fn on_value_reuse(&self, _bucketed_size: usize) {
        counter!("imgpipe_pool_reuse_total", "pool" => self.pool.clone()).increment(1);
    }

    fn on_soft_cap_reached(&self) {
        counter!("imgpipe_pool_soft_cap_total", "pool" => self.pool.clone()).increment(1);
    }

    fn on_hard_cap_reached(&self) {
        counter!("imgpipe_pool_hard_cap_total", "pool" => self.pool.clone()).increment(1);
    }

    fn on_alloc(&self, bucketed_size: usize) {
        counter!("imgpipe_pool_alloc_total", "pool" => self.pool.clone()).increment(1);
        counter!("imgpipe_pool_alloc_bytes_total", "pool" => self.pool.clone())
            .increment(bucketed_size as u64);
    }

    fn on_free(&self, bucketed_size: usize) {
        counter!("imgpipe_pool_free_total", "pool" => self.pool.clone()).increment(1);
        counter!("imgpipe_pool_free_bytes_total", "pool" => self.pool.clone())
            .increment(bucketed_size as u64);
    }

    fn on_value_release(&self, _bucketed_size: usize) {
        counter!("imgpipe_pool_release_total", "pool" => self.pool.clone()).increment(1);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Counts events so pool tests can assert on allocation behavior.
    #[derive(Debug, Default)]
    pub struct CountingTracker {
        pub reuses: AtomicUsize,
        pub allocs: AtomicUsize,
        pub frees: AtomicUsize,
        pub releases: AtomicUsize,
        pub soft_caps: AtomicUsize,
        pub hard_caps: AtomicUsize,
    }

    impl PoolStatsTracker for CountingTracker {
        fn on_value_reuse(&self, _: usize) {
            self.reuses.fetch_add(1, Ordering::SeqCst);
        }
        fn on_soft_cap_reached(&self) {
            self.soft_caps.fetch_add(1, Ordering::SeqCst);
        }
        fn on_hard_cap_reached(&self) {
            self.hard_caps.fetch_add(1, Ordering::SeqCst);
        }
        fn on_alloc(&self, _: usize) {
            self.allocs.fetch_add(1, Ordering::SeqCst);
        }
        fn on_free(&self, _: usize) {
            self.frees.fetch_add(1, Ordering::SeqCst);
        }
        fn on_value_release(&self, _: usize) {
            self.releases.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn metrics_tracker_without_recorder_is_silent() {
        let tracker = MetricsPoolStatsTracker::new("io");
        tracker.on_alloc(16);
        tracker.on_free(16);
        tracker.record_totals(16, 0);
    }
}
