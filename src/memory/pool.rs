//! Bucketed object pool for scarce reusable buffers.
//!
//! Values are grouped by bucketed size. Released values go back to their
//! bucket's free list and are handed out again by later `get` calls. Every byte
//! the pool has allocated and not yet freed is accounted as either used (held by
//! a caller) or free (sitting in a free list).
//!
//! Uses parking_lot::Mutex for the pool state. Backend `alloc` and `free` always
//! run with the lock released.

use std::collections::{BTreeMap, HashMap};
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;

use super::bucket::SizeBucket;
use super::params::PoolParams;
use super::stats::{NoOpPoolStatsTracker, PoolStatsTracker};
use super::trim::{MemoryTrimType, MemoryTrimmable};
use crate::error::PoolError;

/// Type-specific half of a pool: how values are sized, created and destroyed.
pub trait PoolBackend: Send + Sync {
    type Value: Send;

    /// Allocate a value of exactly `bucketed_size`.
    fn alloc(&self, bucketed_size: usize) -> Result<Self::Value, PoolError>;

    /// Destroy a value. Called for evicted, discarded and unrecognized values.
    fn free(&self, value: Self::Value);

    /// Whether a released value may go back to a free list.
    fn is_reusable(&self, _value: &Self::Value) -> bool {
        true
    }

    /// Round a requested size up to the size of the bucket that serves it.
    fn bucketed_size(&self, requested_size: usize) -> Result<usize, PoolError>;

    fn bucketed_size_for_value(&self, value: &Self::Value) -> usize;

    /// Bytes accounted for one value of `bucketed_size`.
    fn size_in_bytes(&self, bucketed_size: usize) -> usize {
        bucketed_size
    }
}

/// Count of values and their total size in bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Counter {
    pub count: usize,
    pub num_bytes: usize,
}

impl Counter {
    pub fn increment(&mut self, num_bytes: usize) {
        self.count += 1;
        self.num_bytes += num_bytes;
    }

    pub fn decrement(&mut self, num_bytes: usize) {
        if self.count == 0 || self.num_bytes < num_bytes {
            tracing::warn!(
                count = self.count,
                num_bytes = self.num_bytes,
                requested = num_bytes,
                "pool counter underflow"
            );
            self.count = self.count.saturating_sub(1);
            self.num_bytes = self.num_bytes.saturating_sub(num_bytes);
            return;
        }
        self.count -= 1;
        self.num_bytes -= num_bytes;
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Per-bucket view inside [`PoolStats`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BucketStats {
    pub item_size: usize,
    pub max_length: usize,
    pub in_use: usize,
    pub free: usize,
}

/// Point-in-time snapshot of a pool's accounting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub name: String,
    pub used: Counter,
    pub free: Counter,
    pub soft_cap: usize,
    pub hard_cap: usize,
    pub buckets: Vec<BucketStats>,
}

impl PoolStats {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

struct PoolState<V> {
    buckets: BTreeMap<usize, SizeBucket<V>>,
    allow_new_buckets: bool,
    used: Counter,
    free: Counter,
    /// In-use tally for sizes served outside any bucket.
    unbucketed_in_use: HashMap<usize, usize>,
}

impl<V> PoolState<V> {
    fn total_bytes(&self) -> usize {
        self.used.num_bytes + self.free.num_bytes
    }

    fn bucket_mut(&mut self, bucketed_size: usize) -> Option<&mut SizeBucket<V>> {
        if self.allow_new_buckets {
            let bucket = self
                .buckets
                .entry(bucketed_size)
                .or_insert_with(|| SizeBucket::new(bucketed_size, usize::MAX, 0));
            Some(bucket)
        } else {
            self.buckets.get_mut(&bucketed_size)
        }
    }

    fn mark_in_use(&mut self, bucketed_size: usize) {
        match self.bucket_mut(bucketed_size) {
            Some(bucket) => bucket.increment_in_use_count(),
            None => *self.unbucketed_in_use.entry(bucketed_size).or_default() += 1,
        }
    }

    /// Returns false if nothing was recorded as in use for this size.
    fn unmark_in_use(&mut self, bucketed_size: usize) -> bool {
        if let Some(bucket) = self.buckets.get_mut(&bucketed_size) {
            if bucket.in_use_count() == 0 {
                return false;
            }
            bucket.decrement_in_use_count();
            return true;
        }
        match self.unbucketed_in_use.get_mut(&bucketed_size) {
            Some(count) if *count > 0 => {
                *count -= 1;
                if *count == 0 {
                    self.unbucketed_in_use.remove(&bucketed_size);
                }
                true
            }
            _ => false,
        }
    }
}

enum ReleaseOutcome<V> {
    Pooled,
    Discarded(V),
    Unrecognized(V),
}

/// Generic bucketed pool over a [`PoolBackend`].
pub struct BucketedPool<B: PoolBackend> {
    name: String,
    backend: B,
    params: PoolParams,
    state: Mutex<PoolState<B::Value>>,
    stats: Arc<dyn PoolStatsTracker>,
}

impl<B: PoolBackend> BucketedPool<B> {
    pub fn new(name: impl Into<String>, backend: B, params: PoolParams) -> Self {
        Self::with_tracker(name, backend, params, Arc::new(NoOpPoolStatsTracker))
    }

    pub fn with_tracker(
        name: impl Into<String>,
        backend: B,
        params: PoolParams,
        stats: Arc<dyn PoolStatsTracker>,
    ) -> Self {
        let buckets = params
            .bucket_sizes
            .iter()
            .flatten()
            .map(|(&size, &max_length)| (size, SizeBucket::new(size, max_length, 0)))
            .collect();
        let state = PoolState {
            buckets,
            allow_new_buckets: params.allows_new_buckets(),
            used: Counter::default(),
            free: Counter::default(),
            unbucketed_in_use: HashMap::new(),
        };
        Self {
            name: name.into(),
            backend,
            params,
            state: Mutex::new(state),
            stats,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn params(&self) -> &PoolParams {
        &self.params
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn used(&self) -> Counter {
        self.state.lock().used
    }

    pub fn free(&self) -> Counter {
        self.state.lock().free
    }

    /// Get a value of at least `requested_size`, reusing a free one if possible.
    pub fn get(&self, requested_size: usize) -> Result<B::Value, PoolError> {
        if requested_size == 0 || requested_size > self.params.max_bucket_size {
            return Err(PoolError::InvalidSize {
                size: requested_size,
            });
        }
        let bucketed_size = self.backend.bucketed_size(requested_size)?;
        let size_in_bytes = self.backend.size_in_bytes(bucketed_size);

        let mut evicted = Vec::new();
        let reserved = {
            let mut guard = self.state.lock();
            let state = &mut *guard;

            let reused = state.bucket_mut(bucketed_size).and_then(SizeBucket::get);
            if let Some(value) = reused {
                let reused_size = self.backend.bucketed_size_for_value(&value);
                let reused_bytes = self.backend.size_in_bytes(reused_size);
                state.free.decrement(reused_bytes);
                state.used.increment(reused_bytes);
                drop(guard);
                self.stats.on_value_reuse(reused_size);
                tracing::trace!(pool = %self.name, bucketed_size = reused_size, "pool reuse");
                return Ok(value);
            }

            if self.can_allocate(state, size_in_bytes, &mut evicted) {
                state.used.increment(size_in_bytes);
                state.mark_in_use(bucketed_size);
                Ok(())
            } else {
                Err(PoolError::PoolSizeViolation {
                    hard_cap: self.params.max_size_hard_cap,
                    used: state.used.num_bytes,
                    free: state.free.num_bytes,
                    requested: size_in_bytes,
                })
            }
        };
        self.free_values(evicted);
        if let Err(err) = reserved {
            self.stats.on_hard_cap_reached();
            tracing::debug!(pool = %self.name, error = %err, "pool allocation refused");
            return Err(err);
        }

        let value = match self.backend.alloc(bucketed_size) {
            Ok(value) => value,
            Err(err) => {
                let mut state = self.state.lock();
                state.used.decrement(size_in_bytes);
                state.unmark_in_use(bucketed_size);
                return Err(err);
            }
        };
        self.stats.on_alloc(bucketed_size);

        let mut evicted = Vec::new();
        {
            let mut state = self.state.lock();
            self.trim_locked(&mut state, self.params.max_size_soft_cap, &mut evicted);
        }
        self.free_values(evicted);

        tracing::trace!(pool = %self.name, requested_size, bucketed_size, "pool alloc");
        Ok(value)
    }

    /// Same as [`get`](Self::get), wrapped in a handle that releases on drop.
    pub fn get_pooled(self: &Arc<Self>, requested_size: usize) -> Result<PooledValue<B>, PoolError> {
        let value = self.get(requested_size)?;
        Ok(PooledValue {
            value: Some(value),
            pool: Arc::clone(self),
        })
    }

    /// Return a value obtained from [`get`](Self::get).
    pub fn release(&self, value: B::Value) {
        let bucketed_size = self.backend.bucketed_size_for_value(&value);
        let size_in_bytes = self.backend.size_in_bytes(bucketed_size);

        let outcome = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let soft_cap_exceeded = state.total_bytes() > self.params.max_size_soft_cap;

            match state.buckets.get_mut(&bucketed_size) {
                Some(bucket) if bucket.in_use_count() > 0 => {
                    if bucket.is_max_length_exceeded()
                        || soft_cap_exceeded
                        || !self.backend.is_reusable(&value)
                    {
                        bucket.decrement_in_use_count();
                        state.used.decrement(size_in_bytes);
                        ReleaseOutcome::Discarded(value)
                    } else {
                        bucket.release(value);
                        state.free.increment(size_in_bytes);
                        state.used.decrement(size_in_bytes);
                        ReleaseOutcome::Pooled
                    }
                }
                Some(_) => ReleaseOutcome::Unrecognized(value),
                None => {
                    if state.unmark_in_use(bucketed_size) {
                        state.used.decrement(size_in_bytes);
                        ReleaseOutcome::Discarded(value)
                    } else {
                        ReleaseOutcome::Unrecognized(value)
                    }
                }
            }
        };

        match outcome {
            ReleaseOutcome::Pooled => self.stats.on_value_release(bucketed_size),
            ReleaseOutcome::Discarded(value) => {
                self.backend.free(value);
                self.stats.on_free(bucketed_size);
            }
            ReleaseOutcome::Unrecognized(value) => {
                tracing::warn!(pool = %self.name, bucketed_size, "released value was not in use");
                self.backend.free(value);
                self.stats.on_free(bucketed_size);
            }
        }
    }

    /// Free values from the free lists until the pool's total size is at most
    /// `target_bytes` or the free lists are empty.
    pub fn trim_to_size(&self, target_bytes: usize) {
        let mut evicted = Vec::new();
        {
            let mut state = self.state.lock();
            self.trim_locked(&mut state, target_bytes, &mut evicted);
        }
        self.free_values(evicted);
    }

    pub fn trim_to_soft_cap(&self) {
        self.trim_to_size(self.params.max_size_soft_cap);
    }

    /// Free every value on every free list. In-use values are untouched.
    pub fn trim_to_nothing(&self) {
        let evicted: Vec<B::Value> = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let evicted = state
                .buckets
                .values_mut()
                .flat_map(|bucket| bucket.drain_free())
                .collect();
            if state.allow_new_buckets {
                state.buckets.retain(|_, bucket| bucket.in_use_count() > 0);
            }
            state.free.reset();
            evicted
        };
        tracing::debug!(pool = %self.name, freed = evicted.len(), "pool trimmed to nothing");
        self.free_values(evicted);
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        PoolStats {
            name: self.name.clone(),
            used: state.used,
            free: state.free,
            soft_cap: self.params.max_size_soft_cap,
            hard_cap: self.params.max_size_hard_cap,
            buckets: state
                .buckets
                .values()
                .map(|bucket| BucketStats {
                    item_size: bucket.item_size(),
                    max_length: bucket.max_length(),
                    in_use: bucket.in_use_count(),
                    free: bucket.free_list_size(),
                })
                .collect(),
        }
    }

    /// Capacity check for a new allocation of `size_in_bytes`, trimming free
    /// values toward the soft cap when needed.
    fn can_allocate(
        &self,
        state: &mut PoolState<B::Value>,
        size_in_bytes: usize,
        evicted: &mut Vec<B::Value>,
    ) -> bool {
        let hard_cap = self.params.max_size_hard_cap;
        if size_in_bytes > hard_cap.saturating_sub(state.used.num_bytes) {
            return false;
        }

        let soft_cap = self.params.max_size_soft_cap;
        if size_in_bytes > soft_cap.saturating_sub(state.total_bytes()) {
            self.stats.on_soft_cap_reached();
            self.trim_locked(state, soft_cap.saturating_sub(size_in_bytes), evicted);
        }

        size_in_bytes <= hard_cap.saturating_sub(state.total_bytes())
    }

    /// Evicts from the largest bucket first.
    fn trim_locked(
        &self,
        state: &mut PoolState<B::Value>,
        target_bytes: usize,
        evicted: &mut Vec<B::Value>,
    ) {
        let mut bytes_to_free = state
            .total_bytes()
            .saturating_sub(target_bytes)
            .min(state.free.num_bytes);
        if bytes_to_free == 0 {
            return;
        }

        let PoolState { buckets, free, .. } = state;
        for bucket in buckets.values_mut().rev() {
            if bytes_to_free == 0 {
                break;
            }
            let item_bytes = self.backend.size_in_bytes(bucket.item_size());
            while bytes_to_free > 0 {
                let Some(value) = bucket.pop() else { break };
                free.decrement(item_bytes);
                bytes_to_free = bytes_to_free.saturating_sub(item_bytes);
                evicted.push(value);
            }
        }
        tracing::debug!(
            pool = %self.name,
            target_bytes,
            evicted = evicted.len(),
            "pool trimmed"
        );
    }

    fn free_values(&self, values: Vec<B::Value>) {
        for value in values {
            let bucketed_size = self.backend.bucketed_size_for_value(&value);
            self.backend.free(value);
            self.stats.on_free(bucketed_size);
        }
    }
}

impl<B: PoolBackend> MemoryTrimmable for BucketedPool<B> {
    fn trim(&self, _trim_type: MemoryTrimType) {
        self.trim_to_nothing();
    }
}

/// A value borrowed from a pool, released back to it on drop.
pub struct PooledValue<B: PoolBackend> {
    value: Option<B::Value>,
    pool: Arc<BucketedPool<B>>,
}

impl<B: PoolBackend> PooledValue<B> {
    /// Detach the value. The pool keeps counting it as used until it is passed
    /// to [`BucketedPool::release`].
    pub fn into_inner(mut self) -> B::Value {
        match self.value.take() {
            Some(value) => value,
            None => unreachable!("pooled value taken twice"),
        }
    }

    pub fn pool(&self) -> &Arc<BucketedPool<B>> {
        &self.pool
    }
}

impl<B: PoolBackend> Deref for PooledValue<B> {
    type Target = B::Value;

    fn deref(&self) -> &B::Value {
        match &self.value {
            Some(value) => value,
            None => unreachable!("pooled value used after release"),
        }
    }
}

impl<B: PoolBackend> DerefMut for PooledValue<B> {
    fn deref_mut(&mut self) -> &mut B::Value {
        match &mut self.value {
            Some(value) => value,
            None => unreachable!("pooled value used after release"),
        }
    }
}

impl<B: PoolBackend> Drop for PooledValue<B> {
    fn drop(&mut self) {
        if let Some(value) = self.value.take() {
            self.pool.release(value);
        }
    }
}
