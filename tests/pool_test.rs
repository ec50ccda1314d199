//! Integration tests for the bucketed pool.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use imgpipe_core::memory::{
    BucketedPool, ByteArrayPool, MemoryTrimType, MemoryTrimmable, PoolBackend, PoolParams,
    TrimmableRegistry, DEFAULT_IO_BUFFER_SIZE,
};
use imgpipe_core::PoolError;

/// Rounds requests up to the next even size and counts live bytes.
#[derive(Default)]
struct EvenBackend {
    allocs: AtomicUsize,
    frees: AtomicUsize,
    live_bytes: AtomicUsize,
}

impl PoolBackend for EvenBackend {
    type Value = Vec<u8>;

    fn alloc(&self, bucketed_size: usize) -> Result<Vec<u8>, PoolError> {
        self.allocs.fetch_add(1, Ordering::SeqCst);
        self.live_bytes.fetch_add(bucketed_size, Ordering::SeqCst);
        Ok(vec![0; bucketed_size])
    }

    fn free(&self, value: Vec<u8>) {
        self.frees.fetch_add(1, Ordering::SeqCst);
        self.live_bytes.fetch_sub(value.len(), Ordering::SeqCst);
    }

    fn bucketed_size(&self, requested_size: usize) -> Result<usize, PoolError> {
        Ok((requested_size + 1) / 2 * 2)
    }

    fn bucketed_size_for_value(&self, value: &Vec<u8>) -> usize {
        value.len()
    }
}

fn even_pool(soft: usize, hard: usize) -> BucketedPool<EvenBackend> {
    BucketedPool::new("even", EvenBackend::default(), PoolParams::new(soft, hard))
}

fn assert_accounting(pool: &BucketedPool<EvenBackend>) {
    let stats = pool.stats();
    assert_eq!(
        stats.used.num_bytes + stats.free.num_bytes,
        pool.backend().live_bytes.load(Ordering::SeqCst)
    );
}

#[test]
fn get_release_get_reuses_without_alloc() {
    let pool = even_pool(10, 10);

    let value = pool.get(1).unwrap();
    assert_eq!(value.len(), 2);
    assert_eq!(pool.free().num_bytes, 0);
    assert_eq!(pool.used().num_bytes, 2);

    pool.release(value);
    assert_eq!(pool.free().num_bytes, 2);
    assert_eq!(pool.used().num_bytes, 0);

    let again = pool.get(1).unwrap();
    assert_eq!(again.len(), 2);
    assert_eq!(pool.free().num_bytes, 0);
    assert_eq!(pool.used().num_bytes, 2);
    assert_eq!(pool.backend().allocs.load(Ordering::SeqCst), 1);
}

#[test]
fn used_plus_free_tracks_live_bytes() {
    let pool = even_pool(12, 60);
    let mut held = Vec::new();
    for size in [1, 3, 4, 7, 2, 9, 5] {
        held.push(pool.get(size).unwrap());
        assert_accounting(&pool);
    }
    for value in held.drain(..).step_by(2) {
        pool.release(value);
        assert_accounting(&pool);
    }
    for size in [2, 8, 10] {
        held.push(pool.get(size).unwrap());
        assert_accounting(&pool);
    }
    pool.trim_to_nothing();
    assert_accounting(&pool);
    assert_eq!(pool.free().num_bytes, 0);
}

#[test]
fn hard_cap_rejects_growth() {
    let pool = even_pool(4, 5);
    let a = pool.get(2).unwrap();
    let b = pool.get(2).unwrap();

    let err = pool.get(2).unwrap_err();
    assert!(matches!(
        err,
        PoolError::PoolSizeViolation { hard_cap: 5, used: 4, requested: 2, .. }
    ));

    pool.release(a);
    pool.release(b);
    assert_accounting(&pool);
}

#[test]
fn soft_cap_evicts_free_values_before_growing() {
    let pool = even_pool(6, 100);
    let a = pool.get(2).unwrap();
    let b = pool.get(4).unwrap();
    pool.release(a);
    pool.release(b);
    assert_eq!(pool.free().num_bytes, 6);

    let _c = pool.get(6).unwrap();
    assert!(pool.free().num_bytes + pool.used().num_bytes <= 100);
    assert_eq!(pool.free().num_bytes, 0);
    assert_accounting(&pool);
}

#[test]
fn trim_evicts_largest_buckets_first() {
    let pool = even_pool(100, 100);
    let values: Vec<_> = [2, 4, 6].iter().map(|&s| pool.get(s).unwrap()).collect();
    for value in values {
        pool.release(value);
    }
    assert_eq!(pool.free().num_bytes, 12);

    pool.trim_to_size(7);
    let stats = pool.stats();
    let free_sizes: Vec<usize> = stats
        .buckets
        .iter()
        .filter(|bucket| bucket.free > 0)
        .map(|bucket| bucket.item_size)
        .collect();
    assert_eq!(free_sizes, vec![2, 4]);
    assert_eq!(stats.free.num_bytes, 6);
    assert_accounting(&pool);
}

#[test]
fn full_bucket_frees_released_value() {
    let params = PoolParams::with_buckets(100, 100, BTreeMap::from([(2, 1)]));
    let pool = BucketedPool::new("fixed", EvenBackend::default(), params);
    let a = pool.get(2).unwrap();
    let b = pool.get(2).unwrap();

    pool.release(a);
    assert_eq!(pool.backend().frees.load(Ordering::SeqCst), 1);
    pool.release(b);
    assert_eq!(pool.free().count, 1);
    assert_eq!(pool.used().count, 0);
    assert_accounting(&pool);
}

#[test]
fn unknown_value_is_freed_without_accounting_change() {
    let pool = even_pool(10, 10);
    let _held = pool.get(2).unwrap();
    let before = pool.stats();

    pool.release(vec![0; 8]);
    let after = pool.stats();
    assert_eq!(before.used, after.used);
    assert_eq!(before.free, after.free);
    assert_eq!(pool.backend().frees.load(Ordering::SeqCst), 1);
}

#[test]
fn invalid_sizes_are_rejected() {
    let pool = even_pool(10, 10);
    assert_eq!(pool.get(0).unwrap_err(), PoolError::InvalidSize { size: 0 });

    let mut params = PoolParams::new(10, 10);
    params.max_bucket_size = 4;
    let bounded = BucketedPool::new("bounded", EvenBackend::default(), params);
    assert_eq!(bounded.get(5).unwrap_err(), PoolError::InvalidSize { size: 5 });
}

#[test]
fn pooled_value_returns_on_drop() {
    let pool = Arc::new(even_pool(10, 10));
    {
        let mut value = pool.get_pooled(3).unwrap();
        value[0] = 7;
        assert_eq!(pool.used().num_bytes, 4);
    }
    assert_eq!(pool.used().num_bytes, 0);
    assert_eq!(pool.free().num_bytes, 4);
}

#[test]
fn concurrent_get_release_keeps_invariant() {
    let pool = Arc::new(even_pool(64, 256));
    let handles: Vec<_> = (0..4)
        .map(|t| {
            let pool = pool.clone();
            thread::spawn(move || {
                for i in 0..500 {
                    let size = 1 + (i + t) % 16;
                    if let Ok(value) = pool.get(size) {
                        pool.release(value);
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(pool.used().num_bytes, 0);
    assert!(pool.free().num_bytes <= 64);
    assert_accounting(&pool);
}

#[test]
fn small_byte_array_pool_serves_io_buffers() {
    let pool = ByteArrayPool::byte_arrays("io", PoolParams::small_byte_array());
    let buffer = pool.get(100).unwrap();
    assert_eq!(buffer.len(), DEFAULT_IO_BUFFER_SIZE);

    pool.release(buffer);
    assert_eq!(pool.free().num_bytes, DEFAULT_IO_BUFFER_SIZE);

    let reused = pool.get(DEFAULT_IO_BUFFER_SIZE).unwrap();
    assert_eq!(pool.free().num_bytes, 0);
    assert_eq!(pool.used().num_bytes, DEFAULT_IO_BUFFER_SIZE);
    pool.release(reused);
}

#[test]
fn registry_trim_empties_free_lists() {
    let pool = Arc::new(ByteArrayPool::byte_arrays(
        "chunks",
        PoolParams::native_chunk(64 * 1024 * 1024),
    ));
    let registry = TrimmableRegistry::new();
    let trimmable: Arc<dyn MemoryTrimmable> = pool.clone();
    registry.register(&trimmable);

    let held = pool.get(1000).unwrap();
    let released = pool.get(5000).unwrap();
    pool.release(released);
    assert_eq!(pool.free().num_bytes, 8 * 1024);

    assert_eq!(registry.trim(MemoryTrimType::OnAppBackgrounded), 1);
    assert_eq!(pool.free().num_bytes, 0);
    assert_eq!(pool.used().num_bytes, 1024);
    pool.release(held);
}

#[test]
fn stats_export_as_json() {
    let pool = even_pool(10, 10);
    let value = pool.get(3).unwrap();
    let json: serde_json::Value = serde_json::from_str(&pool.stats().to_json()).unwrap();
    assert_eq!(json["name"], "even");
    assert_eq!(json["used"]["num_bytes"], 4);
    pool.release(value);
}
