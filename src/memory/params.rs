//! Pool configuration and the default presets for each pool type.

use std::collections::BTreeMap;

const KB: usize = 1024;
const MB: usize = 1024 * KB;

/// Size of the I/O buffers handed out by the small byte-array pool.
pub const DEFAULT_IO_BUFFER_SIZE: usize = 16 * KB;

/// Configuration for a [`BucketedPool`](super::BucketedPool).
///
/// The soft cap triggers trimming of free values before the pool grows; it
/// never fails an allocation. The hard cap is absolute: a `get` that would
/// push the pool past it fails with `PoolSizeViolation`.
///
/// `bucket_sizes` maps a bucketed size to the bucket's max length. With
/// `Some(map)` the bucket set is fixed and values of other sizes are plain
/// alloc/free; an empty map disables pooling. With `None` buckets are created
/// on demand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolParams {
    pub max_size_soft_cap: usize,
    pub max_size_hard_cap: usize,
    pub bucket_sizes: Option<BTreeMap<usize, usize>>,
    pub min_bucket_size: usize,
    pub max_bucket_size: usize,
}

impl PoolParams {
    /// Params with on-demand buckets.
    pub fn new(max_size_soft_cap: usize, max_size_hard_cap: usize) -> Self {
        Self {
            max_size_soft_cap,
            max_size_hard_cap: max_size_hard_cap.max(max_size_soft_cap),
            bucket_sizes: None,
            min_bucket_size: 0,
            max_bucket_size: usize::MAX,
        }
    }

    /// Params with a fixed bucket set.
    pub fn with_buckets(
        max_size_soft_cap: usize,
        max_size_hard_cap: usize,
        bucket_sizes: BTreeMap<usize, usize>,
    ) -> Self {
        Self {
            bucket_sizes: Some(bucket_sizes),
            ..Self::new(max_size_soft_cap, max_size_hard_cap)
        }
    }

    /// One 16 KiB bucket sized for the fetch and cache threads' I/O buffers.
    pub fn small_byte_array() -> Self {
        let buckets = BTreeMap::from([(DEFAULT_IO_BUFFER_SIZE, 5)]);
        Self::with_buckets(5 * DEFAULT_IO_BUFFER_SIZE, MB, buckets)
    }

    /// Power-of-two chunk buckets from 1 KiB to 1 MiB, capped relative to the
    /// memory budget the process is allowed to use.
    pub fn native_chunk(max_memory: usize) -> Self {
        let mut buckets = BTreeMap::new();
        let mut size = KB;
        while size <= 128 * KB {
            buckets.insert(size, 5);
            size *= 2;
        }
        while size <= MB {
            buckets.insert(size, 2);
            size *= 2;
        }

        let soft_cap = if max_memory < 16 * MB {
            3 * MB
        } else if max_memory < 32 * MB {
            6 * MB
        } else {
            12 * MB
        };
        let hard_cap = if max_memory < 16 * MB {
            max_memory / 2
        } else {
            max_memory / 4 * 3
        };
        Self::with_buckets(soft_cap.min(hard_cap), hard_cap, buckets)
    }

    /// Bitmaps are never reused: soft cap zero and no buckets, so every
    /// get/release is a plain alloc/free bounded by the hard cap.
    pub fn bitmap(max_memory: usize) -> Self {
        let hard_cap = if max_memory > 16 * MB {
            max_memory / 4 * 3
        } else {
            max_memory / 2
        };
        Self::with_buckets(0, hard_cap, BTreeMap::new())
    }

    /// Smallest buffer the pool hands out: the first bucket, else the
    /// minimum bucket size.
    pub fn min_buffer_size(&self) -> usize {
        self.bucket_sizes
            .as_ref()
            .and_then(|sizes| sizes.keys().next().copied())
            .unwrap_or(self.min_bucket_size)
            .max(1)
    }

    /// Returns true if buckets may be created on demand.
    pub fn allows_new_buckets(&self) -> bool {
        self.bucket_sizes.is_none()
    }
}

impl Default for PoolParams {
    fn default() -> Self {
        Self::small_byte_array()
    }
}
