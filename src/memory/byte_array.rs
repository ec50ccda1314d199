//! Byte buffer backend for [`BucketedPool`](super::BucketedPool).

use super::params::PoolParams;
use super::pool::{BucketedPool, PoolBackend};
use crate::error::PoolError;

/// Pool of `Vec<u8>` buffers used for I/O and encoded image chunks.
pub type ByteArrayPool = BucketedPool<ByteArrayBackend>;

/// Serves requests from the smallest configured bucket that fits. Sizes larger
/// than every bucket are allocated exactly, never below `min_bucket_size`.
///
/// With on-demand buckets every exact-capacity buffer is reusable.
#[derive(Debug, Clone)]
pub struct ByteArrayBackend {
    bucket_sizes: Vec<usize>,
    fixed_buckets: bool,
    min_bucket_size: usize,
}

impl ByteArrayBackend {
    pub fn new(params: &PoolParams) -> Self {
        let bucket_sizes = params
            .bucket_sizes
            .iter()
            .flat_map(|sizes| sizes.keys().copied())
            .collect();
        Self {
            bucket_sizes,
            fixed_buckets: !params.allows_new_buckets(),
            min_bucket_size: params.min_bucket_size,
        }
    }
}

impl PoolBackend for ByteArrayBackend {
    type Value = Vec<u8>;

    fn alloc(&self, bucketed_size: usize) -> Result<Vec<u8>, PoolError> {
        let mut buffer = Vec::new();
        buffer
            .try_reserve_exact(bucketed_size)
            .map_err(|e| PoolError::AllocationFailed {
                bucketed_size,
                reason: e.to_string(),
            })?;
        buffer.resize(bucketed_size, 0);
        Ok(buffer)
    }

    fn free(&self, value: Vec<u8>) {
        drop(value);
    }

    /// Buffers truncated below their capacity are not kept.
    fn is_reusable(&self, value: &Vec<u8>) -> bool {
        value.len() == value.capacity()
            && (!self.fixed_buckets || self.bucket_sizes.binary_search(&value.len()).is_ok())
    }

    fn bucketed_size(&self, requested_size: usize) -> Result<usize, PoolError> {
        if requested_size == 0 {
            return Err(PoolError::InvalidSize {
                size: requested_size,
            });
        }
        let size = self
            .bucket_sizes
            .iter()
            .copied()
            .find(|&bucket| bucket >= requested_size)
            .unwrap_or(requested_size);
        Ok(size.max(self.min_bucket_size))
    }

    /// Sized by capacity so a truncated buffer still maps to its bucket.
    fn bucketed_size_for_value(&self, value: &Vec<u8>) -> usize {
        value.capacity()
    }
}

impl ByteArrayPool {
    /// Byte array pool configured from `params`.
    pub fn byte_arrays(name: impl Into<String>, params: PoolParams) -> Self {
        let backend = ByteArrayBackend::new(&params);
        BucketedPool::new(name, backend, params)
    }
}
