//! Byte streams backed by a [`ByteArrayPool`].
//!
//! [`PooledByteStreams`] copies between readers and writers through a pooled
//! scratch buffer. [`PooledOutputBuffer`] accumulates written bytes in pooled
//! buffers and freezes into an immutable [`PooledByteBuffer`]. Every buffer
//! goes back to its pool when the owning handle drops.

use std::io::{self, Cursor, Read, Write};
use std::sync::Arc;

use super::byte_array::{ByteArrayBackend, ByteArrayPool};
use super::params::DEFAULT_IO_BUFFER_SIZE;
use super::pool::PooledValue;
use crate::error::PoolError;

/// Copies streams through a scratch buffer borrowed from a pool.
#[derive(Clone)]
pub struct PooledByteStreams {
    pool: Arc<ByteArrayPool>,
    temp_buf_size: usize,
}

impl PooledByteStreams {
    /// Copier using one I/O buffer per copy.
    pub fn new(pool: Arc<ByteArrayPool>) -> Self {
        Self {
            pool,
            temp_buf_size: DEFAULT_IO_BUFFER_SIZE,
        }
    }

    pub fn with_temp_buf_size(pool: Arc<ByteArrayPool>, temp_buf_size: usize) -> Result<Self, PoolError> {
        if temp_buf_size == 0 {
            return Err(PoolError::InvalidSize { size: 0 });
        }
        Ok(Self {
            pool,
            temp_buf_size,
        })
    }

    pub fn temp_buf_size(&self) -> usize {
        self.temp_buf_size
    }

    /// Copy `from` into `to` until `from` is exhausted. Returns bytes copied.
    pub fn copy<R, W>(&self, from: &mut R, to: &mut W) -> io::Result<u64>
    where
        R: Read + ?Sized,
        W: Write + ?Sized,
    {
        self.copy_limited(from, to, u64::MAX)
    }

    /// Copy at most `bytes_to_copy` bytes. Stops early if `from` runs dry.
    pub fn copy_n<R, W>(&self, from: &mut R, to: &mut W, bytes_to_copy: u64) -> io::Result<u64>
    where
        R: Read + ?Sized,
        W: Write + ?Sized,
    {
        self.copy_limited(from, to, bytes_to_copy)
    }

    fn copy_limited<R, W>(&self, from: &mut R, to: &mut W, limit: u64) -> io::Result<u64>
    where
        R: Read + ?Sized,
        W: Write + ?Sized,
    {
        if limit == 0 {
            return Ok(0);
        }
        let mut scratch = self.pool.get_pooled(self.temp_buf_size)?;
        let scratch = &mut scratch[..self.temp_buf_size];

        let mut copied = 0u64;
        while copied < limit {
            let want = usize::try_from(limit - copied).map_or(scratch.len(), |n| n.min(scratch.len()));
            let read = match from.read(&mut scratch[..want]) {
                Ok(0) => break,
                Ok(read) => read,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            };
            to.write_all(&scratch[..read])?;
            copied += read as u64;
        }
        Ok(copied)
    }
}

/// Growable output that keeps its bytes in a pooled buffer.
///
/// Growing borrows a larger buffer, copies the written prefix and returns the
/// old one. Capacity doubles up to the pool's `max_bucket_size`; writes past
/// that fail with `InvalidInput`.
pub struct PooledOutputBuffer {
    pool: Arc<ByteArrayPool>,
    buffer: PooledValue<ByteArrayBackend>,
    count: usize,
}

impl PooledOutputBuffer {
    /// Starts from the pool's smallest buffer.
    pub fn new(pool: Arc<ByteArrayPool>) -> Result<Self, PoolError> {
        let initial = pool.params().min_buffer_size();
        Self::with_capacity(pool, initial)
    }

    pub fn with_capacity(pool: Arc<ByteArrayPool>, initial_capacity: usize) -> Result<Self, PoolError> {
        let buffer = pool.get_pooled(initial_capacity)?;
        Ok(Self {
            pool,
            buffer,
            count: 0,
        })
    }

    /// Bytes written so far.
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buffer[..self.count]
    }

    /// Make room for `new_len` bytes in total.
    pub fn reserve_total(&mut self, new_len: usize) -> Result<(), PoolError> {
        let capacity = self.buffer.len();
        if new_len <= capacity {
            return Ok(());
        }
        let max = self.pool.params().max_bucket_size;
        let target = capacity.saturating_mul(2).min(max).max(new_len);
        let mut grown = self.pool.get_pooled(target)?;
        grown[..self.count].copy_from_slice(&self.buffer[..self.count]);
        tracing::trace!(pool = %self.pool.name(), from = capacity, to = grown.len(), "output buffer grown");
        // The old buffer returns to the pool here.
        self.buffer = grown;
        Ok(())
    }

    /// Freeze the written bytes. The buffer stays checked out until the
    /// returned handle drops.
    pub fn into_byte_buffer(self) -> PooledByteBuffer {
        PooledByteBuffer {
            buffer: self.buffer,
            size: self.count,
        }
    }
}

impl Write for PooledOutputBuffer {
    fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
        if bytes.is_empty() {
            return Ok(0);
        }
        let end = self
            .count
            .checked_add(bytes.len())
            .ok_or_else(|| io::Error::from(io::ErrorKind::InvalidInput))?;
        self.reserve_total(end)?;
        self.buffer[self.count..end].copy_from_slice(bytes);
        self.count = end;
        Ok(bytes.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Immutable bytes held in a pooled buffer.
pub struct PooledByteBuffer {
    buffer: PooledValue<ByteArrayBackend>,
    size: usize,
}

impl PooledByteBuffer {
    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buffer[..self.size]
    }

    /// Byte at `offset`, or `None` past the end.
    pub fn read_byte(&self, offset: usize) -> Option<u8> {
        self.as_slice().get(offset).copied()
    }

    /// Copy bytes starting at `offset` into `out`. Returns bytes copied.
    pub fn read_at(&self, offset: usize, out: &mut [u8]) -> usize {
        let available = self.as_slice().get(offset..).unwrap_or_default();
        let n = available.len().min(out.len());
        out[..n].copy_from_slice(&available[..n]);
        n
    }

    /// Seekable reader over the bytes.
    pub fn reader(&self) -> Cursor<&[u8]> {
        Cursor::new(self.as_slice())
    }
}

impl AsRef<[u8]> for PooledByteBuffer {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl std::fmt::Debug for PooledByteBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledByteBuffer")
            .field("size", &self.size)
            .field("capacity", &self.buffer.len())
            .finish()
    }
}
