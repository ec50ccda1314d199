//! Per-size free list owned by a single pool.

use std::collections::VecDeque;

/// Free list and in-use tally for values of one bucketed size.
///
/// The bucket's length is `in_use + free_list.len()`. `max_length` only
/// governs the release path: a value released to a full bucket is freed
/// instead of being kept.
#[derive(Debug)]
pub struct SizeBucket<V> {
    item_size: usize,
    max_length: usize,
    free_list: VecDeque<V>,
    in_use: usize,
}

impl<V> SizeBucket<V> {
    pub fn new(item_size: usize, max_length: usize, in_use: usize) -> Self {
        debug_assert!(item_size > 0, "bucket item size must be positive");
        Self {
            item_size,
            max_length,
            free_list: VecDeque::new(),
            in_use,
        }
    }

    /// Size in bytes of each value in this bucket.
    pub fn item_size(&self) -> usize {
        self.item_size
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }

    pub fn in_use_count(&self) -> usize {
        self.in_use
    }

    pub fn free_list_size(&self) -> usize {
        self.free_list.len()
    }

    pub fn is_max_length_exceeded(&self) -> bool {
        self.in_use + self.free_list.len() > self.max_length
    }

    /// Take a free value and count it as in use.
    pub fn get(&mut self) -> Option<V> {
        let value = self.pop()?;
        self.in_use += 1;
        Some(value)
    }

    /// Take a free value without touching the in-use count (eviction path).
    pub fn pop(&mut self) -> Option<V> {
        self.free_list.pop_front()
    }

    /// Return an in-use value to the free list.
    pub fn release(&mut self, value: V) {
        self.decrement_in_use_count();
        self.free_list.push_back(value);
    }

    pub fn increment_in_use_count(&mut self) {
        self.in_use += 1;
    }

    pub fn decrement_in_use_count(&mut self) {
        if self.in_use == 0 {
            tracing::warn!(item_size = self.item_size, "bucket in-use count underflow");
            return;
        }
        self.in_use -= 1;
    }

    /// Drain every free value, leaving the in-use tally untouched.
    pub(crate) fn drain_free(&mut self) -> impl Iterator<Item = V> + '_ {
        self.free_list.drain(..)
    }
}
