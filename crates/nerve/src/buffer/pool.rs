// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Size-class buffer pool.
//!
//! Capacities are powers of two starting at [`MIN_CLASS_SIZE`]. Every worker
//! slot owns its own set of per-class free-lists, so leasing and releasing on
//! the hot path never touches another worker's cache.
//!
//! # Design
//! - **Bounded:** each class keeps at most `depth` idle buffers; extras are dropped
//! - **Lock-free:** free-lists are crossbeam `ArrayQueue` rings
//! - **Capped:** requests above `max_size` fail with [`Error::Capacity`]

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam::queue::ArrayQueue;

use super::Buffer;
use crate::error::{Error, Result};

/// Smallest size class.
pub const MIN_CLASS_SIZE: usize = 32;

const MIN_CLASS_SHIFT: u32 = MIN_CLASS_SIZE.trailing_zeros();

/// Capacity of the size class serving `size` bytes.
#[inline]
fn class_capacity(size: usize) -> usize {
    size.max(MIN_CLASS_SIZE).next_power_of_two()
}

/// Free-list index of a class capacity.
#[inline]
fn class_index(capacity: usize) -> usize {
    (capacity.trailing_zeros() - MIN_CLASS_SHIFT) as usize
}

/// Per-slot caches, one ring per size class.
struct SlotCache {
    classes: Vec<ArrayQueue<Buffer>>,
}

impl SlotCache {
    fn new(class_count: usize, depth: usize) -> Self {
        let classes = if depth == 0 {
            Vec::new()
        } else {
            (0..class_count).map(|_| ArrayQueue::new(depth)).collect()
        };
        Self { classes }
    }
}

/// Buffer pool partitioned by worker slot.
///
/// # Example
/// ```
/// use nerve::buffer::BufferPool;
///
/// let pool = BufferPool::new(1024, 4, 1);
/// let buf = pool.lease(0, 100).unwrap();
/// assert_eq!(buf.capacity(), 128);
/// assert_eq!(buf.remaining(), 100);
/// pool.release(0, buf);
/// ```
pub struct BufferPool {
    slots: Vec<SlotCache>,
    max_size: usize,
    depth: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    discards: AtomicU64,
}

impl BufferPool {
    /// Create a pool serving requests up to `max_size` bytes.
    ///
    /// `partitions` is the number of worker slots (at least one is created).
    pub fn new(max_size: usize, depth: usize, partitions: usize) -> Self {
        let class_count = class_index(class_capacity(max_size)) + 1;
        let slots = (0..partitions.max(1))
            .map(|_| SlotCache::new(class_count, depth))
            .collect();
        Self {
            slots,
            max_size,
            depth,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            discards: AtomicU64::new(0),
        }
    }

    /// Largest request served.
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Idle buffers kept per class per slot.
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Number of worker slots.
    pub fn partitions(&self) -> usize {
        self.slots.len()
    }

    fn slot(&self, slot: usize) -> &SlotCache {
        &self.slots[slot % self.slots.len()]
    }

    /// Lease a buffer with exactly `size` usable bytes.
    ///
    /// The buffer comes from `slot`'s cache when one is idle, otherwise it is
    /// freshly allocated.
    pub fn lease(&self, slot: usize, size: usize) -> Result<Buffer> {
        if size > self.max_size {
            return Err(Error::Capacity {
                requested: size,
                max: self.max_size,
            });
        }

        let capacity = class_capacity(size);
        let cached = self
            .slot(slot)
            .classes
            .get(class_index(capacity))
            .and_then(ArrayQueue::pop);

        let mut buf = match cached {
            Some(buf) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                buf
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                Buffer::with_capacity(capacity)
            }
        };
        buf.reset(size);
        Ok(buf)
    }

    /// Return a buffer to `slot`'s cache, or drop it if the class is full.
    pub fn release(&self, slot: usize, buf: Buffer) {
        let capacity = buf.capacity();
        if !capacity.is_power_of_two() || capacity < MIN_CLASS_SIZE {
            return;
        }
        let retained = match self.slot(slot).classes.get(class_index(capacity)) {
            Some(ring) => ring.push(buf).is_ok(),
            None => false,
        };
        if !retained {
            self.discards.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Cache statistics.
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            discards: self.discards.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("max_size", &self.max_size)
            .field("depth", &self.depth)
            .field("partitions", &self.slots.len())
            .finish()
    }
}

/// Buffer pool counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Leases served from a cache
    pub hits: u64,
    /// Leases that allocated
    pub misses: u64,
    /// Releases dropped because the class cache was full
    pub discards: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_bounds() {
        let pool = BufferPool::new(1 << 16, 4, 1);
        for size in 0..=5000usize {
            let buf = pool.lease(0, size).expect("lease within max");
            assert!(buf.capacity() >= size);
            assert!(buf.capacity() >= MIN_CLASS_SIZE);
            assert!(buf.capacity().is_power_of_two());
            if size > MIN_CLASS_SIZE {
                assert!(buf.capacity() < 2 * size, "size {size}");
            }
            assert_eq!(buf.remaining(), size);
            assert_eq!(buf.position(), 0);
        }
    }

    #[test]
    fn test_capacity_error() {
        let pool = BufferPool::new(1024, 4, 1);
        assert!(pool.lease(0, 1024).is_ok());
        match pool.lease(0, 1025) {
            Err(Error::Capacity { requested, max }) => {
                assert_eq!(requested, 1025);
                assert_eq!(max, 1024);
            }
            other => panic!("expected capacity error, got {other:?}"),
        }
        match pool.lease(0, usize::MAX) {
            Err(Error::Capacity { .. }) => {}
            other => panic!("expected capacity error, got {other:?}"),
        }
    }

    #[test]
    fn test_reuse_from_cache() {
        let pool = BufferPool::new(1024, 4, 1);
        let buf = pool.lease(0, 100).unwrap();
        pool.release(0, buf);

        let again = pool.lease(0, 70).unwrap();
        assert_eq!(again.capacity(), 128);
        assert_eq!(again.remaining(), 70);

        let stats = pool.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 1);
    }

    #[test]
    fn test_depth_is_bounded() {
        let pool = BufferPool::new(1024, 2, 1);
        let bufs: Vec<_> = (0..5).map(|_| pool.lease(0, 64).unwrap()).collect();
        for buf in bufs {
            pool.release(0, buf);
        }
        assert_eq!(pool.stats().discards, 3);
    }

    #[test]
    fn test_zero_depth_never_retains() {
        let pool = BufferPool::new(1024, 0, 1);
        let buf = pool.lease(0, 64).unwrap();
        pool.release(0, buf);
        assert_eq!(pool.stats().discards, 1);
        let _ = pool.lease(0, 64).unwrap();
        assert_eq!(pool.stats().hits, 0);
    }

    #[test]
    fn test_slots_are_isolated() {
        let pool = BufferPool::new(1024, 4, 2);
        let buf = pool.lease(0, 64).unwrap();
        pool.release(0, buf);

        let _ = pool.lease(1, 64).unwrap();
        assert_eq!(pool.stats().hits, 0);
        let _ = pool.lease(0, 64).unwrap();
        assert_eq!(pool.stats().hits, 1);
    }
}
