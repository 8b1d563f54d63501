// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Fixed-capacity byte buffer with a fill cursor.

use std::fmt;

/// Byte region leased from a [`BufferPool`](super::BufferPool).
///
/// `position` counts bytes filled (or drained), `limit` bounds the usable
/// region. Capacity is the size class and never changes.
pub struct Buffer {
    bytes: Box<[u8]>,
    position: usize,
    limit: usize,
}

impl Buffer {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            bytes: vec![0u8; capacity].into_boxed_slice(),
            position: 0,
            limit: capacity,
        }
    }

    /// Rewind to position 0 with `limit` usable bytes.
    pub(crate) fn reset(&mut self, limit: usize) {
        debug_assert!(limit <= self.bytes.len());
        self.position = 0;
        self.limit = limit;
    }

    /// Size class of this buffer.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.bytes.len()
    }

    /// Usable bytes.
    #[inline]
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Bytes filled (or drained) so far.
    #[inline]
    pub fn position(&self) -> usize {
        self.position
    }

    /// Bytes between position and limit.
    #[inline]
    pub fn remaining(&self) -> usize {
        self.limit - self.position
    }

    #[inline]
    pub fn has_remaining(&self) -> bool {
        self.position < self.limit
    }

    /// Bytes before the position.
    #[inline]
    pub fn filled(&self) -> &[u8] {
        &self.bytes[..self.position]
    }

    /// Bytes between position and limit.
    #[inline]
    pub fn chunk(&self) -> &[u8] {
        &self.bytes[self.position..self.limit]
    }

    /// Writable bytes between position and limit.
    #[inline]
    pub fn chunk_mut(&mut self) -> &mut [u8] {
        &mut self.bytes[self.position..self.limit]
    }

    /// Move the position forward by `n` bytes, clamped to the limit.
    #[inline]
    pub fn advance(&mut self, n: usize) {
        self.position = (self.position + n).min(self.limit);
    }

    /// Switch from filling to draining: limit becomes the filled length.
    pub fn flip(&mut self) {
        self.limit = self.position;
        self.position = 0;
    }

    /// Drop the first `n` filled bytes, shifting the rest to the front.
    pub fn discard_front(&mut self, n: usize) {
        let n = n.min(self.position);
        self.bytes.copy_within(n..self.position, 0);
        self.position -= n;
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("capacity", &self.capacity())
            .field("position", &self.position)
            .field("limit", &self.limit)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fill_and_flip() {
        let mut buf = Buffer::with_capacity(32);
        buf.reset(6);
        assert_eq!(buf.remaining(), 6);

        buf.chunk_mut()[..4].copy_from_slice(&[1, 2, 3, 4]);
        buf.advance(4);
        assert_eq!(buf.filled(), &[1, 2, 3, 4]);
        assert_eq!(buf.remaining(), 2);

        buf.flip();
        assert_eq!(buf.chunk(), &[1, 2, 3, 4]);
        buf.advance(3);
        assert_eq!(buf.chunk(), &[4]);
    }

    #[test]
    fn test_advance_clamps_to_limit() {
        let mut buf = Buffer::with_capacity(32);
        buf.reset(4);
        buf.advance(10);
        assert_eq!(buf.position(), 4);
        assert!(!buf.has_remaining());
    }

    #[test]
    fn test_discard_front() {
        let mut buf = Buffer::with_capacity(32);
        buf.reset(4);
        buf.chunk_mut().copy_from_slice(&[9, 9, 0xAA, 0x55]);
        buf.advance(4);

        buf.discard_front(2);
        assert_eq!(buf.filled(), &[0xAA, 0x55]);
        assert_eq!(buf.remaining(), 2);
    }
}
