// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Pooled byte buffers.
//!
//! - [`Buffer`] - Fixed-capacity byte region with a position/limit cursor
//! - [`BufferPool`] - Power-of-two size-class pool partitioned per worker slot

mod buf;
mod pool;

pub use buf::Buffer;
pub use pool::{BufferPool, PoolStats, MIN_CLASS_SIZE};
