// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Engine configuration.
//!
//! # Example
//!
//! ```
//! use nerve::EngineConfig;
//! use std::time::Duration;
//!
//! let config = EngineConfig::default()
//!     .with_reactors(2)
//!     .with_dispatch_workers(4)
//!     .with_linger(Duration::from_millis(500));
//! assert!(config.validate().is_ok());
//! ```

use std::thread;
use std::time::Duration;

use crate::error::{Error, Result};

/// Default number of idle buffers retained per size class per worker slot.
pub const DEFAULT_BUFFER_DEPTH: usize = 4;

/// Engine configuration.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    // === Threads ===
    /// Number of reactors (one readiness-wait thread each)
    pub reactors: usize,

    /// Number of I/O worker threads running read/write tasks
    pub io_workers: usize,

    /// Number of dispatcher worker threads running handlers
    pub dispatch_workers: usize,

    // === Buffers ===
    /// Idle buffers kept per size class per I/O worker slot
    pub buffer_depth: usize,

    // === Reactor ===
    /// Readiness events drained per wait
    pub events_capacity: usize,

    // === Sockets ===
    /// Enable TCP_NODELAY on accepted and connected sockets
    pub nodelay: bool,

    /// Listen backlog (pending connection queue size)
    pub listen_backlog: i32,

    // === Shutdown ===
    /// Drain deadline applied when the peer closes its write side
    pub linger: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let cores = thread::available_parallelism().map_or(1, |n| n.get());
        Self {
            reactors: cores,
            io_workers: cores * 2,
            dispatch_workers: cores,

            buffer_depth: DEFAULT_BUFFER_DEPTH,

            events_capacity: 256,

            nodelay: true, // Low latency
            listen_backlog: 1024,

            linger: Duration::from_secs(5),
        }
    }
}

impl EngineConfig {
    /// Builder: set reactor count
    pub fn with_reactors(mut self, reactors: usize) -> Self {
        self.reactors = reactors;
        self
    }

    /// Builder: set I/O worker count
    pub fn with_io_workers(mut self, workers: usize) -> Self {
        self.io_workers = workers;
        self
    }

    /// Builder: set dispatcher worker count
    pub fn with_dispatch_workers(mut self, workers: usize) -> Self {
        self.dispatch_workers = workers;
        self
    }

    /// Builder: set per-class buffer cache depth
    pub fn with_buffer_depth(mut self, depth: usize) -> Self {
        self.buffer_depth = depth;
        self
    }

    /// Builder: set TCP_NODELAY
    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }

    /// Builder: set listen backlog
    pub fn with_listen_backlog(mut self, backlog: i32) -> Self {
        self.listen_backlog = backlog;
        self
    }

    /// Builder: set end-of-stream drain deadline
    pub fn with_linger(mut self, linger: Duration) -> Self {
        self.linger = linger;
        self
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        if self.reactors == 0 {
            return Err(Error::Config("reactors must be > 0".into()));
        }
        if self.io_workers == 0 {
            return Err(Error::Config("io_workers must be > 0".into()));
        }
        if self.dispatch_workers == 0 {
            return Err(Error::Config("dispatch_workers must be > 0".into()));
        }
        if self.events_capacity == 0 {
            return Err(Error::Config("events_capacity must be > 0".into()));
        }
        if self.listen_backlog <= 0 {
            return Err(Error::Config("listen_backlog must be > 0".into()));
        }
        Ok(())
    }
}
