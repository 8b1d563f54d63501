// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Engine metrics.
//!
//! Lock-free counters shared by reactors, I/O workers and dispatchers.
//!
//! # Example
//!
//! ```
//! use nerve::EngineMetrics;
//!
//! let metrics = EngineMetrics::new();
//! metrics.record_connection_opened();
//! metrics.record_frame_decoded(12);
//!
//! let snapshot = metrics.snapshot();
//! assert_eq!(snapshot.active_connections, 1);
//! assert_eq!(snapshot.bytes_read, 12);
//! ```

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;

// ============================================================================
// Engine metrics
// ============================================================================

/// Counters for one engine instance.
#[derive(Debug)]
pub struct EngineMetrics {
    // Connections
    active_connections: AtomicUsize,
    connections_opened: AtomicU64,
    connections_closed: AtomicU64,

    // Frames
    frames_decoded: AtomicU64,
    frames_encoded: AtomicU64,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    /// Bytes dropped while seeking a frame header
    resync_bytes: AtomicU64,

    // Dispatch
    messages_dispatched: AtomicU64,
    worker_respawns: AtomicU64,

    // Errors
    framing_errors: AtomicU64,
    transport_errors: AtomicU64,
    handler_failures: AtomicU64,
    protocol_lookup_errors: AtomicU64,

    start_time: Instant,
}

impl EngineMetrics {
    /// Create a new metrics instance.
    pub fn new() -> Self {
        Self {
            active_connections: AtomicUsize::new(0),
            connections_opened: AtomicU64::new(0),
            connections_closed: AtomicU64::new(0),
            frames_decoded: AtomicU64::new(0),
            frames_encoded: AtomicU64::new(0),
            bytes_read: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            resync_bytes: AtomicU64::new(0),
            messages_dispatched: AtomicU64::new(0),
            worker_respawns: AtomicU64::new(0),
            framing_errors: AtomicU64::new(0),
            transport_errors: AtomicU64::new(0),
            handler_failures: AtomicU64::new(0),
            protocol_lookup_errors: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    // ========================================================================
    // Connection recording
    // ========================================================================

    /// Record a connection registered with a reactor.
    pub fn record_connection_opened(&self) {
        self.connections_opened.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a connection closed.
    pub fn record_connection_closed(&self) {
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    // ========================================================================
    // Frame recording
    // ========================================================================

    /// Record a decoded frame of `bytes` total length.
    pub fn record_frame_decoded(&self, bytes: usize) {
        self.frames_decoded.fetch_add(1, Ordering::Relaxed);
        self.bytes_read.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Record an encoded frame fully flushed to the transport.
    pub fn record_frame_encoded(&self, bytes: usize) {
        self.frames_encoded.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Record bytes discarded while resynchronizing on a header.
    pub fn record_resync(&self, bytes: usize) {
        self.resync_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    // ========================================================================
    // Dispatch recording
    // ========================================================================

    /// Record a message handed to its handler.
    pub fn record_dispatched(&self) {
        self.messages_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a dispatcher worker replaced after an escaped failure.
    pub fn record_worker_respawn(&self) {
        self.worker_respawns.fetch_add(1, Ordering::Relaxed);
    }

    // ========================================================================
    // Error recording
    // ========================================================================

    /// Record a framing error.
    pub fn record_framing_error(&self) {
        self.framing_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a transport error.
    pub fn record_transport_error(&self) {
        self.transport_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failed or panicking handler.
    pub fn record_handler_failure(&self) {
        self.handler_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an outbound message no encoder was registered for.
    pub fn record_protocol_lookup_error(&self) {
        self.protocol_lookup_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Total messages dispatched.
    pub fn messages_dispatched(&self) -> u64 {
        self.messages_dispatched.load(Ordering::Relaxed)
    }

    // ========================================================================
    // Snapshot
    // ========================================================================

    /// Take a snapshot of all metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            active_connections: self.active_connections.load(Ordering::Relaxed),
            connections_opened: self.connections_opened.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
            frames_decoded: self.frames_decoded.load(Ordering::Relaxed),
            frames_encoded: self.frames_encoded.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            resync_bytes: self.resync_bytes.load(Ordering::Relaxed),
            messages_dispatched: self.messages_dispatched.load(Ordering::Relaxed),
            worker_respawns: self.worker_respawns.load(Ordering::Relaxed),
            framing_errors: self.framing_errors.load(Ordering::Relaxed),
            transport_errors: self.transport_errors.load(Ordering::Relaxed),
            handler_failures: self.handler_failures.load(Ordering::Relaxed),
            protocol_lookup_errors: self.protocol_lookup_errors.load(Ordering::Relaxed),
            uptime_secs: self.start_time.elapsed().as_secs_f64(),
        }
    }
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of [`EngineMetrics`].
#[derive(Clone, Debug, Default)]
pub struct MetricsSnapshot {
    /// Number of open connections
    pub active_connections: usize,
    /// Connections registered since start
    pub connections_opened: u64,
    /// Connections closed since start
    pub connections_closed: u64,
    /// Frames decoded
    pub frames_decoded: u64,
    /// Frames encoded and flushed
    pub frames_encoded: u64,
    /// Bytes of decoded frames
    pub bytes_read: u64,
    /// Bytes of flushed frames
    pub bytes_written: u64,
    /// Bytes discarded while seeking a header
    pub resync_bytes: u64,
    /// Messages handed to handlers
    pub messages_dispatched: u64,
    /// Dispatcher workers replaced
    pub worker_respawns: u64,
    /// Framing errors
    pub framing_errors: u64,
    /// Transport errors
    pub transport_errors: u64,
    /// Handler errors and panics
    pub handler_failures: u64,
    /// Outbound messages without an encoder
    pub protocol_lookup_errors: u64,
    /// Uptime in seconds
    pub uptime_secs: f64,
}

impl MetricsSnapshot {
    /// Calculate dispatch rate (messages/second).
    pub fn dispatch_rate(&self) -> f64 {
        if self.uptime_secs > 0.0 {
            self.messages_dispatched as f64 / self.uptime_secs
        } else {
            0.0
        }
    }
}
