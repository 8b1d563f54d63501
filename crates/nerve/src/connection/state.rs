// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-connection exclusivity state machine.
//!
//! # State Machine
//!
//! ```text
//!               request_write()
//!      +------+ ------------> +--------------+
//!      | Idle |               | WritePending |
//!      +------+ <--+          +------+-------+
//!         |        |                 |
//!  claim_read()    | release()       | claim_read() / claim_write()
//!  claim_write()   |                 |
//!         v        |                 |
//!      +---------+ |                 |
//!      | Running |-+ <---------------+
//!      +---------+
//! ```
//!
//! At most one I/O task runs per connection. Every transition out of
//! `Idle`/`WritePending` goes through the reactor, which also recomputes the
//! readiness interest from the flags kept here.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use mio::Interest;

use crate::error::{Error, Result};

// ============================================================================
// Phase
// ============================================================================

/// Exclusivity phase of a connection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Phase {
    /// No task running, interest armed
    #[default]
    Idle,

    /// No task running, a write was requested and a resync is queued
    WritePending,

    /// A read or write task owns the connection
    Running,
}

impl Phase {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Phase::WritePending,
            2 => Phase::Running,
            _ => Phase::Idle,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Phase::Idle => 0,
            Phase::WritePending => 1,
            Phase::Running => 2,
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Phase::Idle => "Idle",
            Phase::WritePending => "WritePending",
            Phase::Running => "Running",
        };
        write!(f, "{}", s)
    }
}

// ============================================================================
// Connection State
// ============================================================================

/// Atomic phase plus the flags the reactor needs on resync.
#[derive(Debug, Default)]
pub struct ConnectionState {
    phase: AtomicU8,
    /// Outbound data is queued
    write_requested: AtomicBool,
    /// A resync request sits in the reactor queue
    sync_pending: AtomicBool,
    close_pending: AtomicBool,
    shutdown_requested: AtomicBool,
    /// Peer closed its write side
    read_closed: AtomicBool,
    closed: AtomicBool,
}

impl ConnectionState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current phase.
    pub fn phase(&self) -> Phase {
        Phase::from_u8(self.phase.load(Ordering::Acquire))
    }

    fn transition(&self, from: Phase, to: Phase) -> bool {
        self.phase
            .compare_exchange(from.as_u8(), to.as_u8(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    // ========================================================================
    // Write requests
    // ========================================================================

    /// Flag outbound data.
    ///
    /// Returns true when the caller must queue a resync (`Idle` ->
    /// `WritePending`). Repeated requests coalesce.
    pub fn request_write(&self) -> bool {
        self.write_requested.store(true, Ordering::SeqCst);
        self.transition(Phase::Idle, Phase::WritePending)
    }

    /// Clear the write request once the outbound queue was seen empty.
    pub fn clear_write_request(&self) {
        self.write_requested.store(false, Ordering::SeqCst);
    }

    pub fn write_requested(&self) -> bool {
        self.write_requested.load(Ordering::SeqCst)
    }

    // ========================================================================
    // Task exclusivity
    // ========================================================================

    /// Take the connection for a read task.
    pub fn claim_read(&self) -> Result<()> {
        self.claim("read")
    }

    /// Take the connection for a write task.
    pub fn claim_write(&self) -> Result<()> {
        self.claim("write")
    }

    fn claim(&self, task: &str) -> Result<()> {
        if self.transition(Phase::Idle, Phase::Running)
            || self.transition(Phase::WritePending, Phase::Running)
        {
            return Ok(());
        }
        Err(Error::InvariantViolation(format!(
            "{} task claimed while {}",
            task,
            self.phase()
        )))
    }

    /// Give the connection back after a task finished (successfully or not).
    pub fn release(&self) -> Result<()> {
        if self.transition(Phase::Running, Phase::Idle) {
            return Ok(());
        }
        Err(Error::InvariantViolation(format!(
            "release while {}",
            self.phase()
        )))
    }

    // ========================================================================
    // Resync / close flags
    // ========================================================================

    /// Returns true when the caller must push a resync (none pending yet).
    pub fn mark_sync_pending(&self) -> bool {
        !self.sync_pending.swap(true, Ordering::AcqRel)
    }

    /// Consume the pending resync flag (reactor side).
    pub fn take_sync_pending(&self) -> bool {
        self.sync_pending.swap(false, Ordering::AcqRel)
    }

    /// Returns true on the first close request.
    pub fn request_close(&self) -> bool {
        !self.close_pending.swap(true, Ordering::AcqRel)
    }

    pub fn close_pending(&self) -> bool {
        self.close_pending.load(Ordering::Acquire)
    }

    /// Returns true on the first shutdown request.
    pub fn begin_shutdown(&self) -> bool {
        !self.shutdown_requested.swap(true, Ordering::AcqRel)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown_requested.load(Ordering::Acquire)
    }

    pub fn mark_read_closed(&self) {
        self.read_closed.store(true, Ordering::Release);
    }

    pub fn read_closed(&self) -> bool {
        self.read_closed.load(Ordering::Acquire)
    }

    /// Returns true for the caller that actually closes.
    pub fn mark_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    // ========================================================================
    // Interest
    // ========================================================================

    /// Interest to arm on resync.
    ///
    /// `None` while a task runs, or when there is nothing left to wait for.
    pub fn interest(&self) -> Option<Interest> {
        if self.phase() == Phase::Running {
            return None;
        }
        let read = (!self.read_closed()).then_some(Interest::READABLE);
        let write = self.write_requested().then_some(Interest::WRITABLE);
        match (read, write) {
            (Some(r), Some(w)) => Some(r | w),
            (r, w) => r.or(w),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_default() {
        let state = ConnectionState::new();
        assert_eq!(state.phase(), Phase::Idle);
        assert_eq!(Phase::default(), Phase::Idle);
        assert_eq!(Phase::WritePending.to_string(), "WritePending");
    }

    #[test]
    fn test_claim_release_cycle() {
        let state = ConnectionState::new();
        state.claim_read().unwrap();
        assert_eq!(state.phase(), Phase::Running);
        state.release().unwrap();
        assert_eq!(state.phase(), Phase::Idle);

        assert!(state.request_write());
        assert_eq!(state.phase(), Phase::WritePending);
        state.claim_write().unwrap();
        assert_eq!(state.phase(), Phase::Running);
        state.release().unwrap();
    }

    #[test]
    fn test_claim_while_running_is_violation() {
        let state = ConnectionState::new();
        state.claim_read().unwrap();
        assert!(matches!(
            state.claim_read(),
            Err(Error::InvariantViolation(_))
        ));
        assert!(matches!(
            state.claim_write(),
            Err(Error::InvariantViolation(_))
        ));
        state.release().unwrap();
        assert!(matches!(state.release(), Err(Error::InvariantViolation(_))));
    }

    #[test]
    fn test_request_write_coalesces() {
        let state = ConnectionState::new();
        assert!(state.request_write());
        assert!(!state.request_write());
        assert!(state.write_requested());

        state.claim_write().unwrap();
        assert!(!state.request_write());
        state.clear_write_request();
        assert!(!state.write_requested());
        state.release().unwrap();
    }

    #[test]
    fn test_sync_and_close_flags() {
        let state = ConnectionState::new();
        assert!(state.mark_sync_pending());
        assert!(!state.mark_sync_pending());
        assert!(state.take_sync_pending());
        assert!(!state.take_sync_pending());

        assert!(state.request_close());
        assert!(!state.request_close());
        assert!(state.close_pending());

        assert!(state.mark_closed());
        assert!(!state.mark_closed());
    }

    #[test]
    fn test_interest() {
        let state = ConnectionState::new();
        assert_eq!(state.interest(), Some(Interest::READABLE));

        state.request_write();
        assert_eq!(
            state.interest(),
            Some(Interest::READABLE | Interest::WRITABLE)
        );

        state.claim_write().unwrap();
        assert_eq!(state.interest(), None);
        state.release().unwrap();

        state.mark_read_closed();
        assert_eq!(state.interest(), Some(Interest::WRITABLE));
        state.clear_write_request();
        assert_eq!(state.interest(), None);
    }
}
