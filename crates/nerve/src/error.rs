// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Engine error type.
//!
//! Transport, framing, lookup and handler failures are local to one
//! connection: the engine closes that connection and keeps running.
//! [`Error::Capacity`] goes back to the caller that asked for the buffer.
//! [`Error::InvariantViolation`] means an internal ordering or exclusivity
//! rule was broken and is never retried.

use std::any::Any;
use std::io;

use thiserror::Error;

/// Errors produced by the engine.
#[derive(Debug, Error)]
pub enum Error {
    /// Read/write/close failure on the underlying transport.
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    /// Undecodable or oversized frame.
    #[error("framing error: {0}")]
    Framing(String),

    /// No decoder, encoder or handler registered for a message.
    #[error("protocol lookup error: {0}")]
    ProtocolLookup(String),

    /// A message handler failed or panicked.
    #[error("handler error: {0}")]
    Handler(String),

    /// Requested buffer exceeds the pool's configured maximum.
    #[error("capacity error: requested {requested} bytes, maximum is {max}")]
    Capacity {
        /// Requested size in bytes
        requested: usize,
        /// Pool maximum in bytes
        max: usize,
    },

    /// Internal ordering/exclusivity rule broken.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// Invalid engine configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// A blocking wait was interrupted.
    #[error("interrupted")]
    Interrupted,

    /// The engine or reactor no longer accepts work.
    #[error("closed")]
    Closed,
}

impl Error {
    /// Whether the failure only concerns the connection it happened on.
    pub fn is_connection_local(&self) -> bool {
        matches!(
            self,
            Error::Transport(_) | Error::Framing(_) | Error::ProtocolLookup(_) | Error::Handler(_)
        )
    }
}

/// Result alias for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Text carried by a caught panic.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        *s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic payload"
    }
}
