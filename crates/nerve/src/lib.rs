// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # nerve - non-blocking binary-protocol network engine
//!
//! nerve accepts stream connections, frames their bytes into messages with a
//! pluggable [`Protocol`], and runs message handlers on a worker pool while
//! keeping messages that share a stripe key in arrival order.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use nerve::protocol::marker::MarkerProtocol;
//! use nerve::{Engine, EngineConfig, Result};
//! use std::time::Duration;
//!
//! fn main() -> Result<()> {
//!     let engine = Engine::start(MarkerProtocol::new(), EngineConfig::default())?;
//!     let addr = engine.listen("0.0.0.0:7070".parse().unwrap())?;
//!     println!("echo server on {}", addr);
//!
//!     std::thread::sleep(Duration::from_secs(60));
//!     engine.shutdown(Duration::from_secs(2));
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +---------------------------------------------------------------------+
//! |  Acceptor (socket2 + mio)  --adopt-->  Reactor 0..N (mio::Poll)     |
//! |                                          | readiness -> claim        |
//! +------------------------------------------v--------------------------+
//! |  IoPool: read / write tasks             Framer (seek, decode,       |
//! |  (one slot per worker)  <---leases--->  encode) + BufferPool        |
//! +------------------------------------------|--------------------------+
//! |  StripeQueue per connection  --enlist-->  MergingQueue               |
//! +------------------------------------------v--------------------------+
//! |  Dispatcher workers: handler(session, message) -> done()            |
//! |                      replies via Link::write                        |
//! +---------------------------------------------------------------------+
//! ```
//!
//! ## Key Types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`Engine`] | Owns every thread; listen, connect, shutdown |
//! | [`Protocol`] | Frame boundaries, codecs and handlers of a wire protocol |
//! | [`Link`] | Weak handle to a connection, used to reply |
//! | [`MergingQueue`] | Fair per-key ordered queue feeding dispatchers |
//! | [`DualKeyIndex`] | Concurrent map addressable by two keys |
//! | [`BufferPool`] | Size-class buffer cache partitioned per I/O worker |

/// Pooled byte buffers.
pub mod buffer;
/// Engine configuration.
pub mod config;
/// Connections, their state machine and framer.
pub mod connection;
/// Handler dispatch pool.
pub mod dispatch;
/// Concurrent dual-key index.
pub mod dual_key;
/// Engine wiring and accept loop.
pub mod engine;
/// Error type.
pub mod error;
/// I/O worker pool.
pub mod io_pool;
/// Engine counters.
pub mod metrics;
/// Per-key ordering engine.
pub mod ordering;
/// Protocol contract and the marker reference protocol.
pub mod protocol;
/// Readiness reactors.
pub mod reactor;
/// Transport abstraction.
pub mod transport;

pub use buffer::{Buffer, BufferPool, PoolStats};
pub use config::EngineConfig;
pub use connection::{ConnId, Connection, ConnectionState, Endpoints, Link, Phase};
pub use dispatch::Dispatcher;
pub use dual_key::DualKeyIndex;
pub use engine::Engine;
pub use error::{Error, Result};
pub use metrics::{EngineMetrics, MetricsSnapshot};
pub use ordering::{CompletionHandle, MergingQueue, StripeQueue};
pub use protocol::{Decoder, Encoder, Handler, HandlerError, Protocol, Seek, StripeKey, Striped, UNORDERED};
pub use transport::Transport;
