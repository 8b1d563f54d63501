// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Connections.
//!
//! A [`Connection`] couples one [`Transport`] with its [`Framer`], its
//! [`ConnectionState`] and the per-connection [`StripeQueue`] feeding the
//! dispatcher. The owning reactor holds the only long-lived strong
//! reference; everything handed to application code is a weak [`Link`].
//!
//! # Lifecycle
//!
//! ```text
//!  adopt ---> registered (READABLE) ---> shutdown requested ---> closed
//!                 |    ^                      |
//!        claim    v    | release              | sentinel written or
//!              I/O task running               | linger deadline fires
//! ```

pub mod framer;
pub mod state;

pub use framer::{Framer, ReadStatus, WriteStatus};
pub use state::{ConnectionState, Phase};

use std::fmt;
use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use crate::buffer::BufferPool;
use crate::dual_key::DualKeyIndex;
use crate::error::{panic_message, Error, Result};
use crate::io_pool::WorkerContext;
use crate::metrics::EngineMetrics;
use crate::ordering::{MergingQueue, StripeQueue};
use crate::protocol::{Protocol, StripeKey, Striped};
use crate::reactor::ReactorShared;
use crate::transport::{Transport, TransportIo};

/// Engine-wide connection identifier.
pub type ConnId = u64;

/// `(local, peer)` address pair; unique among live TCP connections.
pub type Endpoints = (SocketAddr, SocketAddr);

/// Live connections by id and by address pair.
pub type ConnectionIndex<P> = DualKeyIndex<ConnId, Endpoints, Link<P>>;

// ============================================================================
// Shared engine context
// ============================================================================

/// Engine pieces every connection needs.
pub(crate) struct ConnectionContext<P: Protocol> {
    pub(crate) protocol: Arc<P>,
    pub(crate) pool: Arc<BufferPool>,
    pub(crate) metrics: Arc<EngineMetrics>,
    pub(crate) master: Arc<MergingQueue<Inbound<P>>>,
    pub(crate) index: Arc<ConnectionIndex<P>>,
    pub(crate) linger: Duration,
}

/// Which half of the connection an I/O task drives.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum IoOp {
    Read,
    Write,
}

// ============================================================================
// Inbound message
// ============================================================================

/// A decoded message waiting for its handler.
pub struct Inbound<P: Protocol> {
    pub(crate) link: Link<P>,
    pub(crate) session: Arc<P::Session>,
    pub(crate) message: P::Message,
}

impl<P: Protocol> Inbound<P> {
    /// Connection the message arrived on.
    pub fn link(&self) -> &Link<P> {
        &self.link
    }

    pub fn message(&self) -> &P::Message {
        &self.message
    }
}

impl<P: Protocol> Striped for Inbound<P> {
    fn stripe_key(&self) -> StripeKey {
        self.message.stripe_key()
    }
}

// ============================================================================
// Connection
// ============================================================================

/// One transport registered with a reactor.
pub struct Connection<P: Protocol> {
    id: ConnId,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    transport: Box<dyn Transport>,
    state: ConnectionState,
    framer: Framer<P>,
    inbound: Arc<StripeQueue<Inbound<P>>>,
    session: Arc<P::Session>,
    reactor: Arc<ReactorShared<P>>,
    ctx: Arc<ConnectionContext<P>>,
    me: Weak<Self>,
}

impl<P: Protocol> Connection<P> {
    /// Build a connection and its session.
    ///
    /// The session receives a [`Link`] that cannot be upgraded until this
    /// function returns.
    pub(crate) fn new(
        id: ConnId,
        transport: Box<dyn Transport>,
        reactor: Arc<ReactorShared<P>>,
        ctx: Arc<ConnectionContext<P>>,
    ) -> Result<Arc<Self>> {
        let local_addr = transport.local_addr()?;
        let peer_addr = transport.peer_addr()?;
        Ok(Arc::new_cyclic(|me: &Weak<Self>| {
            let link = Link {
                id,
                local_addr,
                peer_addr,
                conn: me.clone(),
            };
            let session = Arc::new(ctx.protocol.new_session(link));
            Self {
                id,
                local_addr,
                peer_addr,
                transport,
                state: ConnectionState::new(),
                framer: Framer::new(
                    Arc::clone(&ctx.protocol),
                    Arc::clone(&ctx.pool),
                    Arc::clone(&ctx.metrics),
                ),
                inbound: StripeQueue::new(Arc::clone(&ctx.master)),
                session,
                reactor,
                ctx,
                me: me.clone(),
            }
        }))
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Secondary key in the engine's connection index.
    pub fn endpoints(&self) -> Endpoints {
        (self.local_addr, self.peer_addr)
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn session(&self) -> &Arc<P::Session> {
        &self.session
    }

    /// Weak handle to this connection.
    pub fn link(&self) -> Link<P> {
        Link {
            id: self.id,
            local_addr: self.local_addr,
            peer_addr: self.peer_addr,
            conn: self.me.clone(),
        }
    }

    pub(crate) fn transport(&self) -> &dyn Transport {
        &*self.transport
    }

    // ========================================================================
    // Outbound
    // ========================================================================

    /// Queue `message` for sending.
    ///
    /// Returns false when the connection is closed or shutting down; the
    /// message is dropped.
    pub fn write_message(&self, message: P::Message) -> bool {
        if self.state.is_closed() {
            return false;
        }
        if !self.framer.enqueue(message) {
            log::debug!(
                "[conn-{}] write after shutdown dropped ({})",
                self.id,
                self.peer_addr
            );
            return false;
        }
        if self.state.request_write() {
            self.queue_resync();
        }
        true
    }

    /// Send everything queued so far, then close.
    ///
    /// The connection is closed regardless once `timeout` elapses; a zero
    /// timeout closes immediately. Later calls are ignored.
    pub fn shutdown(&self, timeout: Duration) {
        if !self.state.begin_shutdown() {
            return;
        }
        log::debug!(
            "[conn-{}] shutdown requested (timeout {:?})",
            self.id,
            timeout
        );
        self.framer.enqueue_shutdown();
        if timeout.is_zero() {
            self.async_close();
            return;
        }
        if self.state.request_write() {
            self.queue_resync();
        }
        self.reactor.schedule_deadline(Instant::now() + timeout, self.id);
    }

    /// Ask the reactor to close the connection at its next turn.
    pub fn async_close(&self) {
        self.state.request_close();
        self.queue_resync();
    }

    /// Ask the reactor to re-evaluate interest for this connection.
    pub(crate) fn queue_resync(&self) {
        if self.state.mark_sync_pending() {
            self.reactor.push_resync(self.id);
        }
    }

    // ========================================================================
    // I/O tasks
    // ========================================================================

    /// Run one claimed I/O task, then hand the connection back.
    ///
    /// A panic raised by protocol code counts as a framing error; the
    /// connection is still released and closed.
    pub(crate) fn perform(&self, worker: &WorkerContext, op: IoOp) {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| match op {
            IoOp::Read => self.run_read(worker),
            IoOp::Write => self.run_write(worker),
        }))
        .unwrap_or_else(|payload| {
            Err(Error::Framing(format!(
                "{:?} task panicked: {}",
                op,
                panic_message(&*payload)
            )))
        });
        if let Err(e) = outcome {
            self.fail(op, &e);
        }
        if let Err(e) = self.state.release() {
            log::error!("[conn-{}] {}", self.id, e);
        }
        self.queue_resync();
    }

    fn run_read(&self, worker: &WorkerContext) -> Result<()> {
        let mut io = TransportIo(&*self.transport);
        let status = self.framer.read(worker, &mut io, |message| {
            self.inbound.offer(Inbound {
                link: self.link(),
                session: Arc::clone(&self.session),
                message,
            });
        })?;

        if status == ReadStatus::EndOfStream {
            log::debug!("[conn-{}] peer {} closed its side", self.id, self.peer_addr);
            self.state.mark_read_closed();
            self.shutdown(self.ctx.linger);
        }
        Ok(())
    }

    fn run_write(&self, worker: &WorkerContext) -> Result<()> {
        let mut io = TransportIo(&*self.transport);
        match self.framer.write(worker, &mut io, &self.state)? {
            WriteStatus::Drained(_) | WriteStatus::Blocked(_) => {}
            WriteStatus::Halted => {
                log::debug!("[conn-{}] outbound drained, closing", self.id);
                self.async_close();
            }
        }
        Ok(())
    }

    fn fail(&self, op: IoOp, err: &Error) {
        match err {
            Error::Transport(_) => self.ctx.metrics.record_transport_error(),
            Error::ProtocolLookup(_) => self.ctx.metrics.record_protocol_lookup_error(),
            _ => self.ctx.metrics.record_framing_error(),
        }
        if self.state.is_closed() {
            log::debug!("[conn-{}] {:?} after close: {}", self.id, op, err);
        } else if !err.is_connection_local() {
            log::error!("[conn-{}] {:?} hit an engine fault: {}", self.id, op, err);
        } else {
            log::warn!(
                "[conn-{}] {:?} failed on {}: {}",
                self.id,
                op,
                self.peer_addr,
                err
            );
        }
        self.async_close();
    }
}

impl<P: Protocol> fmt::Debug for Connection<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("local_addr", &self.local_addr)
            .field("peer_addr", &self.peer_addr)
            .field("phase", &self.state.phase())
            .field("closed", &self.state.is_closed())
            .finish()
    }
}

// ============================================================================
// Link
// ============================================================================

/// Weak, cloneable handle to a connection.
///
/// All operations become no-ops once the connection is gone.
pub struct Link<P: Protocol> {
    id: ConnId,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    conn: Weak<Connection<P>>,
}

impl<P: Protocol> Link<P> {
    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Queue `message` for sending; false if it was dropped.
    pub fn write(&self, message: P::Message) -> bool {
        match self.conn.upgrade() {
            Some(conn) => conn.write_message(message),
            None => false,
        }
    }

    /// Graceful shutdown with the engine's linger timeout.
    pub fn shutdown(&self) {
        if let Some(conn) = self.conn.upgrade() {
            conn.shutdown(conn.ctx.linger);
        }
    }

    /// Graceful shutdown with an explicit timeout.
    pub fn shutdown_timeout(&self, timeout: Duration) {
        if let Some(conn) = self.conn.upgrade() {
            conn.shutdown(timeout);
        }
    }

    /// Close without flushing queued messages.
    pub fn close(&self) {
        if let Some(conn) = self.conn.upgrade() {
            conn.async_close();
        }
    }

    /// Whether the connection is still registered and not closed.
    pub fn is_open(&self) -> bool {
        self.conn
            .upgrade()
            .is_some_and(|conn| !conn.state.is_closed())
    }

    /// Strong reference, if the connection still exists.
    pub fn upgrade(&self) -> Option<Arc<Connection<P>>> {
        self.conn.upgrade()
    }

    /// Link to no connection at all.
    #[cfg(test)]
    pub(crate) fn detached(id: ConnId, peer_addr: SocketAddr) -> Self {
        Self {
            id,
            local_addr: SocketAddr::from((std::net::Ipv4Addr::UNSPECIFIED, 0)),
            peer_addr,
            conn: Weak::new(),
        }
    }
}

impl<P: Protocol> Clone for Link<P> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            local_addr: self.local_addr,
            peer_addr: self.peer_addr,
            conn: self.conn.clone(),
        }
    }
}

impl<P: Protocol> fmt::Debug for Link<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Link")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("open", &self.is_open())
            .finish()
    }
}
