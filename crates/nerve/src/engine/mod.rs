// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Engine: wires reactors, I/O workers, dispatchers and the buffer pool.
//!
//! # Example
//!
//! ```no_run
//! use nerve::protocol::marker::MarkerProtocol;
//! use nerve::{Engine, EngineConfig};
//! use std::time::Duration;
//!
//! let engine = Engine::start(MarkerProtocol::new(), EngineConfig::default())?;
//! let addr = engine.listen("127.0.0.1:7070".parse().unwrap())?;
//! println!("serving on {}", addr);
//!
//! engine.shutdown(Duration::from_secs(2));
//! # Ok::<(), nerve::Error>(())
//! ```

mod acceptor;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::buffer::{BufferPool, PoolStats};
use crate::config::EngineConfig;
use crate::connection::{ConnId, Connection, ConnectionContext, ConnectionIndex, Endpoints, Link};
use crate::dispatch::Dispatcher;
use crate::error::{Error, Result};
use crate::io_pool::IoPool;
use crate::metrics::{EngineMetrics, MetricsSnapshot};
use crate::ordering::MergingQueue;
use crate::protocol::Protocol;
use crate::reactor::ReactorHandle;

use acceptor::Acceptor;

/// State needed to adopt a connection, shared with accept threads.
struct Registrar<P: Protocol> {
    ctx: Arc<ConnectionContext<P>>,
    reactors: Vec<ReactorHandle<P>>,
    next_reactor: AtomicUsize,
    next_id: AtomicU64,
    nodelay: bool,
    stopped: AtomicBool,
}

impl<P: Protocol> Registrar<P> {
    /// Next reactor in round-robin order, skipping reactors that stopped.
    fn pick_reactor(&self) -> Result<&ReactorHandle<P>> {
        let count = self.reactors.len();
        let start = self.next_reactor.fetch_add(1, Ordering::Relaxed);
        (0..count)
            .map(|i| &self.reactors[(start + i) % count])
            .find(|reactor| reactor.is_running())
            .ok_or(Error::Closed)
    }

    fn adopt(&self, stream: mio::net::TcpStream) -> Result<Link<P>> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        if let Err(e) = stream.set_nodelay(self.nodelay) {
            log::debug!("[engine] set_nodelay failed: {}", e);
        }

        let reactor = self.pick_reactor()?;
        let id: ConnId = self.next_id.fetch_add(1, Ordering::Relaxed);
        let conn = Connection::new(
            id,
            Box::new(stream),
            Arc::clone(reactor.shared()),
            Arc::clone(&self.ctx),
        )?;
        let link = conn.link();
        self.ctx
            .index
            .put_if_absent(id, conn.endpoints(), link.clone())?;

        if let Err(e) = reactor.register(conn) {
            self.ctx.index.remove(&id);
            return Err(e);
        }
        Ok(link)
    }
}

/// A running engine serving protocol `P`.
pub struct Engine<P: Protocol> {
    config: EngineConfig,
    registrar: Arc<Registrar<P>>,
    acceptors: Mutex<Vec<Acceptor>>,
    dispatcher: Dispatcher<P>,
    io: Arc<IoPool>,
}

impl<P: Protocol> Engine<P> {
    /// Validate `config` and spawn every engine thread.
    pub fn start(protocol: P, config: EngineConfig) -> Result<Self> {
        config.validate()?;

        let protocol = Arc::new(protocol);
        let metrics = Arc::new(EngineMetrics::new());
        let master = Arc::new(MergingQueue::new());
        let ctx = Arc::new(ConnectionContext {
            protocol: Arc::clone(&protocol),
            pool: Arc::new(BufferPool::new(
                protocol.max_message_size(),
                config.buffer_depth,
                config.io_workers,
            )),
            metrics: Arc::clone(&metrics),
            master: Arc::clone(&master),
            index: Arc::new(ConnectionIndex::new()),
            linger: config.linger,
        });

        let io = Arc::new(IoPool::new(config.io_workers)?);
        let reactors = (0..config.reactors)
            .map(|id| {
                ReactorHandle::spawn(id, Arc::clone(&io), Arc::clone(&ctx), config.events_capacity)
            })
            .collect::<std::io::Result<Vec<_>>>()?;
        let dispatcher = Dispatcher::start(protocol, master, metrics, config.dispatch_workers)?;

        log::info!(
            "[engine] started: {} reactor(s), {} I/O worker(s), {} dispatcher(s)",
            config.reactors,
            config.io_workers,
            config.dispatch_workers
        );

        Ok(Self {
            registrar: Arc::new(Registrar {
                ctx,
                reactors,
                next_reactor: AtomicUsize::new(0),
                next_id: AtomicU64::new(1),
                nodelay: config.nodelay,
                stopped: AtomicBool::new(false),
            }),
            config,
            acceptors: Mutex::new(Vec::new()),
            dispatcher,
            io,
        })
    }

    // ========================================================================
    // Connections
    // ========================================================================

    /// Accept connections on `addr`; returns the bound address.
    pub fn listen(&self, addr: SocketAddr) -> Result<SocketAddr> {
        if self.is_stopped() {
            return Err(Error::Closed);
        }
        let registrar = Arc::clone(&self.registrar);
        let acceptor = Acceptor::spawn(addr, self.config.listen_backlog, move |stream, peer| {
            match registrar.adopt(stream) {
                Ok(link) => log::debug!("[engine] accepted conn-{} from {}", link.id(), peer),
                Err(Error::Closed) => {
                    log::debug!("[engine] dropped {}: engine stopping", peer);
                }
                Err(e) => log::warn!("[engine] rejected {}: {}", peer, e),
            }
        })?;
        let local_addr = acceptor.local_addr();
        self.acceptors.lock().push(acceptor);
        Ok(local_addr)
    }

    /// Register an already connected stream.
    pub fn adopt(&self, stream: mio::net::TcpStream) -> Result<Link<P>> {
        self.registrar.adopt(stream)
    }

    /// Open an outbound connection to `addr` and register it.
    pub fn connect(&self, addr: SocketAddr) -> Result<Link<P>> {
        let stream = std::net::TcpStream::connect(addr)?;
        stream.set_nonblocking(true)?;
        self.adopt(mio::net::TcpStream::from_std(stream))
    }

    /// Live connection by id.
    pub fn connection(&self, id: ConnId) -> Option<Link<P>> {
        self.registrar.ctx.index.get(&id)
    }

    /// Live connection by `(local, peer)` address pair.
    pub fn connection_by_endpoints(&self, endpoints: &Endpoints) -> Option<Link<P>> {
        self.registrar.ctx.index.get_secondary(endpoints)
    }

    /// A live connection whose peer is `addr`.
    ///
    /// Outbound connections to one server share a peer address; any of them
    /// may be returned.
    pub fn connection_by_addr(&self, addr: &SocketAddr) -> Option<Link<P>> {
        self.registrar
            .ctx
            .index
            .values()
            .into_iter()
            .find(|link| link.peer_addr() == *addr)
    }

    /// Every live connection.
    pub fn connections(&self) -> Vec<Link<P>> {
        self.registrar.ctx.index.values()
    }

    pub fn connection_count(&self) -> usize {
        self.registrar.ctx.index.len()
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn protocol(&self) -> &Arc<P> {
        &self.registrar.ctx.protocol
    }

    pub fn metrics(&self) -> &Arc<EngineMetrics> {
        &self.registrar.ctx.metrics
    }

    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.registrar.ctx.metrics.snapshot()
    }

    /// Buffer pool hit/miss/discard counters.
    pub fn pool_stats(&self) -> PoolStats {
        self.registrar.ctx.pool.stats()
    }

    /// Addresses currently listened on.
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.acceptors.lock().iter().map(Acceptor::local_addr).collect()
    }

    pub fn is_stopped(&self) -> bool {
        self.registrar.stopped.load(Ordering::Acquire)
    }

    // ========================================================================
    // Shutdown
    // ========================================================================

    /// Stop accepting, drain every connection within `timeout`, and join all
    /// engine threads. Later calls return immediately.
    pub fn shutdown(&self, timeout: Duration) {
        if self.registrar.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        log::info!("[engine] shutting down (timeout {:?})", timeout);

        let acceptors = std::mem::take(&mut *self.acceptors.lock());
        for mut acceptor in acceptors {
            acceptor.stop();
        }

        for reactor in &self.registrar.reactors {
            reactor.shutdown(timeout);
        }
        for reactor in &self.registrar.reactors {
            reactor.join();
        }

        self.dispatcher.shutdown();
        self.io.shutdown();
        log::info!("[engine] stopped");
    }
}

impl<P: Protocol> Drop for Engine<P> {
    fn drop(&mut self) {
        self.shutdown(Duration::ZERO);
    }
}
