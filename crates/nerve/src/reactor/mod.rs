// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Readiness reactor.
//!
//! One thread per reactor owns a `mio::Poll` and the registry of its
//! connections. It never reads or writes a socket: each readiness event is
//! turned into exactly one I/O task submitted to the [`IoPool`].
//!
//! # Architecture
//!
//! ```text
//! +--------------------------------------------------------------+
//! |                       Reactor thread                          |
//! |                                                               |
//! |  poll(timeout = next deadline)                                |
//! |     |                                                         |
//! |     +--> incoming queue  --> register READABLE                |
//! |     +--> deadline queue  --> heap of forced-close deadlines   |
//! |     +--> resync queue    --> close, or re-arm interest        |
//! |     +--> expired deadlines --> close                          |
//! |     +--> ready events    --> claim --> IoPool::submit         |
//! +--------------------------------------------------------------+
//!        ^ register / resync / deadline (any thread) + Waker
//! ```
//!
//! Interest is only changed on the reactor thread. Other threads push the
//! connection id on the resync queue and wake the poll.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::io;
use std::net::Shutdown;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::queue::SegQueue;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};
use parking_lot::{Mutex, RwLock};

use crate::connection::{ConnId, Connection, ConnectionContext, IoOp};
use crate::error::{Error, Result};
use crate::io_pool::{IoPool, WorkerContext};
use crate::protocol::Protocol;

// ============================================================================
// Constants
// ============================================================================

/// Token for the waker; connection ids start at 1.
const WAKER_TOKEN: Token = Token(0);

#[inline]
fn token_of(id: ConnId) -> Token {
    Token(id as usize)
}

// ============================================================================
// Shared side
// ============================================================================

/// Reactor state reachable from other threads.
pub struct ReactorShared<P: Protocol> {
    id: usize,
    /// Registrations hold it shared, shutdown exclusive
    guard: RwLock<()>,
    running: AtomicBool,
    waker: Waker,
    incoming: SegQueue<Arc<Connection<P>>>,
    resync: SegQueue<ConnId>,
    deadlines: SegQueue<(Instant, ConnId)>,
    shutdown: Mutex<Option<Duration>>,
    connections: AtomicUsize,
}

impl<P: Protocol> ReactorShared<P> {
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Connections currently registered.
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::Acquire)
    }

    /// Hand a new connection to the reactor thread.
    pub(crate) fn register(&self, conn: Arc<Connection<P>>) -> Result<()> {
        let _guard = self.guard.read();
        if !self.is_running() {
            return Err(Error::Closed);
        }
        self.incoming.push(conn);
        self.wake();
        Ok(())
    }

    /// Ask for interest re-evaluation of `id`.
    pub(crate) fn push_resync(&self, id: ConnId) {
        self.resync.push(id);
        self.wake();
    }

    /// Force-close `id` at `at` unless it is gone by then.
    pub(crate) fn schedule_deadline(&self, at: Instant, id: ConnId) {
        self.deadlines.push((at, id));
        self.wake();
    }

    /// Stop registrations and drain every connection within `timeout`.
    pub(crate) fn request_shutdown(&self, timeout: Duration) {
        let _guard = self.guard.write();
        self.running.store(false, Ordering::Release);
        self.shutdown.lock().get_or_insert(timeout);
        self.wake();
    }

    fn wake(&self) {
        if let Err(e) = self.waker.wake() {
            log::error!("[reactor-{}] wake failed: {}", self.id, e);
        }
    }
}

// ============================================================================
// Handle
// ============================================================================

/// Owner-side handle of a reactor thread.
pub struct ReactorHandle<P: Protocol> {
    shared: Arc<ReactorShared<P>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl<P: Protocol> ReactorHandle<P> {
    /// Spawn reactor `id` (thread `nerve-reactor-<id>`).
    pub(crate) fn spawn(
        id: usize,
        io: Arc<IoPool>,
        ctx: Arc<ConnectionContext<P>>,
        events_capacity: usize,
    ) -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;
        let shared = Arc::new(ReactorShared {
            id,
            guard: RwLock::new(()),
            running: AtomicBool::new(true),
            waker,
            incoming: SegQueue::new(),
            resync: SegQueue::new(),
            deadlines: SegQueue::new(),
            shutdown: Mutex::new(None),
            connections: AtomicUsize::new(0),
        });

        let reactor = Reactor {
            shared: Arc::clone(&shared),
            poll,
            slots: HashMap::new(),
            deadlines: BinaryHeap::new(),
            io,
            ctx,
            events_capacity,
            shutdown_applied: false,
        };
        let thread = thread::Builder::new()
            .name(format!("nerve-reactor-{}", id))
            .spawn(move || reactor.run())?;

        Ok(Self {
            shared,
            thread: Mutex::new(Some(thread)),
        })
    }

    pub fn shared(&self) -> &Arc<ReactorShared<P>> {
        &self.shared
    }

    pub fn id(&self) -> usize {
        self.shared.id
    }

    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    pub fn connection_count(&self) -> usize {
        self.shared.connection_count()
    }

    pub(crate) fn register(&self, conn: Arc<Connection<P>>) -> Result<()> {
        self.shared.register(conn)
    }

    /// Begin shutdown; returns immediately.
    pub fn shutdown(&self, timeout: Duration) {
        self.shared.request_shutdown(timeout);
    }

    /// Wait for the reactor thread to exit.
    pub fn join(&self) {
        let handle = self.thread.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                log::error!("[reactor-{}] thread panicked", self.shared.id);
            }
        }
    }
}

impl<P: Protocol> Drop for ReactorHandle<P> {
    fn drop(&mut self) {
        self.shutdown(Duration::ZERO);
        self.join();
    }
}

// ============================================================================
// Reactor thread
// ============================================================================

struct Slot<P: Protocol> {
    conn: Arc<Connection<P>>,
    /// Interest currently armed; None while a task runs
    armed: Option<Interest>,
}

struct Reactor<P: Protocol> {
    shared: Arc<ReactorShared<P>>,
    poll: Poll,
    slots: HashMap<Token, Slot<P>>,
    deadlines: BinaryHeap<Reverse<(Instant, ConnId)>>,
    io: Arc<IoPool>,
    ctx: Arc<ConnectionContext<P>>,
    events_capacity: usize,
    shutdown_applied: bool,
}

impl<P: Protocol> Reactor<P> {
    fn run(mut self) {
        let id = self.shared.id;
        log::debug!("[reactor-{}] started", id);
        let mut events = Events::with_capacity(self.events_capacity);

        loop {
            let timeout = self.next_timeout();
            if let Err(e) = self.poll.poll(&mut events, timeout) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                log::error!("[reactor-{}] poll failed, closing reactor: {}", id, e);
                break;
            }

            self.accept_incoming();
            self.collect_deadlines();
            self.drain_resync();
            self.fire_deadlines();
            self.apply_shutdown();

            for event in events.iter() {
                if event.token() == WAKER_TOKEN {
                    continue;
                }
                self.on_ready(event);
            }

            if self.shutdown_applied && self.slots.is_empty() {
                break;
            }
        }

        self.close_all();
        log::debug!("[reactor-{}] stopped", id);
    }

    fn next_timeout(&self) -> Option<Duration> {
        self.deadlines
            .peek()
            .map(|Reverse((at, _))| at.saturating_duration_since(Instant::now()))
    }

    // ========================================================================
    // Queues
    // ========================================================================

    fn accept_incoming(&mut self) {
        while let Some(conn) = self.shared.incoming.pop() {
            let id = conn.id();
            let token = token_of(id);
            let fd = conn.transport().as_raw_fd();

            if let Err(e) =
                self.poll
                    .registry()
                    .register(&mut SourceFd(&fd), token, Interest::READABLE)
            {
                log::warn!(
                    "[reactor-{}] failed to register conn-{} ({}): {}",
                    self.shared.id,
                    id,
                    conn.peer_addr(),
                    e
                );
                conn.state().mark_closed();
                let _ = conn.transport().shutdown(Shutdown::Both);
                self.ctx.index.remove(&id);
                continue;
            }

            self.slots.insert(
                token,
                Slot {
                    conn: Arc::clone(&conn),
                    armed: Some(Interest::READABLE),
                },
            );
            self.shared.connections.fetch_add(1, Ordering::Relaxed);
            self.ctx.metrics.record_connection_opened();
            log::debug!(
                "[reactor-{}] registered conn-{} ({})",
                self.shared.id,
                id,
                conn.peer_addr()
            );

            // Writes or closes requested before registration
            self.resync(id);
        }
    }

    fn collect_deadlines(&mut self) {
        while let Some(deadline) = self.shared.deadlines.pop() {
            self.deadlines.push(Reverse(deadline));
        }
    }

    fn drain_resync(&mut self) {
        while let Some(id) = self.shared.resync.pop() {
            self.resync(id);
        }
    }

    fn fire_deadlines(&mut self) {
        let now = Instant::now();
        while let Some(Reverse((at, id))) = self.deadlines.peek().copied() {
            if at > now {
                break;
            }
            self.deadlines.pop();
            if self.slots.contains_key(&token_of(id)) {
                log::debug!(
                    "[reactor-{}] shutdown deadline expired for conn-{}",
                    self.shared.id,
                    id
                );
                self.close(token_of(id));
            }
        }
    }

    fn apply_shutdown(&mut self) {
        if self.shutdown_applied {
            return;
        }
        let Some(timeout) = *self.shared.shutdown.lock() else {
            return;
        };
        self.shutdown_applied = true;
        log::debug!(
            "[reactor-{}] shutting down {} connection(s) within {:?}",
            self.shared.id,
            self.slots.len(),
            timeout
        );

        let at = Instant::now() + timeout;
        let conns: Vec<_> = self.slots.values().map(|s| Arc::clone(&s.conn)).collect();
        for conn in conns {
            self.deadlines.push(Reverse((at, conn.id())));
            conn.shutdown(timeout);
        }
    }

    // ========================================================================
    // Interest
    // ========================================================================

    /// Re-evaluate a connection after a state change.
    fn resync(&mut self, id: ConnId) {
        let token = token_of(id);
        let Some(slot) = self.slots.get_mut(&token) else {
            return;
        };
        let state = slot.conn.state();
        state.take_sync_pending();

        if state.close_pending() {
            self.close(token);
            return;
        }

        let Some(interest) = state.interest() else {
            slot.armed = None;
            return;
        };
        let fd = slot.conn.transport().as_raw_fd();
        match self
            .poll
            .registry()
            .reregister(&mut SourceFd(&fd), token, interest)
        {
            Ok(()) => slot.armed = Some(interest),
            Err(e) => {
                log::warn!(
                    "[reactor-{}] failed to re-arm conn-{}: {}",
                    self.shared.id,
                    id,
                    e
                );
                self.close(token);
            }
        }
    }

    /// Turn a readiness event into one I/O task.
    fn on_ready(&mut self, event: &mio::event::Event) {
        let token = event.token();
        let Some(slot) = self.slots.get_mut(&token) else {
            return;
        };
        let Some(armed) = slot.armed else {
            return;
        };

        let readable = armed.is_readable()
            && (event.is_readable() || event.is_read_closed() || event.is_error());
        let writable = armed.is_writable()
            && (event.is_writable() || event.is_write_closed() || event.is_error());
        let op = match (readable, writable) {
            (true, _) => IoOp::Read,
            (false, true) => IoOp::Write,
            (false, false) => return,
        };

        let claimed = match op {
            IoOp::Read => slot.conn.state().claim_read(),
            IoOp::Write => slot.conn.state().claim_write(),
        };
        if let Err(e) = claimed {
            log::error!("[reactor-{}] conn-{}: {}", self.shared.id, slot.conn.id(), e);
            return;
        }
        slot.armed = None;

        let conn = Arc::clone(&slot.conn);
        let job = Box::new(move |worker: &WorkerContext| conn.perform(worker, op));
        if let Err(e) = self.io.submit(job) {
            log::warn!(
                "[reactor-{}] cannot schedule {:?} task: {}",
                self.shared.id,
                op,
                e
            );
            if let Some(slot) = self.slots.get(&token) {
                let _ = slot.conn.state().release();
            }
            self.close(token);
        }
    }

    // ========================================================================
    // Close
    // ========================================================================

    /// Close and forget a connection. Reactor thread only.
    fn close(&mut self, token: Token) {
        let Some(slot) = self.slots.remove(&token) else {
            return;
        };
        let conn = slot.conn;
        conn.state().mark_closed();

        let fd = conn.transport().as_raw_fd();
        if let Err(e) = self.poll.registry().deregister(&mut SourceFd(&fd)) {
            log::debug!(
                "[reactor-{}] deregister conn-{}: {}",
                self.shared.id,
                conn.id(),
                e
            );
        }
        let _ = conn.transport().shutdown(Shutdown::Both);

        self.ctx.index.remove(&conn.id());
        self.ctx.metrics.record_connection_closed();
        self.shared.connections.fetch_sub(1, Ordering::Release);
        log::debug!(
            "[reactor-{}] closed conn-{} ({})",
            self.shared.id,
            conn.id(),
            conn.peer_addr()
        );
    }

    fn close_all(&mut self) {
        {
            let _guard = self.shared.guard.write();
            self.shared.running.store(false, Ordering::Release);
        }
        while let Some(conn) = self.shared.incoming.pop() {
            conn.state().mark_closed();
            let _ = conn.transport().shutdown(Shutdown::Both);
            self.ctx.index.remove(&conn.id());
        }
        let tokens: Vec<Token> = self.slots.keys().copied().collect();
        for token in tokens {
            self.close(token);
        }
    }
}
