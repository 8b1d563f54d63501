// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Listening socket and accept thread.

use std::io;
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};
use socket2::{Domain, Protocol, Socket, Type};

const LISTENER_TOKEN: Token = Token(0);
const WAKER_TOKEN: Token = Token(1);
const MAX_EVENTS: usize = 16;

/// Bind a non-blocking listener with `SO_REUSEADDR` and the given backlog.
pub(crate) fn bind(addr: SocketAddr, backlog: i32) -> io::Result<StdTcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;

    // SO_REUSEADDR allows rapid rebind after restart
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;
    socket.set_nonblocking(true)?;

    Ok(socket.into())
}

/// Accept thread for one listening address.
pub(crate) struct Acceptor {
    local_addr: SocketAddr,
    running: Arc<AtomicBool>,
    waker: Arc<Waker>,
    thread: Option<JoinHandle<()>>,
}

impl Acceptor {
    /// Listen on `addr` and hand every accepted stream to `on_accept`.
    pub(crate) fn spawn<F>(addr: SocketAddr, backlog: i32, on_accept: F) -> io::Result<Self>
    where
        F: FnMut(TcpStream, SocketAddr) + Send + 'static,
    {
        let mut listener = TcpListener::from_std(bind(addr, backlog)?);
        let local_addr = listener.local_addr()?;

        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        let running = Arc::new(AtomicBool::new(true));

        let thread_running = Arc::clone(&running);
        let thread = thread::Builder::new()
            .name("nerve-accept".to_string())
            .spawn(move || accept_loop(poll, listener, thread_running, on_accept))?;

        log::info!("[accept] listening on {}", local_addr);
        Ok(Self {
            local_addr,
            running,
            waker,
            thread: Some(thread),
        })
    }

    pub(crate) fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting and join the thread. The listening socket is closed.
    pub(crate) fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Err(e) = self.waker.wake() {
            log::error!("[accept] wake failed on {}: {}", self.local_addr, e);
        }
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                log::error!("[accept] thread for {} panicked", self.local_addr);
            }
        }
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn accept_loop<F>(mut poll: Poll, listener: TcpListener, running: Arc<AtomicBool>, mut on_accept: F)
where
    F: FnMut(TcpStream, SocketAddr),
{
    let mut events = Events::with_capacity(MAX_EVENTS);

    while running.load(Ordering::Acquire) {
        if let Err(e) = poll.poll(&mut events, None) {
            if e.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            log::error!("[accept] poll failed, no longer accepting: {}", e);
            break;
        }

        for event in events.iter() {
            if event.token() != LISTENER_TOKEN {
                continue;
            }
            loop {
                match listener.accept() {
                    Ok((stream, peer)) => on_accept(stream, peer),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        log::warn!("[accept] accept error: {}", e);
                        break;
                    }
                }
            }
        }
    }
    log::debug!("[accept] stopped");
}
