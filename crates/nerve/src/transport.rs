// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Transport abstraction.
//!
//! A [`Transport`] is a non-blocking byte stream shared between the reactor
//! (which only registers its descriptor) and whichever I/O worker currently
//! owns the connection. All methods take `&self`; exclusive use of the read
//! and write paths is guaranteed by the connection state machine, not by
//! the transport.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};

#[cfg(unix)]
use std::os::unix::io::{AsRawFd, RawFd};

use mio::net::TcpStream;

/// Non-blocking byte stream driven by a reactor.
pub trait Transport: Send + Sync {
    /// Read into `buf`; `Ok(0)` means the peer closed its write side.
    fn read(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write from `buf`, returning the bytes accepted.
    fn write(&self, buf: &[u8]) -> io::Result<usize>;

    /// Close one or both directions; used when the reactor drops a connection.
    fn shutdown(&self, how: Shutdown) -> io::Result<()>;

    /// Remote end, the second half of the connection's index key.
    fn peer_addr(&self) -> io::Result<SocketAddr>;

    /// Local end, the first half of the connection's index key.
    fn local_addr(&self) -> io::Result<SocketAddr>;

    /// Raw descriptor registered with the reactor's poll.
    #[cfg(unix)]
    fn as_raw_fd(&self) -> RawFd;
}

// ============================================================================
// mio TcpStream implementation
// ============================================================================

impl Transport for TcpStream {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        Read::read(&mut &*self, buf)
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        Write::write(&mut &*self, buf)
    }

    fn shutdown(&self, how: Shutdown) -> io::Result<()> {
        TcpStream::shutdown(self, how)
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        TcpStream::peer_addr(self)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        TcpStream::local_addr(self)
    }

    #[cfg(unix)]
    fn as_raw_fd(&self) -> RawFd {
        AsRawFd::as_raw_fd(self)
    }
}

// ============================================================================
// std::io adapter
// ============================================================================

/// Borrowed [`Read`]/[`Write`] view of a transport.
pub(crate) struct TransportIo<'a>(pub(crate) &'a dyn Transport);

impl Read for TransportIo<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf)
    }
}

impl Write for TransportIo<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
