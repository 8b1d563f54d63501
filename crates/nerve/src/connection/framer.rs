// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Frame codec over a non-blocking stream.
//!
//! # Read side
//!
//! ```text
//! +---------+  header found  +---------------+  header full  +-------------+
//! | Seeking |--------------->| ReadingHeader |-------------->| ReadingBody |
//! +---------+                +---------------+               +------+------+
//!      ^  garbage discarded                                         |
//!      +------------------------ frame decoded ---------------------+
//! ```
//!
//! Header and body buffers are leased from the worker's pool partition and
//! returned once the frame is decoded. A read call keeps going until the
//! stream would block, so every complete buffered frame is delivered.
//!
//! # Write side
//!
//! Outbound messages sit in an unbounded MPSC queue. Each one is encoded
//! into a buffer of its exact frame size; a short write keeps that buffer
//! for the next writable event.

use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam::queue::SegQueue;
use parking_lot::Mutex;

use super::state::ConnectionState;
use crate::buffer::{Buffer, BufferPool};
use crate::error::{Error, Result};
use crate::io_pool::WorkerContext;
use crate::metrics::EngineMetrics;
use crate::protocol::{Protocol, Seek};

// ============================================================================
// Status types
// ============================================================================

/// Outcome of a read call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadStatus {
    /// Stream would block; this many bytes were consumed.
    Consumed(usize),
    /// Peer closed its write side.
    EndOfStream,
}

/// Outcome of a write call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteStatus {
    /// Outbound queue empty; this many bytes were written.
    Drained(usize),
    /// Stream would block with data left; this many bytes were written.
    Blocked(usize),
    /// Shutdown sentinel reached: nothing more will be sent.
    Halted,
}

// ============================================================================
// Internal state
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Stage {
    Seeking,
    ReadingHeader,
    ReadingBody,
}

struct ReadHalf {
    stage: Stage,
    header: Option<Buffer>,
    body: Option<Buffer>,
}

struct WriteHalf {
    /// Encoded frame partially written
    current: Option<Buffer>,
    halted: bool,
}

enum Outbound<M> {
    Message(M),
    Shutdown,
}

enum Fill {
    Complete,
    Partial,
    Eof,
}

/// Fill `buf` up to its limit, stopping early on would-block or end of stream.
fn fill<R: Read + ?Sized>(reader: &mut R, buf: &mut Buffer, consumed: &mut usize) -> Result<Fill> {
    while buf.has_remaining() {
        match reader.read(buf.chunk_mut()) {
            Ok(0) => return Ok(Fill::Eof),
            Ok(n) => {
                buf.advance(n);
                *consumed += n;
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Fill::Partial),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(Fill::Complete)
}

// ============================================================================
// Framer
// ============================================================================

/// Per-connection frame codec.
pub struct Framer<P: Protocol> {
    protocol: Arc<P>,
    pool: Arc<BufferPool>,
    metrics: Arc<EngineMetrics>,
    rx: Mutex<ReadHalf>,
    tx: Mutex<WriteHalf>,
    outbound: SegQueue<Outbound<P::Message>>,
    /// Shutdown sentinel queued; later messages are refused
    closing: AtomicBool,
}

impl<P: Protocol> Framer<P> {
    pub fn new(protocol: Arc<P>, pool: Arc<BufferPool>, metrics: Arc<EngineMetrics>) -> Self {
        Self {
            protocol,
            pool,
            metrics,
            rx: Mutex::new(ReadHalf {
                stage: Stage::Seeking,
                header: None,
                body: None,
            }),
            tx: Mutex::new(WriteHalf {
                current: None,
                halted: false,
            }),
            outbound: SegQueue::new(),
            closing: AtomicBool::new(false),
        }
    }

    // ========================================================================
    // Read side
    // ========================================================================

    /// Decode every complete frame available from `reader`.
    ///
    /// Each decoded message is passed to `deliver` in stream order.
    pub fn read<R, F>(&self, ctx: &WorkerContext, reader: &mut R, mut deliver: F) -> Result<ReadStatus>
    where
        R: Read + ?Sized,
        F: FnMut(P::Message),
    {
        let mut guard = self.rx.lock();
        let rx = &mut *guard;
        let header_size = self.protocol.header_size();
        let mut consumed = 0;

        loop {
            match rx.stage {
                Stage::Seeking | Stage::ReadingHeader => {
                    let leased = match rx.header.take() {
                        Some(buf) => buf,
                        None => self.pool.lease(ctx.slot(), header_size)?,
                    };
                    let header = rx.header.insert(leased);

                    match fill(reader, header, &mut consumed)? {
                        Fill::Complete => {}
                        Fill::Partial => return Ok(ReadStatus::Consumed(consumed)),
                        Fill::Eof => return Ok(ReadStatus::EndOfStream),
                    }

                    if rx.stage == Stage::Seeking {
                        match self.protocol.seek_to_header(header.filled()) {
                            Seek::Found(0) => {}
                            Seek::Found(offset) => {
                                header.discard_front(offset);
                                self.metrics.record_resync(offset);
                                rx.stage = Stage::ReadingHeader;
                                continue;
                            }
                            Seek::Discard(0) => {
                                return Err(Error::Framing(
                                    "header window holds no header and nothing to discard".into(),
                                ));
                            }
                            Seek::Discard(n) => {
                                header.discard_front(n);
                                self.metrics.record_resync(n);
                                continue;
                            }
                        }
                    }
                    rx.stage = Stage::ReadingBody;
                }
                Stage::ReadingBody => {
                    let Some(header) = rx.header.as_ref() else {
                        rx.stage = Stage::Seeking;
                        continue;
                    };

                    if rx.body.is_none() {
                        let body_size = self.protocol.body_size(header.filled())?;
                        let max = self.protocol.max_message_size();
                        if header_size + body_size > max {
                            return Err(Error::Framing(format!(
                                "frame of {} bytes exceeds maximum {}",
                                header_size + body_size,
                                max
                            )));
                        }
                        rx.body = Some(self.pool.lease(ctx.slot(), body_size)?);
                    }
                    let Some(body) = rx.body.as_mut() else {
                        continue;
                    };

                    match fill(reader, body, &mut consumed)? {
                        Fill::Complete => {}
                        Fill::Partial => return Ok(ReadStatus::Consumed(consumed)),
                        Fill::Eof => return Ok(ReadStatus::EndOfStream),
                    }

                    let decoder = self.protocol.decoder(header.filled()).ok_or_else(|| {
                        Error::Framing("no decoder registered for frame header".into())
                    })?;
                    let message = decoder.decode(header.filled(), body.filled())?;
                    let frame_len = header.limit() + body.limit();

                    deliver(message);
                    self.metrics.record_frame_decoded(frame_len);

                    if let Some(buf) = rx.header.take() {
                        self.pool.release(ctx.slot(), buf);
                    }
                    if let Some(buf) = rx.body.take() {
                        self.pool.release(ctx.slot(), buf);
                    }
                    rx.stage = Stage::Seeking;
                }
            }
        }
    }

    // ========================================================================
    // Write side
    // ========================================================================

    /// Queue a message for sending.
    ///
    /// Returns false (and drops the message) once shutdown was requested.
    /// The caller is responsible for raising the write request.
    pub fn enqueue(&self, message: P::Message) -> bool {
        if self.closing.load(Ordering::Acquire) {
            return false;
        }
        self.outbound.push(Outbound::Message(message));
        true
    }

    /// Queue the shutdown sentinel. Returns false if already queued.
    pub fn enqueue_shutdown(&self) -> bool {
        if self.closing.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.outbound.push(Outbound::Shutdown);
        true
    }

    /// Entries waiting in the outbound queue.
    pub fn pending_outbound(&self) -> usize {
        self.outbound.len()
    }

    /// Encode and write queued messages until drained, blocked or halted.
    ///
    /// Clears the write request on `state` once the queue is seen empty, then
    /// checks the queue once more so a concurrent enqueue is never stranded.
    pub fn write<W>(&self, ctx: &WorkerContext, writer: &mut W, state: &ConnectionState) -> Result<WriteStatus>
    where
        W: Write + ?Sized,
    {
        let mut guard = self.tx.lock();
        let tx = &mut *guard;
        let mut written = 0;

        loop {
            if tx.current.is_none() {
                if tx.halted {
                    state.clear_write_request();
                    return Ok(WriteStatus::Halted);
                }
                let next = match self.outbound.pop() {
                    Some(next) => next,
                    None => {
                        state.clear_write_request();
                        match self.outbound.pop() {
                            Some(next) => next,
                            None => return Ok(WriteStatus::Drained(written)),
                        }
                    }
                };
                match next {
                    Outbound::Message(message) => {
                        tx.current = Some(self.encode(ctx, &message)?);
                    }
                    Outbound::Shutdown => {
                        tx.halted = true;
                        state.clear_write_request();
                        let dropped = self.discard_outbound();
                        if dropped > 0 {
                            log::debug!(
                                "[framer] dropped {} message(s) queued after shutdown",
                                dropped
                            );
                        }
                        return Ok(WriteStatus::Halted);
                    }
                }
            }

            let Some(buf) = tx.current.as_mut() else {
                continue;
            };
            match writer.write(buf.chunk()) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "transport accepted no bytes",
                    )
                    .into());
                }
                Ok(n) => {
                    buf.advance(n);
                    written += n;
                    if !buf.has_remaining() {
                        if let Some(done) = tx.current.take() {
                            self.metrics.record_frame_encoded(done.limit());
                            self.pool.release(ctx.slot(), done);
                        }
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(WriteStatus::Blocked(written));
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Encode `message` into a buffer of its exact frame size.
    fn encode(&self, ctx: &WorkerContext, message: &P::Message) -> Result<Buffer> {
        let encoder = self.protocol.encoder(message).ok_or_else(|| {
            Error::ProtocolLookup("no encoder registered for outbound message".into())
        })?;
        let size = self.protocol.header_size() + encoder.body_size(message);
        let max = self.protocol.max_message_size();
        if size > max {
            return Err(Error::Framing(format!(
                "outbound frame of {} bytes exceeds maximum {}",
                size, max
            )));
        }

        let mut buf = self.pool.lease(ctx.slot(), size)?;
        encoder.encode(message, buf.chunk_mut())?;
        buf.advance(size);
        buf.flip();
        Ok(buf)
    }

    fn discard_outbound(&self) -> usize {
        let mut dropped = 0;
        while let Some(entry) = self.outbound.pop() {
            if matches!(entry, Outbound::Message(_)) {
                dropped += 1;
            }
        }
        dropped
    }
}
