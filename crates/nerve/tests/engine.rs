// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

#![allow(clippy::unreadable_literal)] // Wire test constants

//! End-to-end engine tests over loopback TCP.
//!
//! Clients are plain blocking `std::net::TcpStream`s with read timeouts so a
//! broken engine fails the test instead of hanging it.

use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::thread;
use std::time::{Duration, Instant};

use nerve::protocol::marker::{self, MarkerMessage, MarkerProtocol};
use nerve::{
    Decoder, Encoder, Engine, EngineConfig, Handler, HandlerError, Link, Protocol, Result, Seek,
};

fn config() -> EngineConfig {
    EngineConfig::default()
        .with_reactors(2)
        .with_io_workers(2)
        .with_dispatch_workers(2)
        .with_linger(Duration::from_secs(1))
}

fn start() -> (Engine<MarkerProtocol>, SocketAddr) {
    let engine = Engine::start(MarkerProtocol::new(), config()).expect("engine start");
    let addr = engine
        .listen("127.0.0.1:0".parse().expect("addr"))
        .expect("listen");
    (engine, addr)
}

fn client(addr: SocketAddr) -> TcpStream {
    let stream = TcpStream::connect(addr).expect("connect");
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .expect("read timeout");
    stream
}

/// Read one marker frame.
fn read_message(stream: &mut TcpStream) -> MarkerMessage {
    let mut header = [0u8; marker::HEADER_SIZE];
    stream.read_exact(&mut header).expect("frame header");
    let body_len = match marker::type_id(&header) {
        marker::TYPE_INT => 4,
        marker::TYPE_LONG => 8,
        other => panic!("unexpected type id {}", other),
    };
    let mut frame = header.to_vec();
    frame.resize(marker::HEADER_SIZE + body_len, 0);
    stream
        .read_exact(&mut frame[marker::HEADER_SIZE..])
        .expect("frame body");
    MarkerMessage::from_frame(&frame).expect("decode reply")
}

fn send(stream: &mut TcpStream, message: MarkerMessage) {
    stream.write_all(&message.to_frame()).expect("send");
}

fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}

/// Block until the engine closes the stream (EOF, or a reset when the
/// engine dropped unread input).
fn assert_closed_by_peer(stream: &mut TcpStream) {
    let mut rest = Vec::new();
    if let Err(e) = stream.read_to_end(&mut rest) {
        assert!(
            matches!(
                e.kind(),
                ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted | ErrorKind::BrokenPipe
            ),
            "expected close, got {}",
            e
        );
    }
}

// ============================================================================
// Marker protocol round trips
// ============================================================================

#[test]
fn test_echo_int() {
    let (engine, addr) = start();
    let mut stream = client(addr);

    send(&mut stream, MarkerMessage::Int(0x77));
    assert_eq!(read_message(&mut stream), MarkerMessage::Int(0x77));

    let snapshot = engine.metrics_snapshot();
    assert_eq!(snapshot.frames_decoded, 1);
    assert!(snapshot.messages_dispatched >= 1);
    engine.shutdown(Duration::from_secs(1));
}

#[test]
fn test_increment_long() {
    let (engine, addr) = start();
    let mut stream = client(addr);

    send(&mut stream, MarkerMessage::Long(0x1234567));
    assert_eq!(read_message(&mut stream), MarkerMessage::Long(0x1234568));
    engine.shutdown(Duration::from_secs(1));
}

#[test]
fn test_replies_keep_order_per_connection() {
    let (engine, addr) = start();
    let mut streams: Vec<TcpStream> = (0..4).map(|_| client(addr)).collect();

    let mut batch = Vec::new();
    for i in 0..500 {
        batch.extend(MarkerMessage::Int(i).to_frame());
        batch.extend(MarkerMessage::Long(i64::from(i) << 8).to_frame());
    }
    for stream in &mut streams {
        stream.write_all(&batch).expect("send batch");
    }

    for stream in &mut streams {
        for i in 0..500 {
            assert_eq!(read_message(stream), MarkerMessage::Int(i));
            assert_eq!(
                read_message(stream),
                MarkerMessage::Long((i64::from(i) << 8) + 1)
            );
        }
    }
    assert_eq!(engine.metrics_snapshot().frames_decoded, 4000);
    engine.shutdown(Duration::from_secs(1));
}

#[test]
fn test_garbage_before_frame_is_skipped() {
    let (engine, addr) = start();
    let mut stream = client(addr);

    // Partial markers scattered through the garbage, one left dangling at the end
    let garbage: Vec<u8> = (0..300u32)
        .map(|i| if i % 5 == 0 { 0xAA } else { (i % 0x50) as u8 })
        .chain([0xAA])
        .collect();
    stream.write_all(&garbage).expect("send garbage");
    send(&mut stream, MarkerMessage::Int(5));
    send(&mut stream, MarkerMessage::Int(6));

    assert_eq!(read_message(&mut stream), MarkerMessage::Int(5));
    assert_eq!(read_message(&mut stream), MarkerMessage::Int(6));
    assert_eq!(engine.metrics_snapshot().resync_bytes, garbage.len() as u64);
    engine.shutdown(Duration::from_secs(1));
}

#[test]
fn test_unknown_type_closes_connection() {
    let (engine, addr) = start();
    let mut stream = client(addr);

    stream
        .write_all(&[0xAA, 0x55, 0x00, 0x42, 0, 0, 0, 0])
        .expect("send bad frame");
    assert_closed_by_peer(&mut stream);
    assert!(wait_until(|| engine.connection_count() == 0));
    assert_eq!(engine.metrics_snapshot().framing_errors, 1);

    // Engine keeps serving
    let mut other = client(addr);
    send(&mut other, MarkerMessage::Int(1));
    assert_eq!(read_message(&mut other), MarkerMessage::Int(1));
    engine.shutdown(Duration::from_secs(1));
}

// ============================================================================
// Connection bookkeeping
// ============================================================================

#[test]
fn test_lookup_by_peer_address() {
    let (engine, addr) = start();
    let stream = client(addr);
    let local = stream.local_addr().expect("local addr");

    assert!(wait_until(|| engine.connection_by_addr(&local).is_some()));
    let link = engine.connection_by_addr(&local).expect("link");
    assert_eq!(link.peer_addr(), local);
    assert_eq!(engine.connection(link.id()).map(|l| l.id()), Some(link.id()));
    assert_eq!(engine.connections().len(), 1);

    drop(stream);
    assert!(wait_until(|| engine.connection_by_addr(&local).is_none()));
    engine.shutdown(Duration::from_secs(1));
}

#[test]
fn test_server_push_through_link() {
    let (engine, addr) = start();
    let mut stream = client(addr);
    let local = stream.local_addr().expect("local addr");

    assert!(wait_until(|| engine.connection_by_addr(&local).is_some()));
    let link = engine.connection_by_addr(&local).expect("link");
    assert!(link.write(MarkerMessage::Long(-1)));
    assert_eq!(read_message(&mut stream), MarkerMessage::Long(-1));

    link.shutdown();
    assert_closed_by_peer(&mut stream);
    assert!(!link.write(MarkerMessage::Long(2)));
    engine.shutdown(Duration::from_secs(1));
}

#[test]
fn test_peer_half_close_drains_then_closes() {
    let (engine, addr) = start();
    let mut stream = client(addr);

    send(&mut stream, MarkerMessage::Int(9));
    assert_eq!(read_message(&mut stream), MarkerMessage::Int(9));

    stream.shutdown(Shutdown::Write).expect("half close");
    assert_closed_by_peer(&mut stream);
    assert!(wait_until(|| engine.connection_count() == 0));
    engine.shutdown(Duration::from_secs(1));
}

#[test]
fn test_graceful_engine_shutdown() {
    let (engine, addr) = start();
    let mut streams: Vec<TcpStream> = (0..3).map(|_| client(addr)).collect();
    assert!(wait_until(|| engine.connection_count() == 3));

    engine.shutdown(Duration::from_secs(2));
    assert!(engine.is_stopped());
    assert_eq!(engine.connection_count(), 0);
    for stream in &mut streams {
        assert_closed_by_peer(stream);
    }
    assert!(TcpStream::connect(addr).is_err());

    let snapshot = engine.metrics_snapshot();
    assert_eq!(snapshot.connections_opened, 3);
    assert_eq!(snapshot.active_connections, 0);
}

#[test]
fn test_engine_to_engine() {
    let (server, addr) = start();
    let client_engine = Engine::start(MarkerProtocol::new(), config()).expect("client engine");

    let link = client_engine.connect(addr).expect("connect");
    assert!(link.write(MarkerMessage::Int(0x77)));

    // Each side echoes ints, so the exchange keeps going until one side stops.
    assert!(wait_until(|| server.metrics_snapshot().frames_decoded >= 3));
    assert!(client_engine.metrics_snapshot().frames_decoded >= 2);

    client_engine.shutdown(Duration::from_secs(1));
    server.shutdown(Duration::from_secs(1));
}

// ============================================================================
// Handler failures
// ============================================================================

/// Marker framing with faults planted on specific values: the echo handler
/// panics on 13 and rejects 7, handler lookup panics on 99, longs hit a
/// panicking decoder and 404 has no encoder.
#[derive(Default)]
struct FlakyProtocol {
    inner: MarkerProtocol,
    handler: FlakyEcho,
    exploding: ExplodingDecoder,
}

#[derive(Default)]
struct ExplodingDecoder;

impl Decoder<MarkerMessage> for ExplodingDecoder {
    fn decode(&self, _header: &[u8], _body: &[u8]) -> Result<MarkerMessage> {
        panic!("decoder blew up")
    }
}

#[derive(Default)]
struct FlakyEcho;

impl Handler<FlakyProtocol> for FlakyEcho {
    fn handle(
        &self,
        link: &Link<FlakyProtocol>,
        message: MarkerMessage,
    ) -> std::result::Result<(), HandlerError> {
        match message {
            MarkerMessage::Int(13) => panic!("thirteen"),
            MarkerMessage::Int(7) => Err("seven is rejected".into()),
            other => {
                link.write(other);
                Ok(())
            }
        }
    }
}

impl Protocol for FlakyProtocol {
    type Message = MarkerMessage;
    type Session = Link<FlakyProtocol>;

    fn header_size(&self) -> usize {
        self.inner.header_size()
    }

    fn max_message_size(&self) -> usize {
        self.inner.max_message_size()
    }

    fn seek_to_header(&self, window: &[u8]) -> Seek {
        self.inner.seek_to_header(window)
    }

    fn body_size(&self, header: &[u8]) -> Result<usize> {
        self.inner.body_size(header)
    }

    fn decoder(&self, header: &[u8]) -> Option<&dyn Decoder<MarkerMessage>> {
        if marker::type_id(header) == marker::TYPE_LONG {
            return Some(&self.exploding);
        }
        self.inner.decoder(header)
    }

    fn encoder(&self, message: &MarkerMessage) -> Option<&dyn Encoder<MarkerMessage>> {
        match message {
            MarkerMessage::Int(404) => None,
            other => self.inner.encoder(other),
        }
    }

    fn handler(&self, message: &MarkerMessage) -> Option<&dyn Handler<Self>> {
        if *message == MarkerMessage::Int(99) {
            panic!("routing table corrupted");
        }
        Some(&self.handler)
    }

    fn new_session(&self, link: Link<Self>) -> Link<Self> {
        link
    }
}

fn start_flaky() -> (Engine<FlakyProtocol>, SocketAddr) {
    let engine = Engine::start(FlakyProtocol::default(), config()).expect("engine start");
    let addr = engine
        .listen("127.0.0.1:0".parse().expect("addr"))
        .expect("listen");
    (engine, addr)
}

#[test]
fn test_handler_panic_closes_only_its_connection() {
    let (engine, addr) = start_flaky();

    let mut healthy = client(addr);
    let mut doomed = client(addr);

    send(&mut doomed, MarkerMessage::Int(13));
    assert_closed_by_peer(&mut doomed);

    send(&mut healthy, MarkerMessage::Int(42));
    assert_eq!(read_message(&mut healthy), MarkerMessage::Int(42));

    let snapshot = engine.metrics_snapshot();
    assert_eq!(snapshot.handler_failures, 1);
    assert_eq!(snapshot.worker_respawns, 0);
    engine.shutdown(Duration::from_secs(1));
}

#[test]
fn test_handler_error_closes_connection() {
    let (engine, addr) = start_flaky();

    let mut stream = client(addr);
    send(&mut stream, MarkerMessage::Int(1));
    assert_eq!(read_message(&mut stream), MarkerMessage::Int(1));

    send(&mut stream, MarkerMessage::Int(7));
    assert_closed_by_peer(&mut stream);
    assert!(wait_until(|| engine.connection_count() == 0));
    engine.shutdown(Duration::from_secs(1));
}

#[test]
fn test_handler_lookup_panic_closes_connection() {
    let (engine, addr) = start_flaky();
    let mut healthy = client(addr);
    let mut doomed = client(addr);

    send(&mut doomed, MarkerMessage::Int(99));
    assert_closed_by_peer(&mut doomed);

    send(&mut healthy, MarkerMessage::Int(3));
    assert_eq!(read_message(&mut healthy), MarkerMessage::Int(3));

    let snapshot = engine.metrics_snapshot();
    assert_eq!(snapshot.handler_failures, 1);
    assert_eq!(snapshot.worker_respawns, 0);
    engine.shutdown(Duration::from_secs(1));
}

#[test]
fn test_decoder_panic_closes_connection() {
    let (engine, addr) = start_flaky();
    let mut stream = client(addr);
    send(&mut stream, MarkerMessage::Int(1));
    assert_eq!(read_message(&mut stream), MarkerMessage::Int(1));

    send(&mut stream, MarkerMessage::Long(1));
    assert_closed_by_peer(&mut stream);
    assert!(wait_until(|| engine.connection_count() == 0));
    assert_eq!(engine.metrics_snapshot().framing_errors, 1);

    // I/O workers survive the panic
    let mut other = client(addr);
    send(&mut other, MarkerMessage::Int(2));
    assert_eq!(read_message(&mut other), MarkerMessage::Int(2));
    engine.shutdown(Duration::from_secs(1));
}

#[test]
fn test_missing_encoder_closes_connection() {
    let (engine, addr) = start_flaky();
    let mut stream = client(addr);

    send(&mut stream, MarkerMessage::Int(404));
    assert_closed_by_peer(&mut stream);
    assert!(wait_until(|| engine.connection_count() == 0));

    let snapshot = engine.metrics_snapshot();
    assert_eq!(snapshot.protocol_lookup_errors, 1);
    assert_eq!(snapshot.framing_errors, 0);
    engine.shutdown(Duration::from_secs(1));
}
