// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Marker protocol: a minimal reference protocol.
//!
//! # Wire format (big-endian)
//!
//! ```text
//! +--------+--------+--------+--------+-------------------+
//! |  0xAA  |  0x55  |     type id     |       body        |
//! +--------+--------+--------+--------+-------------------+
//!   type 0 = i32 (4-byte body), type 1 = i64 (8-byte body)
//! ```
//!
//! Integers are echoed back, longs come back incremented by one.

use crate::connection::Link;
use crate::error::{Error, Result};

use super::{Decoder, Encoder, Handler, HandlerError, Protocol, Seek, StripeKey, Striped};

/// Frame marker, first two header bytes.
pub const MARKER: [u8; 2] = [0xAA, 0x55];

/// Header length in bytes.
pub const HEADER_SIZE: usize = 4;

/// Largest frame accepted or produced.
pub const MAX_MESSAGE_SIZE: usize = 1024;

/// Type id of [`MarkerMessage::Int`].
pub const TYPE_INT: u16 = 0;

/// Type id of [`MarkerMessage::Long`].
pub const TYPE_LONG: u16 = 1;

// ============================================================================
// Message
// ============================================================================

/// Message of the marker protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MarkerMessage {
    /// 32-bit integer
    Int(i32),
    /// 64-bit integer
    Long(i64),
}

impl MarkerMessage {
    /// Wire type id.
    pub fn type_id(&self) -> u16 {
        match self {
            MarkerMessage::Int(_) => TYPE_INT,
            MarkerMessage::Long(_) => TYPE_LONG,
        }
    }

    /// Body length on the wire.
    pub fn body_size(&self) -> usize {
        match self {
            MarkerMessage::Int(_) => 4,
            MarkerMessage::Long(_) => 8,
        }
    }

    /// Encode a complete frame into a fresh vector.
    pub fn to_frame(&self) -> Vec<u8> {
        let mut frame = vec![0u8; HEADER_SIZE + self.body_size()];
        write_header(&mut frame, self.type_id());
        match self {
            MarkerMessage::Int(v) => frame[HEADER_SIZE..].copy_from_slice(&v.to_be_bytes()),
            MarkerMessage::Long(v) => frame[HEADER_SIZE..].copy_from_slice(&v.to_be_bytes()),
        }
        frame
    }

    /// Decode a complete frame (header included).
    pub fn from_frame(frame: &[u8]) -> Result<Self> {
        if frame.len() < HEADER_SIZE || frame[..2] != MARKER {
            return Err(Error::Framing("missing frame marker".into()));
        }
        let (header, body) = frame.split_at(HEADER_SIZE);
        match type_id(header) {
            TYPE_INT => IntCodec.decode(header, body),
            TYPE_LONG => LongCodec.decode(header, body),
            other => Err(Error::Framing(format!("unknown type id {other}"))),
        }
    }
}

impl Striped for MarkerMessage {
    fn stripe_key(&self) -> StripeKey {
        0
    }
}

// ============================================================================
// Header helpers
// ============================================================================

/// Scan `window` for the frame marker.
///
/// A trailing `0xAA` is kept since it may be the first half of a marker
/// split across reads.
pub fn seek_marker(window: &[u8]) -> Seek {
    if let Some(offset) = window.windows(2).position(|pair| pair == MARKER) {
        return Seek::Found(offset);
    }
    match window.last() {
        Some(&b) if b == MARKER[0] => Seek::Discard(window.len() - 1),
        _ => Seek::Discard(window.len()),
    }
}

/// Type id of an aligned header.
pub fn type_id(header: &[u8]) -> u16 {
    u16::from_be_bytes([header[2], header[3]])
}

fn write_header(frame: &mut [u8], type_id: u16) {
    frame[..2].copy_from_slice(&MARKER);
    frame[2..HEADER_SIZE].copy_from_slice(&type_id.to_be_bytes());
}

// ============================================================================
// Codecs
// ============================================================================

/// Codec for type 0 (i32 body).
#[derive(Clone, Copy, Debug, Default)]
pub struct IntCodec;

impl Decoder<MarkerMessage> for IntCodec {
    fn decode(&self, _header: &[u8], body: &[u8]) -> Result<MarkerMessage> {
        let bytes: [u8; 4] = body
            .try_into()
            .map_err(|_| Error::Framing(format!("int body is {} bytes", body.len())))?;
        Ok(MarkerMessage::Int(i32::from_be_bytes(bytes)))
    }
}

impl Encoder<MarkerMessage> for IntCodec {
    fn body_size(&self, _message: &MarkerMessage) -> usize {
        4
    }

    fn encode(&self, message: &MarkerMessage, frame: &mut [u8]) -> Result<()> {
        let MarkerMessage::Int(v) = message else {
            return Err(Error::Framing("int codec given a long".into()));
        };
        write_header(frame, TYPE_INT);
        frame[HEADER_SIZE..].copy_from_slice(&v.to_be_bytes());
        Ok(())
    }
}

/// Codec for type 1 (i64 body).
#[derive(Clone, Copy, Debug, Default)]
pub struct LongCodec;

impl Decoder<MarkerMessage> for LongCodec {
    fn decode(&self, _header: &[u8], body: &[u8]) -> Result<MarkerMessage> {
        let bytes: [u8; 8] = body
            .try_into()
            .map_err(|_| Error::Framing(format!("long body is {} bytes", body.len())))?;
        Ok(MarkerMessage::Long(i64::from_be_bytes(bytes)))
    }
}

impl Encoder<MarkerMessage> for LongCodec {
    fn body_size(&self, _message: &MarkerMessage) -> usize {
        8
    }

    fn encode(&self, message: &MarkerMessage, frame: &mut [u8]) -> Result<()> {
        let MarkerMessage::Long(v) = message else {
            return Err(Error::Framing("long codec given an int".into()));
        };
        write_header(frame, TYPE_LONG);
        frame[HEADER_SIZE..].copy_from_slice(&v.to_be_bytes());
        Ok(())
    }
}

// ============================================================================
// Protocol
// ============================================================================

/// Session of a marker-protocol connection.
pub struct MarkerSession {
    link: Link<MarkerProtocol>,
}

impl MarkerSession {
    /// Handle to the owning connection.
    pub fn link(&self) -> &Link<MarkerProtocol> {
        &self.link
    }
}

/// Writes every int back to its sender.
#[derive(Debug, Default)]
pub struct EchoHandler;

impl Handler<MarkerProtocol> for EchoHandler {
    fn handle(
        &self,
        session: &MarkerSession,
        message: MarkerMessage,
    ) -> std::result::Result<(), HandlerError> {
        session.link().write(message);
        Ok(())
    }
}

/// Replies to every long with its successor.
#[derive(Debug, Default)]
pub struct IncrementHandler;

impl Handler<MarkerProtocol> for IncrementHandler {
    fn handle(
        &self,
        session: &MarkerSession,
        message: MarkerMessage,
    ) -> std::result::Result<(), HandlerError> {
        match message {
            MarkerMessage::Long(v) => {
                session.link().write(MarkerMessage::Long(v.wrapping_add(1)));
                Ok(())
            }
            other => Err(format!("increment handler given {other:?}").into()),
        }
    }
}

/// The marker protocol with echo (int) and increment (long) handlers.
#[derive(Debug, Default)]
pub struct MarkerProtocol {
    int: IntCodec,
    long: LongCodec,
    echo: EchoHandler,
    increment: IncrementHandler,
}

impl MarkerProtocol {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Protocol for MarkerProtocol {
    type Message = MarkerMessage;
    type Session = MarkerSession;

    fn header_size(&self) -> usize {
        HEADER_SIZE
    }

    fn max_message_size(&self) -> usize {
        MAX_MESSAGE_SIZE
    }

    fn seek_to_header(&self, window: &[u8]) -> Seek {
        seek_marker(window)
    }

    fn body_size(&self, header: &[u8]) -> Result<usize> {
        match type_id(header) {
            TYPE_INT => Ok(4),
            TYPE_LONG => Ok(8),
            other => Err(Error::Framing(format!("unknown type id {other}"))),
        }
    }

    fn decoder(&self, header: &[u8]) -> Option<&dyn Decoder<MarkerMessage>> {
        match type_id(header) {
            TYPE_INT => Some(&self.int),
            TYPE_LONG => Some(&self.long),
            _ => None,
        }
    }

    fn encoder(&self, message: &MarkerMessage) -> Option<&dyn Encoder<MarkerMessage>> {
        match message {
            MarkerMessage::Int(_) => Some(&self.int),
            MarkerMessage::Long(_) => Some(&self.long),
        }
    }

    fn handler(&self, message: &MarkerMessage) -> Option<&dyn Handler<Self>> {
        match message {
            MarkerMessage::Int(_) => Some(&self.echo),
            MarkerMessage::Long(_) => Some(&self.increment),
        }
    }

    fn new_session(&self, link: Link<Self>) -> MarkerSession {
        MarkerSession { link }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_int_frame_layout() {
        let frame = MarkerMessage::Int(0x77).to_frame();
        assert_eq!(frame, vec![0xAA, 0x55, 0x00, 0x00, 0x00, 0x00, 0x00, 0x77]);
        assert_eq!(
            MarkerMessage::from_frame(&frame).unwrap(),
            MarkerMessage::Int(0x77)
        );
    }

    #[test]
    fn test_encoder_matches_to_frame() {
        let protocol = MarkerProtocol::new();
        let msg = MarkerMessage::Long(0x0123_4567);
        let encoder = protocol.encoder(&msg).unwrap();
        let mut frame = vec![0u8; HEADER_SIZE + encoder.body_size(&msg)];
        encoder.encode(&msg, &mut frame).unwrap();
        assert_eq!(frame, msg.to_frame());
    }

    #[test]
    fn test_seek_found() {
        assert_eq!(seek_marker(&[0xAA, 0x55, 0x00, 0x01]), Seek::Found(0));
        assert_eq!(seek_marker(&[0x01, 0xAA, 0x55, 0x00]), Seek::Found(1));
        assert_eq!(seek_marker(&[0x01, 0x02, 0xAA, 0x55]), Seek::Found(2));
    }

    #[test]
    fn test_seek_repeated_marker_byte() {
        assert_eq!(seek_marker(&[0xAA, 0xAA, 0x55, 0x00]), Seek::Found(1));
        assert_eq!(seek_marker(&[0xAA, 0xAA, 0xAA, 0xAA]), Seek::Discard(3));
    }

    #[test]
    fn test_seek_discard() {
        assert_eq!(seek_marker(&[0x01, 0x02, 0x03, 0x04]), Seek::Discard(4));
        assert_eq!(seek_marker(&[0x55, 0x55, 0x55, 0xAA]), Seek::Discard(3));
        assert_eq!(seek_marker(&[]), Seek::Discard(0));
    }

    #[test]
    fn test_body_size_and_lookup() {
        let protocol = MarkerProtocol::new();
        assert_eq!(protocol.body_size(&[0xAA, 0x55, 0, 0]).unwrap(), 4);
        assert_eq!(protocol.body_size(&[0xAA, 0x55, 0, 1]).unwrap(), 8);
        assert!(protocol.body_size(&[0xAA, 0x55, 0, 9]).is_err());
        assert!(protocol.decoder(&[0xAA, 0x55, 0, 9]).is_none());
    }

    #[test]
    fn test_codec_rejects_wrong_variant() {
        let mut frame = [0u8; 8];
        assert!(IntCodec.encode(&MarkerMessage::Long(1), &mut frame).is_err());
        assert!(IntCodec.decode(&[0xAA, 0x55, 0, 0], &[1, 2]).is_err());
    }
}
