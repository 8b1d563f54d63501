// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Protocol contract.
//!
//! A [`Protocol`] tells the engine how to find frame boundaries in a byte
//! stream, how big each frame is, and which [`Decoder`], [`Encoder`] and
//! [`Handler`] serve a given header or message.
//!
//! ```text
//! bytes --seek_to_header--> header --body_size--> body --Decoder--> Message
//! Message --Handler(session)--> Link::write(reply) --Encoder--> bytes
//! ```
//!
//! Every message carries a [`StripeKey`]. Messages sharing a key on the same
//! connection are handled one at a time, in arrival order;
//! [`UNORDERED`] messages carry no ordering constraint.

pub mod marker;

use crate::connection::Link;
use crate::error::Result;

/// Ordering key carried by every message.
pub type StripeKey = i32;

/// Key of messages with no ordering constraint.
pub const UNORDERED: StripeKey = -1;

/// A value routed by stripe key.
pub trait Striped {
    /// Ordering key of this value.
    fn stripe_key(&self) -> StripeKey;
}

/// Outcome of scanning a window for a frame header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Seek {
    /// A header starts at this offset.
    Found(usize),
    /// No header; this many leading bytes can never start one.
    Discard(usize),
}

/// Error type returned by handlers.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Turns one complete frame into a message.
pub trait Decoder<M>: Send + Sync {
    /// Decode a frame. `header` has `header_size` bytes, `body` exactly the
    /// size announced by the header.
    fn decode(&self, header: &[u8], body: &[u8]) -> Result<M>;
}

/// Turns a message into one complete frame.
pub trait Encoder<M>: Send + Sync {
    /// Body length of the encoded message.
    fn body_size(&self, message: &M) -> usize;

    /// Write header and body into `frame`, which is exactly
    /// `header_size + body_size(message)` bytes long.
    fn encode(&self, message: &M, frame: &mut [u8]) -> Result<()>;
}

/// Business logic for a message.
pub trait Handler<P: Protocol>: Send + Sync {
    /// Handle `message` received on the connection owning `session`.
    fn handle(
        &self,
        session: &P::Session,
        message: P::Message,
    ) -> std::result::Result<(), HandlerError>;
}

/// A binary wire protocol.
///
/// Header size and maximum message size are fixed for the lifetime of the
/// protocol instance.
pub trait Protocol: Send + Sync + Sized + 'static {
    /// Decoded message type.
    type Message: Striped + Send + 'static;

    /// Protocol-specific per-connection object handed to handlers.
    type Session: Send + Sync + 'static;

    /// Fixed header length in bytes.
    fn header_size(&self) -> usize;

    /// Largest frame (header + body) accepted or produced.
    fn max_message_size(&self) -> usize;

    /// Locate a header in `window` (exactly `header_size` bytes).
    ///
    /// Must be idempotent and must not discard bytes that could begin a
    /// header.
    fn seek_to_header(&self, window: &[u8]) -> Seek;

    /// Body length announced by an aligned header.
    fn body_size(&self, header: &[u8]) -> Result<usize>;

    /// Decoder for the frame starting with `header`.
    fn decoder(&self, header: &[u8]) -> Option<&dyn Decoder<Self::Message>>;

    /// Encoder for `message`.
    fn encoder(&self, message: &Self::Message) -> Option<&dyn Encoder<Self::Message>>;

    /// Handler for `message`.
    fn handler(&self, message: &Self::Message) -> Option<&dyn Handler<Self>>;

    /// Build the session object for a newly registered connection.
    fn new_session(&self, link: Link<Self>) -> Self::Session;
}
