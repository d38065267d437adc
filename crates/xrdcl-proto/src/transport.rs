//! `TransportHandler` — protocol-specific policy injected into the socket
//! core: handshake framing/semantics, TLS requirement, and message framing.
//!
//! Deliberately synchronous: all of this is CPU-bound decoding over bytes
//! the sub-drivers have already read off the wire non-blockingly. No network
//! I/O is performed here.

use crate::handshake::{HandShakeData, HandShakeStep};
use crate::message::Message;
use crate::status::XrdStatus;
use std::time::Duration;

/// Protocol policy for one channel (one physical connection's lifetime).
///
/// Stateless across connections except through `ChannelData`, matching the
/// source's `AnyObject *pChannelData` — one instance is shared by every
/// sub-stream of a channel, `ChannelData` carries whatever per-channel state
/// the protocol needs (e.g. negotiated protocol version).
pub trait TransportHandler: Send + Sync {
    type ChannelData: Send + Sync;

    /// Populate the initial outbound handshake frame.
    fn handshake_init(&self, channel_data: &Self::ChannelData, hs: &mut HandShakeData);

    /// Advance the handshake by one step given the frame the HS reader just
    /// assembled. On `Continue`, `hs.out` must be populated with the next
    /// outbound frame before returning.
    fn handshake_next(
        &self,
        channel_data: &Self::ChannelData,
        hs: &mut HandShakeData,
    ) -> Result<HandShakeStep, XrdStatus>;

    /// Whether the negotiated transport requires a TLS session before any
    /// application message may cross the wire.
    fn needs_tls(&self, channel_data: &Self::ChannelData) -> bool;

    /// If `msg` is a "wait N seconds, retry" handshake response, the wait
    /// duration; `None` otherwise.
    fn is_wait_response(&self, msg: &Message) -> Option<Duration>;

    /// Framing/decoding policy for the four I/O sub-drivers.
    fn framer(&self) -> &dyn MessageFramer;
}

/// Decoding policy for both handshake frames and protocol messages.
///
/// Each `parse_*` call attempts to consume a complete unit from the front of
/// `buf`; returning `Ok(None)` means "need more bytes," never a partial
/// result — sub-drivers own buffering, the framer only ever sees the bytes
/// accumulated so far.
pub trait MessageFramer: Send + Sync {
    /// Parse one handshake frame. Returns the frame and the number of bytes
    /// of `buf` it consumed.
    fn parse_handshake_frame(&self, buf: &[u8]) -> Result<Option<(Message, usize)>, XrdStatus>;

    /// Parse one protocol message. A structural violation in a framed-status
    /// response must surface as `XrdStatus::HeaderCorrupted`, never as
    /// `Ok(None)` — that distinction is what lets the handler tell "need
    /// more bytes" apart from "this connection is unrecoverable."
    fn parse_message(&self, buf: &[u8]) -> Result<Option<(Message, usize)>, XrdStatus>;

    /// Encode an outbound protocol message onto the wire.
    fn encode_message(&self, msg: &Message) -> bytes::Bytes;
}
