//! Opaque framed protocol traffic.
//!
//! The handler never inspects a `Message`'s payload except through the two
//! narrow seams the transport exposes: `TransportHandler::is_wait_response`
//! during handshake, and header-corruption detection inside the framer.

use bytes::Bytes;

/// A single framed unit of XRootD wire traffic — a handshake frame or a
/// fully-assembled protocol message, depending on which reader produced it.
#[derive(Debug, Clone)]
pub struct Message {
    /// Sub-stream this message belongs to, echoed back from the header the
    /// transport parsed; 0 for the control stream.
    pub sub_stream: u16,
    /// Raw payload, already stripped of framing (length prefix, etc).
    pub payload: Bytes,
}

impl Message {
    pub fn new(sub_stream: u16, payload: Bytes) -> Self {
        Self { sub_stream, payload }
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}
