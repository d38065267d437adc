//! The handshake sub-machine's shared, transport-mutated carrier.

use crate::message::Message;
use bytes::Bytes;

/// Outcome of feeding one inbound handshake frame to
/// `TransportHandler::handshake_next`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandShakeStep {
    /// The transport populated the next outbound frame; keep looping.
    Continue,
    /// The application handshake is complete.
    Done,
    /// The transport rejected the exchange; fatal.
    Fatal,
}

/// Transport-controlled carrier of the in-flight handshake exchange.
///
/// Owned by the handler for the lifetime of the connection up to handshake
/// completion; mutated only by the transport's
/// `handshake_init`/`handshake_next`.
#[derive(Debug, Default)]
pub struct HandShakeData {
    /// Monotonically increasing step counter, bumped by the transport on
    /// each `Continue`.
    pub step: u32,
    /// Outbound frame prepared by the transport for the current step, taken
    /// by the HS writer when it is (re)built.
    pub out: Option<Bytes>,
    /// Most recently parsed inbound frame, set by the handler before calling
    /// `handshake_next`.
    pub inbound: Option<Message>,
}

impl HandShakeData {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the prepared outbound frame, leaving `None` behind. Used by the
    /// handler both to build a fresh HS writer and to rebuild one after a
    /// wait-response retry (the frame is cloned back in for the retry).
    pub fn take_outbound(&mut self) -> Option<Bytes> {
        self.out.take()
    }
}
