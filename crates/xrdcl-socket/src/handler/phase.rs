//! The eight lifecycle states and the read/write sub-driver slots.

use crate::drivers::{HsReader, HsWriter, MsgReader, MsgWriter};

/// `SocketHandler` lifecycle state.
///
/// `TlsHandshaking` covers both the initial handshake's TLS hand-off and a
/// mid-stream renegotiation: the two differ only in what phase is resumed
/// on `Ok`, which is tracked separately via `SocketHandler::handshake_info`
/// rather than as two enum variants, since both ultimately resume `Ready`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Connecting,
    Handshaking,
    TlsHandshaking,
    HandshakeWait,
    Ready,
    Closing,
    Closed,
}

impl Phase {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Handshaking => "handshaking",
            Self::TlsHandshaking => "tls_handshaking",
            Self::HandshakeWait => "handshake_wait",
            Self::Ready => "ready",
            Self::Closing => "closing",
            Self::Closed => "closed",
        }
    }
}

/// At most one of these is installed at a time, or none before TCP-connect.
pub enum ReadSlot {
    Hs(HsReader),
    Msg(MsgReader),
}

/// Symmetric with `ReadSlot`: at most one write driver installed at a time.
pub enum WriteSlot {
    Hs(HsWriter),
    Msg(MsgWriter),
}
