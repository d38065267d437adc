//! The status/error vocabulary shared by every component of the socket core.
//!
//! Mirrors the kinds enumerated in the design: most are fatal and route
//! through `OnFault`; `ReadTimeout`/`WriteTimeout` are surfaced to the Stream
//! without tearing the connection down.

use std::io;
use std::time::Duration;
use thiserror::Error;

/// Status returned by every fallible operation in the socket core.
#[derive(Debug, Error)]
pub enum XrdStatus {
    #[error("poller registration failed: {0}")]
    PollerError(String),

    #[error("connect failed: {0}")]
    ConnectError(#[source] io::Error),

    #[error("connect timed out after {elapsed:?} (limit {limit:?})")]
    ConnectTimeout { elapsed: Duration, limit: Duration },

    #[error("socket error: {0}")]
    SocketError(#[source] io::Error),

    #[error("TLS error: {0}")]
    TlsError(#[source] rustls::Error),

    #[error("handshake error: {0}")]
    HandshakeError(String),

    #[error("corrupted header in framed status response")]
    HeaderCorrupted,

    #[error("read timeout: idle for {idle:?}")]
    ReadTimeout { idle: Duration },

    #[error("write timeout: idle for {idle:?}")]
    WriteTimeout { idle: Duration },

    #[error("illegal state transition: {0}")]
    IllegalTransition(String),
}

impl XrdStatus {
    /// Whether this status is terminal for the connection (routes through
    /// `OnFault`) as opposed to merely surfaced to the Stream for it to act on.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::ReadTimeout { .. } | Self::WriteTimeout { .. })
    }

    /// Stable string for metrics labeling, mirroring `HandlerError::error_code`
    /// in the ambient stack this crate follows.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::PollerError(_) => "poller_error",
            Self::ConnectError(_) => "connect_error",
            Self::ConnectTimeout { .. } => "connect_timeout",
            Self::SocketError(_) => "socket_error",
            Self::TlsError(_) => "tls_error",
            Self::HandshakeError(_) => "handshake_error",
            Self::HeaderCorrupted => "header_corrupted",
            Self::ReadTimeout { .. } => "read_timeout",
            Self::WriteTimeout { .. } => "write_timeout",
            Self::IllegalTransition(_) => "illegal_transition",
        }
    }
}

impl From<rustls::Error> for XrdStatus {
    fn from(e: rustls::Error) -> Self {
        Self::TlsError(e)
    }
}

impl From<crate::socket::TlsFailure> for XrdStatus {
    fn from(e: crate::socket::TlsFailure) -> Self {
        match e {
            crate::socket::TlsFailure::Tls(e) => Self::TlsError(e),
            crate::socket::TlsFailure::Io(e) => Self::SocketError(e),
        }
    }
}
