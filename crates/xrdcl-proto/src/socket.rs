//! The non-blocking `Socket` contract.
//!
//! The reactor (a `Poller`-shaped abstraction elsewhere) and the socket are
//! fused here: on Tokio, `readable()`/`writable()` *are* "enable notification
//! for one event, then implicitly disable it" — there is no separate
//! registration object to model; nothing here ever drives a standalone
//! poller type, only `TcpStream` directly inside `tokio::select!`. See
//! DESIGN.md for the reasoning behind this.

use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;

/// Error surface for the two TLS-driving `Socket` methods. Kept distinct from
/// plain `io::Error` so a rejected certificate or a protocol-level alert
/// reaches the handler as `rustls::Error` instead of being collapsed into an
/// opaque `io::Error` first — the handler needs the distinction to report
/// `XrdStatus::TlsError` rather than `XrdStatus::SocketError`.
#[derive(Debug, thiserror::Error)]
pub enum TlsFailure {
    #[error(transparent)]
    Tls(#[from] rustls::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Outcome of one step of a TLS handshake, matching `Socket::TlsHandshake()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsHandshakeStep {
    /// TLS session is up.
    Ok,
    /// Need read-readiness before the next step can proceed.
    RetryRead,
    /// Need write-readiness before the next step can proceed.
    RetryWrite,
}

/// Which readiness kind a sub-driver is currently waiting on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoDirection {
    Read,
    Write,
}

/// A non-blocking socket, optionally TLS-capable.
///
/// Implementations own the file descriptor exclusively (invariant: the
/// handler never shares a `Socket` across tasks).
#[async_trait]
pub trait Socket: Send {
    /// Non-blocking read; `Ok(0)` means the peer closed the connection in
    /// an orderly fashion (distinct from `WouldBlock`, which is represented
    /// as `io::ErrorKind::WouldBlock`).
    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Non-blocking write.
    fn try_write(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Suspend until the socket is read-ready.
    async fn readable(&self) -> io::Result<()>;

    /// Suspend until the socket is write-ready.
    async fn writable(&self) -> io::Result<()>;

    fn peer_addr(&self) -> io::Result<SocketAddr>;

    /// Whether a TLS session has been established over this socket.
    fn is_tls(&self) -> bool;

    /// Drive one step of the TLS handshake. Must only be called once
    /// `start_tls` has been invoked.
    fn tls_handshake_step(&mut self) -> Result<TlsHandshakeStep, TlsFailure>;

    /// Begin a TLS handshake as a client connecting to `server_name`.
    fn start_tls_client(&mut self, server_name: &str) -> Result<(), TlsFailure>;

    /// Lets TLS rewrite a read-readiness into a write-readiness and back
    /// during mid-stream renegotiation (§4.3). Identity when no TLS session
    /// is active or no renegotiation is in flight.
    fn map_event(&self, direction: IoDirection) -> IoDirection;
}

/// Address-family classification for `GetIpStack`, resolved once at connect
/// time from the numeric peer address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpStack {
    Ipv4,
    Ipv6,
    /// An IPv6 socket carrying an IPv4-mapped address (`::ffff:a.b.c.d`).
    Ipv4MappedIpv6,
}

impl IpStack {
    pub fn classify(addr: &SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(_) => Self::Ipv4,
            SocketAddr::V6(v6) => {
                if let Some(v4) = v6.ip().to_ipv4_mapped() {
                    let _ = v4; // documents the mapping; classification only needs the kind
                    Self::Ipv4MappedIpv6
                } else {
                    Self::Ipv6
                }
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ipv4 => "IPv4",
            Self::Ipv6 => "IPv6",
            Self::Ipv4MappedIpv6 => "IPv4-mapped IPv6",
        }
    }
}
