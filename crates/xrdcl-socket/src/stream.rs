//! The `Stream` collaborator: owns the handler, supplies outgoing traffic,
//! and receives connection/message/fault callbacks.

use async_trait::async_trait;
use std::time::Duration;
use xrdcl_proto::{Message, XrdStatus};

/// Negotiated attributes handed to the Stream once the application
/// handshake completes. If `tls_required` is set, the TLS upgrade has
/// already finished by the time this callback fires — `on_handshake_done`
/// is always the last of the two, never the first.
#[derive(Debug, Clone, Copy, Default)]
pub struct HandshakeInfo {
    pub tls_required: bool,
}

/// Callbacks the handler invokes on its owning Stream.
///
/// Ordering guarantee: `on_connect` precedes `on_handshake_done` precedes the
/// first `on_incoming_message`, which precedes any `on_fault` caused by a
/// protocol error; `on_fault` is terminal and delivered at most once.
#[async_trait]
pub trait Stream: Send + Sync {
    async fn on_connect(&self, result: Result<(), XrdStatus>);

    async fn on_handshake_done(&self, info: HandshakeInfo);

    async fn on_incoming_message(&self, msg: Message);

    /// Pull model: the handler asks for the next outbound message only once
    /// the previous one has fully drained and only once the connection is
    /// ready for application traffic.
    async fn on_ready_to_write(&self) -> Option<Message>;

    /// Surfaced without tearing the connection down; the Stream decides
    /// whether and how to act.
    async fn on_read_timeout(&self, idle: Duration);

    async fn on_write_timeout(&self, idle: Duration);

    /// Terminal; delivered at most once, and no other callback follows it.
    async fn on_fault(&self, status: XrdStatus);
}
