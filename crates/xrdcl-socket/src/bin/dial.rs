//! Manual smoke-test binary: connects to a real address, runs a trivial
//! one-step handshake, and logs every callback. Not part of the crate's
//! public contract.
//!
//! ```text
//! RUST_LOG=debug cargo run --bin dial -- 127.0.0.1:1094
//! ```

use async_trait::async_trait;
use bytes::Bytes;
use std::env;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use xrdcl_proto::transport::MessageFramer;
use xrdcl_proto::{HandShakeData, HandShakeStep, Message, TransportHandler, XrdStatus};
use xrdcl_socket::{ConnectParams, ConnectRequest, HandshakeInfo, SocketHandler, Stream};

struct NoopFramer;

impl MessageFramer for NoopFramer {
    fn parse_handshake_frame(&self, buf: &[u8]) -> Result<Option<(Message, usize)>, XrdStatus> {
        if buf.is_empty() {
            return Ok(None);
        }
        let len = buf.len();
        Ok(Some((Message::new(0, Bytes::copy_from_slice(buf)), len)))
    }

    fn parse_message(&self, buf: &[u8]) -> Result<Option<(Message, usize)>, XrdStatus> {
        self.parse_handshake_frame(buf)
    }

    fn encode_message(&self, msg: &Message) -> Bytes {
        msg.payload.clone()
    }
}

struct EchoTransport {
    framer: NoopFramer,
}

impl TransportHandler for EchoTransport {
    type ChannelData = ();

    fn handshake_init(&self, _channel_data: &(), hs: &mut HandShakeData) {
        hs.out = Some(Bytes::from_static(b"hello"));
    }

    fn handshake_next(
        &self,
        _channel_data: &(),
        _hs: &mut HandShakeData,
    ) -> Result<HandShakeStep, XrdStatus> {
        Ok(HandShakeStep::Done)
    }

    fn needs_tls(&self, _channel_data: &()) -> bool {
        false
    }

    fn is_wait_response(&self, _msg: &Message) -> Option<Duration> {
        None
    }

    fn framer(&self) -> &dyn MessageFramer {
        &self.framer
    }
}

struct LoggingStream;

#[async_trait]
impl Stream for LoggingStream {
    async fn on_connect(&self, result: Result<(), XrdStatus>) {
        info!(?result, "on_connect");
    }

    async fn on_handshake_done(&self, info: HandshakeInfo) {
        info!(?info, "on_handshake_done");
    }

    async fn on_incoming_message(&self, msg: Message) {
        info!(len = msg.len(), "on_incoming_message");
    }

    async fn on_ready_to_write(&self) -> Option<Message> {
        None
    }

    async fn on_read_timeout(&self, idle: Duration) {
        info!(?idle, "on_read_timeout");
    }

    async fn on_write_timeout(&self, idle: Duration) {
        info!(?idle, "on_write_timeout");
    }

    async fn on_fault(&self, status: XrdStatus) {
        info!(%status, "on_fault");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let addr: SocketAddr = env::args()
        .nth(1)
        .ok_or_else(|| anyhow::anyhow!("usage: dial <host:port>"))?
        .parse()?;

    let transport = Arc::new(EchoTransport { framer: NoopFramer });
    let request = ConnectRequest::new(addr, addr.to_string(), transport, (), ConnectParams::default());
    let stream = Arc::new(LoggingStream);
    let handle = SocketHandler::spawn(request, stream);

    tokio::time::sleep(Duration::from_secs(5)).await;
    handle.close().await;
    Ok(())
}
