//! Loopback test harness: a scripted fake XRootD-ish server plus a
//! recording `Stream` double.
#![allow(dead_code)]

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use std::io::{Read, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use xrdcl_proto::transport::MessageFramer;
use xrdcl_proto::{HandShakeData, HandShakeStep, Message, TransportHandler, XrdStatus};
use xrdcl_socket::{HandshakeInfo, Stream};

/// Length-prefixed framing shared by handshake and message traffic: a
/// 4-byte big-endian length followed by that many payload bytes.
pub struct LengthPrefixedFramer;

impl MessageFramer for LengthPrefixedFramer {
    fn parse_handshake_frame(&self, buf: &[u8]) -> Result<Option<(Message, usize)>, XrdStatus> {
        self.parse_message(buf)
    }

    fn parse_message(&self, buf: &[u8]) -> Result<Option<(Message, usize)>, XrdStatus> {
        if buf.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_be_bytes(buf[0..4].try_into().unwrap()) as usize;
        if len > 1 << 20 {
            return Err(XrdStatus::HeaderCorrupted);
        }
        if buf.len() < 4 + len {
            return Ok(None);
        }
        let payload = Bytes::copy_from_slice(&buf[4..4 + len]);
        Ok(Some((Message::new(0, payload), 4 + len)))
    }

    fn encode_message(&self, msg: &Message) -> Bytes {
        let mut out = BytesMut::with_capacity(4 + msg.len());
        out.put_u32(msg.len() as u32);
        out.extend_from_slice(&msg.payload);
        out.freeze()
    }
}

#[derive(Default)]
pub struct TestChannelData;

/// A minimal, made-up handshake protocol for exercising the state machine:
/// client sends `HELLO`, server replies `CONTINUE` (loop once more),
/// `WAIT:<secs>`, `WELCOME` (done, no TLS), or `WELCOME-TLS` (done, TLS
/// required). Anything else is a fatal handshake error.
pub struct ScriptedTransport {
    framer: LengthPrefixedFramer,
    tls_required: AtomicBool,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self { framer: LengthPrefixedFramer, tls_required: AtomicBool::new(false) }
    }
}

impl Default for ScriptedTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportHandler for ScriptedTransport {
    type ChannelData = TestChannelData;

    fn handshake_init(&self, _channel_data: &TestChannelData, hs: &mut HandShakeData) {
        hs.out = Some(Bytes::from_static(b"HELLO"));
    }

    fn handshake_next(
        &self,
        _channel_data: &TestChannelData,
        hs: &mut HandShakeData,
    ) -> Result<HandShakeStep, XrdStatus> {
        let inbound = hs.inbound.take().expect("handler sets inbound before calling handshake_next");
        let text = String::from_utf8_lossy(&inbound.payload).to_string();
        match text.as_str() {
            "CONTINUE" => {
                hs.step += 1;
                hs.out = Some(Bytes::from_static(b"HELLO-AGAIN"));
                Ok(HandShakeStep::Continue)
            }
            "WELCOME" => Ok(HandShakeStep::Done),
            "WELCOME-TLS" => {
                self.tls_required.store(true, Ordering::Relaxed);
                Ok(HandShakeStep::Done)
            }
            "REJECT" => Ok(HandShakeStep::Fatal),
            other => Err(XrdStatus::HandshakeError(format!("unexpected handshake frame: {other}"))),
        }
    }

    fn needs_tls(&self, _channel_data: &TestChannelData) -> bool {
        self.tls_required.load(Ordering::Relaxed)
    }

    fn is_wait_response(&self, msg: &Message) -> Option<Duration> {
        let text = String::from_utf8_lossy(&msg.payload);
        text.strip_prefix("WAIT:").and_then(|secs| secs.parse().ok()).map(Duration::from_secs)
    }

    fn framer(&self) -> &dyn MessageFramer {
        &self.framer
    }
}

/// Every callback the handler delivered, in order, for assertions on P1/P2
/// ordering and on message content.
#[derive(Debug, Clone)]
pub enum RecordedEvent {
    Connect(bool),
    HandshakeDone(HandshakeInfo),
    IncomingMessage(Bytes),
    ReadTimeout(Duration),
    WriteTimeout(Duration),
    Fault(String),
}

#[derive(Default)]
pub struct RecordingStream {
    events: Mutex<Vec<RecordedEvent>>,
    outbound: Mutex<Vec<Bytes>>,
}

impl RecordingStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_outbound(outbound: Vec<Bytes>) -> Self {
        Self { events: Mutex::new(Vec::new()), outbound: Mutex::new(outbound) }
    }

    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Queues one more outbound message as if the Stream had just decided it
    /// has something to send; pairs with `SocketHandle::enable_uplink` in
    /// tests that exercise a late-arriving message.
    pub fn push_outbound(&self, payload: Bytes) {
        self.outbound.lock().unwrap().push(payload);
    }

    pub fn outbound_len(&self) -> usize {
        self.outbound.lock().unwrap().len()
    }
}

#[async_trait]
impl Stream for RecordingStream {
    async fn on_connect(&self, result: Result<(), XrdStatus>) {
        self.events.lock().unwrap().push(RecordedEvent::Connect(result.is_ok()));
    }

    async fn on_handshake_done(&self, info: HandshakeInfo) {
        self.events.lock().unwrap().push(RecordedEvent::HandshakeDone(info));
    }

    async fn on_incoming_message(&self, msg: Message) {
        self.events.lock().unwrap().push(RecordedEvent::IncomingMessage(msg.payload));
    }

    async fn on_ready_to_write(&self) -> Option<Message> {
        self.outbound.lock().unwrap().pop().map(|payload| Message::new(0, payload))
    }

    async fn on_read_timeout(&self, idle: Duration) {
        self.events.lock().unwrap().push(RecordedEvent::ReadTimeout(idle));
    }

    async fn on_write_timeout(&self, idle: Duration) {
        self.events.lock().unwrap().push(RecordedEvent::WriteTimeout(idle));
    }

    async fn on_fault(&self, status: XrdStatus) {
        self.events.lock().unwrap().push(RecordedEvent::Fault(status.error_code().to_string()));
    }
}

/// One step of a scripted fake server's conversation: read a length-prefixed
/// frame (ignored beyond presence) and reply with `response`, optionally
/// stalling first to exercise the handshake-wait path.
pub struct ScriptStep {
    pub response: &'static [u8],
    pub stall: Duration,
}

fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + payload.len());
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

async fn read_one_frame(stream: &mut TcpStream) -> std::io::Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await?;
    Ok(payload)
}

/// Spawns a loopback listener that accepts exactly one connection and plays
/// back `steps` in order: for each step, read one inbound frame, stall, then
/// write the scripted response frame.
pub async fn spawn_scripted_server(steps: Vec<ScriptStep>) -> (SocketAddr, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let handle = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        for step in steps {
            let _ = read_one_frame(&mut stream).await;
            if !step.stall.is_zero() {
                tokio::time::sleep(step.stall).await;
            }
            let frame = encode_frame(step.response);
            let _ = stream.write_all(&frame).await;
        }
        // Keep the connection open briefly so the client can finish reading
        // before the listener task (and the socket) drops.
        tokio::time::sleep(Duration::from_millis(200)).await;
    });

    (addr, handle)
}

/// Like `spawn_scripted_server`, but after the handshake script completes,
/// reads exactly one more length-prefixed application frame and hands its
/// payload back through the returned `JoinHandle`, so a test can confirm a
/// message the Stream queued actually reached the wire.
pub async fn spawn_scripted_server_capturing_one_message(
    steps: Vec<ScriptStep>,
) -> (SocketAddr, JoinHandle<Option<Vec<u8>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let handle = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        for step in steps {
            let _ = read_one_frame(&mut stream).await;
            if !step.stall.is_zero() {
                tokio::time::sleep(step.stall).await;
            }
            let frame = encode_frame(step.response);
            let _ = stream.write_all(&frame).await;
        }
        tokio::time::timeout(Duration::from_secs(2), read_one_frame(&mut stream)).await.ok().and_then(|r| r.ok())
    });

    (addr, handle)
}

/// Writes `cert_der` to a throwaway file and points
/// `XRDCL_EXTRA_TRUST_ANCHOR_DER` at it, so the client's (process-wide,
/// lazily-initialized) default TLS config trusts it. Must be called before
/// the first TLS connection of the test process.
pub fn trust_for_this_process(cert_der: &[u8]) {
    let path = std::env::temp_dir().join(format!("xrdcl-test-ca-{}.der", std::process::id()));
    std::fs::write(&path, cert_der).unwrap();
    std::env::set_var("XRDCL_EXTRA_TRUST_ANCHOR_DER", &path);
}

/// Spawns a loopback listener that accepts one connection, completes the
/// scripted handshake, then upgrades to TLS using a freshly generated
/// self-signed certificate, matching the real handler's
/// `start_tls_client` expectations (server name `localhost`). Trusts the
/// generated certificate for the current test process as a side effect.
pub async fn spawn_tls_upgrading_server(
    handshake_steps: Vec<ScriptStep>,
    post_handshake_message: Option<&'static [u8]>,
) -> (SocketAddr, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let cert_der = cert.cert.der().clone();
    let key_der = rustls_pki_types::PrivateKeyDer::Pkcs8(cert.signing_key.serialize_der().into());
    trust_for_this_process(&cert_der);

    let handle = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        for step in handshake_steps {
            let _ = read_one_frame(&mut stream).await;
            if !step.stall.is_zero() {
                tokio::time::sleep(step.stall).await;
            }
            let frame = encode_frame(step.response);
            let _ = stream.write_all(&frame).await;
        }

        let server_config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![cert_der], key_der)
            .unwrap();
        let mut conn = rustls::ServerConnection::new(Arc::new(server_config)).unwrap();

        // Drive the server side of the TLS handshake to completion against
        // the non-blocking stream using std::io adapters over spawn_blocking
        // would be overkill here; poll with readable()/writable() directly.
        loop {
            if conn.wants_write() {
                let mut adapter = TcpServerAdapter(&stream);
                let _ = conn.write_tls(&mut adapter);
            }
            if !conn.is_handshaking() {
                break;
            }
            stream.readable().await.unwrap();
            let mut adapter = TcpServerAdapter(&stream);
            match conn.read_tls(&mut adapter) {
                Ok(0) => break,
                Ok(_) => {
                    let _ = conn.process_new_packets();
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                Err(_) => break,
            }
        }

        if let Some(payload) = post_handshake_message {
            let frame = encode_frame(payload);
            let _ = conn.writer().write_all(&frame);
            while conn.wants_write() {
                let mut adapter = TcpServerAdapter(&stream);
                if conn.write_tls(&mut adapter).is_err() {
                    break;
                }
            }
        }

        tokio::time::sleep(Duration::from_millis(300)).await;
    });

    (addr, handle)
}

/// Like `spawn_tls_upgrading_server`, but deliberately skips
/// `trust_for_this_process`: the client's default TLS config will not trust
/// the freshly generated self-signed certificate, so the handshake is
/// expected to fail.
pub async fn spawn_tls_upgrading_server_untrusted(handshake_steps: Vec<ScriptStep>) -> (SocketAddr, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let cert_der = cert.cert.der().clone();
    let key_der = rustls_pki_types::PrivateKeyDer::Pkcs8(cert.signing_key.serialize_der().into());

    let handle = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        for step in handshake_steps {
            let _ = read_one_frame(&mut stream).await;
            if !step.stall.is_zero() {
                tokio::time::sleep(step.stall).await;
            }
            let frame = encode_frame(step.response);
            let _ = stream.write_all(&frame).await;
        }

        let server_config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![cert_der], key_der)
            .unwrap();
        let mut conn = rustls::ServerConnection::new(Arc::new(server_config)).unwrap();

        loop {
            if conn.wants_write() {
                let mut adapter = TcpServerAdapter(&stream);
                let _ = conn.write_tls(&mut adapter);
            }
            if !conn.is_handshaking() {
                break;
            }
            if stream.readable().await.is_err() {
                break;
            }
            let mut adapter = TcpServerAdapter(&stream);
            match conn.read_tls(&mut adapter) {
                Ok(0) => break,
                Ok(_) => {
                    if conn.process_new_packets().is_err() {
                        break;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                Err(_) => break,
            }
        }

        tokio::time::sleep(Duration::from_millis(300)).await;
    });

    (addr, handle)
}

struct TcpServerAdapter<'a>(&'a TcpStream);

impl Read for TcpServerAdapter<'_> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.0.try_read(buf)
    }
}

impl Write for TcpServerAdapter<'_> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.try_write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
