//! Tokio-backed, optionally TLS-capable `Socket` implementation.
//!
//! `readable()`/`writable()` fold the `Poller` contract into the socket
//! itself: on Tokio, "enable read notification, wait for one event, notify
//! is implicitly cleared" is exactly `TcpStream::readable()`. There is no
//! separate reactor-registration object to model.
//!
//! TLS is driven manually against a raw [`rustls::ClientConnection`] instead
//! of `tokio_rustls::TlsConnector`, because the connector's single `.await`
//! collapses the Retry-Read/Retry-Write/Ok/Fatal states this crate needs to
//! observe and act on one step at a time.

use async_trait::async_trait;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, ClientConnection};
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use tokio::net::TcpStream;

use crate::config::ConnectParams;
use xrdcl_proto::socket::{IoDirection, Socket, TlsFailure, TlsHandshakeStep};

/// Lazily-built, process-wide default TLS client configuration trusting the
/// Mozilla root CA bundle, plus one extra DER-encoded trust anchor if
/// `XRDCL_EXTRA_TRUST_ANCHOR_DER` points at a readable file — an escape
/// hatch for sites running a private CA, mirroring tools like curl's
/// `CURL_CA_BUNDLE`. Built once and shared (cheap to clone: an `Arc`). Used
/// whenever the connection's `ConnectParams` requests no client certificate.
fn default_tls_config() -> Arc<ClientConfig> {
    static CONFIG: OnceLock<Arc<ClientConfig>> = OnceLock::new();
    CONFIG.get_or_init(|| Arc::new(build_root_store_config(None))).clone()
}

fn trust_roots() -> rustls::RootCertStore {
    let mut roots = rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    if let Ok(path) = std::env::var("XRDCL_EXTRA_TRUST_ANCHOR_DER") {
        if let Ok(der) = std::fs::read(&path) {
            let _ = roots.add(CertificateDer::from(der));
        }
    }
    roots
}

fn build_root_store_config(client_identity: Option<(CertificateDer<'static>, PrivateKeyDer<'static>)>) -> ClientConfig {
    let builder = ClientConfig::builder().with_root_certificates(trust_roots());
    match client_identity {
        Some((cert, key)) => builder
            .with_client_auth_cert(vec![cert], key)
            .expect("client certificate and key must be a valid pair"),
        None => builder.with_no_client_auth(),
    }
}

/// Builds the TLS config for one connection. Client certificate/key paths
/// are read as raw DER (PKCS#8) rather than PEM, keeping this crate free of
/// a PEM-parsing dependency; sites needing mutual TLS are expected to
/// provision DER-encoded material, as the test fixtures do.
fn resolve_tls_config(params: &ConnectParams) -> io::Result<Arc<ClientConfig>> {
    match (&params.tls_client_cert_path, &params.tls_client_key_path) {
        (Some(cert_path), Some(key_path)) => {
            let cert: CertificateDer<'static> = CertificateDer::from(std::fs::read(cert_path)?);
            let key = PrivateKeyDer::Pkcs8(std::fs::read(key_path)?.into());
            Ok(Arc::new(build_root_store_config(Some((cert, key)))))
        }
        _ => Ok(default_tls_config()),
    }
}

/// Bridges `TcpStream`'s non-blocking `try_read`/`try_write` to `std::io`'s
/// blocking-shaped `Read`/`Write`, which is what `rustls` expects to drive
/// its internal buffers. `WouldBlock` passes straight through.
struct TcpAdapter<'a>(&'a TcpStream);

impl Read for TcpAdapter<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.try_read(buf)
    }
}

impl Write for TcpAdapter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.try_write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

pub struct TokioSocket {
    tcp: TcpStream,
    tls: Option<ClientConnection>,
    tls_config: Arc<ClientConfig>,
}

impl TokioSocket {
    /// Non-blocking connect is delegated to Tokio's own implementation,
    /// which performs the write-readiness-then-SO_ERROR dance internally;
    /// wrap the returned future in a deadline at the call site. The TLS
    /// configuration (trust roots, optional client identity) is resolved
    /// once here from `params` and reused for the life of the connection.
    pub async fn connect(addr: SocketAddr, params: &ConnectParams) -> io::Result<Self> {
        let tls_config = resolve_tls_config(params)?;
        let tcp = TcpStream::connect(addr).await?;
        tcp.set_nodelay(true)?;
        Ok(Self { tcp, tls: None, tls_config })
    }

    /// Best-effort: stops as soon as the socket reports `WouldBlock` rather
    /// than propagating it, since that is expected back-pressure, not a
    /// failure — Tokio's readiness events are edge-triggered and can be
    /// spurious, so a `WouldBlock` right after `writable()` resolves is
    /// routine, not exceptional.
    fn flush_tls_output(&mut self) -> io::Result<()> {
        let tcp = &self.tcp;
        let tls = self.tls.as_mut().expect("flush_tls_output without an active TLS session");
        while tls.wants_write() {
            let mut adapter = TcpAdapter(tcp);
            match tls.write_tls(&mut adapter) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Socket for TokioSocket {
    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.tls {
            None => self.tcp.try_read(buf),
            Some(_) => {
                // Drain plaintext already decrypted from a previous pump first;
                // rustls signals "none buffered yet" as `WouldBlock`, not `Ok(0)`.
                {
                    let tls = self.tls.as_mut().unwrap();
                    match tls.reader().read(buf) {
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                        other => return other,
                    }
                }
                let tcp = &self.tcp;
                let tls = self.tls.as_mut().unwrap();
                let mut adapter = TcpAdapter(tcp);
                match tls.read_tls(&mut adapter) {
                    Ok(0) => return Ok(0),
                    Ok(_) => {}
                    Err(e) => return Err(e),
                }
                tls.process_new_packets()
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                tls.reader().read(buf)
            }
        }
    }

    fn try_write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &mut self.tls {
            None => self.tcp.try_write(buf),
            Some(_) => {
                // A partially-flushed previous write keeps the session
                // looking writable: refuse new plaintext until the
                // ciphertext from the last step has fully drained.
                self.flush_tls_output()?;
                if self.tls.as_ref().unwrap().wants_write() {
                    return Err(io::Error::new(
                        io::ErrorKind::WouldBlock,
                        "tls ciphertext still draining",
                    ));
                }
                let n = self.tls.as_mut().unwrap().writer().write(buf)?;
                self.flush_tls_output()?;
                Ok(n)
            }
        }
    }

    async fn readable(&self) -> io::Result<()> {
        self.tcp.readable().await
    }

    async fn writable(&self) -> io::Result<()> {
        self.tcp.writable().await
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.tcp.peer_addr()
    }

    fn is_tls(&self) -> bool {
        self.tls.is_some()
    }

    fn start_tls_client(&mut self, server_name: &str) -> Result<(), TlsFailure> {
        let name = ServerName::try_from(server_name.to_owned())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let conn = ClientConnection::new(self.tls_config.clone(), name).map_err(TlsFailure::Tls)?;
        self.tls = Some(conn);
        Ok(())
    }

    fn tls_handshake_step(&mut self) -> Result<TlsHandshakeStep, TlsFailure> {
        self.flush_tls_output()?;
        let tls = self.tls.as_mut().expect("start_tls_client must precede tls_handshake_step");
        if tls.wants_write() {
            return Ok(TlsHandshakeStep::RetryWrite);
        }
        if !tls.is_handshaking() {
            return Ok(TlsHandshakeStep::Ok);
        }
        if tls.wants_read() {
            let tcp = &self.tcp;
            let mut adapter = TcpAdapter(tcp);
            match tls.read_tls(&mut adapter) {
                Ok(0) => {
                    return Err(TlsFailure::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "peer closed during TLS handshake",
                    )));
                }
                Ok(_) => {
                    tls.process_new_packets().map_err(TlsFailure::Tls)?;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(TlsHandshakeStep::RetryRead);
                }
                Err(e) => return Err(TlsFailure::Io(e)),
            }
        }
        self.flush_tls_output()?;
        if tls.wants_write() {
            return Ok(TlsHandshakeStep::RetryWrite);
        }
        if tls.is_handshaking() {
            return Ok(TlsHandshakeStep::RetryRead);
        }
        Ok(TlsHandshakeStep::Ok)
    }

    fn map_event(&self, direction: IoDirection) -> IoDirection {
        let Some(tls) = &self.tls else {
            return direction;
        };
        match direction {
            IoDirection::Read if tls.wants_write() && !tls.wants_read() => IoDirection::Write,
            IoDirection::Write if tls.wants_read() && !tls.wants_write() => IoDirection::Read,
            other => other,
        }
    }
}
