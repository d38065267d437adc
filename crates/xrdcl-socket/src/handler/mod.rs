//! The socket handler: state machine, handshake sub-machine, TLS driver,
//! and timeout accounting, all on one task per connection.
//!
//! The `Poller` described elsewhere is not a separate type here: Tokio's
//! `TcpStream::readable()`/`writable()` already are "wait for one readiness
//! event, then go back to not-notifying" — the reactor registration the
//! design assumes is folded into the socket itself, plus the `tick` interval
//! below standing in for the poller's own tick resolution.

mod phase;

pub use phase::Phase;
use phase::{ReadSlot, WriteSlot};

use crate::config::ConnectParams;
use crate::drivers::{HsReader, HsWriter, MsgReader, MsgWriter, StepOutcome};
use crate::stream::{HandshakeInfo, Stream};
use crate::tokio_socket::TokioSocket;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, timeout_at, Instant};
use tracing::{debug, error, instrument, warn};
use xrdcl_proto::socket::{IoDirection, Socket, TlsHandshakeStep};
use xrdcl_proto::{HandShakeData, HandShakeStep, TransportHandler, XrdStatus};

/// Everything the connection manager supplies to start a connection,
/// including the late-binding address swap (`SetAddress`) it may need to
/// perform once DNS resolves to several candidates.
pub struct ConnectRequest<T: TransportHandler> {
    addr: SocketAddr,
    stream_name: String,
    sub_stream: u16,
    transport: Arc<T>,
    channel_data: T::ChannelData,
    params: ConnectParams,
}

impl<T: TransportHandler> ConnectRequest<T> {
    pub fn new(
        addr: SocketAddr,
        stream_name: impl Into<String>,
        transport: Arc<T>,
        channel_data: T::ChannelData,
        params: ConnectParams,
    ) -> Self {
        Self {
            addr,
            stream_name: stream_name.into(),
            sub_stream: 0,
            transport,
            channel_data,
            params,
        }
    }

    pub fn with_sub_stream(mut self, sub_stream: u16) -> Self {
        self.sub_stream = sub_stream;
        self
    }

    pub fn address(&self) -> SocketAddr {
        self.addr
    }

    /// Swap the connect target before `spawn` runs, e.g. after the
    /// connection manager tries one resolved address and wants to fail
    /// over to another. No effect once the handler has started connecting.
    pub fn set_address(&mut self, addr: SocketAddr) {
        self.addr = addr;
    }
}

/// Control-plane messages a `SocketHandle` can send its handler. Folded into
/// one channel rather than one per verb, the way the teacher's connection
/// handle multiplexes its own control signals over a single `mpsc::Sender`.
enum HandlerCommand {
    Close,
    EnableUplink,
    DisableUplink,
}

/// A lightweight, cloneable reference to a running handler: lets the owning
/// Stream request `Close` and read a couple of accessors without needing to
/// be on the same task as the handler itself.
#[derive(Clone)]
pub struct SocketHandle {
    addr: SocketAddr,
    stream_name: Arc<str>,
    last_activity_ms: Arc<AtomicU64>,
    control_tx: mpsc::Sender<HandlerCommand>,
}

impl SocketHandle {
    pub fn address(&self) -> SocketAddr {
        self.addr
    }

    pub fn ip_stack(&self) -> xrdcl_proto::socket::IpStack {
        xrdcl_proto::socket::IpStack::classify(&self.addr)
    }

    pub fn ip_addr(&self) -> String {
        self.addr.ip().to_string()
    }

    pub fn stream_name(&self) -> &str {
        &self.stream_name
    }

    /// Time since connection start at which the handler last observed
    /// progress. Monotonically non-decreasing across the connection's life.
    pub fn last_activity(&self) -> Duration {
        Duration::from_millis(self.last_activity_ms.load(Ordering::Relaxed))
    }

    /// Idempotent; cancels outstanding timers, deregisters from the socket,
    /// closes it, and transitions the handler to `Closed`. After this
    /// resolves, no further callbacks are delivered, regardless of which
    /// phase the connection was in when `close` was called.
    pub async fn close(&self) {
        let _ = self.control_tx.send(HandlerCommand::Close).await;
    }

    /// Request write-readiness delivery for this socket: once `Ready`, the
    /// handler asks the Stream for its next outbound message via
    /// `on_ready_to_write` if nothing is currently installed. Use this to
    /// wake the handler back up after `on_ready_to_write` returned `None`
    /// and new outbound data has since become available.
    pub async fn enable_uplink(&self) {
        let _ = self.control_tx.send(HandlerCommand::EnableUplink).await;
    }

    /// Request the handler stop asking for outbound messages once the
    /// current one (if any) has drained, until `enable_uplink` is called
    /// again.
    pub async fn disable_uplink(&self) {
        let _ = self.control_tx.send(HandlerCommand::DisableUplink).await;
    }
}

/// The socket handler itself. Lives for exactly one physical connection.
pub struct SocketHandler<T: TransportHandler, St: Stream> {
    phase: Phase,
    socket: Option<Box<dyn Socket>>,
    transport: Arc<T>,
    channel_data: T::ChannelData,
    stream: Arc<St>,
    params: ConnectParams,
    addr: SocketAddr,
    stream_name: Arc<str>,
    sub_stream: u16,

    hs: HandShakeData,
    pending_hs_frame: Option<bytes::Bytes>,
    handshake_info: Option<HandshakeInfo>,

    read_slot: Option<ReadSlot>,
    write_slot: Option<WriteSlot>,
    uplink_enabled: bool,

    connection_started: Instant,
    last_read_activity: Instant,
    last_write_activity: Instant,
    last_activity_ms: Arc<AtomicU64>,
    hs_wait_start: Option<Instant>,
    hs_wait_seconds: u64,

    fault_sent: bool,
    control_rx: mpsc::Receiver<HandlerCommand>,
}

impl<T, St> SocketHandler<T, St>
where
    T: TransportHandler + 'static,
    St: Stream + 'static,
{
    /// Start connecting and hand back a handle; the handler itself runs to
    /// completion on its own task.
    pub fn spawn(request: ConnectRequest<T>, stream: Arc<St>) -> SocketHandle {
        let (control_tx, control_rx) = mpsc::channel(8);
        let stream_name: Arc<str> = Arc::from(request.stream_name.as_str());
        let last_activity_ms = Arc::new(AtomicU64::new(0));
        let now = Instant::now();

        let handler = Self {
            phase: Phase::Idle,
            socket: None,
            transport: request.transport,
            channel_data: request.channel_data,
            stream,
            params: request.params,
            addr: request.addr,
            stream_name: stream_name.clone(),
            sub_stream: request.sub_stream,
            hs: HandShakeData::new(),
            pending_hs_frame: None,
            handshake_info: None,
            read_slot: None,
            write_slot: None,
            uplink_enabled: true,
            connection_started: now,
            last_read_activity: now,
            last_write_activity: now,
            last_activity_ms: last_activity_ms.clone(),
            hs_wait_start: None,
            hs_wait_seconds: 0,
            fault_sent: false,
            control_rx,
        };

        let addr = request.addr;
        tokio::spawn(handler.run());

        SocketHandle { addr, stream_name, last_activity_ms, control_tx }
    }

    #[instrument(skip(self), fields(stream = %self.stream_name, addr = %self.addr, sub_stream = self.sub_stream))]
    async fn run(mut self) {
        self.phase = Phase::Connecting;
        let deadline = self.connection_started + self.params.connect_timeout();

        let connect = timeout_at(deadline, TokioSocket::connect(self.addr, &self.params));
        tokio::pin!(connect);
        loop {
            tokio::select! {
                biased;
                cmd = self.control_rx.recv() => {
                    match cmd {
                        Some(HandlerCommand::EnableUplink) => self.uplink_enabled = true,
                        Some(HandlerCommand::DisableUplink) => self.uplink_enabled = false,
                        Some(HandlerCommand::Close) | None => {
                            debug!("close requested before connect completed");
                            self.do_close().await;
                            return;
                        }
                    }
                }
                result = &mut connect => {
                    match result {
                        Ok(Ok(socket)) => {
                            debug!("connect succeeded");
                            self.socket = Some(Box::new(socket));
                            self.touch_read();
                            self.stream.on_connect(Ok(())).await;
                            self.phase = Phase::Handshaking;
                            self.transport.handshake_init(&self.channel_data, &mut self.hs);
                            self.install_hs_slots();
                        }
                        Ok(Err(e)) => {
                            self.fault_while_handshaking(XrdStatus::ConnectError(e)).await;
                            return;
                        }
                        Err(_) => {
                            let elapsed = self.connection_started.elapsed();
                            let limit = self.params.connect_timeout();
                            self.fault_while_handshaking(XrdStatus::ConnectTimeout { elapsed, limit }).await;
                            return;
                        }
                    }
                    break;
                }
            }
        }

        let mut tick = interval(self.params.tick_resolution());
        loop {
            if matches!(self.phase, Phase::Closed) {
                break;
            }
            self.drive(&mut tick).await;
        }
    }

    async fn drive(&mut self, tick: &mut tokio::time::Interval) {
        if matches!(self.phase, Phase::HandshakeWait) {
            tokio::select! {
                biased;
                cmd = self.control_rx.recv() => self.on_control(cmd).await,
                _ = tick.tick() => self.check_hs_wait(),
            }
            return;
        }

        let want_read = self.read_slot.is_some();
        let want_write = self.write_slot.is_some();

        tokio::select! {
            biased;
            cmd = self.control_rx.recv() => {
                self.on_control(cmd).await;
            }
            res = self.socket.as_ref().unwrap().readable(), if want_read => {
                match res {
                    Ok(()) => self.on_readable().await,
                    Err(e) => self.fault_for_phase(XrdStatus::SocketError(e)).await,
                }
            }
            res = self.socket.as_ref().unwrap().writable(), if want_write => {
                match res {
                    Ok(()) => self.on_writable().await,
                    Err(e) => self.fault_for_phase(XrdStatus::SocketError(e)).await,
                }
            }
            _ = tick.tick() => {
                self.on_tick().await;
            }
        }
    }

    /// Handles one control-plane message from the handle: `Close` tears the
    /// connection down; `EnableUplink` re-kicks the write side if nothing is
    /// currently installed; `DisableUplink` suppresses further automatic
    /// pulls until re-enabled. A closed channel (every handle dropped) is
    /// treated the same as an explicit `Close`.
    async fn on_control(&mut self, cmd: Option<HandlerCommand>) {
        match cmd {
            Some(HandlerCommand::Close) | None => self.do_close().await,
            Some(HandlerCommand::EnableUplink) => {
                self.uplink_enabled = true;
                if matches!(self.phase, Phase::Ready) && self.write_slot.is_none() {
                    self.pull_next_outbound().await;
                }
            }
            Some(HandlerCommand::DisableUplink) => self.uplink_enabled = false,
        }
    }

    fn install_hs_slots(&mut self) {
        if self.read_slot.is_none() {
            self.read_slot = Some(ReadSlot::Hs(HsReader::new()));
        }
        if let Some(frame) = self.hs.take_outbound() {
            self.pending_hs_frame = Some(frame.clone());
            self.write_slot = Some(WriteSlot::Hs(HsWriter::new(frame)));
        }
    }

    fn install_message_slots(&mut self) {
        self.read_slot = Some(ReadSlot::Msg(MsgReader::new()));
        self.write_slot = None;
    }

    /// Asks the Stream for its next outbound message and installs a writer
    /// for it, or leaves `write_slot` empty if there is nothing to send yet.
    /// Called as soon as `Ready` is (re-)entered with nothing in flight, on
    /// an explicit `EnableUplink`, and after a previous write fully drains —
    /// the single place outbound traffic enters the write side.
    async fn pull_next_outbound(&mut self) {
        if !self.uplink_enabled {
            return;
        }
        match self.stream.on_ready_to_write().await {
            Some(msg) => {
                let encoded = self.transport.framer().encode_message(&msg);
                self.write_slot = Some(WriteSlot::Msg(MsgWriter::new(encoded)));
            }
            None => {
                self.write_slot = None;
            }
        }
    }

    async fn on_readable(&mut self) {
        match self.phase {
            Phase::Handshaking => self.step_hs_reader().await,
            Phase::TlsHandshaking => self.pump_tls().await,
            Phase::Ready => self.step_msg_reader().await,
            other => self.illegal_transition("read-readiness", other).await,
        }
    }

    async fn on_writable(&mut self) {
        match self.phase {
            Phase::Handshaking => self.step_hs_writer().await,
            Phase::TlsHandshaking => self.pump_tls().await,
            Phase::Ready => self.step_msg_writer().await,
            other => self.illegal_transition("write-readiness", other).await,
        }
    }

    /// An I/O readiness event fired in a phase that has no business polling
    /// for one (`read_slot`/`write_slot` should be `None` there); surfaces as
    /// a fault rather than silently dropping the event, per the state
    /// machine's "any unexpected event faults with `IllegalTransition`" rule.
    async fn illegal_transition(&mut self, event: &str, phase: Phase) {
        self.fault_for_phase(XrdStatus::IllegalTransition(format!(
            "unexpected {event} event while in phase {}",
            phase.name()
        )))
        .await;
    }

    async fn step_hs_reader(&mut self) {
        let Some(ReadSlot::Hs(reader)) = &mut self.read_slot else { return };
        let socket = self.socket.as_deref_mut().unwrap();
        let outcome = reader.step(socket, self.transport.framer());
        match outcome {
            StepOutcome::Progress => {}
            StepOutcome::WouldBlock => {}
            StepOutcome::Unit(msg) => {
                self.touch_read();
                self.on_hs_frame(msg).await;
            }
            StepOutcome::Failed(status) => self.fault_while_handshaking(status).await,
        }
    }

    async fn step_hs_writer(&mut self) {
        let Some(WriteSlot::Hs(writer)) = &mut self.write_slot else { return };
        let socket = self.socket.as_deref_mut().unwrap();
        match writer.step(socket) {
            StepOutcome::Progress => {}
            StepOutcome::WouldBlock => {}
            StepOutcome::Unit(()) => {
                self.touch_write();
                self.write_slot = None;
            }
            StepOutcome::Failed(status) => self.fault_while_handshaking(status).await,
        }
    }

    async fn on_hs_frame(&mut self, msg: xrdcl_proto::Message) {
        if let Some(wait) = self.transport.is_wait_response(&msg) {
            debug!(seconds = wait.as_secs(), "handshake wait response");
            self.hs_wait_start = Some(Instant::now());
            self.hs_wait_seconds = wait.as_secs();
            self.write_slot = None;
            self.phase = Phase::HandshakeWait;
            return;
        }

        self.hs.inbound = Some(msg);
        match self.transport.handshake_next(&self.channel_data, &mut self.hs) {
            Ok(HandShakeStep::Continue) => {
                if let Some(frame) = self.hs.take_outbound() {
                    self.pending_hs_frame = Some(frame.clone());
                    self.write_slot = Some(WriteSlot::Hs(HsWriter::new(frame)));
                }
            }
            Ok(HandShakeStep::Done) => self.on_handshake_done().await,
            Ok(HandShakeStep::Fatal) => {
                self.fault_while_handshaking(XrdStatus::HandshakeError(
                    "transport rejected handshake exchange".to_string(),
                ))
                .await;
            }
            Err(status) => self.fault_while_handshaking(status).await,
        }
    }

    async fn on_handshake_done(&mut self) {
        let tls_required = self.transport.needs_tls(&self.channel_data);
        let info = HandshakeInfo { tls_required };
        if tls_required {
            self.handshake_info = Some(info);
            self.phase = Phase::TlsHandshaking;
            if let Err(e) = self.socket.as_mut().unwrap().start_tls_client(&self.stream_name) {
                self.fault_while_handshaking(XrdStatus::from(e)).await;
            }
        } else {
            self.install_message_slots();
            self.phase = Phase::Ready;
            self.stream.on_handshake_done(info).await;
            self.pull_next_outbound().await;
        }
    }

    fn check_hs_wait(&mut self) {
        let Some(start) = self.hs_wait_start else { return };
        if start.elapsed().as_secs() < self.hs_wait_seconds {
            return;
        }
        debug!("handshake wait elapsed, reissuing step");
        self.hs_wait_start = None;
        if let Some(frame) = self.pending_hs_frame.clone() {
            self.write_slot = Some(WriteSlot::Hs(HsWriter::new(frame)));
        }
        self.read_slot = Some(ReadSlot::Hs(HsReader::new()));
        self.phase = Phase::Handshaking;
    }

    /// Drives one step of the TLS handshake, whether it is the initial
    /// hand-off or a mid-stream renegotiation. On completion the resume
    /// target is always `Ready`; whether message slots need
    /// (re)installing and whether the Stream needs notifying is determined
    /// by `handshake_info` rather than by which phase we came from, since
    /// that is the only place the two cases actually differ.
    async fn pump_tls(&mut self) {
        let step = self.socket.as_mut().unwrap().tls_handshake_step();
        match step {
            Ok(TlsHandshakeStep::Ok) => {
                self.touch_read();
                self.touch_write();
                match self.handshake_info.take() {
                    Some(info) => {
                        self.install_message_slots();
                        self.phase = Phase::Ready;
                        self.stream.on_handshake_done(info).await;
                        self.pull_next_outbound().await;
                    }
                    None => {
                        // Resuming from a mid-stream renegotiation: whatever
                        // was (or wasn't) in flight before the dip is left
                        // untouched, so a partially-written message isn't
                        // duplicated or dropped.
                        self.phase = Phase::Ready;
                        if self.write_slot.is_none() {
                            self.pull_next_outbound().await;
                        }
                    }
                }
            }
            Ok(TlsHandshakeStep::RetryRead) | Ok(TlsHandshakeStep::RetryWrite) => {
                // stay in TlsHandshaking; the next readiness event pumps again.
            }
            Err(e) => {
                let status = XrdStatus::from(e);
                if self.handshake_info.is_some() {
                    self.fault_while_handshaking(status).await;
                } else {
                    self.fault(status).await;
                }
            }
        }
    }

    /// Mid-stream TLS renegotiation is transparent to the Stream: if the
    /// socket's event mapping no longer agrees with the slots we have
    /// installed, the underlying session needs to pump its own handshake
    /// traffic before application bytes can flow again.
    fn wants_renegotiation(&self) -> bool {
        let Some(socket) = &self.socket else { return false };
        if !socket.is_tls() {
            return false;
        }
        socket.map_event(IoDirection::Read) != IoDirection::Read
            || socket.map_event(IoDirection::Write) != IoDirection::Write
    }

    async fn step_msg_reader(&mut self) {
        if self.wants_renegotiation() {
            self.phase = Phase::TlsHandshaking;
            return;
        }
        let Some(ReadSlot::Msg(reader)) = &mut self.read_slot else { return };
        let socket = self.socket.as_deref_mut().unwrap();
        match reader.step(socket, self.transport.framer()) {
            StepOutcome::Progress => {}
            StepOutcome::WouldBlock => {}
            StepOutcome::Unit(msg) => {
                self.touch_read();
                self.stream.on_incoming_message(msg).await;
            }
            StepOutcome::Failed(status) => self.fault(status).await,
        }
    }

    async fn step_msg_writer(&mut self) {
        if self.wants_renegotiation() {
            self.phase = Phase::TlsHandshaking;
            return;
        }
        let done = match &mut self.write_slot {
            Some(WriteSlot::Msg(writer)) => {
                let socket = self.socket.as_deref_mut().unwrap();
                match writer.step(socket) {
                    StepOutcome::Progress => false,
                    StepOutcome::WouldBlock => false,
                    StepOutcome::Unit(()) => true,
                    StepOutcome::Failed(status) => {
                        self.fault(status).await;
                        return;
                    }
                }
            }
            _ => false,
        };
        if !done {
            return;
        }
        self.touch_write();
        self.pull_next_outbound().await;
    }

    async fn on_tick(&mut self) {
        match self.phase {
            Phase::Handshaking | Phase::TlsHandshaking => {
                let elapsed = self.connection_started.elapsed();
                let limit = self.params.connect_timeout();
                if elapsed > limit {
                    self.fault_while_handshaking(XrdStatus::ConnectTimeout { elapsed, limit }).await;
                }
            }
            Phase::Ready => {
                let now = Instant::now();
                if let Some(limit) = self.params.read_idle_timeout() {
                    let idle = now.saturating_duration_since(self.last_read_activity);
                    if idle >= limit {
                        warn!(idle_secs = idle.as_secs(), "read idle timeout");
                        self.stream.on_read_timeout(idle).await;
                    }
                }
                if let Some(limit) = self.params.write_idle_timeout() {
                    let idle = now.saturating_duration_since(self.last_write_activity);
                    if idle >= limit {
                        warn!(idle_secs = idle.as_secs(), "write idle timeout");
                        self.stream.on_write_timeout(idle).await;
                    }
                }
            }
            _ => {}
        }
    }

    fn touch_read(&mut self) {
        let now = Instant::now();
        self.last_read_activity = now;
        self.publish_activity(now);
    }

    fn touch_write(&mut self) {
        let now = Instant::now();
        self.last_write_activity = now;
        self.publish_activity(now);
    }

    fn publish_activity(&self, now: Instant) {
        let ms = now.saturating_duration_since(self.connection_started).as_millis() as u64;
        self.last_activity_ms.fetch_max(ms, Ordering::Relaxed);
    }

    async fn do_close(&mut self) {
        if matches!(self.phase, Phase::Closed) {
            return;
        }
        debug!("close requested");
        self.phase = Phase::Closing;
        self.teardown();
        self.phase = Phase::Closed;
    }

    /// Routes a fault that occurred while connecting or handshaking; only
    /// the handshake-side slots can possibly be populated at this point.
    async fn fault_while_handshaking(&mut self, status: XrdStatus) {
        self.deliver_fault(status).await;
    }

    /// Routes a fault that occurred once message slots are populated.
    async fn fault(&mut self, status: XrdStatus) {
        self.deliver_fault(status).await;
    }

    async fn fault_for_phase(&mut self, status: XrdStatus) {
        if matches!(self.phase, Phase::Ready | Phase::Closing) {
            self.fault(status).await;
        } else {
            self.fault_while_handshaking(status).await;
        }
    }

    async fn deliver_fault(&mut self, status: XrdStatus) {
        if self.fault_sent {
            return;
        }
        self.fault_sent = true;
        error!(phase = self.phase.name(), status = %status, code = status.error_code(), "connection fault");
        self.phase = Phase::Closing;
        self.teardown();
        self.phase = Phase::Closed;
        self.stream.on_fault(status).await;
    }

    fn teardown(&mut self) {
        self.read_slot = None;
        self.write_slot = None;
        self.socket = None;
    }
}
