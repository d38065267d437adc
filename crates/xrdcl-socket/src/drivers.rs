//! The four non-blocking, single-owner I/O sub-drivers.
//!
//! Each exposes the same minimal contract: one `step()` call consumes or
//! produces as many bytes as are available right now and reports what
//! happened. None of them perform their own readiness waits; the handler
//! calls `step()` only after the socket has reported read- or
//! write-readiness. Framing policy is passed in at each call rather than
//! stored, since it lives behind the transport's borrowed `&dyn
//! MessageFramer` rather than an owned handle.

use bytes::{Bytes, BytesMut};
use xrdcl_proto::socket::Socket;
use xrdcl_proto::transport::MessageFramer;
use xrdcl_proto::{Message, XrdStatus};

/// Outcome of one `step()` call on any of the four sub-drivers.
#[derive(Debug)]
pub enum StepOutcome<T> {
    /// Consumed or produced some bytes; not yet a complete unit.
    Progress,
    /// The socket reported it has nothing more to offer right now.
    WouldBlock,
    /// A complete unit was produced (a parsed frame) or consumed (the
    /// pending buffer fully flushed).
    Unit(T),
    Failed(XrdStatus),
}

const READ_CHUNK: usize = 16 * 1024;

/// Assembles inbound bytes into frames using whichever `parse_*` method the
/// caller selects; shared by the handshake and message reader.
struct FrameAssembler {
    buf: BytesMut,
}

impl FrameAssembler {
    fn new() -> Self {
        Self { buf: BytesMut::with_capacity(READ_CHUNK) }
    }

    /// Pull as many bytes as are available right now, then try to parse one
    /// frame out of the front of the accumulated buffer.
    fn step(
        &mut self,
        socket: &mut dyn Socket,
        parse: impl FnOnce(&[u8]) -> Result<Option<(Message, usize)>, XrdStatus>,
    ) -> StepOutcome<Message> {
        let mut chunk = [0u8; READ_CHUNK];
        match socket.try_read(&mut chunk) {
            Ok(0) => {
                return StepOutcome::Failed(XrdStatus::SocketError(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "peer closed connection",
                )));
            }
            Ok(n) => self.buf.extend_from_slice(&chunk[..n]),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return StepOutcome::WouldBlock,
            Err(e) => return StepOutcome::Failed(XrdStatus::SocketError(e)),
        }

        match parse(&self.buf) {
            Ok(Some((msg, consumed))) => {
                let _ = self.buf.split_to(consumed);
                StepOutcome::Unit(msg)
            }
            Ok(None) => StepOutcome::Progress,
            Err(status) => StepOutcome::Failed(status),
        }
    }
}

/// Drains a single pre-populated outbound buffer.
struct FrameDrain {
    pending: Bytes,
    offset: usize,
}

impl FrameDrain {
    fn new(frame: Bytes) -> Self {
        Self { pending: frame, offset: 0 }
    }

    fn step(&mut self, socket: &mut dyn Socket) -> StepOutcome<()> {
        if self.offset >= self.pending.len() {
            return StepOutcome::Unit(());
        }
        match socket.try_write(&self.pending[self.offset..]) {
            Ok(0) => StepOutcome::WouldBlock,
            Ok(n) => {
                self.offset += n;
                if self.offset >= self.pending.len() {
                    StepOutcome::Unit(())
                } else {
                    StepOutcome::Progress
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => StepOutcome::WouldBlock,
            Err(e) => StepOutcome::Failed(XrdStatus::SocketError(e)),
        }
    }
}

/// Consumes bytes until one complete handshake frame is assembled.
#[derive(Default)]
pub struct HsReader {
    assembler: FrameAssembler,
}

impl HsReader {
    pub fn new() -> Self {
        Self { assembler: FrameAssembler::new() }
    }

    pub fn step(&mut self, socket: &mut dyn Socket, framer: &dyn MessageFramer) -> StepOutcome<Message> {
        self.assembler.step(socket, |buf| framer.parse_handshake_frame(buf))
    }
}

impl Default for FrameAssembler {
    fn default() -> Self {
        Self::new()
    }
}

/// Drains a pre-populated outbound handshake frame.
pub struct HsWriter {
    drain: FrameDrain,
}

impl HsWriter {
    pub fn new(frame: Bytes) -> Self {
        Self { drain: FrameDrain::new(frame) }
    }

    pub fn step(&mut self, socket: &mut dyn Socket) -> StepOutcome<()> {
        self.drain.step(socket)
    }
}

/// Assembles incoming protocol messages once the handshake is complete.
#[derive(Default)]
pub struct MsgReader {
    assembler: FrameAssembler,
}

impl MsgReader {
    pub fn new() -> Self {
        Self { assembler: FrameAssembler::new() }
    }

    pub fn step(&mut self, socket: &mut dyn Socket, framer: &dyn MessageFramer) -> StepOutcome<Message> {
        self.assembler.step(socket, |buf| framer.parse_message(buf))
    }
}

/// Drains the currently pending outbound message. When drained, the handler
/// asks the Stream for the next one and rebuilds this driver, or disables
/// uplink if none is available.
pub struct MsgWriter {
    drain: FrameDrain,
}

impl MsgWriter {
    pub fn new(encoded: Bytes) -> Self {
        Self { drain: FrameDrain::new(encoded) }
    }

    pub fn step(&mut self, socket: &mut dyn Socket) -> StepOutcome<()> {
        self.drain.step(socket)
    }
}
