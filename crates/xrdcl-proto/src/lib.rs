//! Protocol-agnostic contracts for the XRootD client socket core:
//! the status vocabulary, message envelope, handshake carrier, the
//! `TransportHandler`/`MessageFramer` seam protocol implementations plug
//! into, and the non-blocking `Socket` contract.

pub mod handshake;
pub mod message;
pub mod socket;
pub mod status;
pub mod transport;

pub use handshake::{HandShakeData, HandShakeStep};
pub use message::Message;
pub use socket::{IoDirection, IpStack, Socket, TlsHandshakeStep};
pub use status::XrdStatus;
pub use transport::{MessageFramer, TransportHandler};
