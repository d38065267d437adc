//! The Tokio-backed socket handler engine: state machine, handshake
//! sub-machine, TLS driver, the four I/O sub-drivers, timeout accounting,
//! and a `Socket` implementation over `tokio::net::TcpStream` with manually
//! driven `rustls`.

pub mod config;
pub mod drivers;
pub mod handler;
pub mod stream;
pub mod tokio_socket;

pub use config::{ConfigError, ConnectParams};
pub use handler::{ConnectRequest, Phase, SocketHandle, SocketHandler};
pub use stream::{HandshakeInfo, Stream};
pub use tokio_socket::TokioSocket;
