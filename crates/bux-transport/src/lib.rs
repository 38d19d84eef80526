//! Buxtehude Transports
//!
//! Framed connection I/O over TCP and UNIX-domain sockets. Each connection is
//! served by a single task that owns the socket, frames outbound bytes off a
//! bounded queue and feeds inbound bytes through the resumable frame decoder,
//! surfacing everything that happens as [`StreamEvent`]s.

pub mod error;
pub mod listener;
pub mod stream;

pub use error::{Result, TransportError};
pub use listener::{Acceptor, PeerAddr, TcpAcceptor, UnixAcceptor};
pub use stream::{connect_tcp, connect_unix, FrameReceiver, FrameSender, StreamEvent};
