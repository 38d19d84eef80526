//! Listening sockets
//!
//! The server's accept loop is transport-generic: both listeners yield the
//! same framed sender/receiver pair plus a peer address.

use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::net::{TcpListener, UnixListener};
use tracing::info;

use crate::error::{Result, TransportError};
use crate::stream::{apply_keepalive, spawn_io, FrameReceiver, FrameSender};

/// Address of an accepted peer
#[derive(Debug, Clone)]
pub enum PeerAddr {
    Tcp(SocketAddr),
    /// UNIX-domain peers are typically unnamed
    Unix,
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerAddr::Tcp(addr) => write!(f, "{addr}"),
            PeerAddr::Unix => write!(f, "unix peer"),
        }
    }
}

/// A listening socket that yields framed connections
#[async_trait]
pub trait Acceptor: Send {
    async fn accept(&mut self) -> Result<(FrameSender, FrameReceiver, PeerAddr)>;
}

/// TCP listener
pub struct TcpAcceptor {
    listener: TcpListener,
}

impl TcpAcceptor {
    /// Bind on all interfaces. Port 0 asks the OS for a free port.
    pub async fn bind(port: u16) -> Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", port))
            .await
            .map_err(TransportError::Bind)?;

        info!("listening on port {}", listener.local_addr().map(|a| a.port()).unwrap_or(port));
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr().map_err(TransportError::Bind)
    }
}

#[async_trait]
impl Acceptor for TcpAcceptor {
    async fn accept(&mut self) -> Result<(FrameSender, FrameReceiver, PeerAddr)> {
        let (stream, addr) = self
            .listener
            .accept()
            .await
            .map_err(TransportError::Accept)?;
        apply_keepalive(&stream);

        let (sender, receiver) = spawn_io(stream);
        Ok((sender, receiver, PeerAddr::Tcp(addr)))
    }
}

/// UNIX-domain listener; remembers its path so the owner can unlink it
pub struct UnixAcceptor {
    listener: UnixListener,
    path: PathBuf,
}

impl UnixAcceptor {
    pub fn bind(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let listener = UnixListener::bind(&path).map_err(TransportError::Bind)?;

        info!("listening on socket file {}", path.display());
        Ok(Self { listener, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl Acceptor for UnixAcceptor {
    async fn accept(&mut self) -> Result<(FrameSender, FrameReceiver, PeerAddr)> {
        let (stream, _) = self
            .listener
            .accept()
            .await
            .map_err(TransportError::Accept)?;

        let (sender, receiver) = spawn_io(stream);
        Ok((sender, receiver, PeerAddr::Unix))
    }
}
