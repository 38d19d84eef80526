//! Bus error types

use std::io;

use thiserror::Error;

/// Failure to establish a client connection
#[derive(Error, Debug)]
pub enum ConnectError {
    #[error("already connected")]
    AlreadyConnected,

    #[error("address resolution failed: {0}")]
    Resolve(#[source] io::Error),

    #[error("connect failed: {0}")]
    Connect(#[source] io::Error),

    #[error("handshake write failed")]
    HandshakeWrite,
}

/// Failure to open a listening socket
#[derive(Error, Debug)]
pub enum ListenError {
    #[error("bind failed: {0}")]
    Bind(#[source] io::Error),
}

/// The message was not sent. Details are logged rather than surfaced.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("message not sent")]
pub struct WriteError;
