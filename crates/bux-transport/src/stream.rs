//! Framed connection I/O
//!
//! One task per connection owns the socket. Outbound frames queue on a
//! bounded channel and are written with `write_all`, which absorbs partial
//! writes and would-block conditions. Inbound bytes accumulate in a buffer
//! that the frame decoder consumes; complete frames and protocol-level
//! decode failures both surface as events, and a decode failure does not
//! terminate the connection.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use bux_core::{FrameDecoder, WireFrame};
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{lookup_host, TcpStream, UnixStream};
use tokio::sync::{mpsc, Notify};
use tracing::debug;

use crate::error::{Result, TransportError};

/// Bound on each connection's outbound and event queues
pub const CHANNEL_CAPACITY: usize = 1000;

const READ_BUFFER_SIZE: usize = 8192;
const KEEPALIVE_SECS: u64 = 30;

/// What a connection's I/O task observed
#[derive(Debug)]
pub enum StreamEvent {
    /// A complete frame arrived
    Frame(WireFrame),
    /// A frame was rejected at the protocol level; the connection continues
    Protocol(bux_core::Error),
    /// The peer hung up or the socket failed
    Disconnected { reason: Option<String> },
}

/// Outbound handle for one connection
#[derive(Clone)]
pub struct FrameSender {
    tx: mpsc::Sender<Bytes>,
    connected: Arc<Mutex<bool>>,
    closed: Arc<Notify>,
}

impl FrameSender {
    /// Queue a frame without blocking; fails when the queue is full or the
    /// connection is gone.
    pub fn try_send(&self, data: Bytes) -> Result<()> {
        if !*self.connected.lock() {
            return Err(TransportError::NotConnected);
        }

        self.tx.try_send(data).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => TransportError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => TransportError::Closed,
        })
    }

    /// Queue a frame, waiting for room.
    pub async fn send(&self, data: Bytes) -> Result<()> {
        if !*self.connected.lock() {
            return Err(TransportError::NotConnected);
        }

        self.tx.send(data).await.map_err(|_| TransportError::Closed)
    }

    pub fn is_connected(&self) -> bool {
        *self.connected.lock()
    }

    /// Stop the connection. Frames already queued are flushed before the
    /// socket closes.
    pub fn close(&self) {
        *self.connected.lock() = false;
        self.closed.notify_one();
    }
}

/// Inbound handle for one connection
pub struct FrameReceiver {
    rx: mpsc::Receiver<StreamEvent>,
}

impl FrameReceiver {
    /// Next event, or `None` once the I/O task has ended.
    pub async fn recv(&mut self) -> Option<StreamEvent> {
        self.rx.recv().await
    }
}

/// Bind a socket to an I/O task and hand back its two endpoints.
pub(crate) fn spawn_io<S>(stream: S) -> (FrameSender, FrameReceiver)
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let connected = Arc::new(Mutex::new(true));
    let closed = Arc::new(Notify::new());
    let (outgoing_tx, outgoing_rx) = mpsc::channel::<Bytes>(CHANNEL_CAPACITY);
    let (event_tx, event_rx) = mpsc::channel::<StreamEvent>(CHANNEL_CAPACITY);

    let sender = FrameSender {
        tx: outgoing_tx,
        connected: connected.clone(),
        closed: closed.clone(),
    };
    let receiver = FrameReceiver { rx: event_rx };

    tokio::spawn(run_io_loop(stream, outgoing_rx, event_tx, connected, closed));

    (sender, receiver)
}

async fn run_io_loop<S>(
    stream: S,
    mut outgoing_rx: mpsc::Receiver<Bytes>,
    event_tx: mpsc::Sender<StreamEvent>,
    connected: Arc<Mutex<bool>>,
    closed: Arc<Notify>,
) where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    let mut read_buf = BytesMut::with_capacity(READ_BUFFER_SIZE);
    let mut decoder = FrameDecoder::new();

    loop {
        tokio::select! {
            maybe = outgoing_rx.recv() => match maybe {
                Some(data) => {
                    if let Err(e) = writer.write_all(&data).await {
                        debug!("write error: {e}");
                        let _ = event_tx
                            .send(StreamEvent::Disconnected { reason: Some(e.to_string()) })
                            .await;
                        break;
                    }
                }
                // All senders dropped: this side is done with the connection.
                None => break,
            },

            _ = closed.notified() => {
                while let Ok(data) = outgoing_rx.try_recv() {
                    if writer.write_all(&data).await.is_err() {
                        break;
                    }
                }
                break;
            }

            result = reader.read_buf(&mut read_buf) => match result {
                Ok(0) => {
                    debug!("connection closed by peer");
                    let _ = event_tx
                        .send(StreamEvent::Disconnected { reason: None })
                        .await;
                    break;
                }
                Ok(_) => {
                    if !drain_decoder(&mut decoder, &mut read_buf, &event_tx).await {
                        break;
                    }
                }
                Err(e) => {
                    debug!("read error: {e}");
                    let _ = event_tx
                        .send(StreamEvent::Disconnected { reason: Some(e.to_string()) })
                        .await;
                    break;
                }
            },
        }
    }

    *connected.lock() = false;
}

/// Pull every complete frame out of the accumulator. Returns false once the
/// event channel is gone.
async fn drain_decoder(
    decoder: &mut FrameDecoder,
    read_buf: &mut BytesMut,
    event_tx: &mpsc::Sender<StreamEvent>,
) -> bool {
    loop {
        let event = match decoder.decode(read_buf) {
            Ok(Some(frame)) => StreamEvent::Frame(frame),
            Ok(None) => return true,
            Err(e) => StreamEvent::Protocol(e),
        };

        if event_tx.send(event).await.is_err() {
            return false;
        }
    }
}

/// Connect to a TCP server, resolving `host` and trying the first result.
pub async fn connect_tcp(host: &str, port: u16) -> Result<(FrameSender, FrameReceiver)> {
    let mut addrs = lookup_host((host, port))
        .await
        .map_err(TransportError::Resolve)?;
    let addr = addrs.next().ok_or_else(|| {
        TransportError::Resolve(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "no addresses resolved",
        ))
    })?;

    let stream = TcpStream::connect(addr)
        .await
        .map_err(TransportError::Connect)?;
    apply_keepalive(&stream);

    debug!("TCP connected to {addr}");
    Ok(spawn_io(stream))
}

/// Connect to a UNIX-domain server socket.
pub async fn connect_unix(path: impl AsRef<Path>) -> Result<(FrameSender, FrameReceiver)> {
    let path = path.as_ref();
    let stream = UnixStream::connect(path)
        .await
        .map_err(TransportError::Connect)?;

    debug!("connected to socket file {}", path.display());
    Ok(spawn_io(stream))
}

pub(crate) fn apply_keepalive(stream: &TcpStream) {
    let socket = socket2::SockRef::from(stream);
    let keepalive =
        socket2::TcpKeepalive::new().with_time(Duration::from_secs(KEEPALIVE_SECS));
    let _ = socket.set_tcp_keepalive(&keepalive);
}
