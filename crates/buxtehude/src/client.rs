//! The outward-facing bus client
//!
//! A `Client` is a cheap handle over shared state; clones address the same
//! connection. Socket-backed clients run one loop task that dispatches
//! inbound messages to the registered handlers; in-process clients have no
//! task of their own — the server's loop calls straight into their handlers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use bux_core::{
    codec, validate, ClientPreferences, ConnectionType, Message, CURRENT_VERSION, MSG_AVAILABLE,
    MSG_ERROR, MSG_HANDSHAKE,
};
use bux_transport::{
    connect_tcp, connect_unix, FrameReceiver, FrameSender, StreamEvent, TransportError,
};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::error::{ConnectError, WriteError};
use crate::handle::PeerId;
use crate::server::{Server, ServerInner};

/// Callback invoked for each inbound message of a registered type. Runs on
/// the loop task that delivered the message; it must not block.
pub type Handler = Arc<dyn Fn(&Client, &Message) + Send + Sync>;

type DisconnectHandler = Arc<dyn Fn(&Client) + Send + Sync>;

enum ConnState {
    Idle,
    Socket {
        sender: FrameSender,
        shutdown: Arc<Notify>,
    },
    Internal {
        server: Weak<ServerInner>,
        id: PeerId,
    },
}

pub(crate) struct ClientInner {
    preferences: ClientPreferences,
    handlers: DashMap<String, Handler>,
    disconnect_handler: Mutex<Option<DisconnectHandler>>,
    connected: AtomicBool,
    conn: Mutex<ConnState>,
}

/// A bus client. Connect it over exactly one of the three transports, then
/// exchange messages through [`write`](Client::write) and the handler map.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    pub fn new(preferences: ClientPreferences) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                preferences,
                handlers: DashMap::new(),
                disconnect_handler: Mutex::new(None),
                connected: AtomicBool::new(false),
                conn: Mutex::new(ConnState::Idle),
            }),
        }
    }

    pub fn preferences(&self) -> &ClientPreferences {
        &self.inner.preferences
    }

    pub fn connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    /// Connect to a bus server over TCP. `host` is resolved and the first
    /// result is tried.
    pub async fn ip_connect(&self, host: &str, port: u16) -> Result<(), ConnectError> {
        if self.connected() {
            return Err(ConnectError::AlreadyConnected);
        }

        let (sender, receiver) = connect_tcp(host, port).await.map_err(connect_error)?;
        self.finish_socket_connect(ConnectionType::Internet, sender, receiver)
    }

    /// Connect to a bus server over a UNIX-domain socket.
    pub async fn unix_connect(&self, path: &str) -> Result<(), ConnectError> {
        if self.connected() {
            return Err(ConnectError::AlreadyConnected);
        }

        let (sender, receiver) = connect_unix(path).await.map_err(connect_error)?;
        self.finish_socket_connect(ConnectionType::Unix, sender, receiver)
    }

    /// Attach to a server in the same process. Inbound messages are
    /// delivered as direct calls from the server's loop into this client's
    /// handlers.
    pub fn internal_connect(&self, server: &Server) -> Result<(), ConnectError> {
        if self.connected() {
            return Err(ConnectError::AlreadyConnected);
        }

        self.install_default_handlers();
        self.inner.connected.store(true, Ordering::SeqCst);

        let id = server
            .inner
            .internal_add_client(&self.inner, self.inner.preferences.clone());
        *self.inner.conn.lock() = ConnState::Internal {
            server: Arc::downgrade(&server.inner),
            id,
        };

        server.inner.internal_receive(id, self.handshake_message());
        Ok(())
    }

    /// Send a message to the bus. Synchronous: the message is queued (socket)
    /// or enqueued with the server (internal) before this returns.
    pub fn write(&self, msg: &Message) -> Result<(), WriteError> {
        if !self.connected() {
            return Err(WriteError);
        }

        let conn = self.inner.conn.lock();
        match &*conn {
            ConnState::Socket { sender, .. } => {
                let bytes =
                    codec::encode_message(self.inner.preferences.format, msg).map_err(|e| {
                        warn!("failed to encode message: {e}");
                        WriteError
                    })?;
                sender.try_send(bytes).map_err(|e| {
                    debug!("write failed: {e}");
                    WriteError
                })
            }
            ConnState::Internal { server, id } => match server.upgrade() {
                Some(server) => {
                    server.internal_receive(*id, msg.clone());
                    Ok(())
                }
                None => Err(WriteError),
            },
            ConnState::Idle => Err(WriteError),
        }
    }

    /// Advertise willingness (or not) to receive `only_first`-routed
    /// messages of `type_name`.
    pub fn set_available(&self, type_name: &str, available: bool) -> Result<(), WriteError> {
        self.write(&Message {
            msg_type: MSG_AVAILABLE.to_string(),
            content: json!({ "type": type_name, "available": available }),
            ..Default::default()
        })
    }

    /// Register a handler for a message type, replacing any existing one.
    pub fn add_handler<F>(&self, type_name: &str, handler: F)
    where
        F: Fn(&Client, &Message) + Send + Sync + 'static,
    {
        self.inner
            .handlers
            .insert(type_name.to_string(), Arc::new(handler));
    }

    pub fn erase_handler(&self, type_name: &str) {
        self.inner.handlers.remove(type_name);
    }

    pub fn clear_handlers(&self) {
        self.inner.handlers.clear();
    }

    /// Register a callback for when this client is disconnected, by either
    /// side.
    pub fn set_disconnect_handler<F>(&self, handler: F)
    where
        F: Fn(&Client) + Send + Sync + 'static,
    {
        *self.inner.disconnect_handler.lock() = Some(Arc::new(handler));
    }

    /// Detach from the bus. Safe to call more than once.
    pub fn disconnect(&self) {
        if !self.inner.connected.swap(false, Ordering::SeqCst) {
            return;
        }
        debug!("disconnecting client");

        let state = std::mem::replace(&mut *self.inner.conn.lock(), ConnState::Idle);
        match state {
            ConnState::Socket { sender, shutdown } => {
                shutdown.notify_one();
                sender.close();
            }
            ConnState::Internal { server, id } => {
                if let Some(server) = server.upgrade() {
                    server.internal_remove(id);
                }
            }
            ConnState::Idle => {}
        }

        self.fire_disconnect_handler();
    }

    fn finish_socket_connect(
        &self,
        conn_type: ConnectionType,
        sender: FrameSender,
        receiver: FrameReceiver,
    ) -> Result<(), ConnectError> {
        let shutdown = Arc::new(Notify::new());
        *self.inner.conn.lock() = ConnState::Socket {
            sender,
            shutdown: shutdown.clone(),
        };
        self.inner.connected.store(true, Ordering::SeqCst);

        self.install_default_handlers();
        if self.write(&self.handshake_message()).is_err() {
            self.inner.connected.store(false, Ordering::SeqCst);
            *self.inner.conn.lock() = ConnState::Idle;
            return Err(ConnectError::HandshakeWrite);
        }

        debug!("connected on {conn_type} domain");
        self.spawn_loop(receiver, shutdown);
        Ok(())
    }

    fn handshake_message(&self) -> Message {
        Message {
            msg_type: MSG_HANDSHAKE.to_string(),
            content: json!({
                "format": self.inner.preferences.format as u8,
                "teamname": self.inner.preferences.teamname,
                "version": CURRENT_VERSION,
            }),
            ..Default::default()
        }
    }

    fn spawn_loop(&self, mut receiver: FrameReceiver, shutdown: Arc<Notify>) {
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.notified() => break,
                    event = receiver.recv() => {
                        let Some(inner) = weak.upgrade() else { break };
                        let client = Client { inner };
                        match event {
                            Some(StreamEvent::Frame(frame)) => match codec::decode_message(&frame) {
                                Ok(msg) => client.dispatch(&msg),
                                Err(e) => warn!("error parsing message: {e}"),
                            },
                            Some(StreamEvent::Protocol(e)) => warn!("{e}"),
                            Some(StreamEvent::Disconnected { .. }) | None => {
                                client.remote_close();
                                break;
                            }
                        }
                    }
                }
            }
        });
    }

    /// Run the registered handler for one inbound message, if any.
    fn dispatch(&self, msg: &Message) {
        if msg.msg_type.is_empty() {
            warn!("received message with no type");
            return;
        }

        let handler = self
            .inner
            .handlers
            .get(&msg.msg_type)
            .map(|entry| entry.value().clone());
        if let Some(handler) = handler {
            handler(self, msg);
        }
    }

    /// The far side went away.
    fn remote_close(&self) {
        if !self.inner.connected.swap(false, Ordering::SeqCst) {
            return;
        }
        debug!("disconnected by peer");

        *self.inner.conn.lock() = ConnState::Idle;
        self.fire_disconnect_handler();
    }

    fn fire_disconnect_handler(&self) {
        let handler = self.inner.disconnect_handler.lock().clone();
        if let Some(handler) = handler {
            handler(self);
        }
    }

    fn install_default_handlers(&self) {
        self.add_handler(MSG_HANDSHAKE, |client, msg| {
            if !validate::validate(&msg.content, &validate::HANDSHAKE_CLIENTSIDE) {
                warn!("rejected server handshake, disconnecting");
                client.disconnect();
                return;
            }
            // One-shot: the version has been checked.
            client.erase_handler(MSG_HANDSHAKE);
        });

        self.add_handler(MSG_ERROR, |_, msg| {
            if !validate::validate(&msg.content, &validate::SERVER_MESSAGE) {
                warn!("erroneous server message");
                return;
            }
            info!(
                "error message from server: {}",
                msg.content.as_str().unwrap_or_default()
            );
        });
    }
}

impl Default for Client {
    fn default() -> Self {
        Self::new(ClientPreferences::default())
    }
}

impl ClientInner {
    /// Deliver a message straight into this client's handlers. Runs on the
    /// server's loop task; only for internal peers.
    pub(crate) fn deliver(self: &Arc<Self>, msg: &Message) {
        let client = Client {
            inner: self.clone(),
        };
        client.dispatch(msg);
    }

    /// Server-initiated teardown of an internal peer. Does not re-enter the
    /// server: the caller owns the peer table.
    pub(crate) fn internal_disconnect(self: &Arc<Self>) {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return;
        }
        debug!("disconnecting client");

        *self.conn.lock() = ConnState::Idle;

        let handler = self.disconnect_handler.lock().clone();
        if let Some(handler) = handler {
            handler(&Client {
                inner: self.clone(),
            });
        }
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        // Last handle gone: tear the connection down. No user callbacks can
        // observe this, so none are fired.
        if !*self.connected.get_mut() {
            return;
        }

        let state = std::mem::replace(self.conn.get_mut(), ConnState::Idle);
        match state {
            ConnState::Socket { sender, shutdown } => {
                shutdown.notify_one();
                sender.close();
            }
            ConnState::Internal { server, id } => {
                if let Some(server) = server.upgrade() {
                    server.internal_remove(id);
                }
            }
            ConnState::Idle => {}
        }
    }
}

fn connect_error(e: TransportError) -> ConnectError {
    match e {
        TransportError::Resolve(io) => ConnectError::Resolve(io),
        TransportError::Connect(io) => ConnectError::Connect(io),
        other => ConnectError::Connect(std::io::Error::other(other)),
    }
}
