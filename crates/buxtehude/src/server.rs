//! The routing engine
//!
//! A `Server` owns one long-lived loop task, started lazily by the first
//! `*_listen` / `internal_enable` call. Every listener, connection and timer
//! reports into the loop through one typed event channel, and the loop
//! handles exactly one event at a time, so all routing state is touched from
//! a single task. In-process clients bypass the channel with a mutex-guarded
//! inbox plus a wakeup, mirroring the socket path's ordering.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bux_core::{
    codec, validate, ClientPreferences, ConnectionType, Message, MessageFormat, MSG_ALL,
    MSG_AVAILABLE, MSG_DISCONNECT, MSG_HANDSHAKE,
};
use bux_transport::{
    Acceptor, FrameReceiver, FrameSender, PeerAddr, StreamEvent, TcpAcceptor, TransportError,
    UnixAcceptor,
};
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::client::ClientInner;
use crate::error::ListenError;
use crate::handle::{ClientHandle, PeerId};

/// How long an accepted peer may take to complete its handshake
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(60);

const EVENT_CAPACITY: usize = 64;

/// One unit of work for the server loop
pub(crate) enum ServerEvent {
    NewConnection {
        conn_type: ConnectionType,
        sender: FrameSender,
        receiver: FrameReceiver,
        addr: PeerAddr,
    },
    Stream {
        id: PeerId,
        event: StreamEvent,
    },
    HandshakeTimeout {
        id: PeerId,
    },
    Shutdown,
}

struct LoopState {
    events_tx: Option<mpsc::Sender<ServerEvent>>,
    task: Option<JoinHandle<()>>,
    unix_path: Option<PathBuf>,
}

pub(crate) struct ServerInner {
    clients: Mutex<Vec<ClientHandle>>,
    inbox: Mutex<Vec<(PeerId, Message)>>,
    removals: Mutex<Vec<PeerId>>,
    internal_ready: Notify,
    shutdown_accept: Notify,
    closing: AtomicBool,
    next_peer: AtomicU64,
    loop_state: Mutex<LoopState>,
}

/// The bus server: accepts peers over any enabled transport and routes
/// messages between them by team name.
pub struct Server {
    pub(crate) inner: Arc<ServerInner>,
}

impl Server {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ServerInner {
                clients: Mutex::new(Vec::new()),
                inbox: Mutex::new(Vec::new()),
                removals: Mutex::new(Vec::new()),
                internal_ready: Notify::new(),
                shutdown_accept: Notify::new(),
                closing: AtomicBool::new(false),
                next_peer: AtomicU64::new(0),
                loop_state: Mutex::new(LoopState {
                    events_tx: None,
                    task: None,
                    unix_path: None,
                }),
            }),
        }
    }

    /// Listen for UNIX-domain connections on `path`.
    pub fn unix_listen(&self, path: impl Into<PathBuf>) -> Result<(), ListenError> {
        let acceptor = UnixAcceptor::bind(path).map_err(listen_error)?;
        self.inner.loop_state.lock().unix_path = Some(acceptor.path().to_path_buf());

        let events_tx = self.ensure_running();
        self.spawn_accept_loop(acceptor, ConnectionType::Unix, events_tx);
        Ok(())
    }

    /// Listen for TCP connections on `port` (0 picks a free port). Returns
    /// the bound address.
    pub async fn ip_listen(&self, port: u16) -> Result<SocketAddr, ListenError> {
        let acceptor = TcpAcceptor::bind(port).await.map_err(listen_error)?;
        let addr = acceptor.local_addr().map_err(listen_error)?;

        let events_tx = self.ensure_running();
        self.spawn_accept_loop(acceptor, ConnectionType::Internet, events_tx);
        Ok(addr)
    }

    /// Start the loop so in-process clients can attach.
    pub fn internal_enable(&self) {
        self.ensure_running();
    }

    /// Shut the server down: stop the loop, disconnect every peer with
    /// reason "Shutting down server", remove the UNIX socket file. Safe to
    /// call more than once.
    pub async fn close(&self) {
        debug!("shutting down server");

        let (events_tx, task, unix_path) = {
            let mut state = self.inner.loop_state.lock();
            (
                state.events_tx.take(),
                state.task.take(),
                state.unix_path.take(),
            )
        };

        self.inner.closing.store(true, Ordering::SeqCst);
        self.inner.shutdown_accept.notify_waiters();

        if let Some(events_tx) = events_tx {
            let _ = events_tx.send(ServerEvent::Shutdown).await;
        }
        if let Some(task) = task {
            let _ = task.await;
        }

        let handles = std::mem::take(&mut *self.inner.clients.lock());
        for mut handle in handles {
            handle.disconnect("Shutting down server");
        }

        if let Some(path) = unix_path {
            let _ = std::fs::remove_file(path);
        }
    }

    /// Number of peers currently attached.
    pub fn peer_count(&self) -> usize {
        self.inner.clients.lock().len()
    }

    fn ensure_running(&self) -> mpsc::Sender<ServerEvent> {
        let mut state = self.inner.loop_state.lock();
        if let Some(events_tx) = &state.events_tx {
            return events_tx.clone();
        }

        self.inner.closing.store(false, Ordering::SeqCst);
        let (events_tx, events_rx) = mpsc::channel(EVENT_CAPACITY);
        state.events_tx = Some(events_tx.clone());
        state.task = Some(tokio::spawn(run(
            self.inner.clone(),
            events_tx.clone(),
            events_rx,
        )));
        events_tx
    }

    fn spawn_accept_loop<A: Acceptor + 'static>(
        &self,
        mut acceptor: A,
        conn_type: ConnectionType,
        events_tx: mpsc::Sender<ServerEvent>,
    ) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = inner.shutdown_accept.notified() => break,
                    accepted = acceptor.accept() => match accepted {
                        Ok((sender, receiver, addr)) => {
                            if inner.closing.load(Ordering::SeqCst) {
                                break;
                            }
                            let event = ServerEvent::NewConnection {
                                conn_type,
                                sender,
                                receiver,
                                addr,
                            };
                            if events_tx.send(event).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!("accept error: {e}"),
                    },
                }
            }
        });
    }
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        let mut state = self.inner.loop_state.lock();
        self.inner.closing.store(true, Ordering::SeqCst);
        self.inner.shutdown_accept.notify_waiters();

        if let Some(events_tx) = state.events_tx.take() {
            let _ = events_tx.try_send(ServerEvent::Shutdown);
        }
        if let Some(path) = state.unix_path.take() {
            let _ = std::fs::remove_file(path);
        }
    }
}

async fn run(
    inner: Arc<ServerInner>,
    events_tx: mpsc::Sender<ServerEvent>,
    mut events_rx: mpsc::Receiver<ServerEvent>,
) {
    loop {
        tokio::select! {
            event = events_rx.recv() => match event {
                Some(ServerEvent::NewConnection { conn_type, sender, receiver, addr }) => {
                    inner.add_connection(&events_tx, conn_type, sender, receiver, addr);
                }
                Some(ServerEvent::Stream { id, event }) => inner.serve(id, event),
                Some(ServerEvent::HandshakeTimeout { id }) => inner.handshake_timeout(id),
                Some(ServerEvent::Shutdown) | None => return,
            },
            _ = inner.internal_ready.notified() => inner.drain_internal(),
        }
    }
}

impl ServerInner {
    fn add_connection(
        &self,
        events_tx: &mpsc::Sender<ServerEvent>,
        conn_type: ConnectionType,
        sender: FrameSender,
        mut receiver: FrameReceiver,
        addr: PeerAddr,
    ) {
        let id = self.next_peer.fetch_add(1, Ordering::Relaxed);

        {
            let mut clients = self.clients.lock();
            let mut handle = ClientHandle::remote(id, conn_type, sender);
            if handle.handshake().is_err() {
                handle.disconnect_no_write();
            }
            clients.push(handle);
        }

        debug!("new client connected on {conn_type} domain ({addr}), peer {id}");

        let pump_tx = events_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = receiver.recv().await {
                if pump_tx
                    .send(ServerEvent::Stream { id, event })
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });

        let timeout_tx = events_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(HANDSHAKE_TIMEOUT).await;
            let _ = timeout_tx.send(ServerEvent::HandshakeTimeout { id }).await;
        });
    }

    /// Handle one event from a socket-backed peer.
    fn serve(&self, id: PeerId, event: StreamEvent) {
        let mut clients = self.clients.lock();
        let Some(idx) = clients.iter().position(|h| h.id == id) else {
            debug!("no client with id {id}");
            return;
        };

        match event {
            StreamEvent::Frame(frame) => match codec::decode_message(&frame) {
                Ok(msg) => Self::handle_message(&mut clients, idx, msg),
                Err(e) => {
                    let teamname = clients[idx].preferences.teamname.clone();
                    let text = format!("Error parsing message from {teamname}: {e}");
                    warn!("{text}");
                    clients[idx].error(&text);
                }
            },
            StreamEvent::Protocol(e) => clients[idx].error(&e.to_string()),
            StreamEvent::Disconnected { .. } => clients[idx].disconnect_no_write(),
        }

        Self::sweep(&mut clients);
    }

    fn handshake_timeout(&self, id: PeerId) {
        let mut clients = self.clients.lock();
        let Some(idx) = clients.iter().position(|h| h.id == id) else {
            return;
        };

        if !clients[idx].handshaken {
            clients[idx].disconnect("Failed handshake");
            Self::sweep(&mut clients);
        }
    }

    /// Apply one message from an attached peer: handshake gate, availability
    /// bookkeeping, then routing.
    fn handle_message(clients: &mut Vec<ClientHandle>, idx: usize, mut msg: Message) {
        if !clients[idx].handshaken {
            if msg.msg_type != MSG_HANDSHAKE
                || !validate::validate(&msg.content, &validate::HANDSHAKE_SERVERSIDE)
            {
                clients[idx].disconnect("Failed handshake");
                return;
            }

            let peer = &mut clients[idx];
            peer.preferences.teamname = msg.content["teamname"]
                .as_str()
                .unwrap_or_default()
                .to_string();
            peer.preferences.format = msg.content["format"]
                .as_u64()
                .and_then(|v| MessageFormat::from_u8(v as u8))
                .unwrap_or_default();
            peer.handshaken = true;
            return;
        }

        if msg.msg_type == MSG_AVAILABLE {
            if !validate::validate(&msg.content, &validate::AVAILABLE) {
                clients[idx].error("Incorrect format for $$available message");
                return;
            }

            let type_name = msg.content["type"].as_str().unwrap_or_default().to_string();
            let available = msg.content["available"].as_bool().unwrap_or(false);

            let peer = &mut clients[idx];
            let pos = peer.unavailable.iter().position(|t| *t == type_name);
            match (available, pos) {
                (true, Some(pos)) => {
                    peer.unavailable.remove(pos);
                }
                (false, None) => peer.unavailable.push(type_name),
                _ => {}
            }
        }

        if msg.dest.is_empty() {
            return;
        }

        msg.src = clients[idx].preferences.teamname.clone();

        if msg.only_first {
            if let Some(dest) = Self::first_available(clients, idx, &msg.dest, &msg.msg_type) {
                if clients[dest].write(&msg).is_err() {
                    clients[dest].disconnect_no_write();
                }
            }
            return;
        }

        for i in 0..clients.len() {
            if i == idx {
                continue;
            }
            if clients[i].preferences.teamname != msg.dest && msg.dest != MSG_ALL {
                continue;
            }
            if clients[i].write(&msg).is_err() {
                clients[i].disconnect_no_write();
            }
        }
    }

    /// Pick the `only_first` recipient: first matching peer reporting the
    /// type available, else the last matching peer as a fallback so the
    /// message still lands somewhere on-team.
    fn first_available(
        clients: &[ClientHandle],
        exclude: usize,
        team: &str,
        type_name: &str,
    ) -> Option<usize> {
        let mut result = None;

        for (i, handle) in clients.iter().enumerate() {
            if i == exclude {
                continue;
            }
            if handle.preferences.teamname != team && team != MSG_ALL {
                continue;
            }
            result = Some(i);
            if handle.available(type_name) {
                return result;
            }
        }

        result
    }

    /// Erase every disconnected handle, announcing each departure to the
    /// peers that remain.
    fn sweep(clients: &mut Vec<ClientHandle>) {
        loop {
            let Some(idx) = clients.iter().position(|h| !h.connected) else {
                return;
            };
            let handle = clients.remove(idx);
            debug!(
                "removing peer {} ({}, {} domain)",
                handle.id, handle.preferences.teamname, handle.conn_type
            );

            Self::broadcast(
                clients,
                &Message {
                    msg_type: MSG_DISCONNECT.to_string(),
                    content: json!({ "who": handle.preferences.teamname }),
                    ..Default::default()
                },
            );
        }
    }

    fn broadcast(clients: &mut [ClientHandle], msg: &Message) {
        for handle in clients.iter_mut() {
            if handle.write(msg).is_err() {
                handle.disconnect_no_write();
            }
        }
    }

    /// Drain the in-process inbox and deferred removals. Removals queued
    /// after a client's writes are processed after them.
    fn drain_internal(&self) {
        let messages = std::mem::take(&mut *self.inbox.lock());

        let mut clients = self.clients.lock();
        for (id, msg) in messages {
            let Some(idx) = clients.iter().position(|h| h.id == id) else {
                debug!("no client with id {id}");
                continue;
            };
            Self::handle_message(&mut clients, idx, msg);
        }
        Self::sweep(&mut clients);

        let removals = std::mem::take(&mut *self.removals.lock());
        for id in removals {
            let Some(idx) = clients.iter().position(|h| h.id == id) else {
                continue;
            };
            let handle = clients.remove(idx);
            debug!(
                "removing internal peer {} ({})",
                handle.id, handle.preferences.teamname
            );

            Self::broadcast(
                &mut clients,
                &Message {
                    msg_type: MSG_DISCONNECT.to_string(),
                    content: json!({ "who": handle.preferences.teamname }),
                    ..Default::default()
                },
            );
        }
        Self::sweep(&mut clients);
    }

    /// Attach an in-process client. Called from the client's thread; the
    /// server handshake is delivered synchronously into its handlers.
    pub(crate) fn internal_add_client(
        &self,
        client: &Arc<ClientInner>,
        preferences: ClientPreferences,
    ) -> PeerId {
        let id = self.next_peer.fetch_add(1, Ordering::Relaxed);

        let mut clients = self.clients.lock();
        let mut handle = ClientHandle::internal(id, client, preferences);
        if handle.handshake().is_err() {
            handle.disconnect_no_write();
        }
        clients.push(handle);
        id
    }

    /// Queue a message from an in-process client and wake the loop.
    pub(crate) fn internal_receive(&self, id: PeerId, msg: Message) {
        self.inbox.lock().push((id, msg));
        self.internal_ready.notify_one();
    }

    /// Queue the departure of an in-process client and wake the loop.
    pub(crate) fn internal_remove(&self, id: PeerId) {
        self.removals.lock().push(id);
        self.internal_ready.notify_one();
    }
}

fn listen_error(e: TransportError) -> ListenError {
    match e {
        TransportError::Bind(io) => ListenError::Bind(io),
        other => ListenError::Bind(std::io::Error::other(other)),
    }
}
