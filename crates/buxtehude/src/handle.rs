//! Server-side peer records

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use bux_core::{
    codec, ClientPreferences, ConnectionType, Message, CURRENT_VERSION, MSG_DISCONNECT, MSG_ERROR,
    MSG_HANDSHAKE, MSG_YOU,
};
use bux_transport::FrameSender;
use serde_json::json;
use tracing::{debug, warn};

use crate::client::ClientInner;
use crate::error::WriteError;

/// Identifies a peer in the server table for its lifetime
pub(crate) type PeerId = u64;

/// Minimum spacing between `$$error` messages to one peer
const ERROR_INTERVAL: Duration = Duration::from_secs(1);

/// How the server reaches a peer
pub(crate) enum PeerConn {
    /// Socket-backed: frames queue on the connection's outbound channel
    Remote { sender: FrameSender },
    /// In-process: delivered by direct call into the client's handlers
    Internal { client: Weak<ClientInner> },
}

/// One connected peer as the server sees it
pub(crate) struct ClientHandle {
    pub id: PeerId,
    pub conn: PeerConn,
    pub conn_type: ConnectionType,
    pub preferences: ClientPreferences,
    pub handshaken: bool,
    pub connected: bool,
    /// Message types this peer has opted out of for `only_first` routing
    pub unavailable: Vec<String>,
    /// When the last `$$error` went out; `None` until the first one
    pub last_error: Option<Instant>,
}

impl ClientHandle {
    pub fn remote(id: PeerId, conn_type: ConnectionType, sender: FrameSender) -> Self {
        Self {
            id,
            conn: PeerConn::Remote { sender },
            conn_type,
            preferences: ClientPreferences::default(),
            handshaken: false,
            connected: true,
            unavailable: Vec::new(),
            last_error: None,
        }
    }

    pub fn internal(id: PeerId, client: &Arc<ClientInner>, preferences: ClientPreferences) -> Self {
        Self {
            id,
            conn: PeerConn::Internal {
                client: Arc::downgrade(client),
            },
            conn_type: ConnectionType::Internal,
            preferences,
            handshaken: false,
            connected: true,
            unavailable: Vec::new(),
            last_error: None,
        }
    }

    /// Server→client handshake; the client checks only version compatibility.
    pub fn handshake(&mut self) -> Result<(), WriteError> {
        self.write(&Message {
            msg_type: MSG_HANDSHAKE.to_string(),
            content: json!({ "version": CURRENT_VERSION }),
            ..Default::default()
        })
    }

    /// Send one message to this peer, re-encoded in its preferred format.
    pub fn write(&mut self, msg: &Message) -> Result<(), WriteError> {
        if !self.connected {
            return Err(WriteError);
        }

        match &self.conn {
            PeerConn::Internal { client } => match client.upgrade() {
                Some(client) => {
                    client.deliver(msg);
                    Ok(())
                }
                None => Err(WriteError),
            },
            PeerConn::Remote { sender } => {
                let bytes = codec::encode_message(self.preferences.format, msg).map_err(|e| {
                    warn!(
                        "failed to encode message for {}: {e}",
                        self.preferences.teamname
                    );
                    WriteError
                })?;

                sender.try_send(bytes).map_err(|e| {
                    debug!("write to {} failed: {e}", self.preferences.teamname);
                    WriteError
                })
            }
        }
    }

    /// Rate-limited grievance. For a peer that has not handshaken, or when
    /// the grievance itself cannot be delivered, this escalates to
    /// disconnection.
    pub fn error(&mut self, text: &str) {
        if self
            .last_error
            .is_some_and(|at| at.elapsed() < ERROR_INTERVAL)
        {
            return;
        }
        self.last_error = Some(Instant::now());

        let delivered = self
            .write(&Message {
                msg_type: MSG_ERROR.to_string(),
                content: json!(text),
                ..Default::default()
            })
            .is_ok();

        if !self.handshaken || !delivered {
            self.disconnect("Failed handshake");
        }
    }

    /// Notify the peer it is being dropped, then drop it.
    pub fn disconnect(&mut self, reason: &str) {
        if !self.connected {
            return;
        }

        let _ = self.write(&Message {
            msg_type: MSG_DISCONNECT.to_string(),
            content: json!({ "reason": reason, "who": MSG_YOU }),
            ..Default::default()
        });
        self.disconnect_no_write();
    }

    /// Drop the peer without a parting message.
    pub fn disconnect_no_write(&mut self) {
        if !self.connected {
            return;
        }

        match &self.conn {
            PeerConn::Remote { sender } => sender.close(),
            PeerConn::Internal { client } => {
                if let Some(client) = client.upgrade() {
                    client.internal_disconnect();
                }
            }
        }

        debug!("disconnecting client {}", self.preferences.teamname);
        self.connected = false;
    }

    pub fn available(&self, type_name: &str) -> bool {
        !self.unavailable.iter().any(|t| t == type_name)
    }
}
