//! Buxtehude
//!
//! An embeddable message bus. Processes and in-process components exchange
//! typed, team-addressed messages over three interchangeable transports —
//! TCP, UNIX-domain sockets, and a direct in-process channel — with one
//! framing and routing model across all of them.
//!
//! A process hosts at most one [`Server`], which accepts remote peers and may
//! also host in-process peers, and any number of [`Client`]s. Messages carry
//! an application-defined `type`, a destination team name (or [`MSG_ALL`] for
//! broadcast), and a JSON-like content value; a client may declare per-type
//! availability so senders can target "the first willing peer of team T".
//!
//! # Example
//!
//! ```no_run
//! use buxtehude::{Client, ClientPreferences, Message, MessageFormat, Server};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     buxtehude::init();
//!
//!     let server = Server::new();
//!     server.ip_listen(1637).await?;
//!
//!     let client = Client::new(ClientPreferences {
//!         teamname: "sensors".into(),
//!         format: MessageFormat::Msgpack,
//!     });
//!     client.ip_connect("localhost", 1637).await?;
//!
//!     client.add_handler("poll", |client, msg| {
//!         let reply = Message {
//!             msg_type: "reading".into(),
//!             dest: msg.src.clone(),
//!             content: json!({ "value": 21.5 }),
//!             ..Default::default()
//!         };
//!         let _ = client.write(&reply);
//!     });
//!
//!     Ok(())
//! }
//! ```

mod client;
mod error;
mod handle;
mod init;
mod server;

pub use bux_core::{
    ClientPreferences, ConnectionType, Message, MessageFormat, CURRENT_VERSION, DEFAULT_PORT,
    MAX_MESSAGE_LENGTH, MIN_COMPATIBLE_VERSION, MSG_ALL, MSG_AVAILABLE, MSG_DISCONNECT, MSG_ERROR,
    MSG_HANDSHAKE, MSG_YOU,
};

pub use client::{Client, Handler};
pub use error::{ConnectError, ListenError, WriteError};
pub use init::init;
pub use server::{Server, HANDSHAKE_TIMEOUT};
