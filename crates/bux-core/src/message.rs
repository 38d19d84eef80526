//! Message model and protocol constants

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Reserved destination: deliver to every peer except the sender.
pub const MSG_ALL: &str = "$$all";
/// Client→server availability update for `only_first` routing.
pub const MSG_AVAILABLE: &str = "$$available";
/// Disconnection notice, in either direction.
pub const MSG_DISCONNECT: &str = "$$disconnect";
/// Server-side grievance, rate-limited per peer.
pub const MSG_ERROR: &str = "$$error";
/// First message in each direction of a fresh connection.
pub const MSG_HANDSHAKE: &str = "$$handshake";
/// `who` value in a `$$disconnect` addressed to the disconnected peer itself.
pub const MSG_YOU: &str = "$$you";

/// Upper bound on a serialized message payload, in bytes.
pub const MAX_MESSAGE_LENGTH: u32 = 1024 * 256;

/// Port an IP server binds when the caller does not pick one.
pub const DEFAULT_PORT: u16 = 1637;

pub const CURRENT_VERSION: u8 = 0;
pub const MIN_COMPATIBLE_VERSION: u8 = 0;

/// Payload encoding, negotiated in the handshake and tagged on every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum MessageFormat {
    Json = 0,
    #[default]
    Msgpack = 1,
}

impl MessageFormat {
    pub fn from_u8(val: u8) -> Option<Self> {
        match val {
            0 => Some(MessageFormat::Json),
            1 => Some(MessageFormat::Msgpack),
            _ => None,
        }
    }
}

/// How a peer is attached to the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionType {
    Unix,
    Internet,
    Internal,
}

impl fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionType::Unix => write!(f, "UNIX"),
            ConnectionType::Internet => write!(f, "internet"),
            ConnectionType::Internal => write!(f, "internal"),
        }
    }
}

/// The only unit on the wire.
///
/// `type` names the application-level meaning; names starting with `$$` are
/// reserved for control traffic. `dest` is a team name, empty for "do not
/// route", or [`MSG_ALL`] for broadcast. `src` is stamped by the server on
/// relay; whatever a sender wrote there is overwritten.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type", default)]
    pub msg_type: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub dest: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub src: String,

    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub content: Value,

    /// Deliver to a single eligible peer of the destination team rather than
    /// all of them.
    #[serde(default)]
    pub only_first: bool,
}

/// Identity and encoding a client announces in its handshake.
#[derive(Debug, Clone)]
pub struct ClientPreferences {
    pub teamname: String,
    pub format: MessageFormat,
}

impl Default for ClientPreferences {
    fn default() -> Self {
        Self {
            teamname: "default".to_string(),
            format: MessageFormat::Msgpack,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_empty_fields_omitted() {
        let msg = Message {
            msg_type: "ping".to_string(),
            ..Default::default()
        };

        let encoded = serde_json::to_value(&msg).unwrap();
        assert_eq!(encoded, json!({ "type": "ping", "only_first": false }));
    }

    #[test]
    fn test_missing_fields_default() {
        let msg: Message = serde_json::from_value(json!({ "type": "ping" })).unwrap();
        assert_eq!(msg.msg_type, "ping");
        assert!(msg.dest.is_empty());
        assert!(msg.src.is_empty());
        assert!(msg.content.is_null());
        assert!(!msg.only_first);
    }

    #[test]
    fn test_format_tags() {
        assert_eq!(MessageFormat::from_u8(0), Some(MessageFormat::Json));
        assert_eq!(MessageFormat::from_u8(1), Some(MessageFormat::Msgpack));
        assert_eq!(MessageFormat::from_u8(2), None);
        assert_eq!(MessageFormat::Msgpack as u8, 1);
    }

    #[test]
    fn test_default_preferences() {
        let prefs = ClientPreferences::default();
        assert_eq!(prefs.teamname, "default");
        assert_eq!(prefs.format, MessageFormat::Msgpack);
    }
}
