//! Buxtehude Core
//!
//! Wire model and protocol primitives for the buxtehude message bus.
//!
//! This crate provides:
//! - The message type and peer preferences ([`Message`], [`ClientPreferences`])
//! - Binary frame encoding and the resumable inbound decoder ([`FrameDecoder`])
//! - Payload codecs for the two wire formats ([`codec`])
//! - JSON-pointer predicate validation for control envelopes ([`validate`])

pub mod codec;
pub mod error;
pub mod frame;
pub mod message;
pub mod validate;

pub use error::{Error, Result};
pub use frame::{encode_frame, DecodeState, FrameDecoder, WireFrame};
pub use message::{
    ClientPreferences, ConnectionType, Message, MessageFormat, CURRENT_VERSION, DEFAULT_PORT,
    MAX_MESSAGE_LENGTH, MIN_COMPATIBLE_VERSION, MSG_ALL, MSG_AVAILABLE, MSG_DISCONNECT, MSG_ERROR,
    MSG_HANDSHAKE, MSG_YOU,
};
