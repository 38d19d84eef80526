//! Message payload codecs
//!
//! Both wire formats serialize the same [`Message`] model: JSON through
//! `serde_json`, MessagePack through `rmp-serde` with named keys so the two
//! encodings stay field-compatible.

use bytes::Bytes;

use crate::{encode_frame, Error, Message, MessageFormat, Result, WireFrame};

/// Serialize a message payload in the given format
pub fn encode_payload(format: MessageFormat, message: &Message) -> Result<Vec<u8>> {
    match format {
        MessageFormat::Json => {
            serde_json::to_vec(message).map_err(|e| Error::Encode(e.to_string()))
        }
        MessageFormat::Msgpack => Ok(rmp_serde::to_vec_named(message)?),
    }
}

/// Parse a message payload in the given format
pub fn decode_payload(format: MessageFormat, bytes: &[u8]) -> Result<Message> {
    match format {
        MessageFormat::Json => {
            serde_json::from_slice(bytes).map_err(|e| Error::Parse(e.to_string()))
        }
        MessageFormat::Msgpack => Ok(rmp_serde::from_slice(bytes)?),
    }
}

/// Serialize a message into a complete frame ready for the wire
pub fn encode_message(format: MessageFormat, message: &Message) -> Result<Bytes> {
    let payload = encode_payload(format, message)?;
    encode_frame(format, &payload)
}

/// Parse the message carried by a decoded frame
pub fn decode_message(frame: &WireFrame) -> Result<Message> {
    decode_payload(frame.format, &frame.payload)
}
