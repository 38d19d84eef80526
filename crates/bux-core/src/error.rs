//! Error types for the buxtehude wire model

use thiserror::Error;

/// Result type alias for wire-level operations
pub type Result<T> = std::result::Result<T, Error>;

/// Wire-level error types
#[derive(Error, Debug)]
pub enum Error {
    /// Unknown format tag in a frame header
    #[error("invalid format tag: 0x{0:02x}")]
    InvalidFormat(u8),

    /// Declared payload length exceeds the protocol limit
    #[error("frame length {0} exceeds the 256 KiB limit")]
    OversizeLength(u32),

    /// Outbound payload exceeds the protocol limit
    #[error("frame payload too large: {0} bytes")]
    FrameTooLarge(usize),

    /// Payload could not be parsed in the tagged format
    #[error("parse error: {0}")]
    Parse(String),

    /// Message could not be serialized
    #[error("encode error: {0}")]
    Encode(String),
}

impl From<rmp_serde::encode::Error> for Error {
    fn from(e: rmp_serde::encode::Error) -> Self {
        Error::Encode(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for Error {
    fn from(e: rmp_serde::decode::Error) -> Self {
        Error::Parse(e.to_string())
    }
}
