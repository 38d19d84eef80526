//! Binary frame encoding and the resumable inbound decoder
//!
//! Buxtehude frame format:
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ Byte 0:     Format tag (0 = JSON, 1 = MessagePack)           │
//! │ Bytes 1-4:  Payload length (uint32 little-endian)            │
//! ├──────────────────────────────────────────────────────────────┤
//! │ Payload (serialized Message, per format tag)                 │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! The length field is declared little-endian; peers of any host byte order
//! interoperate.

use crate::{Error, MessageFormat, Result, MAX_MESSAGE_LENGTH};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Frame header size: format tag plus length field
pub const HEADER_SIZE: usize = 5;

/// One tagged, length-prefixed payload off the wire
#[derive(Debug, Clone, PartialEq)]
pub struct WireFrame {
    pub format: MessageFormat,
    pub payload: Bytes,
}

/// Position of the decoder within the current frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DecodeState {
    #[default]
    AwaitFormat,
    AwaitLength,
    AwaitData,
}

/// Resumable frame decoder.
///
/// Feed it the inbound byte accumulator as often as data arrives; the state
/// survives across calls, so a frame may trickle in one byte at a time. The
/// decoder resets itself after a complete frame and after a protocol-level
/// rejection (bad tag, oversize length); in the rejection case the bytes of
/// the offending header have been consumed and nothing further.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    state: DecodeState,
    format: MessageFormat,
    expected: usize,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> DecodeState {
        self.state
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Advance the state machine over `buf`, consuming what it can.
    ///
    /// Returns `Ok(Some(frame))` once a full frame has been assembled,
    /// `Ok(None)` when more bytes are needed, or the protocol error that
    /// reset the decoder.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<WireFrame>> {
        loop {
            match self.state {
                DecodeState::AwaitFormat => {
                    if buf.is_empty() {
                        return Ok(None);
                    }
                    let tag = buf.get_u8();
                    let Some(format) = MessageFormat::from_u8(tag) else {
                        self.reset();
                        return Err(Error::InvalidFormat(tag));
                    };
                    self.format = format;
                    self.state = DecodeState::AwaitLength;
                }
                DecodeState::AwaitLength => {
                    if buf.len() < 4 {
                        return Ok(None);
                    }
                    let length = buf.get_u32_le();
                    if length > MAX_MESSAGE_LENGTH {
                        self.reset();
                        return Err(Error::OversizeLength(length));
                    }
                    self.expected = length as usize;
                    self.state = DecodeState::AwaitData;
                }
                DecodeState::AwaitData => {
                    if buf.len() < self.expected {
                        return Ok(None);
                    }
                    let payload = buf.split_to(self.expected).freeze();
                    let format = self.format;
                    self.reset();
                    return Ok(Some(WireFrame { format, payload }));
                }
            }
        }
    }
}

/// Encode a payload into a complete frame
pub fn encode_frame(format: MessageFormat, payload: &[u8]) -> Result<Bytes> {
    if payload.len() > MAX_MESSAGE_LENGTH as usize {
        return Err(Error::FrameTooLarge(payload.len()));
    }

    let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload.len());
    buf.put_u8(format as u8);
    buf.put_u32_le(payload.len() as u32);
    buf.extend_from_slice(payload);
    Ok(buf.freeze())
}
