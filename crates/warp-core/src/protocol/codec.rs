//! Wire protocol codec for warp messages.
//!
//! Format: 4-byte big-endian length prefix + bincode-encoded Message
//!
//! The codec ensures:
//! - Messages are length-prefixed for stream framing
//! - The frame size cap is enforced in both directions
//! - Partial reads return Ok(None) to support streaming

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::constants::MAX_FRAME_SIZE;
use crate::error::{Error, Result};
use crate::protocol::Message;

/// Length of the frame header (4 bytes, big-endian u32).
pub const FRAME_HEADER_LEN: usize = 4;

/// Codec for length-prefixed bincode encoding of messages.
pub struct Codec;

impl Codec {
    /// Encode a message to bytes with length prefix.
    ///
    /// Returns the encoded bytes including the 4-byte length header.
    pub fn encode(msg: &Message) -> Result<Bytes> {
        let payload = bincode::serialize(msg).map_err(|e| Error::Codec {
            message: format!("serialization failed: {e}"),
        })?;

        if payload.len() > MAX_FRAME_SIZE {
            return Err(Error::Codec {
                message: format!(
                    "frame too large: {} bytes (max {})",
                    payload.len(),
                    MAX_FRAME_SIZE
                ),
            });
        }

        let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + payload.len());
        buf.put_u32(payload.len() as u32);
        buf.put_slice(&payload);

        Ok(buf.freeze())
    }

    /// Decode a message from a buffer.
    ///
    /// Returns:
    /// - Ok(Some(msg)) if a complete message was decoded (buffer is advanced)
    /// - Ok(None) if more data is needed (buffer unchanged)
    /// - Err if the data is invalid or exceeds the frame cap
    ///
    /// The buffer is only consumed on successful decode.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Message>> {
        if buf.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }

        // Peek the length without consuming
        let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;

        // Reject oversized frames before waiting for more data
        if len > MAX_FRAME_SIZE {
            return Err(Error::Codec {
                message: format!("frame length {len} exceeds maximum {MAX_FRAME_SIZE}"),
            });
        }

        if buf.len() < FRAME_HEADER_LEN + len {
            return Ok(None);
        }

        buf.advance(FRAME_HEADER_LEN);

        let payload = buf.split_to(len);
        let msg = bincode::deserialize(&payload).map_err(|e| Error::Codec {
            message: format!("deserialization failed: {e}"),
        })?;

        Ok(Some(msg))
    }

    /// Decode from a slice (convenience for testing).
    pub fn decode_slice(data: &[u8]) -> Result<Option<Message>> {
        let mut buf = BytesMut::from(data);
        Self::decode(&mut buf)
    }
}
