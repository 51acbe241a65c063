//! Frame codec
//!
//! Length-prefixed framing for the braid wire protocol. The length field is
//! big-endian and counts every byte after itself (command + sid + payload),
//! so the minimum legal value is 9.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{BraidError, Result};
use crate::protocol::frame::{Command, Frame};
use crate::protocol::{DEFAULT_MAX_FRAME_LEN, LENGTH_FIELD_LEN, MIN_FRAME_LEN};

/// Codec for encoding and decoding braid frames
///
/// A frame below the 9-byte minimum or above `max_frame_len` is a transport
/// error; the channel that produced it gets reaped by the caller.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    /// Maximum allowed frame body
    max_frame_len: usize,
}

impl FrameCodec {
    /// Create a codec with the default frame bound
    pub fn new() -> Self {
        Self {
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }

    /// Create a codec with a custom frame bound
    pub fn with_max_frame_len(max_frame_len: usize) -> Self {
        Self { max_frame_len }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = BraidError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        // Need at least the length prefix
        if src.len() < LENGTH_FIELD_LEN {
            return Ok(None);
        }

        // Peek at the length without consuming it
        let mut length_bytes = [0u8; LENGTH_FIELD_LEN];
        length_bytes.copy_from_slice(&src[..LENGTH_FIELD_LEN]);
        let length = u32::from_be_bytes(length_bytes) as usize;

        if length < MIN_FRAME_LEN {
            return Err(BraidError::FrameTooShort {
                len: length,
                min: MIN_FRAME_LEN,
            });
        }

        if length > self.max_frame_len {
            return Err(BraidError::FrameTooLarge {
                len: length,
                max: self.max_frame_len,
            });
        }

        // Wait for the full body
        let total = LENGTH_FIELD_LEN + length;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_FIELD_LEN);

        let cmd = Command::try_from(src[0])?;
        src.advance(1);
        let sid = src.get_u64();
        let payload = src.split_to(length - MIN_FRAME_LEN).freeze();

        Ok(Some(Frame { cmd, sid, payload }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = BraidError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<()> {
        let length = frame.body_len();

        if length > self.max_frame_len {
            return Err(BraidError::FrameTooLarge {
                len: length,
                max: self.max_frame_len,
            });
        }

        dst.reserve(LENGTH_FIELD_LEN + length);
        dst.put_u32(length as u32);
        dst.put_u8(frame.cmd as u8);
        dst.put_u64(frame.sid);
        dst.put_slice(&frame.payload);

        Ok(())
    }
}
