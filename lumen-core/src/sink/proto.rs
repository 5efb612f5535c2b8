//! Messages understood by the lighting controller.
//!
//! The stream protocol itself belongs to the controller ecosystem;
//! this module fixes only what the capture side has to produce — a
//! registration message on connect, then pixel frames. Replies are
//! treated as opaque bytes and discarded.
//!
//! Payload layout (little-endian, inside the length-delimited frame):
//!
//! ```text
//! Register:  tag 0x01 (1) | priority i32 (4) | origin utf-8 (rest)
//! Frame:     tag 0x02 (1) | width u32 (4) | height u32 (4) | rgb [u8]
//! ```

use bytes::{BufMut, BytesMut};

use crate::pixel::PixelBuffer;

pub const TAG_REGISTER: u8 = 0x01;
pub const TAG_FRAME: u8 = 0x02;

/// An outbound message for the sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkMessage {
    /// Announce ourselves before the first frame.
    Register { origin: String, priority: i32 },
    /// One RGB24 frame.
    Frame {
        width: u32,
        height: u32,
        data: Vec<u8>,
    },
}

impl SinkMessage {
    /// Payload size in bytes (excluding the length prefix).
    pub fn payload_len(&self) -> usize {
        match self {
            Self::Register { origin, .. } => 1 + 4 + origin.len(),
            Self::Frame { data, .. } => 1 + 4 + 4 + data.len(),
        }
    }

    /// Append the payload bytes to `dst`.
    pub fn encode_payload(&self, dst: &mut BytesMut) {
        match self {
            Self::Register { origin, priority } => {
                dst.put_u8(TAG_REGISTER);
                dst.put_i32_le(*priority);
                dst.extend_from_slice(origin.as_bytes());
            }
            Self::Frame {
                width,
                height,
                data,
            } => {
                dst.put_u8(TAG_FRAME);
                dst.put_u32_le(*width);
                dst.put_u32_le(*height);
                dst.extend_from_slice(data);
            }
        }
    }
}

impl From<PixelBuffer> for SinkMessage {
    fn from(frame: PixelBuffer) -> Self {
        Self::Frame {
            width: frame.width,
            height: frame.height,
            data: frame.data,
        }
    }
}
