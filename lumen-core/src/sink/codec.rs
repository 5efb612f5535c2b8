//! Length-delimited framing for the sink stream.
//!
//! Every message on the wire is a 4-byte big-endian length prefix
//! followed by that many payload bytes. Outbound payloads come from
//! [`SinkMessage`]; inbound payloads (controller replies) are handed
//! back as opaque bytes.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::LumenError;
use crate::sink::proto::SinkMessage;

/// Upper bound on a single outbound message (a 4K RGB frame fits).
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

/// Upper bound on a controller reply.
pub const MAX_REPLY_SIZE: usize = 64 * 1024;

pub struct SinkCodec;

impl tokio_util::codec::Encoder<SinkMessage> for SinkCodec {
    type Error = LumenError;

    fn encode(&mut self, item: SinkMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let len = item.payload_len();
        if len > MAX_MESSAGE_SIZE {
            return Err(LumenError::Other(format!(
                "sink message too large: {len} bytes"
            )));
        }
        dst.reserve(4 + len);
        dst.put_u32(len as u32);
        item.encode_payload(dst);
        Ok(())
    }
}

impl tokio_util::codec::Decoder for SinkCodec {
    type Item = Bytes;
    type Error = LumenError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 4 {
            return Ok(None);
        }

        let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if len > MAX_REPLY_SIZE {
            return Err(LumenError::Other(format!(
                "sink reply too large: {len} bytes"
            )));
        }
        if src.len() < 4 + len {
            src.reserve(4 + len - src.len());
            return Ok(None);
        }

        src.advance(4);
        Ok(Some(src.split_to(len).freeze()))
    }
}

// ── Tests ────────────────────────────────────────────────────────
