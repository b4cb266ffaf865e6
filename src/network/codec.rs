//! Length-prefixed envelope framing
//!
//! ```text
//! magic (4) | body length (4, BE) | kind length (2, BE) | kind | payload
//! ```

use crate::mesh::message::Envelope;
use bytes::{Buf, BufMut, BytesMut};
use std::io::{Error, ErrorKind};
use tokio_util::codec::{Decoder, Encoder};

pub const MAGIC: [u8; 4] = *b"FEDM";
/// Largest accepted frame body
pub const MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

const HEADER_LEN: usize = 8;

fn invalid(message: impl Into<String>) -> Error {
    Error::new(ErrorKind::InvalidData, message.into())
}

/// Codec for [`Envelope`] frames
#[derive(Debug, Default, Clone, Copy)]
pub struct MessageCodec;

impl Encoder<Envelope> for MessageCodec {
    type Error = Error;

    fn encode(&mut self, item: Envelope, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let kind = item.kind.as_bytes();
        let kind_len =
            u16::try_from(kind.len()).map_err(|_| invalid("message kind too long"))?;
        let body_len = 2 + kind.len() + item.payload.len();
        if body_len > MAX_FRAME_SIZE {
            return Err(invalid(format!("frame of {} bytes exceeds limit", body_len)));
        }

        dst.reserve(HEADER_LEN + body_len);
        dst.put_slice(&MAGIC);
        dst.put_u32(body_len as u32);
        dst.put_u16(kind_len);
        dst.put_slice(kind);
        dst.put_slice(&item.payload);
        Ok(())
    }
}

impl Decoder for MessageCodec {
    type Item = Envelope;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }
        if src[..4] != MAGIC {
            return Err(invalid("invalid magic bytes"));
        }

        let body_len = u32::from_be_bytes([src[4], src[5], src[6], src[7]]) as usize;
        if body_len > MAX_FRAME_SIZE {
            return Err(invalid(format!("frame of {} bytes exceeds limit", body_len)));
        }
        if body_len < 2 {
            return Err(invalid("frame too short"));
        }
        if src.len() < HEADER_LEN + body_len {
            src.reserve(HEADER_LEN + body_len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let mut body = src.split_to(body_len);
        let kind_len = body.get_u16() as usize;
        if kind_len > body.len() {
            return Err(invalid("kind length exceeds frame"));
        }
        let kind = String::from_utf8(body.split_to(kind_len).to_vec())
            .map_err(|_| invalid("message kind is not UTF-8"))?;

        Ok(Some(Envelope {
            kind,
            payload: body.to_vec(),
        }))
    }
}
