// SPDX-License-Identifier: BSD-3-Clause

//! Frame encoding: `{type: u16 LE, length: u16 LE, payload}`.
//!
//! The codec is shared by both transports; the Unix path additionally
//! splices ancillary descriptors around it (see [`crate::channel`]).

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::Error;
use crate::message::{MAX_PAYLOAD, MessageType};

/// Fixed bytes before the payload.
pub const HEADER_LEN: usize = 4;

/// Stateless frame codec.
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

/// Appends one encoded frame to `dst`.
pub fn encode_frame(ty: MessageType, payload: &[u8], dst: &mut BytesMut) -> Result<(), Error> {
    if payload.len() > MAX_PAYLOAD {
        return Err(Error::Oversize { len: payload.len(), max: MAX_PAYLOAD });
    }
    dst.reserve(HEADER_LEN + payload.len());
    dst.put_u16_le(ty.code());
    dst.put_u16_le(payload.len() as u16);
    dst.put_slice(payload);
    Ok(())
}

/// Removes and returns one frame from `src` if a complete one is present.
pub fn decode_frame(src: &mut BytesMut) -> Result<Option<(MessageType, Bytes)>, Error> {
    if src.len() < HEADER_LEN {
        return Ok(None);
    }
    let code = u16::from_le_bytes([src[0], src[1]]);
    let len = u16::from_le_bytes([src[2], src[3]]) as usize;
    if len > MAX_PAYLOAD {
        return Err(Error::Oversize { len, max: MAX_PAYLOAD });
    }
    if src.len() < HEADER_LEN + len {
        return Ok(None);
    }
    let ty = MessageType::from_code(code)?;
    src.advance(HEADER_LEN);
    let payload = src.split_to(len).freeze();
    Ok(Some((ty, payload)))
}

impl Decoder for FrameCodec {
    type Item = (MessageType, Bytes);
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        decode_frame(src)
    }
}

impl Encoder<(MessageType, Bytes)> for FrameCodec {
    type Error = Error;

    fn encode(&mut self, item: (MessageType, Bytes), dst: &mut BytesMut) -> Result<(), Self::Error> {
        encode_frame(item.0, &item.1, dst)
    }
}
