use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

use crate::tether::tunnel::message::MessageType;

/// Upper bound for `total_len`, header included.
pub const MAX_FRAME_LENGTH: u32 = 1 << 20; // 1 MiB

/// `total_len (u32be)` + `type (i16be)`.
pub const HEADER_LEN: usize = 6;

const LENGTH_FIELD_LEN: usize = 4;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame too large: {0}")]
    TooLarge(u32),
    #[error("frame length {0} is shorter than the header")]
    TooShort(u32),
    #[error("unknown message type: {0}")]
    UnknownType(i16),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// One complete control frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: MessageType,
    pub body: Bytes,
}

impl Frame {
    pub fn new(kind: MessageType, body: impl Into<Bytes>) -> Self {
        Self {
            kind,
            body: body.into(),
        }
    }

    pub fn total_len(&self) -> usize {
        HEADER_LEN + self.body.len()
    }
}

/// Writes `total_len`, `type` and `body` into `dst`.
pub fn encode(code: i16, body: &[u8], dst: &mut BytesMut) -> Result<(), FrameError> {
    let total = HEADER_LEN + body.len();
    if total > MAX_FRAME_LENGTH as usize {
        return Err(FrameError::TooLarge(u32::try_from(total).unwrap_or(u32::MAX)));
    }
    dst.reserve(total);
    dst.put_u32(total as u32);
    dst.put_i16(code);
    dst.put_slice(body);
    Ok(())
}

/// Splits one complete frame into `(total_len, type, body)`.
///
/// # Panics
///
/// Panics if `frame` is shorter than [`HEADER_LEN`]. The decoder only hands out
/// frames it has already length-checked, so this is a caller bug.
pub fn decode(frame: &[u8]) -> (u32, i16, &[u8]) {
    let mut hdr = &frame[..HEADER_LEN];
    let total = hdr.get_u32();
    let code = hdr.get_i16();
    (total, code, &frame[HEADER_LEN..])
}

/// Incremental reassembler for the control channel.
///
/// The `BytesMut` handed to [`Decoder::decode`] is the per-connection
/// accumulator: bytes stay in it until a whole frame is available, and any
/// number of frames may be drained from one read.
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        if src.len() < LENGTH_FIELD_LEN {
            return Ok(None);
        }

        let mut peek = &src[..];
        let total = peek.get_u32();
        if total > MAX_FRAME_LENGTH {
            return Err(FrameError::TooLarge(total));
        }
        if (total as usize) < HEADER_LEN {
            return Err(FrameError::TooShort(total));
        }
        if src.len() >= HEADER_LEN {
            let code = peek.get_i16();
            if MessageType::from_code(code).is_none() {
                return Err(FrameError::UnknownType(code));
            }
        }

        let total = total as usize;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        let raw = src.split_to(total).freeze();
        let (_, code, _) = decode(&raw);
        let kind = MessageType::from_code(code).ok_or(FrameError::UnknownType(code))?;
        Ok(Some(Frame {
            kind,
            body: raw.slice(HEADER_LEN..),
        }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), FrameError> {
        encode(item.kind.code(), &item.body, dst)
    }
}
