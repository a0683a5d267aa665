//! Wire framing and control payload codecs.
//!
//! A frame is a fixed 16-byte big-endian header followed by the raw payload:
//! channel `u32`, tag `u32`, payload length `u64`. The sender behind a frame
//! is implied by the socket it arrived on. Data-plane payloads are plain f32
//! runs; the control channel carries 4-byte step words and JSON greetings.

use crate::{
    error::{CommsErr, Result},
    pool::PoolBuf,
    specs::Control,
    transport::{ChannelId, Tag},
};

type LenType = u64;

pub const FRAME_HEADER_LEN: usize = 2 * size_of::<u32>() + size_of::<LenType>();

const STEP_LEN: usize = size_of::<u32>();

/// Encodes a frame header for a payload of `len` bytes.
pub fn encode_frame_header(channel: ChannelId, tag: Tag, len: usize) -> [u8; FRAME_HEADER_LEN] {
    let mut header = [0u8; FRAME_HEADER_LEN];
    header[..4].copy_from_slice(&channel.to_be_bytes());
    header[4..8].copy_from_slice(&tag.to_be_bytes());
    header[8..].copy_from_slice(&(len as LenType).to_be_bytes());
    header
}

/// Decodes a frame header into `(channel, tag, payload length)`.
pub fn decode_frame_header(header: &[u8; FRAME_HEADER_LEN]) -> (ChannelId, Tag, usize) {
    // SAFETY: the slice bounds below are fixed and inside FRAME_HEADER_LEN.
    let channel = u32::from_be_bytes(header[..4].try_into().unwrap());
    let tag = u32::from_be_bytes(header[4..8].try_into().unwrap());
    let len = LenType::from_be_bytes(header[8..].try_into().unwrap());
    (channel, tag, len as usize)
}

/// Writes a step word into `buf`.
pub fn write_step(buf: &mut PoolBuf, step: u32) {
    buf.bytes_mut()[..STEP_LEN].copy_from_slice(&step.to_be_bytes());
    buf.set_len(STEP_LEN);
}

/// Reads a step word out of a received payload.
pub fn read_step(buf: &PoolBuf) -> Result<u32> {
    let bytes = buf.as_bytes();
    if bytes.len() != STEP_LEN {
        return Err(CommsErr::Malformed {
            what: "step payload",
            len: bytes.len(),
        });
    }

    // SAFETY: length checked right above.
    Ok(u32::from_be_bytes(bytes.try_into().unwrap()))
}

/// Serializes a control message into `buf`.
pub fn write_control(buf: &mut PoolBuf, control: &Control) -> Result<()> {
    let encoded = serde_json::to_vec(control)?;
    if encoded.len() > buf.byte_capacity() {
        return Err(CommsErr::Truncated {
            got: encoded.len(),
            capacity: buf.byte_capacity(),
        });
    }

    buf.write_bytes(&encoded);
    Ok(())
}

/// Deserializes a control message out of a received payload.
pub fn read_control(buf: &PoolBuf) -> Result<Control> {
    Ok(serde_json::from_slice(buf.as_bytes())?)
}
