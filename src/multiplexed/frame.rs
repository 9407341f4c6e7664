//! Wire format of the multiplexing layer.
//!
//! ```text
//! ┌──────────────┬────────┬──────────────┬─────────────────┐
//! │ pipeline u32 │ op u8  │ length u32   │ payload[length] │
//! └──────────────┴────────┴──────────────┴─────────────────┘
//!   big endian             big endian
//! ```

use std::fmt;

use bytes::{BufMut, BytesMut};

use crate::error::{Error, Result};

pub const HEADER_LEN: usize = 9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    Open = 0,
    Data = 1,
    Close = 2,
}

impl TryFrom<u8> for Opcode {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Opcode::Open),
            1 => Ok(Opcode::Data),
            2 => Ok(Opcode::Close),
            other => Err(Error::Protocol(format!("unknown frame opcode {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub pipeline: u32,
    pub opcode: Opcode,
    pub length: u32,
}

impl FrameHeader {
    /// Parses the first [`HEADER_LEN`] bytes of `bytes`.
    pub fn parse(bytes: &[u8]) -> Result<FrameHeader> {
        if bytes.len() < HEADER_LEN {
            return Err(Error::Incomplete);
        }
        let pipeline = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let opcode = Opcode::try_from(bytes[4])?;
        let length = u32::from_be_bytes([bytes[5], bytes[6], bytes[7], bytes[8]]);
        Ok(FrameHeader {
            pipeline,
            opcode,
            length,
        })
    }

    /// Total size of the frame on the wire.
    pub fn frame_len(&self) -> usize {
        HEADER_LEN + self.length as usize
    }
}

impl fmt::Display for FrameHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}[{}] {} bytes", self.opcode, self.pipeline, self.length)
    }
}

/// Appends a control frame (OPEN or CLOSE) without payload.
pub fn put_control(out: &mut BytesMut, pipeline: u32, opcode: Opcode) {
    out.reserve(HEADER_LEN);
    out.put_u32(pipeline);
    out.put_u8(opcode as u8);
    out.put_u32(0);
}

/// Appends `payload` as DATA frames of at most `max_frame` bytes each.
pub fn put_data(out: &mut BytesMut, pipeline: u32, payload: &[u8], max_frame: usize) {
    let frames = payload.len().div_ceil(max_frame);
    out.reserve(payload.len() + frames * HEADER_LEN);
    for chunk in payload.chunks(max_frame) {
        out.put_u32(pipeline);
        out.put_u8(Opcode::Data as u8);
        out.put_u32(chunk.len() as u32);
        out.put_slice(chunk);
    }
}
