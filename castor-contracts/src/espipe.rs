//! Length-delimited framing for the encoder's stdin/stdout pipes.
//!
//! The encoder runs in es-pipe mode: each sample crosses the pipe as a
//! fixed 32-byte header followed by the raw payload. Field order (all
//! big-endian):
//!
//! ```text
//! magic:u16  kind:u8  flags:u8  sequence:u64  pts:i64  dts:i64  len:u32
//! ```
//!
//! Flag bit 0 marks keyframes, bit 1 marks codec-config records (parameter
//! sets, AudioSpecificConfig) written ahead of the first sample.

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

use crate::sample::EsSample;

pub const ESPIPE_MAGIC: u16 = 0x4553;
pub const HEADER_LEN: usize = 32;
/// Upper bound on a single payload; anything larger is a corrupt stream.
pub const MAX_PAYLOAD: usize = 16 << 20;

const FLAG_KEYFRAME: u8 = 0b0000_0001;
const FLAG_CONFIG: u8 = 0b0000_0010;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Video,
    Audio,
}

impl MediaKind {
    fn to_wire(self) -> u8 {
        match self {
            Self::Video => 0,
            Self::Audio => 1,
        }
    }

    fn from_wire(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::Video),
            1 => Some(Self::Audio),
            _ => None,
        }
    }
}

/// One record on the encoder pipe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EsPipeFrame {
    pub kind: MediaKind,
    pub is_keyframe: bool,
    pub is_config: bool,
    pub sequence: u64,
    pub pts: i64,
    pub dts: i64,
    pub payload: Vec<u8>,
}

impl EsPipeFrame {
    pub fn from_sample(kind: MediaKind, sample: &EsSample) -> Self {
        Self {
            kind,
            is_keyframe: sample.is_keyframe,
            is_config: false,
            sequence: sample.sequence,
            pts: sample.pts,
            dts: sample.dts,
            payload: sample.payload.clone(),
        }
    }

    /// Codec-config record written before the first sample of a stream.
    pub fn config(kind: MediaKind, payload: Vec<u8>) -> Self {
        Self {
            kind,
            is_keyframe: false,
            is_config: true,
            sequence: 0,
            pts: 0,
            dts: 0,
            payload,
        }
    }

    pub fn into_sample(self) -> EsSample {
        EsSample {
            pts: self.pts,
            dts: self.dts,
            payload: self.payload,
            is_keyframe: self.is_keyframe,
            sequence: self.sequence,
        }
    }
}

#[derive(Debug, Error)]
pub enum EsPipeError {
    #[error("bad es-pipe magic: {0:#06x}")]
    BadMagic(u16),
    #[error("unknown media kind byte: {0}")]
    UnknownKind(u8),
    #[error("payload of {0} bytes exceeds the es-pipe bound")]
    Oversized(usize),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Stateless `tokio_util` codec for es-pipe records.
#[derive(Debug, Default, Clone, Copy)]
pub struct EsPipeCodec;

impl Decoder for EsPipeCodec {
    type Item = EsPipeFrame;
    type Error = EsPipeError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<EsPipeFrame>, EsPipeError> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        // Validate the header without consuming so a short read can resume.
        let magic = u16::from_be_bytes([src[0], src[1]]);
        if magic != ESPIPE_MAGIC {
            return Err(EsPipeError::BadMagic(magic));
        }
        let kind = MediaKind::from_wire(src[2]).ok_or(EsPipeError::UnknownKind(src[2]))?;
        let flags = src[3];
        let len = u32::from_be_bytes([src[28], src[29], src[30], src[31]]) as usize;
        if len > MAX_PAYLOAD {
            return Err(EsPipeError::Oversized(len));
        }
        if src.len() < HEADER_LEN + len {
            src.reserve(HEADER_LEN + len - src.len());
            return Ok(None);
        }

        src.advance(4);
        let sequence = src.get_u64();
        let pts = src.get_i64();
        let dts = src.get_i64();
        src.advance(4);
        let payload = src.split_to(len).to_vec();

        Ok(Some(EsPipeFrame {
            kind,
            is_keyframe: flags & FLAG_KEYFRAME != 0,
            is_config: flags & FLAG_CONFIG != 0,
            sequence,
            pts,
            dts,
            payload,
        }))
    }
}

impl Encoder<EsPipeFrame> for EsPipeCodec {
    type Error = EsPipeError;

    fn encode(&mut self, frame: EsPipeFrame, dst: &mut BytesMut) -> Result<(), EsPipeError> {
        if frame.payload.len() > MAX_PAYLOAD {
            return Err(EsPipeError::Oversized(frame.payload.len()));
        }
        let mut flags = 0u8;
        if frame.is_keyframe {
            flags |= FLAG_KEYFRAME;
        }
        if frame.is_config {
            flags |= FLAG_CONFIG;
        }

        dst.reserve(HEADER_LEN + frame.payload.len());
        dst.put_u16(ESPIPE_MAGIC);
        dst.put_u8(frame.kind.to_wire());
        dst.put_u8(flags);
        dst.put_u64(frame.sequence);
        dst.put_i64(frame.pts);
        dst.put_i64(frame.dts);
        dst.put_u32(frame.payload.len() as u32);
        dst.put_slice(&frame.payload);
        Ok(())
    }
}
