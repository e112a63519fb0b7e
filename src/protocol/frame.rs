//! Frame encoding and decoding for the upgraded connection.
//!
//! Only whole-message frames are produced or accepted: the FIN bit is
//! always set on output and required on input. Server frames are never
//! masked.

use crate::error::FrameError;

const FIN_BIT: u8 = 0x80;
const RSV_BITS: u8 = 0x70;
const OPCODE_MASK: u8 = 0x0F;
const MASK_BIT: u8 = 0x80;
const LEN_MASK: u8 = 0x7F;

const LEN_16_MARKER: u8 = 126;
const LEN_64_MARKER: u8 = 127;

/// Largest payload a control frame (ping, pong, close) may carry.
pub const MAX_CONTROL_PAYLOAD: usize = 125;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Text,
    Close,
    Ping,
    Pong,
}

impl Opcode {
    pub fn from_u8(byte: u8) -> Result<Self, FrameError> {
        match byte {
            0x1 => Ok(Opcode::Text),
            0x8 => Ok(Opcode::Close),
            0x9 => Ok(Opcode::Ping),
            0xA => Ok(Opcode::Pong),
            // continuation (0x0), binary (0x2) and reserved codes
            other => Err(FrameError::UnsupportedOpcode(other)),
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Opcode::Text => 0x1,
            Opcode::Close => 0x8,
            Opcode::Ping => 0x9,
            Opcode::Pong => 0xA,
        }
    }

    pub fn is_control(self) -> bool {
        !matches!(self, Opcode::Text)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub opcode: Opcode,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(opcode: Opcode, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            opcode,
            payload: payload.into(),
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::new(Opcode::Text, text.into().into_bytes())
    }

    pub fn ping(payload: impl Into<Vec<u8>>) -> Self {
        Self::new(Opcode::Ping, payload)
    }

    pub fn pong(payload: impl Into<Vec<u8>>) -> Self {
        Self::new(Opcode::Pong, payload)
    }

    pub fn encode(&self) -> Vec<u8> {
        encode_frame(self.opcode, &self.payload)
    }
}

/// Encode a single unmasked frame with the FIN bit set.
///
/// Lengths of 65536 bytes and above use the 64-bit form with the full
/// length written out; nothing is truncated.
pub fn encode_frame(opcode: Opcode, payload: &[u8]) -> Vec<u8> {
    let len = payload.len();
    let mut out = Vec::with_capacity(len + 10);
    out.push(FIN_BIT | opcode.as_u8());

    if len < LEN_16_MARKER as usize {
        out.push(len as u8);
    } else if len <= u16::MAX as usize {
        out.push(LEN_16_MARKER);
        out.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        out.push(LEN_64_MARKER);
        out.extend_from_slice(&(len as u64).to_be_bytes());
    }

    out.extend_from_slice(payload);
    out
}

/// Stateless apart from its limits; bytes are owned by the caller.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_payload_len: usize,
    require_mask: bool,
}

impl FrameCodec {
    pub fn new(max_payload_len: usize, require_mask: bool) -> Self {
        Self {
            max_payload_len,
            require_mask,
        }
    }

    /// Decode one frame from the front of `buf`.
    ///
    /// Returns `Ok(None)` when more bytes are needed, and
    /// `Ok(Some((frame, consumed)))` once a complete frame is available.
    /// An `Err` means the bytes can never form a valid frame.
    pub fn decode(&self, buf: &[u8]) -> Result<Option<(Frame, usize)>, FrameError> {
        if buf.len() < 2 {
            return Ok(None);
        }

        let first = buf[0];
        let second = buf[1];

        if first & FIN_BIT == 0 {
            return Err(FrameError::Fragmented);
        }
        if first & RSV_BITS != 0 {
            return Err(FrameError::ReservedBits(first & RSV_BITS));
        }
        let opcode = Opcode::from_u8(first & OPCODE_MASK)?;

        let masked = second & MASK_BIT != 0;
        if !masked && self.require_mask {
            return Err(FrameError::Unmasked);
        }

        let mut offset = 2;
        let declared: u64 = match second & LEN_MASK {
            LEN_16_MARKER => {
                if buf.len() < offset + 2 {
                    return Ok(None);
                }
                let len = u16::from_be_bytes([buf[offset], buf[offset + 1]]);
                offset += 2;
                len as u64
            }
            LEN_64_MARKER => {
                if buf.len() < offset + 8 {
                    return Ok(None);
                }
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&buf[offset..offset + 8]);
                offset += 8;
                let len = u64::from_be_bytes(raw);
                if len >> 63 != 0 {
                    return Err(FrameError::PayloadTooLarge {
                        declared: len,
                        limit: self.max_payload_len,
                    });
                }
                len
            }
            small => small as u64,
        };

        if opcode.is_control() && declared > MAX_CONTROL_PAYLOAD as u64 {
            return Err(FrameError::ControlFrameTooLarge(declared));
        }
        if declared > self.max_payload_len as u64 {
            return Err(FrameError::PayloadTooLarge {
                declared,
                limit: self.max_payload_len,
            });
        }
        let len = declared as usize;

        let mask = if masked {
            if buf.len() < offset + 4 {
                return Ok(None);
            }
            let key = [buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]];
            offset += 4;
            Some(key)
        } else {
            None
        };

        if buf.len() < offset + len {
            return Ok(None);
        }

        let mut payload = buf[offset..offset + len].to_vec();
        if let Some(key) = mask {
            apply_mask(&mut payload, key);
        }

        Ok(Some((Frame { opcode, payload }, offset + len)))
    }
}

/// XOR `payload` in place with the 4-byte masking key.
pub fn apply_mask(payload: &mut [u8], key: [u8; 4]) {
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= key[i % 4];
    }
}
