//! Length-prefixed, checksummed frames.
//!
//! Every frame on the wire has the same envelope, all fields little-endian:
//!
//! ```text
//! offset 0..2    length    total frame length, header..checksum inclusive
//! offset 2..4    type      packet-type discriminator
//! offset 4..N    payload   type-specific
//! offset N..N+2  checksum  length ^ CHECKSUM_CONSTANT
//! ```
//!
//! The codec never looks inside the payload. Typed payloads are layered on
//! top in `packets`.

use crate::packets::types::{HANDSHAKE, KEEP_ALIVE};
use std::fmt;

pub const CHECKSUM_CONSTANT: u16 = 6716;
pub const HEADER_LEN: usize = 4;
pub const TRAILER_LEN: usize = 2;
pub const MIN_FRAME_LEN: usize = HEADER_LEN + TRAILER_LEN;
/// Largest frame the receive loop will slice out of a read.
pub const MAX_FRAME_LEN: usize = 16 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    TooShort {
        got: usize,
    },
    Malformed {
        packet_type: u16,
        declared: usize,
        available: usize,
    },
    BadChecksum {
        packet_type: u16,
        expected: u16,
        found: u16,
    },
    TooLarge {
        len: usize,
    },
    Payload {
        packet_type: u16,
        reason: String,
    },
}

impl FrameError {
    /// The packet type, when the header was readable.
    pub fn packet_type(&self) -> Option<u16> {
        match self {
            FrameError::TooShort { .. } | FrameError::TooLarge { .. } => None,
            FrameError::Malformed { packet_type, .. }
            | FrameError::BadChecksum { packet_type, .. }
            | FrameError::Payload { packet_type, .. } => Some(*packet_type),
        }
    }
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameError::TooShort { got } => {
                write!(f, "frame too short: need {MIN_FRAME_LEN}, got {got}")
            }
            FrameError::Malformed {
                packet_type,
                declared,
                available,
            } => write!(
                f,
                "malformed frame type {packet_type}: declared {declared} bytes, {available} available"
            ),
            FrameError::BadChecksum {
                packet_type,
                expected,
                found,
            } => write!(
                f,
                "bad checksum on type {packet_type}: expected {expected:#06x}, found {found:#06x}"
            ),
            FrameError::TooLarge { len } => {
                write!(f, "frame too large: {len} bytes (max {MAX_FRAME_LEN})")
            }
            FrameError::Payload {
                packet_type,
                reason,
            } => write!(f, "bad payload for type {packet_type}: {reason}"),
        }
    }
}

impl std::error::Error for FrameError {}

/// Checksum expected in the trailer of a frame of the given length.
pub fn checksum(length: u16) -> u16 {
    length ^ CHECKSUM_CONSTANT
}

/// One decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub length: u16,
    pub packet_type: u16,
    pub payload: Vec<u8>,
    /// Set only for handshake frames whose declared length did not fit the
    /// buffer. Everything after the header is handed over as payload.
    pub malformed: bool,
}

impl Frame {
    /// Decodes one frame from the start of `bytes`.
    ///
    /// The header is always read first so that the type is reported even when
    /// the rest of the frame is rejected.
    pub fn decode(bytes: &[u8]) -> Result<Frame, FrameError> {
        if bytes.len() < MIN_FRAME_LEN {
            return Err(FrameError::TooShort { got: bytes.len() });
        }

        let length = u16::from_le_bytes([bytes[0], bytes[1]]);
        let packet_type = u16::from_le_bytes([bytes[2], bytes[3]]);
        let declared = length as usize;

        if declared > bytes.len() || declared < MIN_FRAME_LEN {
            // The handshake precedes any negotiated length semantics.
            if packet_type == HANDSHAKE {
                return Ok(Frame {
                    length,
                    packet_type,
                    payload: bytes[HEADER_LEN..].to_vec(),
                    malformed: true,
                });
            }
            return Err(FrameError::Malformed {
                packet_type,
                declared,
                available: bytes.len(),
            });
        }

        if packet_type != HANDSHAKE && packet_type != KEEP_ALIVE {
            let found = u16::from_le_bytes([bytes[declared - 2], bytes[declared - 1]]);
            let expected = checksum(length);
            if found != expected {
                return Err(FrameError::BadChecksum {
                    packet_type,
                    expected,
                    found,
                });
            }
        }

        Ok(Frame {
            length,
            packet_type,
            payload: bytes[HEADER_LEN..declared - TRAILER_LEN].to_vec(),
            malformed: false,
        })
    }

    /// Builds the wire bytes for a frame: length first, checksum last.
    pub fn encode(packet_type: u16, payload: &[u8]) -> Result<Vec<u8>, FrameError> {
        let len = HEADER_LEN + payload.len() + TRAILER_LEN;
        if len > MAX_FRAME_LEN {
            return Err(FrameError::TooLarge { len });
        }

        let length = len as u16;
        let mut out = Vec::with_capacity(len);
        out.extend_from_slice(&length.to_le_bytes());
        out.extend_from_slice(&packet_type.to_le_bytes());
        out.extend_from_slice(payload);
        out.extend_from_slice(&checksum(length).to_le_bytes());
        Ok(out)
    }
}

/// Iterator over the frames concatenated in a single read.
///
/// Stops at the first length prefix that is zero, larger than
/// `MAX_FRAME_LEN`, or longer than what remains. The rest of the read is
/// abandoned; `abandoned()` reports how many bytes were dropped that way.
#[derive(Debug)]
pub struct Frames<'a> {
    buf: &'a [u8],
    offset: usize,
    abandoned: usize,
}

pub fn split_frames(buf: &[u8]) -> Frames<'_> {
    Frames {
        buf,
        offset: 0,
        abandoned: 0,
    }
}

impl<'a> Frames<'a> {
    pub fn abandoned(&self) -> usize {
        self.abandoned
    }
}

impl<'a> Iterator for Frames<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<&'a [u8]> {
        let remaining = &self.buf[self.offset..];
        if remaining.is_empty() {
            return None;
        }
        if remaining.len() < 2 {
            self.abandoned = remaining.len();
            self.offset = self.buf.len();
            return None;
        }

        let len = u16::from_le_bytes([remaining[0], remaining[1]]) as usize;
        if len == 0 || len > MAX_FRAME_LEN || len > remaining.len() {
            self.abandoned = remaining.len();
            self.offset = self.buf.len();
            return None;
        }

        self.offset += len;
        Some(&remaining[..len])
    }
}
