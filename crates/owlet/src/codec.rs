//! Serial frame codec
//!
//! Frames on the serial link are `COBS(payload ‖ crc16_le(payload)) ‖ 0x00`.
//! The zero delimiter lets the decoder resynchronise after partial reads or
//! line noise: anything up to the next zero belongs to one frame, and a frame
//! that fails COBS decoding or the CRC is dropped as a whole.

use bytes::{Buf, BytesMut};
use crc::{Crc, CRC_16_KERMIT};

/// Frame delimiter
pub const DELIMITER: u8 = 0x00;

/// Largest encoded frame (without delimiter) the decoder will buffer
pub const MAX_ENCODED_FRAME: usize = 512;

const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_KERMIT);
const CRC_LEN: usize = 2;

/// Result of one decode step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// A complete frame; `consumed` bytes (delimiter included) were used
    Frame { payload: Vec<u8>, consumed: usize },
    /// No complete frame in the buffer yet
    NeedMore,
    /// A delimited frame was damaged; resume decoding at `resync_from`
    Corrupt { resync_from: usize, reason: CorruptReason },
}

/// Why a frame was rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorruptReason {
    Cobs,
    TooShort,
    Crc { expected: u16, actual: u16 },
    Overflow,
}

impl std::fmt::Display for CorruptReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CorruptReason::Cobs => f.write_str("invalid COBS encoding"),
            CorruptReason::TooShort => f.write_str("frame too short"),
            CorruptReason::Crc { expected, actual } => {
                write!(f, "CRC mismatch (expected 0x{:04X}, got 0x{:04X})", expected, actual)
            }
            CorruptReason::Overflow => f.write_str("no delimiter within maximum frame size"),
        }
    }
}

/// Encode a payload into a delimited wire frame
pub fn encode(payload: &[u8]) -> Vec<u8> {
    let mut raw = Vec::with_capacity(payload.len() + CRC_LEN);
    raw.extend_from_slice(payload);
    raw.extend_from_slice(&CRC16.checksum(payload).to_le_bytes());

    let mut frame = cobs::encode_vec(&raw);
    frame.push(DELIMITER);
    frame
}

/// Decode the first frame in `buf`
pub fn decode(buf: &[u8]) -> Decoded {
    let mut start = 0;

    loop {
        let window = &buf[start..];
        let Some(end) = window.iter().position(|&b| b == DELIMITER) else {
            if window.len() > MAX_ENCODED_FRAME {
                return Decoded::Corrupt {
                    resync_from: buf.len(),
                    reason: CorruptReason::Overflow,
                };
            }
            return Decoded::NeedMore;
        };

        // Consecutive delimiters carry no frame
        if end == 0 {
            start += 1;
            continue;
        }

        let resync_from = start + end + 1;
        let raw = match cobs::decode_vec(&window[..end]) {
            Ok(raw) => raw,
            Err(_) => {
                return Decoded::Corrupt {
                    resync_from,
                    reason: CorruptReason::Cobs,
                }
            }
        };

        if raw.len() <= CRC_LEN {
            return Decoded::Corrupt {
                resync_from,
                reason: CorruptReason::TooShort,
            };
        }

        let (payload, trailer) = raw.split_at(raw.len() - CRC_LEN);
        let expected = u16::from_le_bytes([trailer[0], trailer[1]]);
        let actual = CRC16.checksum(payload);
        if expected != actual {
            return Decoded::Corrupt {
                resync_from,
                reason: CorruptReason::Crc { expected, actual },
            };
        }

        return Decoded::Frame {
            payload: payload.to_vec(),
            consumed: resync_from,
        };
    }
}

/// Streaming decoder that owns the residual receive buffer
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: BytesMut,
}

/// Output of [`FrameDecoder::next_frame`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameEvent {
    Frame(Vec<u8>),
    Corrupt(CorruptReason),
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append received bytes
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Take the next frame or corruption report, `None` when more bytes are needed
    pub fn next_frame(&mut self) -> Option<FrameEvent> {
        match decode(&self.buf) {
            Decoded::Frame { payload, consumed } => {
                self.buf.advance(consumed);
                Some(FrameEvent::Frame(payload))
            }
            Decoded::Corrupt {
                resync_from,
                reason,
            } => {
                self.buf.advance(resync_from);
                Some(FrameEvent::Corrupt(reason))
            }
            Decoded::NeedMore => None,
        }
    }

    /// Bytes buffered without a delimiter
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }
}
