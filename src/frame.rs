//! Frame codec.
//!
//! A frame is `marker, length (u16 LE), opcode, payload, crc (u32 LE)`. The
//! length counts every byte of the frame and is always a multiple of four,
//! because the checksum runs over 32-bit words like the STM32 CRC unit does.
//! The trailer is chosen so the checksum over the whole frame is zero.

use crate::prelude::*;
use crc::{Algorithm, Crc};

const FRAME_CRC_ALGORITHM: Algorithm<u32> = Algorithm {
    width: 32,
    poly: 0x1EDC_6F41,
    init: 7,
    refin: false,
    refout: false,
    xorout: 0,
    check: 0xCD0D_B721,
    residue: 0,
};
const FRAME_CRC: Crc<u32> = Crc::<u32>::new(&FRAME_CRC_ALGORITHM);

/// Word oriented CRC-32C with seed 7. Each little-endian word is fed most
/// significant byte first; a trailing partial word is zero extended.
pub fn checksum(data: &[u8]) -> u32 {
    let mut digest = FRAME_CRC.digest();
    for chunk in data.chunks(4) {
        let mut word = [0; 4];
        word[..chunk.len()].copy_from_slice(chunk);
        digest.update(&u32::from_le_bytes(word).to_be_bytes());
    }
    digest.finalize()
}

fn valid_length(length: usize, max: usize) -> bool {
    (FRAME_OVERHEAD..=max).contains(&length) && length % 4 == 0
}

/// A complete frame whose checksum has been verified.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Frame<'a> {
    bytes: &'a [u8],
}

impl<'a> Frame<'a> {
    /// Validates `bytes` as exactly one frame.
    pub fn new(bytes: &'a [u8]) -> Option<Self> {
        if bytes.len() < FRAME_OVERHEAD || bytes[0] != FRAME_MARKER {
            return None;
        }
        let length = u16::from_le_bytes([bytes[1], bytes[2]]) as usize;
        if length != bytes.len() || length % 4 != 0 || checksum(bytes) != 0 {
            return None;
        }
        Some(Self { bytes })
    }

    pub fn opcode(&self) -> u8 {
        self.bytes[3]
    }

    pub fn payload(&self) -> &'a [u8] {
        &self.bytes[HEADER_SIZE..self.bytes.len() - CRC_SIZE]
    }

    pub fn as_bytes(&self) -> &'a [u8] {
        self.bytes
    }
}

/// Writes header and trailer around a payload already placed at
/// `buf[HEADER_SIZE..]`. The payload is zero padded to a whole word.
pub fn seal(buf: &mut [u8], opcode: u8, payload_len: usize) -> Result<usize, DataError> {
    let padded = (payload_len + 3) & !3;
    let length = padded + FRAME_OVERHEAD;
    let buf_size = buf.len();

    if buf_size < length || length > u16::MAX as usize {
        return Err(DataError::BufferTooSmall {
            buf_size,
            required: length,
        });
    }

    buf[HEADER_SIZE + payload_len..HEADER_SIZE + padded].fill(0);
    buf[0] = FRAME_MARKER;
    buf[1..3].copy_from_slice(&(length as u16).to_le_bytes());
    buf[3] = opcode;
    let crc = checksum(&buf[..length - CRC_SIZE]);
    buf[length - CRC_SIZE..length].copy_from_slice(&crc.to_le_bytes());

    Ok(length)
}

/// Copies `payload` behind a fresh header and seals the frame.
pub fn encode(buf: &mut [u8], opcode: u8, payload: &[u8]) -> Result<usize, DataError> {
    let required = HEADER_SIZE + payload.len();
    if buf.len() < required {
        return Err(DataError::BufferTooSmall {
            buf_size: buf.len(),
            required,
        });
    }
    buf[HEADER_SIZE..required].copy_from_slice(payload);
    seal(buf, opcode, payload.len())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum DecodeState {
    AwaitStart,
    LengthLow,
    LengthHigh,
    Opcode,
    Payload,
    Crc0,
    Crc1,
    Crc2,
    Crc3,
}

enum Step {
    Consumed,
    /// Byte left in the input to be looked at again from `AwaitStart`.
    Rejected,
    Complete,
}

/// Streaming command frame decoder.
///
/// Bytes may arrive in arbitrarily sized chunks. Frames with a bad length or
/// checksum are dropped silently and decoding resumes at the next marker.
pub struct FrameDecoder {
    state: DecodeState,
    buf: [u8; MAX_COMMAND_FRAME],
    pos: usize,
    length: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            state: DecodeState::AwaitStart,
            buf: [0; MAX_COMMAND_FRAME],
            pos: 0,
            length: 0,
        }
    }

    pub fn reset(&mut self) {
        self.state = DecodeState::AwaitStart;
        self.pos = 0;
        self.length = 0;
    }

    /// True while a frame has been started but not finished.
    pub fn in_frame(&self) -> bool {
        self.state != DecodeState::AwaitStart
    }

    /// Feeds `input` until one valid frame completes or the input runs out.
    ///
    /// Returns how many bytes were used; the caller passes the rest back in
    /// once it is done with the returned frame.
    pub fn push(&mut self, input: &[u8]) -> (usize, Option<Frame<'_>>) {
        let mut used = 0;

        while used < input.len() {
            let rest = &input[used..];

            if self.state == DecodeState::AwaitStart {
                if let Some(length) = Self::whole_frame(rest) {
                    self.buf[..length].copy_from_slice(&rest[..length]);
                    self.length = length;
                    used += length;
                    if checksum(&self.buf[..length]) == 0 {
                        return (used, Some(self.frame()));
                    }
                    log::warn!("dropping frame with bad checksum");
                    continue;
                }
            }

            match self.step(rest[0]) {
                Step::Consumed => used += 1,
                Step::Rejected => {}
                Step::Complete => {
                    used += 1;
                    self.state = DecodeState::AwaitStart;
                    if checksum(&self.buf[..self.length]) == 0 {
                        return (used, Some(self.frame()));
                    }
                    log::warn!("dropping frame with bad checksum");
                }
            }
        }

        (used, None)
    }

    /// Length of a frame that is entirely present at the start of `input`.
    fn whole_frame(input: &[u8]) -> Option<usize> {
        if input.len() < FRAME_OVERHEAD || input[0] != FRAME_MARKER {
            return None;
        }
        let length = u16::from_le_bytes([input[1], input[2]]) as usize;
        (valid_length(length, MAX_COMMAND_FRAME) && input.len() >= length).then_some(length)
    }

    fn frame(&self) -> Frame<'_> {
        Frame {
            bytes: &self.buf[..self.length],
        }
    }

    fn step(&mut self, byte: u8) -> Step {
        match self.state {
            DecodeState::AwaitStart => {
                if byte == FRAME_MARKER {
                    self.buf[0] = byte;
                    self.state = DecodeState::LengthLow;
                }
            }
            DecodeState::LengthLow => {
                self.buf[1] = byte;
                self.state = DecodeState::LengthHigh;
            }
            DecodeState::LengthHigh => {
                let length = u16::from_le_bytes([self.buf[1], byte]) as usize;
                if !valid_length(length, MAX_COMMAND_FRAME) {
                    log::warn!("aborting frame with length {}", length);
                    self.state = DecodeState::AwaitStart;
                    return Step::Rejected;
                }
                self.buf[2] = byte;
                self.length = length;
                self.state = DecodeState::Opcode;
            }
            DecodeState::Opcode => {
                self.buf[3] = byte;
                self.pos = HEADER_SIZE;
                self.state = if self.length == FRAME_OVERHEAD {
                    DecodeState::Crc0
                } else {
                    DecodeState::Payload
                };
            }
            DecodeState::Payload => {
                self.buf[self.pos] = byte;
                self.pos += 1;
                if self.pos == self.length - CRC_SIZE {
                    self.state = DecodeState::Crc0;
                }
            }
            DecodeState::Crc0 | DecodeState::Crc1 | DecodeState::Crc2 => {
                self.buf[self.pos] = byte;
                self.pos += 1;
                self.state = match self.state {
                    DecodeState::Crc0 => DecodeState::Crc1,
                    DecodeState::Crc1 => DecodeState::Crc2,
                    _ => DecodeState::Crc3,
                };
            }
            DecodeState::Crc3 => {
                self.buf[self.pos] = byte;
                self.pos += 1;
                return Step::Complete;
            }
        }
        Step::Consumed
    }
}
