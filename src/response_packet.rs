use crate::analog::CalibrationPair;
use crate::cfg_flash::DeviceInfo;
use crate::frame;
use crate::prelude::*;

/// State reported by ping.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PingStatus {
    pub uptime_s: u32,
    pub busy: bool,
    pub reset_flags: u32,
    /// Opcode of the pending deferred command, 0 when idle.
    pub task: u32,
    pub task_state: u32,
}

/// Success payloads. Commands without a result use `Empty`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Response<'a> {
    Empty,
    Ping(PingStatus),
    /// Set bits per 8-word page.
    KPageBitCounts(&'a [u8]),
    SectorBitCount(u32),
    ReadData(&'a [u16]),
    ReadWord {
        samples: u32,
        bit_counts: [u32; READ_WORD_BITS],
    },
    ReadCfg(u16),
    CfgFlashRead(&'a [u8]),
    CfgFlashInfo(DeviceInfo),
    Calibration(CalibrationPair),
}

impl<'a> Response<'a> {
    pub const MAX_SIZE: usize = MAX_RESPONSE_PAYLOAD;

    pub fn to_bytes(&self, buf: &mut [u8]) -> Result<usize, DataError> {
        let packet_size = self.packet_size();
        let buf_size = buf.len();

        if buf_size < packet_size {
            return Err(DataError::BufferTooSmall {
                buf_size,
                required: packet_size,
            });
        }

        let buf = &mut buf[..packet_size];
        match self {
            Response::Empty => {}
            Response::Ping(status) => {
                let mut version = [0u8; VERSION_TAG_SIZE];
                let tag = VERSION_TAG.as_bytes();
                let n = tag.len().min(VERSION_TAG_SIZE - 1);
                version[..n].copy_from_slice(&tag[..n]);

                buf[0..4].copy_from_slice(&status.uptime_s.to_le_bytes());
                buf[4..20].copy_from_slice(&version);
                buf[20..24].copy_from_slice(&(status.busy as u32).to_le_bytes());
                buf[24..28].copy_from_slice(&status.reset_flags.to_le_bytes());
                buf[28..32].copy_from_slice(&status.task.to_le_bytes());
                buf[32..36].copy_from_slice(&status.task_state.to_le_bytes());
            }
            Response::KPageBitCounts(counts) => buf.copy_from_slice(counts),
            Response::SectorBitCount(bits) => buf.copy_from_slice(&bits.to_le_bytes()),
            Response::ReadData(words) => {
                buf.fill(0);
                for (word, out) in words.iter().zip(buf.chunks_exact_mut(2)) {
                    out.copy_from_slice(&word.to_le_bytes());
                }
            }
            Response::ReadWord {
                samples,
                bit_counts,
            } => {
                buf[..4].copy_from_slice(&samples.to_le_bytes());
                for (count, out) in bit_counts.iter().zip(buf[4..].chunks_exact_mut(4)) {
                    out.copy_from_slice(&count.to_le_bytes());
                }
            }
            Response::ReadCfg(word) => {
                buf[..2].copy_from_slice(&word.to_le_bytes());
                buf[2..].fill(0);
            }
            Response::CfgFlashRead(data) => {
                buf[..data.len()].copy_from_slice(data);
                buf[data.len()..].fill(0);
            }
            Response::CfgFlashInfo(info) => {
                buf[0] = info.manufacturer;
                buf[1] = info.device;
                buf[2] = info.jedec_type;
                buf[3] = info.jedec_capacity;
                buf[4..8].copy_from_slice(&info.unique_id);
                buf[8..11].copy_from_slice(&info.status);
                buf[11] = 0;
            }
            Response::Calibration(pair) => {
                buf[..4].copy_from_slice(&pair.c0.to_le_bytes());
                buf[4..].copy_from_slice(&pair.c1.to_le_bytes());
            }
        }

        Ok(packet_size)
    }

    pub fn packet_size(&self) -> usize {
        match self {
            Response::Empty => 0,
            Response::Ping(_) => 36,
            Response::KPageBitCounts(counts) => counts.len(),
            Response::SectorBitCount(_) => 4,
            // Odd counts carry one pad word.
            Response::ReadData(words) => 2 * (words.len() + words.len() % 2),
            Response::ReadWord { .. } => 4 + 4 * READ_WORD_BITS,
            Response::ReadCfg(_) => 4,
            Response::CfgFlashRead(data) => (data.len() + 3) & !3,
            Response::CfgFlashInfo(_) => 12,
            Response::Calibration(_) => 8,
        }
    }
}

/// The outgoing frame buffer, reused for every request.
pub struct ResponseFrame {
    buf: [u8; MAX_RESPONSE_FRAME],
    failures: FailureList,
    len: usize,
}

impl Default for ResponseFrame {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseFrame {
    pub fn new() -> Self {
        let mut frame = Self {
            buf: [0; MAX_RESPONSE_FRAME],
            failures: FailureList::new(),
            len: 0,
        };
        frame.reset();
        frame
    }

    /// Back to an unknown-command response with no failures.
    pub fn reset(&mut self) {
        self.buf[..HEADER_SIZE].copy_from_slice(&[
            FRAME_MARKER,
            FRAME_OVERHEAD as u8,
            0,
            UNKNOWN_COMMAND,
        ]);
        self.failures.clear();
        self.len = FRAME_OVERHEAD;
    }

    pub fn failures(&self) -> &FailureList {
        &self.failures
    }

    pub fn failures_mut(&mut self) -> &mut FailureList {
        &mut self.failures
    }

    pub fn unknown(&mut self) -> Result<&[u8], DataError> {
        self.seal(UNKNOWN_COMMAND, 0)
    }

    /// Encodes the result of `opcode`. Any recorded failure replaces the
    /// success payload.
    pub fn complete(&mut self, opcode: OpCode, response: &Response) -> Result<&[u8], DataError> {
        if self.failures.is_empty() {
            let n = response.to_bytes(&mut self.buf[HEADER_SIZE..MAX_RESPONSE_FRAME - CRC_SIZE])?;
            self.seal(opcode.response(), n)
        } else {
            self.failed()
        }
    }

    pub fn failed(&mut self) -> Result<&[u8], DataError> {
        let n = self
            .failures
            .to_bytes(&mut self.buf[HEADER_SIZE..MAX_RESPONSE_FRAME - CRC_SIZE])?;
        self.seal(FAILED_COMMAND, n)
    }

    /// The last sealed frame.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    fn seal(&mut self, opcode: u8, payload_len: usize) -> Result<&[u8], DataError> {
        self.len = frame::seal(&mut self.buf, opcode, payload_len)?;
        Ok(&self.buf[..self.len])
    }
}
