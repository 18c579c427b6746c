use crate::constants::MAX_FAILURES;
use crate::error::DataError;
use heapless::Vec;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u16)]
pub enum FailureClass {
    Command = 1,
    Analog = 2,
    Mode = 3,
    Storage = 4,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u16)]
pub enum CommandFailure {
    Unimplemented = 1,
    Busy = 2,
    InvalidParameter = 3,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u16)]
pub enum StorageFailure {
    ConfigFlashBus = 1,
    ConfigFlashTimeout = 2,
    DetectorBus = 3,
}

/// One entry of a failed-command response.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FailureRecord {
    pub class: u16,
    pub code: u16,
}

impl FailureRecord {
    pub const SIZE: usize = 4;

    pub const BUSY: Self = Self::command(CommandFailure::Busy);
    pub const INVALID_PARAMETER: Self = Self::command(CommandFailure::InvalidParameter);
    pub const DAC_ERROR: Self = Self {
        class: FailureClass::Analog as u16,
        code: 1,
    };

    pub const fn command(code: CommandFailure) -> Self {
        Self {
            class: FailureClass::Command as u16,
            code: code as u16,
        }
    }

    pub const fn storage(code: StorageFailure) -> Self {
        Self {
            class: FailureClass::Storage as u16,
            code: code as u16,
        }
    }

    /// Identifies the mode machine step that failed.
    pub const fn mode_step(step: u16) -> Self {
        Self {
            class: FailureClass::Mode as u16,
            code: step,
        }
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0; Self::SIZE];
        out[..2].copy_from_slice(&self.class.to_le_bytes());
        out[2..].copy_from_slice(&self.code.to_le_bytes());
        out
    }
}

/// Failures accumulated while handling one frame.
///
/// Handlers append instead of returning early, so one response can carry
/// several causes. Records past the capacity are dropped.
#[derive(Clone, Debug, Default)]
pub struct FailureList {
    records: Vec<FailureRecord, MAX_FAILURES>,
}

impl FailureList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, record: FailureRecord) {
        if self.records.push(record).is_err() {
            log::warn!("failure list full, dropping {:?}", record);
        }
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn records(&self) -> &[FailureRecord] {
        &self.records
    }

    /// Count word plus one record per failure.
    pub fn packet_size(&self) -> usize {
        4 + self.records.len() * FailureRecord::SIZE
    }

    pub fn to_bytes(&self, buf: &mut [u8]) -> Result<usize, DataError> {
        let packet_size = self.packet_size();
        let buf_size = buf.len();

        if buf_size < packet_size {
            return Err(DataError::BufferTooSmall {
                buf_size,
                required: packet_size,
            });
        }

        buf[..4].copy_from_slice(&(self.records.len() as u32).to_le_bytes());
        for (record, out) in self
            .records
            .iter()
            .zip(buf[4..packet_size].chunks_exact_mut(FailureRecord::SIZE))
        {
            out.copy_from_slice(&record.to_bytes());
        }

        Ok(packet_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_layout() {
        assert_eq!(FailureRecord::BUSY.to_bytes(), [1, 0, 2, 0]);
        assert_eq!(FailureRecord::DAC_ERROR.to_bytes(), [2, 0, 1, 0]);
        assert_eq!(
            FailureRecord::command(CommandFailure::Unimplemented).to_bytes(),
            [1, 0, 1, 0]
        );
        assert_eq!(FailureRecord::mode_step(0x21).to_bytes(), [3, 0, 0x21, 0]);
        assert_eq!(
            FailureRecord::storage(StorageFailure::DetectorBus).to_bytes(),
            [4, 0, 3, 0]
        );
    }

    #[test]
    fn appends_in_order() {
        let mut list = FailureList::new();
        list.push(FailureRecord::DAC_ERROR);
        list.push(FailureRecord::mode_step(0x20));

        let mut buf = [0xAA; 16];
        assert_eq!(list.to_bytes(&mut buf), Ok(12));
        assert_eq!(&buf[..12], &[2, 0, 0, 0, 2, 0, 1, 0, 3, 0, 0x20, 0]);
        assert_eq!(buf[12], 0xAA);
    }

    #[test]
    fn overflow_is_dropped() {
        let mut list = FailureList::new();
        for _ in 0..MAX_FAILURES + 3 {
            list.push(FailureRecord::BUSY);
        }
        assert_eq!(list.len(), MAX_FAILURES);
        assert_eq!(list.packet_size(), 4 + MAX_FAILURES * 4);
    }

    #[test]
    fn too_small() {
        let mut list = FailureList::new();
        list.push(FailureRecord::BUSY);
        assert_eq!(
            list.to_bytes(&mut [0; 6]),
            Err(DataError::BufferTooSmall {
                buf_size: 6,
                required: 8
            })
        );
    }
}
