//! Calibration persistence.
//!
//! The calibration is kept twice in two independent blocks. Each copy carries
//! a write counter and the frame checksum, so a torn write leaves the other
//! copy usable.

use crate::analog::{Calibration, CalibrationPair};
use crate::frame::checksum;
use core::fmt::Debug;
use snafu::Snafu;

pub const RECORD_SIZE: usize = 24;
const BLOCKS: usize = 2;

pub trait BlockStorage {
    type Error: Debug;

    fn read_block(&mut self, index: usize, buf: &mut [u8; RECORD_SIZE]) -> Result<(), Self::Error>;
    fn write_block(&mut self, index: usize, data: &[u8; RECORD_SIZE]) -> Result<(), Self::Error>;
}

impl<T: BlockStorage + ?Sized> BlockStorage for &mut T {
    type Error = T::Error;

    fn read_block(&mut self, index: usize, buf: &mut [u8; RECORD_SIZE]) -> Result<(), Self::Error> {
        (**self).read_block(index, buf)
    }
    fn write_block(&mut self, index: usize, data: &[u8; RECORD_SIZE]) -> Result<(), Self::Error> {
        (**self).write_block(index, data)
    }
}

#[derive(Snafu, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreError {
    #[snafu(display("Could not write calibration block {}", block))]
    WriteFail { block: usize },
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CalibrationRecord {
    pub calibration: Calibration,
    pub writes: u32,
}

impl CalibrationRecord {
    pub fn to_bytes(&self) -> [u8; RECORD_SIZE] {
        let mut out = [0u8; RECORD_SIZE];
        let c = &self.calibration;
        for (value, chunk) in [c.bias.c0, c.bias.c1, c.protect.c0, c.protect.c1]
            .iter()
            .zip(out.chunks_exact_mut(4))
        {
            chunk.copy_from_slice(&value.to_le_bytes());
        }
        out[16..20].copy_from_slice(&self.writes.to_le_bytes());
        let crc = checksum(&out[..20]);
        out[20..].copy_from_slice(&crc.to_le_bytes());
        out
    }

    /// `None` unless the checksum matches.
    pub fn from_bytes(bytes: &[u8; RECORD_SIZE]) -> Option<Self> {
        if checksum(bytes) != 0 {
            return None;
        }
        let word = |i: usize| [bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]];
        let float = |i: usize| f32::from_le_bytes(word(i));
        Some(Self {
            calibration: Calibration {
                bias: CalibrationPair {
                    c0: float(0),
                    c1: float(4),
                },
                protect: CalibrationPair {
                    c0: float(8),
                    c1: float(12),
                },
            },
            writes: u32::from_le_bytes(word(16)),
        })
    }
}

pub struct CalibrationStore<S> {
    storage: S,
    writes: u32,
}

impl<S: BlockStorage> CalibrationStore<S> {
    pub fn new(storage: S) -> Self {
        Self { storage, writes: 0 }
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn storage_mut(&mut self) -> &mut S {
        &mut self.storage
    }

    /// How many times the calibration has been saved over the device's life.
    pub fn writes(&self) -> u32 {
        self.writes
    }

    /// Loads the first valid copy. Without one, defaults are written back
    /// and returned.
    pub fn load(&mut self) -> Result<Calibration, StoreError> {
        for index in 0..BLOCKS {
            let mut buf = [0u8; RECORD_SIZE];
            if let Err(e) = self.storage.read_block(index, &mut buf) {
                log::warn!("calibration block {} unreadable: {:?}", index, e);
                continue;
            }
            if let Some(record) = CalibrationRecord::from_bytes(&buf) {
                log::info!("calibration loaded from block {}", index);
                self.writes = record.writes;
                return Ok(record.calibration);
            }
        }

        log::warn!("no valid calibration, storing defaults");
        let calibration = Calibration::default();
        self.save(&calibration)?;
        Ok(calibration)
    }

    /// Rewrites both copies, block 0 first.
    pub fn save(&mut self, calibration: &Calibration) -> Result<(), StoreError> {
        self.writes = self.writes.wrapping_add(1);
        let record = CalibrationRecord {
            calibration: *calibration,
            writes: self.writes,
        }
        .to_bytes();

        for block in 0..BLOCKS {
            self.storage.write_block(block, &record).map_err(|e| {
                log::error!("calibration block {} write failed: {:?}", block, e);
                StoreError::WriteFail { block }
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimBlockStorage;

    fn custom() -> Calibration {
        Calibration {
            bias: CalibrationPair { c0: 1.5, c1: 0.98 },
            protect: CalibrationPair { c0: -2.0, c1: 1.01 },
        }
    }

    #[test]
    fn blank_storage_gets_defaults() {
        let mut store = CalibrationStore::new(SimBlockStorage::new());
        assert_eq!(store.load(), Ok(Calibration::default()));
        assert_eq!(store.storage().writes(0), 1);
        assert_eq!(store.storage().writes(1), 1);
        assert!(CalibrationRecord::from_bytes(store.storage().block(1)).is_some());
    }

    #[test]
    fn save_then_load() {
        let mut store = CalibrationStore::new(SimBlockStorage::new());
        store.save(&custom()).unwrap();
        store.save(&custom()).unwrap();

        let mut reloaded = CalibrationStore::new(store.storage);
        assert_eq!(reloaded.load(), Ok(custom()));
        assert_eq!(reloaded.writes(), 2);
    }

    #[test]
    fn falls_back_to_second_copy() {
        let mut store = CalibrationStore::new(SimBlockStorage::new());
        store.save(&custom()).unwrap();
        store.storage_mut().block_mut(0)[3] ^= 0x10;

        assert_eq!(store.load(), Ok(custom()));
    }

    #[test]
    fn write_failure_is_reported() {
        let mut storage = SimBlockStorage::new();
        storage.set_failing(true);
        let mut store = CalibrationStore::new(storage);
        assert_eq!(
            store.save(&custom()),
            Err(StoreError::WriteFail { block: 0 })
        );
    }
}
