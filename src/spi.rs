//! Detector access through the interface FPGA's SPI bridge.

use crate::constants::CFG_ADDRESS_BIT;
use crate::detector::DetectorBus;
use core::cell::RefCell;
use embedded_hal::{
    blocking::spi::{Transfer, Write},
    digital::v2::OutputPin,
};
use snafu::Snafu;

mod instr {
    pub const READ_WORD: u8 = 0x0B;
    pub const WRITE_WORD: u8 = 0xF8;
    pub const PROGRAM_WORD: u8 = 0xF2;
    pub const ERASE_SECTOR: u8 = 0xD8;
    pub const ERASE_CHIP: u8 = 0x60;
    pub const ENTER_SCAN: u8 = 0xFB;
    pub const EXIT_SCAN: u8 = 0xF0;
    pub const ENTER_CFG_BYPASS: u8 = 0xE8;
    pub const EXIT_CFG_BYPASS: u8 = 0xE9;
}

const READ_DUMMY_BYTES: usize = 3;

#[derive(Snafu, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpiBridgeError {
    #[snafu(display("SPI transfer failed"))]
    Transfer,
    #[snafu(display("Could not drive chip select"))]
    ChipSelect,
}

pub struct SpiBridge<SPI, CS> {
    spi: SPI,
    cs: CS,
}

impl<SPI, CS> SpiBridge<SPI, CS>
where
    SPI: Transfer<u8> + Write<u8>,
    CS: OutputPin,
{
    pub fn new(spi: SPI, cs: CS) -> Self {
        Self { spi, cs }
    }

    pub fn release(self) -> (SPI, CS) {
        (self.spi, self.cs)
    }

    /// Performs an SPI transfer with CS control: write then read
    fn transfer_with_cs(
        &mut self,
        write_data: &[u8],
        read_buffer: &mut [u8],
    ) -> Result<(), SpiBridgeError> {
        self.cs.set_low().map_err(|_| SpiBridgeError::ChipSelect)?;

        let result = self.exchange(write_data, read_buffer);

        // Deassert CS on error too
        self.cs.set_high().map_err(|_| SpiBridgeError::ChipSelect)?;
        result
    }

    fn exchange(&mut self, write_data: &[u8], read_buffer: &mut [u8]) -> Result<(), SpiBridgeError> {
        if !write_data.is_empty() {
            self.spi
                .write(write_data)
                .map_err(|_| SpiBridgeError::Transfer)?;
        }
        if !read_buffer.is_empty() {
            read_buffer.fill(0xFF);
            self.spi
                .transfer(read_buffer)
                .map_err(|_| SpiBridgeError::Transfer)?;
        }
        Ok(())
    }

    fn instruction(&mut self, opcode: u8) -> Result<(), SpiBridgeError> {
        self.transfer_with_cs(&[opcode], &mut [])
    }

    fn addressed(opcode: u8, addr: u32) -> [u8; 5] {
        let [a3, a2, a1, a0] = addr.to_be_bytes();
        [opcode, a3, a2, a1, a0]
    }
}

impl<SPI, CS> DetectorBus for SpiBridge<SPI, CS>
where
    SPI: Transfer<u8> + Write<u8>,
    CS: OutputPin,
{
    type Error = SpiBridgeError;

    fn open(&mut self) -> Result<(), Self::Error> {
        self.cs.set_high().map_err(|_| SpiBridgeError::ChipSelect)
    }

    fn close(&mut self) -> Result<(), Self::Error> {
        self.cs.set_high().map_err(|_| SpiBridgeError::ChipSelect)
    }

    fn read_word(&mut self, addr: u32) -> Result<u16, Self::Error> {
        let mut header = [0u8; 5 + READ_DUMMY_BYTES];
        header[..5].copy_from_slice(&Self::addressed(instr::READ_WORD, addr));
        let mut data = [0u8; 2];
        self.transfer_with_cs(&header, &mut data)?;
        Ok(u16::from_be_bytes(data))
    }

    fn write_word(&mut self, addr: u32, data: u16) -> Result<(), Self::Error> {
        let mut frame = [0u8; 7];
        frame[..5].copy_from_slice(&Self::addressed(instr::WRITE_WORD, addr));
        frame[5..].copy_from_slice(&data.to_be_bytes());
        self.transfer_with_cs(&frame, &mut [])
    }

    fn write_command_word(&mut self, addr: u32, data: u16) -> Result<(), Self::Error> {
        if addr & CFG_ADDRESS_BIT != 0 {
            log::trace!("cfg write {:#010x} <- {:#06x}", addr, data);
        }
        self.write_word(addr, data)
    }

    /// The bridge takes program data little-endian, unlike plain writes.
    fn program_word(&mut self, addr: u32, data: u16) -> Result<(), Self::Error> {
        let mut frame = [0u8; 7];
        frame[..5].copy_from_slice(&Self::addressed(instr::PROGRAM_WORD, addr));
        frame[5..].copy_from_slice(&data.to_le_bytes());
        self.transfer_with_cs(&frame, &mut [])
    }

    fn erase_sector(&mut self, addr: u32) -> Result<(), Self::Error> {
        self.transfer_with_cs(&Self::addressed(instr::ERASE_SECTOR, addr), &mut [])
    }

    fn erase_chip(&mut self) -> Result<(), Self::Error> {
        self.instruction(instr::ERASE_CHIP)
    }

    fn enter_scan(&mut self) -> Result<(), Self::Error> {
        self.instruction(instr::ENTER_SCAN)
    }

    fn exit_scan(&mut self) -> Result<(), Self::Error> {
        self.instruction(instr::EXIT_SCAN)
    }

    fn enter_cfg_bypass(&mut self) -> Result<(), Self::Error> {
        self.instruction(instr::ENTER_CFG_BYPASS)
    }

    fn exit_cfg_bypass(&mut self) -> Result<(), Self::Error> {
        self.instruction(instr::EXIT_CFG_BYPASS)
    }
}

/// Lets two drivers with their own chip selects share one SPI peripheral.
pub struct SharedSpi<'a, SPI>(&'a RefCell<SPI>);

impl<'a, SPI> SharedSpi<'a, SPI> {
    pub fn new(spi: &'a RefCell<SPI>) -> Self {
        Self(spi)
    }
}

impl<'a, SPI: Write<u8>> Write<u8> for SharedSpi<'a, SPI> {
    type Error = SPI::Error;

    fn write(&mut self, words: &[u8]) -> Result<(), Self::Error> {
        self.0.borrow_mut().write(words)
    }
}

impl<'a, SPI: Transfer<u8>> Transfer<u8> for SharedSpi<'a, SPI> {
    type Error = SPI::Error;

    fn transfer<'w>(&mut self, words: &'w mut [u8]) -> Result<&'w [u8], Self::Error> {
        self.0.borrow_mut().transfer(words)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimPin, SimSpi};

    #[test]
    fn read_word_is_big_endian() {
        let mut spi = SimSpi::new();
        spi.respond(&[0x12, 0x34]);
        let mut bridge = SpiBridge::new(spi, SimPin::new(true));

        assert_eq!(bridge.read_word(0x0001_FE00), Ok(0x1234));
        let (spi, cs) = bridge.release();
        assert_eq!(
            spi.written(),
            &[0x0B, 0x00, 0x01, 0xFE, 0x00, 0, 0, 0, 0xFF, 0xFF]
        );
        assert!(cs.is_set_high());
    }

    #[test]
    fn write_and_program_byte_order() {
        let mut bridge = SpiBridge::new(SimSpi::new(), SimPin::new(true));
        bridge.write_word(0x10, 0x0012).unwrap();
        bridge.program_word(0x20, 0xABCD).unwrap();

        let (spi, _) = bridge.release();
        assert_eq!(
            spi.written(),
            &[
                0xF8, 0, 0, 0, 0x10, 0x00, 0x12, //
                0xF2, 0, 0, 0, 0x20, 0xCD, 0xAB,
            ]
        );
    }

    #[test]
    fn block_ops_use_word_loops() {
        let mut spi = SimSpi::new();
        spi.respond(&[0, 1, 0, 2]);
        let mut bridge = SpiBridge::new(spi, SimPin::new(true));
        let mut out = [0u16; 2];
        bridge.read_block(0x100, &mut out).unwrap();
        assert_eq!(out, [1, 2]);
    }

    #[test]
    fn cs_released_on_error() {
        let mut spi = SimSpi::new();
        spi.fail(true);
        let mut bridge = SpiBridge::new(spi, SimPin::new(true));
        assert_eq!(bridge.erase_chip(), Err(SpiBridgeError::Transfer));
        let (_, cs) = bridge.release();
        assert!(cs.is_set_high());
    }

    #[test]
    fn shared_bus() {
        let bus = RefCell::new(SimSpi::new());
        {
            let mut a = SpiBridge::new(SharedSpi::new(&bus), SimPin::new(true));
            a.enter_scan().unwrap();
            let mut b = SpiBridge::new(SharedSpi::new(&bus), SimPin::new(true));
            b.exit_cfg_bypass().unwrap();
        }
        assert_eq!(bus.borrow().written(), &[0xFB, 0xE9]);
    }
}
