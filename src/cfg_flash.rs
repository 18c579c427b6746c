//! The FPGA configuration flash, a standard SPI NOR part.

use crate::constants::{CFG_FLASH_PAGE_SIZE, CFG_FLASH_POLL_LIMIT};
use embedded_hal::{
    blocking::spi::{Transfer, Write},
    digital::v2::OutputPin,
};
use snafu::Snafu;

#[derive(Snafu, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashError {
    #[snafu(display("Configuration flash SPI transfer failed"))]
    Bus,
    #[snafu(display("Configuration flash stayed busy"))]
    Timeout,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EraseKind {
    Sector4K,
    Block32K,
    Block64K,
    Chip,
}

impl EraseKind {
    pub fn from_u32(n: u32) -> Option<Self> {
        match n {
            0 => Some(EraseKind::Sector4K),
            1 => Some(EraseKind::Block32K),
            2 => Some(EraseKind::Block64K),
            3 => Some(EraseKind::Chip),
            _ => None,
        }
    }

    /// Bytes erased, `None` for the whole chip.
    pub fn size(self) -> Option<usize> {
        match self {
            EraseKind::Sector4K => Some(4 * 1024),
            EraseKind::Block32K => Some(32 * 1024),
            EraseKind::Block64K => Some(64 * 1024),
            EraseKind::Chip => None,
        }
    }

    fn opcode(self) -> u8 {
        match self {
            EraseKind::Sector4K => 0x20,
            EraseKind::Block32K => 0x52,
            EraseKind::Block64K => 0xD8,
            EraseKind::Chip => 0x60,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeviceInfo {
    pub manufacturer: u8,
    pub device: u8,
    pub jedec_type: u8,
    pub jedec_capacity: u8,
    pub unique_id: [u8; 4],
    /// Status registers 1 to 3.
    pub status: [u8; 3],
}

pub trait ConfigFlash {
    fn power_down(&mut self) -> Result<(), FlashError>;
    fn release_power_down(&mut self) -> Result<(), FlashError>;
    fn read(&mut self, addr: u32, buf: &mut [u8]) -> Result<(), FlashError>;
    /// Programs `data`, splitting at page boundaries. The range must be erased.
    fn write(&mut self, addr: u32, data: &[u8]) -> Result<(), FlashError>;
    fn erase(&mut self, kind: EraseKind, addr: u32) -> Result<(), FlashError>;
    fn device_info(&mut self) -> Result<DeviceInfo, FlashError>;
}

impl<T: ConfigFlash + ?Sized> ConfigFlash for &mut T {
    fn power_down(&mut self) -> Result<(), FlashError> {
        (**self).power_down()
    }
    fn release_power_down(&mut self) -> Result<(), FlashError> {
        (**self).release_power_down()
    }
    fn read(&mut self, addr: u32, buf: &mut [u8]) -> Result<(), FlashError> {
        (**self).read(addr, buf)
    }
    fn write(&mut self, addr: u32, data: &[u8]) -> Result<(), FlashError> {
        (**self).write(addr, data)
    }
    fn erase(&mut self, kind: EraseKind, addr: u32) -> Result<(), FlashError> {
        (**self).erase(kind, addr)
    }
    fn device_info(&mut self) -> Result<DeviceInfo, FlashError> {
        (**self).device_info()
    }
}

mod cmd {
    pub const WRITE_ENABLE: u8 = 0x06;
    pub const READ: u8 = 0x03;
    pub const PAGE_PROGRAM: u8 = 0x02;
    pub const READ_STATUS1: u8 = 0x05;
    pub const READ_STATUS2: u8 = 0x35;
    pub const READ_STATUS3: u8 = 0x15;
    pub const POWER_DOWN: u8 = 0xB9;
    pub const RELEASE_POWER_DOWN: u8 = 0xAB;
    pub const MANUFACTURER_ID: u8 = 0x90;
    pub const JEDEC_ID: u8 = 0x9F;
    pub const UNIQUE_ID: u8 = 0x4B;
}

const STATUS_BUSY: u8 = 0x01;

pub struct SpiNorFlash<SPI, CS> {
    spi: SPI,
    cs: CS,
    poll_limit: u32,
}

impl<SPI, CS> SpiNorFlash<SPI, CS>
where
    SPI: Transfer<u8> + Write<u8>,
    CS: OutputPin,
{
    pub fn new(spi: SPI, cs: CS) -> Self {
        Self {
            spi,
            cs,
            poll_limit: CFG_FLASH_POLL_LIMIT,
        }
    }

    pub fn with_poll_limit(mut self, poll_limit: u32) -> Self {
        self.poll_limit = poll_limit;
        self
    }

    pub fn release(self) -> (SPI, CS) {
        (self.spi, self.cs)
    }

    /// Performs an SPI transaction with CS control: write then read
    fn transfer_with_cs(&mut self, write_data: &[u8], read_buffer: &mut [u8]) -> Result<(), FlashError> {
        self.cs.set_low().map_err(|_| FlashError::Bus)?;

        let result = self.exchange(write_data, read_buffer);

        // Deassert CS even if the transfer failed
        self.cs.set_high().map_err(|_| FlashError::Bus)?;
        result
    }

    fn exchange(&mut self, write_data: &[u8], read_buffer: &mut [u8]) -> Result<(), FlashError> {
        if !write_data.is_empty() {
            self.spi.write(write_data).map_err(|_| FlashError::Bus)?;
        }
        if !read_buffer.is_empty() {
            read_buffer.fill(0xFF);
            self.spi.transfer(read_buffer).map_err(|_| FlashError::Bus)?;
        }
        Ok(())
    }

    /// Sends a header and a data phase inside one CS window.
    fn write_with_cs(&mut self, header: &[u8], data: &[u8]) -> Result<(), FlashError> {
        self.cs.set_low().map_err(|_| FlashError::Bus)?;
        let result = self
            .spi
            .write(header)
            .and_then(|_| self.spi.write(data))
            .map_err(|_| FlashError::Bus);
        self.cs.set_high().map_err(|_| FlashError::Bus)?;
        result
    }

    fn command(&mut self, opcode: u8) -> Result<(), FlashError> {
        self.transfer_with_cs(&[opcode], &mut [])
    }

    fn status(&mut self, opcode: u8) -> Result<u8, FlashError> {
        let mut status = [0u8; 1];
        self.transfer_with_cs(&[opcode], &mut status)?;
        Ok(status[0])
    }

    fn wait_ready(&mut self) -> Result<(), FlashError> {
        for _ in 0..self.poll_limit {
            if self.status(cmd::READ_STATUS1)? & STATUS_BUSY == 0 {
                return Ok(());
            }
        }
        Err(FlashError::Timeout)
    }

    fn addressed(opcode: u8, addr: u32) -> [u8; 4] {
        let [_, a2, a1, a0] = addr.to_be_bytes();
        [opcode, a2, a1, a0]
    }
}

impl<SPI, CS> ConfigFlash for SpiNorFlash<SPI, CS>
where
    SPI: Transfer<u8> + Write<u8>,
    CS: OutputPin,
{
    fn power_down(&mut self) -> Result<(), FlashError> {
        self.command(cmd::POWER_DOWN)
    }

    fn release_power_down(&mut self) -> Result<(), FlashError> {
        self.command(cmd::RELEASE_POWER_DOWN)
    }

    fn read(&mut self, addr: u32, buf: &mut [u8]) -> Result<(), FlashError> {
        self.transfer_with_cs(&Self::addressed(cmd::READ, addr), buf)
    }

    fn write(&mut self, addr: u32, data: &[u8]) -> Result<(), FlashError> {
        let mut addr = addr;
        let mut data = data;
        while !data.is_empty() {
            let room = CFG_FLASH_PAGE_SIZE - addr as usize % CFG_FLASH_PAGE_SIZE;
            let (page, rest) = data.split_at(room.min(data.len()));

            self.command(cmd::WRITE_ENABLE)?;
            self.write_with_cs(&Self::addressed(cmd::PAGE_PROGRAM, addr), page)?;
            self.wait_ready()?;

            addr = addr.wrapping_add(page.len() as u32);
            data = rest;
        }
        Ok(())
    }

    fn erase(&mut self, kind: EraseKind, addr: u32) -> Result<(), FlashError> {
        self.command(cmd::WRITE_ENABLE)?;
        match kind {
            EraseKind::Chip => self.command(kind.opcode())?,
            _ => self.transfer_with_cs(&Self::addressed(kind.opcode(), addr), &mut [])?,
        }
        self.wait_ready()
    }

    fn device_info(&mut self) -> Result<DeviceInfo, FlashError> {
        let mut ids = [0u8; 2];
        self.transfer_with_cs(&[cmd::MANUFACTURER_ID, 0, 0, 0], &mut ids)?;

        let mut jedec = [0u8; 3];
        self.transfer_with_cs(&[cmd::JEDEC_ID], &mut jedec)?;

        let mut unique_id = [0u8; 4];
        self.transfer_with_cs(&[cmd::UNIQUE_ID, 0, 0, 0, 0], &mut unique_id)?;

        let status = [
            self.status(cmd::READ_STATUS1)?,
            self.status(cmd::READ_STATUS2)?,
            self.status(cmd::READ_STATUS3)?,
        ];

        Ok(DeviceInfo {
            manufacturer: ids[0],
            device: ids[1],
            jedec_type: jedec[1],
            jedec_capacity: jedec[2],
            unique_id,
            status,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimPin, SimSpi};

    fn flash() -> SpiNorFlash<SimSpi, SimPin> {
        SpiNorFlash::new(SimSpi::new(), SimPin::new(true))
    }

    #[test]
    fn read_sends_address() {
        let mut flash = flash();
        let mut buf = [0u8; 3];
        flash.read(0x01_2345, &mut buf).unwrap();

        let (spi, cs) = flash.release();
        assert_eq!(spi.written(), &[0x03, 0x01, 0x23, 0x45, 0xFF, 0xFF, 0xFF]);
        assert!(cs.is_set_high());
        assert_eq!(cs.edges(), 2);
    }

    #[test]
    fn write_splits_pages() {
        let mut flash = flash();
        let data = [0xA5u8; 300];
        flash.write(0x00F0, &data).unwrap();

        let (spi, _) = flash.release();
        let w = spi.written();
        // wren, program header + 16 bytes, status poll
        assert_eq!(&w[..5], &[0x06, 0x02, 0x00, 0x00, 0xF0]);
        let second = 1 + 4 + 16 + 2;
        assert_eq!(&w[second..second + 5], &[0x06, 0x02, 0x00, 0x01, 0x00]);
        // 16 + 256 + 28 bytes
        assert_eq!(w.len(), 3 * (1 + 4 + 2) + 300);
    }

    #[test]
    fn write_at_top_of_address_space_wraps() {
        let mut flash = flash();
        flash.write(0xFFFF_FFF0, &[0x11; 32]).unwrap();

        let (spi, _) = flash.release();
        let w = spi.written();
        assert_eq!(&w[..5], &[0x06, 0x02, 0xFF, 0xFF, 0xF0]);
        let second = 1 + 4 + 16 + 2;
        assert_eq!(&w[second..second + 5], &[0x06, 0x02, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn busy_flash_times_out() {
        let mut spi = SimSpi::new();
        spi.set_idle(STATUS_BUSY);
        let mut flash = SpiNorFlash::new(spi, SimPin::new(true)).with_poll_limit(5);
        assert_eq!(flash.erase(EraseKind::Sector4K, 0x1000), Err(FlashError::Timeout));
    }

    #[test]
    fn chip_erase_has_no_address() {
        let mut flash = flash();
        flash.erase(EraseKind::Chip, 0x1234).unwrap();
        let (spi, _) = flash.release();
        assert_eq!(spi.written(), &[0x06, 0x60, 0x05, 0xFF]);
    }

    #[test]
    fn device_info() {
        let mut spi = SimSpi::new();
        spi.respond(&[0xEF, 0x13, 0xEF, 0x40, 0x14, 1, 2, 3, 4, 0x00, 0x02, 0x60]);
        let mut flash = SpiNorFlash::new(spi, SimPin::new(true));
        assert_eq!(
            flash.device_info(),
            Ok(DeviceInfo {
                manufacturer: 0xEF,
                device: 0x13,
                jedec_type: 0x40,
                jedec_capacity: 0x14,
                unique_id: [1, 2, 3, 4],
                status: [0x00, 0x02, 0x60],
            })
        );
    }

    #[test]
    fn erase_kinds() {
        assert_eq!(EraseKind::from_u32(1), Some(EraseKind::Block32K));
        assert_eq!(EraseKind::from_u32(4), None);
        assert_eq!(EraseKind::Block64K.size(), Some(0x1_0000));
        assert_eq!(EraseKind::Chip.size(), None);
    }
}
