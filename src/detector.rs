//! Storage access to the detector under test.
//!
//! Backends implement the few primitives the hardware really has; block and
//! buffer operations default to word loops.

use crate::address::WordAddress;
use crate::constants::{PAGE_WORDS, PROGRAM_CHUNK_WORDS, SECTOR_WORDS};
use core::fmt::Debug;

pub trait DetectorBus {
    type Error: Debug;

    fn open(&mut self) -> Result<(), Self::Error>;
    fn close(&mut self) -> Result<(), Self::Error>;

    fn read_word(&mut self, addr: u32) -> Result<u16, Self::Error>;

    fn read_words(&mut self, addr: u32, out: &mut [u16]) -> Result<(), Self::Error> {
        for (i, word) in out.iter_mut().enumerate() {
            *word = self.read_word(addr.wrapping_add(i as u32))?;
        }
        Ok(())
    }

    /// Fast bulk read. Not reliable in the last 512 words of a sector, use
    /// [`read_range`] for arbitrary ranges.
    fn read_block(&mut self, addr: u32, out: &mut [u16]) -> Result<(), Self::Error> {
        self.read_words(addr, out)
    }

    fn read_page(&mut self, addr: u32, out: &mut [u16; PAGE_WORDS]) -> Result<(), Self::Error> {
        self.read_words(addr, out)
    }

    fn write_word(&mut self, addr: u32, data: u16) -> Result<(), Self::Error>;

    fn write_words(&mut self, addr: u32, data: &[u16]) -> Result<(), Self::Error> {
        for (i, word) in data.iter().enumerate() {
            self.write_word(addr.wrapping_add(i as u32), *word)?;
        }
        Ok(())
    }

    fn write_block(&mut self, addr: u32, data: &[u16]) -> Result<(), Self::Error> {
        self.write_words(addr, data)
    }

    /// Command cycle write; same as a data write unless the backend needs
    /// different bus timing for command cycles.
    fn write_command_word(&mut self, addr: u32, data: u16) -> Result<(), Self::Error> {
        self.write_word(addr, data)
    }

    fn write_command_words(&mut self, addr: u32, data: &[u16]) -> Result<(), Self::Error> {
        for (i, word) in data.iter().enumerate() {
            self.write_command_word(addr.wrapping_add(i as u32), *word)?;
        }
        Ok(())
    }

    fn program_word(&mut self, addr: u32, data: u16) -> Result<(), Self::Error>;

    fn program_buffer(&mut self, addr: u32, data: &[u16]) -> Result<(), Self::Error> {
        for (i, word) in data.iter().enumerate() {
            self.program_word(addr.wrapping_add(i as u32), *word)?;
        }
        Ok(())
    }

    fn program_buffer_repeated(
        &mut self,
        addr: u32,
        value: u16,
        count: usize,
    ) -> Result<(), Self::Error> {
        for i in 0..count {
            self.program_word(addr.wrapping_add(i as u32), value)?;
        }
        Ok(())
    }

    fn erase_sector(&mut self, addr: u32) -> Result<(), Self::Error>;
    fn erase_chip(&mut self) -> Result<(), Self::Error>;

    fn enter_scan(&mut self) -> Result<(), Self::Error>;
    fn exit_scan(&mut self) -> Result<(), Self::Error>;

    fn enter_cfg_bypass(&mut self) -> Result<(), Self::Error>;
    fn exit_cfg_bypass(&mut self) -> Result<(), Self::Error>;
}

impl<T: DetectorBus + ?Sized> DetectorBus for &mut T {
    type Error = T::Error;

    fn open(&mut self) -> Result<(), Self::Error> {
        (**self).open()
    }
    fn close(&mut self) -> Result<(), Self::Error> {
        (**self).close()
    }
    fn read_word(&mut self, addr: u32) -> Result<u16, Self::Error> {
        (**self).read_word(addr)
    }
    fn read_words(&mut self, addr: u32, out: &mut [u16]) -> Result<(), Self::Error> {
        (**self).read_words(addr, out)
    }
    fn read_block(&mut self, addr: u32, out: &mut [u16]) -> Result<(), Self::Error> {
        (**self).read_block(addr, out)
    }
    fn read_page(&mut self, addr: u32, out: &mut [u16; PAGE_WORDS]) -> Result<(), Self::Error> {
        (**self).read_page(addr, out)
    }
    fn write_word(&mut self, addr: u32, data: u16) -> Result<(), Self::Error> {
        (**self).write_word(addr, data)
    }
    fn write_words(&mut self, addr: u32, data: &[u16]) -> Result<(), Self::Error> {
        (**self).write_words(addr, data)
    }
    fn write_block(&mut self, addr: u32, data: &[u16]) -> Result<(), Self::Error> {
        (**self).write_block(addr, data)
    }
    fn write_command_word(&mut self, addr: u32, data: u16) -> Result<(), Self::Error> {
        (**self).write_command_word(addr, data)
    }
    fn write_command_words(&mut self, addr: u32, data: &[u16]) -> Result<(), Self::Error> {
        (**self).write_command_words(addr, data)
    }
    fn program_word(&mut self, addr: u32, data: u16) -> Result<(), Self::Error> {
        (**self).program_word(addr, data)
    }
    fn program_buffer(&mut self, addr: u32, data: &[u16]) -> Result<(), Self::Error> {
        (**self).program_buffer(addr, data)
    }
    fn program_buffer_repeated(
        &mut self,
        addr: u32,
        value: u16,
        count: usize,
    ) -> Result<(), Self::Error> {
        (**self).program_buffer_repeated(addr, value, count)
    }
    fn erase_sector(&mut self, addr: u32) -> Result<(), Self::Error> {
        (**self).erase_sector(addr)
    }
    fn erase_chip(&mut self) -> Result<(), Self::Error> {
        (**self).erase_chip()
    }
    fn enter_scan(&mut self) -> Result<(), Self::Error> {
        (**self).enter_scan()
    }
    fn exit_scan(&mut self) -> Result<(), Self::Error> {
        (**self).exit_scan()
    }
    fn enter_cfg_bypass(&mut self) -> Result<(), Self::Error> {
        (**self).enter_cfg_bypass()
    }
    fn exit_cfg_bypass(&mut self) -> Result<(), Self::Error> {
        (**self).exit_cfg_bypass()
    }
}

/// Reads `out.len()` words starting at `addr`, block reading everything
/// except the last 512 words of each sector, which are read word by word.
pub fn read_range<B: DetectorBus + ?Sized>(
    bus: &mut B,
    addr: WordAddress,
    out: &mut [u16],
) -> Result<(), B::Error> {
    let mut addr = addr;
    let mut done = 0;

    while done < out.len() {
        let remaining = out.len() - done;
        let block = addr.words_to_quirk_zone() as usize;

        let n = if block > 0 {
            let n = block.min(remaining);
            bus.read_block(addr.0, &mut out[done..done + n])?;
            n
        } else {
            let n = (addr.words_to_sector_end() as usize).min(remaining);
            bus.read_words(addr.0, &mut out[done..done + n])?;
            n
        };

        done += n;
        addr = addr.offset(n as u32);
    }

    Ok(())
}

/// Programs every word of the sector starting at `sector` to `value`.
pub fn program_sector<B: DetectorBus + ?Sized>(
    bus: &mut B,
    sector: WordAddress,
    value: u16,
) -> Result<(), B::Error> {
    let base = sector.sector_base();
    for chunk in 0..(SECTOR_WORDS as usize / PROGRAM_CHUNK_WORDS) {
        let addr = base.offset((chunk * PROGRAM_CHUNK_WORDS) as u32);
        bus.program_buffer_repeated(addr.0, value, PROGRAM_CHUNK_WORDS)?;
    }
    Ok(())
}
