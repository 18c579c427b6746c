//! In-memory stand-ins for the board: detector storage, DAC, pins, delay,
//! clock, SPI bus, configuration flash, calibration blocks and serial port.
//!
//! The detector model reproduces the block-read quirk so range reads can be
//! checked against word-by-word reads.

use crate::analog::{AnalogError, AnalogOutput};
use crate::cfg_flash::{ConfigFlash, DeviceInfo, EraseKind, FlashError};
use crate::constants::{CFG_ADDRESS_BIT, QUIRK_OFFSET, SECTOR_WORDS};
use crate::detector::DetectorBus;
use crate::engine::Uptime;
use crate::nvconfig::{BlockStorage, RECORD_SIZE};
use core::convert::Infallible;
use embedded_hal::{
    blocking::{
        delay::DelayUs,
        spi::{Transfer, Write},
    },
    digital::v2::{InputPin, OutputPin},
    serial,
};
use heapless::{Deque, Vec};

/// Words backed by memory; everything above reads as erased.
pub const SIM_WORDS: usize = 2 * SECTOR_WORDS as usize;
const CFG_REGISTERS: usize = 16;
const CALL_LOG: usize = 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BusCall {
    Open,
    Close,
    ReadBlock(u32, usize),
    ReadWords(u32, usize),
    WriteWord(u32, u16),
    CommandWord(u32, u16),
    ProgramBuffer(u32, usize),
    EraseSector(u32),
    EraseChip,
    EnterScan,
    ExitScan,
    EnterCfgBypass,
    ExitCfgBypass,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SimBusError;

/// Detector model. Programming clears bits, erasing sets them.
pub struct SimDetector {
    memory: [u16; SIM_WORDS],
    cfg: [u16; CFG_REGISTERS],
    calls: Vec<BusCall, CALL_LOG>,
    repeated_programs: u32,
    last_repeated: Option<(u32, u16)>,
    in_scan: bool,
    cfg_bypass: bool,
    failing: bool,
}

impl Default for SimDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl SimDetector {
    pub fn new() -> Self {
        Self {
            memory: [0xFFFF; SIM_WORDS],
            cfg: [0; CFG_REGISTERS],
            calls: Vec::new(),
            repeated_programs: 0,
            last_repeated: None,
            in_scan: false,
            cfg_bypass: false,
            failing: false,
        }
    }

    pub fn fill_with(&mut self, f: impl Fn(u32) -> u16) {
        for (addr, word) in self.memory.iter_mut().enumerate() {
            *word = f(addr as u32);
        }
    }

    pub fn peek(&self, addr: u32) -> u16 {
        self.memory.get(addr as usize).copied().unwrap_or(0xFFFF)
    }

    pub fn cfg_register(&self, index: usize) -> u16 {
        self.cfg[index % CFG_REGISTERS]
    }

    pub fn set_cfg_register(&mut self, index: usize, value: u16) {
        self.cfg[index % CFG_REGISTERS] = value;
    }

    /// Logged calls, oldest first. Word reads and repeated programs are only
    /// counted.
    pub fn calls(&self) -> &[BusCall] {
        &self.calls
    }

    pub fn clear_calls(&mut self) {
        self.calls.clear();
    }

    pub fn repeated_programs(&self) -> u32 {
        self.repeated_programs
    }

    pub fn last_repeated(&self) -> Option<(u32, u16)> {
        self.last_repeated
    }

    pub fn in_scan(&self) -> bool {
        self.in_scan
    }

    pub fn in_cfg_bypass(&self) -> bool {
        self.cfg_bypass
    }

    /// Makes every following operation fail.
    pub fn set_failing(&mut self, failing: bool) {
        self.failing = failing;
    }

    fn log(&mut self, call: BusCall) -> Result<(), SimBusError> {
        if self.failing {
            return Err(SimBusError);
        }
        let _ = self.calls.push(call);
        Ok(())
    }

    fn check(&self) -> Result<(), SimBusError> {
        if self.failing {
            Err(SimBusError)
        } else {
            Ok(())
        }
    }

    fn program(&mut self, addr: u32, value: u16) {
        if let Some(word) = self.memory.get_mut(addr as usize) {
            *word &= value;
        }
    }
}

impl DetectorBus for SimDetector {
    type Error = SimBusError;

    fn open(&mut self) -> Result<(), Self::Error> {
        self.log(BusCall::Open)
    }

    fn close(&mut self) -> Result<(), Self::Error> {
        self.log(BusCall::Close)
    }

    fn read_word(&mut self, addr: u32) -> Result<u16, Self::Error> {
        self.check()?;
        if addr & CFG_ADDRESS_BIT != 0 {
            return Ok(self.cfg[(addr & !CFG_ADDRESS_BIT) as usize % CFG_REGISTERS]);
        }
        Ok(self.peek(addr))
    }

    fn read_words(&mut self, addr: u32, out: &mut [u16]) -> Result<(), Self::Error> {
        self.log(BusCall::ReadWords(addr, out.len()))?;
        for (i, word) in out.iter_mut().enumerate() {
            *word = self.peek(addr + i as u32);
        }
        Ok(())
    }

    /// Words in the quirk zone come back inverted.
    fn read_block(&mut self, addr: u32, out: &mut [u16]) -> Result<(), Self::Error> {
        self.log(BusCall::ReadBlock(addr, out.len()))?;
        for (i, word) in out.iter_mut().enumerate() {
            let a = addr + i as u32;
            *word = if a % SECTOR_WORDS >= QUIRK_OFFSET {
                !self.peek(a)
            } else {
                self.peek(a)
            };
        }
        Ok(())
    }

    fn write_word(&mut self, addr: u32, data: u16) -> Result<(), Self::Error> {
        self.log(BusCall::WriteWord(addr, data))
    }

    fn write_command_word(&mut self, addr: u32, data: u16) -> Result<(), Self::Error> {
        self.log(BusCall::CommandWord(addr, data))?;
        if addr & CFG_ADDRESS_BIT != 0 {
            self.cfg[(addr & !CFG_ADDRESS_BIT) as usize % CFG_REGISTERS] = data;
        }
        Ok(())
    }

    fn program_word(&mut self, addr: u32, data: u16) -> Result<(), Self::Error> {
        self.check()?;
        self.program(addr, data);
        Ok(())
    }

    fn program_buffer(&mut self, addr: u32, data: &[u16]) -> Result<(), Self::Error> {
        self.log(BusCall::ProgramBuffer(addr, data.len()))?;
        for (i, word) in data.iter().enumerate() {
            self.program(addr + i as u32, *word);
        }
        Ok(())
    }

    fn program_buffer_repeated(
        &mut self,
        addr: u32,
        value: u16,
        count: usize,
    ) -> Result<(), Self::Error> {
        self.check()?;
        self.repeated_programs += 1;
        self.last_repeated = Some((addr, value));
        if (addr as usize) < SIM_WORDS {
            for i in 0..count {
                self.program(addr + i as u32, value);
            }
        }
        Ok(())
    }

    fn erase_sector(&mut self, addr: u32) -> Result<(), Self::Error> {
        self.log(BusCall::EraseSector(addr))?;
        let base = (addr - addr % SECTOR_WORDS) as usize;
        if base < SIM_WORDS {
            self.memory[base..base + SECTOR_WORDS as usize].fill(0xFFFF);
        }
        Ok(())
    }

    fn erase_chip(&mut self) -> Result<(), Self::Error> {
        self.log(BusCall::EraseChip)?;
        self.memory.fill(0xFFFF);
        Ok(())
    }

    fn enter_scan(&mut self) -> Result<(), Self::Error> {
        self.log(BusCall::EnterScan)?;
        self.in_scan = true;
        Ok(())
    }

    fn exit_scan(&mut self) -> Result<(), Self::Error> {
        self.log(BusCall::ExitScan)?;
        self.in_scan = false;
        Ok(())
    }

    fn enter_cfg_bypass(&mut self) -> Result<(), Self::Error> {
        self.log(BusCall::EnterCfgBypass)?;
        self.cfg_bypass = true;
        Ok(())
    }

    fn exit_cfg_bypass(&mut self) -> Result<(), Self::Error> {
        self.log(BusCall::ExitCfgBypass)?;
        self.cfg_bypass = false;
        Ok(())
    }
}

/// DAC that remembers what it was asked to output.
#[derive(Debug, Default)]
pub struct SimDac {
    outputs: [Option<u32>; 2],
    writes: usize,
    history: Vec<(u8, u32), CALL_LOG>,
    fail_at: Option<(usize, AnalogError)>,
}

impl SimDac {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn output(&self, channel: u8) -> Option<u32> {
        self.outputs.get(channel as usize).copied().flatten()
    }

    pub fn writes(&self) -> usize {
        self.writes
    }

    pub fn history(&self) -> &[(u8, u32)] {
        &self.history
    }

    pub fn clear_history(&mut self) {
        self.history.clear();
    }

    /// Fails the write with the given index (counting from the next write).
    pub fn fail_at(&mut self, index: usize, error: AnalogError) {
        self.fail_at = Some((self.writes + index, error));
    }

    pub fn clear_failure(&mut self) {
        self.fail_at = None;
    }
}

impl AnalogOutput for SimDac {
    fn set_output(&mut self, channel: u8, counts: u32) -> Result<(), AnalogError> {
        let index = self.writes;
        self.writes += 1;
        if let Some((at, error)) = self.fail_at {
            if at == index {
                return Err(error);
            }
        }
        let slot = self
            .outputs
            .get_mut(channel as usize)
            .ok_or(AnalogError::InvalidChannel)?;
        *slot = Some(counts);
        let _ = self.history.push((channel, counts));
        Ok(())
    }
}

/// Output pin that records its level.
#[derive(Debug, Default)]
pub struct SimPin {
    high: bool,
    edges: u32,
}

impl SimPin {
    pub fn new(high: bool) -> Self {
        Self { high, edges: 0 }
    }

    pub fn is_set_high(&self) -> bool {
        self.high
    }

    pub fn edges(&self) -> u32 {
        self.edges
    }

    fn set(&mut self, high: bool) {
        if self.high != high {
            self.edges += 1;
        }
        self.high = high;
    }
}

impl OutputPin for SimPin {
    type Error = Infallible;

    fn set_low(&mut self) -> Result<(), Self::Error> {
        self.set(false);
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        self.set(true);
        Ok(())
    }
}

/// Input pin with a fixed level.
#[derive(Debug, Default)]
pub struct SimInput {
    high: bool,
}

impl SimInput {
    pub fn new(high: bool) -> Self {
        Self { high }
    }

    pub fn set(&mut self, high: bool) {
        self.high = high;
    }
}

impl InputPin for SimInput {
    type Error = Infallible;

    fn is_high(&self) -> Result<bool, Self::Error> {
        Ok(self.high)
    }

    fn is_low(&self) -> Result<bool, Self::Error> {
        Ok(!self.high)
    }
}

/// Delay that only adds up the requested time.
#[derive(Debug, Default)]
pub struct SimDelay {
    total_us: u64,
    calls: u32,
}

impl SimDelay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn total_us(&self) -> u64 {
        self.total_us
    }

    pub fn calls(&self) -> u32 {
        self.calls
    }
}

impl DelayUs<u32> for SimDelay {
    fn delay_us(&mut self, us: u32) {
        self.total_us += us as u64;
        self.calls += 1;
    }
}

#[derive(Debug, Default)]
pub struct SimClock {
    pub now_ms: u64,
}

impl SimClock {
    pub fn new(now_ms: u64) -> Self {
        Self { now_ms }
    }
}

impl Uptime for SimClock {
    fn uptime_ms(&mut self) -> u64 {
        self.now_ms
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SimSpiError;

/// SPI bus that records outgoing bytes and answers from a queue.
pub struct SimSpi {
    written: Vec<u8, 4096>,
    responses: Deque<u8, 4096>,
    idle: u8,
    failing: bool,
}

impl Default for SimSpi {
    fn default() -> Self {
        Self::new()
    }
}

impl SimSpi {
    pub fn new() -> Self {
        Self {
            written: Vec::new(),
            responses: Deque::new(),
            idle: 0,
            failing: false,
        }
    }

    /// Byte clocked in when the response queue is empty.
    pub fn set_idle(&mut self, idle: u8) {
        self.idle = idle;
    }

    pub fn respond(&mut self, bytes: &[u8]) {
        for byte in bytes {
            let _ = self.responses.push_back(*byte);
        }
    }

    pub fn written(&self) -> &[u8] {
        &self.written
    }

    pub fn clear_written(&mut self) {
        self.written.clear();
    }

    pub fn fail(&mut self, failing: bool) {
        self.failing = failing;
    }
}

impl Write<u8> for SimSpi {
    type Error = SimSpiError;

    fn write(&mut self, words: &[u8]) -> Result<(), Self::Error> {
        if self.failing {
            return Err(SimSpiError);
        }
        for word in words {
            let _ = self.written.push(*word);
        }
        Ok(())
    }
}

impl Transfer<u8> for SimSpi {
    type Error = SimSpiError;

    fn transfer<'w>(&mut self, words: &'w mut [u8]) -> Result<&'w [u8], Self::Error> {
        if self.failing {
            return Err(SimSpiError);
        }
        for word in words.iter_mut() {
            let _ = self.written.push(*word);
            *word = self.responses.pop_front().unwrap_or(self.idle);
        }
        Ok(words)
    }
}

const SIM_FLASH_SIZE: usize = 0x1_0000;

/// Configuration flash model: 64 KiB, NOR semantics.
pub struct SimConfigFlash {
    memory: [u8; SIM_FLASH_SIZE],
    powered_down: bool,
    wakeups: u32,
    failure: Option<FlashError>,
    info: DeviceInfo,
}

impl Default for SimConfigFlash {
    fn default() -> Self {
        Self::new()
    }
}

impl SimConfigFlash {
    pub fn new() -> Self {
        Self {
            memory: [0xFF; SIM_FLASH_SIZE],
            powered_down: true,
            wakeups: 0,
            failure: None,
            info: DeviceInfo {
                manufacturer: 0xEF,
                device: 0x13,
                jedec_type: 0x40,
                jedec_capacity: 0x14,
                unique_id: [0xD1, 0x02, 0x03, 0x04],
                status: [0, 0x02, 0x60],
            },
        }
    }

    pub fn contents(&self) -> &[u8] {
        &self.memory
    }

    pub fn is_powered_down(&self) -> bool {
        self.powered_down
    }

    pub fn wakeups(&self) -> u32 {
        self.wakeups
    }

    pub fn set_failure(&mut self, failure: Option<FlashError>) {
        self.failure = failure;
    }

    fn ready(&self) -> Result<(), FlashError> {
        match self.failure {
            Some(error) => Err(error),
            None if self.powered_down => Err(FlashError::Bus),
            None => Ok(()),
        }
    }

    fn range(addr: u32, len: usize) -> core::ops::Range<usize> {
        let start = (addr as usize).min(SIM_FLASH_SIZE);
        start..(start + len).min(SIM_FLASH_SIZE)
    }
}

impl ConfigFlash for SimConfigFlash {
    fn power_down(&mut self) -> Result<(), FlashError> {
        self.powered_down = true;
        Ok(())
    }

    fn release_power_down(&mut self) -> Result<(), FlashError> {
        self.powered_down = false;
        self.wakeups += 1;
        Ok(())
    }

    fn read(&mut self, addr: u32, buf: &mut [u8]) -> Result<(), FlashError> {
        self.ready()?;
        buf.fill(0xFF);
        let range = Self::range(addr, buf.len());
        let n = range.len();
        buf[..n].copy_from_slice(&self.memory[range]);
        Ok(())
    }

    fn write(&mut self, addr: u32, data: &[u8]) -> Result<(), FlashError> {
        self.ready()?;
        let range = Self::range(addr, data.len());
        for (cell, byte) in self.memory[range].iter_mut().zip(data) {
            *cell &= *byte;
        }
        Ok(())
    }

    fn erase(&mut self, kind: EraseKind, addr: u32) -> Result<(), FlashError> {
        self.ready()?;
        let range = match kind.size() {
            Some(size) => Self::range(addr - addr % size as u32, size),
            None => 0..SIM_FLASH_SIZE,
        };
        self.memory[range].fill(0xFF);
        Ok(())
    }

    fn device_info(&mut self) -> Result<DeviceInfo, FlashError> {
        self.ready()?;
        Ok(self.info)
    }
}

/// Two calibration blocks.
#[derive(Debug)]
pub struct SimBlockStorage {
    blocks: [[u8; RECORD_SIZE]; 2],
    writes: [u32; 2],
    failing: bool,
}

impl Default for SimBlockStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl SimBlockStorage {
    pub fn new() -> Self {
        Self {
            blocks: [[0xFF; RECORD_SIZE]; 2],
            writes: [0; 2],
            failing: false,
        }
    }

    pub fn block(&self, index: usize) -> &[u8; RECORD_SIZE] {
        &self.blocks[index]
    }

    pub fn block_mut(&mut self, index: usize) -> &mut [u8; RECORD_SIZE] {
        &mut self.blocks[index]
    }

    pub fn writes(&self, index: usize) -> u32 {
        self.writes[index]
    }

    pub fn set_failing(&mut self, failing: bool) {
        self.failing = failing;
    }
}

impl BlockStorage for SimBlockStorage {
    type Error = SimBusError;

    fn read_block(&mut self, index: usize, buf: &mut [u8; RECORD_SIZE]) -> Result<(), Self::Error> {
        if self.failing {
            return Err(SimBusError);
        }
        *buf = *self.blocks.get(index).ok_or(SimBusError)?;
        Ok(())
    }

    fn write_block(&mut self, index: usize, data: &[u8; RECORD_SIZE]) -> Result<(), Self::Error> {
        if self.failing {
            return Err(SimBusError);
        }
        *self.blocks.get_mut(index).ok_or(SimBusError)? = *data;
        self.writes[index] += 1;
        Ok(())
    }
}

/// Serial port with an input queue and a bounded transmit window.
pub struct SimSerial {
    rx: Deque<u8, 8192>,
    tx: Vec<u8, 8192>,
    tx_window: usize,
}

impl Default for SimSerial {
    fn default() -> Self {
        Self::new()
    }
}

impl SimSerial {
    pub fn new() -> Self {
        Self {
            rx: Deque::new(),
            tx: Vec::new(),
            tx_window: usize::MAX,
        }
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        for byte in bytes {
            let _ = self.rx.push_back(*byte);
        }
    }

    pub fn pending_input(&self) -> usize {
        self.rx.len()
    }

    /// Bytes the port accepts before reporting `WouldBlock`.
    pub fn set_tx_window(&mut self, window: usize) {
        self.tx_window = window;
    }

    pub fn take_tx(&mut self) -> Vec<u8, 8192> {
        core::mem::take(&mut self.tx)
    }
}

impl serial::Read<u8> for SimSerial {
    type Error = Infallible;

    fn read(&mut self) -> nb::Result<u8, Self::Error> {
        self.rx.pop_front().ok_or(nb::Error::WouldBlock)
    }
}

impl serial::Write<u8> for SimSerial {
    type Error = Infallible;

    fn write(&mut self, word: u8) -> nb::Result<(), Self::Error> {
        if self.tx_window == 0 || self.tx.push(word).is_err() {
            return Err(nb::Error::WouldBlock);
        }
        self.tx_window = self.tx_window.saturating_sub(1);
        Ok(())
    }

    fn flush(&mut self) -> nb::Result<(), Self::Error> {
        Ok(())
    }
}
