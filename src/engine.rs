//! Command dispatch and the deferred executor.
//!
//! Quick commands are answered straight from [`Engine::handle_frame`]. Erase
//! and program commands are acknowledged at once and run later from
//! [`Engine::tick`]; until then everything but ping and calibration reads is
//! answered busy.

use crate::analog::{AnalogOutput, Channel};
use crate::cfg_flash::{ConfigFlash, EraseKind, FlashError};
use crate::command::Command;
use crate::detector::{self, DetectorBus};
use crate::frame::Frame;
use crate::mode::{ModeController, ModeError};
use crate::nvconfig::{BlockStorage, CalibrationStore, StoreError};
use crate::prelude::*;
use crate::response_packet::{PingStatus, Response, ResponseFrame};
use crate::watchdog::ModeWatchdog;
use embedded_hal::{blocking::delay::DelayUs, digital::v2::OutputPin};
use heapless::Vec;

/// Milliseconds since boot.
pub trait Uptime {
    fn uptime_ms(&mut self) -> u64;
}

/// A long running request, copied out of the frame that carried it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Deferred {
    EraseChip,
    EraseSector(WordAddress),
    ProgramSector { sector: WordAddress, value: u16 },
    ProgramChip { value: u16 },
    WriteData {
        base: WordAddress,
        words: Vec<u16, WRITE_DATA_WORDS>,
    },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingCommand {
    pub opcode: OpCode,
    pub request: Deferred,
    /// 0 until the executor picks the command up; see [`Engine::tick`].
    pub progress: u32,
}

/// Buffers read results are staged in before encoding.
struct Scratch {
    words: [u16; MAX_READ_WORDS],
    bytes: [u8; CFG_FLASH_READ_MAX],
}

struct Controller<B, A, S, D, F, C> {
    bus: B,
    mode: ModeController<A, S, D>,
    cfg_flash: F,
    clock: C,
    reset_flags: u32,
    pending: Option<PendingCommand>,
    save_requested: bool,
}

pub struct Engine<B, A, S, D, F, C> {
    ctl: Controller<B, A, S, D, F, C>,
    scratch: Scratch,
    response: ResponseFrame,
}

impl<B, A, S, D, F, C> Engine<B, A, S, D, F, C>
where
    B: DetectorBus,
    A: AnalogOutput,
    S: OutputPin,
    D: DelayUs<u32>,
    F: ConfigFlash,
    C: Uptime,
{
    /// `reset_flags` is reported verbatim by ping.
    pub fn new(
        bus: B,
        mode: ModeController<A, S, D>,
        cfg_flash: F,
        clock: C,
        reset_flags: u32,
    ) -> Self {
        Self {
            ctl: Controller {
                bus,
                mode,
                cfg_flash,
                clock,
                reset_flags,
                pending: None,
                save_requested: false,
            },
            scratch: Scratch {
                words: [0; MAX_READ_WORDS],
                bytes: [0; CFG_FLASH_READ_MAX],
            },
            response: ResponseFrame::new(),
        }
    }

    /// Runs one validated frame and returns the encoded reply. Frames with a
    /// known opcode but a malformed payload are dropped without a reply.
    pub fn handle_frame(&mut self, frame: &Frame<'_>) -> Option<&[u8]> {
        self.response.reset();

        let Some(opcode) = OpCode::from_u8(frame.opcode()) else {
            log::warn!("unknown opcode {:#04x}", frame.opcode());
            return self.response.unknown().ok();
        };

        let command = match Command::parse(opcode, frame.payload()) {
            Ok(command) => command,
            Err(e) => {
                log::warn!("dropping frame: {}", e);
                return None;
            }
        };

        let Self {
            ctl,
            scratch,
            response,
        } = self;
        let reply = ctl.execute(opcode, command, scratch, response.failures_mut());
        match response.complete(opcode, &reply) {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                log::error!("{:?} reply not encoded: {}", opcode, e);
                None
            }
        }
    }

    /// The last reply produced by [`Self::handle_frame`].
    pub fn last_reply(&self) -> &[u8] {
        self.response.as_bytes()
    }

    /// Advances the pending deferred command, if any, by one step.
    ///
    /// The first call takes progress through 1 (picked up), 2 (resetting the
    /// detector) and 3 (running), then starts the operation. Program-chip
    /// does one sector per call and reports 4 + sector, so a ping between
    /// calls sees how far it got. The command is cleared once finished or on
    /// failure; failures are only logged.
    pub fn tick(&mut self) {
        let ctl = &mut self.ctl;
        let Some(pending) = ctl.pending.as_mut() else {
            return;
        };

        if pending.progress == 0 {
            pending.progress = 1;
            log::info!("running {:?}", pending.opcode);

            pending.progress = 2;
            if let Err(e) = ctl.mode.reset() {
                log::error!("{:?} skipped, reset failed: {}", pending.opcode, e);
                ctl.pending = None;
                return;
            }
            pending.progress = 3;
        }

        match step_deferred(&mut ctl.bus, pending) {
            Ok(false) => return,
            Ok(true) => log::info!("{:?} done", pending.opcode),
            Err(e) => log::error!(
                "{:?} failed at step {}: {:?}",
                pending.opcode,
                pending.progress,
                e
            ),
        }
        ctl.pending = None;
    }

    /// Writes the calibration out once a set-calibration asked for it.
    /// Returns whether a save was attempted.
    pub fn service_persistence<St: BlockStorage>(
        &mut self,
        store: &mut CalibrationStore<St>,
    ) -> Result<bool, StoreError> {
        if !self.ctl.save_requested {
            return Ok(false);
        }
        self.ctl.save_requested = false;
        store.save(self.ctl.mode.front_end().calibration())?;
        Ok(true)
    }

    pub fn run_watchdog(&mut self, watchdog: &mut ModeWatchdog) -> Result<bool, ModeError> {
        watchdog.poll(&mut self.ctl.mode, &mut self.ctl.bus)
    }

    pub fn pending(&self) -> Option<&PendingCommand> {
        self.ctl.pending.as_ref()
    }

    pub fn is_busy(&self) -> bool {
        self.ctl.pending.is_some()
    }

    pub fn save_requested(&self) -> bool {
        self.ctl.save_requested
    }

    pub fn mode(&self) -> &ModeController<A, S, D> {
        &self.ctl.mode
    }

    pub fn mode_mut(&mut self) -> &mut ModeController<A, S, D> {
        &mut self.ctl.mode
    }

    pub fn bus(&self) -> &B {
        &self.ctl.bus
    }

    pub fn bus_mut(&mut self) -> &mut B {
        &mut self.ctl.bus
    }

    pub fn cfg_flash(&self) -> &F {
        &self.ctl.cfg_flash
    }

    pub fn cfg_flash_mut(&mut self) -> &mut F {
        &mut self.ctl.cfg_flash
    }

    pub fn clock_mut(&mut self) -> &mut C {
        &mut self.ctl.clock
    }
}

/// True if `len` bytes from `addr` stay inside the flash address space.
fn in_cfg_flash(addr: u32, len: usize) -> bool {
    u64::from(addr) + len as u64 <= u64::from(CFG_FLASH_ADDRESS_SPACE)
}

/// Runs the next piece of `pending`; `Ok(true)` once nothing is left.
fn step_deferred<B: DetectorBus>(
    bus: &mut B,
    pending: &mut PendingCommand,
) -> Result<bool, B::Error> {
    match &pending.request {
        Deferred::EraseChip => bus.erase_chip()?,
        Deferred::EraseSector(addr) => bus.erase_sector(addr.0)?,
        Deferred::ProgramSector { sector, value } => {
            detector::program_sector(bus, *sector, *value)?
        }
        Deferred::ProgramChip { value } => {
            // 3 before the first sector, 4 + sector after that
            let sector = pending.progress - 3;
            let value = *value;
            pending.progress = 4 + sector;
            detector::program_sector(bus, WordAddress::sector(sector), value)?;
            return Ok(sector + 1 == SECTOR_COUNT);
        }
        Deferred::WriteData { base, words } => bus.program_buffer(base.0, words)?,
    }
    Ok(true)
}

impl<B, A, S, D, F, C> Controller<B, A, S, D, F, C>
where
    B: DetectorBus,
    A: AnalogOutput,
    S: OutputPin,
    D: DelayUs<u32>,
    F: ConfigFlash,
    C: Uptime,
{
    fn execute<'s>(
        &mut self,
        opcode: OpCode,
        command: Command<'_>,
        scratch: &'s mut Scratch,
        failures: &mut FailureList,
    ) -> Response<'s> {
        if let Some(pending) = &self.pending {
            if !opcode.always_served() {
                log::debug!("{:?} rejected, {:?} pending", opcode, pending.opcode);
                failures.push(FailureRecord::BUSY);
                return Response::Empty;
            }
        }

        match command {
            Command::Ping => Response::Ping(self.status()),
            Command::EraseChip => self.accept(opcode, Deferred::EraseChip),
            Command::EraseSector(addr) => self.accept(opcode, Deferred::EraseSector(addr)),
            Command::ProgramSector { sector, value } => {
                self.accept(opcode, Deferred::ProgramSector { sector, value })
            }
            Command::ProgramChip { value } => self.accept(opcode, Deferred::ProgramChip { value }),
            Command::WriteData { data, base, count } => {
                let count = count as usize;
                if count > WRITE_DATA_WORDS {
                    failures.push(FailureRecord::INVALID_PARAMETER);
                    return Response::Empty;
                }
                let words = data
                    .chunks_exact(2)
                    .take(count)
                    .map(|b| u16::from_le_bytes([b[0], b[1]]))
                    .collect();
                self.accept(opcode, Deferred::WriteData { base, words })
            }
            Command::VtBitCountKPage { base, mv } => self.kpage_bit_counts(base, mv, scratch, failures),
            Command::SectorBitCount { base, mv } => {
                self.sector_bit_count(base, mv, scratch, failures)
            }
            Command::ReadData {
                base,
                vt,
                mv,
                count,
            } => self.read_data(base, vt, mv, count, scratch, failures),
            Command::ReadWord {
                vt,
                mv,
                addr,
                samples,
            } => self.read_word(vt, mv, addr, samples, failures),
            Command::ReadCfg(addr) => match self.bus.read_word(addr.0 | CFG_ADDRESS_BIT) {
                Ok(word) => Response::ReadCfg(word),
                Err(e) => bus_failure(e, failures),
            },
            Command::WriteCfg { addr, data } => {
                let result = self
                    .bus
                    .write_command_word(addr.0 | CFG_ADDRESS_BIT, data as u16);
                bus_result(result, failures)
            }
            Command::CfgFlashEnter => {
                let result = self.bus.enter_cfg_bypass();
                bus_result(result, failures)
            }
            Command::CfgFlashExit => {
                let result = self.bus.exit_cfg_bypass();
                bus_result(result, failures)
            }
            Command::CfgFlashRead { addr, len } => {
                let len = len as usize;
                if len > CFG_FLASH_READ_MAX || !in_cfg_flash(addr, len) {
                    failures.push(FailureRecord::INVALID_PARAMETER);
                    return Response::Empty;
                }
                let buf = &mut scratch.bytes[..len];
                match self.with_cfg_flash(|flash| flash.read(addr, buf)) {
                    Ok(()) => Response::CfgFlashRead(&scratch.bytes[..len]),
                    Err(e) => flash_failure(e, failures),
                }
            }
            Command::CfgFlashWrite { data, addr, len } => {
                let len = len as usize;
                if len > CFG_FLASH_WRITE_MAX || !in_cfg_flash(addr, len) {
                    failures.push(FailureRecord::INVALID_PARAMETER);
                    return Response::Empty;
                }
                match self.with_cfg_flash(|flash| flash.write(addr, &data[..len])) {
                    Ok(()) => Response::Empty,
                    Err(e) => flash_failure(e, failures),
                }
            }
            Command::CfgFlashErase { kind, addr } => {
                let Some(kind) = EraseKind::from_u32(kind) else {
                    failures.push(FailureRecord::INVALID_PARAMETER);
                    return Response::Empty;
                };
                if addr >= CFG_FLASH_ADDRESS_SPACE {
                    failures.push(FailureRecord::INVALID_PARAMETER);
                    return Response::Empty;
                }
                match self.with_cfg_flash(|flash| flash.erase(kind, addr)) {
                    Ok(()) => Response::Empty,
                    Err(e) => flash_failure(e, failures),
                }
            }
            Command::CfgFlashInfo => match self.with_cfg_flash(|flash| flash.device_info()) {
                Ok(info) => Response::CfgFlashInfo(info),
                Err(e) => flash_failure(e, failures),
            },
            Command::GetCalibration { unit } => match Channel::from_unit(unit) {
                Some(channel) => {
                    Response::Calibration(self.mode.front_end().calibration().get(channel))
                }
                None => invalid(failures),
            },
            Command::SetCalibration { unit, pair } => match Channel::from_unit(unit) {
                Some(channel) => {
                    self.mode.front_end_mut().set_calibration(channel, pair);
                    self.save_requested = true;
                    Response::Empty
                }
                None => invalid(failures),
            },
            Command::SetActiveCounts { unit, counts } => match Channel::from_unit(unit) {
                Some(channel) => match self.mode.front_end_mut().set_counts(channel, counts) {
                    Ok(()) => Response::Empty,
                    Err(e) => {
                        log::warn!("{:?} counts {}: {}", channel, counts, e);
                        failures.push(FailureRecord::DAC_ERROR);
                        Response::Empty
                    }
                },
                None => invalid(failures),
            },
        }
    }

    fn status(&mut self) -> PingStatus {
        PingStatus {
            uptime_s: (self.clock.uptime_ms() / 1000) as u32,
            busy: self.pending.is_some(),
            reset_flags: self.reset_flags,
            task: self.pending.as_ref().map_or(0, |p| p.opcode as u32),
            task_state: self.pending.as_ref().map_or(0, |p| p.progress),
        }
    }

    fn accept<'s>(&mut self, opcode: OpCode, request: Deferred) -> Response<'s> {
        debug_assert_eq!(opcode.dispatch(), Dispatch::Deferred);
        log::info!("{:?} accepted", opcode);
        self.pending = Some(PendingCommand {
            opcode,
            request,
            progress: 0,
        });
        Response::Empty
    }

    /// Puts the detector in the mode a read asked for. Leaving threshold scan
    /// after the read is up to the host or the watchdog.
    fn prepare_read(&mut self, vt: bool, mv: u32, failures: &mut FailureList) -> bool {
        let result = if vt {
            self.mode
                .enter_threshold_scan(&mut self.bus)
                .and_then(|()| self.mode.set_threshold(mv))
        } else {
            self.mode.exit_threshold_scan(&mut self.bus)
        };

        match result {
            Ok(()) => true,
            Err(e) => {
                log::warn!("mode change failed: {}", e);
                e.record(failures);
                false
            }
        }
    }

    fn read_data<'s>(
        &mut self,
        base: WordAddress,
        vt: bool,
        mv: u32,
        count: u32,
        scratch: &'s mut Scratch,
        failures: &mut FailureList,
    ) -> Response<'s> {
        let count = (count as usize).min(MAX_READ_WORDS);
        if !self.prepare_read(vt, mv, failures) {
            return Response::Empty;
        }
        match detector::read_range(&mut self.bus, base, &mut scratch.words[..count]) {
            Ok(()) => Response::ReadData(&scratch.words[..count]),
            Err(e) => bus_failure(e, failures),
        }
    }

    fn read_word<'s>(
        &mut self,
        vt: bool,
        mv: u32,
        addr: WordAddress,
        samples: u32,
        failures: &mut FailureList,
    ) -> Response<'s> {
        let samples = samples.max(1);
        if !self.prepare_read(vt, mv, failures) {
            return Response::Empty;
        }

        let mut bit_counts = [0u32; READ_WORD_BITS];
        for _ in 0..samples {
            let word = match self.bus.read_word(addr.0) {
                Ok(word) => word,
                Err(e) => return bus_failure(e, failures),
            };
            for (bit, count) in bit_counts.iter_mut().enumerate() {
                *count += u32::from(word >> bit & 1);
            }
        }

        Response::ReadWord {
            samples,
            bit_counts,
        }
    }

    fn sector_bit_count<'s>(
        &mut self,
        base: WordAddress,
        mv: u32,
        scratch: &'s mut Scratch,
        failures: &mut FailureList,
    ) -> Response<'s> {
        if !self.prepare_read(true, mv, failures) {
            return Response::Empty;
        }

        let mut total = 0;
        let mut addr = base;
        for _ in 0..(SECTOR_WORDS as usize / MAX_READ_WORDS) {
            let words = &mut scratch.words[..];
            if let Err(e) = detector::read_range(&mut self.bus, addr, words) {
                return bus_failure(e, failures);
            }
            total += words.iter().map(|w| w.count_ones()).sum::<u32>();
            addr = addr.offset(MAX_READ_WORDS as u32);
        }
        Response::SectorBitCount(total)
    }

    fn kpage_bit_counts<'s>(
        &mut self,
        base: WordAddress,
        mv: u32,
        scratch: &'s mut Scratch,
        failures: &mut FailureList,
    ) -> Response<'s> {
        if !self.prepare_read(true, mv, failures) {
            return Response::Empty;
        }

        let pages_per_read = MAX_READ_WORDS / PAGE_WORDS;
        let Scratch { words, bytes } = &mut *scratch;
        let mut addr = base;
        for counts in bytes[..KPAGE_COUNT].chunks_mut(pages_per_read) {
            let words = &mut words[..counts.len() * PAGE_WORDS];
            if let Err(e) = detector::read_range(&mut self.bus, addr, words) {
                return bus_failure(e, failures);
            }
            for (count, page) in counts.iter_mut().zip(words.chunks_exact(PAGE_WORDS)) {
                *count = page.iter().map(|w| w.count_ones()).sum::<u32>() as u8;
            }
            addr = addr.offset(words.len() as u32);
        }
        Response::KPageBitCounts(&scratch.bytes[..KPAGE_COUNT])
    }

    /// Wakes the configuration flash for one operation. It is put back to
    /// sleep even when the operation failed.
    fn with_cfg_flash<T>(
        &mut self,
        op: impl FnOnce(&mut F) -> Result<T, FlashError>,
    ) -> Result<T, FlashError> {
        self.cfg_flash.release_power_down()?;
        let result = op(&mut self.cfg_flash);
        if let Err(e) = self.cfg_flash.power_down() {
            log::warn!("configuration flash power down: {}", e);
        }
        result
    }
}

fn invalid<'s>(failures: &mut FailureList) -> Response<'s> {
    failures.push(FailureRecord::INVALID_PARAMETER);
    Response::Empty
}

fn bus_result<'s, E: core::fmt::Debug>(
    result: Result<(), E>,
    failures: &mut FailureList,
) -> Response<'s> {
    match result {
        Ok(()) => Response::Empty,
        Err(e) => bus_failure(e, failures),
    }
}

fn bus_failure<'s, E: core::fmt::Debug>(error: E, failures: &mut FailureList) -> Response<'s> {
    log::error!("detector bus: {:?}", error);
    failures.push(FailureRecord::storage(StorageFailure::DetectorBus));
    Response::Empty
}

fn flash_failure<'s>(error: FlashError, failures: &mut FailureList) -> Response<'s> {
    log::error!("configuration flash: {}", error);
    let code = match error {
        FlashError::Bus => StorageFailure::ConfigFlashBus,
        FlashError::Timeout => StorageFailure::ConfigFlashTimeout,
    };
    failures.push(FailureRecord::storage(code));
    Response::Empty
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analog::{Calibration, CalibrationPair};
    use crate::frame;
    use crate::mode::DeviceMode;
    use crate::sim::{
        BusCall, SimClock, SimConfigFlash, SimDac, SimDelay, SimDetector, SimPin,
    };

    type TestEngine<'a> =
        Engine<&'a mut SimDetector, SimDac, SimPin, SimDelay, &'a mut SimConfigFlash, SimClock>;

    struct Rig {
        bus: Box<SimDetector>,
        flash: Box<SimConfigFlash>,
    }

    impl Rig {
        fn new() -> Self {
            Self {
                bus: Box::new(SimDetector::new()),
                flash: Box::new(SimConfigFlash::new()),
            }
        }

        fn engine(&mut self) -> Box<TestEngine<'_>> {
            let mode = ModeController::new(
                SimDac::new(),
                Calibration::default(),
                SimPin::new(true),
                SimDelay::new(),
                Timing::default(),
            );
            Box::new(Engine::new(
                &mut *self.bus,
                mode,
                &mut *self.flash,
                SimClock::new(12_345),
                0x0C00_0000,
            ))
        }
    }

    fn request(engine: &mut TestEngine<'_>, opcode: u8, payload: &[u8]) -> Option<Vec<u8, 8192>> {
        let mut buf = [0u8; MAX_COMMAND_FRAME];
        let n = frame::encode(&mut buf, opcode, payload).unwrap();
        let frame = Frame::new(&buf[..n]).unwrap();
        engine
            .handle_frame(&frame)
            .map(|reply| Vec::from_slice(reply).unwrap())
    }

    fn words(values: &[u32]) -> std::vec::Vec<u8> {
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    fn failures(reply: &[u8]) -> std::vec::Vec<(u16, u16)> {
        assert_eq!(reply[3], FAILED_COMMAND);
        let payload = Frame::new(reply).unwrap().payload();
        let (count, records) = payload.split_at(4);
        let records: std::vec::Vec<_> = records
            .chunks_exact(4)
            .map(|r| {
                (
                    u16::from_le_bytes([r[0], r[1]]),
                    u16::from_le_bytes([r[2], r[3]]),
                )
            })
            .collect();
        assert_eq!(
            u32::from_le_bytes([count[0], count[1], count[2], count[3]]) as usize,
            records.len()
        );
        records
    }

    #[test]
    fn ping_reports_status() {
        let mut rig = Rig::new();
        let mut engine = rig.engine();

        let reply = request(&mut engine, OpCode::Ping as u8, &[]).unwrap();
        let reply = Frame::new(&reply).unwrap();
        assert_eq!(reply.opcode(), OpCode::Ping.response());
        let payload = reply.payload();
        assert_eq!(payload.len(), 36);
        assert_eq!(&payload[0..4], &12u32.to_le_bytes());
        assert!(payload[4..20].starts_with(b"detctrl "));
        assert_eq!(&payload[20..24], &0u32.to_le_bytes());
        assert_eq!(&payload[24..28], &0x0C00_0000u32.to_le_bytes());
    }

    #[test]
    fn deferred_command_blocks_until_tick() {
        let mut rig = Rig::new();
        let mut engine = rig.engine();

        let reply = request(&mut engine, OpCode::EraseSector as u8, &words(&[0x20000])).unwrap();
        assert_eq!(reply[3], OpCode::EraseSector.response());
        assert_eq!(engine.pending().unwrap().opcode, OpCode::EraseSector);
        assert_eq!(engine.pending().unwrap().progress, 0);

        let reply = request(&mut engine, OpCode::ReadCfg as u8, &words(&[0])).unwrap();
        assert_eq!(failures(&reply), vec![(1, 2)]);

        let reply = request(&mut engine, OpCode::GetCalibration as u8, &words(&[1])).unwrap();
        assert_eq!(reply[3], OpCode::GetCalibration.response());

        let reply = request(&mut engine, OpCode::Ping as u8, &[]).unwrap();
        let payload = Frame::new(&reply).unwrap().payload();
        assert_eq!(&payload[20..24], &1u32.to_le_bytes());
        assert_eq!(&payload[28..32], &(OpCode::EraseSector as u32).to_le_bytes());

        engine.tick();
        assert!(!engine.is_busy());
        drop(engine);
        assert!(rig.bus.calls().contains(&BusCall::EraseSector(0x20000)));
    }

    #[test]
    fn program_chip_walks_every_sector() {
        let mut rig = Rig::new();
        let mut engine = rig.engine();

        request(&mut engine, OpCode::ProgramChip as u8, &words(&[0x1234])).unwrap();
        let mut ticks = 0;
        while engine.is_busy() {
            engine.tick();
            ticks += 1;
        }
        assert_eq!(ticks, 1024);
        drop(engine);

        assert_eq!(rig.bus.repeated_programs(), 1024 * 128);
        assert_eq!(
            rig.bus.last_repeated(),
            Some((1023 * 0x10000 + 127 * 512, 0x1234))
        );
        assert_eq!(rig.bus.peek(0x1FFFF), 0x1234 & 0xFFFF);
    }

    #[test]
    fn ping_sees_program_chip_progress() {
        let mut rig = Rig::new();
        let mut engine = rig.engine();

        fn task_state(engine: &mut TestEngine<'_>) -> u32 {
            let reply = request(engine, OpCode::Ping as u8, &[]).unwrap();
            let payload = Frame::new(&reply).unwrap().payload();
            assert_eq!(&payload[20..24], &1u32.to_le_bytes());
            assert_eq!(&payload[28..32], &(OpCode::ProgramChip as u32).to_le_bytes());
            u32::from_le_bytes([payload[32], payload[33], payload[34], payload[35]])
        }

        request(&mut engine, OpCode::ProgramChip as u8, &words(&[0])).unwrap();
        assert_eq!(task_state(&mut engine), 0);

        engine.tick();
        assert_eq!(task_state(&mut engine), 4);
        engine.tick();
        assert_eq!(task_state(&mut engine), 5);

        let reply = request(&mut engine, OpCode::EraseChip as u8, &[]).unwrap();
        assert_eq!(failures(&reply), vec![(1, 2)]);
        drop(engine);
        assert_eq!(rig.bus.repeated_programs(), 2 * 128);
        assert_eq!(rig.bus.last_repeated(), Some((0x1_0000 + 127 * 512, 0)));
    }

    #[test]
    fn failed_reset_skips_the_operation() {
        let mut rig = Rig::new();
        let mut engine = rig.engine();

        request(&mut engine, OpCode::EraseChip as u8, &[]).unwrap();
        engine
            .mode_mut()
            .front_end_mut()
            .dac_mut()
            .fail_at(0, crate::analog::AnalogError::Timeout);
        engine.tick();
        assert!(!engine.is_busy());
        drop(engine);
        assert!(!rig.bus.calls().contains(&BusCall::EraseChip));
    }

    #[test]
    fn write_data_keeps_its_own_copy() {
        let mut rig = Rig::new();
        let mut engine = rig.engine();

        let mut payload = std::vec![0u8; 1024];
        payload[0..2].copy_from_slice(&0x00F0u16.to_le_bytes());
        payload[2..4].copy_from_slice(&0x0F00u16.to_le_bytes());
        payload.extend(words(&[0x100, 2]));
        request(&mut engine, OpCode::WriteData as u8, &payload).unwrap();

        match &engine.pending().unwrap().request {
            Deferred::WriteData { base, words } => {
                assert_eq!(*base, WordAddress(0x100));
                assert_eq!(&words[..], &[0x00F0, 0x0F00]);
            }
            other => panic!("unexpected {:?}", other),
        }
        engine.tick();
        drop(engine);
        assert_eq!(rig.bus.peek(0x100), 0x00F0);
        assert_eq!(rig.bus.peek(0x101), 0x0F00);
        assert_eq!(rig.bus.peek(0x102), 0xFFFF);
    }

    #[test]
    fn write_data_count_is_bounded() {
        let mut rig = Rig::new();
        let mut engine = rig.engine();

        let mut payload = std::vec![0u8; 1024];
        payload.extend(words(&[0, 513]));
        let reply = request(&mut engine, OpCode::WriteData as u8, &payload).unwrap();
        assert_eq!(failures(&reply), vec![(1, 3)]);
        assert!(!engine.is_busy());
    }

    #[test]
    fn read_data_odd_count_is_padded() {
        let mut rig = Rig::new();
        rig.bus.fill_with(|addr| addr as u16);
        let mut engine = rig.engine();

        let reply = request(&mut engine, OpCode::ReadData as u8, &words(&[0x10, 0, 0, 3])).unwrap();
        let reply = Frame::new(&reply).unwrap();
        assert_eq!(reply.opcode(), OpCode::ReadData.response());
        assert_eq!(reply.payload(), &[0x10, 0, 0x11, 0, 0x12, 0, 0, 0]);
    }

    #[test]
    fn read_data_count_is_capped() {
        let mut rig = Rig::new();
        let mut engine = rig.engine();

        let reply = request(&mut engine, OpCode::ReadData as u8, &words(&[0, 0, 0, 5000])).unwrap();
        assert_eq!(Frame::new(&reply).unwrap().payload().len(), 2 * MAX_READ_WORDS);
    }

    #[test]
    fn threshold_read_stays_in_scan() {
        let mut rig = Rig::new();
        let mut engine = rig.engine();

        request(&mut engine, OpCode::ReadData as u8, &words(&[0, 1, 2500, 4])).unwrap();
        assert_eq!(engine.mode().mode(), DeviceMode::ThresholdScan);
        assert_eq!(engine.mode().front_end().dac().output(0), Some(2500 * 128));

        request(&mut engine, OpCode::ReadData as u8, &words(&[0, 0, 0, 4])).unwrap();
        assert_eq!(engine.mode().mode(), DeviceMode::Digital);
    }

    #[test]
    fn read_word_counts_bits() {
        let mut rig = Rig::new();
        rig.bus.fill_with(|_| 0x8001);
        let mut engine = rig.engine();

        let reply = request(&mut engine, OpCode::ReadWord as u8, &words(&[0, 0, 7, 0])).unwrap();
        let payload = Frame::new(&reply).unwrap().payload().to_vec();
        assert_eq!(&payload[0..4], &1u32.to_le_bytes());
        assert_eq!(&payload[4..8], &1u32.to_le_bytes());
        assert_eq!(&payload[8..12], &0u32.to_le_bytes());
        assert_eq!(&payload[64..68], &1u32.to_le_bytes());
    }

    #[test]
    fn bit_counts() {
        let mut rig = Rig::new();
        rig.bus.fill_with(|addr| if addr < 8 { 0x0003 } else { 0 });
        let mut engine = rig.engine();

        let reply = request(&mut engine, OpCode::SectorBitCount as u8, &words(&[0, 1000])).unwrap();
        let payload = Frame::new(&reply).unwrap().payload().to_vec();
        assert_eq!(payload, 16u32.to_le_bytes());

        let reply =
            request(&mut engine, OpCode::VtBitCountKPage as u8, &words(&[0, 1000])).unwrap();
        let payload = Frame::new(&reply).unwrap().payload().to_vec();
        assert_eq!(payload.len(), KPAGE_COUNT);
        assert_eq!(payload[0], 16);
        assert!(payload[1..].iter().all(|&c| c == 0));
        assert_eq!(engine.mode().mode(), DeviceMode::ThresholdScan);
    }

    #[test]
    fn config_registers() {
        let mut rig = Rig::new();
        let mut engine = rig.engine();

        let reply = request(&mut engine, OpCode::WriteCfg as u8, &words(&[3, 0x1_ABCD])).unwrap();
        assert_eq!(reply[3], OpCode::WriteCfg.response());
        let reply = request(&mut engine, OpCode::ReadCfg as u8, &words(&[3])).unwrap();
        assert_eq!(
            Frame::new(&reply).unwrap().payload(),
            &[0xCD, 0xAB, 0, 0]
        );
    }

    #[test]
    fn detector_bus_failure_is_reported() {
        let mut rig = Rig::new();
        rig.bus.set_failing(true);
        let mut engine = rig.engine();

        let reply = request(&mut engine, OpCode::ReadCfg as u8, &words(&[0])).unwrap();
        assert_eq!(failures(&reply), vec![(4, 3)]);
    }

    #[test]
    fn config_flash_round_trip_powers_down() {
        let mut rig = Rig::new();
        let mut engine = rig.engine();

        let mut payload = std::vec![0u8; CFG_FLASH_WRITE_MAX];
        payload[..4].copy_from_slice(b"cfg!");
        payload.extend(words(&[0x100, 4]));
        let reply = request(&mut engine, OpCode::CfgFlashWrite as u8, &payload).unwrap();
        assert_eq!(reply[3], OpCode::CfgFlashWrite.response());

        let reply = request(&mut engine, OpCode::CfgFlashRead as u8, &words(&[0x100, 3])).unwrap();
        assert_eq!(Frame::new(&reply).unwrap().payload(), b"cfg\0");
        assert!(engine.cfg_flash().is_powered_down());
        assert_eq!(engine.cfg_flash().wakeups(), 2);

        let reply = request(&mut engine, OpCode::CfgFlashRead as u8, &words(&[0, 4097])).unwrap();
        assert_eq!(failures(&reply), vec![(1, 3)]);

        let reply = request(&mut engine, OpCode::CfgFlashErase as u8, &words(&[9, 0])).unwrap();
        assert_eq!(failures(&reply), vec![(1, 3)]);
    }

    #[test]
    fn config_flash_range_past_the_end_is_rejected() {
        let mut rig = Rig::new();
        let mut engine = rig.engine();

        let reply =
            request(&mut engine, OpCode::CfgFlashRead as u8, &words(&[0xFFFF_FFF0, 32])).unwrap();
        assert_eq!(failures(&reply), vec![(1, 3)]);

        let mut payload = std::vec![0u8; CFG_FLASH_WRITE_MAX];
        payload.extend(words(&[0x00FF_FFF0, 32]));
        let reply = request(&mut engine, OpCode::CfgFlashWrite as u8, &payload).unwrap();
        assert_eq!(failures(&reply), vec![(1, 3)]);

        let reply =
            request(&mut engine, OpCode::CfgFlashErase as u8, &words(&[0, 0x0100_0000])).unwrap();
        assert_eq!(failures(&reply), vec![(1, 3)]);

        // The last bytes are still reachable.
        let reply =
            request(&mut engine, OpCode::CfgFlashRead as u8, &words(&[0x00FF_FFF0, 16])).unwrap();
        assert_eq!(reply[3], OpCode::CfgFlashRead.response());
        assert_eq!(engine.cfg_flash().wakeups(), 1);
    }

    #[test]
    fn config_flash_errors_map_to_storage_codes() {
        let mut rig = Rig::new();
        rig.flash.set_failure(Some(FlashError::Timeout));
        let mut engine = rig.engine();

        let reply = request(&mut engine, OpCode::CfgFlashInfo as u8, &[]).unwrap();
        assert_eq!(failures(&reply), vec![(4, 2)]);
    }

    #[test]
    fn calibration_set_get() {
        let mut rig = Rig::new();
        let mut engine = rig.engine();

        let mut payload = words(&[2]);
        payload.extend(1.5f32.to_le_bytes());
        payload.extend(2.0f32.to_le_bytes());
        request(&mut engine, OpCode::SetCalibration as u8, &payload).unwrap();
        assert!(engine.save_requested());

        let reply = request(&mut engine, OpCode::GetCalibration as u8, &words(&[2])).unwrap();
        let payload = Frame::new(&reply).unwrap().payload().to_vec();
        assert_eq!(&payload[..4], &1.5f32.to_le_bytes());
        assert_eq!(&payload[4..], &2.0f32.to_le_bytes());
        assert_eq!(
            engine.mode().front_end().calibration().protect,
            CalibrationPair { c0: 1.5, c1: 2.0 }
        );

        let reply = request(&mut engine, OpCode::GetCalibration as u8, &words(&[3])).unwrap();
        assert_eq!(failures(&reply), vec![(1, 3)]);
    }

    #[test]
    fn active_counts_dac_failure() {
        let mut rig = Rig::new();
        let mut engine = rig.engine();

        let reply =
            request(&mut engine, OpCode::SetActiveCounts as u8, &words(&[1, 4000])).unwrap();
        assert_eq!(reply[3], OpCode::SetActiveCounts.response());
        assert_eq!(engine.mode().front_end().dac().output(0), Some(4000));

        engine
            .mode_mut()
            .front_end_mut()
            .dac_mut()
            .fail_at(0, crate::analog::AnalogError::HardwareFault);
        let reply =
            request(&mut engine, OpCode::SetActiveCounts as u8, &words(&[2, 10])).unwrap();
        assert_eq!(failures(&reply), vec![(2, 1)]);
    }

    #[test]
    fn unknown_and_malformed() {
        let mut rig = Rig::new();
        let mut engine = rig.engine();

        let reply = request(&mut engine, 0x70, &[]).unwrap();
        assert_eq!(&reply[..4], &[FRAME_MARKER, 0x08, 0x00, UNKNOWN_COMMAND]);
        assert_eq!(frame::checksum(&reply), 0);
        assert_eq!(reply.len(), FRAME_OVERHEAD);

        assert!(request(&mut engine, OpCode::EraseSector as u8, &[]).is_none());
        assert!(!engine.is_busy());
    }
}
