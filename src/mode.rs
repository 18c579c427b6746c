//! Digital / threshold-scan mode switching.
//!
//! In threshold scan the detector's bias line is held at a controlled voltage
//! and the CE path is routed through the analog front end. Every transition
//! drives the rails to a safe level first.

use crate::analog::{AnalogError, AnalogFrontEnd, AnalogOutput, Calibration, Channel};
use crate::detector::DetectorBus;
use crate::prelude::*;
use embedded_hal::{blocking::delay::DelayUs, digital::v2::OutputPin};
use snafu::Snafu;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceMode {
    Digital,
    ThresholdScan,
}

/// Identifies the transition step that failed; sent as a mode failure code.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u16)]
pub enum ModeStep {
    ResetBias = 0x10,
    ResetProtect = 0x11,
    ResetRelease = 0x12,
    ResetSelector = 0x13,
    EnterProtect = 0x20,
    EnterBias = 0x21,
    EnterThreshold = 0x22,
    EnterSelector = 0x23,
    EnterUnlock = 0x24,
    EnterScan = 0x25,
    SetThreshold = 0x30,
    ExitProtect = 0x40,
    ExitBias = 0x41,
    ExitScan = 0x42,
    ExitSelector = 0x43,
}

#[derive(Snafu, Debug, PartialEq, Eq)]
pub enum ModeError {
    #[snafu(display("{:?}: {}", step, source))]
    Analog { step: ModeStep, source: AnalogError },
    #[snafu(display("{:?}: detector bus error", step))]
    Bus { step: ModeStep },
    #[snafu(display("{:?}: path selector error", step))]
    Selector { step: ModeStep },
}

impl ModeError {
    pub fn step(&self) -> ModeStep {
        match self {
            ModeError::Analog { step, .. }
            | ModeError::Bus { step }
            | ModeError::Selector { step } => *step,
        }
    }

    /// Appends the cause followed by the failing step.
    pub fn record(&self, failures: &mut FailureList) {
        match self {
            ModeError::Analog { .. } => failures.push(FailureRecord::DAC_ERROR),
            ModeError::Bus { .. } => {
                failures.push(FailureRecord::storage(StorageFailure::DetectorBus))
            }
            ModeError::Selector { .. } => {}
        }
        failures.push(FailureRecord::mode_step(self.step() as u16));
    }
}

/// Owns the analog front end, the CE path selector (high selects the digital
/// path) and the delay source.
pub struct ModeController<A, S, D> {
    front_end: AnalogFrontEnd<A>,
    selector: S,
    delay: D,
    timing: Timing,
    mode: DeviceMode,
    vt_requested: bool,
}

impl<A, S, D> ModeController<A, S, D>
where
    A: AnalogOutput,
    S: OutputPin,
    D: DelayUs<u32>,
{
    /// Starts out assuming digital mode; call [`Self::reset`] to make it so.
    pub fn new(dac: A, calibration: Calibration, selector: S, delay: D, timing: Timing) -> Self {
        Self {
            front_end: AnalogFrontEnd::new(dac, calibration),
            selector,
            delay,
            timing,
            mode: DeviceMode::Digital,
            vt_requested: false,
        }
    }

    pub fn mode(&self) -> DeviceMode {
        self.mode
    }

    pub fn vt_requested(&self) -> bool {
        self.vt_requested
    }

    pub fn clear_vt_request(&mut self) {
        self.vt_requested = false;
    }

    pub fn front_end(&self) -> &AnalogFrontEnd<A> {
        &self.front_end
    }

    pub fn front_end_mut(&mut self) -> &mut AnalogFrontEnd<A> {
        &mut self.front_end
    }

    pub fn selector(&self) -> &S {
        &self.selector
    }

    pub fn delay(&self) -> &D {
        &self.delay
    }

    /// Drives the rails safe, holds the detector in reset and releases it
    /// in digital mode. Every step runs even if an earlier one failed; the
    /// first error is returned.
    pub fn reset(&mut self) -> Result<(), ModeError> {
        log::debug!("detector reset");
        let mut first = None;
        let mut note = |result: Result<(), ModeError>| {
            if let Err(e) = result {
                log::error!("reset: {}", e);
                first.get_or_insert(e);
            }
        };

        note(self.drive(Channel::Bias, SAFE_LOW_MV, ModeStep::ResetBias));
        note(self.drive(Channel::Protect, SAFE_HIGH_MV, ModeStep::ResetProtect));
        note(self.select(DeviceMode::Digital, ModeStep::ResetSelector));
        self.delay.delay_us(self.timing.reset_hold_low_us);
        note(self.drive(Channel::Bias, SAFE_HIGH_MV, ModeStep::ResetRelease));
        self.delay.delay_us(self.timing.reset_hold_high_us);

        self.mode = DeviceMode::Digital;
        self.vt_requested = false;
        first.map_or(Ok(()), Err)
    }

    pub fn enter_threshold_scan<B>(&mut self, bus: &mut B) -> Result<(), ModeError>
    where
        B: DetectorBus + ?Sized,
    {
        self.vt_requested = true;
        if self.mode == DeviceMode::ThresholdScan {
            return Ok(());
        }
        log::debug!("entering threshold scan");

        self.select(DeviceMode::ThresholdScan, ModeStep::EnterSelector)?;
        self.delay.delay_us(self.timing.selector_settle_us);
        self.drive(Channel::Protect, SCAN_PROTECT_MV, ModeStep::EnterProtect)?;
        self.drive(Channel::Bias, SAFE_HIGH_MV, ModeStep::EnterBias)?;
        self.delay.delay_us(self.timing.enter_settle_us);
        self.apply_threshold(DEFAULT_THRESHOLD_MV, ModeStep::EnterThreshold)?;

        for (addr, data) in SCAN_UNLOCK_SEQUENCE {
            bus.write_word(addr, data)
                .map_err(|e| bus_error(e, ModeStep::EnterUnlock))?;
        }
        self.delay.delay_us(self.timing.unlock_us);
        bus.enter_scan()
            .map_err(|e| bus_error(e, ModeStep::EnterScan))?;
        self.delay.delay_us(self.timing.post_enter_us);

        self.mode = DeviceMode::ThresholdScan;
        Ok(())
    }

    pub fn set_threshold(&mut self, mv: u32) -> Result<(), ModeError> {
        self.vt_requested = true;
        self.apply_threshold(mv, ModeStep::SetThreshold)
    }

    /// On failure the mode stays `ThresholdScan`; the hardware may not have
    /// left it.
    pub fn exit_threshold_scan<B>(&mut self, bus: &mut B) -> Result<(), ModeError>
    where
        B: DetectorBus + ?Sized,
    {
        if self.mode == DeviceMode::Digital {
            return Ok(());
        }
        log::debug!("exiting threshold scan");

        self.drive(Channel::Protect, SAFE_HIGH_MV, ModeStep::ExitProtect)?;
        self.drive(Channel::Bias, SAFE_HIGH_MV, ModeStep::ExitBias)?;
        self.delay.delay_us(self.timing.exit_settle_us);
        bus.exit_scan()
            .map_err(|e| bus_error(e, ModeStep::ExitScan))?;
        self.select(DeviceMode::Digital, ModeStep::ExitSelector)?;

        self.mode = DeviceMode::Digital;
        Ok(())
    }

    fn apply_threshold(&mut self, mv: u32, step: ModeStep) -> Result<(), ModeError> {
        self.drive(Channel::Bias, mv, step)?;
        self.delay.delay_us(self.timing.threshold_settle_us);
        Ok(())
    }

    fn drive(&mut self, channel: Channel, mv: u32, step: ModeStep) -> Result<(), ModeError> {
        self.front_end
            .set_millivolts(channel, mv)
            .map_err(|source| ModeError::Analog { step, source })
    }

    fn select(&mut self, mode: DeviceMode, step: ModeStep) -> Result<(), ModeError> {
        let result = match mode {
            DeviceMode::Digital => self.selector.set_high(),
            DeviceMode::ThresholdScan => self.selector.set_low(),
        };
        result.map_err(|_| ModeError::Selector { step })
    }
}

fn bus_error<E: core::fmt::Debug>(error: E, step: ModeStep) -> ModeError {
    log::error!("{:?}: {:?}", step, error);
    ModeError::Bus { step }
}
