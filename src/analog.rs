//! Bias voltage outputs.
//!
//! Two DAC channels feed the detector: the bias (reset) line and the
//! protect (WP/ACC) line. Requested millivolts are mapped to DAC counts
//! through a per-channel linear calibration.

use embedded_hal::{
    blocking::spi::Write,
    digital::v2::{InputPin, OutputPin},
};
use snafu::Snafu;

#[derive(Snafu, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalogError {
    #[snafu(display("DAC did not acknowledge in time"))]
    Timeout,
    #[snafu(display("DAC fault line is asserted"))]
    HardwareFault,
    #[snafu(display("SPI transfer to the DAC failed"))]
    SpiError,
    #[snafu(display("DAC has no such channel"))]
    InvalidChannel,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Channel {
    Bias,
    Protect,
}

impl Channel {
    /// Calibration unit number used on the wire.
    pub fn from_unit(unit: u32) -> Option<Self> {
        match unit {
            1 => Some(Channel::Bias),
            2 => Some(Channel::Protect),
            _ => None,
        }
    }

    /// DAC channel address.
    pub fn address(self) -> u8 {
        match self {
            Channel::Bias => 0,
            Channel::Protect => 1,
        }
    }

    /// Counts per calibrated millivolt. The protect output is doubled on the
    /// interface board.
    pub fn scale(self) -> f32 {
        match self {
            Channel::Bias => 128.0,
            Channel::Protect => 64.0,
        }
    }
}

/// A DAC that can drive an addressed channel to a raw count.
pub trait AnalogOutput {
    fn set_output(&mut self, channel: u8, counts: u32) -> Result<(), AnalogError>;
}

impl<T: AnalogOutput + ?Sized> AnalogOutput for &mut T {
    fn set_output(&mut self, channel: u8, counts: u32) -> Result<(), AnalogError> {
        (**self).set_output(channel, counts)
    }
}

/// `counts = (c0 + c1 * mV) * scale`
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CalibrationPair {
    pub c0: f32,
    pub c1: f32,
}

impl Default for CalibrationPair {
    fn default() -> Self {
        Self { c0: 0.0, c1: 1.0 }
    }
}

impl CalibrationPair {
    /// Float to integer casts saturate, so negative results clamp to zero.
    pub fn counts(&self, mv: u32, scale: f32) -> u32 {
        ((self.c0 + self.c1 * mv as f32) * scale) as u32
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Calibration {
    pub bias: CalibrationPair,
    pub protect: CalibrationPair,
}

impl Calibration {
    pub fn get(&self, channel: Channel) -> CalibrationPair {
        match channel {
            Channel::Bias => self.bias,
            Channel::Protect => self.protect,
        }
    }

    pub fn set(&mut self, channel: Channel, pair: CalibrationPair) {
        match channel {
            Channel::Bias => self.bias = pair,
            Channel::Protect => self.protect = pair,
        }
    }
}

/// DAC plus the calibration that maps millivolts onto it.
pub struct AnalogFrontEnd<A> {
    dac: A,
    calibration: Calibration,
}

impl<A: AnalogOutput> AnalogFrontEnd<A> {
    pub fn new(dac: A, calibration: Calibration) -> Self {
        Self { dac, calibration }
    }

    pub fn set_millivolts(&mut self, channel: Channel, mv: u32) -> Result<(), AnalogError> {
        let counts = self.calibration.get(channel).counts(mv, channel.scale());
        log::trace!("{:?} -> {} mV ({} counts)", channel, mv, counts);
        self.dac.set_output(channel.address(), counts)
    }

    pub fn set_counts(&mut self, channel: Channel, counts: u32) -> Result<(), AnalogError> {
        self.dac.set_output(channel.address(), counts)
    }

    pub fn calibration(&self) -> &Calibration {
        &self.calibration
    }

    pub fn set_calibration(&mut self, channel: Channel, pair: CalibrationPair) {
        self.calibration.set(channel, pair);
    }

    pub fn replace_calibration(&mut self, calibration: Calibration) {
        self.calibration = calibration;
    }

    pub fn dac(&self) -> &A {
        &self.dac
    }

    pub fn dac_mut(&mut self) -> &mut A {
        &mut self.dac
    }
}

const DAC_CHANNELS: u8 = 2;
const DAC_ACK_POLLS: u32 = 1000;
const COUNTS_MASK: u32 = 0x7F_FFFF;

/// Serial DAC with a fault input and a write acknowledge input.
pub struct SpiDac<SPI, CS, FAULT, ACK> {
    spi: SPI,
    cs: CS,
    fault: FAULT,
    ack: ACK,
    ack_polls: u32,
}

impl<SPI, CS, FAULT, ACK> SpiDac<SPI, CS, FAULT, ACK>
where
    SPI: Write<u8>,
    CS: OutputPin,
    FAULT: InputPin,
    ACK: InputPin,
{
    pub fn new(spi: SPI, cs: CS, fault: FAULT, ack: ACK) -> Self {
        Self {
            spi,
            cs,
            fault,
            ack,
            ack_polls: DAC_ACK_POLLS,
        }
    }

    pub fn release(self) -> (SPI, CS, FAULT, ACK) {
        (self.spi, self.cs, self.fault, self.ack)
    }

    /// Write frame: rw (bit 0), address (1..=4), counts (5..=27), even parity (31).
    pub fn command_word(channel: u8, counts: u32) -> u32 {
        let word = 1 | (channel as u32 & 0xF) << 1 | (counts & COUNTS_MASK) << 5;
        word | (word.count_ones() & 1) << 31
    }

    fn faulted(&self) -> Result<bool, AnalogError> {
        self.fault.is_high().map_err(|_| AnalogError::HardwareFault)
    }
}

impl<SPI, CS, FAULT, ACK> AnalogOutput for SpiDac<SPI, CS, FAULT, ACK>
where
    SPI: Write<u8>,
    CS: OutputPin,
    FAULT: InputPin,
    ACK: InputPin,
{
    fn set_output(&mut self, channel: u8, counts: u32) -> Result<(), AnalogError> {
        if self.faulted()? {
            return Err(AnalogError::HardwareFault);
        }
        if channel >= DAC_CHANNELS {
            return Err(AnalogError::InvalidChannel);
        }

        let frame = Self::command_word(channel, counts).to_le_bytes();
        self.cs.set_low().map_err(|_| AnalogError::SpiError)?;
        let written = self.spi.write(&frame);
        self.cs.set_high().map_err(|_| AnalogError::SpiError)?;
        written.map_err(|_| AnalogError::SpiError)?;

        for _ in 0..self.ack_polls {
            if self.ack.is_high().map_err(|_| AnalogError::HardwareFault)? {
                return Ok(());
            }
        }

        if self.faulted()? {
            Err(AnalogError::HardwareFault)
        } else {
            Err(AnalogError::Timeout)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimInput, SimPin, SimSpi};

    #[test]
    fn calibration_maps_millivolts() {
        let pair = CalibrationPair::default();
        assert_eq!(pair.counts(3300, Channel::Bias.scale()), 3300 * 128);
        assert_eq!(pair.counts(12_500, Channel::Protect.scale()), 12_500 * 64);

        let offset = CalibrationPair { c0: -10.0, c1: 1.0 };
        assert_eq!(offset.counts(0, 128.0), 0);
        assert_eq!(offset.counts(20, 128.0), 1280);
    }

    #[test]
    fn units() {
        assert_eq!(Channel::from_unit(1), Some(Channel::Bias));
        assert_eq!(Channel::from_unit(2), Some(Channel::Protect));
        assert_eq!(Channel::from_unit(0), None);
        assert_eq!(Channel::from_unit(3), None);
    }

    #[test]
    fn command_word_has_even_parity() {
        for (channel, counts) in [(0u8, 0u32), (1, 422_400), (1, 0x7F_FFFF), (0, 0xFFFF_FFFF)] {
            let word = SpiDac::<SimSpi, SimPin, SimInput, SimInput>::command_word(channel, counts);
            assert_eq!(word.count_ones() % 2, 0);
            assert_eq!(word & 1, 1);
            assert_eq!((word >> 1) & 0xF, channel as u32);
            assert_eq!((word >> 5) & COUNTS_MASK, counts & COUNTS_MASK);
            assert_eq!((word >> 28) & 0x7, 0);
        }
    }

    #[test]
    fn writes_frame_and_waits_for_ack() {
        let mut dac = SpiDac::new(SimSpi::new(), SimPin::new(true), SimInput::new(false), SimInput::new(true));
        dac.set_output(1, 1000).unwrap();

        let (spi, cs, _, _) = dac.release();
        let expected = SpiDac::<SimSpi, SimPin, SimInput, SimInput>::command_word(1, 1000);
        assert_eq!(spi.written(), &expected.to_le_bytes());
        assert!(cs.is_set_high());
    }

    #[test]
    fn reports_errors() {
        let mut faulted = SpiDac::new(SimSpi::new(), SimPin::new(true), SimInput::new(true), SimInput::new(true));
        assert_eq!(faulted.set_output(0, 1), Err(AnalogError::HardwareFault));

        let mut bad_channel = SpiDac::new(SimSpi::new(), SimPin::new(true), SimInput::new(false), SimInput::new(true));
        assert_eq!(bad_channel.set_output(2, 1), Err(AnalogError::InvalidChannel));

        let mut silent = SpiDac::new(SimSpi::new(), SimPin::new(true), SimInput::new(false), SimInput::new(false));
        assert_eq!(silent.set_output(0, 1), Err(AnalogError::Timeout));

        let mut broken = SimSpi::new();
        broken.fail(true);
        let mut broken = SpiDac::new(broken, SimPin::new(true), SimInput::new(false), SimInput::new(true));
        assert_eq!(broken.set_output(0, 1), Err(AnalogError::SpiError));
    }
}
