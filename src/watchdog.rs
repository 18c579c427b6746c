//! Drops the detector back to digital mode when the host stops asking for
//! threshold reads.

use crate::analog::AnalogOutput;
use crate::constants::WATCHDOG_PERIOD;
use crate::detector::DetectorBus;
use crate::mode::{DeviceMode, ModeController, ModeError};
use embedded_hal::{blocking::delay::DelayUs, digital::v2::OutputPin};

pub struct ModeWatchdog {
    period: u32,
    count: u32,
}

impl Default for ModeWatchdog {
    fn default() -> Self {
        Self::new(WATCHDOG_PERIOD)
    }
}

impl ModeWatchdog {
    /// `period` is counted in main loop iterations.
    pub fn new(period: u32) -> Self {
        Self {
            period: period.max(1),
            count: 0,
        }
    }

    /// Call once per main loop iteration. Every `period` calls, exits
    /// threshold scan unless a threshold request arrived since the last
    /// check. Returns whether an exit was performed.
    pub fn poll<A, S, D, B>(
        &mut self,
        mode: &mut ModeController<A, S, D>,
        bus: &mut B,
    ) -> Result<bool, ModeError>
    where
        A: AnalogOutput,
        S: OutputPin,
        D: DelayUs<u32>,
        B: DetectorBus + ?Sized,
    {
        self.count += 1;
        if self.count < self.period {
            return Ok(false);
        }
        self.count = 0;

        let idle = !mode.vt_requested() && mode.mode() == DeviceMode::ThresholdScan;
        mode.clear_vt_request();
        if !idle {
            return Ok(false);
        }

        log::info!("no threshold requests, leaving threshold scan");
        mode.exit_threshold_scan(bus)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analog::Calibration;
    use crate::constants::Timing;
    use crate::sim::{SimDac, SimDelay, SimDetector, SimPin};

    fn controller() -> ModeController<SimDac, SimPin, SimDelay> {
        ModeController::new(
            SimDac::new(),
            Calibration::default(),
            SimPin::new(true),
            SimDelay::new(),
            Timing::default(),
        )
    }

    #[test]
    fn exits_after_an_idle_period() {
        let mut bus = Box::new(SimDetector::new());
        let mut mode = controller();
        let mut watchdog = ModeWatchdog::new(3);

        mode.enter_threshold_scan(&mut *bus).unwrap();

        // The request that entered scan is consumed by the first check.
        for _ in 0..3 {
            assert_eq!(watchdog.poll(&mut mode, &mut *bus), Ok(false));
        }
        assert_eq!(mode.mode(), DeviceMode::ThresholdScan);
        assert!(!mode.vt_requested());

        assert_eq!(watchdog.poll(&mut mode, &mut *bus), Ok(false));
        assert_eq!(watchdog.poll(&mut mode, &mut *bus), Ok(false));
        assert_eq!(watchdog.poll(&mut mode, &mut *bus), Ok(true));
        assert_eq!(mode.mode(), DeviceMode::Digital);
        assert!(!bus.in_scan());
    }

    #[test]
    fn requests_keep_scan_alive() {
        let mut bus = Box::new(SimDetector::new());
        let mut mode = controller();
        let mut watchdog = ModeWatchdog::new(2);

        mode.enter_threshold_scan(&mut *bus).unwrap();
        for _ in 0..10 {
            mode.set_threshold(1500).unwrap();
            watchdog.poll(&mut mode, &mut *bus).unwrap();
        }
        assert_eq!(mode.mode(), DeviceMode::ThresholdScan);
    }

    #[test]
    fn digital_mode_is_left_alone() {
        let mut bus = Box::new(SimDetector::new());
        let mut mode = controller();
        let mut watchdog = ModeWatchdog::new(1);

        assert_eq!(watchdog.poll(&mut mode, &mut *bus), Ok(false));
        assert!(bus.calls().is_empty());
    }
}
