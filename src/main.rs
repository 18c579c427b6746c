// std and main are not available for bare metal software
#![no_std]
#![no_main]

use core::cell::RefCell;
use cortex_m::{asm::delay, delay::Delay, peripheral::DWT};
use cortex_m_rt::entry; // The runtime
use detctrl::{
    analog::SpiDac,
    cfg_flash::SpiNorFlash,
    constants::Timing,
    detector::DetectorBus,
    engine::{Engine, Uptime},
    link::Link,
    mode::ModeController,
    nvconfig::{BlockStorage, CalibrationStore, RECORD_SIZE},
    spi::{SharedSpi, SpiBridge},
    watchdog::ModeWatchdog,
};
use embedded_hal::spi::{Mode, Phase, Polarity};
use stm32f1xx_hal::{
    flash::{self, FlashSize, FlashWriter, SectorSize},
    gpio::PinState,
    pac,
    prelude::*,
    spi::Spi,
    usb::{Peripheral, UsbBus},
};
use usb_device::prelude::{UsbDeviceBuilder, UsbVidPid};
use usbd_serial::{SerialPort, USB_CLASS_CDC};

#[allow(unused_imports)]
use panic_halt; // When a panic occurs, stop the microcontroller

const SPI_MODE: Mode = Mode {
    polarity: Polarity::IdleLow,
    phase: Phase::CaptureOnFirstTransition,
};

/// The two calibration copies sit in the last two 1 KiB pages of flash.
const CALIBRATION_OFFSET: u32 = 62 * FLASH_PAGE;
const FLASH_PAGE: u32 = 1024;

struct FlashBlocks<'a> {
    writer: FlashWriter<'a>,
}

impl FlashBlocks<'_> {
    fn offset(index: usize) -> u32 {
        CALIBRATION_OFFSET + index as u32 * FLASH_PAGE
    }
}

impl BlockStorage for FlashBlocks<'_> {
    type Error = flash::Error;

    fn read_block(&mut self, index: usize, buf: &mut [u8; RECORD_SIZE]) -> Result<(), Self::Error> {
        buf.copy_from_slice(self.writer.read(Self::offset(index), RECORD_SIZE)?);
        Ok(())
    }

    fn write_block(&mut self, index: usize, data: &[u8; RECORD_SIZE]) -> Result<(), Self::Error> {
        let offset = Self::offset(index);
        self.writer.erase(offset, FLASH_PAGE as usize)?;
        self.writer.write(offset, data)
    }
}

/// Extends the 32-bit cycle counter; must be read at least once per wrap
/// (about 89 s at 48 MHz), which the main loop easily does.
struct CycleClock {
    cycles_per_ms: u64,
    last: u32,
    cycles: u64,
}

impl Uptime for CycleClock {
    fn uptime_ms(&mut self) -> u64 {
        let now = DWT::cycle_count();
        self.cycles += u64::from(now.wrapping_sub(self.last));
        self.last = now;
        self.cycles / self.cycles_per_ms
    }
}

#[entry]
fn main() -> ! {
    // Get handles to the hardware objects. These functions can only be called
    // once, so that the borrowchecker can ensure you don't reconfigure
    // something by accident.
    let dp = pac::Peripherals::take().unwrap();
    let mut cp = cortex_m::Peripherals::take().unwrap();

    // Latch and clear the reset cause before the RCC is handed to the HAL
    let reset_flags = dp.RCC.csr.read().bits();
    dp.RCC.csr.modify(|_, w| w.rmvf().set_bit());

    let mut flash = dp.FLASH.constrain();
    let rcc = dp.RCC.constrain();

    // Configure the clock
    let clocks = rcc
        .cfgr
        .use_hse(8.MHz())
        .sysclk(48.MHz())
        .pclk1(24.MHz())
        .freeze(&mut flash.acr);

    assert!(clocks.usbclk_valid());

    cp.DCB.enable_trace();
    cp.DWT.enable_cycle_counter();
    let clock = CycleClock {
        cycles_per_ms: u64::from(clocks.sysclk().to_Hz() / 1000),
        last: DWT::cycle_count(),
        cycles: 0,
    };
    let delay_source = Delay::new(cp.SYST, clocks.sysclk().to_Hz());

    let mut afio = dp.AFIO.constrain();
    let mut gpioa = dp.GPIOA.split();
    let mut gpiob = dp.GPIOB.split();

    // Pull down PA12 (D+ pin) to send a RESET condition to the USB bus
    let mut usb_dp = gpioa.pa12.into_push_pull_output(&mut gpioa.crh);
    usb_dp.set_low();
    delay(clocks.sysclk().to_Hz() / 100);

    let usb = Peripheral {
        usb: dp.USB,
        pin_dm: gpioa.pa11,
        pin_dp: usb_dp.into_floating_input(&mut gpioa.crh),
    };

    let usb_bus = UsbBus::new(usb);

    let mut serial = SerialPort::new(&usb_bus);

    // VID: ST Microelectronics
    // PID: STM32
    let mut usb_dev = UsbDeviceBuilder::new(&usb_bus, UsbVidPid(0x0483, 0x5740))
        .manufacturer("detctrl")
        .product("STM32 detector controller")
        .serial_number("CAFEBABE")
        .device_class(USB_CLASS_CDC)
        .build();

    // SPI1 is shared by the detector bridge (CS on PA4) and the
    // configuration flash (CS on PA3)
    let sck = gpioa.pa5.into_alternate_push_pull(&mut gpioa.crl);
    let miso = gpioa.pa6;
    let mosi = gpioa.pa7.into_alternate_push_pull(&mut gpioa.crl);
    let spi1 = RefCell::new(Spi::spi1(
        dp.SPI1,
        (sck, miso, mosi),
        &mut afio.mapr,
        SPI_MODE,
        8.MHz(),
        clocks,
    ));
    let bridge_cs = gpioa
        .pa4
        .into_push_pull_output_with_state(&mut gpioa.crl, PinState::High);
    let flash_cs = gpioa
        .pa3
        .into_push_pull_output_with_state(&mut gpioa.crl, PinState::High);

    let mut bus = SpiBridge::new(SharedSpi::new(&spi1), bridge_cs);
    let _ = bus.open();
    let cfg_flash = SpiNorFlash::new(SharedSpi::new(&spi1), flash_cs);

    // SPI2 drives the DAC
    let sck = gpiob.pb13.into_alternate_push_pull(&mut gpiob.crh);
    let miso = gpiob.pb14;
    let mosi = gpiob.pb15.into_alternate_push_pull(&mut gpiob.crh);
    let spi2 = Spi::spi2(dp.SPI2, (sck, miso, mosi), SPI_MODE, 1.MHz(), clocks);
    let dac = SpiDac::new(
        spi2,
        gpiob
            .pb12
            .into_push_pull_output_with_state(&mut gpiob.crh, PinState::High),
        gpiob.pb10.into_pull_down_input(&mut gpiob.crh),
        gpiob.pb11.into_pull_up_input(&mut gpiob.crh),
    );

    // High routes CE through the digital path
    let selector = gpiob
        .pb0
        .into_push_pull_output_with_state(&mut gpiob.crl, PinState::High);

    let mut store = CalibrationStore::new(FlashBlocks {
        writer: flash.writer(SectorSize::Sz1K, FlashSize::Sz64K),
    });
    let calibration = store.load().unwrap_or_default();

    let mut mode = ModeController::new(dac, calibration, selector, delay_source, Timing::default());
    let _ = mode.reset();

    let mut engine = Engine::new(bus, mode, cfg_flash, clock, reset_flags);
    let mut link = Link::new();
    let mut watchdog = ModeWatchdog::default();

    loop {
        usb_dev.poll(&mut [&mut serial]);
        link.poll(&mut serial, &mut engine);

        // One step of deferred work per pass, once the last reply is out
        if !link.is_sending() {
            engine.tick();
        }
        let _ = engine.service_persistence(&mut store);
        let _ = engine.run_watchdog(&mut watchdog);
    }
}
