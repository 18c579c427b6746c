//! Detector controller firmware core.
//!
//! Everything that does not touch the STM32 peripherals directly lives here so
//! it can be exercised on the host: the framed command protocol, the command
//! engine with its deferred executor, the detector mode state machine and the
//! drivers for the SPI attached parts.
#![cfg_attr(not(test), no_std)]

pub mod address;
pub mod analog;
pub mod buffer;
pub mod cfg_flash;
pub mod command;
pub mod constants;
pub mod detector;
pub mod engine;
pub mod error;
pub mod failure;
pub mod frame;
pub mod link;
pub mod mode;
pub mod nvconfig;
pub mod opcode;
pub mod response_packet;
pub mod sim;
pub mod spi;
pub mod watchdog;

pub(crate) mod prelude {
    pub(crate) use crate::address::*;
    pub(crate) use crate::constants::*;
    pub(crate) use crate::error::*;
    pub(crate) use crate::failure::*;
    pub(crate) use crate::opcode::*;
}
