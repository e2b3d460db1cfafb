#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]

//! An embedded async driver for the SM5440 2:1 charge pump, with the direct-charge control loop
//! that drives it from a USB PD programmable power supply.
//!
//! [`Sm5440`] is the register-level driver. [`DirectCharger`] owns one device, one
//! [`PowerSource`] and the [`SwitchingCharger`] it takes over from, and runs the charging phases
//! as delayed work on the caller's clock.

#[macro_use]
mod fmt;

pub mod charger;
pub mod config;
pub mod device;
pub mod fault;
pub mod goals;
pub mod host;
pub mod regs;
pub mod sched;
pub mod source;
pub mod state;

#[cfg(test)]
mod testing;

pub use charger::{DirectCharger, Error};
pub use config::Config;
pub use device::Sm5440;
pub use fault::ErrorCode;
pub use host::{ChargeStatus, Health, SwitchingCharger};
pub use regs::{AdcChannel, SwitchingFrequency, WatchdogTimer};
pub use source::{PdError, PowerSource, PpsCapability, SourceContract};
pub use state::{Phase, Targets};
