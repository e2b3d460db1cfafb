//! The host-facing side: the switching charger the direct charger hands over with, and the
//! status and telemetry a power-supply framework reads back.

use embassy_sync::blocking_mutex::raw::RawMutex;
use embedded_hal_async::delay::DelayNs;
use embedded_hal_async::i2c::I2c;

use crate::charger::DirectCharger;
use crate::fault::ErrorCode;
use crate::goals::{ControlGoals, Setpoints};
use crate::regs::AdcChannel;
use crate::source::PowerSource;
use crate::state::{Phase, Targets};

/// The main switching charger sharing the battery.
///
/// Direct charging only starts once this reports disabled.
#[allow(async_fn_in_trait)]
pub trait SwitchingCharger {
    /// Whether the switching charger is still charging.
    async fn is_enabled(&mut self) -> bool;

    /// Enable or disable the switching charger.
    async fn set_enabled(&mut self, enabled: bool);
}

/// Coarse charge status.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum ChargeStatus {
    /// Idle or stopped by a fault.
    NotCharging,
    /// A session is running.
    Charging,
    /// Stopped at end of charge.
    Full,
}

/// Charger health.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum Health {
    /// No fault latched.
    Good,
    /// Input over-voltage.
    Overvoltage,
    /// Input over-current.
    OverCurrent,
    /// The device watchdog expired.
    WatchdogExpired,
    /// Battery voltage outside the direct-charge window.
    Dead,
    /// Any other fault.
    UnspecifiedFailure,
}

impl From<ErrorCode> for Health {
    fn from(code: ErrorCode) -> Self {
        if code.is_empty() {
            Health::Good
        } else if code.contains(ErrorCode::VBUS_OVP) {
            Health::Overvoltage
        } else if code.contains(ErrorCode::IBUS_OCP) {
            Health::OverCurrent
        } else if code.contains(ErrorCode::WDT_EXPIRED) {
            Health::WatchdogExpired
        } else if code.contains(ErrorCode::INVALID_VBAT) {
            Health::Dead
        } else {
            Health::UnspecifiedFailure
        }
    }
}

impl<M, I2C, P, S, D> DirectCharger<M, I2C, P, S, D>
where
    M: RawMutex,
    I2C: I2c,
    P: PowerSource,
    S: SwitchingCharger,
    D: DelayNs + Clone,
{
    /// Current phase.
    pub fn phase(&self) -> Phase {
        self.with_state(|s| s.phase)
    }

    /// The latched fault cause, empty if none.
    pub fn error_code(&self) -> ErrorCode {
        self.with_state(|s| s.error_code)
    }

    /// Coarse charge status.
    pub fn status(&self) -> ChargeStatus {
        match self.phase() {
            Phase::Eoc => ChargeStatus::Full,
            Phase::ChgOff | Phase::Error => ChargeStatus::NotCharging,
            _ => ChargeStatus::Charging,
        }
    }

    /// The phase name, for sysfs-style status strings.
    pub fn status_str(&self) -> &'static str {
        self.phase().as_str()
    }

    /// Health derived from the latched fault.
    pub fn health(&self) -> Health {
        self.error_code().into()
    }

    /// Host targets.
    pub fn targets(&self) -> Targets {
        self.with_state(|s| s.targets)
    }

    /// Goals of the running session.
    pub fn goals(&self) -> ControlGoals {
        self.with_state(|s| s.goals)
    }

    /// Regulation limits last written to the device.
    pub fn setpoints(&self) -> Setpoints {
        self.with_state(|s| s.setpoints)
    }

    /// Whether the charging output is enabled.
    pub fn output_enabled(&self) -> bool {
        self.with_state(|s| s.output_enabled)
    }

    /// The battery voltage regulation setpoint, mV.
    pub fn regulation_voltage(&self) -> u16 {
        self.setpoints().battery_voltage_limit
    }

    /// The input current granted by the source contract, mA. Zero without a contract.
    pub async fn input_current(&self) -> u16 {
        self.contract()
            .await
            .map(|c| c.requested_current)
            .unwrap_or(0)
    }

    /// Read an ADC channel in its physical unit. Reads 0 while no session runs.
    pub async fn measure(&self, channel: AdcChannel) -> Result<i32, I2C::Error> {
        self.adc(channel).await
    }

    /// Die temperature, 0.1 °C.
    pub async fn die_temperature(&self) -> Result<i32, I2C::Error> {
        self.adc(AdcChannel::DieTemp).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_prefers_specific_causes() {
        assert_eq!(Health::from(ErrorCode::empty()), Health::Good);
        assert_eq!(Health::from(ErrorCode::VBUS_OVP), Health::Overvoltage);
        assert_eq!(Health::from(ErrorCode::IBUS_OCP), Health::OverCurrent);
        assert_eq!(Health::from(ErrorCode::INVALID_VBAT), Health::Dead);
        assert_eq!(Health::from(ErrorCode::FORCED_OFF), Health::UnspecifiedFailure);
    }
}
