//! Platform configuration.

use crate::goals::Calibration;
use crate::regs::{SwitchingFrequency, WatchdogTimer};

/// Board and calibration parameters for one charger instance.
///
/// This is normally produced once from platform data and never changes while the charger runs.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub struct Config {
    /// Lowest contract voltage, mV. Also passed as the voltage hint when discovering the
    /// source's programmable capability.
    pub ta_min_voltage: u16,
    /// Lowest contract current, mA.
    pub ta_min_current: u16,
    /// Cable and connector resistance, mΩ.
    pub r_cable: u16,
    /// Board trace and sense resistance between the connector and the charge pump, mΩ.
    pub r_board: u16,
    /// Added to the battery voltage goal when programming VBATREG, mV.
    pub cv_offset: i16,
    /// Added to the input current goal when programming IBUSLIM, mA.
    pub ci_offset: i16,
    /// Added to the battery current goal when programming IBATREG, mA.
    pub cc_offset: i16,
    /// Watchdog period while the output is enabled, `None` to leave it off.
    pub wdt_timer: Option<WatchdogTimer>,
    /// Charge pump switching frequency.
    pub freq: SwitchingFrequency,
    /// Battery voltage below which direct charging is refused, mV.
    pub vbat_min: u16,
    /// Maximum number of contract corrections while matching VBUS during preset.
    pub adjust_retry_limit: u8,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            ta_min_voltage: 8000,
            ta_min_current: 1000,
            r_cable: 180,
            r_board: 100,
            cv_offset: 0,
            ci_offset: 100,
            cc_offset: 200,
            wdt_timer: Some(WatchdogTimer::S8),
            freq: SwitchingFrequency::Khz500,
            vbat_min: 3400,
            adjust_retry_limit: 10,
        }
    }
}

impl Config {
    pub(crate) fn calibration(&self) -> Calibration {
        Calibration {
            cv_offset: self.cv_offset,
            ci_offset: self.ci_offset,
            cc_offset: self.cc_offset,
            min_current: self.ta_min_current,
        }
    }

    /// Total resistance between the source and the charge pump input, mΩ.
    pub fn r_total(&self) -> u32 {
        self.r_cable as u32 + self.r_board as u32
    }

    /// Expected voltage drop across [`Config::r_total`] at `current` mA, in mV.
    pub fn ir_drop(&self, current: u16) -> u32 {
        current as u32 * self.r_total() / 1000
    }
}
