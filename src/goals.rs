//! Charge goal calculation.
//!
//! The control loop works against three goals: the battery voltage it regulates to (`cv`), the
//! input current it negotiates from the source (`ci`) and the battery current the device may
//! deliver (`cc`). The register setpoints programmed into the device are the goals plus the board
//! calibration offsets.

/// Contract voltage step, mV.
pub const PPS_V_STEP: u16 = 20;
/// Contract current step, mA.
pub const PPS_C_STEP: u16 = 50;

/// Round `value` to the nearest multiple of `step`, rounding up from the half step.
///
/// `step` must be non-zero.
pub fn round_to_step(value: u32, step: u32) -> u32 {
    debug_assert!(step != 0);
    let rem = value % step;
    if rem >= step / 2 {
        value - rem + step
    } else {
        value - rem
    }
}

/// The charge goals of a session.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub struct ControlGoals {
    /// Battery voltage regulation goal, mV.
    pub cv: u16,
    /// Input current goal, mA.
    pub ci: u16,
    /// Battery current goal, mA.
    pub cc: u16,
}

/// Calibration applied on top of [`ControlGoals`] when programming the device.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub struct Calibration {
    /// mV
    pub cv_offset: i16,
    /// mA
    pub ci_offset: i16,
    /// mA
    pub cc_offset: i16,
    /// Source minimum current floor, mA. A `ci` goal at or below the floor gets twice the
    /// input current offset.
    pub min_current: u16,
}

/// The regulation limits last written to the device.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub struct Setpoints {
    /// VBATREG, mV.
    pub battery_voltage_limit: u16,
    /// IBUSLIM, mA.
    pub input_current_limit: u16,
    /// IBATREG, mA.
    pub battery_current_limit: u16,
}

fn offset(value: u16, offset: i32) -> u16 {
    (value as i32 + offset).clamp(0, u16::MAX as i32) as u16
}

/// Derive the charge goals for a battery voltage target, an input current target and the
/// selected source entry's current ceiling.
///
/// The battery-side current goal is twice the input current target, the conversion ratio of
/// the 2:1 charge pump.
pub fn compute_goals(target_voltage: u16, target_current: u16, source_max_current: u16) -> ControlGoals {
    let step = PPS_C_STEP as u32;
    let ci = round_to_step(source_max_current.min(target_current) as u32, step);
    let cc = round_to_step(target_current as u32 * 2, step);
    ControlGoals {
        cv: target_voltage,
        ci: ci.min(u16::MAX as u32) as u16,
        cc: cc.min(u16::MAX as u32) as u16,
    }
}

impl ControlGoals {
    /// The device setpoints for these goals.
    pub fn setpoints(&self, cal: &Calibration) -> Setpoints {
        let ci_offset = if self.ci <= cal.min_current {
            cal.ci_offset as i32 * 2
        } else {
            cal.ci_offset as i32
        };
        Setpoints {
            battery_voltage_limit: offset(self.cv, cal.cv_offset as i32),
            input_current_limit: offset(self.ci, ci_offset),
            battery_current_limit: offset(self.cc, cal.cc_offset as i32),
        }
    }
}
