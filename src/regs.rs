//! SM5440 register map, status layouts and ADC conversions.

use modular_bitfield::specifiers::{B1, B3, B4};
use modular_bitfield::{bitfield, BitfieldSpecifier};

pub(crate) const ADDR: u8 = 0x75;

/// Value of [`Reg::DEVICE_ID`] on an SM5440.
pub const DEVICE_ID: u8 = 0x05;

/// A device register address.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub struct Reg(pub u8);

#[allow(missing_docs)]
impl Reg {
    pub const INT1: Reg = Reg(0x00);
    pub const INT2: Reg = Reg(0x01);
    pub const MSK1: Reg = Reg(0x02);
    pub const MSK2: Reg = Reg(0x03);
    pub const STATUS1: Reg = Reg(0x04);
    pub const STATUS2: Reg = Reg(0x05);
    pub const CNTL1: Reg = Reg(0x06);
    pub const CNTL2: Reg = Reg(0x07);
    pub const VBATCNTL: Reg = Reg(0x09);
    pub const IBUSCNTL: Reg = Reg(0x0a);
    pub const IBATCNTL: Reg = Reg(0x0b);
    pub const ADCCNTL: Reg = Reg(0x0c);
    pub const ADC_BASE: Reg = Reg(0x10);
    pub const DEVICE_ID: Reg = Reg(0x1f);

    pub const fn new(val: u8) -> Self {
        Reg(val)
    }

    pub const fn to_u8(self) -> u8 {
        self.0
    }
}

pub(crate) const CHG_EN_MASK: u8 = 0x01;
pub(crate) const CHG_EN_SHIFT: u8 = 0;
pub(crate) const WDT_EN_MASK: u8 = 0x01;
pub(crate) const WDT_EN_SHIFT: u8 = 2;
pub(crate) const WDT_TMR_MASK: u8 = 0x03;
pub(crate) const WDT_TMR_SHIFT: u8 = 3;
pub(crate) const FREQ_MASK: u8 = 0x07;
pub(crate) const FREQ_SHIFT: u8 = 0;
pub(crate) const ADC_EN_MASK: u8 = 0x01;
pub(crate) const ADC_EN_SHIFT: u8 = 0;

pub(crate) const VBATREG_MIN: u16 = 3800;
pub(crate) const VBATREG_STEP: u16 = 10;
pub(crate) const VBATREG_MASK: u8 = 0x7f;
pub(crate) const IBUSLIM_MIN: u16 = 500;
pub(crate) const IBUSLIM_STEP: u16 = 50;
pub(crate) const IBUSLIM_MASK: u8 = 0x3f;
pub(crate) const IBATREG_MIN: u16 = 1000;
pub(crate) const IBATREG_STEP: u16 = 50;
pub(crate) const IBATREG_MASK: u8 = 0x7f;

/// Encode a linear setpoint into a register code, saturating at both ends of the field.
pub(crate) fn encode_setpoint(value: u16, min: u16, step: u16, mask: u8) -> u8 {
    (value.saturating_sub(min) / step).min(mask as u16) as u8
}

/// Interrupt and status flags.
///
/// INT1/INT2 hold the latched, clear-on-read interrupt flags and STATUS1/STATUS2 the live
/// state of the same sources, with the same layout.
#[bitfield(bits = 16)]
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub struct Flags {
    /// Battery voltage regulation loop is clamping the output.
    pub vbatreg: bool,
    /// Input current limit loop is clamping the output.
    pub ibuslim: bool,
    /// Input over-current comparator.
    pub ibusocp: bool,
    /// Battery over-current comparator.
    pub ibatocp: bool,
    /// Output over-voltage comparator.
    pub voutovp: bool,
    /// Thermal shutdown.
    pub tsd: bool,
    /// Reverse current blocking engaged.
    pub reverse_block: bool,
    /// The device turned the charging output off on its own.
    pub chg_off: bool,
    /// VBUS over-voltage.
    pub vbus_ovp: bool,
    /// VBUS under-voltage lockout.
    pub vbus_uvlo: bool,
    /// VBUS is within its valid window.
    pub vbus_pok: bool,
    /// The I2C watchdog expired.
    pub wdt_expired: bool,
    #[skip]
    __: B4,
}

impl Flags {
    /// True when neither regulation loop is active.
    pub fn loops_inactive(&self) -> bool {
        !self.vbatreg() && !self.ibuslim()
    }
}

/// Watchdog period.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, BitfieldSpecifier)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
#[bits = 2]
pub enum WatchdogTimer {
    /// 2 seconds
    S2,
    /// 4 seconds
    S4,
    /// 8 seconds
    #[default]
    S8,
    /// 16 seconds
    S16,
}

/// Charge pump switching frequency.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, BitfieldSpecifier)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
#[bits = 3]
pub enum SwitchingFrequency {
    /// 200 kHz
    Khz200,
    /// 375 kHz
    Khz375,
    /// 500 kHz
    #[default]
    Khz500,
    /// 750 kHz
    Khz750,
    /// 1 MHz
    Khz1000,
    /// 1.25 MHz
    Khz1250,
    /// 1.5 MHz
    Khz1500,
    /// 1.75 MHz
    Khz1750,
}

/// CNTL1 contents.
#[bitfield(bits = 8)]
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub struct Control {
    /// Charging output enable.
    pub chg_en: bool,
    #[skip]
    __: B1,
    /// Watchdog enable.
    pub wdt_en: bool,
    #[bits = 2]
    pub wdt_timer: WatchdogTimer,
    #[skip]
    __: B3,
}

/// ADC channels. Each channel is a high/low register pair starting at [`Reg::ADC_BASE`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum AdcChannel {
    /// Thermistor voltage, mV.
    Thermistor = 0,
    /// Die temperature, 0.1 °C.
    DieTemp,
    /// Battery voltage, mV.
    Vbat,
    /// Output voltage, mV.
    Vout,
    /// Input current, mA.
    Ibus,
    /// Input voltage, mV.
    Vbus,
}

impl AdcChannel {
    pub(crate) const fn reg(self) -> Reg {
        Reg(Reg::ADC_BASE.0 + 2 * self as u8)
    }

    /// Combine the two halves of a 13-bit conversion result.
    pub const fn raw(high: u8, low: u8) -> u16 {
        ((high as u16) << 5) | ((low as u16) >> 3)
    }

    /// Convert a raw 13-bit result to the channel's physical unit.
    pub const fn convert(self, raw: u16) -> i32 {
        let raw = raw as i32;
        match self {
            AdcChannel::Thermistor => raw * 5 / 16,
            AdcChannel::DieTemp => raw * 5 / 16 - 400,
            AdcChannel::Vbat | AdcChannel::Vout | AdcChannel::Ibus => raw * 5 / 8,
            AdcChannel::Vbus => raw * 3 / 2,
        }
    }
}
