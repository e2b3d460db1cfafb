//! Fault classification.
//!
//! Interrupt flags are decoded into [`FaultEvent`]s and every event goes through one decision
//! table, [`FaultEvent::disposition`]. Phase tasks consult [`gate`] on entry, and the software
//! input over-current confirmation lives in [`OcpCheck`].

use bitflags::bitflags;
use heapless::Vec;

use crate::regs::{Control, Flags};

bitflags! {
    /// Causes of a session-fatal fault. Only the first one of a session is latched.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct ErrorCode: u32 {
        /// The device turned its output off while charging.
        const FORCED_OFF = 1 << 0;
        /// Battery voltage outside the window direct charging accepts.
        const INVALID_VBAT = 1 << 1;
        /// Input over-current confirmed by the software check.
        const IBUS_OCP = 1 << 2;
        /// The power source refused or failed a request.
        const SEND_PD_MSG = 1 << 3;
        /// VBUS could not be matched to the requested contract during preset.
        const FAILED_ADJUST = 1 << 4;
        /// Input over-voltage.
        const VBUS_OVP = 1 << 5;
        /// Reverse current blocking engaged while charging.
        const REVERSE_BLOCK = 1 << 6;
        /// The device watchdog expired.
        const WDT_EXPIRED = 1 << 7;
    }
}

#[cfg(feature = "defmt-03")]
impl defmt::Format for ErrorCode {
    fn format(&self, f: defmt::Formatter) {
        defmt::write!(f, "ErrorCode({=u32:#x})", self.bits())
    }
}

/// An interrupt source, decoded from the INT1/INT2 flags.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum FaultEvent {
    /// The device cleared its own output enable.
    ForcedCutoff,
    /// The battery voltage regulation loop engaged.
    VbatRegLoop,
    /// Reverse current blocking engaged.
    ReverseBlock,
    /// VBUS over-voltage.
    BusOvp,
    /// VBUS under-voltage lockout.
    BusUvlo,
    /// VBUS became valid.
    BusPok,
    /// The device watchdog expired.
    WatchdogExpired,
}

/// What the controller does about a [`FaultEvent`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum Disposition {
    /// Informational only.
    Log,
    /// Transient; the phase gate retries.
    Transient,
    /// Latch the cause and go to the error phase.
    Fatal(ErrorCode),
    /// Cancel everything and turn the output off right away.
    Teardown(ErrorCode),
}

impl FaultEvent {
    /// Decode the interrupt flags into events, in priority order.
    pub fn decode(flags: Flags) -> Vec<FaultEvent, 7> {
        let mut events = Vec::new();
        let table = [
            (flags.chg_off(), FaultEvent::ForcedCutoff),
            (flags.vbus_ovp(), FaultEvent::BusOvp),
            (flags.reverse_block(), FaultEvent::ReverseBlock),
            (flags.wdt_expired(), FaultEvent::WatchdogExpired),
            (flags.vbus_uvlo(), FaultEvent::BusUvlo),
            (flags.vbus_pok(), FaultEvent::BusPok),
            (flags.vbatreg(), FaultEvent::VbatRegLoop),
        ];
        for (set, event) in table {
            if set {
                // capacity matches the table
                let _ = events.push(event);
            }
        }
        events
    }

    /// The decision table for interrupt-reported events.
    ///
    /// `charging` is true while a session is running; `output_enabled` once PRESET turned the
    /// output on. A cutoff only counts as forced while the output is enabled.
    pub fn disposition(self, charging: bool, output_enabled: bool) -> Disposition {
        match self {
            FaultEvent::ForcedCutoff if output_enabled => Disposition::Teardown(ErrorCode::FORCED_OFF),
            FaultEvent::ReverseBlock if charging => Disposition::Fatal(ErrorCode::REVERSE_BLOCK),
            FaultEvent::BusOvp if charging => Disposition::Fatal(ErrorCode::VBUS_OVP),
            FaultEvent::WatchdogExpired if charging => Disposition::Fatal(ErrorCode::WDT_EXPIRED),
            FaultEvent::BusUvlo => Disposition::Transient,
            _ => Disposition::Log,
        }
    }
}

/// Outcome of the fault check a phase task runs before doing its own work.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum Gate {
    /// No fault, carry on.
    Proceed,
    /// Transient condition, re-run the same phase after the retry delay.
    Retry,
    /// Session-fatal fault.
    Fault(ErrorCode),
}

/// Classify the live device state at the start of a phase task.
///
/// `vbat` is the measured battery voltage in mV; it is only judged while the output is enabled,
/// before that the battery window is checked by CHECK_VBAT and PRESET themselves.
pub fn gate(status: Flags, control: Control, output_enabled: bool, vbat: i32, vbat_min: u16) -> Gate {
    if output_enabled && (status.chg_off() || !control.chg_en()) {
        Gate::Fault(ErrorCode::FORCED_OFF)
    } else if status.vbus_ovp() {
        Gate::Fault(ErrorCode::VBUS_OVP)
    } else if status.reverse_block() {
        Gate::Fault(ErrorCode::REVERSE_BLOCK)
    } else if status.wdt_expired() {
        Gate::Fault(ErrorCode::WDT_EXPIRED)
    } else if status.vbus_uvlo() {
        Gate::Retry
    } else if output_enabled && vbat < vbat_min as i32 {
        Gate::Fault(ErrorCode::INVALID_VBAT)
    } else {
        Gate::Proceed
    }
}

/// Number of consecutive current-limited samples that confirm an over-current.
pub const OCP_STRIKES: u8 = 3;

/// Verdict of one [`OcpCheck`] sample.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum OcpVerdict {
    /// The limit loop is not active.
    Clear,
    /// First detection: lower the contract current one step.
    StepDown,
    /// Still limited after stepping down; sample again later.
    Suspect(u8),
    /// Over-current confirmed.
    Confirmed,
}

/// Software confirmation layered on the input current limit loop.
///
/// The first current-limited sample asks for the contract current to be lowered. Every further
/// consecutive limited sample is a strike, and [`OCP_STRIKES`] strikes confirm an over-current.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub struct OcpCheck {
    strikes: u8,
}

impl OcpCheck {
    /// Feed one sample. `stepped_down` says whether the contract current has already been
    /// lowered in response to the limit loop.
    pub fn sample(&mut self, limited: bool, stepped_down: bool) -> OcpVerdict {
        if !limited {
            self.strikes = 0;
            return OcpVerdict::Clear;
        }
        if !stepped_down {
            return OcpVerdict::StepDown;
        }
        self.strikes += 1;
        if self.strikes >= OCP_STRIKES {
            OcpVerdict::Confirmed
        } else {
            OcpVerdict::Suspect(self.strikes)
        }
    }

    /// Strikes counted so far.
    pub fn strikes(&self) -> u8 {
        self.strikes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_orders_by_priority() {
        let flags = Flags::new()
            .with_vbatreg(true)
            .with_chg_off(true)
            .with_vbus_pok(true);
        assert_eq!(
            FaultEvent::decode(flags).as_slice(),
            [FaultEvent::ForcedCutoff, FaultEvent::BusPok, FaultEvent::VbatRegLoop]
        );
        assert!(FaultEvent::decode(Flags::new()).is_empty());
    }

    #[test]
    fn decision_table() {
        use Disposition::*;
        use FaultEvent::*;

        assert_eq!(ForcedCutoff.disposition(true, true), Teardown(ErrorCode::FORCED_OFF));
        assert_eq!(ForcedCutoff.disposition(true, false), Log);
        assert_eq!(ForcedCutoff.disposition(false, false), Log);
        assert_eq!(BusOvp.disposition(true, false), Fatal(ErrorCode::VBUS_OVP));
        assert_eq!(ReverseBlock.disposition(true, true), Fatal(ErrorCode::REVERSE_BLOCK));
        assert_eq!(WatchdogExpired.disposition(true, true), Fatal(ErrorCode::WDT_EXPIRED));
        assert_eq!(WatchdogExpired.disposition(false, false), Log);
        assert_eq!(BusUvlo.disposition(true, true), Transient);
        assert_eq!(BusUvlo.disposition(false, false), Transient);
        assert_eq!(VbatRegLoop.disposition(true, true), Log);
        assert_eq!(BusPok.disposition(true, true), Log);
    }

    #[test]
    fn gate_checks_in_order() {
        let on = Control::new().with_chg_en(true);
        let ok = Flags::new().with_vbus_pok(true);

        assert_eq!(gate(ok, on, true, 3800, 3400), Gate::Proceed);
        assert_eq!(gate(ok, Control::new(), true, 3800, 3400), Gate::Fault(ErrorCode::FORCED_OFF));
        assert_eq!(gate(ok, Control::new(), false, 0, 3400), Gate::Proceed);
        assert_eq!(
            gate(ok.with_vbus_uvlo(true).with_vbus_ovp(true), on, true, 3800, 3400),
            Gate::Fault(ErrorCode::VBUS_OVP)
        );
        assert_eq!(gate(ok.with_vbus_uvlo(true), on, true, 3800, 3400), Gate::Retry);
        assert_eq!(gate(ok, on, true, 3300, 3400), Gate::Fault(ErrorCode::INVALID_VBAT));
        assert_eq!(gate(ok.with_wdt_expired(true), on, false, 0, 3400), Gate::Fault(ErrorCode::WDT_EXPIRED));
    }

    #[test]
    fn ocp_needs_three_strikes_after_step_down() {
        let mut ocp = OcpCheck::default();
        assert_eq!(ocp.sample(true, false), OcpVerdict::StepDown);
        assert_eq!(ocp.sample(true, true), OcpVerdict::Suspect(1));
        assert_eq!(ocp.sample(true, true), OcpVerdict::Suspect(2));
        assert_eq!(ocp.sample(true, true), OcpVerdict::Confirmed);
    }

    #[test]
    fn ocp_strikes_reset_when_loop_clears() {
        let mut ocp = OcpCheck::default();
        ocp.sample(true, true);
        ocp.sample(true, true);
        assert_eq!(ocp.sample(false, true), OcpVerdict::Clear);
        assert_eq!(ocp.strikes(), 0);
        assert_eq!(ocp.sample(true, true), OcpVerdict::Suspect(1));
    }
}
