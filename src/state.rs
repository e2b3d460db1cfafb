//! Session state guarded by the state lock.

use crate::fault::{ErrorCode, OcpCheck};
use crate::goals::{ControlGoals, Setpoints};
use crate::sched::{Delay, Work, WorkQueue};

/// Charging phase.
///
/// Phases from [`Phase::CheckVbat`] onwards are charging-active. [`Phase::ChgOff`],
/// [`Phase::Error`] and [`Phase::Eoc`] end a session.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum Phase {
    /// Not charging.
    #[default]
    ChgOff,
    /// A session-fatal fault was latched.
    Error,
    /// End of charge, signalled by the host.
    Eoc,
    /// Waiting for the switching charger to step aside and validating the battery.
    CheckVbat,
    /// Negotiating the initial contract and enabling the output.
    Preset,
    /// Ramping the input current up to its goal.
    PreCc,
    /// Applying changed targets.
    UpdateBat,
    /// Constant current.
    Cc,
    /// Constant voltage.
    Cv,
}

impl Phase {
    /// True for the phases of a running session.
    pub fn is_charging(self) -> bool {
        self >= Phase::CheckVbat
    }

    /// Short human-readable name.
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::ChgOff => "off",
            Phase::Error => "error",
            Phase::Eoc => "eoc",
            Phase::CheckVbat => "check-vbat",
            Phase::Preset => "preset",
            Phase::PreCc => "pre-cc",
            Phase::UpdateBat => "update-bat",
            Phase::Cc => "cc",
            Phase::Cv => "cv",
        }
    }
}

/// Targets set by the host policy.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub struct Targets {
    /// Battery voltage, mV.
    pub vbat: u16,
    /// Battery current, mA.
    pub ibat: u16,
    /// Input current, mA.
    pub ibus: u16,
    /// Upper bound for [`Targets::vbat`], mV.
    pub vbat_max: u16,
}

impl Default for Targets {
    fn default() -> Self {
        Targets {
            vbat: 4350,
            ibat: 4000,
            ibus: 2000,
            vbat_max: 4400,
        }
    }
}

impl Targets {
    /// The input current to negotiate: the input target, further limited by half the battery
    /// current target.
    pub fn input_current(&self) -> u16 {
        self.ibus.min(self.ibat / 2)
    }
}

/// Target changes waiting for UPDATE_BAT.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub struct UpdateFlags {
    /// Battery voltage target changed.
    pub voltage: bool,
    /// Input current target changed.
    pub input_current: bool,
    /// Battery current target changed.
    pub battery_current: bool,
}

impl UpdateFlags {
    /// True if any flag is set.
    pub fn any(&self) -> bool {
        self.voltage || self.input_current || self.battery_current
    }

    /// True if exactly one of the voltage and input current flags arrived.
    pub fn partial(&self) -> bool {
        self.voltage != self.input_current
    }

    /// Take all flags, leaving them cleared.
    pub fn take(&mut self) -> UpdateFlags {
        core::mem::take(self)
    }
}

/// Loop adjustment memory, reset on every PRESET.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub struct LoopMemory {
    /// Contract current was lowered for the input limit loop.
    pub c_down: bool,
    /// Contract current was raised on the last tick.
    pub c_up: bool,
    /// Contract voltage was lowered for the voltage loop.
    pub v_down: bool,
    /// Contract voltage was raised on the last tick.
    pub v_up: bool,
    /// Difference between the measured and requested VBUS found during preset, mV.
    pub v_offset: i32,
    /// VBUS sample of the previous tick, mV.
    pub prev_vbus: i32,
    /// IBUS sample of the previous tick, mA.
    pub prev_ibus: i32,
    /// Software over-current confirmation.
    pub ocp: OcpCheck,
    /// UPDATE_BAT already waited for the second flag.
    pub update_waited: bool,
}

impl LoopMemory {
    /// True when the previous tick stepped the contract up but neither sample moved since.
    pub fn feedback_stale(&self, vbus: i32, ibus: i32) -> bool {
        (self.v_up || self.c_up) && vbus == self.prev_vbus && ibus == self.prev_ibus
    }

    /// Remember this tick's samples.
    pub fn record(&mut self, vbus: i32, ibus: i32) {
        self.prev_vbus = vbus;
        self.prev_ibus = ibus;
    }
}

/// Everything the state lock guards.
#[derive(Debug, Clone)]
pub struct ChargerState {
    /// Current phase.
    pub phase: Phase,
    /// Latched fault cause, empty while no fault happened in this session.
    pub error_code: ErrorCode,
    /// Host targets.
    pub targets: Targets,
    /// Values last written to VBATREG/IBUSLIM/IBATREG.
    pub setpoints: Setpoints,
    /// Goals of the running session.
    pub goals: ControlGoals,
    /// Target changes not yet applied.
    pub pending: UpdateFlags,
    /// Loop adjustment memory of the running session.
    pub mem: LoopMemory,
    /// CC ticks in this session.
    pub cc_ticks: u32,
    /// Consecutive CV ticks with the voltage loop inactive.
    pub cv_idle_ticks: u32,
    /// The charging output is enabled.
    pub output_enabled: bool,
    /// Session token. Bumped whenever pending work is cancelled.
    pub token: u32,
    /// Queued phase work.
    pub queue: WorkQueue,
}

impl Default for ChargerState {
    fn default() -> Self {
        ChargerState {
            phase: Phase::ChgOff,
            error_code: ErrorCode::empty(),
            targets: Targets::default(),
            setpoints: Setpoints::default(),
            goals: ControlGoals::default(),
            pending: UpdateFlags::default(),
            mem: LoopMemory::default(),
            cc_ticks: 0,
            cv_idle_ticks: 0,
            output_enabled: false,
            token: 0,
            queue: WorkQueue::new(),
        }
    }
}

impl ChargerState {
    /// Whether `work` still belongs to the running session and its phase is still current.
    pub fn is_current(&self, work: &Work) -> bool {
        work.token == self.token && work.phase == self.phase
    }

    /// Drop all queued work and invalidate work that is already running.
    pub fn cancel(&mut self) -> usize {
        self.token = self.token.wrapping_add(1);
        self.queue.cancel_all()
    }

    /// Reset per-session memory for a new session.
    pub fn begin_session(&mut self) {
        self.cancel();
        self.error_code = ErrorCode::empty();
        self.pending = UpdateFlags::default();
        self.mem = LoopMemory::default();
        self.cc_ticks = 0;
        self.cv_idle_ticks = 0;
    }

    /// Move to `phase` and queue it. Refused once the session has failed.
    pub fn request(&mut self, phase: Phase, delay: Delay) -> bool {
        if self.phase == Phase::Error && phase != Phase::Error {
            return false;
        }
        self.phase = phase;
        self.queue.schedule(phase, delay, self.token)
    }

    /// Commit the transition requested by a finished `work` item.
    ///
    /// Nothing happens when the work went stale while it ran.
    pub fn commit(&mut self, work: &Work, phase: Phase, delay: Delay) -> bool {
        if !self.is_current(work) {
            return false;
        }
        self.request(phase, delay)
    }

    /// Latch `code` and move to ERR.
    ///
    /// Returns `false` without touching anything if a fault is already latched.
    pub fn latch(&mut self, code: ErrorCode) -> bool {
        if !self.error_code.is_empty() || self.phase == Phase::Error {
            return false;
        }
        self.error_code = code;
        self.cancel();
        self.phase = Phase::Error;
        true
    }
}
