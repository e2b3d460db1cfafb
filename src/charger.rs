//! The direct-charge controller.
//!
//! A session walks CHECK_VBAT → PRESET → PRE_CC → CC → CV. Every phase is a unit of work in the
//! [`WorkQueue`](crate::sched::WorkQueue): it samples the device, maybe adjusts the source
//! contract, and asks for itself or another phase to be queued again after a [`Delay`].
//! Nothing blocks between ticks; the firmware calls [`DirectCharger::poll`] whenever the
//! deadline returned by the previous call passes, and [`DirectCharger::handle_irq`] when the
//! interrupt line asserts.
//!
//! Three locks are involved. The state lock is a blocking mutex that is never held across an
//! `.await`; phase, error code, targets, goals and the queue live behind it. The register bus
//! and the negotiator each have their own async mutex. A fourth async mutex is held while a
//! phase runs so that stopping a session can wait for the running phase to finish before the
//! output is turned off.

use core::cell::RefCell;

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::blocking_mutex::Mutex as BlockingMutex;
use embassy_sync::mutex::Mutex;
use embedded_hal_async::delay::DelayNs;
use embedded_hal_async::i2c::I2c;

use crate::config::Config;
use crate::device::Sm5440;
use crate::fault::{self, Disposition, ErrorCode, FaultEvent, Gate, OcpVerdict};
use crate::goals::{compute_goals, round_to_step, ControlGoals, Setpoints, PPS_C_STEP, PPS_V_STEP};
use crate::host::SwitchingCharger;
use crate::regs::{AdcChannel, Flags, DEVICE_ID};
use crate::sched::{Delay, Work};
use crate::source::{Negotiator, PowerSource, SourceContract};
use crate::state::{ChargerState, LoopMemory, Phase, Targets, UpdateFlags};

/// PRESET refuses batteries more than this above the VBATREG setpoint, mV.
const PRESET_VBAT_MARGIN: i32 = 50;
/// Wait between contract corrections while matching VBUS in PRESET.
const PRESET_SETTLE_MS: u32 = 250;
/// CV falls back to PRE_CC when the battery sags this far below the voltage goal, mV.
const CV_VBAT_DROP: i32 = 150;
/// CV re-sends an unchanged contract every this many idle ticks.
const CV_KEEPALIVE_TICKS: u32 = 4;
const MAX_RUNS_PER_POLL: usize = 16;

/// Controller errors returned to the host.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Error<E> {
    /// Register access failed.
    I2c(E),
    /// The request does not fit the current phase.
    InvalidState(Phase),
    /// The device ID register did not read [`DEVICE_ID`].
    InvalidDevice(u8),
}

#[cfg(feature = "defmt-03")]
impl<E> defmt::Format for Error<E> {
    fn format(&self, f: defmt::Formatter) {
        match self {
            Error::I2c(_) => defmt::write!(f, "I2c(..)"),
            Error::InvalidState(p) => defmt::write!(f, "InvalidState({})", p),
            Error::InvalidDevice(id) => defmt::write!(f, "InvalidDevice({=u8:#x})", id),
        }
    }
}

/// What a phase task wants next.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Step {
    /// Queue `Phase` after `Delay`.
    Goto(Phase, Delay),
    /// Latch a fault.
    Fail(ErrorCode),
    /// Nothing more to do.
    Done,
}

macro_rules! attempt {
    ($e:expr) => {
        match $e {
            Ok(v) => v,
            Err(step) => return Ok(step),
        }
    };
}

/// Direct-charge controller for one SM5440.
///
/// `M` is the raw mutex used for every lock, `I2C` the bus, `P` the power source, `S` the
/// switching charger that has to step aside while direct charging, and `D` the delay used for
/// the short waits inside a phase.
pub struct DirectCharger<M: RawMutex, I2C, P, S, D> {
    config: Config,
    state: BlockingMutex<M, RefCell<ChargerState>>,
    device: Mutex<M, Sm5440<I2C>>,
    negotiator: Mutex<M, Negotiator<P>>,
    switcher: Mutex<M, S>,
    running: Mutex<M, ()>,
    delay: D,
}

impl<M, I2C, P, S, D> DirectCharger<M, I2C, P, S, D>
where
    M: RawMutex,
    I2C: I2c,
    P: PowerSource,
    S: SwitchingCharger,
    D: DelayNs + Clone,
{
    /// Create a new `DirectCharger`
    pub fn new(config: Config, i2c: I2C, source: P, switcher: S, delay: D) -> Self {
        DirectCharger {
            config,
            state: BlockingMutex::new(RefCell::new(ChargerState::default())),
            device: Mutex::new(Sm5440::new(i2c)),
            negotiator: Mutex::new(Negotiator::new(source)),
            switcher: Mutex::new(switcher),
            running: Mutex::new(()),
            delay,
        }
    }

    /// The configuration this charger was built with.
    pub fn config(&self) -> &Config {
        &self.config
    }

    pub(crate) fn with_state<R>(&self, f: impl FnOnce(&mut ChargerState) -> R) -> R {
        self.state.lock(|s| f(&mut s.borrow_mut()))
    }

    pub(crate) async fn contract(&self) -> Option<SourceContract> {
        self.negotiator.lock().await.contract()
    }

    /// Check the device ID and put the device in a known idle state.
    pub async fn init(&self) -> Result<(), Error<I2C::Error>> {
        let mut dev = self.device.lock().await;
        let id = dev.device_id().await.map_err(Error::I2c)?;
        if id != DEVICE_ID {
            return Err(Error::InvalidDevice(id));
        }
        dev.enable_charging(false).await.map_err(Error::I2c)?;
        dev.set_watchdog(None).await.map_err(Error::I2c)?;
        dev.enable_adc(false).await.map_err(Error::I2c)?;
        dev.set_frequency(self.config.freq).await.map_err(Error::I2c)?;
        let irqs = Flags::new()
            .with_vbatreg(true)
            .with_reverse_block(true)
            .with_chg_off(true)
            .with_vbus_ovp(true)
            .with_vbus_uvlo(true)
            .with_vbus_pok(true)
            .with_wdt_expired(true);
        dev.set_irq_mask(irqs).await.map_err(Error::I2c)?;
        dev.interrupts().await.map_err(Error::I2c)?;
        info!("sm5440: ready, id {}", id);
        Ok(())
    }

    /// Start a charging session at CHECK_VBAT.
    ///
    /// Only possible from CHG_OFF or EOC. After a fault the host has to call
    /// [`DirectCharger::stop_charging`] first.
    pub async fn start_charging(&self) -> Result<(), Error<I2C::Error>> {
        let phase = self.with_state(|s| s.phase);
        if !matches!(phase, Phase::ChgOff | Phase::Eoc) {
            return Err(Error::InvalidState(phase));
        }
        self.negotiator.lock().await.reset();
        self.device
            .lock()
            .await
            .enable_adc(true)
            .await
            .map_err(Error::I2c)?;
        self.with_state(|s| {
            if !matches!(s.phase, Phase::ChgOff | Phase::Eoc) {
                return Err(Error::InvalidState(s.phase));
            }
            s.begin_session();
            s.request(Phase::CheckVbat, Delay::None);
            Ok(())
        })?;
        info!("session: start");
        Ok(())
    }

    /// Stop charging.
    ///
    /// Queued phases are cancelled first, then a phase that is already running is waited for,
    /// and only then the output is turned off. No phase runs after this returns.
    pub async fn stop_charging(&self) -> Result<(), Error<I2C::Error>> {
        self.end_session(Phase::ChgOff).await
    }

    /// End the session because the host policy detected end of charge.
    pub async fn signal_eoc(&self) -> Result<(), Error<I2C::Error>> {
        self.end_session(Phase::Eoc).await
    }

    async fn end_session(&self, phase: Phase) -> Result<(), Error<I2C::Error>> {
        let (cancelled, from) = self.with_state(|s| {
            let from = s.phase;
            let n = s.cancel();
            s.phase = phase;
            s.pending = UpdateFlags::default();
            (n, from)
        });
        debug!("session: {:?} -> {:?}, cancelled {}", from, phase, cancelled);

        let _running = self.running.lock().await;
        self.shutdown(true).await.map_err(Error::I2c)?;
        self.negotiator.lock().await.reset();
        info!("session: stopped ({:?})", phase);
        Ok(())
    }

    async fn shutdown(&self, adc_off: bool) -> Result<(), I2C::Error> {
        let mut dev = self.device.lock().await;
        dev.enable_charging(false).await?;
        self.with_state(|s| s.output_enabled = false);
        dev.set_watchdog(None).await?;
        if adc_off {
            dev.enable_adc(false).await?;
        }
        Ok(())
    }

    /// Set the battery voltage target, mV. Clamped to the maximum battery voltage.
    pub fn set_target_vbat(&self, millivolts: u16) {
        self.update_targets(|t, f| {
            let vbat = millivolts.min(t.vbat_max);
            f.voltage = vbat != t.vbat;
            t.vbat = vbat;
        })
    }

    /// Set the battery current target, mA.
    pub fn set_target_ibat(&self, milliamps: u16) {
        self.update_targets(|t, f| {
            f.battery_current = milliamps != t.ibat;
            t.ibat = milliamps;
        })
    }

    /// Set the input current target, mA.
    pub fn set_target_ibus(&self, milliamps: u16) {
        self.update_targets(|t, f| {
            f.input_current = milliamps != t.ibus;
            t.ibus = milliamps;
        })
    }

    /// Set the maximum battery voltage, mV. Lowers the voltage target if it is above.
    pub fn set_max_vbat(&self, millivolts: u16) {
        self.update_targets(|t, f| {
            t.vbat_max = millivolts;
            if t.vbat > millivolts {
                t.vbat = millivolts;
                f.voltage = true;
            }
        })
    }

    fn update_targets(&self, f: impl FnOnce(&mut Targets, &mut UpdateFlags)) {
        self.with_state(|s| {
            let mut changed = UpdateFlags::default();
            f(&mut s.targets, &mut changed);
            if !changed.any() {
                return;
            }
            s.pending.voltage |= changed.voltage;
            s.pending.input_current |= changed.input_current;
            s.pending.battery_current |= changed.battery_current;
            match s.phase {
                Phase::PreCc | Phase::Cc | Phase::Cv => {
                    debug!("targets: changed in {:?}, updating", s.phase);
                    s.request(Phase::UpdateBat, Delay::None);
                }
                // picked up when the running phase finishes
                Phase::Preset | Phase::UpdateBat => {}
                _ => s.pending = UpdateFlags::default(),
            }
        })
    }

    /// Service the interrupt line.
    ///
    /// Runs independently of the queued phases. A forced cutoff while the output is enabled
    /// cancels all work and turns the output off before returning.
    pub async fn handle_irq(&self) -> Result<(), Error<I2C::Error>> {
        let flags = self
            .device
            .lock()
            .await
            .interrupts()
            .await
            .map_err(Error::I2c)?;
        let (charging, output_enabled) = self.with_state(|s| (s.phase.is_charging(), s.output_enabled));
        for event in FaultEvent::decode(flags) {
            match event.disposition(charging, output_enabled) {
                Disposition::Log => debug!("irq: {:?}", event),
                Disposition::Transient => warn!("irq: {:?}", event),
                Disposition::Fatal(code) => {
                    if !self.with_state(|s| Self::fail(s, code)) {
                        warn!("irq: {:?} ignored, fault already latched", event);
                    }
                }
                Disposition::Teardown(code) => {
                    if self.with_state(|s| s.latch(code)) {
                        error!("irq: {:?}, output off", event);
                        self.shutdown(true).await.map_err(Error::I2c)?;
                    } else {
                        warn!("irq: {:?} ignored, fault already latched", event);
                    }
                }
            }
        }
        Ok(())
    }

    fn fail(s: &mut ChargerState, code: ErrorCode) -> bool {
        if !s.latch(code) {
            return false;
        }
        error!("fault: {:?} in session {}", code, s.token);
        s.queue.schedule(Phase::Error, Delay::None, s.token);
        true
    }

    /// Clock value at which the next queued phase becomes due.
    pub fn next_deadline(&self) -> Option<u64> {
        self.with_state(|s| s.queue.next_due())
    }

    /// Run every phase that is due at `now_ms` and return the next deadline.
    pub async fn poll(&self, now_ms: u64) -> Option<u64> {
        for _ in 0..MAX_RUNS_PER_POLL {
            if self.run_next(now_ms).await.is_none() {
                break;
            }
        }
        self.next_deadline()
    }

    /// Run at most one due phase. Returns the phase that was taken off the queue.
    pub async fn run_next(&self, now_ms: u64) -> Option<Phase> {
        let _running = self.running.lock().await;
        let work = self.with_state(|s| s.queue.pop_due(now_ms))?;
        if !self.is_current(&work) {
            trace!("work: dropping stale {:?}", work.phase);
            return Some(work.phase);
        }

        let step = match self.run_phase(&work).await {
            Ok(step) => step,
            Err(_) => {
                warn!("{}: bus error, retrying", work.phase.as_str());
                Step::Goto(work.phase, Delay::Retry)
            }
        };

        match step {
            Step::Goto(phase, delay) => {
                if self.with_state(|s| s.commit(&work, phase, delay)) && phase != work.phase {
                    debug!("phase: {:?} -> {:?}", work.phase, phase);
                }
            }
            Step::Fail(code) => {
                self.with_state(|s| s.is_current(&work) && Self::fail(s, code));
            }
            Step::Done => {}
        }
        Some(work.phase)
    }

    fn is_current(&self, work: &Work) -> bool {
        self.with_state(|s| s.is_current(work))
    }

    async fn run_phase(&self, work: &Work) -> Result<Step, I2C::Error> {
        match work.phase {
            Phase::CheckVbat => self.check_vbat(work).await,
            Phase::Preset => self.preset(work).await,
            Phase::PreCc => self.pre_cc(work).await,
            Phase::Cc => self.cc(work).await,
            Phase::Cv => self.cv(work).await,
            Phase::UpdateBat => self.update_bat(work).await,
            Phase::Error => self.error_phase().await,
            Phase::ChgOff | Phase::Eoc => Ok(Step::Done),
        }
    }

    /// Read an ADC channel. Reads 0 outside a session, when the ADC is powered down.
    pub(crate) async fn adc(&self, channel: AdcChannel) -> Result<i32, I2C::Error> {
        if !self.with_state(|s| s.phase.is_charging()) {
            return Ok(0);
        }
        self.device.lock().await.read_adc(channel).await
    }

    async fn gate(&self, work: &Work) -> Result<Option<Step>, I2C::Error> {
        let (status, control) = {
            let mut dev = self.device.lock().await;
            (dev.status().await?, dev.control().await?)
        };
        let vbat = self.adc(AdcChannel::Vbat).await?;
        let output_enabled = self.with_state(|s| s.output_enabled);
        match fault::gate(status, control, output_enabled, vbat, self.config.vbat_min) {
            Gate::Proceed => Ok(None),
            Gate::Retry => {
                warn!("{}: vbus uvlo, retrying", work.phase.as_str());
                Ok(Some(Step::Goto(work.phase, Delay::Retry)))
            }
            Gate::Fault(code) => Ok(Some(Step::Fail(code))),
        }
    }

    async fn request(&self, work: &Work, millivolts: u16, milliamps: u16) -> Result<SourceContract, Step> {
        if !self.is_current(work) {
            return Err(Step::Done);
        }
        let mut delay = self.delay.clone();
        self.negotiator
            .lock()
            .await
            .request_contract(millivolts, milliamps, &mut delay)
            .await
            .map_err(|_| Step::Fail(ErrorCode::SEND_PD_MSG))
    }

    async fn session_contract(&self) -> Result<SourceContract, Step> {
        self.contract().await.ok_or(Step::Fail(ErrorCode::SEND_PD_MSG))
    }

    async fn write_setpoints(&self, work: &Work, goals: ControlGoals, sp: Setpoints) -> Result<bool, I2C::Error> {
        if !self.is_current(work) {
            return Ok(false);
        }
        let mut dev = self.device.lock().await;
        dev.set_vbatreg(sp.battery_voltage_limit).await?;
        dev.set_ibuslim(sp.input_current_limit).await?;
        dev.set_ibatreg(sp.battery_current_limit).await?;
        self.with_state(|s| {
            s.goals = goals;
            s.setpoints = sp;
        });
        debug!(
            "setpoints: vbatreg {} ibuslim {} ibatreg {}",
            sp.battery_voltage_limit,
            sp.input_current_limit,
            sp.battery_current_limit
        );
        Ok(true)
    }

    fn store_mem(&self, work: &Work, mem: LoopMemory) {
        self.with_state(|s| {
            if s.is_current(work) {
                s.mem = mem;
            }
        })
    }

    async fn check_vbat(&self, work: &Work) -> Result<Step, I2C::Error> {
        if let Some(step) = self.gate(work).await? {
            return Ok(step);
        }

        {
            let mut neg = self.negotiator.lock().await;
            if neg.contract().is_none() {
                let mut delay = self.delay.clone();
                if neg
                    .discover_max_power(self.config.ta_min_voltage, &mut delay)
                    .await
                    .is_err()
                {
                    return Ok(Step::Fail(ErrorCode::SEND_PD_MSG));
                }
            }
        }

        {
            let mut switcher = self.switcher.lock().await;
            if switcher.is_enabled().await {
                info!("check-vbat: switching charger active, asking it to stop");
                switcher.set_enabled(false).await;
                return Ok(Step::Goto(Phase::CheckVbat, Delay::AdcUpdate));
            }
        }

        let vbat = self.adc(AdcChannel::Vbat).await?;
        if vbat < self.config.vbat_min as i32 {
            error!("check-vbat: vbat {}mV below {}mV", vbat, self.config.vbat_min);
            return Ok(Step::Fail(ErrorCode::INVALID_VBAT));
        }
        debug!("check-vbat: vbat {}mV", vbat);
        Ok(Step::Goto(Phase::Preset, Delay::None))
    }

    async fn preset(&self, work: &Work) -> Result<Step, I2C::Error> {
        let contract = attempt!(self.session_contract().await);
        let targets = self.with_state(|s| {
            s.mem = LoopMemory::default();
            s.pending.take();
            s.targets
        });

        let goals = compute_goals(targets.vbat, targets.input_current(), contract.max_current);
        let sp = goals.setpoints(&self.config.calibration());
        if !self.write_setpoints(work, goals, sp).await? {
            return Ok(Step::Done);
        }

        let vbat = self.adc(AdcChannel::Vbat).await?;
        if vbat > sp.battery_voltage_limit as i32 + PRESET_VBAT_MARGIN {
            error!("preset: vbat {}mV above vbatreg {}mV", vbat, sp.battery_voltage_limit);
            return Ok(Step::Fail(ErrorCode::INVALID_VBAT));
        }

        let v_min = self.config.ta_min_voltage;
        let ideal = 2 * vbat.max(0) as u32 + self.config.ir_drop(goals.ci);
        let target = (round_to_step(ideal, PPS_V_STEP as u32) as u16).clamp(v_min, contract.max_voltage.max(v_min));
        let current = goals
            .ci
            .min(contract.current_ceiling(target, PPS_C_STEP))
            .max(self.config.ta_min_current);

        let mut v = target;
        attempt!(self.request(work, v, current).await);

        let status = self.device.lock().await.status().await?;
        if status.loops_inactive() {
            let mut delay = self.delay.clone();
            let mut corrections = 0;
            loop {
                delay.delay_ms(PRESET_SETTLE_MS).await;
                let vbus = self.adc(AdcChannel::Vbus).await?;
                let diff = target as i32 - vbus;
                if diff.abs() < PPS_V_STEP as i32 {
                    break;
                }
                if corrections >= self.config.adjust_retry_limit {
                    error!("preset: vbus {}mV never reached {}mV", vbus, target);
                    return Ok(Step::Fail(ErrorCode::FAILED_ADJUST));
                }
                corrections += 1;
                let stepped = if diff > 0 {
                    v.saturating_add(PPS_V_STEP)
                } else {
                    v.saturating_sub(PPS_V_STEP)
                };
                v = stepped.clamp(v_min, contract.max_voltage.max(v_min));
                trace!("preset: vbus {}mV, contract {}mV", vbus, v);
                attempt!(self.request(work, v, current).await);
            }
        }

        {
            let mut dev = self.device.lock().await;
            if !self.is_current(work) {
                return Ok(Step::Done);
            }
            dev.set_watchdog(self.config.wdt_timer).await?;
            dev.enable_charging(true).await?;
        }
        // targets changed while presetting are applied before ramping up
        let next = self.with_state(|s| {
            s.output_enabled = true;
            s.mem.v_offset = v as i32 - target as i32;
            if s.pending.any() {
                Step::Goto(Phase::UpdateBat, Delay::None)
            } else {
                Step::Goto(Phase::PreCc, Delay::AdcUpdate)
            }
        });
        info!(
            "preset: {}mV {}mA, vbat {}mV, goals cv {} ci {} cc {}",
            v,
            current,
            vbat,
            goals.cv,
            goals.ci,
            goals.cc
        );
        Ok(next)
    }

    /// Handle an active input current limit loop in PRE_CC or CC.
    async fn input_limited(&self, work: &Work, mut mem: LoopMemory, contract: SourceContract) -> Result<Step, I2C::Error> {
        let phase = work.phase;
        match mem.ocp.sample(true, mem.c_down) {
            OcpVerdict::StepDown => {
                let c = contract
                    .requested_current
                    .saturating_sub(PPS_C_STEP)
                    .max(self.config.ta_min_current);
                warn!("{}: input limited, contract current {}mA", phase.as_str(), c);
                attempt!(self.request(work, contract.requested_voltage, c).await);
                mem.c_down = true;
                mem.c_up = false;
                self.store_mem(work, mem);
                Ok(Step::Goto(phase, Delay::Ocp))
            }
            OcpVerdict::Suspect(strikes) => {
                warn!("{}: still input limited ({})", phase.as_str(), strikes);
                self.store_mem(work, mem);
                Ok(Step::Goto(phase, Delay::Ocp))
            }
            OcpVerdict::Confirmed => {
                error!("{}: input over-current", phase.as_str());
                Ok(Step::Fail(ErrorCode::IBUS_OCP))
            }
            OcpVerdict::Clear => Ok(Step::Goto(phase, Delay::AdcUpdate)),
        }
    }

    async fn pre_cc(&self, work: &Work) -> Result<Step, I2C::Error> {
        if let Some(step) = self.gate(work).await? {
            return Ok(step);
        }
        let status = self.device.lock().await.status().await?;
        if status.vbatreg() {
            return Ok(Step::Goto(Phase::Cv, Delay::None));
        }

        let contract = attempt!(self.session_contract().await);
        let (goals, mut mem) = self.with_state(|s| (s.goals, s.mem));
        if status.ibuslim() {
            return self.input_limited(work, mem, contract).await;
        }
        mem.ocp.sample(false, mem.c_down);

        let vbus = self.adc(AdcChannel::Vbus).await?;
        let ibus = self.adc(AdcChannel::Ibus).await?;
        if mem.feedback_stale(vbus, ibus) {
            trace!("pre-cc: feedback not updated yet");
            mem.v_up = false;
            mem.c_up = false;
            self.store_mem(work, mem);
            return Ok(Step::Goto(Phase::PreCc, Delay::AdcUpdate));
        }
        mem.record(vbus, ibus);
        mem.v_up = false;
        mem.c_up = false;

        if ibus + PPS_C_STEP as i32 >= goals.ci as i32 {
            self.store_mem(work, mem);
            return Ok(Step::Goto(Phase::Cc, Delay::None));
        }

        let v = contract.requested_voltage;
        let c = contract.requested_current;
        let (v, c) = if c < goals.ci && contract.allows(v, c + PPS_C_STEP) {
            mem.c_up = true;
            (v, c + PPS_C_STEP)
        } else if contract.allows(v + PPS_V_STEP, c) {
            mem.v_up = true;
            (v + PPS_V_STEP, c)
        } else {
            info!("pre-cc: contract at the source ceiling, ibus {}mA", ibus);
            self.store_mem(work, mem);
            return Ok(Step::Goto(Phase::Cc, Delay::None));
        };
        attempt!(self.request(work, v, c).await);
        self.store_mem(work, mem);
        trace!("pre-cc: ibus {}mA -> {}mV {}mA", ibus, v, c);
        Ok(Step::Goto(Phase::PreCc, Delay::AdcUpdate))
    }

    async fn cc(&self, work: &Work) -> Result<Step, I2C::Error> {
        if let Some(step) = self.gate(work).await? {
            return Ok(step);
        }
        let status = self.device.lock().await.status().await?;
        if status.vbatreg() {
            return Ok(Step::Goto(Phase::Cv, Delay::None));
        }

        let contract = attempt!(self.session_contract().await);
        let (goals, mut mem) = self.with_state(|s| (s.goals, s.mem));
        if status.ibuslim() {
            return self.input_limited(work, mem, contract).await;
        }
        mem.ocp.sample(false, mem.c_down);

        let ibus = self.adc(AdcChannel::Ibus).await?;
        let tick = self.with_state(|s| {
            s.cc_ticks += 1;
            s.cc_ticks
        });
        let ci = goals.ci as i32;
        let v = contract.requested_voltage;
        let c = contract.requested_current;
        let step_c = PPS_C_STEP as i32;

        let next = if ibus > ci + step_c {
            let nv = v.saturating_sub(PPS_V_STEP).max(self.config.ta_min_voltage);
            (nv != v).then_some((nv, c))
        } else if ibus + step_c < ci {
            let c_up = c < goals.ci && contract.allows(v, c + PPS_C_STEP);
            let v_up = contract.allows(v + PPS_V_STEP, c);
            match (tick % 2 == 1, c_up, v_up) {
                (true, true, _) | (false, true, false) => Some((v, c + PPS_C_STEP)),
                (_, _, true) => Some((v + PPS_V_STEP, c)),
                _ => None,
            }
        } else {
            None
        };

        let Some((nv, nc)) = next else {
            self.store_mem(work, mem);
            return Ok(Step::Goto(Phase::Cc, Delay::ChgLoop));
        };
        attempt!(self.request(work, nv, nc).await);
        self.store_mem(work, mem);
        trace!("cc: ibus {}mA -> {}mV {}mA", ibus, nv, nc);
        Ok(Step::Goto(Phase::Cc, Delay::AdcUpdate))
    }

    async fn cv(&self, work: &Work) -> Result<Step, I2C::Error> {
        if let Some(step) = self.gate(work).await? {
            return Ok(step);
        }
        let status = self.device.lock().await.status().await?;
        let vbat = self.adc(AdcChannel::Vbat).await?;

        let contract = attempt!(self.session_contract().await);
        let (goals, mut mem) = self.with_state(|s| (s.goals, s.mem));
        if status.ibuslim() || vbat < goals.cv as i32 - CV_VBAT_DROP {
            info!("cv: back to pre-cc, vbat {}mV ibuslim {}", vbat, status.ibuslim());
            mem.v_down = false;
            self.store_mem(work, mem);
            return Ok(Step::Goto(Phase::PreCc, Delay::AdcUpdate));
        }

        let v = contract.requested_voltage;
        let c = contract.requested_current;
        if status.vbatreg() {
            self.with_state(|s| s.cv_idle_ticks = 0);
            let steps = if mem.v_down { 1 } else { 2 };
            let floor = (2 * vbat + mem.v_offset)
                .max(self.config.ta_min_voltage as i32)
                .min(v as i32) as u16;
            let nv = v.saturating_sub(steps * PPS_V_STEP).max(floor);
            if nv < v {
                attempt!(self.request(work, nv, c).await);
                trace!("cv: vbat {}mV -> {}mV", vbat, nv);
            }
            mem.v_down = true;
            self.store_mem(work, mem);
            return Ok(Step::Goto(Phase::Cv, Delay::AdcUpdate));
        }

        let idle = self.with_state(|s| {
            s.cv_idle_ticks += 1;
            s.cv_idle_ticks
        });
        if idle % CV_KEEPALIVE_TICKS == 0 {
            trace!("cv: keepalive {}mV {}mA", v, c);
            attempt!(self.request(work, v, c).await);
        }
        Ok(Step::Goto(Phase::Cv, Delay::AdcUpdate))
    }

    async fn update_bat(&self, work: &Work) -> Result<Step, I2C::Error> {
        if let Some(step) = self.gate(work).await? {
            return Ok(step);
        }

        let wait = self.with_state(|s| {
            let wait = s.pending.partial() && !s.mem.update_waited;
            if wait {
                s.mem.update_waited = true;
            }
            wait
        });
        if wait {
            return Ok(Step::Goto(Phase::UpdateBat, Delay::PpsUpdate));
        }

        let taken = self.with_state(|s| {
            if !s.is_current(work) {
                return None;
            }
            s.mem.update_waited = false;
            Some((s.pending.take(), s.targets, s.goals))
        });
        let Some((flags, targets, goals)) = taken else {
            return Ok(Step::Done);
        };
        if !flags.any() {
            return Ok(Step::Goto(Phase::PreCc, Delay::AdcUpdate));
        }

        // Only a higher voltage together with a lower input current can be applied in place.
        // A battery current change alone always goes through PRESET.
        let input = targets.input_current();
        if !(targets.vbat > goals.cv && input < goals.ci) {
            info!("update-bat: {:?}, re-preset", flags);
            return Ok(Step::Goto(Phase::Preset, Delay::None));
        }

        let contract = attempt!(self.session_contract().await);
        let new_goals = compute_goals(targets.vbat, input, contract.max_current);
        let sp = new_goals.setpoints(&self.config.calibration());
        if !self.write_setpoints(work, new_goals, sp).await? {
            return Ok(Step::Done);
        }
        let c = contract
            .requested_current
            .min(new_goals.ci)
            .max(self.config.ta_min_current);
        attempt!(self.request(work, contract.requested_voltage, c).await);
        info!("update-bat: cv {} ci {} in place", new_goals.cv, new_goals.ci);
        if self.with_state(|s| s.pending.any()) {
            return Ok(Step::Goto(Phase::UpdateBat, Delay::None));
        }
        Ok(Step::Goto(Phase::PreCc, Delay::AdcUpdate))
    }

    async fn error_phase(&self) -> Result<Step, I2C::Error> {
        self.shutdown(true).await?;
        let code = self.with_state(|s| s.error_code);
        error!("error: charging stopped, cause {:?}", code);
        Ok(Step::Done)
    }
}
