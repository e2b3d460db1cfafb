//! Test doubles: a delay that only counts, and a simulated SM5440 with its source and
//! switching charger.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;
use std::vec::Vec;

use embassy_sync::blocking_mutex::raw::NoopRawMutex;
use embedded_hal_async::delay::DelayNs;
use embedded_hal_async::i2c::{ErrorKind, ErrorType, I2c, Operation};

use crate::charger::DirectCharger;
use crate::config::Config;
use crate::host::SwitchingCharger;
use crate::regs::{AdcChannel, Flags, Reg, DEVICE_ID};
use crate::source::{PdError, PowerSource, PpsCapability};

/// Counts requested delay without waiting.
#[derive(Clone, Default)]
pub struct TestDelay {
    total_ns: Rc<Cell<u64>>,
}

impl TestDelay {
    pub fn total_ms(&self) -> u64 {
        self.total_ns.get() / 1_000_000
    }
}

impl DelayNs for TestDelay {
    async fn delay_ns(&mut self, ns: u32) {
        self.total_ns.set(self.total_ns.get() + ns as u64);
    }
}

pub const CAP: PpsCapability = PpsCapability {
    position: 1,
    max_voltage: 11000,
    max_current: 3000,
    max_power: 30000,
};

/// Model of the device, the source and the switching charger behind one charger instance.
pub struct Sim {
    pub regs: [u8; 0x20],
    pub status: Flags,
    pub irq: Flags,
    pub vbat: i32,
    pub vbus: i32,
    pub ibus: i32,
    pub die_temp: i32,
    /// VBUS follows each granted contract voltage plus this offset.
    pub vbus_offset: i32,
    pub track_contract: bool,
    pub cap: Result<PpsCapability, PdError>,
    pub replies: VecDeque<Result<(), PdError>>,
    pub requests: Vec<(u16, u16)>,
    /// Yield once inside every contract request.
    pub slow_source: bool,
    pub switcher_on: bool,
    pub switcher_disables: u32,
    pub bus_fault: bool,
}

impl Default for Sim {
    fn default() -> Self {
        let mut regs = [0; 0x20];
        regs[Reg::DEVICE_ID.0 as usize] = DEVICE_ID;
        Sim {
            regs,
            status: Flags::new().with_vbus_pok(true),
            irq: Flags::new(),
            vbat: 3700,
            vbus: 5000,
            ibus: 0,
            die_temp: 250,
            vbus_offset: 0,
            track_contract: true,
            cap: Ok(CAP),
            replies: VecDeque::new(),
            requests: Vec::new(),
            slow_source: false,
            switcher_on: false,
            switcher_disables: 0,
            bus_fault: false,
        }
    }
}

impl Sim {
    pub fn output_enabled(&self) -> bool {
        self.regs[Reg::CNTL1.0 as usize] & 0x01 != 0
    }

    pub fn adc_enabled(&self) -> bool {
        self.regs[Reg::ADCCNTL.0 as usize] & 0x01 != 0
    }

    pub fn last_request(&self) -> Option<(u16, u16)> {
        self.requests.last().copied()
    }

    fn adc_raw(&self, channel: AdcChannel) -> u16 {
        let raw = match channel {
            AdcChannel::Thermistor => 0,
            AdcChannel::DieTemp => (self.die_temp + 400) * 16 / 5,
            AdcChannel::Vbat => self.vbat * 8 / 5,
            AdcChannel::Vout => self.vbat * 8 / 5,
            AdcChannel::Ibus => self.ibus * 8 / 5,
            AdcChannel::Vbus => self.vbus * 2 / 3,
        };
        raw.clamp(0, 0x1fff) as u16
    }

    fn read(&mut self, reg: u8) -> u8 {
        let [int1, int2] = self.irq.into_bytes();
        let [st1, st2] = self.status.into_bytes();
        match reg {
            0x00 => int1,
            0x01 => int2,
            0x04 => st1,
            0x05 => st2,
            0x10..=0x1b => {
                let channel = match (reg - 0x10) / 2 {
                    0 => AdcChannel::Thermistor,
                    1 => AdcChannel::DieTemp,
                    2 => AdcChannel::Vbat,
                    3 => AdcChannel::Vout,
                    4 => AdcChannel::Ibus,
                    _ => AdcChannel::Vbus,
                };
                let raw = self.adc_raw(channel);
                if reg % 2 == 0 {
                    (raw >> 5) as u8
                } else {
                    ((raw & 0x1f) << 3) as u8
                }
            }
            r => self.regs[r as usize & 0x1f],
        }
    }
}

pub type Shared = Rc<RefCell<Sim>>;

/// I2C side of the simulation. Register reads auto-increment; INT1/INT2 clear on read.
pub struct SimBus(pub Shared);

impl ErrorType for SimBus {
    type Error = ErrorKind;
}

impl I2c for SimBus {
    async fn transaction(&mut self, _address: u8, operations: &mut [Operation<'_>]) -> Result<(), Self::Error> {
        let mut sim = self.0.borrow_mut();
        if sim.bus_fault {
            return Err(ErrorKind::Bus);
        }
        let mut pointer = 0u8;
        let mut read_int = false;
        for op in operations.iter_mut() {
            match op {
                Operation::Write(bytes) => {
                    let Some((&reg, data)) = bytes.split_first() else {
                        continue;
                    };
                    pointer = reg;
                    for (i, &b) in data.iter().enumerate() {
                        let r = (reg as usize + i) & 0x1f;
                        sim.regs[r] = b;
                    }
                }
                Operation::Read(buf) => {
                    for (i, b) in buf.iter_mut().enumerate() {
                        let reg = pointer.wrapping_add(i as u8);
                        read_int |= reg <= 0x01;
                        *b = sim.read(reg);
                    }
                }
            }
        }
        if read_int {
            sim.irq = Flags::new();
        }
        Ok(())
    }
}

pub struct SimSource(pub Shared);

impl PowerSource for SimSource {
    async fn max_capability(&mut self, _hint_mv: u16) -> Result<PpsCapability, PdError> {
        self.0.borrow().cap
    }

    async fn select_pps(&mut self, _position: u8, millivolts: u16, milliamps: u16) -> Result<(), PdError> {
        if self.0.borrow().slow_source {
            embassy_futures::yield_now().await;
        }
        let mut sim = self.0.borrow_mut();
        sim.requests.push((millivolts, milliamps));
        let reply = sim.replies.pop_front().unwrap_or(Ok(()));
        if reply.is_ok() && sim.track_contract {
            sim.vbus = millivolts as i32 + sim.vbus_offset;
        }
        reply
    }
}

pub struct SimSwitcher(pub Shared);

impl SwitchingCharger for SimSwitcher {
    async fn is_enabled(&mut self) -> bool {
        self.0.borrow().switcher_on
    }

    async fn set_enabled(&mut self, enabled: bool) {
        let mut sim = self.0.borrow_mut();
        if !enabled {
            sim.switcher_disables += 1;
        }
        sim.switcher_on = enabled;
    }
}

pub type TestCharger = DirectCharger<NoopRawMutex, SimBus, SimSource, SimSwitcher, TestDelay>;

pub fn setup(config: Config, sim: Sim) -> (TestCharger, Shared, TestDelay) {
    let sim = Rc::new(RefCell::new(sim));
    let delay = TestDelay::default();
    let charger = DirectCharger::new(
        config,
        SimBus(sim.clone()),
        SimSource(sim.clone()),
        SimSwitcher(sim.clone()),
        delay.clone(),
    );
    (charger, sim, delay)
}
