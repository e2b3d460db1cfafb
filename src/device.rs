//! Register-level access to the SM5440.

use embedded_hal_async::i2c::I2c;

use crate::regs::*;

/// An SM5440 charge pump on an I2C bus.
pub struct Sm5440<D> {
    i2c_dev: D,
}

impl<D: I2c> Sm5440<D> {
    /// Create a new `Sm5440`
    pub fn new(i2c_dev: D) -> Self {
        Sm5440 { i2c_dev }
    }

    /// Give back the bus.
    pub fn release(self) -> D {
        self.i2c_dev
    }

    /// Read the device ID register. Should return [`DEVICE_ID`].
    pub async fn device_id(&mut self) -> Result<u8, D::Error> {
        self.read_reg(Reg::DEVICE_ID).await
    }

    /// Enable or disable the charging output.
    pub async fn enable_charging(&mut self, enable: bool) -> Result<(), D::Error> {
        self.update_bits(Reg::CNTL1, enable as u8, CHG_EN_MASK, CHG_EN_SHIFT)
            .await
    }

    /// Power the ADC block up or down.
    pub async fn enable_adc(&mut self, enable: bool) -> Result<(), D::Error> {
        self.update_bits(Reg::ADCCNTL, enable as u8, ADC_EN_MASK, ADC_EN_SHIFT)
            .await
    }

    /// Program and enable the watchdog, or disable it with `None`.
    pub async fn set_watchdog(&mut self, timer: Option<WatchdogTimer>) -> Result<(), D::Error> {
        match timer {
            Some(timer) => {
                self.update_bits(Reg::CNTL1, timer as u8, WDT_TMR_MASK, WDT_TMR_SHIFT)
                    .await?;
                self.update_bits(Reg::CNTL1, 1, WDT_EN_MASK, WDT_EN_SHIFT)
                    .await
            }
            None => {
                self.update_bits(Reg::CNTL1, 0, WDT_EN_MASK, WDT_EN_SHIFT)
                    .await
            }
        }
    }

    /// Set the charge pump switching frequency.
    pub async fn set_frequency(&mut self, freq: SwitchingFrequency) -> Result<(), D::Error> {
        self.update_bits(Reg::CNTL2, freq as u8, FREQ_MASK, FREQ_SHIFT)
            .await
    }

    /// Set the battery voltage regulation limit (VBATREG), 3800..=5070 mV in 10 mV steps.
    pub async fn set_vbatreg(&mut self, millivolts: u16) -> Result<(), D::Error> {
        let code = encode_setpoint(millivolts, VBATREG_MIN, VBATREG_STEP, VBATREG_MASK);
        self.update_bits(Reg::VBATCNTL, code, VBATREG_MASK, 0).await
    }

    /// Set the input current limit (IBUSLIM), 500..=3650 mA in 50 mA steps.
    pub async fn set_ibuslim(&mut self, milliamps: u16) -> Result<(), D::Error> {
        let code = encode_setpoint(milliamps, IBUSLIM_MIN, IBUSLIM_STEP, IBUSLIM_MASK);
        self.update_bits(Reg::IBUSCNTL, code, IBUSLIM_MASK, 0).await
    }

    /// Set the battery current regulation limit (IBATREG), 1000..=7350 mA in 50 mA steps.
    pub async fn set_ibatreg(&mut self, milliamps: u16) -> Result<(), D::Error> {
        let code = encode_setpoint(milliamps, IBATREG_MIN, IBATREG_STEP, IBATREG_MASK);
        self.update_bits(Reg::IBATCNTL, code, IBATREG_MASK, 0).await
    }

    /// Unmask interrupts.
    ///
    /// Fields set to `true` in `irqs` will have their interrupts enabled.
    pub async fn set_irq_mask(&mut self, irqs: Flags) -> Result<(), D::Error> {
        let [lo, hi] = irqs.into_bytes();
        self.write_reg(Reg::MSK1, !lo).await?;
        self.write_reg(Reg::MSK2, !hi).await
    }

    /// Reads and clears the interrupt flags.
    ///
    /// INT1 and INT2 are read in a single transaction so no flag raised in between is lost.
    pub async fn interrupts(&mut self) -> Result<Flags, D::Error> {
        let mut buf = [0; 2];
        self.read_buf(Reg::INT1, &mut buf).await?;
        Ok(Flags::from_bytes(buf))
    }

    /// Live status of the interrupt sources, including the regulation loop bits.
    pub async fn status(&mut self) -> Result<Flags, D::Error> {
        let mut buf = [0; 2];
        self.read_buf(Reg::STATUS1, &mut buf).await?;
        Ok(Flags::from_bytes(buf))
    }

    /// Read CNTL1.
    pub async fn control(&mut self) -> Result<Control, D::Error> {
        self.read_reg(Reg::CNTL1)
            .await
            .map(|x| Control::from_bytes([x]))
    }

    /// Read one ADC channel, converted to the channel's unit.
    pub async fn read_adc(&mut self, channel: AdcChannel) -> Result<i32, D::Error> {
        let mut buf = [0; 2];
        self.read_buf(channel.reg(), &mut buf).await?;
        Ok(channel.convert(AdcChannel::raw(buf[0], buf[1])))
    }

    /// Read a register.
    pub async fn read_reg(&mut self, reg: Reg) -> Result<u8, D::Error> {
        let mut val = 0u8;
        self.i2c_dev
            .write_read(
                ADDR,
                core::slice::from_ref(&reg.to_u8()),
                core::slice::from_mut(&mut val),
            )
            .await?;
        Ok(val)
    }

    /// Write a register.
    pub async fn write_reg(&mut self, reg: Reg, val: u8) -> Result<(), D::Error> {
        let buf = [reg.to_u8(), val];
        self.i2c_dev.write(ADDR, &buf).await
    }

    /// Replace the `mask << shift` field of a register with `val`.
    pub async fn update_bits(&mut self, reg: Reg, val: u8, mask: u8, shift: u8) -> Result<(), D::Error> {
        self.modify_reg(reg, |old| (old & !(mask << shift)) | ((val & mask) << shift))
            .await
    }

    async fn read_buf(&mut self, base: Reg, buf: &mut [u8]) -> Result<(), D::Error> {
        self.i2c_dev
            .write_read(ADDR, core::slice::from_ref(&base.to_u8()), buf)
            .await
    }

    async fn modify_reg<F: FnOnce(u8) -> u8>(&mut self, reg: Reg, func: F) -> Result<(), D::Error> {
        let val = self.read_reg(reg).await?;
        let val = func(val);
        self.write_reg(reg, val).await
    }
}

#[cfg(test)]
mod tests {
    use embedded_hal_mock::eh1::i2c::{Mock, Transaction};

    use super::*;

    #[tokio::test]
    async fn update_bits_preserves_other_fields() {
        let expectations = [
            Transaction::write_read(ADDR, vec![0x06], vec![0b1111_0100]),
            Transaction::write(ADDR, vec![0x06, 0b1111_0101]),
        ];
        let mut dev = Sm5440::new(Mock::new(&expectations));

        dev.enable_charging(true).await.unwrap();

        dev.release().done();
    }

    #[tokio::test]
    async fn vbatreg_is_encoded_in_10mv_steps() {
        let expectations = [
            Transaction::write_read(ADDR, vec![0x09], vec![0x80]),
            Transaction::write(ADDR, vec![0x09, 0x80 | 55]),
        ];
        let mut dev = Sm5440::new(Mock::new(&expectations));

        dev.set_vbatreg(4350).await.unwrap();

        dev.release().done();
    }

    #[tokio::test]
    async fn watchdog_timer_then_enable() {
        let expectations = [
            Transaction::write_read(ADDR, vec![0x06], vec![0x01]),
            Transaction::write(ADDR, vec![0x06, 0x01 | (3 << 3)]),
            Transaction::write_read(ADDR, vec![0x06], vec![0x01 | (3 << 3)]),
            Transaction::write(ADDR, vec![0x06, 0x01 | (3 << 3) | (1 << 2)]),
        ];
        let mut dev = Sm5440::new(Mock::new(&expectations));

        dev.set_watchdog(Some(WatchdogTimer::S16)).await.unwrap();

        dev.release().done();
    }

    #[tokio::test]
    async fn adc_reads_both_halves() {
        let expectations = [Transaction::write_read(ADDR, vec![0x18], vec![0x64, 0x00])];
        let mut dev = Sm5440::new(Mock::new(&expectations));

        // raw 3200 -> 2000 mA
        assert_eq!(dev.read_adc(AdcChannel::Ibus).await.unwrap(), 2000);

        dev.release().done();
    }

    #[tokio::test]
    async fn interrupts_read_in_one_transaction() {
        let expectations = [Transaction::write_read(ADDR, vec![0x00], vec![0x80, 0x08])];
        let mut dev = Sm5440::new(Mock::new(&expectations));

        let flags = dev.interrupts().await.unwrap();
        assert!(flags.chg_off());
        assert!(flags.wdt_expired());

        dev.release().done();
    }

    #[tokio::test]
    async fn irq_mask_is_inverted() {
        let expectations = [
            Transaction::write(ADDR, vec![0x02, 0x7f]),
            Transaction::write(ADDR, vec![0x03, 0xfe]),
        ];
        let mut dev = Sm5440::new(Mock::new(&expectations));

        dev.set_irq_mask(Flags::new().with_chg_off(true).with_vbus_ovp(true))
            .await
            .unwrap();

        dev.release().done();
    }
}
