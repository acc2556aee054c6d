//! Calibrated rail voltage sampling on ADC1.
//!
//! Every reading is scaled against a fresh VREFINT sample so the result
//! does not depend on the exact VDDA of the controller.

use core::ptr;

use ec_core::hal::{AnalogChannel, IoError};
use embassy_stm32::adc::{Adc, AnyAdcChannel, SampleTime, VrefInt};
use embassy_stm32::peripherals::ADC1;
use heapless::Vec;

/// Factory-programmed calibration constant sampled at 3.0 V.
const VREFINT_CAL_ADDR: *const u16 = 0x1FFF_75AA as *const u16;
const VREFINT_CAL_MV: u32 = 3_000;
const FULL_SCALE: u32 = 4_095;

pub const MAX_RAIL_CHANNELS: usize = 4;

/// Reads the factory-trimmed VREFINT calibration constant.
fn read_vrefint_calibration() -> u16 {
    unsafe { ptr::read_volatile(VREFINT_CAL_ADDR) }
}

/// One sensed rail behind a resistor divider.
pub struct RailChannel {
    pub channel: AnalogChannel,
    pub pin: AnyAdcChannel<ADC1>,
    /// Divider ratio, rail millivolts per pin millivolt.
    pub divider: u16,
}

pub struct RailAdc<'d> {
    adc: Adc<'d, ADC1>,
    vrefint: VrefInt,
    calibration: u16,
    rails: Vec<RailChannel, MAX_RAIL_CHANNELS>,
}

impl<'d> RailAdc<'d> {
    pub fn new(mut adc: Adc<'d, ADC1>, rails: Vec<RailChannel, MAX_RAIL_CHANNELS>) -> Self {
        adc.set_sample_time(SampleTime::CYCLES160_5);
        let vrefint = adc.enable_vrefint();
        let mut this = Self {
            adc,
            vrefint,
            calibration: read_vrefint_calibration(),
            rails,
        };
        // The first conversion after enabling VREFINT is unreliable.
        let _ = this.adc.blocking_read(&mut this.vrefint);
        this
    }

    /// Returns the rail voltage in millivolts.
    pub fn read_millivolts(&mut self, channel: AnalogChannel) -> Result<u16, IoError> {
        let reference = u32::from(self.adc.blocking_read(&mut self.vrefint));
        if reference == 0 {
            return Err(IoError::Bus);
        }
        let rail = self
            .rails
            .iter_mut()
            .find(|rail| rail.channel == channel)
            .ok_or(IoError::Unmapped)?;
        let raw = u32::from(self.adc.blocking_read(&mut rail.pin));
        let vdda_mv = VREFINT_CAL_MV * u32::from(self.calibration) / reference;
        let pin_mv = raw * vdda_mv / FULL_SCALE;
        Ok(u16::try_from(pin_mv * u32::from(rail.divider)).unwrap_or(u16::MAX))
    }
}
