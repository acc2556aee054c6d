//! STM32G0 implementation of the board traits used by `ec-core`.

pub mod analog;

use core::time::Duration;

use ec_core::hal::{
    AnalogChannel, BoardIo, ChipsetEvent, Clock, FanId, FanPwm, HostInterface, IoError,
    SensorError, SensorId, SignalId, TemperatureSensors,
};
use ec_core::time::Instant;
use embassy_stm32::gpio::{Input, Level, Output, OutputOpenDrain};
use embassy_stm32::i2c::I2c;
use embassy_stm32::mode::Blocking;
use embassy_stm32::peripherals::TIM3;
use embassy_stm32::timer::Channel;
use embassy_stm32::timer::simple_pwm::SimplePwm;
use embassy_time::Timer;
use heapless::Vec;

use crate::telemetry;
use analog::RailAdc;

pub const MAX_OUTPUTS: usize = 16;
pub const MAX_INPUTS: usize = 8;

/// First TMP102-style sensor address; sensor N answers at `BASE + N`.
const SENSOR_BASE_ADDR: u8 = 0x48;
const SENSOR_TEMPERATURE_REG: u8 = 0x00;

/// PWM channel per fan index.
const FAN_CHANNELS: [Channel; 2] = [Channel::Ch1, Channel::Ch2];

pub struct Stm32Board<'d> {
    pub outputs: Vec<(SignalId, Output<'d>), MAX_OUTPUTS>,
    pub inputs: Vec<(SignalId, Input<'d>), MAX_INPUTS>,
    pub rails: RailAdc<'d>,
    pub sensors: I2c<'d, Blocking>,
    pub pwm: SimplePwm<'d, TIM3>,
    /// Active-low AP reset.
    pub ap_reset: Output<'d>,
    /// Open-drain line in parallel with the AP power button.
    pub power_button: OutputOpenDrain<'d>,
}

impl BoardIo for Stm32Board<'_> {
    fn read_digital(&mut self, signal: SignalId) -> Result<bool, IoError> {
        if let Some((_, pin)) = self.outputs.iter().find(|(id, _)| *id == signal) {
            return Ok(pin.is_set_high());
        }
        self.inputs
            .iter()
            .find(|(id, _)| *id == signal)
            .map(|(_, pin)| pin.is_high())
            .ok_or(IoError::Unmapped)
    }

    fn set_digital(&mut self, signal: SignalId, level: bool) -> Result<(), IoError> {
        let (_, pin) = self
            .outputs
            .iter_mut()
            .find(|(id, _)| *id == signal)
            .ok_or(IoError::Unmapped)?;
        pin.set_level(Level::from(level));
        Ok(())
    }

    fn read_analog(&mut self, channel: AnalogChannel) -> Result<u16, IoError> {
        self.rails.read_millivolts(channel)
    }
}

impl Clock for Stm32Board<'_> {
    fn now(&self) -> Instant {
        Instant::from_micros(embassy_time::Instant::now().as_micros())
    }

    async fn sleep(&mut self, duration: Duration) {
        let micros = u64::try_from(duration.as_micros()).unwrap_or(u64::MAX);
        Timer::after_micros(micros).await;
    }
}

impl TemperatureSensors for Stm32Board<'_> {
    fn read_kelvin(&mut self, sensor: SensorId) -> Result<u16, SensorError> {
        let address = SENSOR_BASE_ADDR
            .checked_add(sensor.0)
            .ok_or(SensorError::NotPresent)?;
        let mut raw = [0u8; 2];
        self.sensors
            .blocking_write_read(address, &[SENSOR_TEMPERATURE_REG], &mut raw)
            .map_err(|_| SensorError::Bus)?;
        // 12-bit two's complement, 1/16 degree per LSB.
        let sixteenths = i16::from_be_bytes(raw) >> 4;
        u16::try_from(i32::from(sixteenths / 16) + 273).map_err(|_| SensorError::Bus)
    }
}

impl FanPwm for Stm32Board<'_> {
    fn set_duty(&mut self, fan: FanId, percent: u8) {
        if let Some(channel) = FAN_CHANNELS.get(fan.index()) {
            self.pwm.channel(*channel).set_duty_cycle_percent(percent.min(100));
        }
    }

    fn set_output_enabled(&mut self, fan: FanId, enabled: bool) {
        if let Some(channel) = FAN_CHANNELS.get(fan.index()) {
            let mut output = self.pwm.channel(*channel);
            if enabled {
                output.enable();
            } else {
                output.disable();
            }
        }
    }
}

impl HostInterface for Stm32Board<'_> {
    fn notify(&mut self, event: ChipsetEvent) {
        telemetry::log_chipset_event(event);
    }

    fn set_ap_reset(&mut self, asserted: bool) {
        self.ap_reset.set_level(Level::from(!asserted));
    }

    fn set_power_button(&mut self, pressed: bool) {
        if pressed {
            self.power_button.set_low();
        } else {
            self.power_button.set_high();
        }
    }

    fn set_idle_sleep(&mut self, allowed: bool) {
        defmt::debug!("idle sleep allowed={}", allowed);
    }
}
