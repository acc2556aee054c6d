//! In-memory board used by the unit tests.

use core::time::Duration;

use heapless::Vec;

use crate::hal::{
    AnalogChannel, BoardIo, ChipsetEvent, Clock, FanId, FanPwm, HostInterface, IoError, SensorError,
    SensorId, SignalId, TemperatureSensors,
};
use crate::time::Instant;

const SIGNALS: usize = 64;

pub struct MockBoard {
    now: Instant,
    levels: [bool; SIGNALS],
    changed_at: [Instant; SIGNALS],
    followers: Vec<(SignalId, SignalId, Duration), 16>,
    broken_writes: Vec<SignalId, 4>,
    dropouts: Vec<(SignalId, Instant), 4>,
    analog: [u16; 8],
    temperatures: [Result<u16, SensorError>; 16],
    pub duty: [u8; 4],
    pub pwm_enabled: [bool; 4],
    pub events: Vec<ChipsetEvent, 32>,
    pub ap_reset: bool,
    pub power_button: bool,
    pub button_presses: u8,
    pub idle_sleep: bool,
}

impl MockBoard {
    pub fn new() -> Self {
        Self {
            now: Instant::ZERO,
            levels: [false; SIGNALS],
            changed_at: [Instant::ZERO; SIGNALS],
            followers: Vec::new(),
            broken_writes: Vec::new(),
            dropouts: Vec::new(),
            analog: [0; 8],
            temperatures: [Err(SensorError::NotPresent); 16],
            duty: [0; 4],
            pwm_enabled: [false; 4],
            events: Vec::new(),
            ap_reset: true,
            power_button: false,
            button_presses: 0,
            idle_sleep: true,
        }
    }

    pub fn set_level(&mut self, signal: SignalId, level: bool) {
        let index = usize::from(signal.0);
        self.levels[index] = level;
        self.changed_at[index] = self.now;
    }

    pub fn level(&self, signal: SignalId) -> bool {
        self.levels[usize::from(signal.0)]
    }

    /// Makes `output` read high once `enable` has been high for `latency`.
    pub fn follow(&mut self, enable: SignalId, output: SignalId, latency: Duration) {
        self.followers.retain(|(_, out, _)| *out != output);
        self.followers.push((enable, output, latency)).unwrap();
    }

    pub fn break_writes(&mut self, signal: SignalId) {
        self.broken_writes.push(signal).unwrap();
    }

    /// Makes `signal` read low from `at` onwards.
    pub fn drop_out(&mut self, signal: SignalId, at: Instant) {
        self.dropouts.push((signal, at)).unwrap();
    }

    pub fn set_analog(&mut self, channel: AnalogChannel, millivolts: u16) {
        self.analog[usize::from(channel.0)] = millivolts;
    }

    pub fn set_celsius(&mut self, sensor: SensorId, celsius: i16) {
        let kelvin = u16::try_from(i32::from(celsius) + 273).unwrap();
        self.temperatures[usize::from(sensor.0)] = Ok(kelvin);
    }

    pub fn fail_sensor(&mut self, sensor: SensorId) {
        self.temperatures[usize::from(sensor.0)] = Err(SensorError::Bus);
    }

    pub fn advance(&mut self, duration: Duration) {
        self.now = self.now + duration;
    }
}

impl BoardIo for MockBoard {
    fn read_digital(&mut self, signal: SignalId) -> Result<bool, IoError> {
        let now = self.now;
        if self
            .dropouts
            .iter()
            .any(|(dropped, at)| *dropped == signal && now >= *at)
        {
            return Ok(false);
        }
        if let Some((enable, _, latency)) = self
            .followers
            .iter()
            .find(|(_, output, _)| *output == signal)
        {
            let index = usize::from(enable.0);
            return Ok(self.levels[index]
                && now.saturating_duration_since(self.changed_at[index]) >= *latency);
        }
        self.levels
            .get(usize::from(signal.0))
            .copied()
            .ok_or(IoError::Unmapped)
    }

    fn set_digital(&mut self, signal: SignalId, level: bool) -> Result<(), IoError> {
        if self.broken_writes.contains(&signal) {
            return Err(IoError::Bus);
        }
        if self.level(signal) != level {
            self.set_level(signal, level);
        }
        Ok(())
    }

    fn read_analog(&mut self, channel: AnalogChannel) -> Result<u16, IoError> {
        self.analog
            .get(usize::from(channel.0))
            .copied()
            .ok_or(IoError::Unmapped)
    }
}

impl Clock for MockBoard {
    fn now(&self) -> Instant {
        self.now
    }

    async fn sleep(&mut self, duration: Duration) {
        self.advance(duration);
    }
}

impl TemperatureSensors for MockBoard {
    fn read_kelvin(&mut self, sensor: SensorId) -> Result<u16, SensorError> {
        self.temperatures
            .get(usize::from(sensor.0))
            .copied()
            .unwrap_or(Err(SensorError::NotPresent))
    }
}

impl FanPwm for MockBoard {
    fn set_duty(&mut self, fan: FanId, percent: u8) {
        self.duty[fan.index()] = percent;
    }

    fn set_output_enabled(&mut self, fan: FanId, enabled: bool) {
        self.pwm_enabled[fan.index()] = enabled;
    }
}

impl HostInterface for MockBoard {
    fn notify(&mut self, event: ChipsetEvent) {
        let _ = self.events.push(event);
    }

    fn set_ap_reset(&mut self, asserted: bool) {
        self.ap_reset = asserted;
    }

    fn set_power_button(&mut self, pressed: bool) {
        if pressed && !self.power_button {
            self.button_presses += 1;
        }
        self.power_button = pressed;
    }

    fn set_idle_sleep(&mut self, allowed: bool) {
        self.idle_sleep = allowed;
    }
}
