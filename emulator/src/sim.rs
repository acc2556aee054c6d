//! Simulated reference board.
//!
//! Power-good lines follow their enables after a fixed latency, the input
//! rail reads 12 V while enabled, and fans turn at a speed proportional to
//! their duty once the fan rail is up. Time only moves when the controller
//! sleeps or the session advances it, so every sleep completes on its first
//! poll.

use std::time::Duration;

use ec_core::boards::reference::{self, signals};
use ec_core::fan::TachCapture;
use ec_core::hal::{
    AnalogChannel, BoardIo, ChipsetEvent, Clock, FanId, FanPwm, HostInterface, IoError,
    SensorError, SensorId, SignalId, TemperatureSensors,
};
use ec_core::time::Instant;

const SIGNALS: usize = 32;
const SENSORS: usize = 4;

/// Fan speed per percent of duty.
const RPM_PER_PERCENT: u32 = 160;
/// Below this speed the simulated fan stalls.
const STALL_RPM: u32 = 3_000;
/// Capture counts per minute for one pulse pair with the default tach timing.
const COUNTS_PER_MINUTE: u32 = 192_000_000;

#[derive(Copy, Clone, Debug)]
struct Follower {
    enable: SignalId,
    output: SignalId,
    latency: Duration,
}

pub struct SimBoard {
    now: Instant,
    levels: [bool; SIGNALS],
    changed_at: [Instant; SIGNALS],
    followers: Vec<Follower>,
    stuck_low: Vec<SignalId>,
    temperatures: [Option<i16>; SENSORS],
    duty: [u8; reference::FAN_COUNT],
    pwm_enabled: [bool; reference::FAN_COUNT],
    ap_reset: bool,
    power_button: bool,
    /// Chipset notifications not yet shown to the operator.
    pub notifications: Vec<ChipsetEvent>,
}

impl SimBoard {
    pub fn reference() -> Self {
        let mut board = Self {
            now: Instant::ZERO,
            levels: [false; SIGNALS],
            changed_at: [Instant::ZERO; SIGNALS],
            followers: Vec::new(),
            stuck_low: Vec::new(),
            temperatures: [Some(35), Some(38), Some(40), None],
            duty: [0; reference::FAN_COUNT],
            pwm_enabled: [false; reference::FAN_COUNT],
            ap_reset: false,
            power_button: false,
            notifications: Vec::new(),
        };
        for (enable, output, latency_ms) in [
            (signals::STBY_EN, signals::STBY_PG, 2),
            (signals::CORE_EN, signals::CORE_PG, 1),
            (signals::DDR_EN, signals::DDR_PG, 1),
            (signals::FAN_EN, signals::FAN_PG, 5),
            (signals::CORE_EN, signals::AP_ALIVE, 250),
        ] {
            board.followers.push(Follower {
                enable,
                output,
                latency: Duration::from_millis(latency_ms),
            });
        }
        board
    }

    pub fn advance_to(&mut self, at: Instant) {
        if at > self.now {
            self.now = at;
        }
    }

    /// Forces a feedback line low until [`Self::release`].
    pub fn stick_low(&mut self, signal: SignalId) {
        if !self.stuck_low.contains(&signal) {
            self.stuck_low.push(signal);
        }
    }

    pub fn release(&mut self, signal: SignalId) {
        self.stuck_low.retain(|stuck| *stuck != signal);
    }

    pub fn set_celsius(&mut self, sensor: SensorId, celsius: Option<i16>) -> bool {
        match self.temperatures.get_mut(usize::from(sensor.0)) {
            Some(slot) => {
                *slot = celsius;
                true
            }
            None => false,
        }
    }

    pub fn ap_reset(&self) -> bool {
        self.ap_reset
    }

    pub fn power_button(&self) -> bool {
        self.power_button
    }

    fn level(&self, signal: SignalId) -> bool {
        self.levels
            .get(usize::from(signal.0))
            .copied()
            .unwrap_or(false)
    }

    /// Speed the fan turns at right now.
    pub fn fan_rpm(&self, fan: FanId) -> u32 {
        let index = fan.index();
        let powered = self.level(signals::FAN_EN);
        if !powered || !self.pwm_enabled.get(index).copied().unwrap_or(false) {
            return 0;
        }
        let rpm = u32::from(self.duty.get(index).copied().unwrap_or(0)) * RPM_PER_PERCENT;
        if rpm < STALL_RPM { 0 } else { rpm }
    }

    /// Feeds one pair of tach edges per turning fan into its capture.
    pub fn spin_fans(&self, tach: &[TachCapture]) {
        for (index, capture) in tach.iter().enumerate() {
            let Ok(raw) = u8::try_from(index) else {
                break;
            };
            let rpm = self.fan_rpm(FanId(raw));
            if rpm == 0 {
                continue;
            }
            let Ok(period) = u16::try_from(COUNTS_PER_MINUTE / rpm) else {
                continue;
            };
            capture.record_overflow();
            capture.record_capture(0, u16::MAX);
            capture.record_capture(period, u16::MAX);
        }
    }
}

impl BoardIo for SimBoard {
    fn read_digital(&mut self, signal: SignalId) -> Result<bool, IoError> {
        if self.stuck_low.contains(&signal) {
            return Ok(false);
        }
        if let Some(follower) = self.followers.iter().find(|f| f.output == signal) {
            let index = usize::from(follower.enable.0);
            let held = self.now.saturating_duration_since(self.changed_at[index]);
            return Ok(self.levels[index] && held >= follower.latency);
        }
        self.levels
            .get(usize::from(signal.0))
            .copied()
            .ok_or(IoError::Unmapped)
    }

    fn set_digital(&mut self, signal: SignalId, level: bool) -> Result<(), IoError> {
        let index = usize::from(signal.0);
        if index >= SIGNALS {
            return Err(IoError::Unmapped);
        }
        if self.levels[index] != level {
            self.levels[index] = level;
            self.changed_at[index] = self.now;
        }
        Ok(())
    }

    fn read_analog(&mut self, channel: AnalogChannel) -> Result<u16, IoError> {
        if channel != reference::VIN_SENSE {
            return Err(IoError::Unmapped);
        }
        let healthy = self.level(signals::VIN_EN) && !self.stuck_low.contains(&signals::VIN_EN);
        Ok(if healthy { 12_000 } else { 0 })
    }
}

impl Clock for SimBoard {
    fn now(&self) -> Instant {
        self.now
    }

    async fn sleep(&mut self, duration: Duration) {
        self.now = self.now + duration;
    }
}

impl TemperatureSensors for SimBoard {
    fn read_kelvin(&mut self, sensor: SensorId) -> Result<u16, SensorError> {
        let celsius = self
            .temperatures
            .get(usize::from(sensor.0))
            .copied()
            .flatten()
            .ok_or(SensorError::NotPresent)?;
        u16::try_from(i32::from(celsius) + 273).map_err(|_| SensorError::Bus)
    }
}

impl FanPwm for SimBoard {
    fn set_duty(&mut self, fan: FanId, percent: u8) {
        if let Some(duty) = self.duty.get_mut(fan.index()) {
            *duty = percent;
        }
    }

    fn set_output_enabled(&mut self, fan: FanId, enabled: bool) {
        if let Some(output) = self.pwm_enabled.get_mut(fan.index()) {
            *output = enabled;
        }
    }
}

impl HostInterface for SimBoard {
    fn notify(&mut self, event: ChipsetEvent) {
        self.notifications.push(event);
    }

    fn set_ap_reset(&mut self, asserted: bool) {
        self.ap_reset = asserted;
    }

    fn set_power_button(&mut self, pressed: bool) {
        self.power_button = pressed;
    }

    fn set_idle_sleep(&mut self, _allowed: bool) {}
}
