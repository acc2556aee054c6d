#![allow(dead_code)]

use core::time::Duration;

use ec_core::config::{ConfigRecord, ConfigTag, ConfigUnit};
use ec_core::hal::{
    AnalogChannel, BoardIo, ChipsetEvent, Clock, ConfigStore, FanId, FanPwm, HostInterface,
    IoError, SensorError, SensorId, SignalId, TemperatureSensors,
};
use ec_core::time::Instant;

const SIGNALS: usize = 32;

/// One `set_digital` call seen by the board.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Write {
    pub signal: SignalId,
    pub level: bool,
    pub at: Instant,
}

/// Feedback signal that reads high once its enable has been high for `latency`.
#[derive(Copy, Clone, Debug)]
struct Follower {
    enable: SignalId,
    output: SignalId,
    latency: Duration,
}

/// Host-side board with programmable feedback and a write log.
pub struct BenchBoard {
    now: Instant,
    levels: [bool; SIGNALS],
    changed_at: [Instant; SIGNALS],
    followers: Vec<Follower>,
    stuck_low: Vec<SignalId>,
    analog: Vec<(AnalogChannel, SignalId, u16)>,
    temperatures: [Option<i16>; 8],
    pub writes: Vec<Write>,
    pub events: Vec<ChipsetEvent>,
    pub duty: [u8; 4],
    pub pwm_enabled: [bool; 4],
    pub ap_reset: bool,
    pub power_button: bool,
    pub button_presses: usize,
    /// Makes every sleep give way to the executor once, like a real timer.
    pub yield_on_sleep: bool,
}

impl BenchBoard {
    pub fn new() -> Self {
        Self {
            now: Instant::ZERO,
            levels: [false; SIGNALS],
            changed_at: [Instant::ZERO; SIGNALS],
            followers: Vec::new(),
            stuck_low: Vec::new(),
            analog: Vec::new(),
            temperatures: [None; 8],
            writes: Vec::new(),
            events: Vec::new(),
            duty: [0; 4],
            pwm_enabled: [false; 4],
            ap_reset: false,
            power_button: false,
            button_presses: 0,
            yield_on_sleep: false,
        }
    }

    /// Wires the reference board: every power-good follows its enable and
    /// the AP comes alive 20 ms after the core rail.
    pub fn reference() -> Self {
        use ec_core::boards::reference::{VIN_SENSE, signals};

        let mut board = Self::new();
        board.follow(signals::STBY_EN, signals::STBY_PG, Duration::from_millis(2));
        board.follow(signals::CORE_EN, signals::CORE_PG, Duration::from_millis(1));
        board.follow(signals::DDR_EN, signals::DDR_PG, Duration::from_millis(1));
        board.follow(signals::FAN_EN, signals::FAN_PG, Duration::from_millis(5));
        board.follow(signals::CORE_EN, signals::AP_ALIVE, Duration::from_millis(20));
        board.analog_follows(VIN_SENSE, signals::VIN_EN, 12_000);
        board.set_celsius(SensorId(0), 40);
        board.set_celsius(SensorId(1), 40);
        board
    }

    pub fn follow(&mut self, enable: SignalId, output: SignalId, latency: Duration) {
        self.followers.push(Follower {
            enable,
            output,
            latency,
        });
    }

    /// `channel` reads `millivolts` while `enable` is high and 0 otherwise.
    pub fn analog_follows(&mut self, channel: AnalogChannel, enable: SignalId, millivolts: u16) {
        self.analog.push((channel, enable, millivolts));
    }

    /// Pins a feedback line low regardless of its enable.
    pub fn stick_low(&mut self, signal: SignalId) {
        self.stuck_low.push(signal);
    }

    pub fn set_celsius(&mut self, sensor: SensorId, celsius: i16) {
        self.temperatures[usize::from(sensor.0)] = Some(celsius);
    }

    pub fn level(&self, signal: SignalId) -> bool {
        self.levels[usize::from(signal.0)]
    }

    pub fn advance(&mut self, duration: Duration) {
        self.now = self.now + duration;
    }

    /// Signals driven high, in order.
    pub fn enabled_signals(&self) -> Vec<SignalId> {
        self.writes
            .iter()
            .filter(|write| write.level)
            .map(|write| write.signal)
            .collect()
    }
}

impl BoardIo for BenchBoard {
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
        self.writes.push(Write {
            signal,
            level,
            at: self.now,
        });
        if self.levels[index] != level {
            self.levels[index] = level;
            self.changed_at[index] = self.now;
        }
        Ok(())
    }

    fn read_analog(&mut self, channel: AnalogChannel) -> Result<u16, IoError> {
        let (_, enable, millivolts) = self
            .analog
            .iter()
            .copied()
            .find(|(wired, _, _)| *wired == channel)
            .ok_or(IoError::Unmapped)?;
        Ok(if self.level(enable) { millivolts } else { 0 })
    }
}

impl Clock for BenchBoard {
    fn now(&self) -> Instant {
        self.now
    }

    async fn sleep(&mut self, duration: Duration) {
        self.advance(duration);
        if self.yield_on_sleep {
            embassy_futures::yield_now().await;
        }
    }
}

impl TemperatureSensors for BenchBoard {
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

impl FanPwm for BenchBoard {
    fn set_duty(&mut self, fan: FanId, percent: u8) {
        self.duty[fan.index()] = percent;
    }

    fn set_output_enabled(&mut self, fan: FanId, enabled: bool) {
        self.pwm_enabled[fan.index()] = enabled;
    }
}

impl HostInterface for BenchBoard {
    fn notify(&mut self, event: ChipsetEvent) {
        self.events.push(event);
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

    fn set_idle_sleep(&mut self, _allowed: bool) {}
}

/// Configuration store backed by a list of records.
#[derive(Default)]
pub struct RecordStore {
    records: Vec<(ConfigUnit, ConfigTag, ConfigRecord)>,
}

impl RecordStore {
    pub fn with(mut self, unit: ConfigUnit, tag: ConfigTag, record: ConfigRecord) -> Self {
        self.records.push((unit, tag, record));
        self
    }
}

impl ConfigStore for RecordStore {
    fn lookup(&self, unit: ConfigUnit, tag: ConfigTag) -> Option<ConfigRecord> {
        self.records
            .iter()
            .find(|(u, t, _)| *u == unit && *t == tag)
            .map(|(_, _, record)| *record)
    }
}
