//! Closed-loop fan driver.
//!
//! Channels in RPM mode chase a target speed by nudging the PWM duty once per
//! second; manual channels keep whatever duty was last written. Speed is
//! measured from the tachometer capture period in [`tach::TachCapture`].

use core::fmt;

use heapless::Vec;

use crate::config::persisted::{ConfigRecord, ConfigTag, ConfigUnit, FanLimits};
use crate::hal::{ConfigStore, FanId, FanPwm};
use crate::telemetry::{TelemetryEventKind, TelemetryPayload, TelemetryRecorder};
use crate::time::Instant;

pub mod tach;

pub use tach::TachCapture;

/// Upper bound on fan channels per driver.
pub const MAX_FANS: usize = 4;

/// Closed-loop state of a channel.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FanStatus {
    Stopped,
    Changing,
    Locked,
    /// Duty is saturated and the target is still out of reach.
    Frustrated,
}

impl fmt::Display for FanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FanStatus::Stopped => "stopped",
            FanStatus::Changing => "changing",
            FanStatus::Locked => "locked",
            FanStatus::Frustrated => "frustrated",
        })
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FanMode {
    /// Duty is written directly.
    Manual,
    /// Duty follows the RPM target.
    Rpm,
}

/// Control loop and tachometer parameters.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct FanConfig {
    /// Speed error, in RPM, treated as locked.
    pub readjust_band: u32,
    /// Capture timer input clock.
    pub tach_clock_hz: u32,
    /// Capture timer prescaler register value.
    pub tach_prescaler: u16,
    /// Tach edges per capture event.
    pub capture_divider: u32,
    /// Tach pulses per fan revolution.
    pub pulses_per_rev: u32,
}

impl FanConfig {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            readjust_band: 150,
            tach_clock_hz: 96_000_000,
            tach_prescaler: 119,
            capture_divider: 8,
            pulses_per_rev: 2,
        }
    }
}

impl Default for FanConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time view of a channel.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FanSnapshot {
    pub fan: FanId,
    pub enabled: bool,
    pub mode: FanMode,
    pub duty: u8,
    pub target_rpm: u32,
    pub rpm: u32,
    pub status: FanStatus,
}

#[derive(Copy, Clone, Debug)]
struct FanChannel {
    limits: FanLimits,
    enabled: bool,
    mode: FanMode,
    thermal_control: bool,
    duty: u8,
    rpm_target: u32,
    status: FanStatus,
    last_diff: i32,
    last_edges: u32,
}

impl FanChannel {
    const fn new(limits: FanLimits) -> Self {
        Self {
            limits,
            enabled: false,
            mode: FanMode::Rpm,
            thermal_control: true,
            duty: 0,
            rpm_target: 0,
            status: FanStatus::Stopped,
            last_diff: 0,
            last_edges: 0,
        }
    }
}

/// Duty change for a speed error of `magnitude` RPM.
const fn duty_step(magnitude: u32) -> u8 {
    if magnitude > 1_000 {
        10
    } else if magnitude > 500 {
        5
    } else {
        1
    }
}

/// Drives every fan channel.
pub struct FanDriver<'t> {
    channels: Vec<FanChannel, MAX_FANS>,
    tach: &'t [TachCapture],
    config: FanConfig,
}

impl<'t> FanDriver<'t> {
    /// One channel per entry of `tach`, up to [`MAX_FANS`], all starting with
    /// `limits`.
    #[must_use]
    pub fn new(tach: &'t [TachCapture], limits: FanLimits, config: FanConfig) -> Self {
        let mut channels = Vec::new();
        for _ in tach.iter().take(MAX_FANS) {
            let _ = channels.push(FanChannel::new(limits));
        }
        Self {
            channels,
            tach,
            config,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn fans(&self) -> impl Iterator<Item = FanId> + '_ {
        (0..self.channels.len()).filter_map(|index| u8::try_from(index).ok().map(FanId))
    }

    #[must_use]
    pub fn config(&self) -> &FanConfig {
        &self.config
    }

    fn channel(&self, fan: FanId) -> Option<&FanChannel> {
        self.channels.get(fan.index())
    }

    fn channel_mut(&mut self, fan: FanId) -> Option<&mut FanChannel> {
        self.channels.get_mut(fan.index())
    }

    #[must_use]
    pub fn limits(&self, fan: FanId) -> Option<FanLimits> {
        self.channel(fan).map(|channel| channel.limits)
    }

    /// Replaces the built-in limits with validated per-fan records.
    pub fn load_limits<S: ConfigStore, const N: usize>(
        &mut self,
        store: &S,
        telemetry: &mut TelemetryRecorder<N>,
        now: Instant,
    ) {
        for (index, channel) in (0u8..).zip(self.channels.iter_mut()) {
            let tag = ConfigTag::FanLimits(index);
            match store.lookup(ConfigUnit::Motherboard, tag) {
                None => {}
                Some(ConfigRecord::FanLimits(limits)) if limits.validate().is_ok() => {
                    channel.limits = limits;
                }
                Some(_) => {
                    telemetry.note(TelemetryEventKind::ConfigRejected(tag), now);
                }
            }
        }
    }

    /// Maps a demand in percent onto the channel's speed range; 0 % is 0 RPM.
    #[must_use]
    pub fn percent_to_rpm(&self, fan: FanId, percent: u8) -> u32 {
        let Some(channel) = self.channel(fan) else {
            return 0;
        };
        if percent == 0 {
            return 0;
        }
        let percent = u64::from(percent.min(100));
        let FanLimits {
            min_rpm, max_rpm, ..
        } = channel.limits;
        let rpm =
            ((percent - 1) * u64::from(max_rpm) + (100 - percent) * u64::from(min_rpm)) / 99;
        u32::try_from(rpm).unwrap_or(u32::MAX)
    }

    /// Inverse of [`Self::percent_to_rpm`], rounded to the nearest percent.
    #[must_use]
    pub fn rpm_to_percent(&self, fan: FanId, rpm: u32) -> u8 {
        let Some(channel) = self.channel(fan) else {
            return 0;
        };
        if rpm == 0 {
            return 0;
        }
        let FanLimits {
            min_rpm, max_rpm, ..
        } = channel.limits;
        let span = u64::from(max_rpm.saturating_sub(min_rpm).max(1));
        let rpm = u64::from(rpm.clamp(min_rpm, max_rpm.max(min_rpm)));
        let percent = ((rpm - u64::from(min_rpm)) * 99 + span / 2) / span + 1;
        u8::try_from(percent.min(100)).unwrap_or(100)
    }

    /// Speed derived from the last capture period; zero when disabled or
    /// not turning.
    #[must_use]
    pub fn measured_rpm(&self, fan: FanId) -> u32 {
        let Some(channel) = self.channel(fan) else {
            return 0;
        };
        if !channel.enabled {
            return 0;
        }
        let period = self.tach.get(fan.index()).map_or(0, TachCapture::period);
        if period == 0 {
            return 0;
        }
        let counts_per_sec = self.config.tach_clock_hz / (u32::from(self.config.tach_prescaler) + 1);
        counts_per_sec / period * (60 / self.config.pulses_per_rev.max(1)) * self.config.capture_divider
    }

    pub fn set_enabled<P: FanPwm>(&mut self, pwm: &mut P, fan: FanId, enabled: bool) {
        let Some(channel) = self.channel_mut(fan) else {
            return;
        };
        channel.enabled = enabled;
        if enabled {
            channel.status = FanStatus::Changing;
            pwm.set_output_enabled(fan, true);
        } else {
            channel.duty = 0;
            pwm.set_duty(fan, 0);
        }
    }

    pub fn set_mode(&mut self, fan: FanId, mode: FanMode) {
        if let Some(channel) = self.channel_mut(fan) {
            channel.mode = mode;
        }
    }

    /// Writes a duty directly, clamped to 100 %.
    pub fn set_duty<P: FanPwm>(&mut self, pwm: &mut P, fan: FanId, percent: u8) {
        let Some(channel) = self.channel_mut(fan) else {
            return;
        };
        channel.duty = percent.min(100);
        pwm.set_duty(fan, channel.duty);
    }

    /// Sets the speed target, clamped into the channel limits. Zero stops the fan.
    pub fn set_rpm_target(&mut self, fan: FanId, rpm: u32) {
        let Some(channel) = self.channel_mut(fan) else {
            return;
        };
        channel.rpm_target = if rpm == 0 {
            0
        } else {
            rpm.clamp(channel.limits.min_rpm, channel.limits.max_rpm)
        };
    }

    /// Hands the channel to or takes it from the thermal controller.
    pub fn set_thermal_control(&mut self, fan: FanId, enabled: bool) {
        if let Some(channel) = self.channel_mut(fan) {
            channel.thermal_control = enabled;
        }
    }

    /// Returns `true` when every channel follows thermal demand.
    #[must_use]
    pub fn thermal_control_enabled(&self) -> bool {
        self.channels.iter().all(|channel| channel.thermal_control)
    }

    /// Turns a cooling demand into an RPM target.
    ///
    /// A fan that has fallen well below its minimum speed is aimed at its
    /// start speed instead, so it spins up reliably.
    pub fn set_percent_needed(&mut self, fan: FanId, percent: u8) {
        let Some(channel) = self.channel(fan) else {
            return;
        };
        if !channel.thermal_control {
            return;
        }
        let limits = channel.limits;
        let mut rpm = self.percent_to_rpm(fan, percent);
        let actual = self.measured_rpm(fan);
        let stalled = u64::from(actual) * 10 < u64::from(limits.min_rpm) * 9;
        if rpm != 0 && stalled && rpm < limits.start_rpm {
            rpm = limits.start_rpm;
        }
        self.set_rpm_target(fan, rpm);
    }

    /// Applies the same demand to every channel.
    pub fn apply_demand(&mut self, percent: u8) {
        for index in 0..self.channels.len() {
            if let Ok(raw) = u8::try_from(index) {
                self.set_percent_needed(FanId(raw), percent);
            }
        }
    }

    /// Marks channels whose tachometer stopped producing edges as stopped.
    ///
    /// Runs before [`Self::control_tick`] in the same second.
    pub fn health_tick<const N: usize>(
        &mut self,
        fan_power_good: bool,
        telemetry: &mut TelemetryRecorder<N>,
        now: Instant,
    ) {
        for (index, channel) in self.channels.iter_mut().enumerate() {
            let Some(tach) = self.tach.get(index) else {
                continue;
            };
            let edges = tach.edges();
            let previous = core::mem::replace(&mut channel.last_edges, edges);

            let idle = !channel.enabled
                || channel.duty == 0
                || !fan_power_good
                || (channel.mode == FanMode::Rpm && channel.rpm_target == 0);
            if idle {
                continue;
            }

            if edges == previous {
                tach.clear_period();
                if channel.status != FanStatus::Stopped {
                    channel.status = FanStatus::Stopped;
                    let fan = FanId(u8::try_from(index).unwrap_or(u8::MAX));
                    telemetry.record(
                        TelemetryEventKind::FanStalled(fan),
                        TelemetryPayload::Fan {
                            duty: channel.duty,
                            rpm: 0,
                        },
                        now,
                    );
                }
            } else if channel.status == FanStatus::Stopped {
                channel.status = FanStatus::Changing;
            }
        }
    }

    /// Steps the duty of every RPM-mode channel towards its target.
    pub fn control_tick<P: FanPwm, const N: usize>(
        &mut self,
        pwm: &mut P,
        fan_power_good: bool,
        telemetry: &mut TelemetryRecorder<N>,
        now: Instant,
    ) {
        if !fan_power_good {
            return;
        }
        let band = i32::try_from(self.config.readjust_band).unwrap_or(i32::MAX);

        for index in 0..self.channels.len() {
            let Ok(raw) = u8::try_from(index) else {
                break;
            };
            let fan = FanId(raw);
            let actual = self.measured_rpm(fan);
            let channel = &mut self.channels[index];
            if !channel.enabled && channel.duty == 0 {
                continue;
            }
            if channel.mode == FanMode::Manual {
                continue;
            }

            let target = if channel.enabled { channel.rpm_target } else { 0 };
            let mut diff = i32::try_from(target).unwrap_or(i32::MAX)
                - i32::try_from(actual).unwrap_or(i32::MAX);
            if channel.status == FanStatus::Locked {
                diff = (99 * channel.last_diff + diff) / 100;
            }
            channel.last_diff = diff;

            let duty = if diff > band {
                if channel.duty >= 100 {
                    Self::frustrated(channel, fan, actual, telemetry, now);
                    continue;
                }
                channel.duty.saturating_add(duty_step(diff.unsigned_abs())).min(100)
            } else if diff < -band {
                if channel.duty == 0 {
                    Self::frustrated(channel, fan, actual, telemetry, now);
                    continue;
                }
                channel.duty.saturating_sub(duty_step(diff.unsigned_abs()))
            } else {
                channel.status = FanStatus::Locked;
                continue;
            };

            channel.status = FanStatus::Changing;
            channel.duty = duty;
            pwm.set_duty(fan, duty);
        }
    }

    fn frustrated<const N: usize>(
        channel: &mut FanChannel,
        fan: FanId,
        rpm: u32,
        telemetry: &mut TelemetryRecorder<N>,
        now: Instant,
    ) {
        if channel.status != FanStatus::Frustrated {
            telemetry.record(
                TelemetryEventKind::FanFrustrated(fan),
                TelemetryPayload::Fan {
                    duty: channel.duty,
                    rpm,
                },
                now,
            );
        }
        channel.status = FanStatus::Frustrated;
    }

    /// Enabled, asked to spin, driven, powered, and yet not turning.
    #[must_use]
    pub fn is_stalled(&self, fan: FanId, fan_power_good: bool) -> bool {
        let Some(channel) = self.channel(fan) else {
            return false;
        };
        channel.enabled
            && channel.rpm_target != 0
            && channel.duty != 0
            && fan_power_good
            && self.measured_rpm(fan) == 0
    }

    #[must_use]
    pub fn status(&self, fan: FanId) -> Option<FanSnapshot> {
        let channel = self.channel(fan)?;
        Some(FanSnapshot {
            fan,
            enabled: channel.enabled,
            mode: channel.mode,
            duty: channel.duty,
            target_rpm: if channel.enabled { channel.rpm_target } else { 0 },
            rpm: self.measured_rpm(fan),
            status: channel.status,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockBoard;

    const FAN: FanId = FanId(0);
    const LIMITS: FanLimits = FanLimits::new(4_000, 5_000, 16_000);

    /// Feeds two captures `period` counts apart.
    fn spin(tach: &TachCapture, period: u16) {
        tach.record_overflow();
        tach.record_capture(0, 0xFFFF);
        tach.record_capture(period, 0xFFFF);
    }

    #[test]
    fn percent_and_rpm_map_linearly() {
        let tach = [TachCapture::new()];
        let fans = FanDriver::new(&tach, LIMITS, FanConfig::new());
        assert_eq!(fans.percent_to_rpm(FAN, 0), 0);
        assert_eq!(fans.percent_to_rpm(FAN, 1), 4_000);
        assert_eq!(fans.percent_to_rpm(FAN, 50), 9_939);
        assert_eq!(fans.percent_to_rpm(FAN, 100), 16_000);
        assert_eq!(fans.rpm_to_percent(FAN, 9_939), 50);
        assert_eq!(fans.rpm_to_percent(FAN, 0), 0);
        assert_eq!(fans.rpm_to_percent(FAN, 20_000), 100);
    }

    #[test]
    fn measures_rpm_from_capture_period() {
        let tach = [TachCapture::new()];
        let mut board = MockBoard::new();
        let mut fans = FanDriver::new(&tach, LIMITS, FanConfig::new());
        spin(&tach[0], 20_000);
        assert_eq!(fans.measured_rpm(FAN), 0);

        fans.set_enabled(&mut board, FAN, true);
        // 800 kHz count rate: 40 periods per second, 240 RPM per Hz of capture
        assert_eq!(fans.measured_rpm(FAN), 9_600);
    }

    #[test]
    fn start_speed_kick_for_a_slow_fan() {
        let tach = [TachCapture::new()];
        let mut board = MockBoard::new();
        let mut fans = FanDriver::new(&tach, LIMITS, FanConfig::new());
        fans.set_enabled(&mut board, FAN, true);

        fans.set_percent_needed(FAN, 1);
        assert_eq!(fans.status(FAN).unwrap().target_rpm, 5_000);

        spin(&tach[0], 20_000);
        fans.set_percent_needed(FAN, 1);
        assert_eq!(fans.status(FAN).unwrap().target_rpm, 4_000);

        fans.set_thermal_control(FAN, false);
        fans.set_percent_needed(FAN, 100);
        assert_eq!(fans.status(FAN).unwrap().target_rpm, 4_000);
    }

    #[test]
    fn duty_steps_towards_target_then_locks() {
        let tach = [TachCapture::new()];
        let mut board = MockBoard::new();
        let mut telemetry = TelemetryRecorder::<64>::new();
        let mut fans = FanDriver::new(&tach, LIMITS, FanConfig::new());
        fans.set_enabled(&mut board, FAN, true);
        fans.set_duty(&mut board, FAN, 30);
        fans.set_rpm_target(FAN, 9_600);

        spin(&tach[0], 40_000); // 4_800 RPM
        fans.control_tick(&mut board, true, &mut telemetry, Instant::ZERO);
        assert_eq!(board.duty[0], 40);

        spin(&tach[0], 21_052); // 9_120 RPM
        fans.control_tick(&mut board, true, &mut telemetry, Instant::ZERO);
        assert_eq!(board.duty[0], 41);
        assert_eq!(fans.status(FAN).unwrap().status, FanStatus::Changing);

        spin(&tach[0], 20_000); // 9_600 RPM
        fans.control_tick(&mut board, true, &mut telemetry, Instant::ZERO);
        assert_eq!(board.duty[0], 41);
        assert_eq!(fans.status(FAN).unwrap().status, FanStatus::Locked);
    }

    #[test]
    fn saturated_duty_is_frustrated() {
        let tach = [TachCapture::new()];
        let mut board = MockBoard::new();
        let mut telemetry = TelemetryRecorder::<64>::new();
        let mut fans = FanDriver::new(&tach, LIMITS, FanConfig::new());
        fans.set_enabled(&mut board, FAN, true);
        fans.set_duty(&mut board, FAN, 100);
        fans.set_rpm_target(FAN, 16_000);
        spin(&tach[0], 20_000);

        fans.control_tick(&mut board, true, &mut telemetry, Instant::ZERO);
        assert_eq!(fans.status(FAN).unwrap().status, FanStatus::Frustrated);
        assert!(telemetry.contains(TelemetryEventKind::FanFrustrated(FAN)));
    }

    #[test]
    fn manual_mode_and_fan_power_skip_control() {
        let tach = [TachCapture::new()];
        let mut board = MockBoard::new();
        let mut telemetry = TelemetryRecorder::<64>::new();
        let mut fans = FanDriver::new(&tach, LIMITS, FanConfig::new());
        fans.set_enabled(&mut board, FAN, true);
        fans.set_duty(&mut board, FAN, 30);
        fans.set_rpm_target(FAN, 16_000);

        fans.control_tick(&mut board, false, &mut telemetry, Instant::ZERO);
        assert_eq!(board.duty[0], 30);

        fans.set_mode(FAN, FanMode::Manual);
        fans.control_tick(&mut board, true, &mut telemetry, Instant::ZERO);
        assert_eq!(board.duty[0], 30);
    }

    #[test]
    fn missing_edges_mark_the_fan_stopped() {
        let tach = [TachCapture::new()];
        let mut board = MockBoard::new();
        let mut telemetry = TelemetryRecorder::<64>::new();
        let mut fans = FanDriver::new(&tach, LIMITS, FanConfig::new());
        fans.set_enabled(&mut board, FAN, true);
        fans.set_duty(&mut board, FAN, 30);
        fans.set_rpm_target(FAN, 8_000);

        spin(&tach[0], 20_000);
        fans.health_tick(true, &mut telemetry, Instant::ZERO);
        assert!(!fans.is_stalled(FAN, true));

        fans.health_tick(true, &mut telemetry, Instant::ZERO);
        assert_eq!(fans.status(FAN).unwrap().status, FanStatus::Stopped);
        assert_eq!(fans.measured_rpm(FAN), 0);
        assert!(fans.is_stalled(FAN, true));
        assert!(!fans.is_stalled(FAN, false));
        assert!(telemetry.contains(TelemetryEventKind::FanStalled(FAN)));

        spin(&tach[0], 20_000);
        fans.health_tick(true, &mut telemetry, Instant::ZERO);
        assert_eq!(fans.status(FAN).unwrap().status, FanStatus::Changing);
    }
}
