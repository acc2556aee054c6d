//! Collaborator interfaces consumed by the power and thermal core.
//!
//! Board crates implement these traits on top of their GPIO, ADC, I2C and
//! timer drivers. The core never touches registers directly, which keeps the
//! same state machines usable from firmware, the emulator and tests.

use core::fmt;
use core::time::Duration;

use crate::config::persisted::{ConfigRecord, ConfigTag, ConfigUnit};
use crate::time::Instant;

/// Digital line routed to a rail enable, a power-good input or a host signal.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SignalId(pub u16);

/// ADC channel measuring a rail voltage.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct AnalogChannel(pub u8);

/// Temperature sensor handle.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SensorId(pub u8);

/// Fan channel index.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FanId(pub u8);

impl FanId {
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for FanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fan{}", self.0)
    }
}

/// Failure reported by a GPIO or ADC access.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum IoError {
    /// The signal is not routed on this board.
    Unmapped,
    /// The expander or converter behind the signal did not answer.
    Bus,
}

impl fmt::Display for IoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Failure reported by a temperature sensor read.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SensorError {
    NotPresent,
    NotPowered,
    Bus,
}

impl fmt::Display for SensorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Lifecycle hooks delivered to drivers outside the core.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ChipsetEvent {
    PreInit,
    Startup,
    Resume,
    Suspend,
    Shutdown,
}

/// Rail control signals and their feedback.
pub trait BoardIo {
    /// Reads the logic level of `signal`.
    fn read_digital(&mut self, signal: SignalId) -> Result<bool, IoError>;

    /// Drives `signal` to `level`.
    fn set_digital(&mut self, signal: SignalId, level: bool) -> Result<(), IoError>;

    /// Samples `channel`, returning millivolts.
    fn read_analog(&mut self, channel: AnalogChannel) -> Result<u16, IoError>;
}

/// Monotonic clock with a cooperative sleep.
///
/// The core only ever awaits these futures from the power task, so no `Send`
/// bound is placed on them.
#[allow(async_fn_in_trait)]
pub trait Clock {
    fn now(&self) -> Instant;

    /// Suspends the calling task for `duration`; other tasks keep running.
    async fn sleep(&mut self, duration: Duration);
}

/// Temperature sensor access.
pub trait TemperatureSensors {
    /// Returns the temperature of `sensor` in kelvin.
    fn read_kelvin(&mut self, sensor: SensorId) -> Result<u16, SensorError>;
}

/// PWM outputs driving the fans.
pub trait FanPwm {
    /// Applies a duty cycle in percent.
    fn set_duty(&mut self, fan: FanId, percent: u8);

    /// Starts or stops the PWM output.
    fn set_output_enabled(&mut self, fan: FanId, enabled: bool);
}

/// Signals exchanged with the application processor.
pub trait HostInterface {
    /// Fire-and-forget lifecycle notification.
    fn notify(&mut self, event: ChipsetEvent);

    /// Asserts or releases the AP reset line.
    fn set_ap_reset(&mut self, asserted: bool);

    /// Presses or releases the power button as seen by the AP.
    fn set_power_button(&mut self, pressed: bool);

    /// Allows or forbids low-power idle on the controller.
    fn set_idle_sleep(&mut self, allowed: bool);
}

/// Read-only access to factory-programmed configuration records.
pub trait ConfigStore {
    /// Returns the record stored under `tag` for `unit`, if any.
    fn lookup(&self, unit: ConfigUnit, tag: ConfigTag) -> Option<ConfigRecord>;
}

/// Configuration store with nothing programmed.
#[derive(Copy, Clone, Debug, Default)]
pub struct EmptyConfigStore;

impl ConfigStore for EmptyConfigStore {
    fn lookup(&self, _: ConfigUnit, _: ConfigTag) -> Option<ConfigRecord> {
        None
    }
}

/// Everything the control loops need from a board.
pub trait Board: BoardIo + Clock + TemperatureSensors + FanPwm + HostInterface {}

impl<T> Board for T where T: BoardIo + Clock + TemperatureSensors + FanPwm + HostInterface {}
