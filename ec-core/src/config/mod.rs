//! Built-in tuning for every component plus the persisted record types.

pub mod persisted;

use crate::fan::FanConfig;
use crate::power::PowerTimings;
use crate::supply::SupervisorConfig;
use crate::thermal::ThermalConfig;

pub use persisted::{
    BoardInfo, ConfigError, ConfigRecord, ConfigTag, ConfigUnit, DbPowerSequence, FanLimits,
    MAX_FAN_RPM, McuFlags, ZoneLimits,
};

/// Tuning handed to the controller at construction.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct ControllerConfig {
    pub supervisor: SupervisorConfig,
    pub power: PowerTimings,
    pub thermal: ThermalConfig,
    pub fan: FanConfig,
    /// Fan limits used until a record replaces them.
    pub fan_limits: FanLimits,
}

impl ControllerConfig {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            supervisor: SupervisorConfig::new(),
            power: PowerTimings::new(),
            thermal: ThermalConfig::new(),
            fan: FanConfig::new(),
            fan_limits: FanLimits::new(3_800, 3_800, 13_500),
        }
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self::new()
    }
}
