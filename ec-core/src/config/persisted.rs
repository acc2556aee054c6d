//! Typed factory configuration records and their validation.
//!
//! The store collaborator decodes whatever on-board format holds the records;
//! the core only sees the typed values below. Every record is validated when
//! it is loaded, and a missing or malformed record never stops the boot: the
//! caller falls back to built-in defaults or disables the feature that
//! depends on it.

use core::fmt;

use crate::supply::{Sequence, SequenceStep, SupplyId};

/// Steps a persisted daughterboard sequence may carry.
pub const MAX_DB_SEQUENCE_STEPS: usize = 8;

/// Rails switched by a daughterboard sequence mask.
pub const DB_SUPPLY_COUNT: usize = 6;

/// Bits a daughterboard step mask may set.
pub const DB_VALID_SUPPLY_MASK: u8 = (1 << DB_SUPPLY_COUNT) - 1;

/// Product id of the interface test fixture, which carries no sensors.
pub const TEST_FIXTURE_PRODUCT_ID: u16 = 0x4006;

/// Storage unit holding a record.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConfigUnit {
    Motherboard,
    Daughterboard(u8),
}

/// Record kind within a unit.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConfigTag {
    BoardInfo,
    DbPowerSequence,
    FanLimits(u8),
    McuFlags,
    ZoneLimits(u8),
}

/// Errors raised while validating a record.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConfigError {
    /// The record under the tag has a different type.
    WrongRecord(ConfigTag),
    TooManySteps(u8),
    InvalidSupplyMask { step: u8, mask: u8 },
    /// The expanded sequence does not fit a [`Sequence`].
    SequenceOverflow,
    InvalidFanLimits,
    InvalidZoneLimits(u8),
    UnknownZone(u8),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Identity of a board.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct BoardInfo {
    pub product_id: u16,
    pub revision: u16,
    pub compat_revision: u16,
}

impl BoardInfo {
    /// Returns `true` when the board carries temperature sensors.
    #[must_use]
    pub const fn has_temperature_sensors(&self) -> bool {
        self.product_id != TEST_FIXTURE_PRODUCT_ID
    }
}

/// One step of a persisted daughterboard sequence.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct DbSequenceStep {
    pub delay_ms: u16,
    pub supply_mask: u8,
}

/// Daughterboard power-up order as stored on the board.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct DbPowerSequence {
    pub nsteps: u8,
    pub steps: [DbSequenceStep; MAX_DB_SEQUENCE_STEPS],
}

impl DbPowerSequence {
    /// Checks the step count and masks.
    ///
    /// # Errors
    ///
    /// [`ConfigError::TooManySteps`] or [`ConfigError::InvalidSupplyMask`].
    pub fn validate(&self) -> Result<&[DbSequenceStep], ConfigError> {
        let count = usize::from(self.nsteps);
        if count > MAX_DB_SEQUENCE_STEPS {
            return Err(ConfigError::TooManySteps(self.nsteps));
        }
        let steps = &self.steps[..count];
        for (index, step) in (0u8..).zip(steps) {
            if step.supply_mask & !DB_VALID_SUPPLY_MASK != 0 {
                return Err(ConfigError::InvalidSupplyMask {
                    step: index,
                    mask: step.supply_mask,
                });
            }
        }
        Ok(steps)
    }

    /// Expands the masks into a rail sequence over `rails`, indexed by mask bit.
    ///
    /// Rails of one step are enabled in bit order and the step delay is
    /// applied after the last of them.
    ///
    /// # Errors
    ///
    /// Any validation error, or [`ConfigError::SequenceOverflow`].
    pub fn to_sequence(&self, rails: &[SupplyId; DB_SUPPLY_COUNT]) -> Result<Sequence, ConfigError> {
        let mut sequence = Sequence::new();
        for step in self.validate()? {
            let mut last = None;
            for (bit, rail) in rails.iter().enumerate() {
                if step.supply_mask & (1 << bit) != 0 {
                    sequence
                        .push(SequenceStep::new(*rail, 0))
                        .map_err(|_| ConfigError::SequenceOverflow)?;
                    last = Some(sequence.len() - 1);
                }
            }
            if let Some(index) = last {
                sequence[index] = SequenceStep::new(sequence[index].supply, u64::from(step.delay_ms));
            }
        }
        Ok(sequence)
    }
}

/// Highest speed a stored limit may name; the stored fields are 16 bits wide.
pub const MAX_FAN_RPM: u32 = 65_535;

/// Fan speed limits in RPM.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FanLimits {
    pub min_rpm: u32,
    pub start_rpm: u32,
    pub max_rpm: u32,
}

impl FanLimits {
    #[must_use]
    pub const fn new(min_rpm: u32, start_rpm: u32, max_rpm: u32) -> Self {
        Self {
            min_rpm,
            start_rpm,
            max_rpm,
        }
    }

    /// # Errors
    ///
    /// [`ConfigError::InvalidFanLimits`] unless `min < max`, `start <= max`
    /// and `max` fits [`MAX_FAN_RPM`].
    pub const fn validate(self) -> Result<Self, ConfigError> {
        if self.min_rpm < self.max_rpm
            && self.start_rpm <= self.max_rpm
            && self.max_rpm <= MAX_FAN_RPM
        {
            Ok(self)
        } else {
            Err(ConfigError::InvalidFanLimits)
        }
    }
}

impl Default for FanLimits {
    fn default() -> Self {
        Self::new(3_800, 3_800, 13_500)
    }
}

/// Controller behaviour flags.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct McuFlags {
    pub autoboot: bool,
    pub thermal_recovery: bool,
}

impl McuFlags {
    /// Values used when the record is absent.
    pub const DEFAULT: Self = Self {
        autoboot: false,
        thermal_recovery: true,
    };
}

impl Default for McuFlags {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Calibration override for one thermal zone. Temperatures in degrees Celsius.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct ZoneLimits {
    pub zone: u8,
    pub target: i16,
    pub hysteresis: i16,
    pub warning: i16,
    pub critical: i16,
    pub weight: u8,
    pub kp: f32,
    pub ki: f32,
}

impl ZoneLimits {
    /// # Errors
    ///
    /// [`ConfigError::InvalidZoneLimits`] unless
    /// `hysteresis <= warning < critical` and the gains are finite and
    /// non-negative.
    pub fn validate(self) -> Result<Self, ConfigError> {
        let ordered = self.hysteresis <= self.warning && self.warning < self.critical;
        let gains = self.kp.is_finite() && self.ki.is_finite() && self.kp >= 0.0 && self.ki >= 0.0;
        if ordered && gains {
            Ok(self)
        } else {
            Err(ConfigError::InvalidZoneLimits(self.zone))
        }
    }
}

/// A record returned by the store.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum ConfigRecord {
    BoardInfo(BoardInfo),
    DbPowerSequence(DbPowerSequence),
    FanLimits(FanLimits),
    McuFlags(McuFlags),
    ZoneLimits(ZoneLimits),
}
