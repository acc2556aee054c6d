//! A single temperature zone and its PI demand calculation.

use crate::config::persisted::ZoneLimits;
use crate::hal::SensorId;

/// Longest error history a zone may average over.
pub const ERROR_HISTORY_MAX: usize = 120;

/// Error assumed for history slots not yet written, in degrees Celsius.
const INITIAL_ERROR: f32 = 2.0;

/// Zone thresholds in degrees Celsius.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ZoneThresholds {
    /// Temperature the PI loop steers towards.
    pub target: i16,
    /// Below this the warning latch releases.
    pub hysteresis: i16,
    /// At or above this the zone demands full cooling.
    pub warning: i16,
    /// At or above this the system shuts down.
    pub critical: i16,
}

impl ZoneThresholds {
    #[must_use]
    pub const fn new(target: i16, hysteresis: i16, warning: i16, critical: i16) -> Self {
        Self {
            target,
            hysteresis,
            warning,
            critical,
        }
    }
}

/// Static description of a zone, as laid out by the board.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct ZoneDefinition {
    pub name: &'static str,
    pub sensor: SensorId,
    pub thresholds: ZoneThresholds,
    /// Whether the zone drives cooling and critical shutdown.
    pub cooling: bool,
    /// Relative share of the aggregate demand.
    pub weight: u8,
    /// Proportional gain, percent of demand per degree.
    pub kp: f32,
    /// Integral gain, percent of demand per accumulated degree.
    pub ki: f32,
    /// Daughterboard slot carrying the sensor, if it is removable.
    pub daughterboard: Option<u8>,
}

impl ZoneDefinition {
    #[must_use]
    pub const fn new(
        name: &'static str,
        sensor: SensorId,
        thresholds: ZoneThresholds,
        weight: u8,
        kp: f32,
        ki: f32,
    ) -> Self {
        Self {
            name,
            sensor,
            thresholds,
            cooling: true,
            weight,
            kp,
            ki,
            daughterboard: None,
        }
    }

    /// Marks the zone as reported only.
    #[must_use]
    pub const fn monitor_only(mut self) -> Self {
        self.cooling = false;
        self
    }

    /// Ties the zone to the daughterboard in `slot`.
    #[must_use]
    pub const fn on_daughterboard(mut self, slot: u8) -> Self {
        self.daughterboard = Some(slot);
        self
    }
}

/// Bounds applied to the PI loop of every zone.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct PidLimits {
    /// Averaged errors at or below this magnitude reset the integral.
    pub min_error: f32,
    /// Averaged errors at or above this magnitude reset the integral.
    pub max_error: f32,
    /// Integral magnitude cap.
    pub max_integral: f32,
    /// Readings averaged into the error, `1..=ERROR_HISTORY_MAX`.
    pub history_len: usize,
}

impl PidLimits {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            min_error: 1.0,
            max_error: 10.0,
            max_integral: 25.0,
            history_len: 1,
        }
    }

    const fn history_len(&self) -> usize {
        if self.history_len == 0 {
            1
        } else if self.history_len > ERROR_HISTORY_MAX {
            ERROR_HISTORY_MAX
        } else {
            self.history_len
        }
    }
}

impl Default for PidLimits {
    fn default() -> Self {
        Self::new()
    }
}

/// Runtime state of a zone.
#[derive(Clone, Debug)]
pub struct TempZone {
    definition: ZoneDefinition,
    integral: f32,
    tending_to_critical: bool,
    requirement: u8,
    errors: [f32; ERROR_HISTORY_MAX],
    cursor: usize,
    last_celsius: Option<i16>,
}

impl TempZone {
    #[must_use]
    pub fn new(definition: ZoneDefinition) -> Self {
        Self {
            definition,
            integral: 0.0,
            tending_to_critical: false,
            requirement: 0,
            errors: [INITIAL_ERROR; ERROR_HISTORY_MAX],
            cursor: 0,
            last_celsius: None,
        }
    }

    #[must_use]
    pub fn definition(&self) -> &ZoneDefinition {
        &self.definition
    }

    #[must_use]
    pub fn is_cooling(&self) -> bool {
        self.definition.cooling
    }

    /// Current demand in percent.
    #[must_use]
    pub fn requirement(&self) -> u8 {
        self.requirement
    }

    #[must_use]
    pub fn is_tending_to_critical(&self) -> bool {
        self.tending_to_critical
    }

    #[must_use]
    pub fn integral(&self) -> f32 {
        self.integral
    }

    /// Last successful reading in degrees Celsius.
    #[must_use]
    pub fn last_temperature(&self) -> Option<i16> {
        self.last_celsius
    }

    /// Removes the zone from cooling and critical checks.
    pub fn disable(&mut self) {
        self.definition.cooling = false;
        self.requirement = 0;
    }

    /// Applies a validated calibration record.
    pub fn apply_limits(&mut self, limits: &ZoneLimits) {
        self.definition.thresholds = ZoneThresholds::new(
            limits.target,
            limits.hysteresis,
            limits.warning,
            limits.critical,
        );
        self.definition.weight = limits.weight;
        self.definition.kp = limits.kp;
        self.definition.ki = limits.ki;
    }

    pub(crate) fn observe(&mut self, celsius: Option<i16>) {
        if celsius.is_some() {
            self.last_celsius = celsius;
        }
    }

    /// Pushes the newest error and returns the average over the window.
    fn average_error(&mut self, error: f32, len: usize) -> f32 {
        if self.cursor >= len {
            self.cursor = 0;
        }
        self.errors[self.cursor] = error;
        self.cursor += 1;

        let window = &self.errors[..len];
        let sum: f32 = window.iter().sum();
        #[allow(clippy::cast_precision_loss)]
        let count = len as f32;
        sum / count
    }

    /// Computes the demand in percent for one control tick. `None` is a
    /// failed read. The flag is set when this reading tripped the warning
    /// latch.
    pub fn update(&mut self, celsius: Option<i16>, limits: &PidLimits) -> (u8, bool) {
        let Some(celsius) = celsius else {
            self.requirement = 100;
            return (self.requirement, false);
        };
        self.last_celsius = Some(celsius);

        let thresholds = self.definition.thresholds;
        let average = self.average_error(
            f32::from(celsius) - f32::from(thresholds.target),
            limits.history_len(),
        );

        let was_latched = self.tending_to_critical;
        let mut demand = 0.0_f32;
        if celsius >= thresholds.warning {
            self.tending_to_critical = true;
            demand = 100.0;
        } else if celsius >= thresholds.hysteresis && self.tending_to_critical {
            demand = 100.0;
        } else if self.tending_to_critical {
            self.tending_to_critical = false;
        }

        if !self.tending_to_critical {
            let magnitude = average.abs();
            if magnitude <= limits.min_error || magnitude >= limits.max_error {
                self.integral = 0.0;
            } else {
                self.integral += average;
            }
            self.integral = self
                .integral
                .clamp(-limits.max_integral, limits.max_integral);

            demand = average * self.definition.kp + self.integral * self.definition.ki;
        }

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let percent = demand.clamp(0.0, 100.0) as u8;
        self.requirement = percent;
        (percent, self.tending_to_critical && !was_latched)
    }
}
