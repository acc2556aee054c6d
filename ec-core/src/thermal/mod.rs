//! Thermal zone controller.
//!
//! Once per second [`ThermalController::tick`] reads every cooling zone,
//! checks for a critical temperature, computes each zone's PI demand and
//! folds them into a single weighted fan demand. The critical path runs even
//! when fans are under manual control; only demand computation depends on
//! thermal control being enabled.

use core::time::Duration;

use heapless::Vec;

use crate::config::persisted::{ConfigError, ConfigRecord, ConfigTag, ConfigUnit};
use crate::hal::{ConfigStore, TemperatureSensors};
use crate::telemetry::{TelemetryEventKind, TelemetryPayload, TelemetryRecorder};
use crate::time::Instant;

pub mod zone;

pub use zone::{PidLimits, TempZone, ZoneDefinition, ZoneThresholds};

/// Upper bound on zones per controller.
pub const MAX_ZONES: usize = 16;

/// Kelvin to whole degrees Celsius.
#[must_use]
pub fn kelvin_to_celsius(kelvin: u16) -> i16 {
    i16::try_from(i32::from(kelvin) - 273).unwrap_or(i16::MAX)
}

/// Thermal tuning and the critical shutdown timings.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct ThermalConfig {
    pub pid: PidLimits,
    /// Simulated power button press that asks the AP to shut down.
    pub shutdown_button_pulse: Duration,
    /// Delay before the AP is forced off after a critical reading.
    pub force_shutdown_delay: Duration,
    /// Extra delay after the forced shutdown before the fans are overridden.
    pub fan_override_offset: Duration,
    /// Fixed duty applied to every fan after a thermal shutdown.
    pub fan_override_duty: u8,
    /// Power-good timeout when re-enabling the fan supply.
    pub fan_supply_timeout: Duration,
}

impl ThermalConfig {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            pid: PidLimits::new(),
            shutdown_button_pulse: Duration::from_millis(200),
            force_shutdown_delay: Duration::from_secs(2),
            fan_override_offset: Duration::from_millis(100),
            fan_override_duty: 40,
            fan_supply_timeout: Duration::from_millis(200),
        }
    }
}

impl Default for ThermalConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// System facts the controller needs each tick.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
#[allow(clippy::struct_excessive_bools)]
pub struct ThermalInputs {
    /// Every fan follows thermal demand.
    pub control_enabled: bool,
    /// The AP is running.
    pub chipset_on: bool,
    /// The system is mechanically off.
    pub chipset_hard_off: bool,
    /// The AP may be restarted once the system cools down.
    pub recovery_allowed: bool,
}

/// How a thermal shutdown ended.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ThermalRecovery {
    /// The AP never went down.
    Resumed,
    /// The AP should be brought back from hard off.
    RestartAp,
}

/// Result of one control tick.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct ThermalTick {
    /// Aggregate demand in percent, when thermal control is enabled.
    pub demand: Option<u8>,
    /// Zone that crossed its critical threshold; start the shutdown sequence.
    pub critical: Option<usize>,
    pub recovery: Option<ThermalRecovery>,
}

/// Owns every zone and the thermal shutdown state.
pub struct ThermalController {
    zones: Vec<TempZone, MAX_ZONES>,
    config: ThermalConfig,
    in_shutdown: bool,
    aggregate: u8,
}

fn zone_number(index: usize) -> u8 {
    u8::try_from(index).unwrap_or(u8::MAX)
}

impl ThermalController {
    /// Builds the zones from `definitions`; entries past [`MAX_ZONES`] are ignored.
    #[must_use]
    pub fn new(definitions: &[ZoneDefinition], config: ThermalConfig) -> Self {
        let mut zones = Vec::new();
        for definition in definitions.iter().take(MAX_ZONES) {
            let _ = zones.push(TempZone::new(*definition));
        }
        Self {
            zones,
            config,
            in_shutdown: false,
            aggregate: 0,
        }
    }

    #[must_use]
    pub fn zones(&self) -> &[TempZone] {
        &self.zones
    }

    #[must_use]
    pub fn config(&self) -> &ThermalConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut ThermalConfig {
        &mut self.config
    }

    #[must_use]
    pub fn in_thermal_shutdown(&self) -> bool {
        self.in_shutdown
    }

    /// Last aggregate demand in percent.
    #[must_use]
    pub fn aggregate_demand(&self) -> u8 {
        self.aggregate
    }

    /// Sum of the weights of cooling zones; zero counts as one.
    #[must_use]
    pub fn total_weight(&self) -> u32 {
        let total: u32 = self
            .zones
            .iter()
            .filter(|zone| zone.is_cooling())
            .map(|zone| u32::from(zone.definition().weight))
            .sum();
        total.max(1)
    }

    /// Disables daughterboard zones whose board is missing or has no sensors,
    /// then applies calibration overrides from the motherboard store.
    pub fn load_config<S: ConfigStore, const N: usize>(
        &mut self,
        store: &S,
        telemetry: &mut TelemetryRecorder<N>,
        now: Instant,
    ) {
        for zone in &mut self.zones {
            let Some(slot) = zone.definition().daughterboard else {
                continue;
            };
            let present = match store.lookup(ConfigUnit::Daughterboard(slot), ConfigTag::BoardInfo) {
                Some(ConfigRecord::BoardInfo(info)) => info.has_temperature_sensors(),
                _ => false,
            };
            if !present {
                zone.disable();
            }
        }

        for index in 0..self.zones.len() {
            let tag = ConfigTag::ZoneLimits(zone_number(index));
            let Some(record) = store.lookup(ConfigUnit::Motherboard, tag) else {
                continue;
            };
            if self.apply_calibration(index, record).is_err() {
                telemetry.note(TelemetryEventKind::ConfigRejected(tag), now);
            }
        }

        if self
            .zones
            .iter()
            .filter(|zone| zone.is_cooling())
            .all(|zone| zone.definition().weight == 0)
        {
            telemetry.note(TelemetryEventKind::CoolingWeightZero, now);
        }
    }

    fn apply_calibration(&mut self, index: usize, record: ConfigRecord) -> Result<(), ConfigError> {
        let tag = ConfigTag::ZoneLimits(zone_number(index));
        let ConfigRecord::ZoneLimits(limits) = record else {
            return Err(ConfigError::WrongRecord(tag));
        };
        let limits = limits.validate()?;
        let zone = self
            .zones
            .get_mut(usize::from(limits.zone))
            .filter(|_| usize::from(limits.zone) == index)
            .ok_or(ConfigError::UnknownZone(limits.zone))?;
        zone.apply_limits(&limits);
        Ok(())
    }

    /// Clears the thermal shutdown state without touching the AP.
    pub fn clear_shutdown(&mut self) {
        self.in_shutdown = false;
    }

    fn read_zones<S: TemperatureSensors, const N: usize>(
        &mut self,
        sensors: &mut S,
        telemetry: &mut TelemetryRecorder<N>,
        now: Instant,
    ) -> [Option<i16>; MAX_ZONES] {
        let mut readings = [None; MAX_ZONES];
        for (zone, reading) in self.zones.iter_mut().zip(readings.iter_mut()) {
            if !zone.is_cooling() {
                continue;
            }
            let sensor = zone.definition().sensor;
            match sensors.read_kelvin(sensor) {
                Ok(kelvin) => *reading = Some(kelvin_to_celsius(kelvin)),
                Err(_) => {
                    telemetry.note(TelemetryEventKind::SensorReadFailed(sensor), now);
                }
            }
            zone.observe(*reading);
        }
        readings
    }

    /// Runs one control tick.
    pub fn tick<S: TemperatureSensors, const N: usize>(
        &mut self,
        sensors: &mut S,
        inputs: ThermalInputs,
        telemetry: &mut TelemetryRecorder<N>,
        now: Instant,
    ) -> ThermalTick {
        let readings = self.read_zones(sensors, telemetry, now);

        if !self.in_shutdown && !inputs.chipset_hard_off {
            let critical = self.zones.iter().zip(readings).position(|(zone, reading)| {
                zone.is_cooling()
                    && reading.is_some_and(|celsius| celsius >= zone.definition().thresholds.critical)
            });
            if let Some(index) = critical {
                self.in_shutdown = true;
                telemetry.record(
                    TelemetryEventKind::ThermalCritical(zone_number(index)),
                    TelemetryPayload::Temperature(readings[index].unwrap_or_default()),
                    now,
                );
                let demand = inputs.control_enabled.then(|| {
                    self.aggregate = 100;
                    100
                });
                return ThermalTick {
                    demand,
                    critical: Some(index),
                    recovery: None,
                };
            }
        }

        let demand = if inputs.control_enabled {
            Some(self.update_demand(&readings, telemetry, now))
        } else {
            None
        };

        ThermalTick {
            demand,
            critical: None,
            recovery: self.check_recovery(&readings, inputs, telemetry, now),
        }
    }

    fn update_demand<const N: usize>(
        &mut self,
        readings: &[Option<i16>; MAX_ZONES],
        telemetry: &mut TelemetryRecorder<N>,
        now: Instant,
    ) -> u8 {
        let limits = self.config.pid;
        for (index, (zone, reading)) in self.zones.iter_mut().zip(readings).enumerate() {
            if !zone.is_cooling() {
                continue;
            }
            let (_, latched) = zone.update(*reading, &limits);
            if latched {
                telemetry.record(
                    TelemetryEventKind::ThermalWarning(zone_number(index)),
                    TelemetryPayload::Temperature(reading.unwrap_or_default()),
                    now,
                );
            }
        }

        self.aggregate = self.aggregate();
        self.aggregate
    }

    fn aggregate(&self) -> u8 {
        let cooling = self.zones.iter().filter(|zone| zone.is_cooling());
        if cooling.clone().any(|zone| zone.requirement() >= 100) {
            return 100;
        }
        let weighted: u32 = cooling
            .map(|zone| u32::from(zone.definition().weight) * u32::from(zone.requirement()))
            .sum();
        u8::try_from((weighted / self.total_weight()).min(100)).unwrap_or(100)
    }

    fn check_recovery<const N: usize>(
        &mut self,
        readings: &[Option<i16>; MAX_ZONES],
        inputs: ThermalInputs,
        telemetry: &mut TelemetryRecorder<N>,
        now: Instant,
    ) -> Option<ThermalRecovery> {
        if !self.in_shutdown {
            return None;
        }
        let cool = self.zones.iter().zip(readings).all(|(zone, reading)| {
            !zone.is_cooling()
                || reading.is_some_and(|celsius| celsius < zone.definition().thresholds.warning)
        });
        if !cool {
            return None;
        }

        let recovery = if inputs.chipset_on {
            ThermalRecovery::Resumed
        } else if inputs.recovery_allowed {
            ThermalRecovery::RestartAp
        } else {
            return None;
        };
        self.in_shutdown = false;
        telemetry.note(TelemetryEventKind::ThermalRecovered, now);
        Some(recovery)
    }
}
