//! Shared status surface for operator diagnostics.
//!
//! [`crate::orchestrator::Orchestrator::snapshot`] captures a
//! [`StatusSnapshot`]; [`StatusFormatter`] keeps the textual rendering
//! identical between the firmware log and the emulator console.

use core::fmt;

use heapless::Vec;

use crate::fan::{FanMode, FanSnapshot, MAX_FANS};
use crate::power::{PowerState, ResetReason, ShutdownReason};
use crate::thermal::MAX_ZONES;

/// One zone as shown by the status surface.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ZoneSnapshot {
    pub index: usize,
    pub name: &'static str,
    pub cooling: bool,
    pub celsius: Option<i16>,
    pub requirement: u8,
    pub tending_to_critical: bool,
}

/// Point-in-time view of the whole controller.
#[derive(Clone, Debug, PartialEq, Eq)]
#[allow(clippy::struct_excessive_bools)]
pub struct StatusSnapshot {
    pub power: PowerState,
    pub forcing_shutdown: bool,
    pub last_shutdown: Option<ShutdownReason>,
    pub last_reset: Option<ResetReason>,
    pub supplies_on: usize,
    pub supplies_off: usize,
    pub supplies_fault: usize,
    pub thermal_shutdown: bool,
    pub thermal_control: bool,
    /// Aggregate cooling demand in percent.
    pub demand: u8,
    pub zones: Vec<ZoneSnapshot, MAX_ZONES>,
    pub fans: Vec<FanSnapshot, MAX_FANS>,
    /// Records currently held by the telemetry ring.
    pub events: usize,
}

impl StatusSnapshot {
    /// Builds an empty snapshot for `power`.
    #[must_use]
    pub const fn new(power: PowerState) -> Self {
        Self {
            power,
            forcing_shutdown: false,
            last_shutdown: None,
            last_reset: None,
            supplies_on: 0,
            supplies_off: 0,
            supplies_fault: 0,
            thermal_shutdown: false,
            thermal_control: true,
            demand: 0,
            zones: Vec::new(),
            fans: Vec::new(),
            events: 0,
        }
    }
}

fn yes_no(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}

/// Renders a [`StatusSnapshot`] into human-readable lines.
#[derive(Clone, Copy, Debug)]
pub struct StatusFormatter<'a> {
    snapshot: &'a StatusSnapshot,
}

impl<'a> StatusFormatter<'a> {
    #[must_use]
    pub const fn new(snapshot: &'a StatusSnapshot) -> Self {
        Self { snapshot }
    }

    /// Writes the power line (e.g. `power state=S0 forcing=no last-shutdown=none last-reset=none`).
    pub fn write_power_line<W: fmt::Write>(&self, writer: &mut W) -> fmt::Result {
        write!(
            writer,
            "power state={} forcing={}",
            self.snapshot.power,
            yes_no(self.snapshot.forcing_shutdown)
        )?;
        writer.write_str(" last-shutdown=")?;
        match self.snapshot.last_shutdown {
            Some(reason) => write!(writer, "{reason}")?,
            None => writer.write_str("none")?,
        }
        writer.write_str(" last-reset=")?;
        match self.snapshot.last_reset {
            Some(reason) => write!(writer, "{reason}"),
            None => writer.write_str("none"),
        }
    }

    /// Writes the supply summary line (e.g. `supply on=5 off=1 fault=0`).
    pub fn write_supply_line<W: fmt::Write>(&self, writer: &mut W) -> fmt::Result {
        write!(
            writer,
            "supply on={} off={} fault={}",
            self.snapshot.supplies_on, self.snapshot.supplies_off, self.snapshot.supplies_fault
        )
    }

    /// Writes the thermal summary line (e.g. `thermal demand=35% control=yes shutdown=no`).
    pub fn write_thermal_line<W: fmt::Write>(&self, writer: &mut W) -> fmt::Result {
        write!(
            writer,
            "thermal demand={}% control={} shutdown={}",
            self.snapshot.demand,
            yes_no(self.snapshot.thermal_control),
            yes_no(self.snapshot.thermal_shutdown)
        )
    }

    /// Writes one line per cooling zone.
    pub fn write_zone_lines<W: fmt::Write>(&self, writer: &mut W) -> fmt::Result {
        for zone in self.snapshot.zones.iter().filter(|zone| zone.cooling) {
            write!(writer, "zone {} {} temp=", zone.index, zone.name)?;
            match zone.celsius {
                Some(celsius) => write!(writer, "{celsius}C")?,
                None => writer.write_str("unknown")?,
            }
            writeln!(
                writer,
                " demand={}% critical-latch={}",
                zone.requirement,
                yes_no(zone.tending_to_critical)
            )?;
        }
        Ok(())
    }

    /// Writes one line per fan (e.g. `fan fan0 enabled=yes mode=rpm duty=41% target=9600 rpm=9600 status=locked`).
    pub fn write_fan_lines<W: fmt::Write>(&self, writer: &mut W) -> fmt::Result {
        for fan in &self.snapshot.fans {
            writeln!(
                writer,
                "fan {} enabled={} mode={} duty={}% target={} rpm={} status={}",
                fan.fan,
                yes_no(fan.enabled),
                match fan.mode {
                    FanMode::Manual => "manual",
                    FanMode::Rpm => "rpm",
                },
                fan.duty,
                fan.target_rpm,
                fan.rpm,
                fan.status
            )?;
        }
        Ok(())
    }

    /// Writes every line, newline terminated.
    pub fn write_all<W: fmt::Write>(&self, writer: &mut W) -> fmt::Result {
        self.write_power_line(writer)?;
        writer.write_char('\n')?;
        self.write_supply_line(writer)?;
        writer.write_char('\n')?;
        self.write_thermal_line(writer)?;
        writer.write_char('\n')?;
        self.write_zone_lines(writer)?;
        self.write_fan_lines(writer)
    }
}
