//! Telemetry event catalog and the in-memory ring that records it.
//!
//! Every component reports noteworthy events (rail faults, power
//! transitions, sensor failures, fan trouble, rejected configuration) through
//! a [`TelemetryRecorder`] passed in by the caller. The ring keeps the most
//! recent history for the status surface; with the `defmt` feature enabled
//! each record is also mirrored to the `defmt` logger at a level matching its
//! [`Severity`].

use core::fmt;

use heapless::HistoryBuf;

use crate::config::persisted::ConfigTag;
use crate::hal::{FanId, SensorId};
use crate::power::{PowerState, ResetReason, ShutdownReason};
use crate::supply::{SupplyId, SupplyState};
use crate::time::Instant;

/// Monotonic identifier assigned to each record.
pub type EventId = u32;

/// Total number of telemetry entries retained in memory.
pub const TELEMETRY_RING_CAPACITY: usize = 64;

/// Discriminated telemetry events shared across all controller targets.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TelemetryEventKind {
    SupplyOn(SupplyId),
    SupplyOff(SupplyId),
    SupplyFailed(SupplyId),
    SupplyFault(SupplyId),
    SupplyParentOff(SupplyId),
    SequenceFailed(SupplyId),
    PowerTransition(PowerState),
    ForcedShutdown(ShutdownReason),
    ChipsetReset(ResetReason),
    SensorReadFailed(SensorId),
    ThermalWarning(u8),
    ThermalCritical(u8),
    ThermalRecovered,
    /// No cooling zone carries weight; aggregation divides by one.
    CoolingWeightZero,
    FanStalled(FanId),
    FanFrustrated(FanId),
    ConfigRejected(ConfigTag),
    ConfigDefaulted(ConfigTag),
}

impl TelemetryEventKind {
    /// Log level the event is mirrored at.
    #[must_use]
    pub const fn severity(self) -> Severity {
        match self {
            TelemetryEventKind::SupplyOn(_)
            | TelemetryEventKind::SupplyOff(_)
            | TelemetryEventKind::PowerTransition(_)
            | TelemetryEventKind::ThermalRecovered
            | TelemetryEventKind::ConfigDefaulted(_) => Severity::Info,
            TelemetryEventKind::SupplyParentOff(_)
            | TelemetryEventKind::SensorReadFailed(_)
            | TelemetryEventKind::ThermalWarning(_)
            | TelemetryEventKind::CoolingWeightZero
            | TelemetryEventKind::FanFrustrated(_)
            | TelemetryEventKind::ConfigRejected(_)
            | TelemetryEventKind::ChipsetReset(_) => Severity::Warn,
            TelemetryEventKind::SupplyFailed(_)
            | TelemetryEventKind::SupplyFault(_)
            | TelemetryEventKind::SequenceFailed(_)
            | TelemetryEventKind::ForcedShutdown(_)
            | TelemetryEventKind::ThermalCritical(_)
            | TelemetryEventKind::FanStalled(_) => Severity::Error,
        }
    }
}

impl fmt::Display for TelemetryEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TelemetryEventKind::SupplyOn(id) => write!(f, "supply-on {id}"),
            TelemetryEventKind::SupplyOff(id) => write!(f, "supply-off {id}"),
            TelemetryEventKind::SupplyFailed(id) => write!(f, "supply-failed {id}"),
            TelemetryEventKind::SupplyFault(id) => write!(f, "supply-fault {id}"),
            TelemetryEventKind::SupplyParentOff(id) => write!(f, "supply-parent-off {id}"),
            TelemetryEventKind::SequenceFailed(id) => write!(f, "sequence-failed at {id}"),
            TelemetryEventKind::PowerTransition(state) => write!(f, "power {state}"),
            TelemetryEventKind::ForcedShutdown(reason) => write!(f, "forced-shutdown {reason}"),
            TelemetryEventKind::ChipsetReset(reason) => write!(f, "chipset-reset {reason}"),
            TelemetryEventKind::SensorReadFailed(sensor) => {
                write!(f, "sensor-read-failed sensor{}", sensor.0)
            }
            TelemetryEventKind::ThermalWarning(zone) => write!(f, "thermal-warning zone{zone}"),
            TelemetryEventKind::ThermalCritical(zone) => write!(f, "thermal-critical zone{zone}"),
            TelemetryEventKind::ThermalRecovered => f.write_str("thermal-recovered"),
            TelemetryEventKind::CoolingWeightZero => f.write_str("cooling-weight-zero"),
            TelemetryEventKind::FanStalled(fan) => write!(f, "fan-stalled {fan}"),
            TelemetryEventKind::FanFrustrated(fan) => write!(f, "fan-frustrated {fan}"),
            TelemetryEventKind::ConfigRejected(tag) => write!(f, "config-rejected {tag:?}"),
            TelemetryEventKind::ConfigDefaulted(tag) => write!(f, "config-defaulted {tag:?}"),
        }
    }
}

/// Importance of a telemetry event.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Severity {
    Info,
    Warn,
    Error,
}

/// Payloads carried alongside telemetry events.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TelemetryPayload {
    /// No additional metadata accompanies the event.
    None,
    /// Rail bookkeeping state after the event and the last sampled voltage.
    Supply {
        state: SupplyState,
        millivolts: Option<u16>,
    },
    /// Power state change.
    Transition { from: PowerState, to: PowerState },
    /// Zone temperature in degrees Celsius.
    Temperature(i16),
    /// Fan operating point.
    Fan { duty: u8, rpm: u32 },
}

impl TelemetryPayload {
    /// Convenience constructor when no payload data is needed.
    #[must_use]
    pub const fn none() -> Self {
        TelemetryPayload::None
    }
}

/// Telemetry record stored in the ring buffer.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TelemetryRecord {
    pub id: EventId,
    pub timestamp: Instant,
    pub event: TelemetryEventKind,
    pub details: TelemetryPayload,
}

impl fmt::Display for TelemetryRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] #{} {}", self.timestamp, self.id, self.event)
    }
}

/// Records telemetry events into a fixed-size ring buffer.
pub struct TelemetryRecorder<const CAPACITY: usize = TELEMETRY_RING_CAPACITY> {
    ring: HistoryBuf<TelemetryRecord, CAPACITY>,
    next_event_id: EventId,
}

impl<const CAPACITY: usize> TelemetryRecorder<CAPACITY> {
    /// Creates a new telemetry recorder with an empty history.
    #[must_use]
    pub fn new() -> Self {
        Self {
            ring: HistoryBuf::new(),
            next_event_id: 0,
        }
    }

    /// Returns an iterator over the recorded telemetry in chronological order.
    pub fn oldest_first(&self) -> impl Iterator<Item = &TelemetryRecord> + '_ {
        self.ring.oldest_ordered()
    }

    /// Returns the most recent telemetry record, if available.
    #[must_use]
    pub fn latest(&self) -> Option<&TelemetryRecord> {
        self.ring.recent()
    }

    /// Returns the number of records currently stored.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ring.len()
    }

    /// Returns `true` when no telemetry records are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    /// Returns `true` when any retained record matches `event`.
    #[must_use]
    pub fn contains(&self, event: TelemetryEventKind) -> bool {
        self.ring.oldest_ordered().any(|record| record.event == event)
    }

    /// Records an arbitrary telemetry event with the supplied payload.
    pub fn record(
        &mut self,
        event: TelemetryEventKind,
        payload: TelemetryPayload,
        timestamp: Instant,
    ) -> EventId {
        let id = self.next_event_id;
        self.next_event_id = self.next_event_id.wrapping_add(1);

        let record = TelemetryRecord {
            id,
            timestamp,
            event,
            details: payload,
        };
        mirror(&record);
        self.ring.write(record);

        id
    }

    /// Records an event without a payload.
    pub fn note(&mut self, event: TelemetryEventKind, timestamp: Instant) -> EventId {
        self.record(event, TelemetryPayload::none(), timestamp)
    }

    /// Records a power state change.
    pub fn record_transition(
        &mut self,
        from: PowerState,
        to: PowerState,
        timestamp: Instant,
    ) -> EventId {
        self.record(
            TelemetryEventKind::PowerTransition(to),
            TelemetryPayload::Transition { from, to },
            timestamp,
        )
    }
}

impl<const CAPACITY: usize> Default for TelemetryRecorder<CAPACITY> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "defmt")]
fn mirror(record: &TelemetryRecord) {
    match record.event.severity() {
        Severity::Info => defmt::info!("{} {}", record.event, record.details),
        Severity::Warn => defmt::warn!("{} {}", record.event, record.details),
        Severity::Error => defmt::error!("{} {}", record.event, record.details),
    }
}

#[cfg(not(feature = "defmt"))]
fn mirror(_: &TelemetryRecord) {}
