//! Reference carrier board: one AP, a standby domain, two S3 groups, a
//! daughterboard slot and two fans.
//!
//! The AP rails form one tree rooted at the 12 V input, with the standby
//! rail feeding everything the AP needs. The fan rail is a root of its own
//! so the fans can be driven after the AP rails are down.

use crate::config::persisted::DB_SUPPLY_COUNT;
use crate::hal::{AnalogChannel, SensorId, SignalId};
use crate::orchestrator::{BoardLayout, DaughterboardRails};
use crate::power::PowerPlan;
use crate::supply::{
    EnableControl, Feedback, Sequence, SequenceStep, SupplyError, Supply, SupplyId, sequence_from,
};
use crate::thermal::{ZoneDefinition, ZoneThresholds};

/// Signal numbering used by the reference board.
pub mod signals {
    use crate::hal::SignalId;

    pub const VIN_EN: SignalId = SignalId(0);
    pub const STBY_EN: SignalId = SignalId(1);
    pub const STBY_PG: SignalId = SignalId(2);
    pub const IO_1V8_EN: SignalId = SignalId(3);
    pub const CORE_EN: SignalId = SignalId(4);
    pub const CORE_PG: SignalId = SignalId(5);
    pub const DDR_EN: SignalId = SignalId(6);
    pub const DDR_PG: SignalId = SignalId(7);
    pub const FAN_EN: SignalId = SignalId(8);
    pub const FAN_PG: SignalId = SignalId(9);
    /// Raised by the AP once its own rails are up.
    pub const AP_ALIVE: SignalId = SignalId(10);
    /// First enable line of the daughterboard connector.
    pub const DB_EN_BASE: u16 = 16;
}

/// Input rail voltage monitor.
pub const VIN_SENSE: AnalogChannel = AnalogChannel(0);

pub const VIN: SupplyId = SupplyId(0);
pub const STBY_3V3: SupplyId = SupplyId(1);
pub const IO_1V8: SupplyId = SupplyId(2);
pub const CORE_0V85: SupplyId = SupplyId(3);
pub const DDR_1V1: SupplyId = SupplyId(4);
pub const FAN_12V: SupplyId = SupplyId(5);
/// First daughterboard rail; the slot's rails follow in mask-bit order.
pub const DB_FIRST: u8 = 6;

/// Daughterboard slot holding the RF front end.
pub const DB_SLOT: u8 = 0;

/// Number of fans fitted.
pub const FAN_COUNT: usize = 2;

const fn db_rail(name: &'static str, bit: u16) -> Supply {
    Supply::new(
        name,
        STBY_3V3,
        EnableControl::active_high(SignalId(signals::DB_EN_BASE + bit)),
        Feedback::None,
    )
}

/// Rail table, indexed by [`SupplyId`].
pub static SUPPLIES: [Supply; 12] = [
    Supply::new(
        "12V",
        VIN,
        EnableControl::active_high(signals::VIN_EN),
        Feedback::Analog {
            channel: VIN_SENSE,
            min_mv: 11_000,
        },
    ),
    Supply::new(
        "3V3_STBY",
        VIN,
        EnableControl::active_high(signals::STBY_EN),
        Feedback::PowerGood(signals::STBY_PG),
    ),
    Supply::new(
        "1V8_IO",
        STBY_3V3,
        EnableControl::active_high(signals::IO_1V8_EN),
        Feedback::None,
    ),
    Supply::new(
        "0V85_CORE",
        STBY_3V3,
        EnableControl::active_high(signals::CORE_EN),
        Feedback::PowerGood(signals::CORE_PG),
    ),
    Supply::new(
        "1V1_DDR",
        CORE_0V85,
        EnableControl::active_high(signals::DDR_EN),
        Feedback::PowerGood(signals::DDR_PG),
    ),
    Supply::new(
        "12V_FAN",
        FAN_12V,
        EnableControl::active_high(signals::FAN_EN),
        Feedback::PowerGood(signals::FAN_PG),
    ),
    db_rail("DB_3V3", 0),
    db_rail("DB_1V8", 1),
    db_rail("DB_1V2", 2),
    db_rail("DB_0V9", 3),
    db_rail("DB_5V", 4),
    db_rail("DB_AUX", 5),
];

/// Rails raised in S5->S3.
pub const PRIMARY: [SequenceStep; 2] = [
    SequenceStep::new(VIN, 10),
    SequenceStep::new(STBY_3V3, 5),
];

/// AP core group, raised first in S3.
pub const CORE_GROUP: [SequenceStep; 2] = [
    SequenceStep::new(IO_1V8, 1),
    SequenceStep::new(CORE_0V85, 2),
];

/// Memory and fan group, raised after the core group.
pub const MEMORY_GROUP: [SequenceStep; 2] = [
    SequenceStep::new(DDR_1V1, 2),
    SequenceStep::new(FAN_12V, 0),
];

/// Zone temperatures in degrees Celsius.
pub static ZONES: [ZoneDefinition; 3] = [
    ZoneDefinition::new("ap", SensorId(0), ZoneThresholds::new(46, 75, 80, 85), 100, 1.6, 0.17),
    ZoneDefinition::new("board", SensorId(1), ZoneThresholds::new(55, 80, 85, 95), 40, 1.0, 0.1),
    ZoneDefinition::new("rf", SensorId(2), ZoneThresholds::new(60, 85, 90, 100), 60, 1.2, 0.1)
        .on_daughterboard(DB_SLOT),
];

/// Builds the static power plan.
///
/// # Errors
///
/// [`SupplyError::SequenceTooLong`] if a group outgrows a [`Sequence`].
pub fn plan() -> Result<PowerPlan, SupplyError> {
    let mut plan = PowerPlan::new(sequence_from(&PRIMARY)?);
    for group in [&CORE_GROUP[..], &MEMORY_GROUP[..]] {
        let sequence: Sequence = sequence_from(group)?;
        plan.secondary
            .push(sequence)
            .map_err(|_| SupplyError::SequenceTooLong)?;
    }
    plan.ap_alive = Some(signals::AP_ALIVE);
    Ok(plan)
}

fn daughterboard_rails() -> DaughterboardRails {
    let mut rails = [SupplyId(DB_FIRST); DB_SUPPLY_COUNT];
    for (offset, rail) in (0u8..).zip(rails.iter_mut()) {
        *rail = SupplyId(DB_FIRST + offset);
    }
    DaughterboardRails {
        slot: DB_SLOT,
        rails,
    }
}

/// Full layout of the reference board.
///
/// # Errors
///
/// See [`plan`].
pub fn layout() -> Result<BoardLayout<'static>, SupplyError> {
    Ok(BoardLayout {
        supplies: &SUPPLIES,
        plan: plan()?,
        zones: &ZONES,
        fan_supply: Some(FAN_12V),
        daughterboard: Some(daughterboard_rails()),
    })
}
