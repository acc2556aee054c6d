//! Power rail registry and sequencing data.
//!
//! A board describes every controllable rail once, in a static table of
//! [`Supply`] entries. Rails form a forest: each rail names its parent, and
//! roots name themselves. Sequences reference rails by [`SupplyId`] so the
//! same table backs the statically defined transition groups and the
//! sequences loaded from persisted configuration.

use core::fmt;
use core::time::Duration;

use heapless::Vec;

use crate::hal::{AnalogChannel, SignalId};

pub mod supervisor;

pub use supervisor::{SupervisorConfig, SupplyError, SupplySupervisor};

/// Upper bound on rails in one registry.
pub const MAX_SUPPLIES: usize = 48;

/// Upper bound on steps in one sequence.
pub const MAX_SEQUENCE_STEPS: usize = 24;

/// Index of a rail within its registry.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SupplyId(pub u8);

impl SupplyId {
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for SupplyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "supply#{}", self.0)
    }
}

/// Enable line of a rail and its polarity.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct EnableControl {
    pub signal: SignalId,
    pub active_low: bool,
}

impl EnableControl {
    #[must_use]
    pub const fn active_high(signal: SignalId) -> Self {
        Self {
            signal,
            active_low: false,
        }
    }

    #[must_use]
    pub const fn active_low(signal: SignalId) -> Self {
        Self {
            signal,
            active_low: true,
        }
    }

    /// Electrical level that realises the logical `on` request.
    #[must_use]
    pub const fn level_for(self, on: bool) -> bool {
        on != self.active_low
    }
}

/// How the supervisor confirms a rail is healthy.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Feedback {
    /// Nothing to check; an enabled rail is assumed good.
    None,
    /// Good while the sampled voltage is at least `min_mv`.
    Analog { channel: AnalogChannel, min_mv: u16 },
    /// Good while the power-good line reads high.
    PowerGood(SignalId),
}

/// Static description of one rail.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Supply {
    pub name: &'static str,
    pub parent: SupplyId,
    pub enable: EnableControl,
    pub feedback: Feedback,
}

impl Supply {
    #[must_use]
    pub const fn new(
        name: &'static str,
        parent: SupplyId,
        enable: EnableControl,
        feedback: Feedback,
    ) -> Self {
        Self {
            name,
            parent,
            enable,
            feedback,
        }
    }

    /// Returns `true` when the rail is its own parent.
    #[must_use]
    pub fn is_root(&self, id: SupplyId) -> bool {
        self.parent == id
    }
}

/// Bookkeeping state the supervisor keeps for each rail.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SupplyState {
    Off,
    TurningOn,
    On,
    Fault,
    TurnOnFailed,
    PgTimeout,
}

impl SupplyState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            SupplyState::Off => "off",
            SupplyState::TurningOn => "turning on",
            SupplyState::On => "on",
            SupplyState::Fault => "fault",
            SupplyState::TurnOnFailed => "turn on failed",
            SupplyState::PgTimeout => "timeout",
        }
    }
}

impl fmt::Display for SupplyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Live health of a rail as read from the hardware.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SupplyStatus {
    Off,
    On,
    Fault,
}

impl fmt::Display for SupplyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SupplyStatus::Off => "off",
            SupplyStatus::On => "on",
            SupplyStatus::Fault => "fault",
        })
    }
}

/// One sequencing step: enable `supply`, then wait `delay` before checking it.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SequenceStep {
    pub supply: SupplyId,
    pub delay: Duration,
}

impl SequenceStep {
    #[must_use]
    pub const fn new(supply: SupplyId, delay_ms: u64) -> Self {
        Self {
            supply,
            delay: Duration::from_millis(delay_ms),
        }
    }
}

/// Ordered group of rails brought up together.
pub type Sequence = Vec<SequenceStep, MAX_SEQUENCE_STEPS>;

/// Builds a [`Sequence`] from a static step list, failing when it does not fit.
///
/// # Errors
///
/// Returns [`SupplyError::SequenceTooLong`] when `steps` exceeds
/// [`MAX_SEQUENCE_STEPS`].
pub fn sequence_from(steps: &[SequenceStep]) -> Result<Sequence, SupplyError> {
    Vec::from_slice(steps).map_err(|_| SupplyError::SequenceTooLong)
}

/// Returns how many parents separate `id` from its root.
#[must_use]
pub fn depth(table: &[Supply], id: SupplyId) -> usize {
    let mut depth = 0;
    let mut current = id;
    while let Some(supply) = table.get(current.index()) {
        if supply.parent == current || depth >= table.len() {
            break;
        }
        depth += 1;
        current = supply.parent;
    }
    depth
}

/// Orders the registry parents-first, depth-first from each root.
#[must_use]
pub fn dependency_order(table: &[Supply]) -> Vec<(SupplyId, usize), MAX_SUPPLIES> {
    let mut ordered: Vec<(SupplyId, usize), MAX_SUPPLIES> = Vec::new();
    let mut stack: Vec<SupplyId, MAX_SUPPLIES> = Vec::new();

    for (index, supply) in table.iter().enumerate().rev() {
        let Ok(raw) = u8::try_from(index) else {
            continue;
        };
        if supply.is_root(SupplyId(raw)) {
            let _ = stack.push(SupplyId(raw));
        }
    }

    while let Some(id) = stack.pop() {
        if ordered.iter().any(|(seen, _)| *seen == id) {
            continue;
        }
        if ordered.push((id, depth(table, id))).is_err() {
            break;
        }
        for (index, supply) in table.iter().enumerate().rev() {
            let Ok(raw) = u8::try_from(index) else {
                continue;
            };
            let child = SupplyId(raw);
            if supply.parent == id && child != id {
                let _ = stack.push(child);
            }
        }
    }

    ordered
}
