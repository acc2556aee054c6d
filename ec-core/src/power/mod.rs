//! System power states and the plan of rail groups each transition drives.

use core::fmt;
use core::time::Duration;

use heapless::Vec;

use crate::hal::SignalId;
use crate::supply::Sequence;

pub mod machine;

pub use machine::{PowerStateMachine, ResetFlags};

/// Upper bound on secondary rail groups brought up in S3.
pub const MAX_SECONDARY_GROUPS: usize = 6;

/// ACPI-style system power state, including the transition pseudo-states.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PowerState {
    /// Mechanical off.
    G3,
    /// Soft off.
    S5,
    /// Suspended; AP held in reset.
    S3,
    /// Fully on.
    S0,
    G3S5,
    S5S3,
    S3S0,
    S0S3,
    S3S5,
    S5G3,
}

impl PowerState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            PowerState::G3 => "G3",
            PowerState::S5 => "S5",
            PowerState::S3 => "S3",
            PowerState::S0 => "S0",
            PowerState::G3S5 => "G3->S5",
            PowerState::S5S3 => "S5->S3",
            PowerState::S3S0 => "S3->S0",
            PowerState::S0S3 => "S0->S3",
            PowerState::S3S5 => "S3->S5",
            PowerState::S5G3 => "S5->G3",
        }
    }

    /// Returns `true` for G3, S5 and the transitions between them.
    #[must_use]
    pub const fn is_any_off(self) -> bool {
        matches!(
            self,
            PowerState::G3 | PowerState::S5 | PowerState::G3S5 | PowerState::S5G3
        )
    }

    /// Returns `true` for the pseudo-states between stable states.
    #[must_use]
    pub const fn is_transition(self) -> bool {
        !matches!(
            self,
            PowerState::G3 | PowerState::S5 | PowerState::S3 | PowerState::S0
        )
    }
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why the AP was forced off.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ShutdownReason {
    PowerButton,
    SupplyFault,
    SequenceFailure,
    PowerGoodLost,
    Thermal,
    Host,
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Why the AP was reset.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ResetReason {
    ResetButton,
    Watchdog,
    Host,
}

impl fmt::Display for ResetReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Rail groups and signals the state machine drives.
#[derive(Clone, Debug)]
pub struct PowerPlan {
    /// Rails brought up in S5->S3.
    pub primary: Sequence,
    /// Rails brought up in S3, in group order.
    pub secondary: Vec<Sequence, MAX_SECONDARY_GROUPS>,
    /// Daughterboard rails loaded from configuration; `None` disables them.
    pub daughterboard: Option<Sequence>,
    /// Signal the AP raises once it runs.
    pub ap_alive: Option<SignalId>,
}

impl PowerPlan {
    #[must_use]
    pub fn new(primary: Sequence) -> Self {
        Self {
            primary,
            secondary: Vec::new(),
            daughterboard: None,
            ap_alive: None,
        }
    }

    /// Every group raised in S3, in power-up order.
    pub fn upper_groups(&self) -> impl DoubleEndedIterator<Item = &Sequence> + '_ {
        self.secondary.iter().chain(self.daughterboard.iter())
    }
}

/// Timing used by the state machine and the button handlers.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PowerTimings {
    /// First wait for the AP to report power good in S3->S0.
    pub ap_first_timeout: Duration,
    /// Window in which S0 re-confirms power good.
    pub ap_debounce: Duration,
    /// AP reset pulse width.
    pub reset_pulse: Duration,
    /// Power-good timeout for each rail raised in S3.
    pub s3_rail_timeout: Duration,
    /// Power button hold time that forces a shutdown.
    pub forced_shutdown_hold: Duration,
    /// Reset button hold time before the AP is reset.
    pub reset_button_delay: Duration,
    /// Delay between a watchdog expiry and the AP reset.
    pub watchdog_reset_delay: Duration,
    /// Interval between signal polls.
    pub poll_interval: Duration,
}

impl PowerTimings {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            ap_first_timeout: Duration::from_secs(1),
            ap_debounce: Duration::from_secs(1),
            reset_pulse: Duration::from_millis(1),
            s3_rail_timeout: Duration::from_millis(100),
            forced_shutdown_hold: Duration::from_secs(8),
            reset_button_delay: Duration::from_millis(50),
            watchdog_reset_delay: Duration::from_millis(10),
            poll_interval: Duration::from_millis(1),
        }
    }
}

impl Default for PowerTimings {
    fn default() -> Self {
        Self::new()
    }
}
